//! Database Layer with Connection Pooling and Safe Transactions
//!
//! Production-ready SQLite database layer featuring:
//! - Connection pooling via r2d2 for concurrent access
//! - Panic-safe transactions with automatic rollback
//! - Version-tracked migrations
//! - WAL mode for optimal read/write performance

use std::path::Path;
use std::sync::Arc;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use crate::types::{LexgateError, Result, ResultExt};

/// Shared database handle for async contexts.
pub type SharedDatabase = Arc<Database>;

const SCHEMA: &str = include_str!("schema.sql");

/// Current schema version for migration tracking
const SCHEMA_VERSION: u32 = 2;

/// Migration definitions
struct Migration {
    version: u32,
    description: &'static str,
    up: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 2,
    description: "Add matter_ref column to usage_records",
    up: "ALTER TABLE usage_records ADD COLUMN matter_ref TEXT",
}];

/// Connection pool configuration
///
/// Pool size is dynamically calculated based on CPU cores for optimal performance.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections in the pool
    pub max_size: u32,
    /// Minimum idle connections to keep ready
    pub min_idle: u32,
    /// Timeout for acquiring a connection (seconds)
    pub connection_timeout_secs: u64,
}

impl PoolConfig {
    /// Minimum pool size regardless of CPU count
    const MIN_POOL_SIZE: u32 = 4;
    /// Maximum pool size regardless of CPU count
    const MAX_POOL_SIZE: u32 = 32;
    /// Multiplier for CPU cores to pool size
    const POOL_SIZE_MULTIPLIER: f32 = 2.0;

    /// Calculate optimal pool size based on available CPU cores
    ///
    /// Formula: clamp(cores * 2, MIN, MAX)
    /// This provides 2 connections per core with sensible bounds.
    pub fn optimal_pool_size() -> u32 {
        let cores = std::thread::available_parallelism()
            .map(|p| p.get() as u32)
            .unwrap_or(4);

        let calculated = (cores as f32 * Self::POOL_SIZE_MULTIPLIER) as u32;
        calculated.clamp(Self::MIN_POOL_SIZE, Self::MAX_POOL_SIZE)
    }

    /// Create config with automatic pool sizing based on CPU cores
    pub fn auto() -> Self {
        let max_size = Self::optimal_pool_size();
        Self {
            max_size,
            min_idle: (max_size / 4).max(2),
            connection_timeout_secs: 30,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::auto()
    }
}

/// Thread-safe database with connection pooling.
///
/// Uses r2d2 connection pool for concurrent access with automatic
/// connection management and health checking.
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

impl Database {
    /// Open database with connection pooling at the specified path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_config(path, PoolConfig::default())
    }

    /// Open database with custom pool configuration.
    pub fn open_with_config<P: AsRef<Path>>(path: P, config: PoolConfig) -> Result<Self> {
        let manager =
            SqliteConnectionManager::file(path.as_ref()).with_init(Self::configure_connection);

        let pool = Pool::builder()
            .max_size(config.max_size)
            .min_idle(Some(config.min_idle))
            .connection_timeout(std::time::Duration::from_secs(
                config.connection_timeout_secs,
            ))
            .build(manager)
            .map_err(|e| {
                LexgateError::Storage(format!("Failed to create connection pool: {}", e))
            })?;

        Ok(Self { pool })
    }

    /// Open an in-memory database for testing or temporary use.
    pub fn open_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory().with_init(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            Ok(())
        });

        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| LexgateError::Storage(format!("Failed to create in-memory pool: {}", e)))?;

        Ok(Self { pool })
    }

    /// Configure a new connection with production-ready settings.
    fn configure_connection(conn: &mut Connection) -> std::result::Result<(), rusqlite::Error> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA cache_size = -64000;
            PRAGMA busy_timeout = 5000;
            PRAGMA wal_autocheckpoint = 1000;
            "#,
        )?;
        Ok(())
    }

    /// Get a connection from the pool.
    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| {
            LexgateError::Storage(format!("Failed to acquire database connection: {}", e))
        })
    }

    /// Initialize database schema.
    pub fn initialize(&self) -> Result<()> {
        let conn = self.conn()?;

        let version: u32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);

        conn.execute_batch(SCHEMA)
            .with_context("Failed to initialize database schema")?;

        // A fresh database gets every column from schema.sql, so it starts
        // at the current version. An existing one keeps its version here
        // and upgrades through the migration list instead.
        if version == 0 {
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .with_context("Failed to set schema version")?;
        }

        drop(conn);
        self.migrate()?;
        Ok(())
    }

    /// Run version-tracked migrations.
    fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;

        let current_version: u32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);

        for migration in MIGRATIONS {
            if migration.version > current_version {
                conn.execute_batch(migration.up).with_context_fn(|| {
                    format!(
                        "Failed to apply migration {}: {}",
                        migration.version, migration.description
                    )
                })?;

                tracing::info!(
                    "Applied migration {}: {}",
                    migration.version,
                    migration.description
                );
            }
        }

        // Update schema version
        if current_version < SCHEMA_VERSION {
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .with_context("Failed to update schema version")?;
        }

        Ok(())
    }

    /// Get a raw connection for advanced operations.
    pub fn connection(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.conn()
    }

    /// Execute a single SQL statement.
    pub fn execute(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<usize> {
        let conn = self.conn()?;
        conn.execute(sql, params)
            .with_context("Failed to execute SQL")
    }

    /// Read a single optional value with a one-row query.
    pub fn query_value<T: rusqlite::types::FromSql>(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Option<T>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).with_context("Failed to prepare query")?;

        match stmt.query_row(params, |row| row.get::<_, T>(0)) {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Execute a function within a panic-safe database transaction.
    ///
    /// All operations within the closure are atomic. If the closure panics,
    /// the transaction is automatically rolled back and an error is returned
    /// instead of poisoning the connection pool.
    pub fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + std::panic::UnwindSafe,
    {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .with_context("Failed to start transaction")?;

        // Use catch_unwind for panic safety
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(&tx)));

        match result {
            Ok(Ok(value)) => {
                tx.commit().with_context("Failed to commit transaction")?;
                Ok(value)
            }
            Ok(Err(e)) => {
                // Transaction will be rolled back on drop
                Err(e)
            }
            Err(panic_payload) => {
                // Transaction will be rolled back on drop
                let panic_msg = panic_payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic_payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "Unknown panic".to_string());

                tracing::error!("Transaction panicked: {}", panic_msg);
                Err(LexgateError::Storage(format!(
                    "Transaction panicked: {}",
                    panic_msg
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_test_db() -> Database {
        let db = Database::open_in_memory().expect("Failed to open database");
        db.initialize().expect("Failed to initialize");
        db
    }

    #[test]
    fn test_initialize_creates_schema() {
        let db = open_test_db();

        let now = chrono::Utc::now().timestamp();
        db.execute(
            "INSERT INTO response_cache
             (fingerprint, provider, model, content, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            &[&"abc123", &"openai", &"gpt-4o", &"hello", &now, &(now + 60)],
        )
        .expect("Failed to insert cache row");

        let content: Option<String> = db
            .query_value(
                "SELECT content FROM response_cache WHERE fingerprint = ?1",
                &[&"abc123"],
            )
            .expect("Failed to query");
        assert_eq!(content.as_deref(), Some("hello"));
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let db = open_test_db();
        db.initialize().expect("Second initialize should succeed");

        let version: u32 = db
            .connection()
            .expect("conn")
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .expect("version");
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_migrate_upgrades_older_database() {
        let db = Database::open_in_memory().expect("Failed to open database");
        {
            let conn = db.connection().expect("conn");
            conn.execute_batch(
                "CREATE TABLE usage_records (
                    id                TEXT PRIMARY KEY,
                    user_id           TEXT NOT NULL,
                    provider          TEXT NOT NULL,
                    model             TEXT NOT NULL,
                    endpoint          TEXT NOT NULL,
                    prompt_tokens     INTEGER NOT NULL DEFAULT 0,
                    completion_tokens INTEGER NOT NULL DEFAULT 0,
                    total_tokens      INTEGER NOT NULL DEFAULT 0,
                    estimated_cost    REAL NOT NULL DEFAULT 0.0,
                    duration_ms       INTEGER NOT NULL DEFAULT 0,
                    status            TEXT NOT NULL,
                    error_message     TEXT,
                    created_at        INTEGER NOT NULL
                );",
            )
            .expect("create v1 table");
            conn.pragma_update(None, "user_version", 1u32)
                .expect("stamp v1");
        }

        db.initialize().expect("initialize");

        let version: u32 = db
            .connection()
            .expect("conn")
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .expect("version");
        assert_eq!(version, SCHEMA_VERSION);

        // The migration must add the column the v1 table lacked
        db.execute(
            "INSERT INTO usage_records
             (id, user_id, matter_ref, provider, model, endpoint, status, created_at)
             VALUES ('u1', 'alice', 'M-100', 'openai', 'gpt-4o', 'chat', 'success', 0)",
            &[],
        )
        .expect("insert with matter_ref");
    }

    #[test]
    fn test_query_value_no_rows() {
        let db = open_test_db();

        let missing: Option<String> = db
            .query_value(
                "SELECT content FROM response_cache WHERE fingerprint = ?1",
                &[&"nope"],
            )
            .expect("Failed to query");
        assert!(missing.is_none());
    }

    #[test]
    fn test_transaction_commits() {
        let db = open_test_db();
        let now = chrono::Utc::now().timestamp();

        db.transaction(|conn| {
            conn.execute(
                "INSERT INTO health_samples (provider, success, latency_ms, recorded_at)
                 VALUES (?1, 1, 42, ?2)",
                rusqlite::params!["openai", now],
            )?;
            Ok(())
        })
        .expect("Transaction should commit");

        let count: Option<i64> = db
            .query_value("SELECT COUNT(*) FROM health_samples", &[])
            .expect("count");
        assert_eq!(count, Some(1));
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = open_test_db();
        let now = chrono::Utc::now().timestamp();

        let result: Result<()> = db.transaction(|conn| {
            conn.execute(
                "INSERT INTO health_samples (provider, success, latency_ms, recorded_at)
                 VALUES (?1, 1, 42, ?2)",
                rusqlite::params!["openai", now],
            )?;
            Err(LexgateError::Storage("forced failure".to_string()))
        });
        assert!(result.is_err());

        let count: Option<i64> = db
            .query_value("SELECT COUNT(*) FROM health_samples", &[])
            .expect("count");
        assert_eq!(count, Some(0));
    }

    #[test]
    fn test_transaction_panic_safety() {
        let db = open_test_db();

        let result: Result<()> = db.transaction(|_conn| panic!("boom"));
        assert!(result.is_err());

        // Pool must still hand out working connections afterwards
        let count: Option<i64> = db
            .query_value("SELECT COUNT(*) FROM health_samples", &[])
            .expect("count");
        assert_eq!(count, Some(0));
    }

    #[test]
    fn test_pool_config_optimal_sizing() {
        // Optimal pool size should be within bounds
        let size = PoolConfig::optimal_pool_size();
        assert!(size >= PoolConfig::MIN_POOL_SIZE);
        assert!(size <= PoolConfig::MAX_POOL_SIZE);

        // Auto config should use optimal sizing
        let auto = PoolConfig::auto();
        assert_eq!(auto.max_size, size);
        assert!(auto.min_idle >= 2);
        assert!(auto.min_idle <= auto.max_size);
    }
}
