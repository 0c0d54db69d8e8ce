//! Response Cache
//!
//! SQLite-backed cache of completed responses keyed by request fingerprint.
//! Entries expire lazily: a stale row is deleted the first time it is read
//! past its deadline, and a periodic sweep removes the rest. Hit counts are
//! incremented atomically in SQL so concurrent readers never lose updates.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rusqlite::params;

use crate::gateway::fingerprint::Fingerprint;
use crate::storage::SharedDatabase;
use crate::types::{Result, ResultExt, TokenUsage};

/// A cached completion, ready to serve without touching a provider.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub content: String,
    pub provider: String,
    pub model: String,
    pub usage: TokenUsage,
    /// When the entry was written (unix seconds)
    pub created_at: i64,
    /// Reads served from this entry, including this one
    pub hit_count: u64,
}

/// Aggregate cache statistics for status reporting.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Live (unexpired) entries
    pub entries: u64,
    /// Total hits recorded across live entries
    pub total_hits: u64,
    /// Bytes of cached response content
    pub size_bytes: u64,
    /// Oldest live entry (unix seconds)
    pub oldest_at: Option<i64>,
    /// Newest live entry (unix seconds)
    pub newest_at: Option<i64>,
    /// Hits observed by this process
    pub process_hits: u64,
    /// Misses observed by this process
    pub process_misses: u64,
    /// process_hits / (process_hits + process_misses), 0.0 when no lookups
    pub hit_rate: f64,
}

/// Fingerprint-keyed response cache with TTL expiry.
pub struct ResponseCache {
    db: SharedDatabase,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResponseCache {
    pub fn new(db: SharedDatabase, ttl: Duration) -> Self {
        Self {
            db,
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a response by fingerprint.
    ///
    /// An expired entry is deleted on the spot and reported as a miss.
    /// A live hit increments the entry's hit count before returning it.
    pub fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CachedResponse>> {
        let now = chrono::Utc::now().timestamp();
        let conn = self.db.connection()?;

        let mut stmt = conn
            .prepare(
                "SELECT content, provider, model, prompt_tokens, completion_tokens,
                        created_at, expires_at, hit_count
                 FROM response_cache WHERE fingerprint = ?1",
            )
            .with_context("Failed to prepare cache lookup")?;

        type CacheRow = (String, String, String, i64, i64, i64, i64, i64);
        let row: Option<CacheRow> = match stmt.query_row(params![fingerprint.as_str()], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
            ))
        }) {
            Ok(r) => Some(r),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e.into()),
        };

        let Some((content, provider, model, prompt, completion, created_at, expires_at, hits)) =
            row
        else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        if expires_at <= now {
            conn.execute(
                "DELETE FROM response_cache WHERE fingerprint = ?1",
                params![fingerprint.as_str()],
            )
            .with_context("Failed to evict expired cache entry")?;
            self.misses.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(fingerprint = %fingerprint, "Evicted expired cache entry");
            return Ok(None);
        }

        conn.execute(
            "UPDATE response_cache SET hit_count = hit_count + 1 WHERE fingerprint = ?1",
            params![fingerprint.as_str()],
        )
        .with_context("Failed to record cache hit")?;
        self.hits.fetch_add(1, Ordering::Relaxed);

        Ok(Some(CachedResponse {
            content,
            provider,
            model,
            usage: TokenUsage::new(prompt as u32, completion as u32),
            created_at,
            hit_count: (hits + 1) as u64,
        }))
    }

    /// Store a response under its fingerprint.
    ///
    /// Rewriting an existing entry refreshes its content and deadline but
    /// keeps the accumulated hit count.
    pub fn put(
        &self,
        fingerprint: &Fingerprint,
        provider: &str,
        model: &str,
        content: &str,
        usage: TokenUsage,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let expires_at = now + self.ttl.as_secs() as i64;

        self.db.execute(
            "INSERT INTO response_cache
             (fingerprint, provider, model, content, prompt_tokens, completion_tokens,
              created_at, expires_at, hit_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)
             ON CONFLICT(fingerprint) DO UPDATE SET
                provider = excluded.provider,
                model = excluded.model,
                content = excluded.content,
                prompt_tokens = excluded.prompt_tokens,
                completion_tokens = excluded.completion_tokens,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at",
            &[
                &fingerprint.as_str(),
                &provider,
                &model,
                &content,
                &(usage.prompt_tokens as i64),
                &(usage.completion_tokens as i64),
                &now,
                &expires_at,
            ],
        )?;

        Ok(())
    }

    /// Delete all expired entries. Returns the number removed.
    pub fn clean_expired(&self) -> Result<u64> {
        let now = chrono::Utc::now().timestamp();
        let removed = self.db.execute(
            "DELETE FROM response_cache WHERE expires_at <= ?1",
            &[&now],
        )?;
        Ok(removed as u64)
    }

    /// Delete every entry. Returns the number removed.
    pub fn clear(&self) -> Result<u64> {
        let removed = self.db.execute("DELETE FROM response_cache", &[])?;
        Ok(removed as u64)
    }

    /// Aggregate statistics over live entries plus this process's hit rate.
    pub fn stats(&self) -> Result<CacheStats> {
        let now = chrono::Utc::now().timestamp();
        let conn = self.db.connection()?;

        let mut stmt = conn
            .prepare(
                "SELECT COUNT(*),
                        COALESCE(SUM(hit_count), 0),
                        COALESCE(SUM(LENGTH(content)), 0),
                        MIN(created_at),
                        MAX(created_at)
                 FROM response_cache WHERE expires_at > ?1",
            )
            .with_context("Failed to prepare cache stats query")?;

        let (entries, total_hits, size_bytes, oldest_at, newest_at) = stmt
            .query_row(params![now], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                ))
            })
            .with_context("Failed to read cache stats")?;

        let process_hits = self.hits.load(Ordering::Relaxed);
        let process_misses = self.misses.load(Ordering::Relaxed);
        let lookups = process_hits + process_misses;
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            process_hits as f64 / lookups as f64
        };

        Ok(CacheStats {
            entries: entries as u64,
            total_hits: total_hits as u64,
            size_bytes: size_bytes as u64,
            oldest_at,
            newest_at,
            process_hits,
            process_misses,
            hit_rate,
        })
    }
}
