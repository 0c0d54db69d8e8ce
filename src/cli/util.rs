//! CLI Common Utilities
//!
//! Shared initialization and context management for CLI commands.
//! Eliminates duplicate code across command handlers.

use std::path::Path;
use std::sync::Arc;

use crate::config::{Config, ConfigLoader};
use crate::gateway::CompletionGateway;
use crate::storage::{Database, SharedDatabase};
use crate::types::Result;

/// Command execution context
///
/// Provides unified access to common resources needed by CLI commands.
/// Created via `CommandContext::load()`, which resolves configuration,
/// opens the database, and assembles the gateway.
#[derive(Clone)]
pub struct CommandContext {
    /// Loaded configuration
    pub config: Config,
    /// Shared database handle
    pub db: SharedDatabase,
    /// Assembled gateway
    pub gateway: CompletionGateway,
}

impl CommandContext {
    /// Load full command context.
    ///
    /// With `config_file` set, that file is the only configuration source;
    /// otherwise the full resolution chain applies (defaults, global,
    /// project, environment).
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let config = match config_file {
            Some(path) => ConfigLoader::load_from_file(path)?,
            None => ConfigLoader::load()?,
        };

        let db = open_database(&config)?;
        let gateway = CompletionGateway::from_config(&config, Arc::clone(&db))?;

        Ok(Self {
            config,
            db,
            gateway,
        })
    }
}

/// Open and initialize the gateway database at its configured path,
/// creating parent directories as needed.
pub fn open_database(config: &Config) -> Result<SharedDatabase> {
    let path = &config.general.database_path;
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let db = Database::open(path)?;
    db.initialize()?;
    Ok(Arc::new(db))
}
