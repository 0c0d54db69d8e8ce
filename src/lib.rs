//! Lexgate - Reliability Gateway for AI Completions
//!
//! A single entry point for AI completion traffic in legal document
//! workflows. Lexgate sits between application code and hosted AI
//! providers and adds the operational behavior the providers leave to
//! their callers.
//!
//! ## Core Features
//!
//! - **Response Cache**: Fingerprinted responses persisted with TTL expiry
//! - **Request Coalescing**: Identical concurrent requests share one upstream call
//! - **Retry with Backoff**: Exponential backoff, jitter, rate-limit hints
//! - **Health-Ranked Failover**: Provider ordering from recent success rates
//! - **Usage Accounting**: Per-user cost tracking with budget enforcement
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use lexgate::{CompletionGateway, CompletionRequest, ConfigLoader, Database};
//!
//! let config = ConfigLoader::load()?;
//! let db = Arc::new(Database::open(&config.general.database_path)?);
//! db.initialize()?;
//!
//! let gateway = CompletionGateway::from_config(&config, db)?;
//! let response = gateway
//!     .complete(CompletionRequest::from_prompt("Summarize this clause"))
//!     .await?;
//! ```
//!
//! ## Modules
//!
//! - [`gateway`]: cache, dedup, retry, health, and the orchestrating façade
//! - [`provider`]: OpenAI and Anthropic HTTP clients behind one trait
//! - [`usage`]: cost estimation, usage log, budgets and alerts
//! - [`storage`]: SQLite persistence with connection pooling
//! - [`config`]: hierarchical configuration

pub mod cli;
pub mod config;
pub mod constants;
pub mod gateway;
pub mod provider;
pub mod storage;
pub mod types;
pub mod usage;

// =============================================================================
// Core Re-exports
// =============================================================================

// Configuration
pub use config::{Config, ConfigLoader};

// Error Types
pub use types::error::{ErrorCategory, LexgateError, ProviderError, Result, ResultExt};

// Request Types
pub use types::{CompletionRequest, Message, MessageRole, TokenUsage};

// Storage
pub use storage::database::PoolConfig;
pub use storage::{Database, SharedDatabase};

// =============================================================================
// Gateway Re-exports
// =============================================================================

pub use gateway::{
    CompletionGateway,
    Fingerprint,
    GatewayBuilder,
    GatewayResponse,
    // Components
    HealthMonitor,
    RequestCoalescer,
    ResponseCache,
    RetryPolicy,
    RouteMetadata,
};

// =============================================================================
// Provider Re-exports
// =============================================================================

pub use provider::{
    CompletionProvider, ProviderKind, ProviderSettings, SharedProvider, create_provider,
};

// =============================================================================
// Usage Re-exports
// =============================================================================

pub use usage::{
    BudgetLimits, BudgetPeriod, BudgetStatus, PriceBook, UsageSummary, UsageTracker,
};
