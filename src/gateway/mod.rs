//! Request reliability pipeline
//!
//! Everything between an accepted completion request and the provider that
//! answers it lives here:
//!
//! - [`fingerprint`]: canonical request identity for caching and coalescing
//! - [`cache`]: persistent response cache with TTL expiry
//! - [`dedup`]: in-flight coalescing of identical requests
//! - [`retry`]: per-provider retry with exponential backoff and jitter
//! - [`health`]: rolling provider health samples and failover ranking
//! - [`orchestrator`]: the gateway façade that composes the rest

pub mod cache;
pub mod dedup;
pub mod fingerprint;
pub mod health;
pub mod orchestrator;
pub mod retry;

pub use cache::{CacheStats, CachedResponse, ResponseCache};
pub use dedup::{CoalesceOutcome, RequestCoalescer};
pub use fingerprint::Fingerprint;
pub use health::{HealthMonitor, ProviderHealth};
pub use orchestrator::{CompletionGateway, GatewayBuilder, GatewayResponse, RouteMetadata};
pub use retry::{RetryOutcome, RetryPolicy};
