//! Global Constants
//!
//! Centralized constants for configuration and tuning.
//! All magic numbers should be defined here with documentation.

/// Request normalization constants
pub mod request {
    /// Temperature applied when the caller leaves it unset.
    ///
    /// Also the value folded into the request fingerprint, so requests with
    /// and without an explicit default temperature hash identically.
    pub const DEFAULT_TEMPERATURE: f64 = 0.0;

    /// Max output tokens applied when the caller leaves it unset
    pub const DEFAULT_MAX_TOKENS: u32 = 4096;
}

/// Response cache constants
pub mod cache {
    /// Cache entry time-to-live (hours)
    pub const DEFAULT_TTL_HOURS: u64 = 24;
}

/// Request deduplication constants
pub mod dedup {
    /// Safety-net timeout after which a pending entry is considered stuck
    /// and may be replaced by a fresh executor (seconds)
    pub const SAFETY_NET_SECS: u64 = 60;
}

/// Retry policy constants
pub mod retry {
    /// Default maximum attempts per provider (first try included)
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

    /// Base delay for exponential backoff (milliseconds)
    pub const BASE_DELAY_MS: u64 = 1_000;

    /// Maximum delay between attempts (seconds)
    pub const MAX_DELAY_SECS: u64 = 16;

    /// Per-attempt timeout (seconds)
    pub const ATTEMPT_TIMEOUT_SECS: u64 = 120;
}

/// Provider health constants
pub mod health {
    /// Rolling window over which success ratio and latency are aggregated (minutes)
    pub const WINDOW_MINUTES: u64 = 60;

    /// Health samples older than this are pruned (days)
    pub const RETENTION_DAYS: u64 = 7;

    /// Success ratio assumed for a provider with no samples in the window
    pub const NEUTRAL_SUCCESS_RATIO: f64 = 0.5;
}

/// Budget constants
pub mod budget {
    /// Warning threshold (fraction of the period limit)
    pub const ALERT_THRESHOLD: f64 = 0.80;

    /// Critical threshold (fraction of the period limit)
    pub const CRITICAL_THRESHOLD: f64 = 0.95;

    /// Window within which a repeated alert for the same status is suppressed (hours)
    pub const ALERT_DEDUP_HOURS: u64 = 24;

    /// Default per-user spend limits in USD
    pub const DEFAULT_DAILY_LIMIT_USD: f64 = 10.0;
    pub const DEFAULT_WEEKLY_LIMIT_USD: f64 = 50.0;
    pub const DEFAULT_MONTHLY_LIMIT_USD: f64 = 150.0;
}

/// HTTP/Network constants
pub mod network {
    /// Default provider request timeout (seconds)
    pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

    /// Connection timeout (seconds)
    pub const CONNECTION_TIMEOUT_SECS: u64 = 30;

    /// Cap on retry-after hints parsed from provider responses (seconds)
    pub const MAX_RETRY_AFTER_SECS: u64 = 300;
}
