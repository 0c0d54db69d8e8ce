//! Unified Error Type System
//!
//! Centralized error types for the entire gateway.
//! Provides error classification for retry and failover decisions.
//!
//! ## Error Categories
//!
//! - **RateLimit**: API rate limiting (wait and retry)
//! - **Network**: Connectivity issues (retry with backoff)
//! - **Timeout**: Attempt exceeded its deadline (retry)
//! - **Upstream**: Temporary 5xx server issues (retry)
//! - **Unavailable**: Provider endpoint unavailable (failover to next)
//! - **Auth**: Authentication failures (don't retry, try next provider)
//! - **InvalidRequest**: Malformed request (fail fast, no failover)
//!
//! ## Design Principles
//!
//! - Single crate-wide error type (LexgateError) plus a cloneable,
//!   classified provider error for coalesced fan-out
//! - Category-based routing for retry and failover decisions
//! - No panic/unwrap - all errors are recoverable

use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Error Categories
// =============================================================================

/// Error categories for retry and failover routing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Rate limited - wait then retry same provider
    RateLimit,
    /// Network/connectivity issues - retry with backoff
    Network,
    /// Attempt timed out - retry with backoff
    Timeout,
    /// Temporary upstream server error (5xx) - retry same provider
    Upstream,
    /// Provider endpoint unavailable - failover to next
    Unavailable,
    /// Authentication failed - don't retry, failover to next provider
    Auth,
    /// Invalid request - don't retry, don't failover, fix request
    InvalidRequest,
    /// Internal gateway failure - failover conservatively
    Internal,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimit => write!(f, "RATE_LIMIT"),
            Self::Network => write!(f, "NETWORK"),
            Self::Timeout => write!(f, "TIMEOUT"),
            Self::Upstream => write!(f, "UPSTREAM"),
            Self::Unavailable => write!(f, "UNAVAILABLE"),
            Self::Auth => write!(f, "AUTH"),
            Self::InvalidRequest => write!(f, "INVALID_REQUEST"),
            Self::Internal => write!(f, "INTERNAL"),
        }
    }
}

impl ErrorCategory {
    /// Check if this category is retryable on the same provider
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimit | Self::Network | Self::Timeout | Self::Upstream
        )
    }

    /// Check if this category permits failover to the next provider.
    ///
    /// Only a malformed request is hopeless everywhere; every other failure
    /// is scoped to the provider that produced it.
    pub fn should_failover(&self) -> bool {
        !matches!(self, Self::InvalidRequest)
    }

    /// Get recommended wait before retrying this category
    pub fn recommended_delay(&self) -> Duration {
        match self {
            Self::RateLimit => Duration::from_secs(30),
            Self::Network => Duration::from_secs(5),
            Self::Upstream => Duration::from_secs(2),
            _ => Duration::from_millis(500),
        }
    }
}

// =============================================================================
// Provider Error
// =============================================================================

/// Classified provider error with category, context, and retry hints.
///
/// Cloneable so a single failed execution can be propagated to every
/// coalesced waiter.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderError {
    /// Error category for routing decisions
    pub category: ErrorCategory,
    /// Detailed error message
    pub message: String,
    /// Provider that produced the error
    pub provider: Option<String>,
    /// Server-provided wait before retrying (Retry-After), when one was sent
    pub retry_after: Option<Duration>,
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(provider) = &self.provider {
            write!(f, "[{}:{}] {}", provider, self.category, self.message)
        } else {
            write!(f, "[{}] {}", self.category, self.message)
        }
    }
}

impl std::error::Error for ProviderError {}

impl ProviderError {
    /// Create a new provider error
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            provider: None,
            retry_after: None,
        }
    }

    /// Create error with provider context
    pub fn with_provider(
        category: ErrorCategory,
        message: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            category,
            message: message.into(),
            provider: Some(provider.into()),
            retry_after: None,
        }
    }

    /// Add suggested retry delay
    pub fn retry_after(mut self, duration: Duration) -> Self {
        self.retry_after = Some(duration);
        self
    }

    /// Create a timeout error for an operation that exceeded its deadline
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::new(
            ErrorCategory::Timeout,
            format!("{} timed out after {:?}", operation.into(), duration),
        )
    }

    /// Create an invalid-request error
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::InvalidRequest, message)
    }

    /// Create an internal gateway error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Internal, message)
    }

    /// Check if error is retryable on the same provider
    pub fn is_retryable(&self) -> bool {
        self.category.is_retryable()
    }

    /// Check if error permits failover to the next provider
    pub fn should_failover(&self) -> bool {
        self.category.should_failover()
    }

    /// Get recommended retry delay, preferring an explicit provider hint
    pub fn recommended_delay(&self) -> Duration {
        self.retry_after
            .unwrap_or_else(|| self.category.recommended_delay())
    }
}

// =============================================================================
// Error Classifier
// =============================================================================

/// Error classifier shared by all provider clients
pub struct ErrorClassifier;

impl ErrorClassifier {
    /// Classify an error message from any provider
    pub fn classify(message: &str, provider: &str) -> ProviderError {
        let lower = message.to_lowercase();

        // Rate limiting patterns
        if lower.contains("rate limit")
            || lower.contains("429")
            || lower.contains("too many requests")
            || lower.contains("quota exceeded")
        {
            return ProviderError::with_provider(ErrorCategory::RateLimit, message, provider);
        }

        // Authentication patterns
        if lower.contains("auth")
            || lower.contains("401")
            || lower.contains("403")
            || lower.contains("api key")
            || lower.contains("invalid key")
            || lower.contains("unauthorized")
            || lower.contains("permission denied")
        {
            return ProviderError::with_provider(ErrorCategory::Auth, message, provider);
        }

        // Timeout patterns (before the broader network match)
        if lower.contains("timeout") || lower.contains("timed out") || lower.contains("deadline") {
            return ProviderError::with_provider(ErrorCategory::Timeout, message, provider);
        }

        // Network patterns
        if lower.contains("network")
            || lower.contains("connection")
            || lower.contains("dns")
            || lower.contains("unreachable")
        {
            return ProviderError::with_provider(ErrorCategory::Network, message, provider);
        }

        // Upstream server error patterns
        if lower.contains("500")
            || lower.contains("502")
            || lower.contains("503")
            || lower.contains("504")
            || lower.contains("server error")
            || lower.contains("internal error")
            || lower.contains("overloaded")
            || lower.contains("temporary")
        {
            return ProviderError::with_provider(ErrorCategory::Upstream, message, provider);
        }

        // Unavailable patterns
        if lower.contains("not found") || lower.contains("service unavailable") {
            return ProviderError::with_provider(ErrorCategory::Unavailable, message, provider);
        }

        // Bad request patterns
        if lower.contains("400")
            || lower.contains("bad request")
            || lower.contains("invalid")
            || lower.contains("malformed")
        {
            return ProviderError::with_provider(ErrorCategory::InvalidRequest, message, provider);
        }

        // Default: treat as a provider-scoped internal failure
        ProviderError::with_provider(ErrorCategory::Internal, message, provider)
    }

    /// Classify HTTP status code directly (more accurate than string matching)
    ///
    /// A Retry-After header, when the response carried one, is attached by
    /// the caller; classification itself never fabricates a wait.
    pub fn classify_http_status(status: u16, message: &str, provider: &str) -> ProviderError {
        match status {
            429 => ProviderError::with_provider(ErrorCategory::RateLimit, message, provider),
            401 | 403 => ProviderError::with_provider(ErrorCategory::Auth, message, provider),
            400 | 422 => {
                ProviderError::with_provider(ErrorCategory::InvalidRequest, message, provider)
            }
            408 => ProviderError::with_provider(ErrorCategory::Timeout, message, provider),
            404 => ProviderError::with_provider(ErrorCategory::Unavailable, message, provider),
            // 500 series are transient - can retry
            500..=599 => ProviderError::with_provider(ErrorCategory::Upstream, message, provider),
            _ => ProviderError::with_provider(ErrorCategory::Internal, message, provider),
        }
    }

    /// Classify a reqwest transport error (no HTTP status available)
    pub fn classify_transport(err: &reqwest::Error, provider: &str) -> ProviderError {
        if err.is_timeout() {
            return ProviderError::with_provider(
                ErrorCategory::Timeout,
                err.to_string(),
                provider,
            );
        }
        if err.is_connect() {
            return ProviderError::with_provider(
                ErrorCategory::Network,
                err.to_string(),
                provider,
            );
        }
        Self::classify(&err.to_string(), provider)
    }
}

// =============================================================================
// Application Error
// =============================================================================

#[derive(Debug, Error)]
pub enum LexgateError {
    // -------------------------------------------------------------------------
    // System Errors (auto From impl)
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // -------------------------------------------------------------------------
    // Provider Errors
    // -------------------------------------------------------------------------
    /// Classified provider error with category and retry hints
    #[error("Provider error: {0}")]
    Provider(ProviderError),

    /// Every provider in the failover order exhausted its retries
    #[error("All providers failed after {attempts} attempts: {last_error}")]
    AllProvidersFailed {
        attempts: u32,
        providers: Vec<String>,
        last_error: ProviderError,
    },

    // -------------------------------------------------------------------------
    // Domain Errors
    // -------------------------------------------------------------------------
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Budget exceeded for '{user}': spent ${spent_usd:.2} of ${limit_usd:.2} ({period})")]
    BudgetExceeded {
        user: String,
        spent_usd: f64,
        limit_usd: f64,
        period: String,
    },

    #[error("Config error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<ProviderError> for LexgateError {
    fn from(err: ProviderError) -> Self {
        LexgateError::Provider(err)
    }
}

pub type Result<T> = std::result::Result<T, LexgateError>;

// =============================================================================
// Helper Functions
// =============================================================================

impl LexgateError {
    /// Check if this error is recoverable (can be retried)
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Context extension trait for adding context to errors
pub trait ResultExt<T> {
    /// Add context to an error
    fn with_context<C: Into<String>>(self, context: C) -> Result<T>;

    /// Add context using a closure (lazy evaluation)
    fn with_context_fn<F, C>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ResultExt<T> for std::result::Result<T, E> {
    fn with_context<C: Into<String>>(self, context: C) -> Result<T> {
        self.map_err(|e| LexgateError::Storage(format!("{}: {}", context.into(), e)))
    }

    fn with_context_fn<F, C>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.map_err(|e| LexgateError::Storage(format!("{}: {}", f().into(), e)))
    }
}

/// Filter iterator results, logging failures at debug level.
///
/// # Example
/// ```ignore
/// let values: Vec<_> = results
///     .filter_map(|r| log_filter_error(r, "loading usage rows"))
///     .collect();
/// ```
pub fn log_filter_error<T, E: std::fmt::Display>(
    result: std::result::Result<T, E>,
    context: &str,
) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::debug!("{}: {}", context, e);
            None
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_display() {
        assert_eq!(ErrorCategory::RateLimit.to_string(), "RATE_LIMIT");
        assert_eq!(ErrorCategory::Auth.to_string(), "AUTH");
        assert_eq!(
            ErrorCategory::InvalidRequest.to_string(),
            "INVALID_REQUEST"
        );
    }

    #[test]
    fn test_error_category_retryable() {
        assert!(ErrorCategory::RateLimit.is_retryable());
        assert!(ErrorCategory::Network.is_retryable());
        assert!(ErrorCategory::Timeout.is_retryable());
        assert!(ErrorCategory::Upstream.is_retryable());
        assert!(!ErrorCategory::Auth.is_retryable());
        assert!(!ErrorCategory::InvalidRequest.is_retryable());
        assert!(!ErrorCategory::Unavailable.is_retryable());
    }

    #[test]
    fn test_error_category_failover() {
        assert!(ErrorCategory::Auth.should_failover());
        assert!(ErrorCategory::Unavailable.should_failover());
        assert!(ErrorCategory::Upstream.should_failover());
        assert!(!ErrorCategory::InvalidRequest.should_failover());
    }

    #[test]
    fn test_classify_rate_limit() {
        let err = ErrorClassifier::classify("Rate limit exceeded, please retry", "openai");
        assert_eq!(err.category, ErrorCategory::RateLimit);
        assert!(err.is_retryable());
        // Waits come from the server, not from classification
        assert!(err.retry_after.is_none());
    }

    #[test]
    fn test_classify_auth() {
        let err = ErrorClassifier::classify("Invalid API key provided", "openai");
        assert_eq!(err.category, ErrorCategory::Auth);
        assert!(!err.is_retryable());
        assert!(err.should_failover());
    }

    #[test]
    fn test_classify_network() {
        let err = ErrorClassifier::classify("Connection refused", "anthropic");
        assert_eq!(err.category, ErrorCategory::Network);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_classify_timeout_before_network() {
        let err = ErrorClassifier::classify("Connection timed out after 30s", "anthropic");
        assert_eq!(err.category, ErrorCategory::Timeout);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_classify_bad_request() {
        let err = ErrorClassifier::classify("Malformed request body", "openai");
        assert_eq!(err.category, ErrorCategory::InvalidRequest);
        assert!(!err.is_retryable());
        assert!(!err.should_failover());
    }

    #[test]
    fn test_classify_http_status() {
        let rate_limit = ErrorClassifier::classify_http_status(429, "Rate limited", "test");
        assert_eq!(rate_limit.category, ErrorCategory::RateLimit);

        let auth = ErrorClassifier::classify_http_status(401, "Unauthorized", "test");
        assert_eq!(auth.category, ErrorCategory::Auth);

        let bad = ErrorClassifier::classify_http_status(422, "Unprocessable", "test");
        assert_eq!(bad.category, ErrorCategory::InvalidRequest);

        let server_error = ErrorClassifier::classify_http_status(500, "Server error", "test");
        assert_eq!(server_error.category, ErrorCategory::Upstream);
        assert!(server_error.is_retryable());

        let missing = ErrorClassifier::classify_http_status(404, "Not found", "test");
        assert_eq!(missing.category, ErrorCategory::Unavailable);
        assert!(missing.should_failover());
    }

    #[test]
    fn test_recommended_delay_prefers_hint() {
        let hinted = ProviderError::new(ErrorCategory::RateLimit, "slow down")
            .retry_after(Duration::from_secs(100));
        assert_eq!(hinted.recommended_delay(), Duration::from_secs(100));

        let unhinted = ProviderError::new(ErrorCategory::RateLimit, "slow down");
        assert_eq!(unhinted.recommended_delay(), Duration::from_secs(30));
    }

    #[test]
    fn test_provider_error_display() {
        let err =
            ProviderError::with_provider(ErrorCategory::RateLimit, "Too many requests", "openai");
        assert_eq!(err.to_string(), "[openai:RATE_LIMIT] Too many requests");

        let bare = ProviderError::new(ErrorCategory::Network, "Connection failed");
        assert_eq!(bare.to_string(), "[NETWORK] Connection failed");
    }

    #[test]
    fn test_aggregate_error_display() {
        let err = LexgateError::AllProvidersFailed {
            attempts: 6,
            providers: vec!["openai".into(), "anthropic".into()],
            last_error: ProviderError::with_provider(
                ErrorCategory::Upstream,
                "502 bad gateway",
                "anthropic",
            ),
        };
        let msg = err.to_string();
        assert!(msg.contains("6 attempts"));
        assert!(msg.contains("502 bad gateway"));
    }
}
