//! Retry with Exponential Backoff
//!
//! Drives repeated attempts against a single provider with bounded,
//! jittered backoff.
//!
//! ## Strategy
//!
//! 1. Run the attempt under a per-attempt timeout
//! 2. On failure, consult the retryable predicate and attempt budget
//! 3. A server-provided retry-after wait overrides the computed backoff
//! 4. Everything else sleeps `min(max, base * 2^(attempt-1))` plus jitter
//!
//! The outcome always reports how many attempts were consumed, whether the
//! final result was success or failure, so callers can account for upstream
//! load accurately.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::constants::{network as network_constants, retry as retry_constants};
use crate::types::{ErrorCategory, ProviderError};

/// Decides whether an error is worth another attempt.
pub type RetryPredicate = Arc<dyn Fn(&ProviderError) -> bool + Send + Sync>;

/// Result of a retried operation plus how many attempts it consumed.
///
/// `attempts` counts every invocation, including the final one, so a first
/// try success reports 1.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: std::result::Result<T, ProviderError>,
    pub attempts: u32,
}

/// Retry configuration applied to one provider's attempts.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first (minimum 1)
    pub max_attempts: u32,
    /// Backoff for the first retry
    pub base_delay: Duration,
    /// Ceiling for any computed backoff
    pub max_delay: Duration,
    /// Budget for a single attempt before it is abandoned
    pub attempt_timeout: Duration,
    retryable: RetryPredicate,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("attempt_timeout", &self.attempt_timeout)
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            retry_constants::DEFAULT_MAX_ATTEMPTS,
            Duration::from_millis(retry_constants::BASE_DELAY_MS),
            Duration::from_secs(retry_constants::MAX_DELAY_SECS),
            Duration::from_secs(retry_constants::ATTEMPT_TIMEOUT_SECS),
        )
    }
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            attempt_timeout,
            retryable: Arc::new(|err: &ProviderError| err.is_retryable()),
        }
    }

    /// Replace the default category-based retry decision.
    pub fn with_retryable(mut self, predicate: RetryPredicate) -> Self {
        self.retryable = predicate;
        self
    }

    /// A policy that never retries, for callers that opt out.
    pub fn single_attempt(&self) -> Self {
        let mut policy = self.clone();
        policy.max_attempts = 1;
        policy
    }

    /// Run `attempt_fn` until it succeeds, exhausts the attempt budget, or
    /// fails with an error the predicate rejects.
    ///
    /// The closure receives the 1-based attempt number. Each invocation runs
    /// under the per-attempt timeout; an overrun counts as a timeout error
    /// for that attempt.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut attempt_fn: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, ProviderError>>,
    {
        let mut attempt = 1u32;

        loop {
            let result = match tokio::time::timeout(self.attempt_timeout, attempt_fn(attempt)).await
            {
                Ok(result) => result,
                Err(_) => Err(ProviderError::timeout(operation, self.attempt_timeout)),
            };

            match result {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                    };
                }
                Err(err) => {
                    if attempt >= self.max_attempts || !(self.retryable)(&err) {
                        return RetryOutcome {
                            result: Err(err),
                            attempts: attempt,
                        };
                    }

                    let wait = self.wait_before_retry(attempt, &err);
                    warn!(
                        operation,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        error = %err,
                        "Attempt failed, retrying"
                    );
                    sleep(wait).await;
                    attempt += 1;
                }
            }
        }
    }

    /// How long to sleep after a failed attempt.
    ///
    /// A wait the server asked for beats the computed backoff. Rate limits
    /// without a structured hint often spell the delay out in the message,
    /// so that is parsed before falling back to the category default.
    fn wait_before_retry(&self, attempt: u32, err: &ProviderError) -> Duration {
        if let Some(wait) = err.retry_after {
            debug!(wait_secs = wait.as_secs(), "Honoring server-provided retry delay");
            return wait;
        }

        if err.category == ErrorCategory::RateLimit {
            let wait = parse_rate_limit_delay(&err.message)
                .unwrap_or_else(|| err.category.recommended_delay());
            debug!(wait_secs = wait.as_secs(), "Rate limited, honoring server delay");
            return wait;
        }

        let base = backoff_delay(attempt, self.base_delay, self.max_delay);
        base + random_jitter(base)
    }
}

/// Exponential backoff for the given 1-based attempt, capped at `max`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    // Shift capped well below u32 range; the cap below dominates anyway
    let exponent = attempt.saturating_sub(1).min(16);
    let scaled = base.saturating_mul(1u32 << exponent);
    std::cmp::min(scaled, max)
}

/// Generate random jitter using thread-local RNG for efficiency
fn random_jitter(base_delay: Duration) -> Duration {
    let max_jitter_ms = (base_delay.as_millis() as u64) / 4;
    if max_jitter_ms == 0 {
        return Duration::ZERO;
    }
    let jitter_ms = rand::rng().random_range(0..max_jitter_ms);
    Duration::from_millis(jitter_ms)
}

/// Parse rate limit delay from error message
///
/// Extracts retry-after seconds from common rate limit error formats.
fn parse_rate_limit_delay(message: &str) -> Option<Duration> {
    let lower = message.to_lowercase();
    let cap = network_constants::MAX_RETRY_AFTER_SECS;

    // Pattern: "retry after N seconds" or "retry-after: N"
    if let Some(idx) = lower.find("retry") {
        let after_retry = &lower[idx..];
        for word in after_retry.split_whitespace() {
            if let Ok(secs) = word.parse::<u64>() {
                return Some(Duration::from_secs(secs.min(cap)));
            }
        }
    }

    // Pattern: "wait N seconds" or "in N seconds"
    for pattern in &["wait ", "in "] {
        if let Some(idx) = lower.find(pattern) {
            let after_pattern = &lower[idx + pattern.len()..];
            for word in after_pattern.split_whitespace() {
                if let Ok(secs) = word.parse::<u64>() {
                    return Some(Duration::from_secs(secs.min(cap)));
                }
            }
        }
    }

    None
}
