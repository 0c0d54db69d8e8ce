//! Configuration Types
//!
//! All configuration structures with sensible defaults.
//! Supports global (~/.config/lexgate/) and project (.lexgate/) level
//! configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::{
    budget as budget_constants, cache as cache_constants, dedup as dedup_constants,
    health as health_constants, retry as retry_constants,
};
use crate::gateway::RetryPolicy;
use crate::provider::ProviderSettings;
use crate::usage::{BudgetLimits, ModelRate, PriceBook};

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration version
    pub version: String,

    /// Routing and storage settings
    pub general: GeneralConfig,

    /// Provider instances, in priority order
    pub providers: Vec<ProviderSettings>,

    /// Response cache settings
    pub cache: CacheConfig,

    /// In-flight request coalescing settings
    pub dedup: DedupConfig,

    /// Retry policy settings
    pub retry: RetryConfig,

    /// Provider health tracking settings
    pub health: HealthConfig,

    /// Spending limits and alerting
    pub budget: BudgetConfig,

    /// Cost estimation rates
    pub pricing: PricingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            general: GeneralConfig::default(),
            providers: Vec::new(),
            cache: CacheConfig::default(),
            dedup: DedupConfig::default(),
            retry: RetryConfig::default(),
            health: HealthConfig::default(),
            budget: BudgetConfig::default(),
            pricing: PricingConfig::default(),
        }
    }
}

impl Config {
    /// Validate configuration values are within acceptable ranges.
    /// Returns `LexgateError::Config` on validation failure.
    pub fn validate(&self) -> crate::types::Result<()> {
        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if provider.name.trim().is_empty() {
                return Err(crate::types::LexgateError::Config(
                    "Provider name must not be empty".to_string(),
                ));
            }
            if !seen.insert(provider.name.as_str()) {
                return Err(crate::types::LexgateError::Config(format!(
                    "Duplicate provider name '{}'",
                    provider.name
                )));
            }
            if provider.timeout_secs == 0 {
                return Err(crate::types::LexgateError::Config(format!(
                    "Provider '{}' timeout_secs must be greater than 0",
                    provider.name
                )));
            }
        }

        if let Some(name) = &self.general.default_provider
            && !self.providers.iter().any(|p| &p.name == name)
        {
            return Err(crate::types::LexgateError::Config(format!(
                "Default provider '{}' is not configured",
                name
            )));
        }

        if self.cache.enabled && self.cache.ttl_hours == 0 {
            return Err(crate::types::LexgateError::Config(
                "Cache ttl_hours must be greater than 0".to_string(),
            ));
        }

        if self.dedup.enabled && self.dedup.safety_net_secs == 0 {
            return Err(crate::types::LexgateError::Config(
                "Dedup safety_net_secs must be greater than 0".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(crate::types::LexgateError::Config(
                "Retry max_attempts must be greater than 0".to_string(),
            ));
        }
        if self.retry.attempt_timeout_secs == 0 {
            return Err(crate::types::LexgateError::Config(
                "Retry attempt_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.health.window_minutes == 0 {
            return Err(crate::types::LexgateError::Config(
                "Health window_minutes must be greater than 0".to_string(),
            ));
        }

        if self.budget.alert_threshold <= 0.0 || self.budget.alert_threshold >= 1.0 {
            return Err(crate::types::LexgateError::Config(format!(
                "Budget alert_threshold must be between 0.0 and 1.0, got {}",
                self.budget.alert_threshold
            )));
        }
        if self.budget.critical_threshold <= self.budget.alert_threshold
            || self.budget.critical_threshold >= 1.0
        {
            return Err(crate::types::LexgateError::Config(format!(
                "Budget critical_threshold must be between alert_threshold ({}) and 1.0, got {}",
                self.budget.alert_threshold, self.budget.critical_threshold
            )));
        }

        Ok(())
    }
}

// =============================================================================
// General Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Provider tried first when a request names none.
    /// Defaults to the first configured provider.
    pub default_provider: Option<String>,

    /// Try other providers when the primary fails
    pub fallback_enabled: bool,

    /// SQLite database location
    pub database_path: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            default_provider: None,
            fallback_enabled: true,
            database_path: PathBuf::from(".lexgate/lexgate.db"),
        }
    }
}

// =============================================================================
// Cache Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,

    /// Entry lifetime in hours
    pub ttl_hours: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_hours: cache_constants::DEFAULT_TTL_HOURS,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_hours * 3600)
    }
}

// =============================================================================
// Dedup Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub enabled: bool,

    /// Seconds before an in-flight entry is considered stalled
    pub safety_net_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            safety_net_secs: dedup_constants::SAFETY_NET_SECS,
        }
    }
}

impl DedupConfig {
    pub fn safety_net(&self) -> Duration {
        Duration::from_secs(self.safety_net_secs)
    }
}

// =============================================================================
// Retry Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per provider, including the first
    pub max_attempts: u32,

    /// First backoff delay in milliseconds
    pub base_delay_ms: u64,

    /// Backoff ceiling in seconds
    pub max_delay_secs: u64,

    /// Per-attempt timeout in seconds
    pub attempt_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: retry_constants::DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: retry_constants::BASE_DELAY_MS,
            max_delay_secs: retry_constants::MAX_DELAY_SECS,
            attempt_timeout_secs: retry_constants::ATTEMPT_TIMEOUT_SECS,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_secs(self.max_delay_secs),
            Duration::from_secs(self.attempt_timeout_secs),
        )
    }
}

// =============================================================================
// Health Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Rolling window for ranking, in minutes
    pub window_minutes: u64,

    /// Sample retention, in days
    pub retention_days: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_minutes: health_constants::WINDOW_MINUTES,
            retention_days: health_constants::RETENTION_DAYS,
        }
    }
}

impl HealthConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_minutes * 60)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days * 24 * 3600)
    }
}

// =============================================================================
// Budget Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Default limits for users without an override.
    /// A non-positive value disables that window.
    pub daily_usd: f64,
    pub weekly_usd: f64,
    pub monthly_usd: f64,

    /// Fraction of a limit at which a warning alert is raised
    pub alert_threshold: f64,

    /// Fraction of a limit at which the status escalates to critical
    pub critical_threshold: f64,

    /// Reject requests once a limit is exceeded. When false, overruns
    /// only log a warning and raise an alert.
    pub hard_limit: bool,

    /// Per-user limit overrides, keyed by user id
    pub users: HashMap<String, BudgetLimits>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_usd: budget_constants::DEFAULT_DAILY_LIMIT_USD,
            weekly_usd: budget_constants::DEFAULT_WEEKLY_LIMIT_USD,
            monthly_usd: budget_constants::DEFAULT_MONTHLY_LIMIT_USD,
            alert_threshold: budget_constants::ALERT_THRESHOLD,
            critical_threshold: budget_constants::CRITICAL_THRESHOLD,
            hard_limit: false,
            users: HashMap::new(),
        }
    }
}

impl BudgetConfig {
    pub fn limits(&self) -> BudgetLimits {
        BudgetLimits {
            daily_usd: self.daily_usd,
            weekly_usd: self.weekly_usd,
            monthly_usd: self.monthly_usd,
        }
    }
}

// =============================================================================
// Pricing Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    /// Fallback rate for models without an entry, USD per million tokens
    pub default_input_per_million: f64,
    pub default_output_per_million: f64,

    /// Per-model rate overrides. Keys match by exact name, then by the
    /// longest prefix, so "gpt-4o" also covers dated snapshots.
    pub models: HashMap<String, ModelRate>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            default_input_per_million: 5.0,
            default_output_per_million: 15.0,
            models: HashMap::new(),
        }
    }
}

impl PricingConfig {
    /// Built-in rates with configured overrides layered on top.
    pub fn price_book(&self) -> PriceBook {
        let mut book = PriceBook::builtin();
        for (model, rate) in &self.models {
            book.set_rate(model, *rate);
        }
        book.set_default_rate(ModelRate::new(
            self.default_input_per_million,
            self.default_output_per_million,
        ));
        book
    }
}

// =============================================================================
// Tests
// =============================================================================
