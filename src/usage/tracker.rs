//! Usage Accounting and Budget Enforcement
//!
//! Every completion attempt lands here as a usage record: who asked, which
//! provider and model answered, token counts, estimated cost, and how the
//! request ended. Budgets are evaluated over rolling windows (the trailing
//! 24 hours, 7 days, 30 days) rather than calendar boundaries, so a burst
//! of spend is visible immediately instead of resetting at midnight.
//!
//! Threshold crossings produce at most one alert per (user, period, status)
//! within the suppression window, so a user hovering at 81% does not page
//! anyone sixty times an hour.

use std::collections::HashMap;
use std::time::Duration;

use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::constants::budget as budget_constants;
use crate::storage::SharedDatabase;
use crate::types::{Result, ResultExt, TokenUsage, log_filter_error};
use crate::usage::pricing::PriceBook;

// =============================================================================
// Record Types
// =============================================================================

/// How a tracked request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// Completed by the first provider tried
    Success,
    /// Completed by a provider other than the first choice
    Fallback,
    /// Served from the response cache
    Cached,
    /// Failed after all reliability measures
    Error,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Fallback => "fallback",
            Self::Cached => "cached",
            Self::Error => "error",
        }
    }
}

/// One completion attempt to record.
#[derive(Debug, Clone)]
pub struct UsageEntry {
    pub user_id: String,
    pub matter_ref: Option<String>,
    pub provider: String,
    pub model: String,
    pub endpoint: String,
    pub usage: TokenUsage,
    pub duration: Duration,
    pub status: RequestStatus,
    pub error: Option<String>,
}

/// Aggregated usage over a window.
#[derive(Debug, Clone, Default)]
pub struct UsageSummary {
    pub requests: u64,
    pub successes: u64,
    pub fallbacks: u64,
    pub cached: u64,
    pub errors: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub avg_duration_ms: f64,
}

// =============================================================================
// Budgets
// =============================================================================

/// Rolling budget window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetPeriod {
    Daily,
    Weekly,
    Monthly,
}

impl BudgetPeriod {
    pub const ALL: [BudgetPeriod; 3] = [Self::Daily, Self::Weekly, Self::Monthly];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }

    /// Length of the rolling window.
    pub fn window(&self) -> Duration {
        match self {
            Self::Daily => Duration::from_secs(24 * 3600),
            Self::Weekly => Duration::from_secs(7 * 24 * 3600),
            Self::Monthly => Duration::from_secs(30 * 24 * 3600),
        }
    }
}

impl std::fmt::Display for BudgetPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where spend sits relative to the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BudgetStatus {
    Ok,
    Warning,
    Critical,
    Exceeded,
}

impl BudgetStatus {
    /// Classify a spent/limit fraction against the given thresholds.
    pub fn classify(fraction: f64, alert: f64, critical: f64) -> Self {
        if fraction >= 1.0 {
            Self::Exceeded
        } else if fraction >= critical {
            Self::Critical
        } else if fraction >= alert {
            Self::Warning
        } else {
            Self::Ok
        }
    }

    /// Classify with the default thresholds.
    pub fn from_fraction(fraction: f64) -> Self {
        Self::classify(
            fraction,
            budget_constants::ALERT_THRESHOLD,
            budget_constants::CRITICAL_THRESHOLD,
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Exceeded => "exceeded",
        }
    }
}

impl std::fmt::Display for BudgetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// USD spending limits per rolling window. A non-positive limit disables
/// enforcement for that window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetLimits {
    pub daily_usd: f64,
    pub weekly_usd: f64,
    pub monthly_usd: f64,
}

impl BudgetLimits {
    pub fn for_period(&self, period: BudgetPeriod) -> f64 {
        match period {
            BudgetPeriod::Daily => self.daily_usd,
            BudgetPeriod::Weekly => self.weekly_usd,
            BudgetPeriod::Monthly => self.monthly_usd,
        }
    }
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            daily_usd: budget_constants::DEFAULT_DAILY_LIMIT_USD,
            weekly_usd: budget_constants::DEFAULT_WEEKLY_LIMIT_USD,
            monthly_usd: budget_constants::DEFAULT_MONTHLY_LIMIT_USD,
        }
    }
}

/// Outcome of evaluating one user's budget for one period.
#[derive(Debug, Clone)]
pub struct BudgetCheck {
    pub user: String,
    pub period: BudgetPeriod,
    pub status: BudgetStatus,
    pub spent_usd: f64,
    pub limit_usd: f64,
    /// spent / limit; 0.0 when the limit is disabled
    pub fraction: f64,
    /// Whether this check emitted a new alert
    pub alerted: bool,
}

/// A persisted threshold notification.
#[derive(Debug, Clone)]
pub struct BudgetAlert {
    pub user: String,
    pub period: String,
    pub status: String,
    pub percentage: f64,
    pub created_at: i64,
}

// =============================================================================
// Tracker
// =============================================================================

/// Usage log, aggregation queries, and budget evaluation.
pub struct UsageTracker {
    db: SharedDatabase,
    pricing: PriceBook,
    default_limits: BudgetLimits,
    user_limits: HashMap<String, BudgetLimits>,
    alert_threshold: f64,
    critical_threshold: f64,
    alert_suppression: Duration,
}

impl UsageTracker {
    pub fn new(
        db: SharedDatabase,
        pricing: PriceBook,
        default_limits: BudgetLimits,
        user_limits: HashMap<String, BudgetLimits>,
    ) -> Self {
        Self {
            db,
            pricing,
            default_limits,
            user_limits,
            alert_threshold: budget_constants::ALERT_THRESHOLD,
            critical_threshold: budget_constants::CRITICAL_THRESHOLD,
            alert_suppression: Duration::from_secs(budget_constants::ALERT_DEDUP_HOURS * 3600),
        }
    }

    /// Replace the warning/critical classification thresholds.
    pub fn with_thresholds(mut self, alert: f64, critical: f64) -> Self {
        self.alert_threshold = alert;
        self.critical_threshold = critical;
        self
    }

    pub fn with_defaults(db: SharedDatabase) -> Self {
        Self::new(
            db,
            PriceBook::builtin(),
            BudgetLimits::default(),
            HashMap::new(),
        )
    }

    /// Limits that apply to a user: their override, or the defaults.
    pub fn limits_for(&self, user: &str) -> BudgetLimits {
        self.user_limits
            .get(user)
            .copied()
            .unwrap_or(self.default_limits)
    }

    /// Record one completion attempt.
    ///
    /// Cache hits are recorded at zero cost; everything else is priced from
    /// the rate table.
    pub fn log(&self, entry: &UsageEntry) -> Result<f64> {
        let cost = if entry.status == RequestStatus::Cached {
            0.0
        } else {
            self.pricing.estimate(&entry.model, entry.usage)
        };

        let id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp();

        self.db.execute(
            "INSERT INTO usage_records
             (id, user_id, matter_ref, provider, model, endpoint,
              prompt_tokens, completion_tokens, total_tokens,
              estimated_cost, duration_ms, status, error_message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            &[
                &id,
                &entry.user_id,
                &entry.matter_ref,
                &entry.provider,
                &entry.model,
                &entry.endpoint,
                &(entry.usage.prompt_tokens as i64),
                &(entry.usage.completion_tokens as i64),
                &(entry.usage.total() as i64),
                &cost,
                &(entry.duration.as_millis() as i64),
                &entry.status.as_str(),
                &entry.error,
                &now,
            ],
        )?;

        tracing::debug!(
            user = %entry.user_id,
            provider = %entry.provider,
            model = %entry.model,
            status = entry.status.as_str(),
            cost_usd = cost,
            "Recorded usage"
        );

        Ok(cost)
    }

    /// Aggregate usage over the trailing window, optionally for one user.
    pub fn summary(&self, user: Option<&str>, window: Duration) -> Result<UsageSummary> {
        let cutoff = chrono::Utc::now().timestamp() - window.as_secs() as i64;
        let conn = self.db.connection()?;

        let sql = format!(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN status = 'success' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'fallback' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'cached' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'error' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(prompt_tokens), 0),
                    COALESCE(SUM(completion_tokens), 0),
                    COALESCE(SUM(total_tokens), 0),
                    COALESCE(SUM(estimated_cost), 0.0),
                    COALESCE(AVG(duration_ms), 0.0)
             FROM usage_records
             WHERE created_at >= ?1{}",
            if user.is_some() {
                " AND user_id = ?2"
            } else {
                ""
            }
        );

        let mut stmt = conn
            .prepare(&sql)
            .with_context("Failed to prepare usage summary query")?;

        let map_row = |row: &rusqlite::Row| {
            Ok(UsageSummary {
                requests: row.get::<_, i64>(0)? as u64,
                successes: row.get::<_, i64>(1)? as u64,
                fallbacks: row.get::<_, i64>(2)? as u64,
                cached: row.get::<_, i64>(3)? as u64,
                errors: row.get::<_, i64>(4)? as u64,
                prompt_tokens: row.get::<_, i64>(5)? as u64,
                completion_tokens: row.get::<_, i64>(6)? as u64,
                total_tokens: row.get::<_, i64>(7)? as u64,
                total_cost_usd: row.get::<_, f64>(8)?,
                avg_duration_ms: row.get::<_, f64>(9)?,
            })
        };

        let summary = match user {
            Some(user) => stmt.query_row(params![cutoff, user], map_row),
            None => stmt.query_row(params![cutoff], map_row),
        }
        .with_context("Failed to read usage summary")?;

        Ok(summary)
    }

    /// USD spent by a user since the cutoff.
    fn spend_since(&self, user: &str, cutoff: i64) -> Result<f64> {
        let spent: Option<f64> = self.db.query_value(
            "SELECT COALESCE(SUM(estimated_cost), 0.0)
             FROM usage_records
             WHERE user_id = ?1 AND created_at >= ?2",
            &[&user, &cutoff],
        )?;
        Ok(spent.unwrap_or(0.0))
    }

    /// Evaluate one budget period for a user, emitting an alert on a fresh
    /// threshold crossing.
    pub fn check_budget(&self, user: &str, period: BudgetPeriod) -> Result<BudgetCheck> {
        let limit = self.limits_for(user).for_period(period);
        let cutoff = chrono::Utc::now().timestamp() - period.window().as_secs() as i64;
        let spent = self.spend_since(user, cutoff)?;

        let fraction = if limit > 0.0 { spent / limit } else { 0.0 };
        let status =
            BudgetStatus::classify(fraction, self.alert_threshold, self.critical_threshold);

        let alerted = if status != BudgetStatus::Ok {
            self.maybe_alert(user, period, status, fraction)?
        } else {
            false
        };

        Ok(BudgetCheck {
            user: user.to_string(),
            period,
            status,
            spent_usd: spent,
            limit_usd: limit,
            fraction,
            alerted,
        })
    }

    /// Evaluate every period for a user.
    pub fn check_all_budgets(&self, user: &str) -> Result<Vec<BudgetCheck>> {
        BudgetPeriod::ALL
            .iter()
            .map(|period| self.check_budget(user, *period))
            .collect()
    }

    /// Insert an alert unless the same (user, period, status) already fired
    /// within the suppression window. Returns whether a new alert was written.
    fn maybe_alert(
        &self,
        user: &str,
        period: BudgetPeriod,
        status: BudgetStatus,
        fraction: f64,
    ) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();
        let since = now - self.alert_suppression.as_secs() as i64;

        let existing: Option<i64> = self.db.query_value(
            "SELECT COUNT(*) FROM budget_alerts
             WHERE user_id = ?1 AND period = ?2 AND status = ?3 AND created_at >= ?4",
            &[&user, &period.as_str(), &status.as_str(), &since],
        )?;

        if existing.unwrap_or(0) > 0 {
            return Ok(false);
        }

        self.db.execute(
            "INSERT INTO budget_alerts (user_id, period, status, percentage, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            &[
                &user,
                &period.as_str(),
                &status.as_str(),
                &(fraction * 100.0),
                &now,
            ],
        )?;

        tracing::warn!(
            user = %user,
            period = period.as_str(),
            status = status.as_str(),
            percentage = fraction * 100.0,
            "Budget threshold crossed"
        );

        Ok(true)
    }

    /// Alerts emitted for a user within the trailing window, newest first.
    pub fn recent_alerts(&self, user: &str, window: Duration) -> Result<Vec<BudgetAlert>> {
        let cutoff = chrono::Utc::now().timestamp() - window.as_secs() as i64;
        let conn = self.db.connection()?;

        let mut stmt = conn
            .prepare(
                "SELECT user_id, period, status, percentage, created_at
                 FROM budget_alerts
                 WHERE user_id = ?1 AND created_at >= ?2
                 ORDER BY created_at DESC",
            )
            .with_context("Failed to prepare alerts query")?;

        let alerts = stmt
            .query_map(params![user, cutoff], |row| {
                Ok(BudgetAlert {
                    user: row.get(0)?,
                    period: row.get(1)?,
                    status: row.get(2)?,
                    percentage: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .filter_map(|r| log_filter_error(r, "reading budget alert"))
            .collect();

        Ok(alerts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;
    use std::sync::Arc;

    fn tracker_with_limits(daily: f64) -> UsageTracker {
        let db = Database::open_in_memory().expect("open");
        db.initialize().expect("initialize");
        UsageTracker::new(
            Arc::new(db),
            PriceBook::builtin(),
            BudgetLimits {
                daily_usd: daily,
                weekly_usd: daily * 5.0,
                monthly_usd: daily * 15.0,
            },
            HashMap::new(),
        )
    }

    fn entry(user: &str, status: RequestStatus) -> UsageEntry {
        UsageEntry {
            user_id: user.to_string(),
            matter_ref: Some("matter-042".to_string()),
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            endpoint: "chat/completions".to_string(),
            usage: TokenUsage::new(1000, 500),
            duration: Duration::from_millis(800),
            status,
            error: None,
        }
    }

    /// Insert spend directly so tests control exact amounts.
    fn seed_spend(tracker: &UsageTracker, user: &str, cost: f64) {
        let now = chrono::Utc::now().timestamp();
        tracker
            .db
            .execute(
                "INSERT INTO usage_records
                 (id, user_id, provider, model, endpoint, prompt_tokens, completion_tokens,
                  total_tokens, estimated_cost, duration_ms, status, created_at)
                 VALUES (?1, ?2, 'openai', 'gpt-4o', 'chat/completions', 0, 0, 0, ?3, 0, 'success', ?4)",
                &[&uuid::Uuid::new_v4().to_string(), &user, &cost, &now],
            )
            .expect("seed");
    }

    #[test]
    fn test_log_prices_from_rate_table() {
        let tracker = tracker_with_limits(10.0);
        let cost = tracker.log(&entry("alice", RequestStatus::Success)).expect("log");
        // 1000 in + 500 out on gpt-4o
        let expected = 1000.0 / 1e6 * 2.50 + 500.0 / 1e6 * 10.00;
        assert!((cost - expected).abs() < 1e-9);
    }

    #[test]
    fn test_cached_requests_cost_nothing() {
        let tracker = tracker_with_limits(10.0);
        let cost = tracker.log(&entry("alice", RequestStatus::Cached)).expect("log");
        assert_eq!(cost, 0.0);

        let check = tracker
            .check_budget("alice", BudgetPeriod::Daily)
            .expect("check");
        assert_eq!(check.spent_usd, 0.0);
        assert_eq!(check.status, BudgetStatus::Ok);
    }

    #[test]
    fn test_summary_counts_by_status() {
        let tracker = tracker_with_limits(10.0);
        tracker.log(&entry("alice", RequestStatus::Success)).expect("log");
        tracker.log(&entry("alice", RequestStatus::Fallback)).expect("log");
        tracker.log(&entry("alice", RequestStatus::Cached)).expect("log");
        tracker
            .log(&UsageEntry {
                error: Some("upstream exploded".to_string()),
                ..entry("alice", RequestStatus::Error)
            })
            .expect("log");
        tracker.log(&entry("bob", RequestStatus::Success)).expect("log");

        let alice = tracker
            .summary(Some("alice"), Duration::from_secs(3600))
            .expect("summary");
        assert_eq!(alice.requests, 4);
        assert_eq!(alice.successes, 1);
        assert_eq!(alice.fallbacks, 1);
        assert_eq!(alice.cached, 1);
        assert_eq!(alice.errors, 1);
        assert_eq!(alice.total_tokens, 4 * 1500);

        let everyone = tracker
            .summary(None, Duration::from_secs(3600))
            .expect("summary");
        assert_eq!(everyone.requests, 5);
    }

    #[test]
    fn test_budget_status_thresholds() {
        assert_eq!(BudgetStatus::from_fraction(0.5), BudgetStatus::Ok);
        assert_eq!(BudgetStatus::from_fraction(0.80), BudgetStatus::Warning);
        assert_eq!(BudgetStatus::from_fraction(0.94), BudgetStatus::Warning);
        assert_eq!(BudgetStatus::from_fraction(0.95), BudgetStatus::Critical);
        assert_eq!(BudgetStatus::from_fraction(1.0), BudgetStatus::Exceeded);
        assert_eq!(BudgetStatus::from_fraction(2.3), BudgetStatus::Exceeded);
    }

    #[test]
    fn test_configured_thresholds_move_the_boundaries() {
        let tracker = tracker_with_limits(10.0).with_thresholds(0.5, 0.9);
        seed_spend(&tracker, "alice", 6.0);

        // 60% sits over the lowered alert threshold
        let check = tracker
            .check_budget("alice", BudgetPeriod::Daily)
            .expect("check");
        assert_eq!(check.status, BudgetStatus::Warning);

        seed_spend(&tracker, "alice", 3.2);
        let check = tracker
            .check_budget("alice", BudgetPeriod::Daily)
            .expect("check");
        assert_eq!(check.status, BudgetStatus::Critical);
    }

    #[test]
    fn test_check_budget_warning_at_81_percent() {
        let tracker = tracker_with_limits(10.0);
        seed_spend(&tracker, "alice", 8.1);

        let check = tracker
            .check_budget("alice", BudgetPeriod::Daily)
            .expect("check");
        assert_eq!(check.status, BudgetStatus::Warning);
        assert!((check.fraction - 0.81).abs() < 1e-9);
        assert!(check.alerted);
    }

    #[test]
    fn test_check_budget_exceeded_over_limit() {
        let tracker = tracker_with_limits(10.0);
        seed_spend(&tracker, "alice", 10.1);

        let check = tracker
            .check_budget("alice", BudgetPeriod::Daily)
            .expect("check");
        assert_eq!(check.status, BudgetStatus::Exceeded);
        assert!(check.fraction > 1.0);
    }

    #[test]
    fn test_alert_suppression_within_window() {
        let tracker = tracker_with_limits(10.0);
        seed_spend(&tracker, "alice", 8.5);

        let first = tracker
            .check_budget("alice", BudgetPeriod::Daily)
            .expect("check");
        let second = tracker
            .check_budget("alice", BudgetPeriod::Daily)
            .expect("check");

        assert!(first.alerted);
        assert!(!second.alerted);

        let alerts = tracker
            .recent_alerts("alice", Duration::from_secs(3600))
            .expect("alerts");
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].status, "warning");
    }

    #[test]
    fn test_status_escalation_alerts_again() {
        let tracker = tracker_with_limits(10.0);
        seed_spend(&tracker, "alice", 8.5);
        tracker
            .check_budget("alice", BudgetPeriod::Daily)
            .expect("check");

        // Spend climbs past the critical threshold
        seed_spend(&tracker, "alice", 1.2);
        let escalated = tracker
            .check_budget("alice", BudgetPeriod::Daily)
            .expect("check");

        assert_eq!(escalated.status, BudgetStatus::Critical);
        assert!(escalated.alerted);
    }

    #[test]
    fn test_disabled_limit_never_alerts() {
        let tracker = tracker_with_limits(0.0);
        seed_spend(&tracker, "alice", 1000.0);

        let check = tracker
            .check_budget("alice", BudgetPeriod::Daily)
            .expect("check");
        assert_eq!(check.status, BudgetStatus::Ok);
        assert!(!check.alerted);
    }

    #[test]
    fn test_user_specific_limits_override_defaults() {
        let db = Database::open_in_memory().expect("open");
        db.initialize().expect("initialize");
        let mut user_limits = HashMap::new();
        user_limits.insert(
            "partner".to_string(),
            BudgetLimits {
                daily_usd: 100.0,
                weekly_usd: 500.0,
                monthly_usd: 1500.0,
            },
        );
        let tracker = UsageTracker::new(
            Arc::new(db),
            PriceBook::builtin(),
            BudgetLimits::default(),
            user_limits,
        );

        seed_spend(&tracker, "partner", 50.0);
        seed_spend(&tracker, "associate", 50.0);

        let partner = tracker
            .check_budget("partner", BudgetPeriod::Daily)
            .expect("check");
        assert_eq!(partner.status, BudgetStatus::Ok);

        // Same spend blows through the default daily limit
        let associate = tracker
            .check_budget("associate", BudgetPeriod::Daily)
            .expect("check");
        assert_eq!(associate.status, BudgetStatus::Exceeded);
    }

    #[test]
    fn test_old_spend_falls_out_of_rolling_window() {
        let tracker = tracker_with_limits(10.0);

        let two_days_ago = chrono::Utc::now().timestamp() - 2 * 24 * 3600;
        tracker
            .db
            .execute(
                "INSERT INTO usage_records
                 (id, user_id, provider, model, endpoint, prompt_tokens, completion_tokens,
                  total_tokens, estimated_cost, duration_ms, status, created_at)
                 VALUES (?1, 'alice', 'openai', 'gpt-4o', 'chat/completions', 0, 0, 0, 9.9, 0, 'success', ?2)",
                &[&uuid::Uuid::new_v4().to_string(), &two_days_ago],
            )
            .expect("insert old");

        let daily = tracker
            .check_budget("alice", BudgetPeriod::Daily)
            .expect("check");
        assert_eq!(daily.spent_usd, 0.0);

        // Still visible in the weekly window
        let weekly = tracker
            .check_budget("alice", BudgetPeriod::Weekly)
            .expect("check");
        assert!((weekly.spent_usd - 9.9).abs() < 1e-9);
    }
}
