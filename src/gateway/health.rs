//! Provider Health Tracking
//!
//! Records the outcome of every provider attempt and ranks providers by
//! recent behavior: rolling success ratio first, average latency as the
//! tiebreaker. A provider with no recent samples is scored at a neutral
//! ratio rather than excluded, so new or idle providers still get traffic
//! and consistently failing ones sink to the bottom instead of vanishing.

use std::cmp::Ordering;
use std::time::Duration;

use rusqlite::params;

use crate::constants::health as health_constants;
use crate::storage::SharedDatabase;
use crate::types::{Result, ResultExt, log_filter_error};

/// Rolling health summary for one provider.
#[derive(Debug, Clone)]
pub struct ProviderHealth {
    pub provider: String,
    /// Samples inside the rolling window
    pub samples: u64,
    pub successes: u64,
    /// successes / samples over the window
    pub success_ratio: f64,
    pub avg_latency_ms: f64,
}

/// Sample store plus ranking over a rolling window.
pub struct HealthMonitor {
    db: SharedDatabase,
    window: Duration,
    retention: Duration,
}

impl HealthMonitor {
    pub fn new(db: SharedDatabase, window: Duration, retention: Duration) -> Self {
        Self {
            db,
            window,
            retention,
        }
    }

    pub fn with_defaults(db: SharedDatabase) -> Self {
        Self::new(
            db,
            Duration::from_secs(health_constants::WINDOW_MINUTES * 60),
            Duration::from_secs(health_constants::RETENTION_DAYS * 24 * 3600),
        )
    }

    /// Record one attempt outcome.
    pub fn record(
        &self,
        provider: &str,
        success: bool,
        latency: Duration,
        error: Option<&str>,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        self.db.execute(
            "INSERT INTO health_samples (provider, success, latency_ms, error_message, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            &[
                &provider,
                &(success as i64),
                &(latency.as_millis() as i64),
                &error,
                &now,
            ],
        )?;
        Ok(())
    }

    /// Per-provider summaries over the rolling window, best first.
    pub fn snapshot(&self) -> Result<Vec<ProviderHealth>> {
        let cutoff = chrono::Utc::now().timestamp() - self.window.as_secs() as i64;
        let conn = self.db.connection()?;

        let mut stmt = conn
            .prepare(
                "SELECT provider, COUNT(*), SUM(success), AVG(latency_ms)
                 FROM health_samples
                 WHERE recorded_at >= ?1
                 GROUP BY provider",
            )
            .with_context("Failed to prepare health snapshot query")?;

        let mut summaries: Vec<ProviderHealth> = stmt
            .query_map(params![cutoff], |row| {
                let provider: String = row.get(0)?;
                let samples: i64 = row.get(1)?;
                let successes: i64 = row.get(2)?;
                let avg_latency_ms: f64 = row.get(3)?;
                Ok((provider, samples, successes, avg_latency_ms))
            })?
            .filter_map(|r| log_filter_error(r, "reading health sample row"))
            .map(|(provider, samples, successes, avg_latency_ms)| {
                let ratio = if samples > 0 {
                    successes as f64 / samples as f64
                } else {
                    health_constants::NEUTRAL_SUCCESS_RATIO
                };
                ProviderHealth {
                    provider,
                    samples: samples as u64,
                    successes: successes as u64,
                    success_ratio: ratio,
                    avg_latency_ms,
                }
            })
            .collect();

        summaries.sort_by(compare_health);
        Ok(summaries)
    }

    /// Order candidate providers from healthiest to worst.
    ///
    /// Candidates without samples in the window get a neutral ratio and sort
    /// after measured providers with the same ratio. Full ties keep the
    /// caller's order, so configuration order remains the final tiebreaker.
    pub fn ranked(&self, candidates: &[String]) -> Result<Vec<String>> {
        let snapshot = self.snapshot()?;

        let mut scored: Vec<(String, f64, f64)> = candidates
            .iter()
            .map(|name| {
                match snapshot.iter().find(|h| &h.provider == name) {
                    Some(h) => (name.clone(), h.success_ratio, h.avg_latency_ms),
                    // No data: neutral ratio, latency worse than any measurement
                    None => (
                        name.clone(),
                        health_constants::NEUTRAL_SUCCESS_RATIO,
                        f64::MAX,
                    ),
                }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then(a.2.partial_cmp(&b.2).unwrap_or(Ordering::Equal))
        });

        Ok(scored.into_iter().map(|(name, _, _)| name).collect())
    }

    /// Drop samples older than the retention period. Returns the number removed.
    pub fn prune(&self) -> Result<u64> {
        let cutoff = chrono::Utc::now().timestamp() - self.retention.as_secs() as i64;
        let removed = self.db.execute(
            "DELETE FROM health_samples WHERE recorded_at < ?1",
            &[&cutoff],
        )?;
        Ok(removed as u64)
    }

    /// Drop every sample. Returns the number removed.
    pub fn clear(&self) -> Result<u64> {
        let removed = self.db.execute("DELETE FROM health_samples", &[])?;
        Ok(removed as u64)
    }
}

fn compare_health(a: &ProviderHealth, b: &ProviderHealth) -> Ordering {
    b.success_ratio
        .partial_cmp(&a.success_ratio)
        .unwrap_or(Ordering::Equal)
        .then(
            a.avg_latency_ms
                .partial_cmp(&b.avg_latency_ms)
                .unwrap_or(Ordering::Equal),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;
    use std::sync::Arc;

    fn monitor() -> HealthMonitor {
        let db = Database::open_in_memory().expect("open");
        db.initialize().expect("initialize");
        HealthMonitor::with_defaults(Arc::new(db))
    }

    fn record_n(m: &HealthMonitor, provider: &str, successes: u32, failures: u32, latency_ms: u64) {
        for _ in 0..successes {
            m.record(provider, true, Duration::from_millis(latency_ms), None)
                .expect("record");
        }
        for _ in 0..failures {
            m.record(
                provider,
                false,
                Duration::from_millis(latency_ms),
                Some("upstream error"),
            )
            .expect("record");
        }
    }

    #[test]
    fn test_snapshot_aggregates_window() {
        let m = monitor();
        record_n(&m, "openai", 3, 1, 100);

        let snapshot = m.snapshot().expect("snapshot");
        assert_eq!(snapshot.len(), 1);
        let health = &snapshot[0];
        assert_eq!(health.provider, "openai");
        assert_eq!(health.samples, 4);
        assert_eq!(health.successes, 3);
        assert!((health.success_ratio - 0.75).abs() < 1e-9);
        assert!((health.avg_latency_ms - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_ranking_prefers_success_ratio_then_latency() {
        let m = monitor();
        record_n(&m, "slow-reliable", 10, 0, 400);
        record_n(&m, "fast-reliable", 10, 0, 50);
        record_n(&m, "degraded", 5, 5, 50);

        let ranked = m
            .ranked(&[
                "degraded".to_string(),
                "slow-reliable".to_string(),
                "fast-reliable".to_string(),
            ])
            .expect("ranked");

        assert_eq!(ranked, vec!["fast-reliable", "slow-reliable", "degraded"]);
    }

    #[test]
    fn test_zero_success_provider_ranks_last_but_stays() {
        let m = monitor();
        record_n(&m, "healthy", 5, 0, 100);
        record_n(&m, "dead", 0, 5, 100);

        let ranked = m
            .ranked(&["dead".to_string(), "healthy".to_string()])
            .expect("ranked");
        assert_eq!(ranked, vec!["healthy", "dead"]);
    }

    #[test]
    fn test_unsampled_provider_gets_neutral_slot() {
        let m = monitor();
        record_n(&m, "good", 10, 0, 100);
        record_n(&m, "bad", 1, 9, 100);

        let ranked = m
            .ranked(&[
                "bad".to_string(),
                "brand-new".to_string(),
                "good".to_string(),
            ])
            .expect("ranked");

        // Neutral 0.5 lands between measured 1.0 and measured 0.1
        assert_eq!(ranked, vec!["good", "brand-new", "bad"]);
    }

    #[test]
    fn test_all_unsampled_keeps_caller_order() {
        let m = monitor();
        let ranked = m
            .ranked(&["first".to_string(), "second".to_string()])
            .expect("ranked");
        assert_eq!(ranked, vec!["first", "second"]);
    }

    #[test]
    fn test_old_samples_fall_out_of_window() {
        let m = monitor();
        record_n(&m, "openai", 2, 0, 100);

        // A failure far outside the window must not drag the ratio down
        let old = chrono::Utc::now().timestamp() - 2 * m.window.as_secs() as i64;
        m.db.execute(
            "INSERT INTO health_samples (provider, success, latency_ms, recorded_at)
             VALUES ('openai', 0, 100, ?1)",
            &[&old],
        )
        .expect("insert old");

        let snapshot = m.snapshot().expect("snapshot");
        assert_eq!(snapshot[0].samples, 2);
        assert!((snapshot[0].success_ratio - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_prune_removes_only_stale_samples() {
        let m = monitor();
        record_n(&m, "openai", 1, 0, 100);

        let old = chrono::Utc::now().timestamp() - 2 * m.retention.as_secs() as i64;
        m.db.execute(
            "INSERT INTO health_samples (provider, success, latency_ms, recorded_at)
             VALUES ('openai', 1, 100, ?1)",
            &[&old],
        )
        .expect("insert old");

        assert_eq!(m.prune().expect("prune"), 1);
        let remaining: Option<i64> = m
            .db
            .query_value("SELECT COUNT(*) FROM health_samples", &[])
            .expect("count");
        assert_eq!(remaining, Some(1));
    }

    #[test]
    fn test_record_fails_when_storage_unavailable() {
        let m = monitor();
        m.db.execute("DROP TABLE health_samples", &[]).expect("drop");
        assert!(
            m.record("openai", true, Duration::from_millis(10), None)
                .is_err()
        );
    }
}
