//! Completion Gateway
//!
//! The façade that composes every reliability measure into one request
//! pipeline:
//!
//! 1. Validate the request and resolve its route (provider, model)
//! 2. Enforce spending budgets for the requesting user
//! 3. Serve from the response cache when a live entry exists
//! 4. Coalesce with identical in-flight executions
//! 5. Execute with per-provider retry and health-ranked failover
//! 6. Record cache writes, usage, and health samples before returning
//!
//! Side effects run inside the execution itself, so they complete exactly
//! once per upstream call even when callers disconnect mid-flight. Storage
//! problems never fail a request that the upstream already answered: cache
//! and accounting writes degrade to warnings.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::constants::{
    budget as budget_constants, cache as cache_constants, dedup as dedup_constants,
    health as health_constants,
};
use crate::gateway::cache::{CacheStats, ResponseCache};
use crate::gateway::dedup::RequestCoalescer;
use crate::gateway::fingerprint::Fingerprint;
use crate::gateway::health::{HealthMonitor, ProviderHealth};
use crate::gateway::retry::RetryPolicy;
use crate::provider::SharedProvider;
use crate::storage::SharedDatabase;
use crate::types::{
    CompletionRequest, ErrorCategory, LexgateError, ProviderError, Result, TokenUsage,
};
use crate::usage::{
    BudgetAlert, BudgetCheck, BudgetLimits, BudgetStatus, PriceBook, RequestStatus, UsageEntry,
    UsageSummary, UsageTracker,
};

/// Usage records without a caller identity pool under this user.
const ANONYMOUS_USER: &str = "anonymous";

// =============================================================================
// Response Types
// =============================================================================

/// How the gateway actually served a request.
#[derive(Debug, Clone, Default)]
pub struct RouteMetadata {
    /// Served from the response cache without touching a provider
    pub cached: bool,
    /// Piggybacked on an identical execution another caller started
    pub deduplicated: bool,
    /// Answered by a provider other than the first choice
    pub fallback_used: bool,
    /// Provider invocations beyond the first, summed across all providers
    pub retry_attempts: u32,
    /// Wall-clock time from accept to response
    pub total_duration_ms: u64,
}

/// A completed request with its reliability metadata.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub content: String,
    /// Provider instance that produced the content
    pub provider: String,
    pub model: String,
    pub usage: TokenUsage,
    pub metadata: RouteMetadata,
}

/// Successful execution as it flows through the coalescer.
#[derive(Debug, Clone)]
struct ExecutionOutcome {
    content: String,
    provider: String,
    model: String,
    endpoint: &'static str,
    usage: TokenUsage,
    fallback_used: bool,
    retry_attempts: u32,
}

/// Exhausted execution: every eligible provider failed.
#[derive(Debug, Clone)]
struct ExecutionFailure {
    /// Total provider invocations across the whole chain
    attempts: u32,
    /// Providers tried, in order
    providers: Vec<String>,
    last_error: ProviderError,
}

type FailoverOutcome = std::result::Result<ExecutionOutcome, ExecutionFailure>;

// =============================================================================
// Gateway
// =============================================================================

/// Reliability gateway over a set of completion providers.
///
/// Cloning is cheap and shares every underlying component.
#[derive(Clone)]
pub struct CompletionGateway {
    providers: Vec<SharedProvider>,
    default_provider: Option<String>,
    fallback_enabled: bool,
    cache_enabled: bool,
    dedup_enabled: bool,
    hard_budget_limit: bool,
    cache: Arc<ResponseCache>,
    coalescer: RequestCoalescer<FailoverOutcome>,
    retry: RetryPolicy,
    health: Arc<HealthMonitor>,
    usage: Arc<UsageTracker>,
}

impl CompletionGateway {
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::new()
    }

    /// Assemble a gateway from loaded configuration and an open database.
    pub fn from_config(config: &crate::config::Config, db: SharedDatabase) -> Result<Self> {
        let mut builder = Self::builder()
            .database(db)
            .fallback_enabled(config.general.fallback_enabled)
            .cache_enabled(config.cache.enabled)
            .cache_ttl(config.cache.ttl())
            .dedup_enabled(config.dedup.enabled)
            .safety_net(config.dedup.safety_net())
            .retry_policy(config.retry.policy())
            .health_window(config.health.window(), config.health.retention())
            .pricing(config.pricing.price_book())
            .budget_limits(config.budget.limits())
            .user_budget_limits(config.budget.users.clone())
            .budget_thresholds(config.budget.alert_threshold, config.budget.critical_threshold)
            .hard_budget_limit(config.budget.hard_limit);

        if let Some(name) = &config.general.default_provider {
            builder = builder.default_provider(name);
        }
        for settings in &config.providers {
            builder = builder.provider(crate::provider::create_provider(settings)?);
        }

        builder.build()
    }

    /// Run one completion request through the full pipeline.
    pub async fn complete(&self, request: CompletionRequest) -> Result<GatewayResponse> {
        let started = Instant::now();
        request.validate()?;

        let primary = self.primary_provider(&request)?;
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| primary.model().to_string());
        let fingerprint = Fingerprint::compute(primary.name(), &model, &request);
        let user = request
            .user_id
            .clone()
            .unwrap_or_else(|| ANONYMOUS_USER.to_string());

        self.enforce_budget(&user)?;

        if self.cache_enabled && request.use_cache {
            match self.cache.get(&fingerprint) {
                Ok(Some(hit)) => {
                    debug!(fingerprint = %fingerprint, "Serving response from cache");
                    self.record_cache_hit(&request, &user, &hit.provider, &hit.model, started);
                    return Ok(GatewayResponse {
                        content: hit.content,
                        provider: hit.provider,
                        model: hit.model,
                        usage: hit.usage,
                        metadata: RouteMetadata {
                            cached: true,
                            total_duration_ms: started.elapsed().as_millis() as u64,
                            ..RouteMetadata::default()
                        },
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "Cache read failed, continuing without cache");
                }
            }
        }

        let (outcome, deduplicated) = if self.dedup_enabled && request.use_dedupe {
            let gateway = self.clone();
            let exec_request = request.clone();
            let exec_user = user.clone();
            let exec_fingerprint = fingerprint.clone();

            let coalesced = self
                .coalescer
                .run(&fingerprint, move || async move {
                    Ok(gateway
                        .execute_and_record(&exec_request, &exec_user, &exec_fingerprint)
                        .await)
                })
                .await;

            (
                coalesced.result.map_err(LexgateError::Provider)?,
                coalesced.deduplicated,
            )
        } else {
            (
                self.execute_and_record(&request, &user, &fingerprint).await,
                false,
            )
        };

        match outcome {
            Ok(exec) => Ok(GatewayResponse {
                content: exec.content,
                provider: exec.provider,
                model: exec.model,
                usage: exec.usage,
                metadata: RouteMetadata {
                    cached: false,
                    deduplicated,
                    fallback_used: exec.fallback_used,
                    retry_attempts: exec.retry_attempts,
                    total_duration_ms: started.elapsed().as_millis() as u64,
                },
            }),
            Err(failure) if failure.last_error.category == ErrorCategory::InvalidRequest => {
                // The request itself is broken; exhaustion framing would mislead
                Err(LexgateError::Provider(failure.last_error))
            }
            Err(failure) => Err(LexgateError::AllProvidersFailed {
                attempts: failure.attempts,
                providers: failure.providers,
                last_error: failure.last_error,
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Routing
    // -------------------------------------------------------------------------

    /// Provider the request should try first.
    fn primary_provider(&self, request: &CompletionRequest) -> Result<&SharedProvider> {
        let name = request
            .provider
            .as_deref()
            .or(self.default_provider.as_deref());

        match name {
            Some(name) => self
                .providers
                .iter()
                .find(|p| p.name() == name)
                .ok_or_else(|| LexgateError::Validation(format!("Unknown provider '{}'", name))),
            None => self
                .providers
                .first()
                .ok_or_else(|| LexgateError::Config("No providers configured".to_string())),
        }
    }

    /// Full failover order: the primary, then the remaining providers ranked
    /// by recent health. A ranking failure degrades to configuration order.
    fn provider_order(&self, request: &CompletionRequest) -> Result<Vec<SharedProvider>> {
        let primary = self.primary_provider(request)?;
        let mut order = vec![Arc::clone(primary)];

        if !self.fallback_enabled {
            return Ok(order);
        }

        let rest: Vec<String> = self
            .providers
            .iter()
            .filter(|p| p.name() != primary.name())
            .map(|p| p.name().to_string())
            .collect();

        let ranked = match self.health.ranked(&rest) {
            Ok(ranked) => ranked,
            Err(e) => {
                warn!(error = %e, "Health ranking failed, using configured order");
                rest
            }
        };

        for name in ranked {
            if let Some(provider) = self.providers.iter().find(|p| p.name() == name) {
                order.push(Arc::clone(provider));
            }
        }

        Ok(order)
    }

    // -------------------------------------------------------------------------
    // Execution
    // -------------------------------------------------------------------------

    /// Execute with failover, then persist the consequences (cache entry,
    /// usage record) before the result reaches any caller.
    async fn execute_and_record(
        &self,
        request: &CompletionRequest,
        user: &str,
        fingerprint: &Fingerprint,
    ) -> FailoverOutcome {
        let exec_started = Instant::now();
        let outcome = self.execute_with_failover(request).await;
        self.record_outcome(request, user, fingerprint, &outcome, exec_started.elapsed());
        outcome
    }

    /// Walk the provider order, retrying each provider per policy.
    ///
    /// An invalid-request error stops the chain outright: no provider can
    /// fix a malformed request. Everything else moves on to the next
    /// provider, including auth failures, which are often specific to one
    /// provider's credentials.
    async fn execute_with_failover(&self, request: &CompletionRequest) -> FailoverOutcome {
        let order = match self.provider_order(request) {
            Ok(order) => order,
            Err(e) => {
                return Err(ExecutionFailure {
                    attempts: 0,
                    providers: Vec::new(),
                    last_error: ProviderError::internal(e.to_string()),
                });
            }
        };

        let policy = if request.use_retry {
            self.retry.clone()
        } else {
            self.retry.single_attempt()
        };

        let mut total_invocations = 0u32;
        let mut tried: Vec<String> = Vec::new();
        let mut last_error: Option<ProviderError> = None;

        for (position, provider) in order.iter().enumerate() {
            let name = provider.name().to_string();
            tried.push(name.clone());

            let provider_request = crate::provider::ProviderRequest {
                model: request
                    .model
                    .clone()
                    .unwrap_or_else(|| provider.model().to_string()),
                messages: request.messages.clone(),
                temperature: request.normalized_temperature(),
                max_tokens: request.normalized_max_tokens(),
                json_mode: request.json_mode,
            };

            let attempt_provider = Arc::clone(provider);
            let attempt_health = Arc::clone(&self.health);
            let outcome = policy
                .run(&name, move |_attempt| {
                    let provider = Arc::clone(&attempt_provider);
                    let health = Arc::clone(&attempt_health);
                    let provider_request = provider_request.clone();
                    async move {
                        let attempt_started = Instant::now();
                        let result = provider.complete(&provider_request).await;
                        let latency = attempt_started.elapsed();

                        let sample = match &result {
                            Ok(_) => health.record(provider.name(), true, latency, None),
                            Err(e) => {
                                health.record(provider.name(), false, latency, Some(&e.message))
                            }
                        };
                        if let Err(e) = sample {
                            warn!(error = %e, "Health sample write failed");
                        }

                        result
                    }
                })
                .await;

            total_invocations += outcome.attempts;

            match outcome.result {
                Ok(response) => {
                    info!(
                        provider = %name,
                        fallback = position > 0,
                        invocations = total_invocations,
                        "Completion succeeded"
                    );
                    return Ok(ExecutionOutcome {
                        content: response.content,
                        provider: name,
                        model: response.model,
                        endpoint: provider.endpoint(),
                        usage: response.usage,
                        fallback_used: position > 0,
                        retry_attempts: total_invocations.saturating_sub(1),
                    });
                }
                Err(err) => {
                    let stop = !err.should_failover();
                    warn!(
                        provider = %name,
                        category = %err.category,
                        error = %err,
                        "Provider exhausted"
                    );
                    last_error = Some(err);

                    if stop {
                        info!("Request rejected as invalid, not failing over");
                        break;
                    }
                }
            }
        }

        Err(ExecutionFailure {
            attempts: total_invocations,
            providers: tried,
            last_error: last_error
                .unwrap_or_else(|| ProviderError::internal("No providers configured")),
        })
    }

    // -------------------------------------------------------------------------
    // Accounting
    // -------------------------------------------------------------------------

    /// Persist what the execution did. Failures here are logged, never
    /// propagated: the caller already has (or definitely lacks) an answer.
    fn record_outcome(
        &self,
        request: &CompletionRequest,
        user: &str,
        fingerprint: &Fingerprint,
        outcome: &FailoverOutcome,
        duration: Duration,
    ) {
        match outcome {
            Ok(exec) => {
                if self.cache_enabled && request.use_cache {
                    if let Err(e) = self.cache.put(
                        fingerprint,
                        &exec.provider,
                        &exec.model,
                        &exec.content,
                        exec.usage,
                    ) {
                        warn!(error = %e, "Cache write failed");
                    }
                }

                let status = if exec.fallback_used {
                    RequestStatus::Fallback
                } else {
                    RequestStatus::Success
                };
                let entry = UsageEntry {
                    user_id: user.to_string(),
                    matter_ref: request.matter_ref.clone(),
                    provider: exec.provider.clone(),
                    model: exec.model.clone(),
                    endpoint: exec.endpoint.to_string(),
                    usage: exec.usage,
                    duration,
                    status,
                    error: None,
                };
                if let Err(e) = self.usage.log(&entry) {
                    warn!(error = %e, "Usage record write failed");
                }
            }
            Err(failure) => {
                // Attribute the failure to the route that was asked for
                let (provider, model, endpoint) = match self.primary_provider(request) {
                    Ok(primary) => (
                        primary.name().to_string(),
                        request
                            .model
                            .clone()
                            .unwrap_or_else(|| primary.model().to_string()),
                        primary.endpoint().to_string(),
                    ),
                    Err(_) => ("none".to_string(), String::new(), String::new()),
                };

                let entry = UsageEntry {
                    user_id: user.to_string(),
                    matter_ref: request.matter_ref.clone(),
                    provider,
                    model,
                    endpoint,
                    usage: TokenUsage::default(),
                    duration,
                    status: RequestStatus::Error,
                    error: Some(failure.last_error.to_string()),
                };
                if let Err(e) = self.usage.log(&entry) {
                    warn!(error = %e, "Usage record write failed");
                }
            }
        }
    }

    /// Record a zero-cost usage row for a cache hit.
    fn record_cache_hit(
        &self,
        request: &CompletionRequest,
        user: &str,
        provider: &str,
        model: &str,
        started: Instant,
    ) {
        let entry = UsageEntry {
            user_id: user.to_string(),
            matter_ref: request.matter_ref.clone(),
            provider: provider.to_string(),
            model: model.to_string(),
            endpoint: "cache".to_string(),
            usage: TokenUsage::default(),
            duration: started.elapsed(),
            status: RequestStatus::Cached,
            error: None,
        };
        if let Err(e) = self.usage.log(&entry) {
            warn!(error = %e, "Usage record write failed");
        }
    }

    /// Block the request when a hard limit is both configured and blown.
    ///
    /// A broken budget store fails open: a storage outage must not take
    /// completions down with it.
    fn enforce_budget(&self, user: &str) -> Result<()> {
        let checks = match self.usage.check_all_budgets(user) {
            Ok(checks) => checks,
            Err(e) => {
                warn!(error = %e, "Budget check failed, allowing request");
                return Ok(());
            }
        };

        for check in checks {
            if check.status != BudgetStatus::Exceeded {
                continue;
            }
            if self.hard_budget_limit {
                return Err(LexgateError::BudgetExceeded {
                    user: user.to_string(),
                    spent_usd: check.spent_usd,
                    limit_usd: check.limit_usd,
                    period: check.period.as_str().to_string(),
                });
            }
            warn!(
                user,
                period = check.period.as_str(),
                spent_usd = check.spent_usd,
                limit_usd = check.limit_usd,
                "Budget exceeded, proceeding under soft limit"
            );
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Maintenance and Reporting
    // -------------------------------------------------------------------------

    /// Names of all configured providers, in configuration order.
    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    /// Probe each provider's API directly. Returns (name, reachable).
    ///
    /// Probe results land in the same sample table as live traffic, so a
    /// probe sweep refreshes the failover ranking even when idle.
    pub async fn probe_providers(&self) -> Vec<(String, bool)> {
        let mut results = Vec::with_capacity(self.providers.len());
        for provider in &self.providers {
            let started = Instant::now();
            let ok = provider.health_check().await;
            let error = (!ok).then_some("health probe failed");
            if let Err(e) = self
                .health
                .record(provider.name(), ok, started.elapsed(), error)
            {
                warn!(provider = provider.name(), error = %e, "Failed to record probe sample");
            }
            results.push((provider.name().to_string(), ok));
        }
        results
    }

    /// Health summaries over the rolling window, best first.
    pub fn provider_health(&self) -> Result<Vec<ProviderHealth>> {
        self.health.snapshot()
    }

    pub fn cache_stats(&self) -> Result<CacheStats> {
        self.cache.stats()
    }

    /// Delete expired cache entries. Returns the number removed.
    pub fn clean_expired_cache(&self) -> Result<u64> {
        self.cache.clean_expired()
    }

    /// Delete every cache entry. Returns the number removed.
    pub fn clear_cache(&self) -> Result<u64> {
        self.cache.clear()
    }

    /// Drop coalescing entries past the safety net. Returns the number removed.
    pub fn clean_stale_executions(&self) -> usize {
        self.coalescer.clean_stale()
    }

    /// Administrative reset: clear the cache and every coalescing entry.
    /// Returns (cache entries removed, in-flight entries dropped).
    pub fn clear_all(&self) -> Result<(u64, usize)> {
        let cache_removed = self.cache.clear()?;
        let pending_dropped = self.coalescer.clear();
        Ok((cache_removed, pending_dropped))
    }

    /// Executions currently in flight.
    pub fn pending_executions(&self) -> usize {
        self.coalescer.pending_count()
    }

    /// Drop health samples past retention. Returns the number removed.
    pub fn prune_health_samples(&self) -> Result<u64> {
        self.health.prune()
    }

    /// Drop every health sample. Returns the number removed.
    pub fn clear_health_samples(&self) -> Result<u64> {
        self.health.clear()
    }

    /// Usage aggregates over the trailing window.
    pub fn usage_summary(&self, user: Option<&str>, window: Duration) -> Result<UsageSummary> {
        self.usage.summary(user, window)
    }

    /// Budget standing for a user across every period.
    pub fn budget_report(&self, user: &str) -> Result<Vec<BudgetCheck>> {
        self.usage.check_all_budgets(user)
    }

    /// Budget alerts raised for a user within the trailing window.
    pub fn recent_budget_alerts(&self, user: &str, window: Duration) -> Result<Vec<BudgetAlert>> {
        self.usage.recent_alerts(user, window)
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Assembles a gateway from parts; used directly by tests and by
/// configuration loading.
pub struct GatewayBuilder {
    db: Option<SharedDatabase>,
    providers: Vec<SharedProvider>,
    default_provider: Option<String>,
    fallback_enabled: bool,
    cache_enabled: bool,
    cache_ttl: Duration,
    dedup_enabled: bool,
    safety_net: Duration,
    retry: RetryPolicy,
    health_window: Duration,
    health_retention: Duration,
    pricing: PriceBook,
    budget_limits: BudgetLimits,
    user_limits: HashMap<String, BudgetLimits>,
    budget_thresholds: (f64, f64),
    hard_budget_limit: bool,
}

impl GatewayBuilder {
    fn new() -> Self {
        Self {
            db: None,
            providers: Vec::new(),
            default_provider: None,
            fallback_enabled: true,
            cache_enabled: true,
            cache_ttl: Duration::from_secs(cache_constants::DEFAULT_TTL_HOURS * 3600),
            dedup_enabled: true,
            safety_net: Duration::from_secs(dedup_constants::SAFETY_NET_SECS),
            retry: RetryPolicy::default(),
            health_window: Duration::from_secs(health_constants::WINDOW_MINUTES * 60),
            health_retention: Duration::from_secs(health_constants::RETENTION_DAYS * 24 * 3600),
            pricing: PriceBook::builtin(),
            budget_limits: BudgetLimits::default(),
            user_limits: HashMap::new(),
            budget_thresholds: (
                budget_constants::ALERT_THRESHOLD,
                budget_constants::CRITICAL_THRESHOLD,
            ),
            hard_budget_limit: false,
        }
    }

    pub fn database(mut self, db: SharedDatabase) -> Self {
        self.db = Some(db);
        self
    }

    pub fn provider(mut self, provider: SharedProvider) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn default_provider(mut self, name: impl Into<String>) -> Self {
        self.default_provider = Some(name.into());
        self
    }

    pub fn fallback_enabled(mut self, enabled: bool) -> Self {
        self.fallback_enabled = enabled;
        self
    }

    pub fn cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn dedup_enabled(mut self, enabled: bool) -> Self {
        self.dedup_enabled = enabled;
        self
    }

    pub fn safety_net(mut self, safety_net: Duration) -> Self {
        self.safety_net = safety_net;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn health_window(mut self, window: Duration, retention: Duration) -> Self {
        self.health_window = window;
        self.health_retention = retention;
        self
    }

    pub fn pricing(mut self, pricing: PriceBook) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn budget_limits(mut self, limits: BudgetLimits) -> Self {
        self.budget_limits = limits;
        self
    }

    pub fn user_budget_limits(mut self, limits: HashMap<String, BudgetLimits>) -> Self {
        self.user_limits = limits;
        self
    }

    pub fn budget_thresholds(mut self, alert: f64, critical: f64) -> Self {
        self.budget_thresholds = (alert, critical);
        self
    }

    pub fn hard_budget_limit(mut self, hard: bool) -> Self {
        self.hard_budget_limit = hard;
        self
    }

    pub fn build(self) -> Result<CompletionGateway> {
        let db = self
            .db
            .ok_or_else(|| LexgateError::Config("Gateway requires a database".to_string()))?;

        Ok(CompletionGateway {
            providers: self.providers,
            default_provider: self.default_provider,
            fallback_enabled: self.fallback_enabled,
            cache_enabled: self.cache_enabled,
            dedup_enabled: self.dedup_enabled,
            hard_budget_limit: self.hard_budget_limit,
            cache: Arc::new(ResponseCache::new(Arc::clone(&db), self.cache_ttl)),
            coalescer: RequestCoalescer::new(self.safety_net),
            retry: self.retry,
            health: Arc::new(HealthMonitor::new(
                Arc::clone(&db),
                self.health_window,
                self.health_retention,
            )),
            usage: Arc::new(
                UsageTracker::new(db, self.pricing, self.budget_limits, self.user_limits)
                    .with_thresholds(self.budget_thresholds.0, self.budget_thresholds.1),
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{CompletionProvider, ProviderRequest, ProviderResponse};
    use crate::storage::Database;
    use crate::types::Message;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    // =========================================================================
    // Mock Provider
    // =========================================================================

    enum MockBehavior {
        AlwaysOk,
        /// Fail the first N calls with the given category, then succeed
        FailTimes(u32, ErrorCategory),
        AlwaysFail(ErrorCategory),
    }

    struct MockProvider {
        name: String,
        behavior: MockBehavior,
        calls: Arc<AtomicU32>,
        delay: Duration,
    }

    impl MockProvider {
        fn new(name: &str, behavior: MockBehavior) -> (Arc<Self>, Arc<AtomicU32>) {
            let calls = Arc::new(AtomicU32::new(0));
            let provider = Arc::new(Self {
                name: name.to_string(),
                behavior,
                calls: Arc::clone(&calls),
                delay: Duration::ZERO,
            });
            (provider, calls)
        }

        fn with_delay(name: &str, delay: Duration) -> (Arc<Self>, Arc<AtomicU32>) {
            let calls = Arc::new(AtomicU32::new(0));
            let provider = Arc::new(Self {
                name: name.to_string(),
                behavior: MockBehavior::AlwaysOk,
                calls: Arc::clone(&calls),
                delay,
            });
            (provider, calls)
        }
    }

    #[async_trait]
    impl CompletionProvider for MockProvider {
        async fn complete(
            &self,
            request: &ProviderRequest,
        ) -> std::result::Result<ProviderResponse, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            let fail_with = |category: ErrorCategory| {
                ProviderError::with_provider(category, "mock failure", &self.name)
            };

            match &self.behavior {
                MockBehavior::AlwaysOk => {}
                MockBehavior::FailTimes(n, category) => {
                    if call <= *n {
                        return Err(fail_with(*category));
                    }
                }
                MockBehavior::AlwaysFail(category) => return Err(fail_with(*category)),
            }

            Ok(ProviderResponse {
                content: format!("response from {}", self.name),
                model: request.model.clone(),
                usage: TokenUsage::new(10, 5),
            })
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn model(&self) -> &str {
            "mock-model"
        }

        fn endpoint(&self) -> &'static str {
            "mock/completions"
        }

        async fn health_check(&self) -> bool {
            true
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn test_db() -> SharedDatabase {
        let db = Database::open_in_memory().expect("open");
        db.initialize().expect("initialize");
        Arc::new(db)
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Duration::from_millis(1),
            Duration::from_millis(4),
            Duration::from_secs(5),
        )
    }

    fn gateway_with(providers: Vec<SharedProvider>, retry: RetryPolicy) -> CompletionGateway {
        let mut builder = CompletionGateway::builder()
            .database(test_db())
            .retry_policy(retry);
        for provider in providers {
            builder = builder.provider(provider);
        }
        builder.build().expect("gateway")
    }

    fn request(prompt: &str) -> CompletionRequest {
        CompletionRequest::new(vec![Message::user(prompt)]).with_user("alice")
    }

    // =========================================================================
    // Pipeline Tests
    // =========================================================================

    #[tokio::test]
    async fn test_completion_round_trip() {
        let (provider, calls) = MockProvider::new("mock", MockBehavior::AlwaysOk);
        let gateway = gateway_with(vec![provider], fast_retry(3));

        let response = gateway.complete(request("hello")).await.expect("complete");

        assert_eq!(response.content, "response from mock");
        assert_eq!(response.provider, "mock");
        assert_eq!(response.usage.total(), 15);
        assert!(!response.metadata.cached);
        assert!(!response.metadata.deduplicated);
        assert!(!response.metadata.fallback_used);
        assert_eq!(response.metadata.retry_attempts, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let summary = gateway
            .usage_summary(Some("alice"), Duration::from_secs(3600))
            .expect("summary");
        assert_eq!(summary.requests, 1);
        assert_eq!(summary.successes, 1);
    }

    #[tokio::test]
    async fn test_repeat_request_served_from_cache() {
        let (provider, calls) = MockProvider::new("mock", MockBehavior::AlwaysOk);
        let gateway = gateway_with(vec![provider], fast_retry(3));

        let first = gateway.complete(request("same prompt")).await.expect("first");
        let second = gateway
            .complete(request("same prompt"))
            .await
            .expect("second");

        assert!(!first.metadata.cached);
        assert!(second.metadata.cached);
        assert_eq!(second.content, first.content);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // One success row and one zero-cost cached row
        let summary = gateway
            .usage_summary(Some("alice"), Duration::from_secs(3600))
            .expect("summary");
        assert_eq!(summary.requests, 2);
        assert_eq!(summary.successes, 1);
        assert_eq!(summary.cached, 1);
    }

    #[tokio::test]
    async fn test_use_cache_false_bypasses_cache() {
        let (provider, calls) = MockProvider::new("mock", MockBehavior::AlwaysOk);
        let gateway = gateway_with(vec![provider], fast_retry(3));

        let mut req = request("no cache");
        req.use_cache = false;
        gateway.complete(req.clone()).await.expect("first");
        gateway.complete(req).await.expect("second");

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failover_to_next_provider() {
        let (primary, primary_calls) =
            MockProvider::new("primary", MockBehavior::AlwaysFail(ErrorCategory::Upstream));
        let (secondary, secondary_calls) = MockProvider::new("secondary", MockBehavior::AlwaysOk);
        let gateway = gateway_with(vec![primary, secondary], fast_retry(1));

        let response = gateway.complete(request("failover")).await.expect("complete");

        assert_eq!(response.provider, "secondary");
        assert!(response.metadata.fallback_used);
        // Two invocations total: one failed, one succeeded
        assert_eq!(response.metadata.retry_attempts, 1);
        assert_eq!(primary_calls.load(Ordering::SeqCst), 1);
        assert_eq!(secondary_calls.load(Ordering::SeqCst), 1);

        let summary = gateway
            .usage_summary(Some("alice"), Duration::from_secs(3600))
            .expect("summary");
        assert_eq!(summary.fallbacks, 1);
    }

    #[tokio::test]
    async fn test_retry_attempts_counted_across_failures() {
        let (provider, calls) =
            MockProvider::new("mock", MockBehavior::FailTimes(2, ErrorCategory::Upstream));
        let gateway = gateway_with(vec![provider], fast_retry(3));

        let response = gateway.complete(request("flaky")).await.expect("complete");

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(response.metadata.retry_attempts, 2);
        assert!(!response.metadata.fallback_used);
    }

    #[tokio::test]
    async fn test_invalid_request_never_fails_over() {
        let (primary, _) = MockProvider::new(
            "primary",
            MockBehavior::AlwaysFail(ErrorCategory::InvalidRequest),
        );
        let (secondary, secondary_calls) = MockProvider::new("secondary", MockBehavior::AlwaysOk);
        let gateway = gateway_with(vec![primary, secondary], fast_retry(3));

        let err = gateway
            .complete(request("broken"))
            .await
            .err()
            .expect("should fail");

        match err {
            LexgateError::Provider(e) => {
                assert_eq!(e.category, ErrorCategory::InvalidRequest);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(secondary_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_auth_error_skips_to_next_provider() {
        let (primary, primary_calls) =
            MockProvider::new("primary", MockBehavior::AlwaysFail(ErrorCategory::Auth));
        let (secondary, _) = MockProvider::new("secondary", MockBehavior::AlwaysOk);
        let gateway = gateway_with(vec![primary, secondary], fast_retry(3));

        let response = gateway.complete(request("auth")).await.expect("complete");

        assert_eq!(response.provider, "secondary");
        // Auth is not retryable, so the primary is tried exactly once
        assert_eq!(primary_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_all_providers_failed_reports_attempts() {
        let (a, _) = MockProvider::new("a", MockBehavior::AlwaysFail(ErrorCategory::Upstream));
        let (b, _) = MockProvider::new("b", MockBehavior::AlwaysFail(ErrorCategory::Network));
        let gateway = gateway_with(vec![a, b], fast_retry(2));

        let err = gateway
            .complete(request("doomed"))
            .await
            .err()
            .expect("should fail");

        match err {
            LexgateError::AllProvidersFailed {
                attempts,
                providers,
                last_error,
            } => {
                assert_eq!(attempts, 4);
                assert_eq!(providers, vec!["a".to_string(), "b".to_string()]);
                assert_eq!(last_error.category, ErrorCategory::Network);
            }
            other => panic!("unexpected error: {:?}", other),
        }

        let summary = gateway
            .usage_summary(Some("alice"), Duration::from_secs(3600))
            .expect("summary");
        assert_eq!(summary.errors, 1);
    }

    #[tokio::test]
    async fn test_concurrent_identical_requests_deduplicate() {
        let (provider, calls) = MockProvider::with_delay("mock", Duration::from_millis(30));
        let gateway = gateway_with(vec![provider], fast_retry(3));

        let (a, b) = tokio::join!(
            gateway.complete(request("shared")),
            gateway.complete(request("shared")),
        );
        let a = a.expect("a");
        let b = b.expect("b");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.content, b.content);
        let dedup_flags = [a.metadata.deduplicated, b.metadata.deduplicated];
        assert_eq!(dedup_flags.iter().filter(|&&d| d).count(), 1);
    }

    #[tokio::test]
    async fn test_use_dedupe_false_executes_separately() {
        let (provider, calls) = MockProvider::with_delay("mock", Duration::from_millis(30));
        let gateway = gateway_with(vec![provider], fast_retry(3));

        let mut req = request("not shared");
        req.use_dedupe = false;
        req.use_cache = false;

        let (a, b) = tokio::join!(gateway.complete(req.clone()), gateway.complete(req.clone()));
        a.expect("a");
        b.expect("b");

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_provider_is_rejected() {
        let (provider, _) = MockProvider::new("mock", MockBehavior::AlwaysOk);
        let gateway = gateway_with(vec![provider], fast_retry(3));

        let err = gateway
            .complete(request("hello").with_provider("missing"))
            .await
            .err()
            .expect("should fail");
        assert!(matches!(err, LexgateError::Validation(_)));
    }

    #[tokio::test]
    async fn test_hard_budget_limit_blocks_requests() {
        let (provider, calls) = MockProvider::new("mock", MockBehavior::AlwaysOk);
        let gateway = CompletionGateway::builder()
            .database(test_db())
            .provider(provider)
            .retry_policy(fast_retry(3))
            .budget_limits(BudgetLimits {
                daily_usd: 0.000001,
                weekly_usd: 1000.0,
                monthly_usd: 1000.0,
            })
            .hard_budget_limit(true)
            .build()
            .expect("gateway");

        // First request goes through and accrues spend past the tiny limit
        gateway.complete(request("first")).await.expect("first");

        let err = gateway
            .complete(request("second"))
            .await
            .err()
            .expect("should be blocked");
        assert!(matches!(err, LexgateError::BudgetExceeded { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_soft_budget_limit_allows_requests() {
        let (provider, _) = MockProvider::new("mock", MockBehavior::AlwaysOk);
        let gateway = CompletionGateway::builder()
            .database(test_db())
            .provider(provider)
            .retry_policy(fast_retry(3))
            .budget_limits(BudgetLimits {
                daily_usd: 0.000001,
                weekly_usd: 1000.0,
                monthly_usd: 1000.0,
            })
            .build()
            .expect("gateway");

        gateway.complete(request("first")).await.expect("first");
        // Over budget now, but the default soft limit only warns
        gateway.complete(request("second")).await.expect("second");
    }

    #[tokio::test]
    async fn test_explicit_default_provider_preferred() {
        let (first, first_calls) = MockProvider::new("first", MockBehavior::AlwaysOk);
        let (chosen, chosen_calls) = MockProvider::new("chosen", MockBehavior::AlwaysOk);
        let gateway = CompletionGateway::builder()
            .database(test_db())
            .provider(first)
            .provider(chosen)
            .default_provider("chosen")
            .retry_policy(fast_retry(3))
            .build()
            .expect("gateway");

        let response = gateway.complete(request("routed")).await.expect("complete");

        assert_eq!(response.provider, "chosen");
        assert_eq!(chosen_calls.load(Ordering::SeqCst), 1);
        assert_eq!(first_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_message_list_rejected_before_execution() {
        let (provider, calls) = MockProvider::new("mock", MockBehavior::AlwaysOk);
        let gateway = gateway_with(vec![provider], fast_retry(3));

        let err = gateway
            .complete(CompletionRequest::new(vec![]))
            .await
            .err()
            .expect("should fail");
        assert!(matches!(err, LexgateError::Validation(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_health_samples_recorded_per_attempt() {
        let (provider, _) =
            MockProvider::new("mock", MockBehavior::FailTimes(1, ErrorCategory::Upstream));
        let gateway = gateway_with(vec![provider], fast_retry(2));

        gateway.complete(request("sampled")).await.expect("complete");

        let health = gateway.provider_health().expect("health");
        assert_eq!(health.len(), 1);
        assert_eq!(health[0].provider, "mock");
        assert_eq!(health[0].samples, 2);
        assert_eq!(health[0].successes, 1);
    }

    #[tokio::test]
    async fn test_fallback_disabled_stops_at_primary() {
        let (primary, _) =
            MockProvider::new("primary", MockBehavior::AlwaysFail(ErrorCategory::Upstream));
        let (secondary, secondary_calls) = MockProvider::new("secondary", MockBehavior::AlwaysOk);
        let gateway = CompletionGateway::builder()
            .database(test_db())
            .provider(primary)
            .provider(secondary)
            .fallback_enabled(false)
            .retry_policy(fast_retry(1))
            .build()
            .expect("gateway");

        let err = gateway
            .complete(request("no fallback"))
            .await
            .err()
            .expect("should fail");
        assert!(matches!(err, LexgateError::AllProvidersFailed { .. }));
        assert_eq!(secondary_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_clear_all_forces_fresh_execution() {
        let (provider, calls) = MockProvider::new("mock", MockBehavior::AlwaysOk);
        let gateway = gateway_with(vec![provider], fast_retry(1));

        gateway.complete(request("reset me")).await.expect("first");
        let (cache_removed, pending_dropped) = gateway.clear_all().expect("clear");
        assert_eq!(cache_removed, 1);
        assert_eq!(pending_dropped, 0);

        let response = gateway.complete(request("reset me")).await.expect("second");
        assert!(!response.metadata.cached);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
