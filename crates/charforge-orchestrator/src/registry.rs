//! Provider registry and health tracking.
//!
//! The registry owns every configured provider together with its priority,
//! its admin flag, its [`ProviderHealth`] and its [`CircuitBreaker`]. The
//! orchestrator asks it for a ranked candidate list per generation and
//! reports every attempt back through [`ProviderRegistry::record_outcome`].
//!
//! Two levels of exclusion apply:
//!
//! - **Unhealthy** after `unhealthyThreshold` consecutive failures. The
//!   provider is skipped when ranking but a later health check that passes
//!   brings it back.
//! - **Disabled** after `disableThreshold` consecutive failures. Disabled
//!   providers are neither ranked nor probed until [`ProviderRegistry::enable`]
//!   is called.

use std::sync::Arc;
use std::time::Duration;

use charforge_providers::{
    HttpImageProvider, HttpProviderConfig, ImageProvider, MockProvider, ProviderError,
    ProviderErrorKind,
};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::circuit_breaker::{BreakerSettings, BreakerSnapshot, CircuitBreaker};
use crate::config::{Config, ProviderEntry, ProviderKind, RegistryConfig};
use crate::error::{ForgeError, Result};

// ============================================================================
// Health
// ============================================================================

/// Request statistics and health flag for one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderHealth {
    /// Attempts reported so far.
    pub total_requests: u64,
    /// Attempts that succeeded.
    pub successful_requests: u64,
    /// Attempts that failed.
    pub failed_requests: u64,
    /// Mean attempt latency in milliseconds.
    pub average_response_time_ms: f64,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Whether the provider is considered for ranking.
    pub is_healthy: bool,
    /// Time of the last success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success: Option<DateTime<Utc>>,
    /// Time of the last failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<DateTime<Utc>>,
}

impl Default for ProviderHealth {
    fn default() -> Self {
        Self {
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            average_response_time_ms: 0.0,
            consecutive_failures: 0,
            is_healthy: true,
            last_success: None,
            last_failure: None,
        }
    }
}

impl ProviderHealth {
    /// Fraction of attempts that succeeded, or 1.0 before any attempt.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            1.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn observe_latency(&mut self, latency: Duration) {
        self.total_requests += 1;
        let sample = latency.as_secs_f64() * 1000.0;
        self.average_response_time_ms +=
            (sample - self.average_response_time_ms) / self.total_requests as f64;
    }

    fn record_success(&mut self, latency: Duration) {
        self.observe_latency(latency);
        self.successful_requests += 1;
        self.consecutive_failures = 0;
        self.is_healthy = true;
        self.last_success = Some(Utc::now());
    }

    fn record_failure(&mut self, latency: Duration) {
        self.observe_latency(latency);
        self.failed_requests += 1;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure = Some(Utc::now());
    }
}

// ============================================================================
// Registry
// ============================================================================

/// A provider selected for one generation.
#[derive(Clone)]
pub struct RankedProvider {
    /// Provider name.
    pub name: String,
    /// Ranking priority; lower is preferred.
    pub priority: u32,
    /// The provider itself.
    pub provider: Arc<dyn ImageProvider>,
    /// The provider's circuit breaker.
    pub breaker: Arc<CircuitBreaker>,
}

impl std::fmt::Debug for RankedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RankedProvider")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Observable state of one registered provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    /// Provider name.
    pub name: String,
    /// Ranking priority.
    pub priority: u32,
    /// Admin flag.
    pub enabled: bool,
    /// Request statistics.
    pub health: ProviderHealth,
    /// Circuit breaker state.
    pub circuit: BreakerSnapshot,
}

struct Registered {
    provider: Arc<dyn ImageProvider>,
    priority: u32,
    enabled: bool,
    health: ProviderHealth,
    breaker: Arc<CircuitBreaker>,
}

impl Registered {
    fn name(&self) -> &str {
        self.provider.name()
    }

    fn ranked(&self) -> RankedProvider {
        RankedProvider {
            name: self.name().to_string(),
            priority: self.priority,
            provider: Arc::clone(&self.provider),
            breaker: Arc::clone(&self.breaker),
        }
    }
}

/// Registry of image providers.
pub struct ProviderRegistry {
    settings: RegistryConfig,
    breaker_settings: BreakerSettings,
    providers: RwLock<Vec<Registered>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("settings", &self.settings)
            .field("breaker_settings", &self.breaker_settings)
            .finish_non_exhaustive()
    }
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(settings: RegistryConfig, breaker_settings: BreakerSettings) -> Self {
        Self {
            settings,
            breaker_settings,
            providers: RwLock::new(Vec::new()),
        }
    }

    /// Builds a registry holding every provider listed in `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if a provider cannot be constructed or two providers
    /// share a name.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let registry = Self::new(
            config.registry.clone(),
            BreakerSettings::from(&config.circuit_breaker),
        );
        for entry in &config.providers {
            let provider = build_provider(entry)?;
            registry
                .register(provider, entry.priority, entry.enabled)
                .await?;
        }
        Ok(registry)
    }

    /// Adds a provider.
    ///
    /// # Errors
    ///
    /// Returns `ConfigValidationError` if the name is already registered.
    pub async fn register(
        &self,
        provider: Arc<dyn ImageProvider>,
        priority: u32,
        enabled: bool,
    ) -> Result<()> {
        let mut providers = self.providers.write().await;
        let name = provider.name().to_string();
        if providers.iter().any(|p| p.name() == name) {
            return Err(ForgeError::config_validation(
                format!("provider '{name}' is registered twice"),
                "Give every provider a unique name",
            ));
        }
        let breaker = Arc::new(CircuitBreaker::new(&name, self.breaker_settings));
        providers.push(Registered {
            provider,
            priority,
            enabled,
            health: ProviderHealth::default(),
            breaker,
        });
        debug!(provider = %name, priority, enabled, "Registered provider");
        Ok(())
    }

    /// Number of registered providers, enabled or not.
    pub async fn len(&self) -> usize {
        self.providers.read().await.len()
    }

    /// Returns `true` if nothing is registered.
    pub async fn is_empty(&self) -> bool {
        self.providers.read().await.is_empty()
    }

    /// Returns the providers to try, best first.
    ///
    /// Candidates are enabled and healthy providers ordered by priority
    /// (registration order breaks ties) whose availability probe passes.
    /// Probes run concurrently and without the registry lock held.
    pub async fn available_providers(&self) -> Vec<RankedProvider> {
        let mut candidates: Vec<RankedProvider> = {
            let providers = self.providers.read().await;
            providers
                .iter()
                .filter(|p| p.enabled && p.health.is_healthy)
                .map(Registered::ranked)
                .collect()
        };
        candidates.sort_by_key(|c| c.priority);

        let probes = join_all(candidates.iter().map(|c| c.provider.is_available())).await;
        candidates
            .into_iter()
            .zip(probes)
            .filter_map(|(candidate, available)| {
                if !available {
                    debug!(provider = %candidate.name, "Provider failed availability probe");
                }
                available.then_some(candidate)
            })
            .collect()
    }

    /// Records the outcome of one provider attempt.
    ///
    /// Failures caused by the request itself are not held against the
    /// provider. Reaching `unhealthyThreshold` consecutive failures marks
    /// the provider unhealthy; reaching `disableThreshold` disables it.
    pub async fn record_outcome(
        &self,
        name: &str,
        outcome: std::result::Result<(), &ProviderError>,
        latency: Duration,
    ) {
        if let Err(error) = outcome {
            if !error.counts_against_provider() {
                debug!(provider = name, kind = %error.kind, "Not counting request defect against provider");
                return;
            }
        }

        let mut providers = self.providers.write().await;
        let Some(entry) = providers.iter_mut().find(|p| p.name() == name) else {
            warn!(provider = name, "Outcome reported for unknown provider");
            return;
        };

        if outcome.is_ok() {
            if !entry.health.is_healthy {
                info!(provider = name, "Provider healthy again");
            }
            entry.health.record_success(latency);
            return;
        }

        entry.health.record_failure(latency);
        let failures = entry.health.consecutive_failures;
        if failures >= self.settings.unhealthy_threshold && entry.health.is_healthy {
            entry.health.is_healthy = false;
            warn!(provider = name, consecutive_failures = failures, "Provider marked unhealthy");
        }
        if failures >= self.settings.disable_threshold && entry.enabled {
            entry.enabled = false;
            warn!(
                provider = name,
                consecutive_failures = failures,
                "Provider disabled; re-enable it explicitly once fixed"
            );
        }
    }

    /// Re-enables a provider, clearing its health history and breaker.
    ///
    /// Returns `false` if no provider has that name.
    pub async fn enable(&self, name: &str) -> bool {
        let breaker = {
            let mut providers = self.providers.write().await;
            let Some(entry) = providers.iter_mut().find(|p| p.name() == name) else {
                return false;
            };
            entry.enabled = true;
            entry.health = ProviderHealth::default();
            Arc::clone(&entry.breaker)
        };
        breaker.reset();
        info!(provider = name, "Provider enabled");
        true
    }

    /// Disables a provider. Returns `false` if no provider has that name.
    pub async fn disable(&self, name: &str) -> bool {
        let mut providers = self.providers.write().await;
        let Some(entry) = providers.iter_mut().find(|p| p.name() == name) else {
            return false;
        };
        entry.enabled = false;
        info!(provider = name, "Provider disabled");
        true
    }

    /// Health statistics for one provider.
    pub async fn health(&self, name: &str) -> Option<ProviderHealth> {
        self.providers
            .read()
            .await
            .iter()
            .find(|p| p.name() == name)
            .map(|p| p.health.clone())
    }

    /// Whether `name` is enabled, or `None` if it is not registered.
    pub async fn is_enabled(&self, name: &str) -> Option<bool> {
        self.providers
            .read()
            .await
            .iter()
            .find(|p| p.name() == name)
            .map(|p| p.enabled)
    }

    /// Probes every enabled provider and updates its health flag.
    ///
    /// A passing probe makes an unhealthy provider eligible again but keeps
    /// its consecutive failure count, so a provider that answers probes and
    /// still fails generations is eventually disabled. Only a successful
    /// generation resets the count. Disabled providers are skipped. Returns
    /// the number of healthy providers.
    pub async fn run_health_checks(&self) -> usize {
        let targets: Vec<(String, Arc<dyn ImageProvider>)> = {
            let providers = self.providers.read().await;
            providers
                .iter()
                .filter(|p| p.enabled)
                .map(|p| (p.name().to_string(), Arc::clone(&p.provider)))
                .collect()
        };

        let probes = join_all(targets.iter().map(|(_, p)| p.is_available())).await;

        let mut providers = self.providers.write().await;
        let mut healthy = 0;
        for ((name, _), available) in targets.iter().zip(probes) {
            let Some(entry) = providers.iter_mut().find(|p| p.name() == name) else {
                continue;
            };
            if !entry.enabled {
                continue;
            }
            if available && !entry.health.is_healthy {
                info!(
                    provider = %name,
                    consecutive_failures = entry.health.consecutive_failures,
                    "Health check passed, provider back in rotation"
                );
            } else if !available && entry.health.is_healthy {
                warn!(provider = %name, "Health check failed, provider out of rotation");
            }
            entry.health.is_healthy = available;
            if available {
                healthy += 1;
            }
        }
        debug!(healthy, probed = targets.len(), "Health checks complete");
        healthy
    }

    /// Runs [`Self::run_health_checks`] every `interval` until aborted.
    pub fn spawn_health_monitor(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                registry.run_health_checks().await;
            }
        })
    }

    /// Status of every provider, ordered by priority.
    pub async fn snapshot(&self) -> Vec<ProviderStatus> {
        let mut statuses: Vec<ProviderStatus> = self
            .providers
            .read()
            .await
            .iter()
            .map(|p| ProviderStatus {
                name: p.name().to_string(),
                priority: p.priority,
                enabled: p.enabled,
                health: p.health.clone(),
                circuit: p.breaker.snapshot(),
            })
            .collect();
        statuses.sort_by_key(|s| s.priority);
        statuses
    }
}

/// Constructs the adapter described by `entry`.
///
/// # Errors
///
/// Returns `ConfigValidationError` if the HTTP client cannot be built.
pub fn build_provider(entry: &ProviderEntry) -> Result<Arc<dyn ImageProvider>> {
    match &entry.provider {
        ProviderKind::Http {
            endpoint,
            health_endpoint,
            api_key_env,
            timeout_secs,
        } => {
            let api_key = api_key_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok());
            if api_key_env.is_some() && api_key.is_none() {
                warn!(provider = %entry.name, "API key environment variable is not set");
            }
            let provider = HttpImageProvider::new(
                &entry.name,
                HttpProviderConfig {
                    endpoint: endpoint.clone(),
                    health_endpoint: health_endpoint.clone(),
                    api_key,
                    timeout: Duration::from_secs(*timeout_secs),
                },
            )
            .map_err(|e| {
                ForgeError::config_validation(
                    format!("cannot build provider '{}': {}", entry.name, e.message),
                    "Check the provider's endpoint and TLS settings",
                )
            })?;
            Ok(Arc::new(provider))
        }
        ProviderKind::Mock {
            latency_ms,
            fail_first,
            fail_with,
        } => {
            let kind = fail_with.unwrap_or(ProviderErrorKind::ServiceUnavailable);
            let provider = MockProvider::new(&entry.name)
                .with_latency(Duration::from_millis(*latency_ms))
                .fail_first(*fail_first, kind);
            Ok(Arc::new(provider))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use charforge_providers::MockProvider;

    use super::*;
    use crate::circuit_breaker::CircuitState;

    fn registry() -> ProviderRegistry {
        ProviderRegistry::new(RegistryConfig::default(), BreakerSettings::default())
    }

    fn failure(kind: ProviderErrorKind) -> ProviderError {
        ProviderError::new(kind, "a", "boom")
    }

    async fn register_mock(registry: &ProviderRegistry, name: &str, priority: u32) -> Arc<MockProvider> {
        let mock = Arc::new(MockProvider::new(name));
        registry
            .register(Arc::clone(&mock) as Arc<dyn ImageProvider>, priority, true)
            .await
            .unwrap();
        mock
    }

    fn names(ranked: &[RankedProvider]) -> Vec<&str> {
        ranked.iter().map(|r| r.name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_available_providers_sorted_by_priority() {
        let registry = registry();
        register_mock(&registry, "slow", 20).await;
        register_mock(&registry, "primary", 1).await;
        register_mock(&registry, "backup", 10).await;

        let ranked = registry.available_providers().await;
        assert_eq!(names(&ranked), vec!["primary", "backup", "slow"]);
    }

    #[tokio::test]
    async fn test_equal_priority_keeps_registration_order() {
        let registry = registry();
        register_mock(&registry, "first", 5).await;
        register_mock(&registry, "second", 5).await;

        assert_eq!(names(&registry.available_providers().await), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_failed_probe_excludes_provider() {
        let registry = registry();
        let a = register_mock(&registry, "a", 1).await;
        register_mock(&registry, "b", 2).await;

        a.set_available(false);
        assert_eq!(names(&registry.available_providers().await), vec!["b"]);
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let registry = registry();
        register_mock(&registry, "a", 1).await;
        let result = registry
            .register(Arc::new(MockProvider::new("a")), 2, true)
            .await;
        assert!(matches!(result, Err(ForgeError::ConfigValidationError { .. })));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_statistics_and_average_latency() {
        let registry = registry();
        register_mock(&registry, "a", 1).await;

        registry
            .record_outcome("a", Ok(()), Duration::from_millis(100))
            .await;
        registry
            .record_outcome(
                "a",
                Err(&failure(ProviderErrorKind::Timeout)),
                Duration::from_millis(300),
            )
            .await;

        let health = registry.health("a").await.unwrap();
        assert_eq!(health.total_requests, 2);
        assert_eq!(health.successful_requests, 1);
        assert_eq!(health.failed_requests, 1);
        assert_eq!(health.consecutive_failures, 1);
        assert!((health.average_response_time_ms - 200.0).abs() < 1e-6);
        assert!((health.success_rate() - 0.5).abs() < f64::EPSILON);
        assert!(health.last_success.is_some());
        assert!(health.last_failure.is_some());
    }

    #[tokio::test]
    async fn test_unhealthy_then_disabled() {
        let registry = registry();
        register_mock(&registry, "a", 1).await;
        register_mock(&registry, "b", 2).await;
        let err = failure(ProviderErrorKind::ServiceUnavailable);

        for _ in 0..3 {
            registry.record_outcome("a", Err(&err), Duration::ZERO).await;
        }
        let health = registry.health("a").await.unwrap();
        assert!(!health.is_healthy);
        assert_eq!(registry.is_enabled("a").await, Some(true));
        assert_eq!(names(&registry.available_providers().await), vec!["b"]);

        for _ in 0..2 {
            registry.record_outcome("a", Err(&err), Duration::ZERO).await;
        }
        assert_eq!(registry.is_enabled("a").await, Some(false));
    }

    #[tokio::test]
    async fn test_disabled_provider_stays_disabled_after_health_check() {
        let registry = registry();
        register_mock(&registry, "a", 1).await;
        let err = failure(ProviderErrorKind::ServiceUnavailable);
        for _ in 0..5 {
            registry.record_outcome("a", Err(&err), Duration::ZERO).await;
        }

        assert_eq!(registry.run_health_checks().await, 0);
        assert_eq!(registry.is_enabled("a").await, Some(false));
        assert!(registry.available_providers().await.is_empty());

        assert!(registry.enable("a").await);
        let health = registry.health("a").await.unwrap();
        assert!(health.is_healthy);
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(names(&registry.available_providers().await), vec!["a"]);
    }

    #[tokio::test]
    async fn test_request_defects_do_not_count() {
        let registry = registry();
        register_mock(&registry, "a", 1).await;

        for _ in 0..10 {
            registry
                .record_outcome(
                    "a",
                    Err(&failure(ProviderErrorKind::ContentPolicyViolation)),
                    Duration::ZERO,
                )
                .await;
        }
        let health = registry.health("a").await.unwrap();
        assert_eq!(health.total_requests, 0);
        assert!(health.is_healthy);
        assert_eq!(registry.is_enabled("a").await, Some(true));
    }

    #[tokio::test]
    async fn test_health_check_restores_unhealthy_provider() {
        let registry = registry();
        let a = register_mock(&registry, "a", 1).await;
        let err = failure(ProviderErrorKind::Timeout);
        for _ in 0..3 {
            registry.record_outcome("a", Err(&err), Duration::ZERO).await;
        }
        assert!(registry.available_providers().await.is_empty());

        a.set_available(false);
        assert_eq!(registry.run_health_checks().await, 0);
        assert!(!registry.health("a").await.unwrap().is_healthy);

        a.set_available(true);
        assert_eq!(registry.run_health_checks().await, 1);
        let health = registry.health("a").await.unwrap();
        assert!(health.is_healthy);
        assert_eq!(health.consecutive_failures, 3);
        assert_eq!(names(&registry.available_providers().await), vec!["a"]);

        registry.record_outcome("a", Ok(()), Duration::ZERO).await;
        assert_eq!(registry.health("a").await.unwrap().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_passing_probe_does_not_prevent_disable() {
        let registry = registry();
        register_mock(&registry, "a", 1).await;
        let err = failure(ProviderErrorKind::ServiceUnavailable);

        for _ in 0..3 {
            registry.record_outcome("a", Err(&err), Duration::ZERO).await;
        }
        assert_eq!(registry.run_health_checks().await, 1);
        for _ in 0..2 {
            registry.record_outcome("a", Err(&err), Duration::ZERO).await;
        }

        assert_eq!(registry.is_enabled("a").await, Some(false));
        assert!(registry.available_providers().await.is_empty());
    }

    #[tokio::test]
    async fn test_enable_resets_breaker() {
        let registry = registry();
        register_mock(&registry, "a", 1).await;
        let breaker = registry.available_providers().await[0].breaker.clone();

        for _ in 0..5 {
            let _ = breaker
                .execute(|| async {
                    Err::<(), _>(ForgeError::Provider(failure(ProviderErrorKind::Timeout)))
                })
                .await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        registry.disable("a").await;
        registry.enable("a").await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_unknown_names() {
        let registry = registry();
        assert!(!registry.enable("ghost").await);
        assert!(!registry.disable("ghost").await);
        assert!(registry.health("ghost").await.is_none());
        registry
            .record_outcome("ghost", Ok(()), Duration::ZERO)
            .await;
    }

    #[tokio::test]
    async fn test_snapshot_reports_breaker_state() {
        let registry = registry();
        register_mock(&registry, "b", 2).await;
        register_mock(&registry, "a", 1).await;
        registry.disable("b").await;

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].name, "a");
        assert!(!snapshot[1].enabled);
        assert_eq!(snapshot[0].circuit.state, CircuitState::Closed);

        let json = serde_json::to_value(&snapshot[0]).unwrap();
        assert_eq!(json["health"]["isHealthy"], true);
        assert_eq!(json["circuit"]["state"], "CLOSED");
    }

    #[tokio::test]
    async fn test_from_config_builds_default_mock() {
        let registry = ProviderRegistry::from_config(&Config::default()).await.unwrap();
        assert_eq!(names(&registry.available_providers().await), vec!["mock"]);
    }

    #[tokio::test]
    async fn test_health_monitor_runs_checks() {
        let registry = Arc::new(registry());
        let a = register_mock(&registry, "a", 1).await;
        a.set_available(false);

        let handle = registry.spawn_health_monitor(Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();

        assert!(!registry.health("a").await.unwrap().is_healthy);
    }
}
