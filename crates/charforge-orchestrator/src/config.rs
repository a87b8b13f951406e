//! Configuration types for the Charforge orchestrator.
//!
//! Configuration is read from `charforge.json`. Every field has a default, so
//! an empty object (or no file at all) yields a working setup backed by a
//! single mock provider.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ForgeError, Result};

/// The default config file name.
const CONFIG_FILE_NAME: &str = "charforge.json";

const fn default_max_attempts() -> u32 {
    3
}

const fn default_base_delay_ms() -> u64 {
    1000
}

const fn default_max_delay_ms() -> u64 {
    30_000
}

const fn default_backoff_multiplier() -> f64 {
    2.0
}

const fn default_jitter_ratio() -> f64 {
    0.1
}

const fn default_attempt_timeout_ms() -> u64 {
    60_000
}

const fn default_failure_threshold() -> u32 {
    5
}

const fn default_monitoring_window_secs() -> u64 {
    60
}

const fn default_recovery_timeout_secs() -> u64 {
    30
}

const fn default_success_threshold() -> u32 {
    2
}

const fn default_disable_threshold() -> u32 {
    5
}

const fn default_unhealthy_threshold() -> u32 {
    3
}

const fn default_health_check_interval_secs() -> u64 {
    60
}

const fn default_cache_max_age_days() -> u32 {
    30
}

const fn default_cache_max_entries() -> usize {
    1000
}

const fn default_operation_timeout_secs() -> u64 {
    300
}

const fn default_estimated_duration_secs() -> u64 {
    30
}

const fn default_event_capacity() -> usize {
    100
}

fn default_storage_dir() -> String {
    ".charforge/images".to_string()
}

fn default_records_file() -> String {
    ".charforge/records.json".to_string()
}

const fn default_true() -> bool {
    true
}

const fn default_provider_timeout_secs() -> u64 {
    120
}

fn default_providers() -> Vec<ProviderEntry> {
    vec![ProviderEntry {
        name: "mock".to_string(),
        priority: 0,
        enabled: true,
        provider: ProviderKind::Mock {
            latency_ms: 0,
            fail_first: 0,
            fail_with: None,
        },
    }]
}

// ============================================================================
// Top-level Config
// ============================================================================

/// Main configuration for the generation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Retry manager settings.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Per-provider circuit breaker settings.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Provider registry settings.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Prompt cache eviction settings.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Ceiling on provider generation, across retries and failover.
    /// Fetching and storing the finished image is not bounded by it.
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,

    /// Fixed estimate used for `estimatedCompletion` on pending records.
    #[serde(default = "default_estimated_duration_secs")]
    pub estimated_duration_secs: u64,

    /// Capacity of the lifecycle event channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Image storage settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Path of the JSON file holding generation records.
    #[serde(default = "default_records_file")]
    pub records_file: String,

    /// Optional catalog file; the built-in catalog is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog: Option<String>,

    /// Registered image providers.
    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            registry: RegistryConfig::default(),
            cache: CacheConfig::default(),
            operation_timeout_secs: default_operation_timeout_secs(),
            estimated_duration_secs: default_estimated_duration_secs(),
            event_capacity: default_event_capacity(),
            storage: StorageConfig::default(),
            records_file: default_records_file(),
            catalog: None,
            providers: default_providers(),
        }
    }
}

impl Config {
    /// Loads configuration from the current working directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but contains invalid JSON.
    pub fn load() -> Result<Self> {
        let current_dir = std::env::current_dir().map_err(|e| {
            ForgeError::config_parse(
                "<current directory>",
                format!("cannot determine current directory: {e}"),
            )
        })?;
        Self::load_from_dir(&current_dir)
    }

    /// Loads `charforge.json` from a specific directory.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        Self::load_from_file(&dir.join(CONFIG_FILE_NAME))
    }

    /// Loads configuration from a specific file path.
    ///
    /// If the file does not exist, returns the default configuration.
    ///
    /// # Errors
    ///
    /// Returns `ForgeError::ConfigParseError` if the file exists but contains
    /// invalid JSON, and `ForgeError::ConfigValidationError` if values are
    /// out of range.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.validate()?;
                return Ok(config);
            }
            Err(e) => {
                return Err(ForgeError::config_parse(
                    path,
                    format!("failed to read file: {e}"),
                ));
            }
        };

        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| ForgeError::config_parse(path, e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ForgeError::ConfigValidationError` on the first failing check.
    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        self.circuit_breaker.validate()?;
        self.registry.validate()?;

        if self.cache.max_entries == 0 {
            return Err(ForgeError::config_validation(
                "cache.maxEntries must be greater than 0",
                "Set cache.maxEntries to at least 1 in your charforge.json",
            ));
        }

        if self.operation_timeout_secs == 0 {
            return Err(ForgeError::config_validation(
                "operationTimeoutSecs must be greater than 0",
                "Set operationTimeoutSecs to at least 1 second in your charforge.json",
            ));
        }

        if self.event_capacity == 0 {
            return Err(ForgeError::config_validation(
                "eventCapacity must be greater than 0",
                "Set eventCapacity to at least 1 in your charforge.json",
            ));
        }

        if self.storage.dir.trim().is_empty() {
            return Err(ForgeError::config_validation(
                "storage.dir must not be empty",
                "Provide a directory for generated images in your charforge.json",
            ));
        }

        if self.records_file.trim().is_empty() {
            return Err(ForgeError::config_validation(
                "recordsFile must not be empty",
                "Provide a path for the generation records in your charforge.json",
            ));
        }

        if self.providers.is_empty() {
            return Err(ForgeError::config_validation(
                "at least one provider must be configured",
                "Add an entry to 'providers' in your charforge.json",
            ));
        }

        let mut names = std::collections::BTreeSet::new();
        for entry in &self.providers {
            if entry.name.trim().is_empty() {
                return Err(ForgeError::config_validation(
                    "provider name must not be empty",
                    "Give every entry in 'providers' a unique name",
                ));
            }
            if !names.insert(entry.name.as_str()) {
                return Err(ForgeError::config_validation(
                    format!("duplicate provider name '{}'", entry.name),
                    "Give every entry in 'providers' a unique name",
                ));
            }
            if let ProviderKind::Http { endpoint, .. } = &entry.provider {
                if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                    return Err(ForgeError::config_validation(
                        format!("provider '{}' has an invalid endpoint '{endpoint}'", entry.name),
                        "Use an absolute http:// or https:// URL",
                    ));
                }
            }
        }

        Ok(())
    }

    /// Returns the operation timeout as a `Duration`.
    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    /// Returns the pending-duration estimate as a `Duration`.
    #[must_use]
    pub const fn estimated_duration(&self) -> Duration {
        Duration::from_secs(self.estimated_duration_secs)
    }

    /// Returns the records file path.
    #[must_use]
    pub fn records_path(&self) -> PathBuf {
        PathBuf::from(&self.records_file)
    }
}

// ============================================================================
// Sections
// ============================================================================

/// Retry manager settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Attempts per provider, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound on any single delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Growth factor between consecutive delays.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Maximum jitter as a fraction of the computed delay.
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,

    /// Timeout applied to each individual attempt.
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_ratio: default_jitter_ratio(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
        }
    }
}

impl RetryConfig {
    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(ForgeError::config_validation(
                "retry.maxAttempts must be greater than 0",
                "Set retry.maxAttempts to at least 1 in your charforge.json",
            ));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(ForgeError::config_validation(
                "retry.backoffMultiplier must be at least 1.0",
                "Use 2.0 for classic exponential backoff",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(ForgeError::config_validation(
                "retry.jitterRatio must be between 0.0 and 1.0",
                "Use 0.1 for up to 10% jitter",
            ));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(ForgeError::config_validation(
                "retry.baseDelayMs must not exceed retry.maxDelayMs",
                "Lower baseDelayMs or raise maxDelayMs",
            ));
        }
        if self.attempt_timeout_ms == 0 {
            return Err(ForgeError::config_validation(
                "retry.attemptTimeoutMs must be greater than 0",
                "Set retry.attemptTimeoutMs to at least 1 in your charforge.json",
            ));
        }
        Ok(())
    }
}

/// Circuit breaker settings, shared by every provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    /// Failures within the window that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Length of the rolling failure window.
    #[serde(default = "default_monitoring_window_secs")]
    pub monitoring_window_secs: u64,

    /// How long the circuit stays open before probing.
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,

    /// Consecutive half-open successes that close the circuit.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            monitoring_window_secs: default_monitoring_window_secs(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            success_threshold: default_success_threshold(),
        }
    }
}

impl CircuitBreakerConfig {
    fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 || self.success_threshold == 0 {
            return Err(ForgeError::config_validation(
                "circuitBreaker thresholds must be greater than 0",
                "Set circuitBreaker.failureThreshold and successThreshold to at least 1",
            ));
        }
        if self.monitoring_window_secs == 0 {
            return Err(ForgeError::config_validation(
                "circuitBreaker.monitoringWindowSecs must be greater than 0",
                "Set circuitBreaker.monitoringWindowSecs to at least 1 second",
            ));
        }
        Ok(())
    }
}

/// Provider registry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    /// Consecutive failures after which a provider is disabled.
    #[serde(default = "default_disable_threshold")]
    pub disable_threshold: u32,

    /// Consecutive failures after which a provider is marked unhealthy.
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,

    /// Interval between background health checks.
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            disable_threshold: default_disable_threshold(),
            unhealthy_threshold: default_unhealthy_threshold(),
            health_check_interval_secs: default_health_check_interval_secs(),
        }
    }
}

impl RegistryConfig {
    fn validate(&self) -> Result<()> {
        if self.unhealthy_threshold == 0 || self.disable_threshold == 0 {
            return Err(ForgeError::config_validation(
                "registry thresholds must be greater than 0",
                "Set registry.unhealthyThreshold and disableThreshold to at least 1",
            ));
        }
        if self.unhealthy_threshold > self.disable_threshold {
            return Err(ForgeError::config_validation(
                "registry.unhealthyThreshold must not exceed registry.disableThreshold",
                "A provider should be marked unhealthy before it is disabled",
            ));
        }
        Ok(())
    }

    /// Returns the health check interval as a `Duration`.
    #[must_use]
    pub const fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

/// Prompt cache eviction settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    /// Entries unused for longer than this are evicted.
    #[serde(default = "default_cache_max_age_days")]
    pub max_age_days: u32,

    /// Only the most used entries up to this count are retained.
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age_days: default_cache_max_age_days(),
            max_entries: default_cache_max_entries(),
        }
    }
}

/// Image storage settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// Directory generated images are written to.
    #[serde(default = "default_storage_dir")]
    pub dir: String,

    /// Base URL the directory is served from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_base_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: default_storage_dir(),
            public_base_url: None,
        }
    }
}

// ============================================================================
// Providers
// ============================================================================

/// One registered provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderEntry {
    /// Unique provider name.
    pub name: String,

    /// Ranking priority; lower is preferred.
    #[serde(default)]
    pub priority: u32,

    /// Whether the provider starts enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Adapter settings.
    pub provider: ProviderKind,
}

/// Adapter-specific provider settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderKind {
    /// JSON-over-HTTP provider.
    #[serde(rename_all = "camelCase")]
    Http {
        /// Generation endpoint.
        endpoint: String,
        /// Optional availability probe endpoint.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        health_endpoint: Option<String>,
        /// Environment variable holding the API key.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        api_key_env: Option<String>,
        /// Client timeout.
        #[serde(default = "default_provider_timeout_secs")]
        timeout_secs: u64,
    },
    /// In-process scripted provider.
    #[serde(rename_all = "camelCase")]
    Mock {
        /// Simulated latency.
        #[serde(default)]
        latency_ms: u64,
        /// Number of leading calls that fail.
        #[serde(default)]
        fail_first: u32,
        /// Failure kind for scripted failures (default: service-unavailable).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fail_with: Option<charforge_providers::ProviderErrorKind>,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::io::Write;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_config_default_values() {
        let config = Config::default();

        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(config.retry.max_delay_ms, 30_000);
        assert!((config.retry.backoff_multiplier - 2.0).abs() < f64::EPSILON);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.monitoring_window_secs, 60);
        assert_eq!(config.circuit_breaker.recovery_timeout_secs, 30);
        assert_eq!(config.circuit_breaker.success_threshold, 2);
        assert_eq!(config.registry.disable_threshold, 5);
        assert_eq!(config.cache.max_age_days, 30);
        assert_eq!(config.operation_timeout_secs, 300);
        assert_eq!(config.records_file, ".charforge/records.json");
        assert_eq!(config.providers.len(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_deserialization_with_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.providers[0].name, "mock");
    }

    #[test]
    fn test_config_deserialization_with_providers() {
        let json = r#"{
            "retry": { "maxAttempts": 5 },
            "providers": [
                {
                    "name": "primary",
                    "priority": 0,
                    "provider": {
                        "type": "http",
                        "endpoint": "https://images.example.com/v1/generate",
                        "apiKeyEnv": "PRIMARY_API_KEY"
                    }
                },
                {
                    "name": "fallback",
                    "priority": 10,
                    "enabled": false,
                    "provider": { "type": "mock", "failFirst": 2, "failWith": "timeout" }
                }
            ]
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();

        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(config.providers.len(), 2);
        assert!(config.providers[0].enabled);
        assert!(matches!(
            &config.providers[0].provider,
            ProviderKind::Http { timeout_secs: 120, api_key_env: Some(env), .. } if env == "PRIMARY_API_KEY"
        ));
        assert!(!config.providers[1].enabled);
        assert_eq!(
            config.providers[1].provider,
            ProviderKind::Mock {
                latency_ms: 0,
                fail_first: 2,
                fail_with: Some(charforge_providers::ProviderErrorKind::Timeout),
            }
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file_invalid_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("charforge.json");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"{ not valid json }")
            .unwrap();

        let err = Config::load_from_file(&path).unwrap_err();
        assert!(
            matches!(&err, ForgeError::ConfigParseError { path: p, message } if *p == path && !message.is_empty()),
            "Expected ConfigParseError with correct path, got: {err:?}"
        );
    }

    #[test]
    fn test_load_from_file_nonexistent_returns_default() {
        let config = Config::load_from_file(Path::new("/nonexistent/path/charforge.json")).unwrap();
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_load_from_dir_finds_charforge_json() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("charforge.json"),
            r#"{"operationTimeoutSecs": 12}"#,
        )
        .unwrap();

        let config = Config::load_from_dir(dir.path()).unwrap();
        assert_eq!(config.operation_timeout(), Duration::from_secs(12));
    }

    #[test]
    fn test_load_from_file_validates_after_parsing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("charforge.json");
        std::fs::write(&path, r#"{"retry": {"maxAttempts": 0}}"#).unwrap();

        let err = Config::load_from_file(&path).unwrap_err();
        assert!(matches!(err, ForgeError::ConfigValidationError { .. }));
        assert!(err.to_string().contains("maxAttempts"));
    }

    #[test]
    fn test_validation_rejects_duplicate_provider_names() {
        let mut config = Config::default();
        config.providers.push(config.providers[0].clone());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate provider name 'mock'"));
    }

    #[test]
    fn test_validation_rejects_bad_endpoint() {
        let mut config = Config::default();
        config.providers = vec![ProviderEntry {
            name: "bad".to_string(),
            priority: 0,
            enabled: true,
            provider: ProviderKind::Http {
                endpoint: "images.example.com".to_string(),
                health_endpoint: None,
                api_key_env: None,
                timeout_secs: 10,
            },
        }];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_jitter() {
        let mut config = Config::default();
        config.retry.jitter_ratio = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_inverted_registry_thresholds() {
        let mut config = Config::default();
        config.registry.unhealthy_threshold = 6;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let json = r#"{"operationTimeoutSecs": 10, "somethingElse": true}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.operation_timeout_secs, 10);
    }
}
