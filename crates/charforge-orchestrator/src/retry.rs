//! Retry with exponential backoff for a single provider.
//!
//! Delay before attempt `n + 1` is
//! `min(base * multiplier^(n - 1) + jitter, max)` where jitter is up to
//! `jitter_ratio` of the exponential term. A provider-supplied `retry_after`
//! replaces the computed delay and is capped the same way.

use std::future::Future;
use std::time::Duration;

use charforge_providers::ProviderError;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::ForgeError;

/// Retry policy expressed as durations.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Growth factor between delays.
    pub backoff_multiplier: f64,
    /// Maximum jitter as a fraction of the exponential term.
    pub jitter_ratio: f64,
    /// Timeout for each attempt.
    pub attempt_timeout: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            backoff_multiplier: config.backoff_multiplier,
            jitter_ratio: config.jitter_ratio,
            attempt_timeout: Duration::from_millis(config.attempt_timeout_ms),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

/// One failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryAttempt {
    /// Attempt number (1-indexed).
    pub attempt: u32,
    /// When the failure was observed.
    pub at: DateTime<Utc>,
    /// How long the attempt ran before failing.
    pub elapsed: Duration,
    /// Sleep before the next attempt; `None` when no attempt follows.
    pub delay: Option<Duration>,
    /// The failure.
    pub error: ProviderError,
}

/// Runs provider calls under a [`RetryPolicy`].
#[derive(Debug, Clone, Default)]
pub struct RetryManager {
    policy: RetryPolicy,
}

impl RetryManager {
    /// Creates a manager for `policy`.
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// The active policy.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Computes the backoff before attempt `attempt + 1`.
    ///
    /// `jitter_unit` is a sample from `[0, 1)` scaling the jitter term.
    #[must_use]
    pub fn compute_delay(&self, attempt: u32, jitter_unit: f64) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_ms = self.policy.base_delay.as_secs_f64() * 1000.0;
        let exponential = base_ms * self.policy.backoff_multiplier.powi(exponent);
        let jitter = exponential * self.policy.jitter_ratio * jitter_unit.clamp(0.0, 1.0);
        let max_ms = self.policy.max_delay.as_secs_f64() * 1000.0;
        let total = (exponential + jitter).min(max_ms);
        Duration::from_secs_f64(total.max(0.0) / 1000.0)
    }

    /// Delay before retrying after `error` on `attempt`.
    fn delay_after(&self, attempt: u32, error: &ProviderError) -> Duration {
        match error.retry_after {
            Some(requested) => requested.min(self.policy.max_delay),
            None => self.compute_delay(attempt, rand::thread_rng().gen::<f64>()),
        }
    }

    /// Runs `operation` until it succeeds, fails non-retryably, or the
    /// attempt budget is spent.
    ///
    /// `operation` receives the attempt number. Each attempt is bounded by
    /// the policy's attempt timeout, which surfaces as a retryable timeout
    /// error. `on_failure` observes every failed attempt.
    ///
    /// # Errors
    ///
    /// - `ForgeError::Provider` for a non-retryable failure (one attempt)
    /// - `ForgeError::RetryExhausted` with the full history otherwise
    pub async fn execute_with_retry<T, F, Fut, O>(
        &self,
        provider: &str,
        mut operation: F,
        mut on_failure: O,
    ) -> Result<T, ForgeError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
        O: FnMut(&RetryAttempt),
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut history: Vec<RetryAttempt> = Vec::new();

        for attempt in 1..=max_attempts {
            let started = Instant::now();
            let outcome =
                match tokio::time::timeout(self.policy.attempt_timeout, operation(attempt)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::timeout(provider, self.policy.attempt_timeout)),
                };

            let error = match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(provider, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let will_retry = error.is_retryable() && attempt < max_attempts;
            let delay = will_retry.then(|| self.delay_after(attempt, &error));
            let record = RetryAttempt {
                attempt,
                at: Utc::now(),
                elapsed: started.elapsed(),
                delay,
                error,
            };
            warn!(
                provider,
                attempt,
                delay_ms = delay.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
                error = %record.error,
                "Provider attempt failed"
            );
            on_failure(&record);

            if !record.error.is_retryable() {
                return Err(ForgeError::Provider(record.error));
            }
            history.push(record);

            match delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => break,
            }
        }

        let last_error = history
            .last()
            .map(|r| r.error.clone())
            .unwrap_or_else(|| ProviderError::unavailable(provider, "no attempts were made"));
        Err(ForgeError::RetryExhausted {
            provider: provider.to_string(),
            attempts: u32::try_from(history.len()).unwrap_or(u32::MAX),
            last_error,
            history,
        })
    }
}
