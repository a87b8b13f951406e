//! Per-provider circuit breaker.
//!
//! The state machine lives in [`BreakerCore`], which takes the current
//! instant explicitly so transitions can be driven step by step.
//! [`CircuitBreaker`] wraps it in a mutex and runs operations through it.
//!
//! - `CLOSED`: calls pass. Failures are kept in a rolling window; reaching
//!   `failure_threshold` inside the window opens the circuit.
//! - `OPEN`: calls are rejected with `retry_after` set to the remaining
//!   recovery time. The first call after recovery moves to `HALF_OPEN`.
//! - `HALF_OPEN`: one call at a time. `success_threshold` consecutive
//!   successes close the circuit; any failure reopens it.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use charforge_providers::ProviderError;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;
use crate::error::ForgeError;

/// State of one provider's circuit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls pass through.
    #[default]
    Closed,
    /// Calls are rejected.
    Open,
    /// A limited number of probe calls pass through.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Breaker thresholds as durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    /// Failures within the window that open the circuit.
    pub failure_threshold: u32,
    /// Length of the rolling failure window.
    pub monitoring_window: Duration,
    /// Time spent open before probing.
    pub recovery_timeout: Duration,
    /// Consecutive half-open successes that close the circuit.
    pub success_threshold: u32,
}

impl From<&CircuitBreakerConfig> for BreakerSettings {
    fn from(config: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            monitoring_window: Duration::from_secs(config.monitoring_window_secs),
            recovery_timeout: Duration::from_secs(config.recovery_timeout_secs),
            success_threshold: config.success_threshold,
        }
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self::from(&CircuitBreakerConfig::default())
    }
}

/// Why a call was not let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected {
    /// Time until the circuit will admit a probe, if known.
    pub retry_after: Option<Duration>,
}

// ============================================================================
// State Machine
// ============================================================================

/// The breaker state machine, without synchronization.
#[derive(Debug, Clone)]
pub struct BreakerCore {
    settings: BreakerSettings,
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    half_open_successes: u32,
    probe_in_flight: bool,
}

impl BreakerCore {
    /// Creates a closed breaker.
    #[must_use]
    pub const fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            opened_at: None,
            half_open_successes: 0,
            probe_in_flight: false,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> CircuitState {
        self.state
    }

    /// Failures currently inside the rolling window.
    #[must_use]
    pub fn recent_failures(&self) -> usize {
        self.failures.len()
    }

    /// Asks to let one call through at `now`.
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), Rejected> {
        match self.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let opened_at = self.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed >= self.settings.recovery_timeout {
                    self.state = CircuitState::HalfOpen;
                    self.half_open_successes = 0;
                    self.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(Rejected {
                        retry_after: Some(self.settings.recovery_timeout - elapsed),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    Err(Rejected { retry_after: None })
                } else {
                    self.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Records a successful call.
    pub fn on_success(&mut self, now: Instant) {
        match self.state {
            CircuitState::Closed => self.prune(now),
            CircuitState::HalfOpen => {
                self.probe_in_flight = false;
                self.half_open_successes += 1;
                if self.half_open_successes >= self.settings.success_threshold {
                    self.state = CircuitState::Closed;
                    self.failures.clear();
                    self.opened_at = None;
                    self.half_open_successes = 0;
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Records a failed call.
    pub fn on_failure(&mut self, now: Instant) {
        match self.state {
            CircuitState::Closed => {
                self.prune(now);
                self.failures.push_back(now);
                if self.failures.len() >= self.settings.failure_threshold as usize {
                    self.open(now);
                }
            }
            CircuitState::HalfOpen => self.open(now),
            CircuitState::Open => {}
        }
    }

    /// Releases a half-open probe slot without counting the outcome.
    pub fn on_ignored(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.probe_in_flight = false;
        }
    }

    /// Returns the breaker to `CLOSED` with an empty window.
    pub fn reset(&mut self) {
        *self = Self::new(self.settings);
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.probe_in_flight = false;
        self.half_open_successes = 0;
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.failures.front() {
            if now.saturating_duration_since(oldest) >= self.settings.monitoring_window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

// ============================================================================
// Shared Breaker
// ============================================================================

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    /// Current state.
    pub state: CircuitState,
    /// Failures inside the rolling window.
    pub recent_failures: usize,
}

/// A circuit breaker guarding one provider.
///
/// The core sits behind a synchronous mutex: it is never held across an
/// `.await`, and a cancelled call must be able to release its slot from
/// `Drop`.
#[derive(Debug)]
pub struct CircuitBreaker {
    provider: String,
    core: Mutex<BreakerCore>,
}

impl CircuitBreaker {
    /// Creates a closed breaker for `provider`.
    #[must_use]
    pub fn new(provider: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            provider: provider.into(),
            core: Mutex::new(BreakerCore::new(settings)),
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        lock(&self.core).state()
    }

    /// Current state and window size.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let core = lock(&self.core);
        BreakerSnapshot {
            state: core.state(),
            recent_failures: core.recent_failures(),
        }
    }

    /// Closes the breaker and clears its history.
    pub fn reset(&self) {
        lock(&self.core).reset();
    }

    /// Runs `operation` if the circuit admits it.
    ///
    /// A rejected call fails with a `service-unavailable` provider error
    /// without invoking `operation`. Failures caused by the request itself
    /// (invalid prompt, content policy) do not count against the circuit.
    /// If the returned future is dropped before `operation` finishes, the
    /// admitted slot is released without recording an outcome.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, ForgeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ForgeError>>,
    {
        let mut slot = self.acquire()?;

        let result = operation().await;

        let mut core = lock(&self.core);
        slot.settled = true;
        let before = core.state();
        match &result {
            Ok(_) => core.on_success(Instant::now()),
            Err(e) if counts_as_failure(e) => core.on_failure(Instant::now()),
            Err(_) => core.on_ignored(),
        }
        let after = core.state();
        drop(core);

        if before != after {
            if after == CircuitState::Open {
                warn!(provider = %self.provider, from = %before, to = %after, "Circuit opened");
            } else {
                info!(provider = %self.provider, from = %before, to = %after, "Circuit state changed");
            }
        }
        result
    }

    fn acquire(&self) -> Result<Slot<'_>, ForgeError> {
        let mut core = lock(&self.core);
        if let Err(rejected) = core.try_acquire(Instant::now()) {
            let mut error =
                ProviderError::unavailable(&self.provider, format!("circuit {}", core.state()));
            if let Some(delay) = rejected.retry_after {
                error = error.with_retry_after(delay);
            }
            return Err(ForgeError::Provider(error));
        }
        Ok(Slot {
            breaker: self,
            settled: false,
        })
    }
}

/// An admitted call whose outcome has not been recorded yet.
struct Slot<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        if !self.settled {
            lock(&self.breaker.core).on_ignored();
            debug!(provider = %self.breaker.provider, "Call cancelled, releasing circuit slot");
        }
    }
}

fn lock(core: &Mutex<BreakerCore>) -> MutexGuard<'_, BreakerCore> {
    core.lock().unwrap_or_else(PoisonError::into_inner)
}

fn counts_as_failure(error: &ForgeError) -> bool {
    error
        .provider_error()
        .map_or(true, ProviderError::counts_against_provider)
}
