//! Circuit breaker for external dependencies.
//!
//! # States
//!
//! ```text
//! ┌─────────┐   failure_threshold   ┌────────┐
//! │ CLOSED  │ ────────────────────> │  OPEN  │ <──────┐
//! │(normal) │      reached          │(reject)│        │
//! └─────────┘                       └────────┘        │
//!      ▲                                 │            │ probe fails
//!      │ probe succeeds                  │ recovery_timeout elapsed,
//!      │                                 ▼ checked lazily on access
//!      │                          ┌───────────┐       │
//!      └──────────────────────────│ HALF_OPEN │───────┘
//!                                 │ (1 probe) │
//!                                 └───────────┘
//! ```
//!
//! State lives behind a mutex so concurrent callers in one process observe a
//! single consistent transition. Nothing is shared across processes: each
//! worker builds its own breakers.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use vault_common::{Error, Result};

// ============================================================================
// State & configuration
// ============================================================================

/// Current state of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls go through
    Closed,
    /// Tripped, calls are rejected without being attempted
    Open,
    /// One probe call decides between Closed and Open
    HalfOpen,
}

/// Configuration for the circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Time since the last failure before a probe is allowed
    pub recovery_timeout: Duration,
    /// Dependency name for logs and errors
    pub name: String,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            name: "default".to_string(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration with a custom name
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the failure threshold
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set the recovery timeout
    pub fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }
}

/// Snapshot for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
}

// ============================================================================
// Circuit Breaker Implementation
// ============================================================================

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    probe_in_flight: bool,
}

/// Circuit breaker guarding one named dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

/// Permission to make one call. Dropping it without recording an outcome
/// releases a half-open probe slot.
#[must_use]
#[derive(Debug)]
pub struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl Admission<'_> {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.probe && !self.settled {
            self.breaker.lock().probe_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Create a circuit breaker with default configuration and a name
    pub fn with_name(name: impl Into<String>) -> Self {
        Self::new(CircuitBreakerConfig::with_name(name))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // State stays consistent even if a holder panicked mid-update.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Promote OPEN to HALF_OPEN once the recovery timeout has elapsed.
    fn promote_if_due(&self, inner: &mut Inner) {
        if inner.state != CircuitState::Open {
            return;
        }
        let due = inner
            .last_failure
            .map_or(true, |t| t.elapsed() >= self.config.recovery_timeout);
        if due {
            inner.state = CircuitState::HalfOpen;
            inner.probe_in_flight = false;
            tracing::info!(circuit = %self.config.name, "Circuit breaker OPEN -> HALF_OPEN");
        }
    }

    /// Current state, after lazy promotion.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.promote_if_due(&mut inner);
        inner.state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// Ask to make a call. Rejected with `CircuitOpen` while open, and while
    /// another caller holds the half-open probe.
    pub fn acquire(&self) -> Result<Admission<'_>> {
        let mut inner = self.lock();
        self.promote_if_due(&mut inner);

        let probe = match inner.state {
            CircuitState::Closed => false,
            CircuitState::HalfOpen if !inner.probe_in_flight => {
                inner.probe_in_flight = true;
                true
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                tracing::debug!(circuit = %self.config.name, state = ?inner.state, "Circuit breaker rejected call");
                return Err(Error::CircuitOpen {
                    dependency: self.config.name.clone(),
                });
            }
        };

        Ok(Admission {
            breaker: self,
            probe,
            settled: false,
        })
    }

    /// Record a successful call: counter to zero, circuit closed.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        let previous = inner.state;
        inner.failure_count = 0;
        inner.probe_in_flight = false;
        inner.state = CircuitState::Closed;

        if previous != CircuitState::Closed {
            tracing::info!(circuit = %self.config.name, "Circuit breaker HALF_OPEN -> CLOSED");
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        inner.probe_in_flight = false;

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                tracing::warn!(circuit = %self.config.name, "Circuit breaker probe failed, HALF_OPEN -> OPEN");
            }
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                inner.state = CircuitState::Open;
                tracing::warn!(
                    circuit = %self.config.name,
                    failures = inner.failure_count,
                    "Circuit breaker CLOSED -> OPEN"
                );
            }
            _ => {}
        }
    }

    /// Run `op` under the breaker. Only retryable failures count against it;
    /// any other outcome shows the dependency answering.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let admission = self.acquire()?;
        let result = op().await;
        match &result {
            Err(e) if e.is_retryable() => admission.failure(),
            _ => admission.success(),
        }
        result
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock();
        self.promote_if_due(&mut inner);
        CircuitBreakerStats {
            name: self.config.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.config.failure_threshold,
        }
    }

    /// Reset to closed.
    pub fn reset(&self) {
        self.record_success();
        tracing::info!(circuit = %self.config.name, "Circuit breaker manually reset");
    }
}
