//! Circuit breaker to prevent hammering a failing upstream.
//!
//! When upstream calls fail repeatedly, the circuit opens and
//! subsequent calls are denied until a cooldown elapses. A single
//! probe is then let through to test recovery.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening circuit
    pub failure_threshold: u32,

    /// Time the circuit stays open before a probe is allowed
    #[serde(with = "crate::config::duration_str")]
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// State of the circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,

    /// Circuit is open, calls are denied
    Open,

    /// A single probe is in flight
    HalfOpen,
}

/// How a call was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed, ordinary call
    Closed,

    /// This caller holds the single half-open probe and must resolve it
    Probe,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    next_retry_at: Option<Instant>,
}

/// Circuit breaker guarding one upstream dependency.
///
/// All transitions happen under one lock, so concurrent callers racing
/// for the Open -> HalfOpen transition see exactly one winner.
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                next_retry_at: None,
            }),
            config,
        }
    }

    /// Ask whether a call may be issued now.
    ///
    /// Once the cooldown has elapsed the first caller is admitted as the
    /// probe and the circuit moves to half-open. Everyone else is denied
    /// until that probe is recorded.
    pub fn can_execute(&self) -> bool {
        self.try_acquire().is_some()
    }

    /// [`CircuitBreaker::can_execute`], telling the caller whether it was
    /// admitted as the probe.
    pub fn try_acquire(&self) -> Option<Admission> {
        let mut inner = self.inner.lock();
        let state = inner.state;
        match state {
            CircuitState::Closed => Some(Admission::Closed),
            CircuitState::Open => {
                let ready = inner
                    .next_retry_at
                    .map_or(true, |at| Instant::now() >= at);
                if !ready {
                    return None;
                }
                inner.state = CircuitState::HalfOpen;
                tracing::info!("Circuit half-open, admitting recovery probe");
                Some(Admission::Probe)
            }
            CircuitState::HalfOpen => None,
        }
    }

    /// Give back a probe slot that was never used.
    ///
    /// The circuit returns to open with its cooldown already elapsed, so
    /// the next caller becomes the probe. No-op unless half-open.
    pub fn abandon_probe(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Open;
            inner.next_retry_at = Some(Instant::now());
            tracing::debug!("Recovery probe abandoned before it was issued");
        }
    }

    /// Record a successful upstream call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            inner.next_retry_at = None;
            tracing::info!("Circuit closed after successful probe");
        }
    }

    /// Record a failed upstream call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure_at = Some(now);

        let state = inner.state;
        match state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.next_retry_at = Some(now + self.config.cooldown);
                tracing::warn!(
                    cooldown = ?self.config.cooldown,
                    "Circuit reopened after failed probe"
                );
            }
            CircuitState::Closed
                if inner.consecutive_failures >= self.config.failure_threshold =>
            {
                inner.state = CircuitState::Open;
                inner.next_retry_at = Some(now + self.config.cooldown);
                tracing::warn!(
                    failures = inner.consecutive_failures,
                    cooldown = ?self.config.cooldown,
                    "Circuit opened after repeated failures"
                );
            }
            // Late results from calls issued before the circuit opened.
            _ => {}
        }
    }

    /// Get current state of the circuit.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Whether retries may still be issued. Only a closed circuit allows them.
    pub fn allows_retry(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    /// Failures since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// When the most recent failure was recorded.
    pub fn last_failure_at(&self) -> Option<Instant> {
        self.inner.lock().last_failure_at
    }

    /// When an open circuit will admit its next probe.
    pub fn next_retry_at(&self) -> Option<Instant> {
        self.inner.lock().next_retry_at
    }

    /// Configuration in use.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Reset the circuit to closed.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.last_failure_at = None;
        inner.next_retry_at = None;
        tracing::info!("Circuit manually reset");
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
