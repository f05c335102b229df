//! Bounded retry with exponential backoff.
//!
//! The executor only sequences attempts and sleeps. Breaker and cache
//! updates belong to the caller, which sees every attempt outcome as it
//! happens through the operation it hands in.

use backon::Backoff;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::CircuitBreaker;
use crate::upstream::UpstreamError;

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Upper bound on attempts per request, first attempt included
    pub max_attempts: u32,

    /// Delay before the second attempt; doubles for each one after
    #[serde(with = "crate::config::duration_str")]
    pub base_delay: Duration,

    /// Cap on any single backoff sleep
    #[serde(with = "crate::config::duration_str")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// One attempt in a retry sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    /// 1-based attempt number
    pub attempt: u32,

    /// Backoff slept before this attempt (zero for the first)
    pub delay_before: Duration,

    /// Why the attempt failed, `None` if it succeeded
    pub error: Option<UpstreamError>,
}

/// Why a retry sequence stopped without a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Every permitted attempt failed
    Exhausted,

    /// The breaker left the closed state mid-sequence
    CircuitOpen,

    /// The request was cancelled
    Cancelled,
}

/// A value produced by the retry loop.
#[derive(Debug)]
pub struct RetrySuccess<T> {
    pub value: T,
    pub attempts: Vec<AttemptRecord>,
}

impl<T> RetrySuccess<T> {
    /// Attempts issued, including the successful one.
    pub fn attempts_used(&self) -> u32 {
        self.attempts.len() as u32
    }
}

/// The retry loop gave up. `attempts` holds every failure in order.
#[derive(Debug)]
pub struct RetryFailure {
    pub reason: StopReason,
    pub attempts: Vec<AttemptRecord>,
}

/// Exact doubling schedule, capped at a maximum delay.
///
/// `backon`'s exponential builder scales in floating point, which drifts
/// off `base * 2^n` by a few nanoseconds per step. This one multiplies
/// integers, and as a [`Backoff`] it plugs into `backon::Retryable` too.
#[derive(Debug, Clone)]
struct DoublingBackoff {
    base: Duration,
    max: Duration,
    step: u32,
    remaining: u32,
}

impl Iterator for DoublingBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let delay = 1u32
            .checked_shl(self.step)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max));
        self.step = self.step.saturating_add(1);
        Some(delay)
    }
}

/// Runs an operation with bounded attempts and exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create a new executor.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Sleep schedule between attempts: `base`, `2*base`, `4*base`, ...
    pub fn backoff(&self) -> impl Backoff + Clone {
        DoublingBackoff {
            base: self.config.base_delay,
            max: self.config.max_delay,
            step: 0,
            remaining: self.config.max_attempts.saturating_sub(1),
        }
    }

    /// Run `operation` until it succeeds or attempts run out.
    ///
    /// `operation` receives the 1-based attempt number. No further attempt
    /// is issued once `breaker` is anything but closed, and cancellation
    /// interrupts both backoff sleeps and the attempt being awaited.
    pub async fn run<T, F, Fut>(
        &self,
        breaker: &CircuitBreaker,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<RetrySuccess<T>, RetryFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut delays = self.backoff();
        let mut attempts = Vec::new();
        let mut delay_before = Duration::ZERO;
        let mut attempt = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryFailure {
                    reason: StopReason::Cancelled,
                    attempts,
                });
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(RetryFailure { reason: StopReason::Cancelled, attempts });
                }
                outcome = operation(attempt) => outcome,
            };

            match outcome {
                Ok(value) => {
                    attempts.push(AttemptRecord {
                        attempt,
                        delay_before,
                        error: None,
                    });
                    return Ok(RetrySuccess { value, attempts });
                }
                Err(err) => {
                    tracing::warn!(attempt, max_attempts, error = %err, "Upstream attempt failed");
                    attempts.push(AttemptRecord {
                        attempt,
                        delay_before,
                        error: Some(err),
                    });
                }
            }

            let delay = match delays.next() {
                Some(delay) if attempt < max_attempts => delay,
                _ => {
                    return Err(RetryFailure {
                        reason: StopReason::Exhausted,
                        attempts,
                    })
                }
            };

            if !breaker.allows_retry() {
                tracing::debug!(attempt, "Circuit not closed, abandoning retries");
                return Err(RetryFailure {
                    reason: StopReason::CircuitOpen,
                    attempts,
                });
            }

            tracing::debug!(attempt, delay = ?delay, "Backing off before retry");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(RetryFailure { reason: StopReason::Cancelled, attempts });
                }
                _ = tokio::time::sleep(delay) => {}
            }

            // Another request may have tripped the circuit while we slept.
            if !breaker.allows_retry() {
                return Err(RetryFailure {
                    reason: StopReason::CircuitOpen,
                    attempts,
                });
            }

            attempt += 1;
            delay_before = delay;
        }
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
