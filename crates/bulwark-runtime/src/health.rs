//! Composite health reporting.
//!
//! Reads breaker and cache state and folds them into a single verdict
//! suitable for a status endpoint.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::cache::ResultCache;
use crate::resilience::{CircuitBreaker, CircuitState};

/// Health configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Recent hit rate below this marks the service degraded (0.0 disables)
    pub hit_rate_floor: f64,

    /// Number of recent lookups the hit rate is computed over
    pub hit_rate_window: usize,

    /// Lookups required in the window before the floor applies
    pub min_samples: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            hit_rate_floor: 0.0,
            hit_rate_window: 100,
            min_samples: 20,
        }
    }
}

/// Overall verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Ok,
    Degraded,
    Down,
}

/// Most recent upstream failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastError {
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Point-in-time health of one client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub breaker_state: CircuitState,
    pub consecutive_failures: u32,
    pub cache_size: usize,
    pub cache_hit_rate: Option<f64>,
    pub fallbacks_served: u64,
    pub last_error: Option<LastError>,
    pub overall_status: OverallStatus,
}

/// Request-path events the breaker and cache do not track themselves.
#[derive(Debug, Default)]
pub struct HealthRecorder {
    last_error: RwLock<Option<LastError>>,
    fallbacks_served: AtomicU64,
}

impl HealthRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember an upstream failure.
    pub fn record_error(&self, message: impl Into<String>) {
        *self.last_error.write() = Some(LastError {
            message: message.into(),
            at: Utc::now(),
        });
    }

    /// Count a stale value served in place of a live result.
    pub fn record_fallback(&self) {
        self.fallbacks_served.fetch_add(1, Ordering::SeqCst);
    }

    pub fn last_error(&self) -> Option<LastError> {
        self.last_error.read().clone()
    }

    pub fn fallbacks_served(&self) -> u64 {
        self.fallbacks_served.load(Ordering::SeqCst)
    }
}

/// Aggregates breaker, cache and request-path state into a [`HealthSnapshot`].
pub struct HealthAggregator<V> {
    breaker: Arc<CircuitBreaker>,
    cache: Arc<ResultCache<V>>,
    recorder: Arc<HealthRecorder>,
    config: HealthConfig,
}

impl<V: Clone> HealthAggregator<V> {
    pub fn new(
        breaker: Arc<CircuitBreaker>,
        cache: Arc<ResultCache<V>>,
        recorder: Arc<HealthRecorder>,
        config: HealthConfig,
    ) -> Self {
        Self {
            breaker,
            cache,
            recorder,
            config,
        }
    }

    /// Read-only snapshot. Safe to call as often as needed.
    pub fn snapshot(&self) -> HealthSnapshot {
        let breaker_state = self.breaker.state();
        let stats = self.cache.stats();

        let below_floor = stats.recent_samples >= self.config.min_samples
            && stats
                .recent_hit_rate
                .is_some_and(|rate| rate < self.config.hit_rate_floor);

        let overall_status = match breaker_state {
            CircuitState::Open => OverallStatus::Down,
            CircuitState::HalfOpen => OverallStatus::Degraded,
            CircuitState::Closed if below_floor => OverallStatus::Degraded,
            CircuitState::Closed => OverallStatus::Ok,
        };

        HealthSnapshot {
            breaker_state,
            consecutive_failures: self.breaker.consecutive_failures(),
            cache_size: stats.size,
            cache_hit_rate: stats.recent_hit_rate,
            fallbacks_served: self.recorder.fallbacks_served(),
            last_error: self.recorder.last_error(),
            overall_status,
        }
    }

    /// Health check: purge expired cache entries, then snapshot.
    pub fn check(&self) -> HealthSnapshot {
        let purged = self.cache.purge_expired();
        let snapshot = self.snapshot();
        tracing::debug!(
            purged,
            status = ?snapshot.overall_status,
            breaker = ?snapshot.breaker_state,
            "Health check"
        );
        snapshot
    }
}
