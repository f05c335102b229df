//! Resilient client: the single call path through cache, breaker and retries.
//!
//! The client implements:
//! - Fresh cache hits served without touching the breaker or upstream
//! - Breaker gating with a single recovery probe
//! - Bounded retries, each attempt reported to the breaker as it completes
//! - Stale cache fallback when the upstream cannot be reached

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheConfig, Lookup, ResultCache};
use crate::config::{ConfigError, RuntimeConfig};
use crate::error::ResilienceError;
use crate::health::{HealthAggregator, HealthRecorder};
use crate::resilience::{
    Admission, CircuitBreaker, CircuitBreakerConfig, FallbackStrategy, RetryConfig, RetryExecutor,
    StopReason,
};
use crate::upstream::{Upstream, UpstreamError};

/// How a value was obtained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallMetadata {
    /// Served from a fresh cache entry
    pub cache_hit: bool,

    /// Served from a stale cache entry because the upstream was unreachable
    pub fallback_used: bool,

    /// Attempts beyond the first
    pub retry_count: u32,
}

/// A value returned by [`ResilientClient::invoke`].
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation<V> {
    pub value: V,
    pub metadata: CallMetadata,
}

/// Wraps an unreliable upstream with caching, a circuit breaker and retries.
///
/// # Lifecycle
/// Create one per upstream at startup and pass it (or clones of it) to
/// request handlers. Clones share breaker and cache state. Call
/// [`ResilientClient::shutdown`] when the service stops; nothing is
/// persisted.
pub struct ResilientClient<V> {
    config: Arc<RuntimeConfig>,
    breaker: Arc<CircuitBreaker>,
    cache: Arc<ResultCache<V>>,
    recorder: Arc<HealthRecorder>,
    retry: RetryExecutor,
}

impl<V> Clone for ResilientClient<V> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            breaker: self.breaker.clone(),
            cache: self.cache.clone(),
            recorder: self.recorder.clone(),
            retry: self.retry.clone(),
        }
    }
}

impl<V> ResilientClient<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create a new client from validated configuration.
    pub fn new(config: RuntimeConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let cache = ResultCache::new(config.cache.clone())
            .with_hit_rate_window(config.health.hit_rate_window);

        Ok(Self {
            breaker: Arc::new(CircuitBreaker::new(config.circuit_breaker.clone())),
            cache: Arc::new(cache),
            recorder: Arc::new(HealthRecorder::new()),
            retry: RetryExecutor::new(config.retry.clone()),
            config: Arc::new(config),
        })
    }

    /// Start building a client.
    pub fn builder() -> ResilientClientBuilder<V> {
        ResilientClientBuilder::new()
    }

    /// Fetch the value for `key`, calling `op` only when no fresh cached
    /// value exists.
    ///
    /// `op` may be called several times (once per attempt). Each call must
    /// produce an independent future.
    pub async fn invoke<F, Fut>(&self, key: &str, op: F) -> Result<Invocation<V>, ResilienceError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<V, UpstreamError>> + Send + 'static,
    {
        self.invoke_with_cancel(key, op, &CancellationToken::new())
            .await
    }

    /// [`ResilientClient::invoke`] with explicit cancellation.
    ///
    /// Cancelling interrupts backoff sleeps and stops further attempts.
    /// An attempt already in flight runs to completion in the background:
    /// its outcome still reaches the breaker, but its value is discarded
    /// and never cached.
    pub async fn invoke_with_cancel<F, Fut>(
        &self,
        key: &str,
        mut op: F,
        cancel: &CancellationToken,
    ) -> Result<Invocation<V>, ResilienceError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<V, UpstreamError>> + Send + 'static,
    {
        let cached = match self.cache.get(key) {
            Lookup::Fresh(value) => {
                tracing::debug!(key, "Cache hit");
                return Ok(Invocation {
                    value,
                    metadata: CallMetadata {
                        cache_hit: true,
                        ..Default::default()
                    },
                });
            }
            other => other,
        };

        // Checked before the breaker so a dead request never claims the probe.
        if cancel.is_cancelled() {
            return Err(ResilienceError::Cancelled);
        }

        let Some(admission) = self.breaker.try_acquire() else {
            if let Some(value) = self.serve_fallback(key, cached, "circuit open") {
                return Ok(Invocation {
                    value,
                    metadata: CallMetadata {
                        fallback_used: true,
                        ..Default::default()
                    },
                });
            }
            tracing::warn!(key, "Circuit open, failing fast");
            return Err(self.circuit_open_error());
        };

        let timeout = self.config.call_timeout;
        let mut issued = 0u32;
        let outcome = self
            .retry
            .run(&self.breaker, cancel, |attempt| {
                tracing::debug!(key, attempt, "Calling upstream");
                issued += 1;
                self.spawn_attempt(op(), timeout)
            })
            .await;

        // A probe that never reached the upstream has no outcome to record.
        if admission == Admission::Probe && issued == 0 {
            self.breaker.abandon_probe();
        }

        match outcome {
            Ok(success) => {
                if cancel.is_cancelled() {
                    return Err(ResilienceError::Cancelled);
                }
                let retry_count = success.attempts_used().saturating_sub(1);
                self.cache.insert(key, success.value.clone());
                Ok(Invocation {
                    value: success.value,
                    metadata: CallMetadata {
                        cache_hit: false,
                        fallback_used: false,
                        retry_count,
                    },
                })
            }
            Err(failure) => match failure.reason {
                StopReason::Cancelled => {
                    tracing::debug!(key, "Request cancelled");
                    Err(ResilienceError::Cancelled)
                }
                StopReason::Exhausted | StopReason::CircuitOpen => {
                    let retry_count = (failure.attempts.len() as u32).saturating_sub(1);
                    if let Some(value) = self.serve_fallback(key, cached, "retries exhausted") {
                        return Ok(Invocation {
                            value,
                            metadata: CallMetadata {
                                cache_hit: false,
                                fallback_used: true,
                                retry_count,
                            },
                        });
                    }
                    tracing::warn!(
                        key,
                        attempts = failure.attempts.len(),
                        "Upstream unavailable and no cached value"
                    );
                    Err(ResilienceError::UpstreamUnavailable {
                        attempts: failure.attempts,
                    })
                }
            },
        }
    }

    /// [`ResilientClient::invoke`] against an [`Upstream`] implementation.
    pub async fn invoke_upstream(
        &self,
        key: &str,
        upstream: Arc<dyn Upstream<V>>,
    ) -> Result<Invocation<V>, ResilienceError> {
        tracing::debug!(upstream = upstream.name(), key, "Invoking upstream");
        let owned_key = key.to_string();
        self.invoke(key, move || {
            let upstream = upstream.clone();
            let key = owned_key.clone();
            async move { upstream.call(&key).await }
        })
        .await
    }

    /// Run one attempt on its own task so it survives request cancellation.
    ///
    /// The task reports the outcome to the breaker itself; timeouts and
    /// panics count as failures.
    fn spawn_attempt<Fut>(
        &self,
        call: Fut,
        timeout: Duration,
    ) -> impl Future<Output = Result<V, UpstreamError>>
    where
        Fut: Future<Output = Result<V, UpstreamError>> + Send + 'static,
    {
        let breaker = self.breaker.clone();
        let recorder = self.recorder.clone();

        let handle = tokio::spawn(async move {
            let result =
                match tokio::time::timeout(timeout, AssertUnwindSafe(call).catch_unwind()).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(panic)) => Err(UpstreamError::Panicked(panic_message(panic.as_ref()))),
                    Err(_) => Err(UpstreamError::Timeout(timeout)),
                };

            match &result {
                Ok(_) => breaker.record_success(),
                Err(err) => {
                    breaker.record_failure();
                    recorder.record_error(err.to_string());
                }
            }
            result
        });

        async move {
            match handle.await {
                Ok(result) => result,
                Err(err) => Err(UpstreamError::Panicked(err.to_string())),
            }
        }
    }

    fn serve_fallback(&self, key: &str, cached: Lookup<V>, reason: &str) -> Option<V> {
        let expired_for = match &cached {
            Lookup::Stale { expired_for, .. } => Some(*expired_for),
            _ => None,
        };
        let value = self.config.fallback.resolve(cached)?;
        self.recorder.record_fallback();
        tracing::warn!(key, reason, expired_for = ?expired_for, "Serving stale cached value");
        Some(value)
    }

    fn circuit_open_error(&self) -> ResilienceError {
        let remaining = self
            .breaker
            .next_retry_at()
            .map(|at| at.saturating_duration_since(Instant::now()))
            .unwrap_or_default();
        // Cooldown already elapsed: a probe is in flight and resolves
        // within one call timeout.
        let retry_after = if remaining.is_zero() {
            self.config.call_timeout
        } else {
            remaining
        };
        let next_retry_at = chrono::Utc::now()
            + chrono::Duration::from_std(retry_after).unwrap_or_else(|_| chrono::Duration::zero());

        ResilienceError::CircuitOpen {
            retry_after,
            next_retry_at,
        }
    }

    /// Health view over this client's breaker and cache.
    pub fn health(&self) -> HealthAggregator<V> {
        HealthAggregator::new(
            self.breaker.clone(),
            self.cache.clone(),
            self.recorder.clone(),
            self.config.health.clone(),
        )
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn cache(&self) -> &ResultCache<V> {
        &self.cache
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Stop the client. The cache is memory-only, so this just logs final
    /// counters and drops cached values.
    pub fn shutdown(&self) {
        let stats = self.cache.stats();
        tracing::info!(
            cache_size = stats.size,
            hits = stats.hits,
            misses = stats.misses,
            evictions = stats.evictions,
            fallbacks = self.recorder.fallbacks_served(),
            breaker = ?self.breaker.state(),
            "Shutting down resilient client"
        );
        self.cache.clear();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Builder for ResilientClient.
pub struct ResilientClientBuilder<V> {
    config: RuntimeConfig,
    _value: PhantomData<fn() -> V>,
}

impl<V> ResilientClientBuilder<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
            _value: PhantomData,
        }
    }

    /// Set the whole configuration.
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.config.circuit_breaker = circuit_breaker;
        self
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.config.cache = cache;
        self
    }

    pub fn fallback(mut self, fallback: FallbackStrategy) -> Self {
        self.config.fallback = fallback;
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = timeout;
        self
    }

    /// Build the client.
    pub fn build(self) -> Result<ResilientClient<V>, ConfigError> {
        ResilientClient::new(self.config)
    }
}

impl<V> Default for ResilientClientBuilder<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
