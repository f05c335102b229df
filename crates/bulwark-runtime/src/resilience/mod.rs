//! Resilience patterns for bulwark-runtime.
//!
//! This module provides:
//! - Circuit breaker to stop calling a failing upstream
//! - Retry with exponential backoff
//! - Fallback strategies

mod circuit_breaker;
mod fallback;
mod retry;

pub use circuit_breaker::{Admission, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use fallback::FallbackStrategy;
pub use retry::{
    AttemptRecord, RetryConfig, RetryExecutor, RetryFailure, RetrySuccess, StopReason,
};
