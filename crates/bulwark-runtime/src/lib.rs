//! # bulwark-runtime
//!
//! Resilient calls to an unreliable upstream search service.
//!
//! This crate sits between request handlers and the upstream and absorbs
//! transient failures:
//! - Fresh results are served from an in-memory LRU/TTL cache
//! - A circuit breaker stops calls to an upstream that keeps failing
//! - Failed calls are retried with exponential backoff
//! - When the upstream cannot be reached, expired cache entries are served
//!   instead of an error
//!
//! The upstream is opaque: anything that maps a key to a future result.
//!
//! ## Example
//!
//! ```rust,ignore
//! use bulwark_runtime::{ResilientClient, RuntimeConfig, UpstreamError};
//!
//! let client: ResilientClient<String> = ResilientClient::new(RuntimeConfig::default())?;
//!
//! let result = client
//!     .invoke("marcus aurelius", || async {
//!         search("marcus aurelius").await.map_err(UpstreamError::failed)
//!     })
//!     .await?;
//!
//! if result.metadata.fallback_used {
//!     println!("(served from stale cache)");
//! }
//! println!("{}", result.value);
//!
//! // Status endpoint
//! let health = client.health().check();
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod health;
pub mod resilience;
pub mod upstream;

// Re-export main types at crate root
pub use cache::{CacheConfig, CacheStats, Lookup, ResultCache};
pub use client::{CallMetadata, Invocation, ResilientClient, ResilientClientBuilder};
pub use config::{ConfigError, RuntimeConfig};
pub use error::{ErrorKind, ResilienceError};
pub use health::{
    HealthAggregator, HealthConfig, HealthRecorder, HealthSnapshot, LastError, OverallStatus,
};
pub use resilience::{
    Admission, AttemptRecord, CircuitBreaker, CircuitBreakerConfig, CircuitState,
    FallbackStrategy, RetryConfig, RetryExecutor, RetryFailure, RetrySuccess, StopReason,
};
pub use tokio_util::sync::CancellationToken;
pub use upstream::{Upstream, UpstreamError};
