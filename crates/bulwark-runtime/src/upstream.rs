//! Upstream abstraction.
//!
//! The runtime never looks inside requests or responses. It only needs
//! something that, given a key, eventually produces a value or fails.

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// A single failed call attempt.
///
/// These are retryable and never cross the client boundary on their own;
/// callers only see them inside [`crate::ResilienceError::UpstreamUnavailable`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("upstream call failed: {0}")]
    Failed(String),

    #[error("upstream call timed out after {0:?}")]
    Timeout(Duration),

    #[error("upstream call panicked: {0}")]
    Panicked(String),
}

impl UpstreamError {
    /// Wrap any displayable error as a failed call.
    pub fn failed(err: impl fmt::Display) -> Self {
        Self::Failed(err.to_string())
    }
}

/// An unreliable upstream service.
///
/// Implement this for a real search backend; tests and the CLI use
/// simulated implementations.
#[async_trait]
pub trait Upstream<V>: Send + Sync {
    /// Fetch the value for `key`.
    async fn call(&self, key: &str) -> Result<V, UpstreamError>;

    /// Upstream name for logs.
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_wraps_display() {
        let err = UpstreamError::failed("connection reset");
        assert_eq!(err, UpstreamError::Failed("connection reset".to_string()));
        assert_eq!(err.to_string(), "upstream call failed: connection reset");
    }
}
