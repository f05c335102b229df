//! Terminal errors returned by [`crate::ResilientClient`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::resilience::AttemptRecord;

/// Errors that cross the client boundary.
///
/// Individual [`crate::UpstreamError`]s are absorbed by the retry loop and
/// only show up as part of `UpstreamUnavailable`.
#[derive(Error, Debug, Clone)]
pub enum ResilienceError {
    /// The breaker denied execution and no cached value was available.
    #[error("circuit open, retry after {retry_after:?}")]
    CircuitOpen {
        retry_after: Duration,
        next_retry_at: DateTime<Utc>,
    },

    /// Every permitted attempt failed and no cached value was available.
    #[error("upstream unavailable after {} attempt(s)", attempts.len())]
    UpstreamUnavailable { attempts: Vec<AttemptRecord> },

    /// The request was cancelled before it produced a result.
    #[error("request cancelled")]
    Cancelled,
}

/// Tag for [`ResilienceError`], for callers that switch on the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CircuitOpen,
    UpstreamUnavailable,
    Cancelled,
}

impl ResilienceError {
    /// The variant tag.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::UpstreamUnavailable { .. } => ErrorKind::UpstreamUnavailable,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether the same request may succeed if issued again right away.
    pub fn is_retryable(&self) -> bool {
        match self.kind() {
            ErrorKind::CircuitOpen => false,
            ErrorKind::UpstreamUnavailable => true,
            ErrorKind::Cancelled => true,
        }
    }

    /// Caller-facing description.
    ///
    /// Terminal errors are only produced when no stale value could be
    /// served, so every message says so.
    pub fn user_message(&self) -> String {
        match self {
            Self::CircuitOpen { retry_after, .. } => format!(
                "The search service is temporarily unavailable and no cached result exists. \
                 Try again in {}s.",
                retry_after.as_secs().max(1)
            ),
            Self::UpstreamUnavailable { attempts } => format!(
                "The search service failed {} time(s) and no cached result exists. \
                 Last error: {}",
                attempts.len(),
                attempts
                    .iter()
                    .rev()
                    .find_map(|a| a.error.as_ref())
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "none recorded".to_string())
            ),
            Self::Cancelled => "The request was cancelled.".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UpstreamError;

    #[test]
    fn test_kind_matches_variant() {
        let open = ResilienceError::CircuitOpen {
            retry_after: Duration::from_secs(12),
            next_retry_at: Utc::now(),
        };
        assert_eq!(open.kind(), ErrorKind::CircuitOpen);
        assert!(!open.is_retryable());
        assert!(open.user_message().contains("12s"));

        assert_eq!(ResilienceError::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_unavailable_message_reports_last_error() {
        let err = ResilienceError::UpstreamUnavailable {
            attempts: vec![
                AttemptRecord {
                    attempt: 1,
                    delay_before: Duration::ZERO,
                    error: Some(UpstreamError::failed("first")),
                },
                AttemptRecord {
                    attempt: 2,
                    delay_before: Duration::from_millis(100),
                    error: Some(UpstreamError::Timeout(Duration::from_secs(1))),
                },
            ],
        };

        assert_eq!(err.to_string(), "upstream unavailable after 2 attempt(s)");
        let message = err.user_message();
        assert!(message.contains("2 time(s)"));
        assert!(message.contains("timed out"));
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::UpstreamUnavailable).unwrap();
        assert_eq!(json, "\"upstream_unavailable\"");
    }
}
