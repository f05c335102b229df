//! Runtime configuration.
//!
//! Every section has usable defaults, so an empty JSON object is a valid
//! configuration. Durations are written as human-readable strings
//! (`"30s"`, `"100ms"`) or as integer milliseconds.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::cache::CacheConfig;
use crate::health::HealthConfig;
use crate::resilience::{CircuitBreakerConfig, FallbackStrategy, RetryConfig};

/// Invalid configuration values.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("retry.max_attempts must be at least 1")]
    ZeroAttempts,

    #[error("circuit_breaker.failure_threshold must be at least 1")]
    ZeroThreshold,

    #[error("cache.capacity must be at least 1 when the cache is enabled")]
    ZeroCapacity,

    #[error("health.hit_rate_floor must be within 0.0..=1.0, got {0}")]
    HitRateFloor(f64),

    #[error("health.hit_rate_window must be at least 1")]
    ZeroWindow,

    #[error("call_timeout must be non-zero")]
    ZeroTimeout,

    #[error("invalid configuration: {0}")]
    Parse(String),
}

/// Configuration for a [`crate::ResilientClient`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub retry: RetryConfig,

    pub circuit_breaker: CircuitBreakerConfig,

    pub cache: CacheConfig,

    pub health: HealthConfig,

    /// What to serve when the upstream cannot be reached.
    pub fallback: FallbackStrategy,

    /// Upper bound on a single upstream call
    #[serde(with = "duration_str")]
    pub call_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            cache: CacheConfig::default(),
            health: HealthConfig::default(),
            fallback: FallbackStrategy::default(),
            call_timeout: Duration::from_secs(10),
        }
    }
}

impl RuntimeConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::ZeroThreshold);
        }
        if self.cache.enabled && self.cache.capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if !(0.0..=1.0).contains(&self.health.hit_rate_floor) {
            return Err(ConfigError::HitRateFloor(self.health.hit_rate_floor));
        }
        if self.health.hit_rate_window == 0 {
            return Err(ConfigError::ZeroWindow);
        }
        if self.call_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }
}

/// Serde adapter for `Duration` fields.
pub(crate) mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(u64),
        Text(String),
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Millis(ms) => Ok(Duration::from_millis(ms)),
            Raw::Text(text) => humantime::parse_duration(&text).map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RuntimeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.cooldown, Duration::from_secs(30));
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = RuntimeConfig::from_json_str("{}").unwrap();
        assert_eq!(config.cache.capacity, CacheConfig::default().capacity);
        assert_eq!(config.call_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_durations_accept_text_and_millis() {
        let json = r#"{
            "retry": { "max_attempts": 4, "base_delay": 250 },
            "circuit_breaker": { "cooldown": "1m 30s" },
            "cache": { "default_ttl": "500ms" }
        }"#;
        let config = RuntimeConfig::from_json_str(json).unwrap();

        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.retry.base_delay, Duration::from_millis(250));
        assert_eq!(config.circuit_breaker.cooldown, Duration::from_secs(90));
        assert_eq!(config.cache.default_ttl, Duration::from_millis(500));
    }

    #[test]
    fn test_durations_serialize_human_readable() {
        let json = serde_json::to_value(RuntimeConfig::default()).unwrap();
        assert_eq!(json["circuit_breaker"]["cooldown"], "30s");
        assert_eq!(json["retry"]["base_delay"], "100ms");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = RuntimeConfig::default();
        config.retry.max_attempts = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroAttempts));

        let mut config = RuntimeConfig::default();
        config.health.hit_rate_floor = 1.5;
        assert_eq!(config.validate(), Err(ConfigError::HitRateFloor(1.5)));

        let mut config = RuntimeConfig::default();
        config.cache.capacity = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroCapacity));
        config.cache.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        let err = RuntimeConfig::from_json_str("{ \"retry\": 3 }").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
