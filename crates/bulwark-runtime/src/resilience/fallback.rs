//! Fallback strategies when the upstream cannot be reached.

use serde::{Deserialize, Serialize};

use crate::cache::Lookup;

/// What to serve when the breaker denies a call or retries run out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FallbackStrategy {
    /// Serve an expired-but-unevicted cache entry if one exists
    #[default]
    StaleCache,

    /// Fail the request
    Fail,
}

impl FallbackStrategy {
    /// Pick the value to serve from a cache lookup taken before the live call.
    ///
    /// Only stale entries qualify; fresh hits are served before the
    /// breaker is consulted and never reach this point.
    pub fn resolve<V>(&self, lookup: Lookup<V>) -> Option<V> {
        match (self, lookup) {
            (Self::StaleCache, Lookup::Stale { value, .. }) => Some(value),
            (Self::StaleCache, Lookup::Fresh(_) | Lookup::Absent) => None,
            (Self::Fail, _) => None,
        }
    }
}
