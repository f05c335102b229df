//! Simulated upstream search service with deterministic failure patterns.

use async_trait::async_trait;
use bulwark_runtime::{Upstream, UpstreamError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Upstream that fails on a fixed schedule.
pub struct SimulatedSearch {
    calls: AtomicU64,
    fail_first: u64,
    fail_every: u64,
    latency: Duration,
}

impl SimulatedSearch {
    /// `fail_first` calls fail outright; after that every `fail_every`-th
    /// call fails (0 disables).
    pub fn new(fail_first: u64, fail_every: u64, latency: Duration) -> Self {
        Self {
            calls: AtomicU64::new(0),
            fail_first,
            fail_every,
            latency,
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn should_fail(&self, call: u64) -> bool {
        call <= self.fail_first || (self.fail_every > 0 && call % self.fail_every == 0)
    }
}

#[async_trait]
impl Upstream<String> for SimulatedSearch {
    async fn call(&self, key: &str) -> Result<String, UpstreamError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.latency).await;

        if self.should_fail(call) {
            return Err(UpstreamError::Failed(format!("simulated outage on call {call}")));
        }
        Ok(format!("quote about {key} (call {call})"))
    }

    fn name(&self) -> &str {
        "simulated-search"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fail_first_then_recover() {
        let search = SimulatedSearch::new(2, 0, Duration::ZERO);

        assert!(search.call("a").await.is_err());
        assert!(search.call("a").await.is_err());
        assert_eq!(search.call("a").await.unwrap(), "quote about a (call 3)");
        assert_eq!(search.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_every() {
        let search = SimulatedSearch::new(0, 3, Duration::ZERO);
        let outcomes: Vec<bool> = collect_outcomes(&search, 6).await;
        assert_eq!(outcomes, vec![true, true, false, true, true, false]);
    }

    async fn collect_outcomes(search: &SimulatedSearch, n: usize) -> Vec<bool> {
        let mut outcomes = Vec::with_capacity(n);
        for _ in 0..n {
            outcomes.push(search.call("k").await.is_ok());
        }
        outcomes
    }
}
