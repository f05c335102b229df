//! Result cache for bulwark-runtime.
//!
//! Bounded, TTL-aware, least-recently-used. Expired entries are not
//! dropped on read: they stay readable as [`Lookup::Stale`] so the client
//! can fall back to them when the upstream is down. They leave the cache
//! only through capacity eviction or [`ResultCache::purge_expired`].

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::time::Instant;

/// Cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// When false, nothing is stored and every lookup misses
    pub enabled: bool,

    /// Maximum number of entries
    pub capacity: usize,

    /// TTL applied by [`ResultCache::insert`]
    #[serde(with = "crate::config::duration_str")]
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 1_000,
            default_ttl: Duration::from_secs(3600),
        }
    }
}

/// Outcome of a cache read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<V> {
    /// Within its TTL
    Fresh(V),

    /// Past its TTL but not yet evicted
    Stale { value: V, expired_for: Duration },

    /// Never stored, or already evicted
    Absent,
}

impl<V> Lookup<V> {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh(_))
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale { .. })
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    /// The cached value regardless of freshness.
    pub fn into_value(self) -> Option<V> {
        match self {
            Self::Fresh(value) | Self::Stale { value, .. } => Some(value),
            Self::Absent => None,
        }
    }
}

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    ttl: Duration,
    last_accessed_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) > self.ttl
    }

    fn expired_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
            .saturating_sub(self.ttl)
    }
}

/// Cache counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub stale_reads: u64,
    pub evictions: u64,

    /// Fresh-hit ratio over the last `recent_samples` lookups
    pub recent_hit_rate: Option<f64>,
    pub recent_samples: usize,
}

#[derive(Debug)]
struct CacheInner<V> {
    entries: LruCache<String, CacheEntry<V>>,
    hits: u64,
    misses: u64,
    stale_reads: u64,
    evictions: u64,
    window: VecDeque<bool>,
}

impl<V> CacheInner<V> {
    fn record_lookup(&mut self, hit: bool, window_len: usize) {
        if hit {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        if self.window.len() >= window_len {
            self.window.pop_front();
        }
        self.window.push_back(hit);
    }
}

/// In-memory result cache shared by all in-flight requests.
///
/// A single lock covers reads too, since every read promotes the entry in
/// the LRU order.
pub struct ResultCache<V> {
    inner: Mutex<CacheInner<V>>,
    config: CacheConfig,
    window_len: usize,
}

impl<V: Clone> ResultCache<V> {
    /// Create a new cache with the given configuration.
    pub fn new(config: CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(CacheInner {
                entries: LruCache::new(capacity),
                hits: 0,
                misses: 0,
                stale_reads: 0,
                evictions: 0,
                window: VecDeque::new(),
            }),
            config,
            window_len: 100,
        }
    }

    /// Number of recent lookups the hit rate is computed over.
    pub fn with_hit_rate_window(mut self, window: usize) -> Self {
        self.window_len = window.max(1);
        self
    }

    /// Look up a key, refreshing its recency if present.
    pub fn get(&self, key: &str) -> Lookup<V> {
        if !self.config.enabled {
            return Lookup::Absent;
        }

        let mut inner = self.inner.lock();
        let now = Instant::now();

        // get_mut promotes the entry, stale or not
        let lookup = match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.last_accessed_at = now;

                if entry.is_expired(now) {
                    Lookup::Stale {
                        value: entry.value.clone(),
                        expired_for: entry.expired_for(now),
                    }
                } else {
                    Lookup::Fresh(entry.value.clone())
                }
            }
            None => Lookup::Absent,
        };

        if lookup.is_stale() {
            inner.stale_reads += 1;
        }
        inner.record_lookup(lookup.is_fresh(), self.window_len);
        lookup
    }

    /// Store a value with the default TTL.
    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.put(key, value, self.config.default_ttl);
    }

    /// Store a value with its own TTL.
    ///
    /// Inserting a new key into a full cache evicts exactly one entry, the
    /// least recently accessed.
    pub fn put(&self, key: impl Into<String>, value: V, ttl: Duration) {
        if !self.config.enabled {
            return;
        }

        let key = key.into();
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let replacing = inner.entries.contains(key.as_str());

        let entry = CacheEntry {
            value,
            created_at: now,
            ttl,
            last_accessed_at: now,
        };

        // push hands back either the overwritten entry or the evicted one
        if let Some((victim, _)) = inner.entries.push(key, entry) {
            if !replacing {
                inner.evictions += 1;
                tracing::debug!(key = %victim, "Evicted least recently used entry");
            }
        }
    }

    /// Drop a single entry.
    pub fn remove(&self, key: &str) -> Option<V> {
        self.inner.lock().entries.pop(key).map(|entry| entry.value)
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            inner.entries.pop(key.as_str());
        }

        if !expired.is_empty() {
            tracing::debug!(purged = expired.len(), "Purged expired cache entries");
        }
        expired.len()
    }

    /// Clear the cache.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
    }

    /// Number of entries, stale ones included.
    pub fn size(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Whether the cache stores anything at all.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Configuration in use.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// When `key` was last read or written. Does not affect recency.
    pub fn last_accessed(&self, key: &str) -> Option<Instant> {
        self.inner
            .lock()
            .entries
            .peek(key)
            .map(|entry| entry.last_accessed_at)
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let recent_samples = inner.window.len();
        let recent_hit_rate = (recent_samples > 0).then(|| {
            inner.window.iter().filter(|hit| **hit).count() as f64 / recent_samples as f64
        });

        CacheStats {
            size: inner.entries.len(),
            capacity: self.config.capacity,
            hits: inner.hits,
            misses: inner.misses,
            stale_reads: inner.stale_reads,
            evictions: inner.evictions,
            recent_hit_rate,
            recent_samples,
        }
    }
}

impl<V: Clone> Default for ResultCache<V> {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn cache(capacity: usize, ttl_ms: u64) -> ResultCache<i32> {
        ResultCache::new(CacheConfig {
            enabled: true,
            capacity,
            default_ttl: Duration::from_millis(ttl_ms),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_operations() {
        let cache = cache(10, 1000);

        // Cache miss
        assert_eq!(cache.get("subject"), Lookup::Absent);

        cache.insert("subject", 42);

        // Cache hit
        assert_eq!(cache.get("subject"), Lookup::Fresh(42));
        assert_eq!(cache.size(), 1);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.recent_hit_rate, Some(0.5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_oldest() {
        let cache = cache(2, 1000);
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.insert("c", 3);

        assert_eq!(cache.get("a"), Lookup::Absent);
        assert_eq!(cache.get("b"), Lookup::Fresh(2));
        assert_eq!(cache.get("c"), Lookup::Fresh(3));
        assert_eq!(cache.size(), 2);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_access_refreshes_recency() {
        let cache = cache(2, 1000);
        cache.insert("a", 1);
        cache.insert("b", 2);

        // Touch "a" so "b" becomes the eviction candidate.
        assert!(cache.get("a").is_fresh());
        cache.insert("c", 3);

        assert_eq!(cache.get("a"), Lookup::Fresh(1));
        assert_eq!(cache.get("b"), Lookup::Absent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_read_refreshes_recency() {
        let cache = cache(2, 100);
        cache.insert("a", 1);
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.put("b", 2, Duration::from_secs(60));
        let written_at = cache.last_accessed("a").unwrap();

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(cache.get("a").is_stale());
        assert!(cache.last_accessed("a").unwrap() > written_at);

        // "b" is now least recently used even though "a" is expired.
        cache.insert("c", 3);
        assert_eq!(cache.get("b"), Lookup::Absent);
        assert!(cache.get("a").is_stale());
        assert_eq!(cache.get("c"), Lookup::Fresh(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_does_not_evict() {
        let cache = cache(2, 1000);
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.insert("a", 10);

        assert_eq!(cache.size(), 2);
        assert_eq!(cache.get("a"), Lookup::Fresh(10));
        assert_eq!(cache.get("b"), Lookup::Fresh(2));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_reads_as_stale() {
        let cache = cache(4, 500);
        cache.insert("quote", 7);

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(cache.get("quote"), Lookup::Fresh(7));

        tokio::time::advance(Duration::from_millis(100)).await;
        match cache.get("quote") {
            Lookup::Stale { value, expired_for } => {
                assert_eq!(value, 7);
                assert_eq!(expired_for, Duration::from_millis(100));
            }
            other => panic!("expected stale entry, got {other:?}"),
        }
        assert_eq!(cache.size(), 1);
        assert_eq!(cache.stats().stale_reads, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_entry_ttl() {
        let cache = cache(4, 1000);
        cache.put("short", 1, Duration::from_millis(100));
        cache.put("long", 2, Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.get("short").is_stale());
        assert!(cache.get("long").is_fresh());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired_removes_only_expired() {
        let cache = cache(4, 1000);
        cache.put("old", 1, Duration::from_millis(100));
        cache.put("new", 2, Duration::from_secs(60));

        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.get("old"), Lookup::Absent);
        assert!(cache.get("new").is_fresh());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_entries_are_evicted_like_any_other() {
        let cache = cache(2, 100);
        cache.insert("a", 1);
        tokio::time::advance(Duration::from_millis(200)).await;
        cache.insert("b", 2);
        cache.insert("c", 3);

        assert_eq!(cache.get("a"), Lookup::Absent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_cache_stores_nothing() {
        let cache: ResultCache<i32> = ResultCache::new(CacheConfig {
            enabled: false,
            ..Default::default()
        });
        cache.insert("a", 1);

        assert_eq!(cache.get("a"), Lookup::Absent);
        assert_eq!(cache.size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hit_rate_window_slides() {
        let cache = cache(4, 1000).with_hit_rate_window(4);
        cache.insert("a", 1);

        for _ in 0..4 {
            cache.get("missing");
        }
        assert_eq!(cache.stats().recent_hit_rate, Some(0.0));

        for _ in 0..4 {
            cache.get("a");
        }
        let stats = cache.stats();
        assert_eq!(stats.recent_hit_rate, Some(1.0));
        assert_eq!(stats.recent_samples, 4);
        assert_eq!(stats.misses, 4);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Put(u8),
        Get(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![(0u8..8).prop_map(Op::Put), (0u8..8).prop_map(Op::Get)]
    }

    proptest! {
        #[test]
        fn prop_matches_lru_model(ops in proptest::collection::vec(op(), 0..64)) {
            let capacity = 3;
            let cache: ResultCache<u8> = ResultCache::new(CacheConfig {
                enabled: true,
                capacity,
                default_ttl: Duration::from_secs(3600),
            });
            // Most recently used last.
            let mut model: Vec<u8> = Vec::new();

            for op in ops {
                match op {
                    Op::Put(k) => {
                        cache.insert(k.to_string(), k);
                        if let Some(pos) = model.iter().position(|m| *m == k) {
                            model.remove(pos);
                        } else if model.len() == capacity {
                            model.remove(0);
                        }
                        model.push(k);
                    }
                    Op::Get(k) => {
                        let found = cache.get(&k.to_string()).into_value();
                        let pos = model.iter().position(|m| *m == k);
                        prop_assert_eq!(found.is_some(), pos.is_some());
                        if let Some(pos) = pos {
                            model.remove(pos);
                            model.push(k);
                        }
                    }
                }
                prop_assert!(cache.size() <= capacity);
                prop_assert_eq!(cache.size(), model.len());
            }
        }
    }
}
