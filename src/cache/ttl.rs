//! Bounded LRU + TTL cache.
//!
//! [`TtlCache`] is the memoization layer shared by the search and response
//! paths. Entries expire lazily on read (an expired hit is removed and
//! counted as a miss) and are reclaimed in bulk by
//! [`cleanup_expired()`](TtlCache::cleanup_expired). When full, the
//! least-recently-accessed entry is evicted before the new one goes in.
//!
//! All operations take a single mutex per instance and never suspend, so the
//! cache is safe to call from async handlers and worker threads alike.

use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::telemetry;

/// Configuration for a [`TtlCache`].
///
/// ```rust
/// # use mimir::cache::CacheConfig;
/// # use std::time::Duration;
/// let config = CacheConfig::new()
///     .max_size(1_000)
///     .ttl(Duration::from_secs(600));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of live entries. Default: 256.
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// Time-to-live for each entry, measured from its last `set`. Default: 1 hour.
    #[serde(
        rename = "ttl_seconds",
        default = "default_ttl",
        with = "crate::config::duration_secs"
    )]
    pub ttl: Duration,
}

fn default_max_size() -> usize {
    256
}

fn default_ttl() -> Duration {
    Duration::from_secs(3600)
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            ttl: default_ttl(),
        }
    }
}

impl CacheConfig {
    /// Create a new config with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults for similarity-search results: 512 entries, 30 minutes.
    pub fn search() -> Self {
        Self {
            max_size: 512,
            ttl: Duration::from_secs(1800),
        }
    }

    /// Defaults for full model responses: 256 entries, 1 hour.
    pub fn response() -> Self {
        Self::default()
    }

    /// Set the maximum number of entries.
    pub fn max_size(mut self, n: usize) -> Self {
        self.max_size = n;
        self
    }

    /// Set the time-to-live for entries.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

/// Point-in-time snapshot of a cache's counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub name: String,
    pub size: usize,
    pub max_size: usize,
    pub ttl_seconds: u64,
    pub hits: u64,
    pub misses: u64,
    /// `hits / (hits + misses) * 100`, rounded to two decimals; 0 before any lookup.
    pub hit_rate_percent: f64,
}

struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.stored_at) > ttl
    }
}

struct Inner<V> {
    entries: LruCache<String, CacheEntry<V>>,
    hits: u64,
    misses: u64,
}

/// Thread-safe key-value cache bounded by size and age.
///
/// Keys are opaque strings; callers derive them from the semantically
/// relevant inputs with [`cache_key`](super::cache_key). Values are cloned
/// out on hit, so wrap large payloads in an `Arc`.
pub struct TtlCache<V> {
    name: String,
    max_size: usize,
    ttl: Duration,
    inner: Mutex<Inner<V>>,
}

impl<V: Clone> TtlCache<V> {
    /// Create an empty cache. `name` labels logs, metrics and stats.
    ///
    /// A `max_size` of zero is treated as one.
    pub fn new(name: impl Into<String>, config: &CacheConfig) -> Self {
        let max_size = config.max_size.max(1);
        let capacity = NonZeroUsize::new(max_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            name: name.into(),
            max_size,
            ttl: config.ttl,
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                hits: 0,
                misses: 0,
            }),
        }
    }

    /// Purpose label given at construction.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a live value, promoting it to most-recently-used.
    ///
    /// An entry older than the TTL is removed and reported as a miss.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.lock();
        let now = Instant::now();

        let expired = inner
            .entries
            .peek(key)
            .map(|entry| entry.is_expired(now, self.ttl));

        match expired {
            Some(false) => {
                inner.hits += 1;
                metrics::counter!(telemetry::CACHE_HITS_TOTAL, "cache" => self.name.clone())
                    .increment(1);
                inner.entries.get(key).map(|entry| entry.value.clone())
            }
            Some(true) => {
                inner.entries.pop(key);
                inner.misses += 1;
                metrics::counter!(telemetry::CACHE_MISSES_TOTAL, "cache" => self.name.clone())
                    .increment(1);
                None
            }
            None => {
                inner.misses += 1;
                metrics::counter!(telemetry::CACHE_MISSES_TOTAL, "cache" => self.name.clone())
                    .increment(1);
                None
            }
        }
    }

    /// Insert or overwrite a value, resetting its age.
    ///
    /// When the cache is full and `key` is new, least-recently-used entries
    /// are evicted first so the size never exceeds `max_size`.
    pub fn set(&self, key: impl Into<String>, value: V) {
        let key = key.into();
        let mut inner = self.lock();

        if !inner.entries.contains(&key) {
            while inner.entries.len() >= self.max_size {
                if inner.entries.pop_lru().is_none() {
                    break;
                }
                metrics::counter!(telemetry::CACHE_EVICTIONS_TOTAL, "cache" => self.name.clone())
                    .increment(1);
            }
        }

        inner.entries.put(
            key,
            CacheEntry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    /// Remove a single entry. Returns whether it was present.
    pub fn invalidate(&self, key: &str) -> bool {
        self.lock().entries.pop(key).is_some()
    }

    /// Remove every entry. Hit/miss counters are kept.
    pub fn clear(&self) {
        let mut inner = self.lock();
        let removed = inner.entries.len();
        inner.entries.clear();
        info!(cache = %self.name, removed, "cache cleared");
    }

    /// Remove all entries past their TTL and return how many were dropped.
    ///
    /// Lazy expiry in [`get()`](Self::get) already keeps reads correct; this
    /// only reclaims space held by entries nobody asks for anymore.
    pub fn cleanup_expired(&self) -> usize {
        let mut inner = self.lock();
        let now = Instant::now();

        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now, self.ttl))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            inner.entries.pop(key.as_str());
        }

        if !expired.is_empty() {
            debug!(cache = %self.name, removed = expired.len(), "expired entries swept");
        }
        expired.len()
    }

    /// Number of entries currently held, including not-yet-swept expired ones.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of size and hit/miss counters.
    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        let total = inner.hits + inner.misses;
        let hit_rate = if total > 0 {
            inner.hits as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        CacheStats {
            name: self.name.clone(),
            size: inner.entries.len(),
            max_size: self.max_size,
            ttl_seconds: self.ttl.as_secs(),
            hits: inner.hits,
            misses: inner.misses,
            hit_rate_percent: (hit_rate * 100.0).round() / 100.0,
        }
    }

    // Every critical section leaves `Inner` consistent, so a poisoned lock
    // is still safe to reuse.
    fn lock(&self) -> MutexGuard<'_, Inner<V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max_size: usize) -> TtlCache<u32> {
        TtlCache::new("test", &CacheConfig::new().max_size(max_size))
    }

    #[test]
    fn overwrite_does_not_evict() {
        let cache = cache(2);
        cache.set("a", 1);
        cache.set("b", 2);
        cache.set("a", 10);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), Some(10));
        assert_eq!(cache.get("b"), Some(2));
    }

    #[test]
    fn overwrite_refreshes_recency() {
        let cache = cache(2);
        cache.set("a", 1);
        cache.set("b", 2);
        cache.set("a", 3);
        cache.set("c", 4);

        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(3));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let cache = cache(0);
        cache.set("a", 1);
        cache.set("b", 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("b"), Some(2));
    }

    #[test]
    fn stats_before_any_lookup() {
        let stats = cache(4).stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.hit_rate_percent, 0.0);
        assert_eq!(stats.ttl_seconds, 3600);
    }

    #[test]
    fn hit_rate_is_rounded() {
        let cache = cache(4);
        cache.set("a", 1);
        cache.get("a");
        cache.get("x");
        cache.get("y");
        // 1 / 3 = 33.333...
        assert_eq!(cache.stats().hit_rate_percent, 33.33);
    }

    #[test]
    fn invalidate_missing_key_is_false() {
        let cache = cache(4);
        assert!(!cache.invalidate("nope"));
    }
}
