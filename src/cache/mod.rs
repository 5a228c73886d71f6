//! Caching subsystem.
//!
//! One generic building block, [`TtlCache`], instantiated once per purpose
//! by the [`Gateway`](crate::Gateway):
//!
//! - **search**: similarity-search results keyed on (query, k, filter).
//!   Cleared wholesale whenever indexed documents change, see
//!   [`CachedRetriever`](crate::providers::CachedRetriever).
//! - **response**: full model answers keyed on (question, assembled
//!   context). Only populated for requests without conversation history.
//!
//! The cache never derives keys itself. Callers canonicalise their inputs
//! with [`cache_key()`], which keeps the cache ignorant of what it stores.

mod ttl;

pub use ttl::{CacheConfig, CacheStats, TtlCache};

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Compute a cache key from a namespace and the inputs that determine the
/// cached value.
///
/// Uses `DefaultHasher` (SipHash), deterministic within a process lifetime,
/// which is all an in-memory cache needs. Each part is terminated by the
/// `Hash` impl for `str`, so `["ab", "c"]` and `["a", "bc"]` differ.
pub fn cache_key(namespace: &str, parts: &[&str]) -> String {
    let mut hasher = DefaultHasher::new();
    namespace.hash(&mut hasher);
    for part in parts {
        part.hash(&mut hasher);
    }
    format!("{namespace}:{:016x}", hasher.finish())
}
