//! Search-result caching in front of a [`Retriever`].

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::traits::Retriever;
use crate::Result;
use crate::cache::{TtlCache, cache_key};
use crate::types::{ScoredDocument, SearchQuery};

/// Decorator that memoizes similarity searches.
///
/// Keyed on (query text, k, filter). Any change to the indexed documents
/// makes every cached result potentially stale, so document mutations must
/// call [`invalidate()`](Self::invalidate), which clears the whole cache.
pub struct CachedRetriever {
    inner: Arc<dyn Retriever>,
    cache: Arc<TtlCache<Vec<ScoredDocument>>>,
}

impl CachedRetriever {
    pub fn new(inner: Arc<dyn Retriever>, cache: Arc<TtlCache<Vec<ScoredDocument>>>) -> Self {
        Self { inner, cache }
    }

    /// The underlying search cache.
    pub fn cache(&self) -> &TtlCache<Vec<ScoredDocument>> {
        &self.cache
    }

    /// Drop every cached result after the document set changed.
    pub fn invalidate(&self) {
        self.cache.clear();
    }
}

/// Cache key for a search: query text, `k` and the canonical filter.
pub fn search_key(query: &SearchQuery) -> String {
    let k = query.k.to_string();
    let filter = query.filter_fingerprint();
    cache_key("search", &[query.text.as_str(), k.as_str(), filter.as_str()])
}

#[async_trait]
impl Retriever for CachedRetriever {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<ScoredDocument>> {
        let key = search_key(query);

        if let Some(hit) = self.cache.get(&key) {
            debug!(retriever = self.inner.name(), results = hit.len(), "search cache hit");
            return Ok(hit);
        }

        let results = self.inner.search(query).await?;
        self.cache.set(key, results.clone());
        debug!(retriever = self.inner.name(), results = results.len(), "search cache miss");
        Ok(results)
    }
}
