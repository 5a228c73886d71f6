//! Retrieval types exchanged with the vector store.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A similarity search request.
///
/// `filter` is a flat metadata match; a `BTreeMap` keeps its iteration
/// order stable so equal filters always produce the same cache key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub text: String,
    pub k: usize,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub filter: BTreeMap<String, String>,
}

impl SearchQuery {
    /// Search for the `k` chunks closest to `text`.
    pub fn new(text: impl Into<String>, k: usize) -> Self {
        Self {
            text: text.into(),
            k,
            filter: BTreeMap::new(),
        }
    }

    /// Restrict results to chunks whose metadata `key` equals `value`.
    pub fn with_filter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.filter.insert(key.into(), value.into());
        self
    }

    /// Canonical form of the filter, used as a cache key component.
    pub(crate) fn filter_fingerprint(&self) -> String {
        self.filter
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }
}

/// A retrieved chunk and its relevance score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredDocument {
    pub content: String,
    /// Originating document (file name or URL).
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    pub score: f32,
}

impl ScoredDocument {
    pub fn new(content: impl Into<String>, source: impl Into<String>, score: f32) -> Self {
        Self {
            content: content.into(),
            source: source.into(),
            page: None,
            score,
        }
    }

    pub fn with_page(mut self, page: u32) -> Self {
        self.page = Some(page);
        self
    }
}
