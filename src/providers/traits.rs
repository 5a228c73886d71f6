//! Collaborator traits.
//!
//! Mimir does not generate text or search vectors itself. It reaches the
//! language model and the vector store through these two narrow traits, so
//! the admission and caching layers stay independent of any particular
//! backend. Decorators such as [`RetryingBackend`](super::RetryingBackend)
//! and [`CachedRetriever`](super::CachedRetriever) wrap them transparently.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;

use crate::Result;
use crate::types::{GenerationRequest, ScoredDocument, SearchQuery};

/// Answer text delivered piece by piece.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

// ============================================================================
// Inference Backend
// ============================================================================

/// A language model that answers a question given retrieved context.
///
/// Calls are slow and resource-bound; the [`Gateway`](crate::Gateway) routes
/// them through the [`InferenceQueue`](crate::queue::InferenceQueue).
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Backend name for logging/debugging.
    fn name(&self) -> &str;

    /// Produce an answer for `request`.
    async fn generate(&self, request: &GenerationRequest) -> Result<String>;

    /// Produce an answer for `request` as a stream of text pieces.
    ///
    /// Errors establishing the stream are returned directly; errors after
    /// that arrive as stream items. Default implementation yields the whole
    /// [`generate()`](Self::generate) answer as one piece.
    async fn generate_stream(&self, request: &GenerationRequest) -> Result<TextStream> {
        let answer = self.generate(request).await?;
        Ok(Box::pin(futures_util::stream::once(async move { Ok(answer) })))
    }

    /// Verify the backend is reachable.
    ///
    /// Default implementation assumes it is.
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Retriever
// ============================================================================

/// A vector store that returns the chunks most similar to a query.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Retriever name for logging/debugging.
    fn name(&self) -> &str;

    /// Return up to `query.k` chunks, most relevant first.
    async fn search(&self, query: &SearchQuery) -> Result<Vec<ScoredDocument>>;
}

/// Retriever for deployments without a document index.
///
/// Always returns no documents, so the model answers from the question alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetrieval;

#[async_trait]
impl Retriever for NoRetrieval {
    fn name(&self) -> &str {
        "none"
    }

    async fn search(&self, _query: &SearchQuery) -> Result<Vec<ScoredDocument>> {
        Ok(Vec::new())
    }
}
