//! External collaborators and their decorators.
//!
//! - [`InferenceBackend`]: the language model ([`OllamaBackend`]), optionally
//!   wrapped in [`RetryingBackend`].
//! - [`Retriever`]: the vector store, wrapped in [`CachedRetriever`] by the
//!   [`Gateway`](crate::Gateway) so repeated searches hit the search cache.

pub mod ollama;
pub mod retrieval;
pub mod retry;
pub mod traits;

pub use ollama::{OllamaBackend, OllamaConfig};
pub use retrieval::{CachedRetriever, search_key};
pub use retry::{RetryConfig, RetryingBackend};
pub use traits::{InferenceBackend, NoRetrieval, Retriever, TextStream};
