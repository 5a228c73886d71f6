//! Builder for configuring gateway instances

use std::sync::Arc;

use super::Gateway;
use crate::Result;
use crate::config::Config;
use crate::providers::{InferenceBackend, NoRetrieval, OllamaBackend, Retriever, RetryingBackend};

/// Main entry point for creating gateway instances.
pub struct Mimir;

impl Mimir {
    /// Create a new builder for configuring the gateway.
    pub fn builder() -> MimirBuilder {
        MimirBuilder::new()
    }
}

/// Builder for configuring gateway instances.
///
/// Without an explicit backend the gateway talks to the Ollama server named
/// in `config.ollama`, wrapped in retry logic from `config.retry`. Without an
/// explicit retriever, questions are answered with an empty context.
pub struct MimirBuilder {
    config: Config,
    backend: Option<Arc<dyn InferenceBackend>>,
    retriever: Option<Arc<dyn Retriever>>,
}

impl MimirBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            backend: None,
            retriever: None,
        }
    }

    /// Use this configuration instead of the defaults.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Use a custom inference backend. It is used as given, no retry
    /// decorator is added.
    pub fn backend(mut self, backend: Arc<dyn InferenceBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Use a document store for retrieval.
    pub fn retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    /// Build the gateway. The inference queue is not started.
    pub fn build(self) -> Result<Gateway> {
        self.config.validate()?;

        let backend = match self.backend {
            Some(backend) => backend,
            None => {
                let ollama: Arc<dyn InferenceBackend> =
                    Arc::new(OllamaBackend::new(self.config.ollama.clone())?);
                Arc::new(RetryingBackend::new(ollama, self.config.retry.clone()))
            }
        };
        let retriever = self
            .retriever
            .unwrap_or_else(|| Arc::new(NoRetrieval) as Arc<dyn Retriever>);

        Ok(Gateway::new(self.config, backend, retriever))
    }
}

impl Default for MimirBuilder {
    fn default() -> Self {
        Self::new()
    }
}
