//! The request pipeline tying limiters, caches and the queue together.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, instrument, warn};

use super::health::{BackendHealth, BackendStatus, HealthSnapshot, HealthStatus, MaintenanceReport};
use crate::cache::{TtlCache, cache_key};
use crate::config::Config;
use crate::limiter::{ClientIdentity, RateLimiter};
use crate::providers::{CachedRetriever, InferenceBackend, Retriever};
use crate::queue::InferenceQueue;
use crate::types::{
    ChatEvent, ChatRequest, ChatResponse, GenerationRequest, ScoredDocument, SearchQuery,
    SourceRef,
};
use crate::{MimirError, Result};

/// Separator between documents in the model context.
pub const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";

/// Events buffered between a generating worker and the stream's reader.
pub const STREAM_BUFFER: usize = 64;

/// Streamed answer, see [`Gateway::chat_stream()`].
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<ChatEvent>> + Send>>;

/// Retrieval-augmented chat service.
///
/// Cheap to clone; clones share every cache, limiter and the queue. Create
/// one with [`Mimir::builder()`](super::Mimir::builder), then call
/// [`start()`](Self::start) before submitting questions.
#[derive(Clone)]
pub struct Gateway {
    config: Arc<Config>,
    backend: Arc<dyn InferenceBackend>,
    retriever: Arc<CachedRetriever>,
    responses: Arc<TtlCache<String>>,
    chat_limiter: Arc<RateLimiter>,
    upload_limiter: Arc<RateLimiter>,
    general_limiter: Arc<RateLimiter>,
    queue: Arc<InferenceQueue<String>>,
    task_seq: Arc<AtomicU64>,
}

impl Gateway {
    pub(crate) fn new(
        config: Config,
        backend: Arc<dyn InferenceBackend>,
        retriever: Arc<dyn Retriever>,
    ) -> Self {
        let searches = Arc::new(TtlCache::new("search", &config.cache.search));
        let responses = Arc::new(TtlCache::new("response", &config.cache.response));

        Self {
            backend,
            retriever: Arc::new(CachedRetriever::new(retriever, searches)),
            responses,
            chat_limiter: Arc::new(RateLimiter::new("chat", &config.rate_limit.chat)),
            upload_limiter: Arc::new(RateLimiter::new("upload", &config.rate_limit.upload)),
            general_limiter: Arc::new(RateLimiter::new("general", &config.rate_limit.general)),
            queue: Arc::new(InferenceQueue::new(config.queue.clone())),
            task_seq: Arc::new(AtomicU64::new(0)),
            config: Arc::new(config),
        }
    }

    /// Start the inference workers. Requires a tokio runtime.
    pub fn start(&self) {
        self.queue.start();
    }

    /// Stop the inference workers; outstanding questions resolve as
    /// [`MimirError::Cancelled`].
    pub async fn shutdown(&self) {
        self.queue.stop().await;
    }

    /// Answer a question from the indexed documents.
    ///
    /// Rate limited per client; a blank question is rejected before it
    /// spends a token. Answers to history-free questions are cached
    /// keyed on the question and its retrieved context, so a document change
    /// that alters retrieval also changes the key.
    #[instrument(skip_all, fields(history = request.history.len()))]
    pub async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        let question = validate_question(&request.question)?;
        let client = self.client_key(&request.client);
        self.chat_limiter.acquire(&client, 1)?;

        let (context, sources) = self.retrieve(question).await?;

        let cache_key = request
            .history
            .is_empty()
            .then(|| response_key(question, &context));

        if let Some(key) = &cache_key
            && let Some(answer) = self.responses.get(key)
        {
            debug!(client = %client, "answer served from response cache");
            return Ok(ChatResponse {
                answer,
                sources,
                cached: true,
            });
        }

        let task_id = self.next_task_id(question);
        let backend = Arc::clone(&self.backend);
        let generation = GenerationRequest {
            question: question.to_string(),
            context,
            history: request.history,
        };
        let answer = self
            .queue
            .submit(task_id, move || async move { backend.generate(&generation).await })
            .await?;

        if let Some(key) = cache_key {
            self.responses.set(key, answer.clone());
        }

        Ok(ChatResponse {
            answer,
            sources,
            cached: false,
        })
    }

    /// Answer a question as a stream of [`ChatEvent`]s.
    ///
    /// Rate limiting, retrieval and queue admission happen before this
    /// returns, so rejections are ordinary errors rather than stream items.
    /// Streamed answers bypass the response cache. The stream ends with
    /// [`ChatEvent::Done`] carrying the sources, or with an error.
    ///
    /// Generation holds a queue worker until the model finishes. A reader
    /// more than [`STREAM_BUFFER`] events behind pauses it, and dropping the
    /// stream cancels it at the next piece of text.
    #[instrument(skip_all, fields(history = request.history.len()))]
    pub async fn chat_stream(&self, request: ChatRequest) -> Result<ChatStream> {
        let question = validate_question(&request.question)?;
        let client = self.client_key(&request.client);
        self.chat_limiter.acquire(&client, 1)?;

        let (context, sources) = self.retrieve(question).await?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let events = tx.clone();
        let backend = Arc::clone(&self.backend);
        let generation = GenerationRequest {
            question: question.to_string(),
            context,
            history: request.history,
        };
        let ticket = self
            .queue
            .try_submit(self.next_task_id(question), move || async move {
                let mut pieces = backend.generate_stream(&generation).await?;
                let mut answer = String::new();
                while let Some(piece) = pieces.next().await {
                    let text = piece?;
                    answer.push_str(&text);
                    if events.send(Ok(ChatEvent::Content { text })).await.is_err() {
                        return Err(MimirError::Cancelled);
                    }
                }
                if answer.trim().is_empty() {
                    return Err(MimirError::EmptyResponse);
                }
                Ok(answer)
            })?;

        tokio::spawn(async move {
            let task_id = ticket.id().to_string();
            let last = match ticket.wait().await {
                Ok(answer) => {
                    debug!(task_id = %task_id, chars = answer.len(), "streamed answer complete");
                    Ok(ChatEvent::Done { sources })
                }
                Err(e) => {
                    debug!(task_id = %task_id, error = %e, "streamed answer failed");
                    Err(e)
                }
            };
            // The reader may already be gone.
            let _ = tx.send(last).await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    /// Admit or reject a document upload from this client.
    pub fn admit_upload(&self, client: &ClientIdentity) -> Result<()> {
        self.upload_limiter.acquire(&self.client_key(client), 1)
    }

    /// Admit or reject any other request from this client.
    pub fn admit_general(&self, client: &ClientIdentity) -> Result<()> {
        self.general_limiter.acquire(&self.client_key(client), 1)
    }

    /// Record that documents were added or removed. Every cached search
    /// result may now be stale and is dropped.
    pub fn documents_changed(&self) {
        self.retriever.invalidate();
        info!("document set changed, search cache cleared");
    }

    /// Check the backend and collect component statistics.
    pub async fn health(&self) -> HealthSnapshot {
        let backend = match self.backend.health_check().await {
            Ok(()) => BackendHealth {
                name: self.backend.name().to_string(),
                status: BackendStatus::Connected,
                error: None,
            },
            Err(e) => {
                warn!(backend = self.backend.name(), error = %e, "backend health check failed");
                BackendHealth {
                    name: self.backend.name().to_string(),
                    status: BackendStatus::Disconnected,
                    error: Some(e.to_string()),
                }
            }
        };
        let queue = self.queue.stats();

        let status = if backend.status == BackendStatus::Connected && queue.running {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        HealthSnapshot {
            status,
            backend,
            queue,
            caches: vec![self.retriever.cache().stats(), self.responses.stats()],
            limiters: vec![
                self.chat_limiter.stats(),
                self.upload_limiter.stats(),
                self.general_limiter.stats(),
            ],
        }
    }

    /// Drop expired cache entries and idle client buckets.
    pub fn run_maintenance(&self) -> MaintenanceReport {
        let report = MaintenanceReport {
            expired_search_entries: self.retriever.cache().cleanup_expired(),
            expired_response_entries: self.responses.cleanup_expired(),
            stale_clients: self.chat_limiter.cleanup()
                + self.upload_limiter.cleanup()
                + self.general_limiter.cleanup(),
        };
        if report.total() > 0 {
            info!(
                search = report.expired_search_entries,
                response = report.expired_response_entries,
                clients = report.stale_clients,
                "maintenance sweep"
            );
        }
        report
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn queue(&self) -> &InferenceQueue<String> {
        &self.queue
    }

    pub fn search_cache(&self) -> &TtlCache<Vec<ScoredDocument>> {
        self.retriever.cache()
    }

    pub fn response_cache(&self) -> &TtlCache<String> {
        &self.responses
    }

    pub fn chat_limiter(&self) -> &RateLimiter {
        &self.chat_limiter
    }

    pub fn upload_limiter(&self) -> &RateLimiter {
        &self.upload_limiter
    }

    pub fn general_limiter(&self) -> &RateLimiter {
        &self.general_limiter
    }

    /// Search for `question` and format the hits for the model and the caller.
    async fn retrieve(&self, question: &str) -> Result<(String, Vec<SourceRef>)> {
        let query = SearchQuery::new(question, self.config.retrieval.k);
        let documents = self.retriever.search(&query).await?;
        let sources = documents.iter().map(SourceRef::from).collect();
        Ok((format_context(&documents), sources))
    }

    fn client_key(&self, client: &ClientIdentity) -> String {
        client.key(self.config.rate_limit.trust_forwarded_for)
    }

    fn next_task_id(&self, question: &str) -> String {
        let seq = self.task_seq.fetch_add(1, Ordering::Relaxed);
        let mut hasher = DefaultHasher::new();
        question.hash(&mut hasher);
        seq.hash(&mut hasher);
        format!("chat-{:08x}", hasher.finish() as u32)
    }
}

fn validate_question(question: &str) -> Result<&str> {
    let question = question.trim();
    if question.is_empty() {
        return Err(MimirError::InvalidInput("question must not be empty".into()));
    }
    Ok(question)
}

/// Join retrieved documents into one context block for the model.
pub fn format_context(documents: &[ScoredDocument]) -> String {
    documents
        .iter()
        .map(|doc| format!("Source: {}\n{}", doc.source, doc.content))
        .collect::<Vec<_>>()
        .join(CONTEXT_SEPARATOR)
}

/// Response cache key for a question answered from `context`.
pub fn response_key(question: &str, context: &str) -> String {
    cache_key("response", &[question, context])
}
