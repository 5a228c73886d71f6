//! End-to-end tests of the chat pipeline with in-memory collaborators.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::Semaphore;
use tokio_test::assert_ok;

use mimir::cache::CacheConfig;
use mimir::gateway::{BackendStatus, HealthStatus};
use mimir::limiter::LimiterConfig;
use mimir::providers::{InferenceBackend, Retriever, TextStream};
use mimir::queue::QueueConfig;
use mimir::{
    ChatEvent, ChatRequest, ChatStream, ClientIdentity, Config, Gateway, GenerationRequest,
    Message, MimirError, Mimir, Result, ScoredDocument, SearchQuery,
};

// ============================================================================
// Mock collaborators
// ============================================================================

#[derive(Default)]
struct EchoBackend {
    calls: AtomicUsize,
    last_request: Mutex<Option<GenerationRequest>>,
    fail_health: bool,
}

impl EchoBackend {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceBackend for EchoBackend {
    fn name(&self) -> &str {
        "echo"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request.clone());
        Ok(format!("answer to: {}", request.question))
    }

    async fn health_check(&self) -> Result<()> {
        if self.fail_health {
            Err(MimirError::Http("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

struct FailingBackend;

#[async_trait]
impl InferenceBackend for FailingBackend {
    fn name(&self) -> &str {
        "failing"
    }

    async fn generate(&self, _request: &GenerationRequest) -> Result<String> {
        Err(MimirError::Api {
            status: 500,
            message: "out of memory".into(),
        })
    }
}

/// Blocks every generation until the test hands out a permit.
struct GatedBackend {
    gate: Arc<Semaphore>,
    started: AtomicUsize,
}

#[async_trait]
impl InferenceBackend for GatedBackend {
    fn name(&self) -> &str {
        "gated"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| MimirError::Backend(e.to_string()))?;
        permit.forget();
        Ok(request.question.clone())
    }
}

/// Streams a fixed script of pieces; an `Err` entry fails the stream there.
struct ScriptedStreamBackend {
    script: Vec<std::result::Result<&'static str, u16>>,
}

#[async_trait]
impl InferenceBackend for ScriptedStreamBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, _request: &GenerationRequest) -> Result<String> {
        Err(MimirError::Backend("streaming only".into()))
    }

    async fn generate_stream(&self, _request: &GenerationRequest) -> Result<TextStream> {
        let items: Vec<Result<String>> = self
            .script
            .iter()
            .map(|step| match step {
                Ok(text) => Ok(text.to_string()),
                Err(status) => Err(MimirError::Api {
                    status: *status,
                    message: "stream broke".into(),
                }),
            })
            .collect();
        Ok(Box::pin(futures_util::stream::iter(items)))
    }
}

struct StaticRetriever {
    documents: Vec<ScoredDocument>,
    calls: AtomicUsize,
}

impl StaticRetriever {
    fn new() -> Self {
        Self {
            documents: vec![
                ScoredDocument::new("Refunds are accepted within 30 days.", "policy.pdf", 0.92)
                    .with_page(2),
                ScoredDocument::new("x".repeat(300), "long.txt", 0.41),
            ],
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Retriever for StaticRetriever {
    fn name(&self) -> &str {
        "static"
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<ScoredDocument>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.documents.iter().take(query.k).cloned().collect())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn gateway_with(
    config: Config,
    backend: Arc<dyn InferenceBackend>,
    retriever: Arc<StaticRetriever>,
) -> Gateway {
    let gateway = Mimir::builder()
        .config(config)
        .backend(backend)
        .retriever(retriever)
        .build()
        .expect("gateway should build");
    gateway.start();
    gateway
}

fn client(addr: &str) -> ClientIdentity {
    ClientIdentity::peer(addr)
}

async fn drain(stream: ChatStream) -> Vec<Result<ChatEvent>> {
    tokio::time::timeout(Duration::from_secs(5), stream.collect::<Vec<_>>())
        .await
        .expect("stream should finish")
}

// ============================================================================
// Pipeline
// ============================================================================

#[tokio::test]
async fn answers_with_sources_and_context() {
    let backend = Arc::new(EchoBackend::default());
    let retriever = Arc::new(StaticRetriever::new());
    let gateway = gateway_with(Config::default(), backend.clone(), retriever.clone());

    let response = gateway
        .chat(ChatRequest::new("What is the refund policy?").with_client(client("10.0.0.1")))
        .await
        .unwrap();

    assert_eq!(response.answer, "answer to: What is the refund policy?");
    assert!(!response.cached);
    assert_eq!(response.sources.len(), 2);
    assert_eq!(response.sources[0].source, "policy.pdf");
    assert_eq!(response.sources[0].page, Some(2));
    // Long sources are truncated for display
    assert_eq!(response.sources[1].content.chars().count(), 203);
    assert!(response.sources[1].content.ends_with("..."));

    let request = backend.last_request.lock().unwrap().clone().unwrap();
    assert!(
        request
            .context
            .starts_with("Source: policy.pdf\nRefunds are accepted within 30 days.\n\n---\n\nSource: long.txt\n")
    );
    gateway.shutdown().await;
}

#[tokio::test]
async fn repeated_question_is_served_from_cache() {
    let backend = Arc::new(EchoBackend::default());
    let retriever = Arc::new(StaticRetriever::new());
    let gateway = gateway_with(Config::default(), backend.clone(), retriever.clone());

    let first = gateway.chat(ChatRequest::new("refunds?")).await.unwrap();
    let second = gateway.chat(ChatRequest::new("refunds?")).await.unwrap();

    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(first.answer, second.answer);
    assert_eq!(first.sources, second.sources);
    assert_eq!(backend.calls(), 1);
    // Search was cached as well
    assert_eq!(retriever.calls(), 1);

    let stats = gateway.response_cache().stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.size, 1);
    gateway.shutdown().await;
}

#[tokio::test]
async fn conversations_with_history_bypass_response_cache() {
    let backend = Arc::new(EchoBackend::default());
    let gateway = gateway_with(
        Config::default(),
        backend.clone(),
        Arc::new(StaticRetriever::new()),
    );

    let history = vec![Message::user("hi"), Message::assistant("hello")];
    for _ in 0..2 {
        let response = gateway
            .chat(ChatRequest::new("and shipping?").with_history(history.clone()))
            .await
            .unwrap();
        assert!(!response.cached);
    }

    assert_eq!(backend.calls(), 2);
    assert!(gateway.response_cache().is_empty());
    let request = backend.last_request.lock().unwrap().clone().unwrap();
    assert_eq!(request.history, history);
    gateway.shutdown().await;
}

#[tokio::test]
async fn document_change_invalidates_searches() {
    let retriever = Arc::new(StaticRetriever::new());
    let gateway = gateway_with(
        Config::default(),
        Arc::new(EchoBackend::default()),
        retriever.clone(),
    );

    gateway.chat(ChatRequest::new("q")).await.unwrap();
    assert_eq!(gateway.search_cache().len(), 1);

    gateway.documents_changed();
    assert!(gateway.search_cache().is_empty());

    gateway.chat(ChatRequest::new("q")).await.unwrap();
    assert_eq!(retriever.calls(), 2);
    gateway.shutdown().await;
}

#[tokio::test]
async fn blank_question_is_rejected() {
    let backend = Arc::new(EchoBackend::default());
    let gateway = gateway_with(
        Config::default(),
        backend.clone(),
        Arc::new(StaticRetriever::new()),
    );

    let err = gateway.chat(ChatRequest::new("   ")).await.unwrap_err();
    assert!(matches!(err, MimirError::InvalidInput(_)));
    assert_eq!(backend.calls(), 0);
    gateway.shutdown().await;
}

#[tokio::test]
async fn backend_failure_is_returned_and_not_cached() {
    let gateway = gateway_with(
        Config::default(),
        Arc::new(FailingBackend),
        Arc::new(StaticRetriever::new()),
    );

    let err = gateway.chat(ChatRequest::new("q")).await.unwrap_err();
    assert!(matches!(err, MimirError::Api { status: 500, .. }));
    assert!(gateway.response_cache().is_empty());
    assert_eq!(gateway.queue().stats().total_errors, 1);
    gateway.shutdown().await;
}

#[tokio::test]
async fn chat_after_shutdown_is_not_running() {
    let gateway = gateway_with(
        Config::default(),
        Arc::new(EchoBackend::default()),
        Arc::new(StaticRetriever::new()),
    );
    gateway.shutdown().await;

    let err = gateway.chat(ChatRequest::new("q")).await.unwrap_err();
    assert!(matches!(err, MimirError::NotRunning));
}

// ============================================================================
// Admission control
// ============================================================================

#[tokio::test]
async fn chat_is_rate_limited_per_client() {
    let mut config = Config::default();
    config.rate_limit.chat = LimiterConfig::new().max_tokens(2).refill_rate(0.0);
    let gateway = gateway_with(
        config,
        Arc::new(EchoBackend::default()),
        Arc::new(StaticRetriever::new()),
    );

    for i in 0..2 {
        gateway
            .chat(ChatRequest::new(format!("q{i}")).with_client(client("10.0.0.1")))
            .await
            .unwrap();
    }
    let err = gateway
        .chat(ChatRequest::new("q2").with_client(client("10.0.0.1")))
        .await
        .unwrap_err();
    assert!(matches!(err, MimirError::RateLimited { retry_after: None }));
    assert_eq!(err.retry_after_secs(), Some(3600));

    // Another client still has its full budget
    gateway
        .chat(ChatRequest::new("q2").with_client(client("10.0.0.2")))
        .await
        .unwrap();
    gateway.shutdown().await;
}

#[tokio::test]
async fn blank_question_does_not_spend_budget() {
    let mut config = Config::default();
    config.rate_limit.chat = LimiterConfig::new().max_tokens(1).refill_rate(0.0);
    let gateway = gateway_with(
        config,
        Arc::new(EchoBackend::default()),
        Arc::new(StaticRetriever::new()),
    );

    let err = gateway
        .chat(ChatRequest::new("  ").with_client(client("10.0.0.1")))
        .await
        .unwrap_err();
    assert!(matches!(err, MimirError::InvalidInput(_)));
    assert_eq!(gateway.chat_limiter().remaining("10.0.0.1"), 1);

    assert_ok!(
        gateway
            .chat(ChatRequest::new("q").with_client(client("10.0.0.1")))
            .await
    );
    gateway.shutdown().await;
}

#[tokio::test]
async fn forwarded_header_only_counts_when_trusted() {
    let mut config = Config::default();
    config.rate_limit.chat = LimiterConfig::new().max_tokens(1).refill_rate(0.0);
    let gateway = gateway_with(
        config.clone(),
        Arc::new(EchoBackend::default()),
        Arc::new(StaticRetriever::new()),
    );

    // Untrusted: spoofed headers from one peer share the peer's bucket
    let spoof = |ip: &str| client("10.0.0.1").forwarded_for(ip);
    gateway
        .chat(ChatRequest::new("a").with_client(spoof("1.1.1.1")))
        .await
        .unwrap();
    assert!(
        gateway
            .chat(ChatRequest::new("b").with_client(spoof("2.2.2.2")))
            .await
            .unwrap_err()
            .is_rejection()
    );
    gateway.shutdown().await;

    config.rate_limit.trust_forwarded_for = true;
    let trusted = gateway_with(
        config,
        Arc::new(EchoBackend::default()),
        Arc::new(StaticRetriever::new()),
    );
    trusted
        .chat(ChatRequest::new("a").with_client(spoof("1.1.1.1")))
        .await
        .unwrap();
    trusted
        .chat(ChatRequest::new("b").with_client(spoof("2.2.2.2")))
        .await
        .unwrap();
    trusted.shutdown().await;
}

#[tokio::test]
async fn uploads_have_their_own_budget() {
    let mut config = Config::default();
    config.rate_limit.upload = LimiterConfig::new().max_tokens(1).refill_rate(0.0);
    let gateway = gateway_with(
        config,
        Arc::new(EchoBackend::default()),
        Arc::new(StaticRetriever::new()),
    );

    let uploader = client("10.0.0.9");
    assert_ok!(gateway.admit_upload(&uploader));
    assert!(matches!(
        gateway.admit_upload(&uploader),
        Err(MimirError::RateLimited { .. })
    ));
    // Chat and general budgets are untouched
    assert_ok!(gateway.admit_general(&uploader));
    gateway
        .chat(ChatRequest::new("q").with_client(uploader))
        .await
        .unwrap();
    gateway.shutdown().await;
}

#[tokio::test]
async fn full_queue_rejects_chat() {
    let mut config = Config::default();
    config.queue = QueueConfig::new()
        .max_concurrent(1)
        .max_queue_size(1)
        .poll_interval(Duration::from_millis(20));
    let backend = Arc::new(GatedBackend {
        gate: Arc::new(Semaphore::new(0)),
        started: AtomicUsize::new(0),
    });
    let gateway = gateway_with(config, backend.clone(), Arc::new(StaticRetriever::new()));

    let running = tokio::spawn({
        let gateway = gateway.clone();
        async move { gateway.chat(ChatRequest::new("first")).await }
    });
    tokio::time::timeout(Duration::from_secs(5), async {
        while backend.started.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let queued = tokio::spawn({
        let gateway = gateway.clone();
        async move { gateway.chat(ChatRequest::new("second")).await }
    });
    tokio::time::timeout(Duration::from_secs(5), async {
        while gateway.queue().stats().queue_size == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let err = gateway.chat(ChatRequest::new("third")).await.unwrap_err();
    assert!(matches!(err, MimirError::QueueFull { max: 1 }));
    assert_eq!(err.retry_after_secs(), Some(5));

    backend.gate.add_permits(2);
    assert_eq!(running.await.unwrap().unwrap().answer, "first");
    assert_eq!(queued.await.unwrap().unwrap().answer, "second");
    gateway.shutdown().await;
}

// ============================================================================
// Streaming
// ============================================================================

#[tokio::test]
async fn stream_ends_with_sources() {
    let gateway = gateway_with(
        Config::default(),
        Arc::new(ScriptedStreamBackend {
            script: vec![Ok("Refunds "), Ok("within "), Ok("30 days.")],
        }),
        Arc::new(StaticRetriever::new()),
    );

    let events = drain(gateway.chat_stream(ChatRequest::new("refunds?")).await.unwrap()).await;
    let events: Vec<ChatEvent> = events.into_iter().map(|e| e.unwrap()).collect();

    assert_eq!(events.len(), 4);
    assert_eq!(
        events[..3],
        [
            ChatEvent::Content { text: "Refunds ".into() },
            ChatEvent::Content { text: "within ".into() },
            ChatEvent::Content { text: "30 days.".into() },
        ]
    );
    let ChatEvent::Done { sources } = &events[3] else {
        panic!("last event should be Done, got {:?}", events[3]);
    };
    assert_eq!(sources.len(), 2);
    assert_eq!(sources[0].source, "policy.pdf");
    assert_eq!(sources[0].page, Some(2));
    assert!(sources[1].content.ends_with("..."));

    assert_eq!(gateway.queue().stats().total_processed, 1);
    gateway.shutdown().await;
}

#[tokio::test]
async fn streamed_answers_bypass_response_cache() {
    let backend = Arc::new(EchoBackend::default());
    let gateway = gateway_with(
        Config::default(),
        backend.clone(),
        Arc::new(StaticRetriever::new()),
    );

    gateway.chat(ChatRequest::new("refunds?")).await.unwrap();
    assert_eq!(gateway.response_cache().len(), 1);

    let events = drain(gateway.chat_stream(ChatRequest::new("refunds?")).await.unwrap()).await;
    assert!(matches!(
        &events[0],
        Ok(ChatEvent::Content { text }) if text == "answer to: refunds?"
    ));
    assert!(matches!(events.last(), Some(Ok(ChatEvent::Done { .. }))));

    // Generated again, and the cache neither hit nor grew
    assert_eq!(backend.calls(), 2);
    let stats = gateway.response_cache().stats();
    assert_eq!(stats.hits, 0);
    assert_eq!(stats.size, 1);
    gateway.shutdown().await;
}

#[tokio::test]
async fn stream_failure_ends_with_error() {
    let gateway = gateway_with(
        Config::default(),
        Arc::new(ScriptedStreamBackend {
            script: vec![Ok("partial"), Err(502)],
        }),
        Arc::new(StaticRetriever::new()),
    );

    let events = drain(gateway.chat_stream(ChatRequest::new("q")).await.unwrap()).await;
    assert_eq!(events.len(), 2);
    assert!(matches!(&events[0], Ok(ChatEvent::Content { text }) if text == "partial"));
    assert!(matches!(&events[1], Err(MimirError::Api { status: 502, .. })));
    assert_eq!(gateway.queue().stats().total_errors, 1);
    gateway.shutdown().await;
}

#[tokio::test]
async fn empty_stream_is_empty_response() {
    let gateway = gateway_with(
        Config::default(),
        Arc::new(ScriptedStreamBackend { script: vec![] }),
        Arc::new(StaticRetriever::new()),
    );

    let events = drain(gateway.chat_stream(ChatRequest::new("q")).await.unwrap()).await;
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], Err(MimirError::EmptyResponse)));
    gateway.shutdown().await;
}

#[tokio::test]
async fn stream_is_rate_limited_and_validated() {
    let mut config = Config::default();
    config.rate_limit.chat = LimiterConfig::new().max_tokens(1).refill_rate(0.0);
    let gateway = gateway_with(
        config,
        Arc::new(EchoBackend::default()),
        Arc::new(StaticRetriever::new()),
    );

    let err = gateway
        .chat_stream(ChatRequest::new(" ").with_client(client("10.0.0.1")))
        .await
        .err()
        .expect("blank question");
    assert!(matches!(err, MimirError::InvalidInput(_)));

    let stream = gateway
        .chat_stream(ChatRequest::new("q").with_client(client("10.0.0.1")))
        .await
        .unwrap();
    drain(stream).await;

    let err = gateway
        .chat_stream(ChatRequest::new("q").with_client(client("10.0.0.1")))
        .await
        .err()
        .expect("budget spent");
    assert!(matches!(err, MimirError::RateLimited { .. }));
    gateway.shutdown().await;
}

#[tokio::test]
async fn full_queue_rejects_stream_up_front() {
    let mut config = Config::default();
    config.queue = QueueConfig::new()
        .max_concurrent(1)
        .max_queue_size(1)
        .poll_interval(Duration::from_millis(20));
    let backend = Arc::new(GatedBackend {
        gate: Arc::new(Semaphore::new(0)),
        started: AtomicUsize::new(0),
    });
    let gateway = gateway_with(config, backend.clone(), Arc::new(StaticRetriever::new()));

    let running = gateway.chat_stream(ChatRequest::new("first")).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while backend.started.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    let queued = gateway.chat_stream(ChatRequest::new("second")).await.unwrap();

    let err = gateway
        .chat_stream(ChatRequest::new("third"))
        .await
        .err()
        .expect("queue is full");
    assert!(matches!(err, MimirError::QueueFull { max: 1 }));

    backend.gate.add_permits(2);
    let first = drain(running).await;
    assert!(matches!(&first[0], Ok(ChatEvent::Content { text }) if text == "first"));
    let second = drain(queued).await;
    assert!(matches!(second.last(), Some(Ok(ChatEvent::Done { .. }))));
    gateway.shutdown().await;
}

// ============================================================================
// Health and maintenance
// ============================================================================

#[tokio::test]
async fn health_reports_components() {
    let gateway = gateway_with(
        Config::default(),
        Arc::new(EchoBackend::default()),
        Arc::new(StaticRetriever::new()),
    );
    gateway.chat(ChatRequest::new("q")).await.unwrap();

    let health = gateway.health().await;
    assert_eq!(health.status, HealthStatus::Healthy);
    assert!(health.is_healthy());
    assert_eq!(health.backend.status, BackendStatus::Connected);
    assert!(health.queue.running);
    assert_eq!(health.queue.total_processed, 1);
    assert_eq!(health.caches.len(), 2);
    assert_eq!(health.caches[0].name, "search");
    assert_eq!(health.caches[1].name, "response");
    assert_eq!(health.limiters.len(), 3);
    assert_eq!(health.limiters[0].active_clients, 1);

    let json = serde_json::to_value(&health).unwrap();
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["backend"]["status"], "connected");
    assert!(json["backend"].get("error").is_none());
    gateway.shutdown().await;
}

#[tokio::test]
async fn unreachable_backend_degrades_health() {
    let backend = Arc::new(EchoBackend {
        fail_health: true,
        ..EchoBackend::default()
    });
    let gateway = gateway_with(Config::default(), backend, Arc::new(StaticRetriever::new()));

    let health = gateway.health().await;
    assert_eq!(health.status, HealthStatus::Degraded);
    assert_eq!(health.backend.status, BackendStatus::Disconnected);
    assert!(
        health
            .backend
            .error
            .as_deref()
            .is_some_and(|e| e.contains("connection refused"))
    );
    gateway.shutdown().await;
}

#[tokio::test]
async fn stopped_queue_degrades_health() {
    let gateway = gateway_with(
        Config::default(),
        Arc::new(EchoBackend::default()),
        Arc::new(StaticRetriever::new()),
    );
    gateway.shutdown().await;

    let health = gateway.health().await;
    assert_eq!(health.status, HealthStatus::Degraded);
    assert!(!health.queue.running);
}

#[tokio::test(start_paused = true)]
async fn maintenance_sweeps_expired_entries() {
    let mut config = Config::default();
    config.cache.search = CacheConfig::new().ttl(Duration::from_secs(10));
    config.cache.response = CacheConfig::new().ttl(Duration::from_secs(10));
    config.rate_limit.chat = LimiterConfig::chat().window(Duration::from_secs(1));
    let gateway = gateway_with(
        config,
        Arc::new(EchoBackend::default()),
        Arc::new(StaticRetriever::new()),
    );

    gateway.chat(ChatRequest::new("q")).await.unwrap();
    assert_eq!(gateway.run_maintenance().total(), 0);

    tokio::time::advance(Duration::from_secs(11)).await;
    let report = gateway.run_maintenance();
    assert_eq!(report.expired_search_entries, 1);
    assert_eq!(report.expired_response_entries, 1);
    assert_eq!(report.stale_clients, 1);
    assert!(gateway.search_cache().is_empty());
    assert!(gateway.response_cache().is_empty());
    gateway.shutdown().await;
}

#[test]
fn invalid_config_fails_to_build() {
    let mut config = Config::default();
    config.queue.max_concurrent = 0;
    let result = Mimir::builder()
        .config(config)
        .backend(Arc::new(EchoBackend::default()))
        .build();
    assert!(matches!(result, Err(MimirError::Configuration(_))));
}
