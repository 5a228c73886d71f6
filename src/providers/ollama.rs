//! Ollama chat backend.
//!
//! Calls the `/api/chat` endpoint of a local or remote Ollama server, either
//! for a whole answer or streamed as newline-delimited JSON.
//! See: <https://github.com/ollama/ollama/blob/main/docs/api.md>

use std::fmt::Display;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::traits::{InferenceBackend, TextStream};
use crate::types::{GenerationRequest, Message, Role};
use crate::{MimirError, Result};

/// Turns of conversation history forwarded to the model.
pub const MAX_HISTORY_MESSAGES: usize = 10;

/// Configuration for [`OllamaBackend`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OllamaConfig {
    /// Server URL (default: http://localhost:11434).
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Chat model (default: llama3.1:8b).
    #[serde(default = "default_model")]
    pub model: String,
    /// Sampling temperature (default: 0.7).
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Per-request timeout in seconds (default: 120).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_model() -> String {
    "llama3.1:8b".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_timeout_secs() -> u64 {
    120
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// [`InferenceBackend`] backed by an Ollama server.
#[derive(Clone)]
pub struct OllamaBackend {
    http: Client,
    config: OllamaConfig,
}

impl OllamaBackend {
    /// Create a backend for the configured server and model.
    pub fn new(config: OllamaConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| MimirError::Configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { http, config })
    }

    /// Model this backend sends requests to.
    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }

    async fn send_chat(&self, request: &GenerationRequest, stream: bool) -> Result<reqwest::Response> {
        let messages = build_messages(request);
        debug!(
            model = %self.config.model,
            messages = messages.len(),
            context_chars = request.context.len(),
            stream,
            "sending chat request to ollama"
        );

        let response = self
            .http
            .post(self.url("/api/chat"))
            .json(&ChatRequestBody {
                model: &self.config.model,
                messages: &messages,
                stream,
                options: ChatRequestOptions {
                    temperature: self.config.temperature,
                },
            })
            .send()
            .await
            .map_err(|e| MimirError::Http(e.to_string()))?;

        self.handle_response_errors(response).await
    }

    async fn handle_response_errors(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();

        if status.is_success() {
            return Ok(response);
        }

        match status.as_u16() {
            404 => Err(MimirError::ModelNotFound(self.config.model.clone())),
            429 => {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.trim().parse::<u64>().ok())
                    .map(Duration::from_secs);
                Err(MimirError::RateLimited { retry_after })
            }
            code => {
                let body = response.text().await.unwrap_or_default();
                let message = serde_json::from_str::<OllamaError>(&body)
                    .map(|e| e.error)
                    .unwrap_or_else(|_| format!("Ollama API error: {status}"));
                Err(MimirError::Api {
                    status: code,
                    message,
                })
            }
        }
    }
}

#[async_trait]
impl InferenceBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let response = self.send_chat(request, false).await?;

        let body: ChatResponseBody = response
            .json()
            .await
            .map_err(|e| MimirError::Http(e.to_string()))?;

        let answer = body.message.map(|m| m.content).unwrap_or_default();
        if answer.trim().is_empty() {
            return Err(MimirError::EmptyResponse);
        }
        Ok(answer)
    }

    async fn generate_stream(&self, request: &GenerationRequest) -> Result<TextStream> {
        let response = self.send_chat(request, true).await?;
        Ok(decode_chat_stream(response.bytes_stream()))
    }

    async fn health_check(&self) -> Result<()> {
        let url = self.url("/api/tags");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| MimirError::Http(e.to_string()))?;

        // A 404 here means a wrong base URL, not a missing model.
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(MimirError::Api {
                status: 404,
                message: format!("Ollama endpoint not found: {url}"),
            });
        }
        self.handle_response_errors(response).await.map(|_| ())
    }
}

/// System prompt, trimmed history, then the question.
fn build_messages(request: &GenerationRequest) -> Vec<Message> {
    let history = &request.history;
    let skip = history.len().saturating_sub(MAX_HISTORY_MESSAGES);

    let mut messages = Vec::with_capacity(MAX_HISTORY_MESSAGES + 2);
    messages.push(Message::system(system_prompt(&request.context)));
    messages.extend(
        history[skip..]
            .iter()
            .filter(|m| m.role != Role::System)
            .cloned(),
    );
    messages.push(Message::user(request.question.clone()));
    messages
}

fn system_prompt(context: &str) -> String {
    format!(
        "You are a helpful assistant that answers questions using the provided context.\n\
         Use ONLY the information in the context. If the answer is not in the context, \
         say that you do not have that information.\n\n\
         Relevant context:\n{context}\n\n\
         Answer clearly, concisely and professionally."
    )
}

#[derive(Serialize)]
struct ChatRequestBody<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
    options: ChatRequestOptions,
}

#[derive(Serialize)]
struct ChatRequestOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponseBody {
    #[serde(default)]
    message: Option<ChatResponseMessage>,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Deserialize)]
struct OllamaError {
    error: String,
}

/// One line of a streamed `/api/chat` reply.
#[derive(Deserialize)]
struct StreamFrame {
    #[serde(default)]
    message: Option<ChatResponseMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

type ByteStream<B, E> = Pin<Box<dyn Stream<Item = std::result::Result<B, E>> + Send>>;

struct FrameReader<B, E> {
    bytes: ByteStream<B, E>,
    buf: Vec<u8>,
    eof: bool,
    finished: bool,
}

impl<B, E> FrameReader<B, E> {
    /// Next complete line; at end of input, whatever is left.
    fn take_line(&mut self) -> Option<Vec<u8>> {
        if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            return Some(self.buf.drain(..=pos).collect());
        }
        if self.eof && !self.buf.is_empty() {
            return Some(std::mem::take(&mut self.buf));
        }
        None
    }
}

/// Turn Ollama's NDJSON byte stream into answer text pieces.
///
/// Frames may be split across chunks. The stream ends after the frame with
/// `"done": true`; input that ends before it is an [`MimirError::Http`].
fn decode_chat_stream<S, B, E>(bytes: S) -> TextStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let reader = FrameReader {
        bytes: Box::pin(bytes),
        buf: Vec::new(),
        eof: false,
        finished: false,
    };

    Box::pin(futures_util::stream::unfold(reader, |mut reader| async move {
        loop {
            if reader.finished {
                return None;
            }

            if let Some(line) = reader.take_line() {
                match parse_frame(&line) {
                    Ok(Some(frame)) => {
                        reader.finished = frame.done;
                        let text = frame.message.map(|m| m.content).unwrap_or_default();
                        if !text.is_empty() {
                            return Some((Ok(text), reader));
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        reader.finished = true;
                        return Some((Err(e), reader));
                    }
                }
                continue;
            }

            if reader.eof {
                reader.finished = true;
                return Some((
                    Err(MimirError::Http(
                        "Ollama stream ended before the final frame".into(),
                    )),
                    reader,
                ));
            }

            match reader.bytes.next().await {
                Some(Ok(chunk)) => reader.buf.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    reader.finished = true;
                    return Some((Err(MimirError::Http(e.to_string())), reader));
                }
                None => reader.eof = true,
            }
        }
    }))
}

/// `None` for blank lines.
fn parse_frame(line: &[u8]) -> Result<Option<StreamFrame>> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return Ok(None);
    }
    let frame: StreamFrame = serde_json::from_slice(line)?;
    if let Some(error) = frame.error {
        return Err(MimirError::Backend(error));
    }
    Ok(Some(frame))
}
