//! Chat request and response types.

use serde::{Deserialize, Serialize};

use super::{Message, ScoredDocument};
use crate::limiter::ClientIdentity;

/// Characters of each source kept in a [`ChatResponse`].
pub const SOURCE_PREVIEW_CHARS: usize = 200;

/// An inbound chat question.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub question: String,
    /// Prior turns of the conversation, oldest first.
    pub history: Vec<Message>,
    /// Caller identity, used for rate limiting.
    pub client: ClientIdentity,
}

impl ChatRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            ..Self::default()
        }
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    pub fn with_client(mut self, client: ClientIdentity) -> Self {
        self.client = client;
        self
    }
}

/// Everything one model call needs, owned so it can be moved into the
/// inference queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub question: String,
    /// Retrieved documents formatted as a single context block.
    pub context: String,
    pub history: Vec<Message>,
}

/// A source shown alongside an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    /// Leading excerpt of the chunk, see [`SOURCE_PREVIEW_CHARS`].
    pub content: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    pub score: f32,
}

impl From<&ScoredDocument> for SourceRef {
    fn from(doc: &ScoredDocument) -> Self {
        let content = if doc.content.chars().count() > SOURCE_PREVIEW_CHARS {
            let preview: String = doc.content.chars().take(SOURCE_PREVIEW_CHARS).collect();
            format!("{preview}...")
        } else {
            doc.content.clone()
        };

        Self {
            content,
            source: doc.source.clone(),
            page: doc.page,
            score: doc.score,
        }
    }
}

/// Answer to a [`ChatRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub answer: String,
    pub sources: Vec<SourceRef>,
    /// Whether the answer came from the response cache.
    pub cached: bool,
}

/// One event of a streamed answer.
///
/// A stream yields any number of [`Content`](Self::Content) events followed
/// by exactly one [`Done`](Self::Done), unless it ends with an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// Answer text as the model produces it.
    Content { text: String },
    /// End of the answer, with the sources it was grounded on.
    Done { sources: Vec<SourceRef> },
}
