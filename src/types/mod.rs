//! Public types for the Mimir API.

mod chat;
mod document;
mod message;

pub use chat::{
    ChatEvent, ChatRequest, ChatResponse, GenerationRequest, SOURCE_PREVIEW_CHARS, SourceRef,
};
pub use document::{ScoredDocument, SearchQuery};
pub use message::{Message, Role};
