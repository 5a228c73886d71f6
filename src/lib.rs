//! Mimir - Admission control and caching for a retrieval-augmented chat service
//!
//! This crate sits between request handlers and a slow local language model.
//! It bounds how much work reaches the model and avoids repeating work:
//!
//! - [`queue::InferenceQueue`] runs at most `max_concurrent` generations at a
//!   time and rejects new ones once `max_queue_size` are waiting.
//! - [`limiter::RateLimiter`] applies per-client token buckets, one limiter
//!   per endpoint class.
//! - [`cache::TtlCache`] memoizes similarity searches and full answers with
//!   LRU eviction and a time-to-live.
//!
//! [`Gateway`] wires these together into a chat pipeline, answering either
//! in one piece ([`Gateway::chat()`]) or as a stream of [`ChatEvent`]s
//! ([`Gateway::chat_stream()`]).
//!
//! # Example
//!
//! ```rust,no_run
//! use mimir::{ChatRequest, ClientIdentity, Mimir};
//!
//! #[tokio::main]
//! async fn main() -> mimir::Result<()> {
//!     let gateway = Mimir::builder().build()?;
//!     gateway.start();
//!
//!     let response = gateway
//!         .chat(
//!             ChatRequest::new("What is the refund policy?")
//!                 .with_client(ClientIdentity::peer("10.0.0.7")),
//!         )
//!         .await?;
//!
//!     println!("{}", response.answer);
//!     gateway.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! Rejections surface as [`MimirError::QueueFull`] and
//! [`MimirError::RateLimited`]; see [`MimirError::retry_after_secs()`] for
//! the value to put in a `Retry-After` header.

pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod limiter;
pub mod providers;
pub mod queue;
pub mod telemetry;
pub mod types;

// Re-export main types at crate root
pub use config::Config;
pub use error::{MimirError, Result};
pub use gateway::{ChatStream, Gateway, HealthSnapshot, MaintenanceReport, Mimir, MimirBuilder};
pub use limiter::ClientIdentity;

// Re-export all types
pub use types::{
    ChatEvent, ChatRequest, ChatResponse, GenerationRequest, Message, Role, ScoredDocument,
    SearchQuery, SourceRef,
};
