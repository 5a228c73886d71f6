//! Gateway construction and the chat pipeline

mod builder;
mod health;
mod service;

pub use builder::{Mimir, MimirBuilder};
pub use health::{BackendHealth, BackendStatus, HealthSnapshot, HealthStatus, MaintenanceReport};
pub use service::{
    CONTEXT_SEPARATOR, ChatStream, Gateway, STREAM_BUFFER, format_context, response_key,
};
