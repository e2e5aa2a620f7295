//! # Dispatch Core
//!
//! Core types, traits, and error handling for the LLM dispatcher.
//!
//! This crate provides the foundational types used throughout the dispatcher:
//! - Chat requests and per-request options
//! - The provider adapter trait and backend identifiers
//! - Error types and classification helpers
//! - Typed dispatcher events and the event bus

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod provider;
pub mod request;
pub mod types;

// Re-export commonly used types
pub use error::{DispatchError, DispatchResult, ErrorKind};
pub use events::{DispatchEvent, EventBus, EventHandler, EventKind, HandlerId};
pub use provider::{ChunkStream, ConnectionStatus, GenerationOptions, ProviderAdapter};
pub use request::{
    ChatMessage, CompletionRequest, CompletionRequestBuilder, MessageRole, RequestOptions,
};
pub use types::{Backend, Fingerprint, StreamId};

/// Cancellation primitive shared by every layer of the dispatcher.
pub use tokio_util::sync::CancellationToken;
