//! Request types for the dispatcher.
//!
//! A [`CompletionRequest`] is the raw caller input. It is checked and
//! sanitized by the engine's validator before anything else happens.

use crate::types::Backend;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_util::sync::CancellationToken;

/// Role of a chat message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System instruction
    System,
    /// User input
    User,
    /// Model output
    Assistant,
}

impl MessageRole {
    /// Lowercase wire name
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author role
    pub role: MessageRole,
    /// Text content
    pub content: String,
}

impl ChatMessage {
    /// Create a message with an explicit role
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }
}

/// Per-request generation and routing options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestOptions {
    /// Sampling temperature (0.0 - 2.0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Queue priority; higher runs first
    #[serde(default)]
    pub priority: i32,

    /// Route to this backend regardless of the selected model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_override: Option<Backend>,

    /// Use this model regardless of the selected model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_override: Option<String>,
}

/// Raw chat completion request as submitted by a caller
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Ordered conversation
    pub messages: Vec<ChatMessage>,

    /// Generation and routing options
    #[serde(default)]
    pub options: RequestOptions,

    /// Caller-owned cancellation token
    #[serde(skip)]
    pub cancellation: Option<CancellationToken>,
}

impl CompletionRequest {
    /// Create a new builder for `CompletionRequest`
    #[must_use]
    pub fn builder() -> CompletionRequestBuilder {
        CompletionRequestBuilder::default()
    }

    /// Total number of characters across all message contents
    #[must_use]
    pub fn total_chars(&self) -> usize {
        self.messages.iter().map(|m| m.content.chars().count()).sum()
    }
}

/// Builder for [`CompletionRequest`]
#[derive(Debug, Default)]
pub struct CompletionRequestBuilder {
    messages: Vec<ChatMessage>,
    options: RequestOptions,
    cancellation: Option<CancellationToken>,
}

impl CompletionRequestBuilder {
    /// Append a message
    #[must_use]
    pub fn message(mut self, message: ChatMessage) -> Self {
        self.messages.push(message);
        self
    }

    /// Replace all messages
    #[must_use]
    pub fn messages(mut self, messages: Vec<ChatMessage>) -> Self {
        self.messages = messages;
        self
    }

    /// Append a system message
    #[must_use]
    pub fn system(self, content: impl Into<String>) -> Self {
        self.message(ChatMessage::system(content))
    }

    /// Append a user message
    #[must_use]
    pub fn user(self, content: impl Into<String>) -> Self {
        self.message(ChatMessage::user(content))
    }

    /// Append an assistant message
    #[must_use]
    pub fn assistant(self, content: impl Into<String>) -> Self {
        self.message(ChatMessage::assistant(content))
    }

    /// Set temperature
    #[must_use]
    pub fn temperature(mut self, temperature: f64) -> Self {
        self.options.temperature = Some(temperature);
        self
    }

    /// Set max tokens
    #[must_use]
    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.options.max_tokens = Some(max_tokens);
        self
    }

    /// Set queue priority
    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.options.priority = priority;
        self
    }

    /// Force a backend
    #[must_use]
    pub fn backend(mut self, backend: Backend) -> Self {
        self.options.backend_override = Some(backend);
        self
    }

    /// Force a model
    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.options.model_override = Some(model.into());
        self
    }

    /// Attach a cancellation token
    #[must_use]
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Build the request. Validation happens at dispatch time.
    #[must_use]
    pub fn build(self) -> CompletionRequest {
        CompletionRequest {
            messages: self.messages,
            options: self.options,
            cancellation: self.cancellation,
        }
    }
}
