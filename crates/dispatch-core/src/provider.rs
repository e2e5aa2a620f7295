//! Provider adapter abstraction.
//!
//! Every backend the dispatcher can call is wrapped in a [`ProviderAdapter`].
//! Adapters only speak their backend's wire protocol; caching, retries,
//! breaking and rate limiting all live in the engine.

use crate::error::DispatchResult;
use crate::request::ChatMessage;
use crate::types::Backend;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Stream of text chunks produced by an adapter
pub type ChunkStream = BoxStream<'static, DispatchResult<String>>;

/// Resolved generation parameters handed to an adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// Model to use
    pub model: String,
    /// Sampling temperature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl GenerationOptions {
    /// Options for a model with no sampling overrides
    pub fn for_model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: None,
            max_tokens: None,
        }
    }
}

/// Result of probing a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    /// Whether the backend answered
    pub ok: bool,
    /// Human readable summary
    pub message: String,
    /// Models reported while probing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models: Option<Vec<String>>,
}

impl ConnectionStatus {
    /// Successful probe
    pub fn ok(message: impl Into<String>, models: Option<Vec<String>>) -> Self {
        Self {
            ok: true,
            message: message.into(),
            models,
        }
    }

    /// Failed probe
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
            models: None,
        }
    }
}

/// Per-backend client used by the dispatcher
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Backend this adapter talks to
    fn backend(&self) -> Backend;

    /// Start a streaming completion.
    ///
    /// The returned stream yields text deltas. Implementations should stop
    /// reading from the network once `cancel` fires.
    async fn stream(
        &self,
        messages: &[ChatMessage],
        options: &GenerationOptions,
        cancel: CancellationToken,
    ) -> DispatchResult<ChunkStream>;

    /// List model identifiers available on the backend
    async fn list_models(&self) -> DispatchResult<Vec<String>>;

    /// Probe the backend. The default lists models.
    async fn test_connection(&self) -> ConnectionStatus {
        match self.list_models().await {
            Ok(models) => ConnectionStatus::ok(
                format!("connected to {} ({} models)", self.backend(), models.len()),
                Some(models),
            ),
            Err(e) => ConnectionStatus::failed(e.to_string()),
        }
    }
}
