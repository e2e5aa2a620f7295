//! Anthropic messages adapter.
//!
//! System prompts travel in the top-level `system` field rather than in the
//! message list, and `max_tokens` is mandatory.

use crate::http::{decode_error, get_json, AdapterConfig};
use crate::sse::{event_stream, open_events, Delta};
use async_trait::async_trait;
use dispatch_core::{
    Backend, CancellationToken, ChatMessage, ChunkStream, DispatchError, DispatchResult,
    GenerationOptions, MessageRole, ProviderAdapter,
};
use dispatch_telemetry::provider_span;
use reqwest::Client;
use eventsource_stream::Event as MessageEvent;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, Instrument};

const BACKEND: Backend = Backend::Anthropic;
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Adapter for the Anthropic API
pub struct AnthropicAdapter {
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl AnthropicAdapter {
    /// Public API root
    pub const DEFAULT_BASE_URL: &'static str = "https://api.anthropic.com";

    /// Create an adapter
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created
    pub fn new(config: AdapterConfig) -> DispatchResult<Self> {
        Ok(Self {
            client: config.client(BACKEND)?,
            base_url: config.resolved_base_url(Self::DEFAULT_BASE_URL),
            api_key: config.api_key,
        })
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request.header("anthropic-version", API_VERSION);
        match &self.api_key {
            Some(key) => request.header("x-api-key", key.expose_secret()),
            None => request,
        }
    }

    fn build_request<'a>(messages: &'a [ChatMessage], options: &'a GenerationOptions) -> MessagesRequest<'a> {
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == MessageRole::System)
            .map(|m| m.content.as_str())
            .collect();
        MessagesRequest {
            model: &options.model,
            max_tokens: options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system: (!system.is_empty()).then(|| system.join("\n\n")),
            messages: messages
                .iter()
                .filter(|m| m.role != MessageRole::System)
                .map(|m| WireMessage {
                    role: m.role,
                    content: &m.content,
                })
                .collect(),
            stream: true,
            temperature: options.temperature,
        }
    }

    fn parse_event(event: MessageEvent) -> DispatchResult<Delta> {
        match event.event.as_str() {
            "content_block_delta" => {
                let payload: BlockDelta =
                    serde_json::from_str(&event.data).map_err(|e| decode_error(BACKEND, &e))?;
                Ok(payload.delta.text.map_or(Delta::Skip, Delta::Text))
            }
            "message_stop" => Ok(Delta::Done),
            "error" => {
                let payload: ErrorEvent =
                    serde_json::from_str(&event.data).map_err(|e| decode_error(BACKEND, &e))?;
                let retryable = payload.error.kind == "overloaded_error";
                Err(DispatchError::backend(BACKEND, payload.error.message, None, retryable))
            }
            _ => Ok(Delta::Skip),
        }
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn backend(&self) -> Backend {
        BACKEND
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        options: &GenerationOptions,
        cancel: CancellationToken,
    ) -> DispatchResult<ChunkStream> {
        let body = Self::build_request(messages, options);

        debug!(backend = %BACKEND, model = %options.model, "Sending streaming messages request");
        let request = self
            .authorized(self.client.post(format!("{}/v1/messages", self.base_url)))
            .json(&body);
        let source = open_events(BACKEND, request)
            .instrument(provider_span!(BACKEND, "stream"))
            .await?;

        Ok(event_stream(BACKEND, source, cancel, Self::parse_event))
    }

    async fn list_models(&self) -> DispatchResult<Vec<String>> {
        let request = self.authorized(self.client.get(format!("{}/v1/models", self.base_url)));
        let listing: ModelList = get_json(BACKEND, request)
            .instrument(provider_span!(BACKEND, "list_models"))
            .await?;
        Ok(listing.data.into_iter().map(|m| m.id).collect())
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: MessageRole,
    content: &'a str,
}

#[derive(Deserialize)]
struct BlockDelta {
    delta: TextDelta,
}

#[derive(Deserialize)]
struct TextDelta {
    text: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEvent {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

#[derive(Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}
