//! OpenAI chat completions adapter.

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

const BACKEND: Backend = Backend::OpenAI;

/// Adapter for the OpenAI API
pub struct OpenAIAdapter {
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl OpenAIAdapter {
    /// Public API root
    pub const DEFAULT_BASE_URL: &'static str = "https://api.openai.com";

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
        match &self.api_key {
            Some(key) => request.bearer_auth(key.expose_secret()),
            None => request,
        }
    }

    fn parse_event(event: MessageEvent) -> DispatchResult<Delta> {
        let data = event.data.trim();
        if data == "[DONE]" {
            return Ok(Delta::Done);
        }
        let chunk: StreamChunk = serde_json::from_str(data).map_err(|e| decode_error(BACKEND, &e))?;
        if let Some(error) = chunk.error {
            return Err(DispatchError::backend(BACKEND, error.message, None, false));
        }
        Ok(chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .map_or(Delta::Skip, Delta::Text))
    }
}

#[async_trait]
impl ProviderAdapter for OpenAIAdapter {
    fn backend(&self) -> Backend {
        BACKEND
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        options: &GenerationOptions,
        cancel: CancellationToken,
    ) -> DispatchResult<ChunkStream> {
        let body = ChatRequest {
            model: &options.model,
            messages: messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role,
                    content: &m.content,
                })
                .collect(),
            stream: true,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };

        debug!(backend = %BACKEND, model = %options.model, "Sending streaming chat completion request");
        let request = self
            .authorized(self.client.post(format!("{}/v1/chat/completions", self.base_url)))
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
        let mut models: Vec<String> = listing.data.into_iter().map(|m| m.id).collect();
        models.sort();
        Ok(models)
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: MessageRole,
    content: &'a str,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    error: Option<StreamError>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamError {
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
