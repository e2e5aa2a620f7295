//! Ollama adapter for locally served models.

use crate::http::{decode_error, get_json, send, AdapterConfig};
use crate::sse::{ndjson_stream, Delta};
use async_trait::async_trait;
use dispatch_core::{
    Backend, CancellationToken, ChatMessage, ChunkStream, DispatchError, DispatchResult,
    GenerationOptions, MessageRole, ProviderAdapter,
};
use dispatch_telemetry::provider_span;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, Instrument};

const BACKEND: Backend = Backend::Ollama;

/// Adapter for an Ollama server
pub struct OllamaAdapter {
    client: Client,
    base_url: String,
}

impl OllamaAdapter {
    /// Default local endpoint
    pub const DEFAULT_BASE_URL: &'static str = "http://localhost:11434";

    /// Create an adapter
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created
    pub fn new(config: AdapterConfig) -> DispatchResult<Self> {
        Ok(Self {
            client: config.client(BACKEND)?,
            base_url: config.resolved_base_url(Self::DEFAULT_BASE_URL),
        })
    }

    fn parse_line(line: String) -> DispatchResult<Delta> {
        let chunk: ChatChunk = serde_json::from_str(&line).map_err(|e| decode_error(BACKEND, &e))?;
        if let Some(error) = chunk.error {
            return Err(DispatchError::backend(BACKEND, error, None, false));
        }
        let text = chunk.message.map(|m| m.content).unwrap_or_default();
        if chunk.done {
            // The final line may still carry text
            return Ok(if text.is_empty() { Delta::Done } else { Delta::Text(text) });
        }
        Ok(Delta::Text(text))
    }
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
    fn backend(&self) -> Backend {
        BACKEND
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        options: &GenerationOptions,
        cancel: CancellationToken,
    ) -> DispatchResult<ChunkStream> {
        let model_options = (options.temperature.is_some() || options.max_tokens.is_some()).then_some(
            ModelOptions {
                temperature: options.temperature,
                num_predict: options.max_tokens,
            },
        );
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
            options: model_options,
        };

        debug!(backend = %BACKEND, model = %options.model, "Sending streaming chat request");
        let request = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body);
        let response = send(BACKEND, request)
            .instrument(provider_span!(BACKEND, "stream"))
            .await?;

        Ok(ndjson_stream(BACKEND, response, cancel, Self::parse_line))
    }

    async fn list_models(&self) -> DispatchResult<Vec<String>> {
        let request = self.client.get(format!("{}/api/tags", self.base_url));
        let tags: TagList = get_json(BACKEND, request)
            .instrument(provider_span!(BACKEND, "list_models"))
            .await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<ModelOptions>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: MessageRole,
    content: &'a str,
}

#[derive(Serialize)]
struct ModelOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Deserialize)]
struct ChatChunk {
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
    error: Option<String>,
}

#[derive(Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct TagList {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Deserialize)]
struct TagEntry {
    name: String,
}
