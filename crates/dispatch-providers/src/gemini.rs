//! Google Gemini adapter (Google AI Studio API).

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

const BACKEND: Backend = Backend::Gemini;

/// Adapter for the Gemini API
pub struct GeminiAdapter {
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl GeminiAdapter {
    /// Public API root
    pub const DEFAULT_BASE_URL: &'static str = "https://generativelanguage.googleapis.com";

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

    fn with_key(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.query(&[("key", key.expose_secret().as_str())]),
            None => request,
        }
    }

    fn build_request<'a>(messages: &'a [ChatMessage], options: &GenerationOptions) -> GenerateRequest<'a> {
        let system: Vec<Part<'a>> = messages
            .iter()
            .filter(|m| m.role == MessageRole::System)
            .map(|m| Part { text: &m.content })
            .collect();
        let generation_config = (options.temperature.is_some() || options.max_tokens.is_some())
            .then_some(GenerationConfig {
                temperature: options.temperature,
                max_output_tokens: options.max_tokens,
            });
        GenerateRequest {
            contents: messages
                .iter()
                .filter(|m| m.role != MessageRole::System)
                .map(|m| Content {
                    role: if m.role == MessageRole::Assistant { "model" } else { "user" },
                    parts: vec![Part { text: &m.content }],
                })
                .collect(),
            system_instruction: (!system.is_empty()).then_some(SystemInstruction { parts: system }),
            generation_config,
        }
    }

    fn parse_event(event: MessageEvent) -> DispatchResult<Delta> {
        let chunk: GenerateChunk =
            serde_json::from_str(&event.data).map_err(|e| decode_error(BACKEND, &e))?;
        if let Some(error) = chunk.error {
            return Err(DispatchError::backend(BACKEND, error.message, None, false));
        }
        let text: String = chunk
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();
        Ok(if text.is_empty() { Delta::Skip } else { Delta::Text(text) })
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
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
        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent",
            self.base_url, options.model
        );

        debug!(backend = %BACKEND, model = %options.model, "Sending streaming generate request");
        let request = self
            .with_key(self.client.post(url).query(&[("alt", "sse")]))
            .json(&body);
        let source = open_events(BACKEND, request)
            .instrument(provider_span!(BACKEND, "stream"))
            .await?;

        Ok(event_stream(BACKEND, source, cancel, Self::parse_event))
    }

    async fn list_models(&self) -> DispatchResult<Vec<String>> {
        let request = self.with_key(self.client.get(format!("{}/v1beta/models", self.base_url)));
        let listing: ModelList = get_json(BACKEND, request)
            .instrument(provider_span!(BACKEND, "list_models"))
            .await?;
        Ok(listing
            .models
            .into_iter()
            .map(|m| {
                m.name
                    .strip_prefix("models/")
                    .map_or_else(|| m.name.clone(), str::to_string)
            })
            .collect())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct SystemInstruction<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    error: Option<ChunkError>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Deserialize)]
struct ChunkError {
    message: String,
}

#[derive(Deserialize)]
struct ModelList {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    name: String,
}
