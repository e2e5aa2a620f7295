//! Mock providers for integration testing
//!
//! [`ScriptedProvider`] is an in-process adapter that plays back a list of
//! steps and records every call. The wiremock helpers simulate the Ollama and
//! OpenAI HTTP APIs for the real adapters.

use async_trait::async_trait;
use dispatch_core::{
    Backend, CancellationToken, ChatMessage, ChunkStream, DispatchError, DispatchResult,
    GenerationOptions, ProviderAdapter,
};
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// What the scripted provider does on one call
#[derive(Debug, Clone)]
pub enum Step {
    /// Stream these chunks
    Respond(Vec<String>),
    /// Wait, then stream these chunks
    Delay(Duration, Vec<String>),
    /// Fail before streaming anything
    Fail(DispatchError),
    /// Wait, then fail
    FailAfter(Duration, DispatchError),
    /// Stream these chunks, then fail
    Break(Vec<String>, DispatchError),
    /// Never answer
    Hang,
}

impl Step {
    /// Respond with a single chunk
    pub fn text(text: &str) -> Self {
        Self::Respond(vec![text.to_string()])
    }

    /// Respond with several chunks
    pub fn chunks(chunks: &[&str]) -> Self {
        Self::Respond(chunks.iter().map(ToString::to_string).collect())
    }

    /// Wait, then respond with a single chunk
    pub fn delayed(delay: Duration, text: &str) -> Self {
        Self::Delay(delay, vec![text.to_string()])
    }
}

/// One recorded call
#[derive(Debug, Clone)]
pub struct RecordedCall {
    /// When the call started
    pub at: Instant,
    /// Messages sent
    pub messages: Vec<ChatMessage>,
    /// Options sent
    pub options: GenerationOptions,
}

impl RecordedCall {
    /// Content of the last message
    pub fn last_content(&self) -> &str {
        self.messages.last().map_or("", |m| m.content.as_str())
    }
}

/// In-process adapter that follows a script
pub struct ScriptedProvider {
    backend: Backend,
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    calls: Mutex<Vec<RecordedCall>>,
    models: Vec<String>,
}

impl ScriptedProvider {
    /// Provider that answers every call with `text`
    pub fn new(backend: Backend, text: &str) -> Arc<Self> {
        Self::with_script(backend, Vec::new(), Step::text(text))
    }

    /// Provider that plays `steps` in order, then `fallback` forever
    pub fn with_script(backend: Backend, steps: Vec<Step>, fallback: Step) -> Arc<Self> {
        Arc::new(Self {
            backend,
            script: Mutex::new(steps.into()),
            fallback,
            calls: Mutex::new(Vec::new()),
            models: vec![format!("{}-small", backend.as_str()), format!("{}-large", backend.as_str())],
        })
    }

    /// Provider that never answers
    pub fn hanging(backend: Backend) -> Arc<Self> {
        Self::with_script(backend, Vec::new(), Step::Hang)
    }

    /// Append steps to the script
    pub fn push(&self, steps: impl IntoIterator<Item = Step>) {
        self.script.lock().extend(steps);
    }

    /// Number of calls received
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Every call received, in order
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Last-message content of every call, in order
    pub fn prompts(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .map(|c| c.last_content().to_string())
            .collect()
    }

    /// Gaps between consecutive calls
    pub fn call_gaps(&self) -> Vec<Duration> {
        let calls = self.calls.lock();
        calls.windows(2).map(|w| w[1].at - w[0].at).collect()
    }

    fn next_step(&self) -> Step {
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

fn chunk_stream(chunks: Vec<String>, tail: Option<DispatchError>) -> ChunkStream {
    let items = chunks
        .into_iter()
        .map(Ok)
        .chain(tail.map(Err))
        .collect::<Vec<DispatchResult<String>>>();
    futures::stream::iter(items).boxed()
}

#[async_trait]
impl ProviderAdapter for ScriptedProvider {
    fn backend(&self) -> Backend {
        self.backend
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        options: &GenerationOptions,
        _cancel: CancellationToken,
    ) -> DispatchResult<ChunkStream> {
        self.calls.lock().push(RecordedCall {
            at: Instant::now(),
            messages: messages.to_vec(),
            options: options.clone(),
        });

        match self.next_step() {
            Step::Respond(chunks) => Ok(chunk_stream(chunks, None)),
            Step::Delay(delay, chunks) => {
                tokio::time::sleep(delay).await;
                Ok(chunk_stream(chunks, None))
            }
            Step::Fail(error) => Err(error),
            Step::FailAfter(delay, error) => {
                tokio::time::sleep(delay).await;
                Err(error)
            }
            Step::Break(chunks, error) => Ok(chunk_stream(chunks, Some(error))),
            Step::Hang => futures::future::pending().await,
        }
    }

    async fn list_models(&self) -> DispatchResult<Vec<String>> {
        Ok(self.models.clone())
    }
}

/// Transient backend failure
pub fn unavailable(backend: Backend) -> DispatchError {
    DispatchError::backend(backend, "service unavailable", Some(503), true)
}

/// Permanent backend failure
pub fn bad_request(backend: Backend) -> DispatchError {
    DispatchError::backend(backend, "invalid request", Some(400), false)
}

/// Mock Ollama API server
pub struct MockOllama {
    pub server: MockServer,
}

impl MockOllama {
    /// Start a new mock Ollama server
    pub async fn new() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    /// Base URL for this mock server
    pub fn url(&self) -> String {
        self.server.uri()
    }

    /// Stream `chunks` as NDJSON from /api/chat
    pub async fn mock_chat(&self, chunks: &[&str]) {
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ndjson(chunks))
            .mount(&self.server)
            .await;
    }

    /// Answer /api/chat with `status` for the next `times` calls
    pub async fn mock_chat_error(&self, status: u16, times: u64) {
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(
                ResponseTemplate::new(status)
                    .set_body_json(json!({"error": format!("upstream returned {status}")})),
            )
            .up_to_n_times(times)
            .mount(&self.server)
            .await;
    }

    /// Serve a model list from /api/tags
    pub async fn mock_tags(&self, models: &[&str]) {
        let models: Vec<_> = models.iter().map(|m| json!({"name": m, "size": 1})).collect();
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "models": models })))
            .mount(&self.server)
            .await;
    }

    /// Number of requests received
    pub async fn requests(&self) -> usize {
        self.server.received_requests().await.map_or(0, |r| r.len())
    }
}

/// Mock OpenAI API server
pub struct MockOpenAI {
    pub server: MockServer,
}

impl MockOpenAI {
    /// Start a new mock OpenAI server
    pub async fn new() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    /// Base URL for this mock server
    pub fn url(&self) -> String {
        self.server.uri()
    }

    /// Stream `chunks` as SSE deltas from /v1/chat/completions
    pub async fn mock_chat(&self, chunks: &[&str]) {
        let mut body = String::new();
        for chunk in chunks {
            let event = json!({"choices": [{"delta": {"content": chunk}}]});
            body.push_str(&format!("data: {event}\n\n"));
        }
        body.push_str("data: [DONE]\n\n");

        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(body.into_bytes(), "text/event-stream"),
            )
            .mount(&self.server)
            .await;
    }

    /// Answer /v1/chat/completions with `status`
    pub async fn mock_chat_error(&self, status: u16, code: &str, message: &str) {
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(status).set_body_json(json!({
                "error": {"message": message, "type": code, "code": code}
            })))
            .mount(&self.server)
            .await;
    }

    /// Number of requests received
    pub async fn requests(&self) -> usize {
        self.server.received_requests().await.map_or(0, |r| r.len())
    }
}

fn ndjson(chunks: &[&str]) -> ResponseTemplate {
    let mut body = String::new();
    for chunk in chunks {
        let line = json!({"message": {"role": "assistant", "content": chunk}, "done": false});
        body.push_str(&format!("{line}\n"));
    }
    body.push_str("{\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true}\n");
    ResponseTemplate::new(200).set_body_raw(body.into_bytes(), "application/x-ndjson")
}
