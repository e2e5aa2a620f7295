//! Provider adapter integration tests
//!
//! The real HTTP adapters run against wiremock servers speaking the Ollama
//! and OpenAI wire formats.

use crate::fixtures::*;
use crate::mock_providers::*;
use dispatch_config::{DispatcherConfig, ProviderSettings};
use dispatch_core::{Backend, CompletionRequest, DispatchError};
use dispatch_engine::{CompletionSource, Dispatcher};
use dispatch_providers::{AdapterConfig, OpenAIAdapter, ProviderRegistry};
use futures::StreamExt;
use pretty_assertions::assert_eq;
use serde_json::Value;
use std::sync::Arc;

fn ollama_config(base_url: String) -> DispatcherConfig {
    let mut config = fast_retry_config();
    config.providers.insert(
        Backend::Ollama,
        ProviderSettings {
            base_url: Some(base_url),
            ..Default::default()
        },
    );
    config
}

fn openai_dispatcher(base_url: String) -> Dispatcher {
    let adapter = OpenAIAdapter::new(AdapterConfig::with_base_url(base_url).api_key("sk-test"))
        .expect("adapter");
    Dispatcher::builder(fast_retry_config())
        .provider(Arc::new(adapter))
        .build()
        .expect("dispatcher")
}

/// NDJSON chunks from Ollama are streamed in order
#[tokio::test]
async fn test_ollama_streaming() {
    let server = MockOllama::new().await;
    server.mock_chat(&["Hel", "lo"]).await;
    let dispatcher = Dispatcher::from_config(ollama_config(server.url())).unwrap();

    let mut stream = dispatcher.stream(terse_request()).unwrap();
    let mut chunks = Vec::new();
    while let Some(chunk) = stream.next().await {
        chunks.push(chunk.unwrap());
    }

    assert_eq!(chunks, vec!["Hel", "lo"]);
    let completion = stream.completion().unwrap();
    assert_eq!(completion.text, "Hello");
    assert_eq!(completion.backend, Backend::Ollama);
    assert_eq!(completion.model, "llama3.2");

    let requests = server.server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["model"], "llama3.2");
    assert_eq!(body["stream"], true);
    assert_eq!(body["messages"][0]["role"], "system");
    assert_eq!(body["messages"][1]["content"], "hi");
}

/// Generation options reach the Ollama request body
#[tokio::test]
async fn test_ollama_options_forwarded() {
    let server = MockOllama::new().await;
    server.mock_chat(&["ok"]).await;
    let dispatcher = Dispatcher::from_config(ollama_config(server.url())).unwrap();

    let request = CompletionRequest::builder()
        .user("hi")
        .model("qwen2.5")
        .temperature(0.3)
        .max_tokens(64)
        .build();
    dispatcher.complete(request).await.unwrap();

    let requests = server.server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["model"], "qwen2.5");
    assert_eq!(body["options"]["temperature"], 0.3);
    assert_eq!(body["options"]["num_predict"], 64);
}

/// Server errors are retried until the backend answers
#[tokio::test]
async fn test_ollama_transient_errors_retried() {
    let server = MockOllama::new().await;
    server.mock_chat_error(503, 2).await;
    server.mock_chat(&["recovered"]).await;
    let dispatcher = Dispatcher::from_config(ollama_config(server.url())).unwrap();

    let done = dispatcher.complete(hello_request()).await.unwrap();

    assert_eq!(done.text, "recovered");
    assert_eq!(done.source, CompletionSource::Backend);
    assert_eq!(server.requests().await, 3);
    assert_eq!(dispatcher.metrics().retries, 2);
}

/// SSE deltas from an OpenAI-compatible API are streamed until `[DONE]`
#[tokio::test]
async fn test_openai_streaming() {
    let server = MockOpenAI::new().await;
    server.mock_chat(&["Hi", " there"]).await;
    let dispatcher = openai_dispatcher(server.url());

    let done = dispatcher
        .complete(request_for(Backend::OpenAI, "hello"))
        .await
        .unwrap();

    assert_eq!(done.text, "Hi there");
    assert_eq!(done.model, "gpt-4o-mini");

    let requests = server.server.received_requests().await.unwrap();
    assert_eq!(
        requests[0]
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok()),
        Some("Bearer sk-test")
    );
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["stream"], true);
    assert_eq!(body["messages"][0]["content"], "hello");
}

/// Authentication failures are not retried and keep the API's message
#[tokio::test]
async fn test_openai_auth_error_not_retried() {
    let server = MockOpenAI::new().await;
    server
        .mock_chat_error(401, "invalid_api_key", "Incorrect API key provided")
        .await;
    let dispatcher = openai_dispatcher(server.url());

    let err = dispatcher
        .complete(request_for(Backend::OpenAI, "hello"))
        .await
        .unwrap_err();

    match err {
        DispatchError::Backend {
            backend,
            message,
            status,
            retryable,
        } => {
            assert_eq!(backend, Backend::OpenAI);
            assert_eq!(message, "Incorrect API key provided");
            assert_eq!(status, Some(401));
            assert!(!retryable);
        }
        other => panic!("expected Backend error, got {other:?}"),
    }
    assert_eq!(server.requests().await, 1);
}

/// Model lists come from /api/tags and are kept on the dispatcher
#[tokio::test]
async fn test_refresh_models_from_tags() {
    let server = MockOllama::new().await;
    server.mock_tags(&["llama3.2:latest", "mistral:7b"]).await;
    let dispatcher = Dispatcher::from_config(ollama_config(server.url())).unwrap();

    let models = dispatcher.refresh_models(Backend::Ollama).await.unwrap();

    assert_eq!(models, vec!["llama3.2:latest", "mistral:7b"]);
    assert_eq!(dispatcher.models(Backend::Ollama), models);
}

/// The connection probe reports the backend's models
#[tokio::test]
async fn test_connection_probe() {
    let server = MockOllama::new().await;
    server.mock_tags(&["llama3.2:latest"]).await;
    let dispatcher = Dispatcher::from_config(ollama_config(server.url())).unwrap();

    let status = dispatcher.test_connection(Backend::Ollama).await;

    assert!(status.ok, "{}", status.message);
    assert_eq!(status.models, Some(vec!["llama3.2:latest".to_string()]));
    assert_eq!(dispatcher.models(Backend::Ollama), vec!["llama3.2:latest"]);
}

/// A probe against a failing server reports the error
#[tokio::test]
async fn test_connection_probe_failure() {
    let server = MockOllama::new().await;
    let dispatcher = Dispatcher::from_config(ollama_config(server.url())).unwrap();

    // Nothing is mounted, so wiremock answers 404
    let status = dispatcher.test_connection(Backend::Ollama).await;

    assert!(!status.ok);
    assert!(status.models.is_none());
}

/// Hosted backends are only registered when an API key is available
#[tokio::test]
async fn test_hosted_backends_need_keys() {
    let config = test_config();

    let registry = ProviderRegistry::from_config_with_env(&config, |_| None).unwrap();
    assert_eq!(registry.backends(), vec![Backend::Ollama]);

    let registry = ProviderRegistry::from_config_with_env(&config, |name| {
        (name == "ANTHROPIC_API_KEY").then(|| "sk-ant-test".to_string())
    })
    .unwrap();
    assert!(registry.contains(Backend::Anthropic));
    assert!(!registry.contains(Backend::OpenAI));

    let dispatcher = Dispatcher::builder(config)
        .providers(registry)
        .build()
        .unwrap();
    let err = dispatcher
        .complete(request_for(Backend::Gemini, "hi"))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        DispatchError::BackendUnavailable {
            backend: Backend::Gemini
        }
    );
}
