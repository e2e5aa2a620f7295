//! End-to-end dispatch tests
//!
//! Full request flows through validation, routing, streaming, events and
//! metrics.

use crate::fixtures::*;
use crate::helpers::*;
use crate::mock_providers::*;
use dispatch_core::{Backend, CompletionRequest, DispatchError, DispatchEvent, EventKind};
use dispatch_engine::CompletionSource;
use futures::StreamExt;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Chunks arrive in order and the completion carries the full text
#[tokio::test(start_paused = true)]
async fn test_streaming_flow() {
    let provider = ScriptedProvider::with_script(
        Backend::Ollama,
        vec![Step::chunks(&["The ", "answer ", "is 4."])],
        Step::text("unused"),
    );
    let dispatcher = dispatcher_with(test_config(), &[Arc::clone(&provider)]);

    let mut stream = dispatcher
        .stream(CompletionRequest::builder().user("What is 2 + 2?").build())
        .unwrap();
    let mut chunks = Vec::new();
    while let Some(chunk) = stream.next().await {
        chunks.push(chunk.unwrap());
    }

    assert_eq!(chunks, vec!["The ", "answer ", "is 4."]);
    let completion = stream.completion().unwrap();
    assert_eq!(completion.text, "The answer is 4.");
    assert_eq!(completion.backend, Backend::Ollama);
    assert_eq!(completion.model, "llama3.2");
    assert_eq!(completion.source, CompletionSource::Backend);

    let call = &provider.calls()[0];
    assert_eq!(call.options.model, "llama3.2");
    assert_eq!(call.last_content(), "What is 2 + 2?");
}

/// Message content is sanitized before it reaches the backend
#[tokio::test(start_paused = true)]
async fn test_content_sanitized_before_dispatch() {
    let provider = ScriptedProvider::new(Backend::Ollama, "ok");
    let dispatcher = dispatcher_with(test_config(), &[Arc::clone(&provider)]);

    dispatcher
        .complete(CompletionRequest::builder().user("  hel\u{200B}lo\n\n\n\n\n\nworld  ").build())
        .await
        .unwrap();

    assert_eq!(provider.prompts(), vec!["  hello\n\nworld  "]);
}

/// Invalid requests fail before any backend work
#[tokio::test(start_paused = true)]
async fn test_validation_rejects_without_backend_call() {
    let provider = ScriptedProvider::new(Backend::Ollama, "ok");
    let dispatcher = dispatcher_with(test_config(), &[Arc::clone(&provider)]);
    let events = EventLog::attach(&dispatcher);

    let cases = vec![
        CompletionRequest::builder().build(),
        CompletionRequest::builder().user("   ").build(),
        CompletionRequest::builder().user("hi").temperature(2.5).build(),
        CompletionRequest::builder().user("hi").max_tokens(0).build(),
        CompletionRequest::builder().user("hi").model("  ").build(),
    ];
    let count = cases.len();
    for request in cases {
        let err = dispatcher.stream(request).unwrap_err();
        assert!(matches!(err, DispatchError::Validation { .. }), "{err:?}");
    }

    assert_eq!(provider.call_count(), 0);
    let metrics = dispatcher.metrics();
    assert_eq!(metrics.validation_failures, count as u64);
    assert_eq!(metrics.requests, 0);
    assert_eq!(events.count(EventKind::RequestFailed), count);
    assert_eq!(events.count(EventKind::RequestStarted), 0);
}

/// Requests go to the selected backend unless they override it
#[tokio::test(start_paused = true)]
async fn test_routing_follows_selection_and_overrides() {
    let ollama = ScriptedProvider::new(Backend::Ollama, "local");
    let openai = ScriptedProvider::new(Backend::OpenAI, "hosted");
    let anthropic = ScriptedProvider::new(Backend::Anthropic, "claude");
    let dispatcher = dispatcher_with(
        test_config(),
        &[Arc::clone(&ollama), Arc::clone(&openai), Arc::clone(&anthropic)],
    );

    let done = dispatcher.complete(tagged_request("one")).await.unwrap();
    assert_eq!(done.backend, Backend::Ollama);

    dispatcher.select_model(Backend::OpenAI, Some("gpt-4o".to_string()));
    let done = dispatcher.complete(tagged_request("two")).await.unwrap();
    assert_eq!((done.backend, done.model.as_str(), done.text.as_str()), (Backend::OpenAI, "gpt-4o", "hosted"));

    let done = dispatcher
        .complete(request_for(Backend::Anthropic, "three"))
        .await
        .unwrap();
    assert_eq!(done.backend, Backend::Anthropic);
    assert_eq!(done.model, "claude-3-5-haiku-latest");

    let done = dispatcher
        .complete(
            CompletionRequest::builder()
                .user("four")
                .model("gpt-4.1")
                .build(),
        )
        .await
        .unwrap();
    assert_eq!((done.backend, done.model.as_str()), (Backend::OpenAI, "gpt-4.1"));

    dispatcher.clear_selected_model();
    let done = dispatcher.complete(tagged_request("five")).await.unwrap();
    assert_eq!(done.backend, Backend::Ollama);

    assert_eq!(ollama.prompts(), vec!["one", "five"]);
    assert_eq!(openai.prompts(), vec!["two", "four"]);
    assert_eq!(anthropic.prompts(), vec!["three"]);
}

/// A backend without an adapter fails with BackendUnavailable
#[tokio::test(start_paused = true)]
async fn test_unregistered_backend_fails() {
    let dispatcher = dispatcher_with(test_config(), &[ScriptedProvider::new(Backend::Ollama, "ok")]);

    let err = dispatcher
        .complete(request_for(Backend::Gemini, "hi"))
        .await
        .unwrap_err();
    assert_eq!(err, DispatchError::BackendUnavailable { backend: Backend::Gemini });
    assert_eq!(dispatcher.metrics().failures, 1);
}

/// Lifecycle events are published in order and handlers can be removed
#[tokio::test(start_paused = true)]
async fn test_lifecycle_events() {
    let provider = ScriptedProvider::new(Backend::Ollama, "Hello");
    let dispatcher = dispatcher_with(test_config(), &[provider]);
    let events = EventLog::attach(&dispatcher);

    let completed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&completed);
    let handler = dispatcher.on(EventKind::RequestCompleted, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let done = dispatcher.complete(hello_request()).await.unwrap();
    assert!(dispatcher.off(handler));
    dispatcher.complete(tagged_request("again")).await.unwrap();

    assert_eq!(completed.load(Ordering::SeqCst), 1);
    let kinds: Vec<EventKind> = events.all().iter().map(DispatchEvent::kind).collect();
    assert_eq!(
        &kinds[..2],
        &[EventKind::RequestStarted, EventKind::RequestCompleted]
    );
    match &events.of_kind(EventKind::RequestCompleted)[0] {
        DispatchEvent::RequestCompleted { stream_id, chars, .. } => {
            assert_eq!(*stream_id, done.stream_id);
            assert_eq!(*chars, 5);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

/// Broadcast subscribers see the same events as handlers
#[tokio::test(start_paused = true)]
async fn test_subscriber_receives_events() {
    let dispatcher = dispatcher_with(test_config(), &[ScriptedProvider::new(Backend::Ollama, "ok")]);
    let mut rx = dispatcher.subscribe();

    let done = dispatcher.complete(hello_request()).await.unwrap();

    let started = rx.recv().await.unwrap();
    assert!(matches!(
        started,
        DispatchEvent::RequestStarted { stream_id, backend: Backend::Ollama, .. } if stream_id == done.stream_id
    ));
    assert_eq!(rx.recv().await.unwrap().kind(), EventKind::RequestCompleted);
}

/// Counters and the Prometheus rendering track requests
#[tokio::test(start_paused = true)]
async fn test_metrics_accounting() {
    let provider = ScriptedProvider::with_script(
        Backend::Ollama,
        vec![Step::text("one"), Step::Fail(bad_request(Backend::Ollama))],
        Step::text("three"),
    );
    let dispatcher = dispatcher_with(no_retry_config(), &[provider]);

    dispatcher.complete(tagged_request("a")).await.unwrap();
    dispatcher.complete(tagged_request("b")).await.unwrap_err();
    dispatcher.complete(tagged_request("a")).await.unwrap();

    let metrics = dispatcher.metrics();
    assert_eq!(metrics.requests, 3);
    assert_eq!(metrics.successes, 2);
    assert_eq!(metrics.failures, 1);
    assert_eq!(metrics.cache_hits, 1);
    assert_eq!(metrics.cache_misses, 2);
    assert_eq!(metrics.backends[&Backend::Ollama].requests, 3);

    let text = dispatcher.render_metrics().unwrap();
    assert!(text.contains("llm_dispatch_requests_total"));

    dispatcher.reset_metrics();
    let metrics = dispatcher.metrics();
    assert_eq!(metrics.requests, 0);
    assert_eq!(dispatcher.cache_stats().hits, 0);
}

/// Model lists are fetched per backend and remembered
#[tokio::test(start_paused = true)]
async fn test_model_refresh() {
    let dispatcher = dispatcher_with(
        test_config(),
        &[
            ScriptedProvider::new(Backend::Ollama, "ok"),
            ScriptedProvider::new(Backend::Gemini, "ok"),
        ],
    );
    let events = EventLog::attach(&dispatcher);

    let all = dispatcher.refresh_all_models().await;
    assert_eq!(all.len(), 2);
    assert_eq!(all[&Backend::Gemini], vec!["gemini-small", "gemini-large"]);
    assert_eq!(dispatcher.models(Backend::Ollama), vec!["ollama-small", "ollama-large"]);
    assert_eq!(events.count(EventKind::ModelsRefreshed), 2);

    let status = dispatcher.test_connection(Backend::Gemini).await;
    assert!(status.ok);
    assert!(!dispatcher.test_connection(Backend::OpenAI).await.ok);
}
