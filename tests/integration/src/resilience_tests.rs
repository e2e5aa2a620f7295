//! Circuit breaker, retry and timeout integration tests

use crate::fixtures::*;
use crate::helpers::*;
use crate::mock_providers::*;
use dispatch_core::{Backend, DispatchError, DispatchEvent, EventKind};
use dispatch_resilience::CircuitState;
use futures::StreamExt;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

fn breaker_state(dispatcher: &dispatch_engine::Dispatcher, backend: Backend) -> CircuitState {
    dispatcher
        .circuit_stats()
        .into_iter()
        .find(|s| s.backend == backend)
        .map_or(CircuitState::Closed, |s| s.state)
}

/// Five consecutive failures open the circuit; requests are then rejected
/// without reaching the backend until the cool-down elapses
#[tokio::test(start_paused = true)]
async fn test_circuit_opens_and_recovers() {
    let provider = ScriptedProvider::with_script(
        Backend::OpenAI,
        (0..5).map(|_| Step::Fail(bad_request(Backend::OpenAI))).collect(),
        Step::text("back"),
    );
    let dispatcher = dispatcher_with(no_retry_config(), &[Arc::clone(&provider)]);
    let events = EventLog::attach(&dispatcher);

    for i in 0..5 {
        let err = dispatcher
            .complete(request_for(Backend::OpenAI, &format!("req {i}")))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Backend { .. }));
    }
    assert_eq!(breaker_state(&dispatcher, Backend::OpenAI), CircuitState::Open);
    assert_eq!(events.count(EventKind::CircuitOpened), 1);

    let err = dispatcher
        .complete(request_for(Backend::OpenAI, "rejected"))
        .await
        .unwrap_err();
    match err {
        DispatchError::CircuitOpen { backend, retry_after } => {
            assert_eq!(backend, Backend::OpenAI);
            assert!(retry_after > Duration::ZERO && retry_after <= Duration::from_secs(30));
        }
        other => panic!("expected CircuitOpen, got {other:?}"),
    }
    assert_eq!(provider.call_count(), 5);
    assert_eq!(dispatcher.metrics().circuit_rejections, 1);

    // Other backends are unaffected
    assert_eq!(breaker_state(&dispatcher, Backend::Ollama), CircuitState::Closed);

    tokio::time::advance(Duration::from_secs(31)).await;
    let done = dispatcher
        .complete(request_for(Backend::OpenAI, "trial"))
        .await
        .unwrap();
    assert_eq!(done.text, "back");
    assert_eq!(provider.call_count(), 6);
    assert_eq!(breaker_state(&dispatcher, Backend::OpenAI), CircuitState::Closed);
    assert_eq!(events.count(EventKind::CircuitClosed), 1);
}

/// A failed trial reopens the circuit for another cool-down
#[tokio::test(start_paused = true)]
async fn test_failed_trial_reopens() {
    let provider = ScriptedProvider::with_script(
        Backend::Anthropic,
        (0..6).map(|_| Step::Fail(bad_request(Backend::Anthropic))).collect(),
        Step::text("ok"),
    );
    let dispatcher = dispatcher_with(no_retry_config(), &[Arc::clone(&provider)]);

    for i in 0..5 {
        let _ = dispatcher
            .complete(request_for(Backend::Anthropic, &format!("req {i}")))
            .await;
    }
    tokio::time::advance(Duration::from_secs(31)).await;

    let err = dispatcher
        .complete(request_for(Backend::Anthropic, "trial"))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Backend { .. }));
    assert_eq!(breaker_state(&dispatcher, Backend::Anthropic), CircuitState::Open);

    let err = dispatcher
        .complete(request_for(Backend::Anthropic, "too soon"))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::CircuitOpen { .. }));
    assert_eq!(provider.call_count(), 6);
}

/// Transient failures are retried with exponential backoff
#[tokio::test(start_paused = true)]
async fn test_retry_backoff_schedule() {
    let provider = ScriptedProvider::with_script(
        Backend::Ollama,
        (0..3).map(|_| Step::Fail(unavailable(Backend::Ollama))).collect(),
        Step::text("finally"),
    );
    let dispatcher = dispatcher_with(test_config(), &[Arc::clone(&provider)]);
    let events = EventLog::attach(&dispatcher);

    let done = dispatcher.complete(hello_request()).await.unwrap();

    assert_eq!(done.text, "finally");
    assert_eq!(provider.call_count(), 4);
    let expected = [1, 2, 4].map(Duration::from_secs);
    for (gap, want) in provider.call_gaps().into_iter().zip(expected) {
        assert!(
            gap >= want && gap < want + Duration::from_millis(50),
            "gap {gap:?}, expected {want:?}"
        );
    }

    let retries = events.of_kind(EventKind::RetryScheduled);
    assert_eq!(retries.len(), 3);
    assert!(matches!(
        retries[0],
        DispatchEvent::RetryScheduled { attempt: 1, delay, .. } if delay == Duration::from_secs(1)
    ));
    assert_eq!(dispatcher.metrics().retries, 3);
    // Retries inside one request count as a single success for the breaker
    assert_eq!(breaker_state(&dispatcher, Backend::Ollama), CircuitState::Closed);
}

/// Exhausted retries surface the last error
#[tokio::test(start_paused = true)]
async fn test_retries_exhausted() {
    let provider = ScriptedProvider::with_script(
        Backend::Ollama,
        Vec::new(),
        Step::Fail(unavailable(Backend::Ollama)),
    );
    let dispatcher = dispatcher_with(test_config(), &[Arc::clone(&provider)]);

    let err = dispatcher.complete(hello_request()).await.unwrap_err();

    assert!(matches!(err, DispatchError::Backend { status: Some(503), .. }));
    assert_eq!(provider.call_count(), 4);
    let stats = dispatcher
        .circuit_stats()
        .into_iter()
        .find(|s| s.backend == Backend::Ollama)
        .unwrap();
    assert_eq!(stats.consecutive_failures, 1);
}

/// Permanent errors are not retried
#[tokio::test(start_paused = true)]
async fn test_non_retryable_error_single_attempt() {
    let provider = ScriptedProvider::with_script(
        Backend::Ollama,
        vec![Step::Fail(bad_request(Backend::Ollama))],
        Step::text("unused"),
    );
    let dispatcher = dispatcher_with(test_config(), &[Arc::clone(&provider)]);

    let err = dispatcher.complete(hello_request()).await.unwrap_err();

    assert!(matches!(err, DispatchError::Backend { status: Some(400), .. }));
    assert_eq!(provider.call_count(), 1);
    assert_eq!(dispatcher.metrics().retries, 0);
}

/// A failure after output has streamed is not retried and the partial
/// output has already reached the caller
#[tokio::test(start_paused = true)]
async fn test_no_retry_after_partial_output() {
    let provider = ScriptedProvider::with_script(
        Backend::Ollama,
        vec![Step::Break(
            vec!["partial ".to_string()],
            unavailable(Backend::Ollama),
        )],
        Step::text("unused"),
    );
    let dispatcher = dispatcher_with(test_config(), &[Arc::clone(&provider)]);

    let mut stream = dispatcher.stream(hello_request()).unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap(), "partial ");
    let err = stream.next().await.unwrap().unwrap_err();
    assert!(matches!(err, DispatchError::Backend { .. }));
    assert!(stream.next().await.is_none());
    assert_eq!(provider.call_count(), 1);
}

/// The wall-clock timeout bounds a request and counts as a backend failure
#[tokio::test(start_paused = true)]
async fn test_request_timeout() {
    let provider = ScriptedProvider::hanging(Backend::Gemini);
    let mut config = test_config();
    config.timeouts.request = Duration::from_secs(5);
    let dispatcher = dispatcher_with(config, &[Arc::clone(&provider)]);

    let started = tokio::time::Instant::now();
    let err = dispatcher
        .complete(request_for(Backend::Gemini, "slow"))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        DispatchError::Timeout {
            backend: Backend::Gemini,
            elapsed: Duration::from_secs(5)
        }
    );
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert_eq!(provider.call_count(), 1);
    assert_eq!(dispatcher.metrics().timeouts, 1);
    let stats = dispatcher
        .circuit_stats()
        .into_iter()
        .find(|s| s.backend == Backend::Gemini)
        .unwrap();
    assert_eq!(stats.consecutive_failures, 1);
}

/// The timeout also cuts retry backoff short
#[tokio::test(start_paused = true)]
async fn test_timeout_covers_retries() {
    let provider = ScriptedProvider::with_script(
        Backend::Ollama,
        Vec::new(),
        Step::Fail(unavailable(Backend::Ollama)),
    );
    let mut config = test_config();
    config.timeouts.request = Duration::from_secs(2);
    let dispatcher = dispatcher_with(config, &[Arc::clone(&provider)]);

    let err = dispatcher.complete(hello_request()).await.unwrap_err();

    assert!(matches!(err, DispatchError::Timeout { .. }));
    // Attempts at 0s and 1s; the 2s backoff is interrupted
    assert_eq!(provider.call_count(), 2);
}
