//! Cancellation and shutdown integration tests

use crate::fixtures::*;
use crate::helpers::*;
use crate::mock_providers::*;
use dispatch_core::{Backend, CancellationToken, CompletionRequest, DispatchError, EventKind};
use dispatch_engine::CompletionSource;
use futures::StreamExt;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

const LIMIT: Duration = Duration::from_secs(60);

fn consecutive_failures(dispatcher: &dispatch_engine::Dispatcher, backend: Backend) -> u32 {
    dispatcher
        .circuit_stats()
        .into_iter()
        .find(|s| s.backend == backend)
        .map_or(0, |s| s.consecutive_failures)
}

/// Aborting a stream by id ends it with a cancellation that does not count
/// against the backend
#[tokio::test(start_paused = true)]
async fn test_abort_stream_by_id() {
    let provider = ScriptedProvider::hanging(Backend::Ollama);
    let dispatcher = dispatcher_with(test_config(), &[Arc::clone(&provider)]);
    let events = EventLog::attach(&dispatcher);

    let mut stream = dispatcher.stream(hello_request()).unwrap();
    wait_until(LIMIT, || provider.call_count() == 1).await;

    let active = dispatcher.active_streams();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, stream.id());

    assert!(dispatcher.abort_stream(stream.id()));
    let err = stream.next().await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
    assert!(stream.next().await.is_none());

    assert!(dispatcher.active_streams().is_empty());
    assert!(!dispatcher.abort_stream(stream.id()));
    assert_eq!(consecutive_failures(&dispatcher, Backend::Ollama), 0);
    let metrics = dispatcher.metrics();
    assert_eq!(metrics.cancellations, 1);
    assert_eq!(metrics.failures, 0);
    assert_eq!(events.count(EventKind::StreamAborted), 1);
}

/// The caller's own token cancels the request
#[tokio::test(start_paused = true)]
async fn test_caller_token_cancels() {
    let provider = ScriptedProvider::hanging(Backend::Ollama);
    let dispatcher = dispatcher_with(test_config(), &[Arc::clone(&provider)]);

    let token = CancellationToken::new();
    let request = CompletionRequest::builder()
        .user("hi")
        .cancellation(token.clone())
        .build();
    let stream = dispatcher.stream(request).unwrap();
    wait_until(LIMIT, || provider.call_count() == 1).await;

    token.cancel();
    let err = stream.collect().await.unwrap_err();
    assert!(err.is_cancelled());
}

/// Dropping the stream cancels the request
#[tokio::test(start_paused = true)]
async fn test_dropping_stream_cancels() {
    let provider = ScriptedProvider::hanging(Backend::Ollama);
    let dispatcher = dispatcher_with(test_config(), &[Arc::clone(&provider)]);

    let stream = dispatcher.stream(hello_request()).unwrap();
    wait_until(LIMIT, || provider.call_count() == 1).await;
    drop(stream);

    wait_until(LIMIT, || dispatcher.active_streams().is_empty()).await;
    assert_eq!(dispatcher.metrics().cancellations, 1);
}

/// Chunks streamed before cancellation reach the caller
#[tokio::test(start_paused = true)]
async fn test_partial_output_before_abort() {
    let provider = ScriptedProvider::with_script(
        Backend::Ollama,
        vec![Step::chunks(&["Once ", "upon "])],
        Step::text("unused"),
    );
    let dispatcher = dispatcher_with(test_config(), &[Arc::clone(&provider)]);

    let mut stream = dispatcher.stream(hello_request()).unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap(), "Once ");
    stream.cancel();

    // The remaining output may already be buffered; the stream still ends
    let mut rest = Vec::new();
    while let Some(item) = stream.next().await {
        rest.push(item);
    }
    assert!(rest.len() <= 2);
}

/// Cancelling the leader of a deduplicated execution releases its
/// fingerprint so later identical requests run again
#[tokio::test(start_paused = true)]
async fn test_cancelled_leader_releases_fingerprint() {
    let provider = ScriptedProvider::with_script(Backend::Ollama, vec![Step::Hang], Step::text("fresh"));
    let dispatcher = dispatcher_with(test_config(), &[Arc::clone(&provider)]);

    let leader = dispatcher.stream(terse_request()).unwrap();
    wait_until(LIMIT, || provider.call_count() == 1).await;
    assert!(dispatcher.abort_stream(leader.id()));
    assert!(leader.collect().await.unwrap_err().is_cancelled());

    let done = dispatcher.complete(terse_request()).await.unwrap();
    assert_eq!(done.text, "fresh");
    assert_eq!(provider.call_count(), 2);
}

/// A follower whose leader is aborted runs the request itself instead of
/// failing with the leader's cancellation
#[tokio::test(start_paused = true)]
async fn test_follower_takes_over_cancelled_leader() {
    let provider = ScriptedProvider::with_script(Backend::Ollama, vec![Step::Hang], Step::text("fresh"));
    let dispatcher = dispatcher_with(test_config(), &[Arc::clone(&provider)]);
    let events = EventLog::attach(&dispatcher);

    let leader = dispatcher.stream(terse_request()).unwrap();
    wait_until(LIMIT, || provider.call_count() == 1).await;
    let follower = dispatcher.stream(terse_request()).unwrap();
    wait_until(LIMIT, || events.count(EventKind::DedupJoined) == 1).await;

    assert!(dispatcher.abort_stream(leader.id()));
    assert!(leader.collect().await.unwrap_err().is_cancelled());

    let done = follower.collect().await.unwrap();
    assert_eq!(done.text, "fresh");
    assert_eq!(done.source, CompletionSource::Backend);
    assert_eq!(provider.call_count(), 2);
    let metrics = dispatcher.metrics();
    assert_eq!(metrics.cancellations, 1);
    assert_eq!(metrics.dedup_hits, 1);
}

/// A follower that is itself cancelled does not restart the request
#[tokio::test(start_paused = true)]
async fn test_cancelled_follower_does_not_take_over() {
    let provider = ScriptedProvider::hanging(Backend::Ollama);
    let dispatcher = dispatcher_with(test_config(), &[Arc::clone(&provider)]);
    let events = EventLog::attach(&dispatcher);

    let _leader = dispatcher.stream(terse_request()).unwrap();
    wait_until(LIMIT, || provider.call_count() == 1).await;
    let follower = dispatcher.stream(terse_request()).unwrap();
    wait_until(LIMIT, || events.count(EventKind::DedupJoined) == 1).await;

    follower.cancel();
    assert!(follower.collect().await.unwrap_err().is_cancelled());
    assert_eq!(provider.call_count(), 1);
}

/// A queued request can be cancelled before it runs
#[tokio::test(start_paused = true)]
async fn test_cancel_while_queued() {
    let provider = ScriptedProvider::new(Backend::OpenAI, "ok");
    let dispatcher = dispatcher_with(
        rate_limited_config(Backend::OpenAI, 1),
        &[Arc::clone(&provider)],
    );

    dispatcher
        .complete(request_for(Backend::OpenAI, "first"))
        .await
        .unwrap();
    let queued = dispatcher.stream(request_for(Backend::OpenAI, "second")).unwrap();
    wait_until(LIMIT, || dispatcher.queue_depth() == 1).await;

    queued.cancel();
    let err = queued.collect().await.unwrap_err();
    assert!(err.is_cancelled());

    // The scheduler discards the abandoned entry on its next pass
    wait_until(LIMIT, || dispatcher.queue_depth() == 0).await;
    assert_eq!(provider.call_count(), 1);
}

/// Abort-all cancels every running stream
#[tokio::test(start_paused = true)]
async fn test_abort_all() {
    let provider = ScriptedProvider::hanging(Backend::Ollama);
    let dispatcher = dispatcher_with(test_config(), &[Arc::clone(&provider)]);

    let streams: Vec<_> = (0..3)
        .map(|i| dispatcher.stream(tagged_request(&format!("req {i}"))).unwrap())
        .collect();
    wait_until(LIMIT, || provider.call_count() == 3).await;

    assert_eq!(dispatcher.abort_all(), 3);
    for stream in streams {
        assert!(stream.collect().await.unwrap_err().is_cancelled());
    }
    assert_eq!(dispatcher.metrics().cancellations, 3);
}

/// Shutdown rejects queued work, cancels running streams and refuses new
/// requests
#[tokio::test(start_paused = true)]
async fn test_shutdown() {
    let provider = ScriptedProvider::hanging(Backend::OpenAI);
    let dispatcher = dispatcher_with(
        rate_limited_config(Backend::OpenAI, 1),
        &[Arc::clone(&provider)],
    );

    let running = dispatcher.stream(request_for(Backend::OpenAI, "running")).unwrap();
    wait_until(LIMIT, || provider.call_count() == 1).await;
    let queued = dispatcher.stream(request_for(Backend::OpenAI, "queued")).unwrap();
    wait_until(LIMIT, || dispatcher.queue_depth() == 1).await;

    dispatcher.shutdown();

    assert_eq!(queued.collect().await.unwrap_err(), DispatchError::DispatcherShutdown);
    assert!(running.collect().await.unwrap_err().is_cancelled());
    assert_eq!(dispatcher.queue_depth(), 0);
    assert!(dispatcher.is_shut_down());
    assert_eq!(
        dispatcher.stream(hello_request()).unwrap_err(),
        DispatchError::DispatcherShutdown
    );
    assert_eq!(provider.call_count(), 1);
}
