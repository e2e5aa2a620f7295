//! Caching and deduplication integration tests
//!
//! Identical requests are served from the response cache once completed and
//! share a single backend call while in flight.

use crate::fixtures::*;
use crate::helpers::*;
use crate::mock_providers::*;
use dispatch_core::{Backend, CompletionRequest, DispatchError, EventKind};
use dispatch_engine::CompletionSource;
use futures::future::join_all;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

/// A repeated request is answered from the cache
#[tokio::test(start_paused = true)]
async fn test_repeat_served_from_cache() {
    let provider = ScriptedProvider::new(Backend::Ollama, "Hello");
    let dispatcher = dispatcher_with(test_config(), &[Arc::clone(&provider)]);
    let events = EventLog::attach(&dispatcher);

    let first = dispatcher.complete(terse_request()).await.unwrap();
    let second = dispatcher.complete(terse_request()).await.unwrap();

    assert_eq!(first.text, "Hello");
    assert_eq!(first.source, CompletionSource::Backend);
    assert_eq!(second.text, "Hello");
    assert_eq!(second.source, CompletionSource::Cache);
    assert_eq!(provider.call_count(), 1);
    assert_eq!(events.count(EventKind::CacheHit), 1);

    let stats = dispatcher.cache_stats();
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(dispatcher.metrics().cache_hits, 1);
}

/// Anything that changes the fingerprint misses the cache
#[tokio::test(start_paused = true)]
async fn test_fingerprint_inputs_separate_entries() {
    let provider = ScriptedProvider::new(Backend::Ollama, "Hello");
    let openai = ScriptedProvider::new(Backend::OpenAI, "Hello");
    let dispatcher = dispatcher_with(test_config(), &[Arc::clone(&provider), Arc::clone(&openai)]);

    let variants = vec![
        terse_request(),
        CompletionRequest::builder().system("be terse").user("hi").temperature(0.2).build(),
        CompletionRequest::builder().system("be terse").user("hi").max_tokens(10).build(),
        CompletionRequest::builder().system("be terse").user("hi").model("qwen2.5").build(),
        CompletionRequest::builder().system("be brief").user("hi").build(),
        CompletionRequest::builder().system("be terse").user("hi").backend(Backend::OpenAI).build(),
    ];
    for request in variants {
        let done = dispatcher.complete(request).await.unwrap();
        assert_eq!(done.source, CompletionSource::Backend);
    }

    assert_eq!(provider.call_count(), 5);
    assert_eq!(openai.call_count(), 1);
    assert_eq!(dispatcher.cache_stats().entries, 6);
}

/// Priority is not part of the fingerprint
#[tokio::test(start_paused = true)]
async fn test_priority_does_not_affect_cache() {
    let provider = ScriptedProvider::new(Backend::Ollama, "Hello");
    let dispatcher = dispatcher_with(test_config(), &[Arc::clone(&provider)]);

    dispatcher.complete(prioritized_request("hi", 0)).await.unwrap();
    let done = dispatcher.complete(prioritized_request("hi", 9)).await.unwrap();

    assert_eq!(done.source, CompletionSource::Cache);
    assert_eq!(provider.call_count(), 1);
}

/// Entries expire after the TTL
#[tokio::test(start_paused = true)]
async fn test_cache_entries_expire() {
    let provider = ScriptedProvider::new(Backend::Ollama, "Hello");
    let mut config = test_config();
    config.cache.ttl = Duration::from_secs(60);
    let dispatcher = dispatcher_with(config, &[Arc::clone(&provider)]);

    dispatcher.complete(terse_request()).await.unwrap();
    tokio::time::advance(Duration::from_secs(61)).await;
    let done = dispatcher.complete(terse_request()).await.unwrap();

    assert_eq!(done.source, CompletionSource::Backend);
    assert_eq!(provider.call_count(), 2);
}

/// Failures and empty responses are not cached
#[tokio::test(start_paused = true)]
async fn test_failures_and_empty_text_not_cached() {
    let provider = ScriptedProvider::with_script(
        Backend::Ollama,
        vec![
            Step::Fail(bad_request(Backend::Ollama)),
            Step::Respond(Vec::new()),
        ],
        Step::text("Hello"),
    );
    let dispatcher = dispatcher_with(no_retry_config(), &[Arc::clone(&provider)]);

    assert!(dispatcher.complete(terse_request()).await.is_err());
    let empty = dispatcher.complete(terse_request()).await.unwrap();
    assert_eq!(empty.text, "");
    let done = dispatcher.complete(terse_request()).await.unwrap();
    assert_eq!(done.text, "Hello");
    assert_eq!(done.source, CompletionSource::Backend);
    assert_eq!(provider.call_count(), 3);
}

/// Clearing the cache forces a new backend call
#[tokio::test(start_paused = true)]
async fn test_clear_cache() {
    let provider = ScriptedProvider::new(Backend::Ollama, "Hello");
    let dispatcher = dispatcher_with(test_config(), &[Arc::clone(&provider)]);

    dispatcher.complete(terse_request()).await.unwrap();
    dispatcher.clear_cache();
    assert_eq!(dispatcher.cache_stats().entries, 0);
    dispatcher.complete(terse_request()).await.unwrap();

    assert_eq!(provider.call_count(), 2);
}

/// With caching disabled every request reaches the backend
#[tokio::test(start_paused = true)]
async fn test_cache_disabled() {
    let provider = ScriptedProvider::new(Backend::Ollama, "Hello");
    let mut config = test_config();
    config.cache.enabled = false;
    let dispatcher = dispatcher_with(config, &[Arc::clone(&provider)]);

    for _ in 0..3 {
        dispatcher.complete(terse_request()).await.unwrap();
    }

    assert_eq!(provider.call_count(), 3);
    assert_eq!(dispatcher.metrics().cache_misses, 0);
}

/// Concurrent identical requests share one backend call
#[tokio::test(start_paused = true)]
async fn test_concurrent_duplicates_share_one_call() {
    let provider = ScriptedProvider::with_script(
        Backend::Ollama,
        vec![Step::delayed(Duration::from_millis(500), "Hello")],
        Step::text("second call"),
    );
    let dispatcher = dispatcher_with(test_config(), &[Arc::clone(&provider)]);
    let events = EventLog::attach(&dispatcher);

    let results = join_all((0..5).map(|_| dispatcher.complete(terse_request()))).await;

    assert_eq!(provider.call_count(), 1);
    let completions: Vec<_> = results.into_iter().map(Result::unwrap).collect();
    assert!(completions.iter().all(|c| c.text == "Hello"));
    let leaders = completions
        .iter()
        .filter(|c| c.source == CompletionSource::Backend)
        .count();
    let followers = completions
        .iter()
        .filter(|c| c.source == CompletionSource::Deduplicated)
        .count();
    assert_eq!((leaders, followers), (1, 4));
    assert_eq!(events.count(EventKind::DedupJoined), 4);
    assert_eq!(dispatcher.metrics().dedup_hits, 4);
}

/// Followers of a failed execution receive the same error
#[tokio::test(start_paused = true)]
async fn test_followers_share_failure() {
    let failing = ScriptedProvider::with_script(
        Backend::Gemini,
        vec![Step::FailAfter(Duration::from_millis(200), bad_request(Backend::Gemini))],
        Step::text("recovered"),
    );
    let dispatcher = dispatcher_with(no_retry_config(), &[Arc::clone(&failing)]);

    let results = join_all((0..3).map(|_| dispatcher.complete(request_for(Backend::Gemini, "x")))).await;

    assert_eq!(failing.call_count(), 1);
    for result in results {
        assert!(matches!(result, Err(DispatchError::Backend { status: Some(400), .. })));
    }

    // The failed execution released its fingerprint
    let done = dispatcher.complete(request_for(Backend::Gemini, "x")).await.unwrap();
    assert_eq!(done.text, "recovered");
    assert_eq!(failing.call_count(), 2);
}

/// With deduplication disabled, concurrent duplicates each reach the backend
#[tokio::test(start_paused = true)]
async fn test_dedup_disabled() {
    let provider = ScriptedProvider::with_script(
        Backend::Ollama,
        Vec::new(),
        Step::delayed(Duration::from_millis(100), "Hello"),
    );
    let mut config = test_config();
    config.dedup.enabled = false;
    let dispatcher = dispatcher_with(config, &[Arc::clone(&provider)]);

    let results = join_all((0..3).map(|_| dispatcher.complete(terse_request()))).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(provider.call_count(), 3);
}
