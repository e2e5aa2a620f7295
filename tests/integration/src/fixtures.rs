//! Test fixtures and sample data for integration tests

use dispatch_config::{AuditSinkKind, DispatcherConfig};
use dispatch_core::{Backend, CompletionRequest};
use std::time::Duration;

/// A plain single-turn request
pub fn hello_request() -> CompletionRequest {
    CompletionRequest::builder().user("Hello, how are you?").build()
}

/// The request used by the cache scenarios
pub fn terse_request() -> CompletionRequest {
    CompletionRequest::builder()
        .system("be terse")
        .user("hi")
        .build()
}

/// A request whose prompt identifies it in recorded calls
pub fn tagged_request(tag: &str) -> CompletionRequest {
    CompletionRequest::builder().user(tag).build()
}

/// A tagged request with a queue priority
pub fn prioritized_request(tag: &str, priority: i32) -> CompletionRequest {
    CompletionRequest::builder().user(tag).priority(priority).build()
}

/// A tagged request routed to `backend`
pub fn request_for(backend: Backend, tag: &str) -> CompletionRequest {
    CompletionRequest::builder().user(tag).backend(backend).build()
}

/// Configuration with deterministic timing.
///
/// Retries use a fixed 1s/2s/4s schedule without jitter, the scheduler ticks
/// every 100ms and audit records stay in memory.
pub fn test_config() -> DispatcherConfig {
    let mut config = DispatcherConfig::default();
    config.retry.jitter = 0.0;
    config.retry.base_delay = Duration::from_secs(1);
    config.retry.multiplier = 2.0;
    config.queue.tick_interval = Duration::from_millis(100);
    config.audit.sink = AuditSinkKind::Memory;
    config
}

/// Test configuration without retries
pub fn no_retry_config() -> DispatcherConfig {
    let mut config = test_config();
    config.retry.max_retries = 0;
    config
}

/// Test configuration limiting `backend` to `quota` requests per minute
pub fn rate_limited_config(backend: Backend, quota: u32) -> DispatcherConfig {
    let mut config = test_config();
    config.rate_limit.window = Duration::from_secs(60);
    config.rate_limit.quotas.insert(backend, quota);
    config
}

/// Short retry delays for tests against real HTTP servers
pub fn fast_retry_config() -> DispatcherConfig {
    let mut config = test_config();
    config.retry.base_delay = Duration::from_millis(10);
    config.retry.max_delay = Duration::from_millis(50);
    config.timeouts.request = Duration::from_secs(10);
    config
}
