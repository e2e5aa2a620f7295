//! # Dispatch Resilience
//!
//! Resilience patterns for the LLM dispatcher:
//! - Circuit breaker per backend, with a single half-open trial
//! - Retry policy with exponential backoff and cancellable sleeps
//! - Fixed-window rate limiting per backend
//!
//! All timing uses `tokio::time::Instant` so behavior can be driven by a
//! paused test clock.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;

// Re-export main types
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerStats,
    CircuitState,
};
pub use rate_limiter::{RateLimitConfig, RateLimitStatus, RateLimiter};
pub use retry::{RetryAttempt, RetryConfig, RetryPolicy, RetryPolicyBuilder, RetryResult};
