//! Integration tests for the LLM dispatcher
//!
//! This crate drives a full [`dispatch_engine::Dispatcher`] through:
//! - Streaming and completion flows
//! - Response caching and request deduplication
//! - Circuit breaking, retries and timeouts
//! - Rate limiting and the priority queue
//! - Cancellation and shutdown
//! - HTTP adapters against mock servers
//! - Audit persistence

pub mod fixtures;
pub mod helpers;
pub mod mock_providers;

// Re-export commonly used items
pub use fixtures::*;
pub use helpers::*;
pub use mock_providers::*;

#[cfg(test)]
mod cache_tests;
#[cfg(test)]
mod cancellation_tests;
#[cfg(test)]
mod e2e_tests;
#[cfg(test)]
mod provider_tests;
#[cfg(test)]
mod resilience_tests;
