//! # Dispatch Engine
//!
//! The request pipeline of the LLM dispatcher.
//!
//! [`Dispatcher`] ties the other crates together:
//! - Validation and sanitization of incoming requests
//! - Backend and model resolution
//! - Response caching and in-flight deduplication
//! - Circuit breaking, rate limiting and the priority queue
//! - Retrying execution with streamed output and cancellation
//!
//! ```no_run
//! use dispatch_config::DispatcherConfig;
//! use dispatch_core::CompletionRequest;
//! use dispatch_engine::Dispatcher;
//!
//! # async fn run() -> dispatch_core::DispatchResult<()> {
//! let dispatcher = Dispatcher::from_config(DispatcherConfig::default())?;
//! let completion = dispatcher
//!     .complete(CompletionRequest::builder().user("Hello").build())
//!     .await?;
//! println!("{}", completion.text);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod dispatcher;
mod executor;
pub mod queue;
pub mod scheduler;
pub mod selection;
pub mod stream;
pub mod stream_registry;
pub mod validator;

pub use dispatcher::{Dispatcher, DispatcherBuilder};
pub use queue::{QueuedRequest, RequestQueue};
pub use scheduler::{DrainReport, Scheduler};
pub use selection::{ModelSelection, ModelSelector, Target};
pub use stream::{Completion, CompletionSource, CompletionStream};
pub use stream_registry::{ActiveStream, StreamGuard, StreamRegistry};
pub use validator::{sanitize, RequestValidator, ValidatedRequest};
