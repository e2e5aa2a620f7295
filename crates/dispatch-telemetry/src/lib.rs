//! # Dispatch Telemetry
//!
//! Observability for the LLM dispatcher.
//!
//! This crate provides:
//! - Tracing subscriber setup with optional OpenTelemetry export
//! - Dispatcher metrics with Prometheus text rendering
//! - Best-effort audit persistence of requests and their outcomes

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod metrics;
pub mod tracing_setup;

pub use audit::{
    AuditWriter, JsonlFileSink, MemorySink, NullSink, OutcomeRecord, OutcomeStatus,
    PersistenceSink, RequestRecord, SinkError,
};
pub use metrics::{BackendSnapshot, Metrics, MetricsSnapshot};
pub use tracing_setup::{init_tracing, shutdown_tracing, TracingConfig, TracingError};
