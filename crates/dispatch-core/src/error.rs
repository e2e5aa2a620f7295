//! Error types for the dispatcher.
//!
//! Every failure a caller can observe is a [`DispatchError`]. The type is
//! `Clone` so one outcome can be shared between a deduplicated leader and its
//! followers.

use crate::types::Backend;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for dispatcher operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Errors surfaced by the dispatcher.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    /// Request failed validation; nothing was sent anywhere.
    #[error("Validation error on '{field}': {message}")]
    Validation {
        /// Offending field
        field: String,
        /// Human readable reason
        message: String,
    },

    /// Circuit breaker for the backend is open.
    #[error("Circuit breaker open for {backend}, retry after {retry_after:?}")]
    CircuitOpen {
        /// Backend whose breaker rejected the request
        backend: Backend,
        /// Remaining cool-down
        retry_after: Duration,
    },

    /// The rate limit queue for the backend is at capacity.
    #[error("Request queue full for {backend} (capacity {capacity})")]
    QueueFull {
        /// Backend the request was queued for
        backend: Backend,
        /// Configured queue capacity
        capacity: usize,
    },

    /// The backend returned an error.
    #[error("{backend} error: {message}")]
    Backend {
        /// Backend that failed
        backend: Backend,
        /// Error message
        message: String,
        /// HTTP status, when the failure came from a response
        status: Option<u16>,
        /// Whether the adapter marked the failure as transient
        retryable: bool,
    },

    /// The request exceeded the wall-clock timeout.
    #[error("Request to {backend} timed out after {elapsed:?}")]
    Timeout {
        /// Backend that did not answer in time
        backend: Backend,
        /// Time spent before giving up
        elapsed: Duration,
    },

    /// The request was cancelled by the caller or the dispatcher.
    #[error("Request cancelled: {reason}")]
    Cancelled {
        /// Why the request was cancelled
        reason: String,
    },

    /// No adapter is registered for the backend.
    #[error("No adapter registered for backend {backend}")]
    BackendUnavailable {
        /// Requested backend
        backend: Backend,
    },

    /// Invalid configuration.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Error message
        message: String,
    },

    /// The dispatcher is shutting down.
    #[error("Dispatcher is shutting down")]
    DispatcherShutdown,

    /// Internal error.
    #[error("Internal error: {message}")]
    Internal {
        /// Error message
        message: String,
    },
}

impl DispatchError {
    /// Create a validation error
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a backend error
    pub fn backend(
        backend: Backend,
        message: impl Into<String>,
        status: Option<u16>,
        retryable: bool,
    ) -> Self {
        Self::Backend {
            backend,
            message: message.into(),
            status,
            retryable,
        }
    }

    /// Create a cancellation error
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Classification of the error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::QueueFull { .. } => ErrorKind::QueueFull,
            Self::Backend { .. } => ErrorKind::Backend,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::DispatcherShutdown => ErrorKind::Shutdown,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Whether the adapter marked this failure as transient.
    ///
    /// The retry policy widens this with status codes and message patterns.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend { retryable: true, .. })
    }

    /// Whether the error is a cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Whether the outcome should count against the backend's circuit breaker.
    #[must_use]
    pub const fn counts_as_backend_failure(&self) -> bool {
        matches!(self, Self::Backend { .. } | Self::Timeout { .. })
    }

    /// HTTP status attached to a backend error.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Backend { status, .. } => *status,
            _ => None,
        }
    }

    /// Backend the error is attributed to, if any.
    #[must_use]
    pub const fn backend_of(&self) -> Option<Backend> {
        match self {
            Self::CircuitOpen { backend, .. }
            | Self::QueueFull { backend, .. }
            | Self::Backend { backend, .. }
            | Self::Timeout { backend, .. }
            | Self::BackendUnavailable { backend } => Some(*backend),
            _ => None,
        }
    }
}

/// Coarse classification used by metrics, events and audit records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Request failed validation
    Validation,
    /// Circuit breaker rejected the request
    CircuitOpen,
    /// Queue was full
    QueueFull,
    /// Backend error
    Backend,
    /// Wall-clock timeout
    Timeout,
    /// Cancelled
    Cancelled,
    /// No adapter registered
    BackendUnavailable,
    /// Bad configuration
    Configuration,
    /// Dispatcher shutdown
    Shutdown,
    /// Internal error
    Internal,
}

impl ErrorKind {
    /// Stable snake_case name
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::CircuitOpen => "circuit_open",
            Self::QueueFull => "queue_full",
            Self::Backend => "backend",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::BackendUnavailable => "backend_unavailable",
            Self::Configuration => "configuration",
            Self::Shutdown => "shutdown",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
