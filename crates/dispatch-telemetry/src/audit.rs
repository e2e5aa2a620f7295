//! Request/response audit persistence.
//!
//! Every terminal outcome is handed to a [`PersistenceSink`] through an
//! [`AuditWriter`], which never blocks the request path and never
//! propagates sink failures.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dispatch_core::{Backend, ChatMessage, ErrorKind, StreamId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Audit sink error
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// File system failure
    #[error("Audit I/O error on {path}: {source}")]
    Io {
        /// File being written
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
    /// Record could not be encoded
    #[error("Audit serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Sink cannot accept records
    #[error("Audit sink unavailable: {0}")]
    Unavailable(String),
}

/// What was asked
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    /// Stream identifier
    pub stream_id: StreamId,
    /// Request fingerprint
    pub fingerprint: String,
    /// Resolved backend
    pub backend: Backend,
    /// Resolved model
    pub model: String,
    /// Sanitized conversation
    pub messages: Vec<ChatMessage>,
    /// Sampling temperature
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Maximum tokens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Queue priority
    pub priority: i32,
    /// When the dispatcher accepted the request
    pub received_at: DateTime<Utc>,
}

/// Terminal state of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// Completed with text
    Success,
    /// Failed with an error
    Failure,
    /// Aborted by the caller or the dispatcher
    Cancelled,
}

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    /// Terminal state
    pub status: OutcomeStatus,
    /// Where the text came from: `backend`, `cache` or `deduplicated`
    pub source: String,
    /// Response text, possibly partial for cancelled streams
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    /// Error message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Error classification
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Backend attempts made
    pub attempts: u32,
    /// Wall time from acceptance to terminal state
    pub latency_ms: u64,
    /// When the request finished
    pub completed_at: DateTime<Utc>,
}

impl OutcomeRecord {
    /// A successful outcome
    #[must_use]
    pub fn success(source: impl Into<String>, response: String, attempts: u32, latency_ms: u64) -> Self {
        Self {
            status: OutcomeStatus::Success,
            source: source.into(),
            response: Some(response),
            error: None,
            error_kind: None,
            attempts,
            latency_ms,
            completed_at: Utc::now(),
        }
    }

    /// A failed or cancelled outcome, depending on the error kind
    #[must_use]
    pub fn failure(
        source: impl Into<String>,
        error: &dispatch_core::DispatchError,
        partial: Option<String>,
        attempts: u32,
        latency_ms: u64,
    ) -> Self {
        let kind = error.kind();
        Self {
            status: if kind == ErrorKind::Cancelled {
                OutcomeStatus::Cancelled
            } else {
                OutcomeStatus::Failure
            },
            source: source.into(),
            response: partial.filter(|p| !p.is_empty()),
            error: Some(error.to_string()),
            error_kind: Some(kind),
            attempts,
            latency_ms,
            completed_at: Utc::now(),
        }
    }
}

/// Durable audit log
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    /// Store one request and its outcome
    async fn append(&self, request: &RequestRecord, outcome: &OutcomeRecord) -> Result<(), SinkError>;

    /// Sink name for logs
    fn name(&self) -> &'static str;
}

#[derive(Serialize)]
struct AuditLine<'a> {
    request: &'a RequestRecord,
    outcome: &'a OutcomeRecord,
}

/// Appends one JSON object per line to a file
#[derive(Debug)]
pub struct JsonlFileSink {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlFileSink {
    /// Create a sink writing to `path`. The file is created on first append.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Target file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> SinkError {
        SinkError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl PersistenceSink for JsonlFileSink {
    async fn append(&self, request: &RequestRecord, outcome: &OutcomeRecord) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(&AuditLine { request, outcome })?;
        line.push(b'\n');

        // Lines from concurrent appends must not interleave
        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.io_error(e))?;
        file.write_all(&line).await.map_err(|e| self.io_error(e))?;
        file.flush().await.map_err(|e| self.io_error(e))?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "jsonl"
    }
}

/// Keeps the most recent records in memory
#[derive(Debug)]
pub struct MemorySink {
    capacity: usize,
    records: Mutex<VecDeque<(RequestRecord, OutcomeRecord)>>,
}

impl MemorySink {
    /// Create a sink keeping at most `capacity` records
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: Mutex::new(VecDeque::new()),
        }
    }

    /// Stored records, oldest first
    #[must_use]
    pub fn records(&self) -> Vec<(RequestRecord, OutcomeRecord)> {
        self.records.lock().iter().cloned().collect()
    }

    /// Number of stored records
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether nothing has been stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PersistenceSink for MemorySink {
    async fn append(&self, request: &RequestRecord, outcome: &OutcomeRecord) -> Result<(), SinkError> {
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back((request.clone(), outcome.clone()));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl PersistenceSink for NullSink {
    async fn append(&self, _request: &RequestRecord, _outcome: &OutcomeRecord) -> Result<(), SinkError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "null"
    }
}

/// Fire-and-forget front for a sink
#[derive(Clone)]
pub struct AuditWriter {
    sink: Arc<dyn PersistenceSink>,
}

impl AuditWriter {
    /// Wrap a sink
    #[must_use]
    pub fn new(sink: Arc<dyn PersistenceSink>) -> Self {
        Self { sink }
    }

    /// Writer that drops every record
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(Arc::new(NullSink))
    }

    /// Underlying sink
    #[must_use]
    pub fn sink(&self) -> &Arc<dyn PersistenceSink> {
        &self.sink
    }

    /// Persist a record in the background. Failures are logged.
    pub fn submit(&self, request: RequestRecord, outcome: OutcomeRecord) -> tokio::task::JoinHandle<()> {
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            match sink.append(&request, &outcome).await {
                Ok(()) => debug!(
                    sink = sink.name(),
                    stream_id = %request.stream_id,
                    "Audit record persisted"
                ),
                Err(e) => warn!(
                    sink = sink.name(),
                    stream_id = %request.stream_id,
                    error = %e,
                    "Failed to persist audit record"
                ),
            }
        })
    }
}

impl std::fmt::Debug for AuditWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditWriter")
            .field("sink", &self.sink.name())
            .finish()
    }
}
