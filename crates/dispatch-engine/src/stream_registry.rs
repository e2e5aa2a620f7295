//! Active stream tracking for abort-by-id.

use dashmap::DashMap;
use dispatch_core::{Backend, CancellationToken, StreamId};
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
struct StreamHandle {
    token: CancellationToken,
    backend: Backend,
    started_at: Instant,
}

/// A stream that is still running
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveStream {
    /// Stream identifier
    pub id: StreamId,
    /// Target backend
    pub backend: Backend,
    /// Time since the stream started
    pub running_for_ms: u64,
}

/// Registry of cancellable streams
#[derive(Debug, Default)]
pub struct StreamRegistry {
    streams: Arc<DashMap<StreamId, StreamHandle>>,
}

impl StreamRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stream.
    ///
    /// The stream's token is a child of `parent`, so cancelling the caller's
    /// token cancels the stream. The entry is removed when the guard drops.
    pub fn register(
        &self,
        id: StreamId,
        backend: Backend,
        parent: Option<&CancellationToken>,
    ) -> StreamGuard {
        let token = parent.map_or_else(CancellationToken::new, CancellationToken::child_token);
        self.streams.insert(
            id,
            StreamHandle {
                token: token.clone(),
                backend,
                started_at: Instant::now(),
            },
        );
        StreamGuard {
            id,
            token,
            streams: Arc::clone(&self.streams),
        }
    }

    /// Cancel a stream. Returns false if it is not running.
    pub fn abort(&self, id: StreamId) -> bool {
        match self.streams.get(&id) {
            Some(handle) => {
                debug!(stream_id = %id, "Aborting stream");
                handle.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every running stream, returning how many were signalled
    pub fn abort_all(&self) -> usize {
        let mut count = 0;
        for entry in self.streams.iter() {
            entry.token.cancel();
            count += 1;
        }
        count
    }

    /// Whether a stream is running
    #[must_use]
    pub fn contains(&self, id: StreamId) -> bool {
        self.streams.contains_key(&id)
    }

    /// Running streams
    #[must_use]
    pub fn active(&self) -> Vec<ActiveStream> {
        self.streams
            .iter()
            .map(|entry| ActiveStream {
                id: *entry.key(),
                backend: entry.backend,
                running_for_ms: entry.started_at.elapsed().as_millis() as u64,
            })
            .collect()
    }

    /// Number of running streams
    #[must_use]
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Whether no stream is running
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

/// Keeps a stream registered while alive
#[derive(Debug)]
pub struct StreamGuard {
    id: StreamId,
    token: CancellationToken,
    streams: Arc<DashMap<StreamId, StreamHandle>>,
}

impl StreamGuard {
    /// Stream identifier
    #[must_use]
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Token cancelled on abort
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.streams.remove(&self.id);
    }
}
