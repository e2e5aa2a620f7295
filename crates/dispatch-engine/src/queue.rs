//! Bounded priority queue for rate limited requests.
//!
//! Higher priority is served first; equal priorities are served in arrival
//! order. A waiting caller holds the receiving half of a oneshot that the
//! scheduler resolves when the request may run.

use dispatch_core::{Backend, DispatchError, DispatchResult, StreamId};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

/// Receiver resolved when a queued request is released
pub type Grant = oneshot::Receiver<DispatchResult<()>>;

/// A request waiting for capacity
#[derive(Debug)]
pub struct QueuedRequest {
    /// Stream the request belongs to
    pub stream_id: StreamId,
    /// Target backend
    pub backend: Backend,
    /// Priority, higher first
    pub priority: i32,
    /// When the request entered the queue
    pub enqueued_at: Instant,
    sequence: u64,
    grant: oneshot::Sender<DispatchResult<()>>,
}

impl QueuedRequest {
    /// Whether the waiting caller has gone away
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.grant.is_closed()
    }

    /// Time spent waiting
    #[must_use]
    pub fn waited(&self) -> std::time::Duration {
        self.enqueued_at.elapsed()
    }

    /// Release the caller. Returns false if it already left.
    pub fn grant(self) -> bool {
        self.grant.send(Ok(())).is_ok()
    }

    /// Fail the caller
    pub fn reject(self, error: DispatchError) {
        let _ = self.grant.send(Err(error));
    }
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedRequest {}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedRequest {
    // BinaryHeap is a max-heap: the greatest element is popped first
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Bounded priority queue
#[derive(Debug)]
pub struct RequestQueue {
    heap: Mutex<BinaryHeap<QueuedRequest>>,
    capacity: usize,
    sequence: AtomicU64,
}

impl RequestQueue {
    /// Create a queue holding at most `capacity` requests
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            capacity,
            sequence: AtomicU64::new(0),
        }
    }

    /// Enqueue a request.
    ///
    /// # Errors
    /// Returns `DispatchError::QueueFull` when the queue is at capacity
    pub fn push(&self, stream_id: StreamId, backend: Backend, priority: i32) -> DispatchResult<Grant> {
        let mut heap = self.heap.lock();
        if heap.len() >= self.capacity {
            return Err(DispatchError::QueueFull {
                backend,
                capacity: self.capacity,
            });
        }
        let (tx, rx) = oneshot::channel();
        heap.push(QueuedRequest {
            stream_id,
            backend,
            priority,
            enqueued_at: Instant::now(),
            sequence: self.sequence.fetch_add(1, AtomicOrdering::Relaxed),
            grant: tx,
        });
        debug!(stream_id = %stream_id, backend = %backend, priority, depth = heap.len(), "Request queued");
        Ok(rx)
    }

    /// Remove the highest priority request
    pub fn pop(&self) -> Option<QueuedRequest> {
        self.heap.lock().pop()
    }

    /// Put requests back, keeping their original order
    pub fn reinsert(&self, items: impl IntoIterator<Item = QueuedRequest>) {
        self.heap.lock().extend(items);
    }

    /// Remove every queued request
    pub fn drain_all(&self) -> Vec<QueuedRequest> {
        self.heap.lock().drain().collect()
    }

    /// Number of queued requests
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    /// Number of requests waiting for `backend`
    #[must_use]
    pub fn pending_for(&self, backend: Backend) -> usize {
        self.heap.lock().iter().filter(|q| q.backend == backend).count()
    }

    /// Whether the queue is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }

    /// Maximum number of queued requests
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
