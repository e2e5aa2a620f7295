//! Typed dispatcher lifecycle events.
//!
//! Events are published on a tokio broadcast channel for async subscribers
//! and, synchronously, to handlers registered with [`EventBus::on`].

use crate::error::ErrorKind;
use crate::types::{Backend, Fingerprint, StreamId};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Something that happened inside the dispatcher
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    /// Request passed validation and entered the pipeline
    RequestStarted {
        /// Stream identifier
        stream_id: StreamId,
        /// Request fingerprint
        fingerprint: Fingerprint,
        /// Resolved backend
        backend: Backend,
        /// Resolved model
        model: String,
    },
    /// Served from the response cache
    CacheHit {
        /// Stream identifier
        stream_id: StreamId,
        /// Request fingerprint
        fingerprint: Fingerprint,
    },
    /// Joined an identical in-flight execution
    DedupJoined {
        /// Stream identifier
        stream_id: StreamId,
        /// Request fingerprint
        fingerprint: Fingerprint,
    },
    /// Put in the rate limit queue
    RequestQueued {
        /// Stream identifier
        stream_id: StreamId,
        /// Backend being waited on
        backend: Backend,
        /// Queue priority
        priority: i32,
        /// Queue length after insertion
        depth: usize,
    },
    /// Released from the rate limit queue
    RequestDequeued {
        /// Stream identifier
        stream_id: StreamId,
        /// Backend
        backend: Backend,
        /// Time spent queued
        waited: Duration,
    },
    /// A failed attempt will be retried
    RetryScheduled {
        /// Stream identifier
        stream_id: StreamId,
        /// Backend
        backend: Backend,
        /// Zero-based attempt that failed
        attempt: u32,
        /// Backoff before the next attempt
        delay: Duration,
    },
    /// Request finished successfully
    RequestCompleted {
        /// Stream identifier
        stream_id: StreamId,
        /// Backend
        backend: Backend,
        /// End-to-end latency
        latency: Duration,
        /// Characters produced
        chars: usize,
    },
    /// Request finished with an error
    RequestFailed {
        /// Stream identifier
        stream_id: StreamId,
        /// Backend, when known
        backend: Option<Backend>,
        /// Error classification
        kind: ErrorKind,
        /// Error message
        message: String,
    },
    /// A stream was aborted through the registry
    StreamAborted {
        /// Stream identifier
        stream_id: StreamId,
    },
    /// A backend's circuit breaker opened
    CircuitOpened {
        /// Backend
        backend: Backend,
        /// Consecutive failures observed
        failures: u32,
    },
    /// A backend's circuit breaker closed after a successful trial
    CircuitClosed {
        /// Backend
        backend: Backend,
    },
    /// A backend's model list was refreshed
    ModelsRefreshed {
        /// Backend
        backend: Backend,
        /// Number of models reported
        count: usize,
    },
}

/// Discriminant of [`DispatchEvent`] used to filter handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// [`DispatchEvent::RequestStarted`]
    RequestStarted,
    /// [`DispatchEvent::CacheHit`]
    CacheHit,
    /// [`DispatchEvent::DedupJoined`]
    DedupJoined,
    /// [`DispatchEvent::RequestQueued`]
    RequestQueued,
    /// [`DispatchEvent::RequestDequeued`]
    RequestDequeued,
    /// [`DispatchEvent::RetryScheduled`]
    RetryScheduled,
    /// [`DispatchEvent::RequestCompleted`]
    RequestCompleted,
    /// [`DispatchEvent::RequestFailed`]
    RequestFailed,
    /// [`DispatchEvent::StreamAborted`]
    StreamAborted,
    /// [`DispatchEvent::CircuitOpened`]
    CircuitOpened,
    /// [`DispatchEvent::CircuitClosed`]
    CircuitClosed,
    /// [`DispatchEvent::ModelsRefreshed`]
    ModelsRefreshed,
}

impl DispatchEvent {
    /// Kind of this event
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::RequestStarted { .. } => EventKind::RequestStarted,
            Self::CacheHit { .. } => EventKind::CacheHit,
            Self::DedupJoined { .. } => EventKind::DedupJoined,
            Self::RequestQueued { .. } => EventKind::RequestQueued,
            Self::RequestDequeued { .. } => EventKind::RequestDequeued,
            Self::RetryScheduled { .. } => EventKind::RetryScheduled,
            Self::RequestCompleted { .. } => EventKind::RequestCompleted,
            Self::RequestFailed { .. } => EventKind::RequestFailed,
            Self::StreamAborted { .. } => EventKind::StreamAborted,
            Self::CircuitOpened { .. } => EventKind::CircuitOpened,
            Self::CircuitClosed { .. } => EventKind::CircuitClosed,
            Self::ModelsRefreshed { .. } => EventKind::ModelsRefreshed,
        }
    }
}

/// Synchronous event callback
pub type EventHandler = Arc<dyn Fn(&DispatchEvent) + Send + Sync>;

/// Handle returned by [`EventBus::on`], used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Registration {
    id: HandlerId,
    kind: Option<EventKind>,
    handler: EventHandler,
}

/// Publish/subscribe channel for [`DispatchEvent`]s
pub struct EventBus {
    sender: broadcast::Sender<DispatchEvent>,
    handlers: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Default broadcast buffer
    pub const DEFAULT_CAPACITY: usize = 256;

    /// Create a bus whose broadcast channel buffers `capacity` events
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            handlers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Publish an event to subscribers and matching handlers
    pub fn publish(&self, event: DispatchEvent) {
        let kind = event.kind();
        let matching: Vec<EventHandler> = self
            .handlers
            .read()
            .iter()
            .filter(|r| r.kind.map_or(true, |k| k == kind))
            .map(|r| Arc::clone(&r.handler))
            .collect();
        for handler in matching {
            handler(&event);
        }
        // No receivers is fine
        let _ = self.sender.send(event);
    }

    /// Subscribe to every event. Slow receivers observe `Lagged`.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.sender.subscribe()
    }

    /// Register a handler for one kind of event
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&DispatchEvent) + Send + Sync + 'static,
    {
        self.register(Some(kind), Arc::new(handler))
    }

    /// Register a handler for all events
    pub fn on_any<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&DispatchEvent) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(handler))
    }

    /// Remove a handler. Returns false if it was not registered.
    pub fn off(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|r| r.id != id);
        handlers.len() != before
    }

    /// Number of registered handlers
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    fn register(&self, kind: Option<EventKind>, handler: EventHandler) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push(Registration { id, kind, handler });
        id
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .field("handlers", &self.handler_count())
            .finish()
    }
}
