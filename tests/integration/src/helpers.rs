//! Test helper utilities for integration tests

use crate::mock_providers::ScriptedProvider;
use dispatch_config::DispatcherConfig;
use dispatch_core::{DispatchEvent, EventKind, ProviderAdapter};
use dispatch_engine::Dispatcher;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Initialize tracing for tests (only once)
static TRACING: Lazy<()> = Lazy::new(|| {
    if std::env::var("TEST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
});

/// Initialize tracing for tests
pub fn init_tracing() {
    Lazy::force(&TRACING);
}

/// Build a dispatcher over the given scripted providers
pub fn dispatcher_with(config: DispatcherConfig, providers: &[Arc<ScriptedProvider>]) -> Dispatcher {
    init_tracing();
    let mut builder = Dispatcher::builder(config);
    for provider in providers {
        builder = builder.provider(Arc::clone(provider) as Arc<dyn ProviderAdapter>);
    }
    builder.build().expect("Failed to build dispatcher")
}

/// Poll `condition` until it holds.
///
/// Under paused time each poll advances the clock by a millisecond, so this
/// also lets timers fire. Panics after `limit` of clock time.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + limit;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {limit:?}"
        );
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

/// Records every event published by a dispatcher
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<DispatchEvent>>>,
}

impl EventLog {
    /// Start recording
    pub fn attach(dispatcher: &Dispatcher) -> Self {
        let log = Self::default();
        let events = Arc::clone(&log.events);
        dispatcher.on_any(move |event| events.lock().push(event.clone()));
        log
    }

    /// Everything recorded so far
    pub fn all(&self) -> Vec<DispatchEvent> {
        self.events.lock().clone()
    }

    /// Recorded events of one kind
    pub fn of_kind(&self, kind: EventKind) -> Vec<DispatchEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind() == kind)
            .cloned()
            .collect()
    }

    /// Number of recorded events of one kind
    pub fn count(&self, kind: EventKind) -> usize {
        self.of_kind(kind).len()
    }
}
