//! Queue draining.
//!
//! On every tick the scheduler releases queued requests whose backend has
//! rate limit capacity and a breaker that admits traffic. Releasing a
//! request consumes its rate limit slot, so the caller runs without
//! acquiring again.

use crate::queue::{QueuedRequest, RequestQueue};
use dispatch_cache::ResponseCache;
use dispatch_config::DrainPolicy;
use dispatch_core::{Backend, CancellationToken, DispatchEvent, EventBus};
use dispatch_resilience::{CircuitBreakerRegistry, RateLimiter};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

/// Result of one drain pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Requests released
    pub granted: usize,
    /// Requests left waiting
    pub blocked: usize,
    /// Requests whose caller had already gone
    pub discarded: usize,
}

/// Releases queued requests as capacity frees up
#[derive(Debug)]
pub struct Scheduler {
    queue: Arc<RequestQueue>,
    limiter: Arc<RateLimiter>,
    breakers: Arc<CircuitBreakerRegistry>,
    events: Arc<EventBus>,
    policy: DrainPolicy,
    draining: Mutex<()>,
}

impl Scheduler {
    /// Create a scheduler over shared components
    #[must_use]
    pub fn new(
        queue: Arc<RequestQueue>,
        limiter: Arc<RateLimiter>,
        breakers: Arc<CircuitBreakerRegistry>,
        events: Arc<EventBus>,
        policy: DrainPolicy,
    ) -> Self {
        Self {
            queue,
            limiter,
            breakers,
            events,
            policy,
            draining: Mutex::new(()),
        }
    }

    /// Run one drain pass.
    ///
    /// Concurrent calls do not overlap; a call made while another pass is
    /// running returns an empty report.
    pub fn drain_once(&self) -> DrainReport {
        let Some(_pass) = self.draining.try_lock() else {
            return DrainReport::default();
        };

        let mut report = DrainReport::default();
        let mut blocked_backends: HashSet<Backend> = HashSet::new();
        let mut set_aside: Vec<QueuedRequest> = Vec::new();

        while let Some(item) = self.queue.pop() {
            if item.is_abandoned() {
                trace!(stream_id = %item.stream_id, "Dropping abandoned queue entry");
                report.discarded += 1;
                continue;
            }

            let backend = item.backend;
            let blocked = blocked_backends.contains(&backend)
                || self.breakers.get(backend).is_blocked()
                || !self.limiter.try_acquire(backend);
            if blocked {
                blocked_backends.insert(backend);
                set_aside.push(item);
                match self.policy {
                    DrainPolicy::StrictPriority => break,
                    DrainPolicy::SkipBlocked => continue,
                }
            }

            let stream_id = item.stream_id;
            let waited = item.waited();
            if item.grant() {
                self.events.publish(DispatchEvent::RequestDequeued {
                    stream_id,
                    backend,
                    waited,
                });
                report.granted += 1;
            } else {
                // Left between the abandonment check and the grant
                report.discarded += 1;
            }
        }

        report.blocked = set_aside.len();
        self.queue.reinsert(set_aside);

        if report.granted > 0 || report.discarded > 0 {
            debug!(
                granted = report.granted,
                blocked = report.blocked,
                discarded = report.discarded,
                remaining = self.queue.len(),
                "Drained request queue"
            );
        }
        report
    }

    /// Run the scheduler until `shutdown` fires.
    ///
    /// Also sweeps expired cache entries every `purge_interval`.
    pub fn spawn(
        self: Arc<Self>,
        tick: Duration,
        cache: Arc<ResponseCache>,
        purge_interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut purge = tokio::time::interval(purge_interval);
            purge.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        debug!("Scheduler stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if !self.queue.is_empty() {
                            self.drain_once();
                        }
                    }
                    _ = purge.tick() => {
                        let purged = cache.purge_expired();
                        if purged > 0 {
                            debug!(purged, "Purged expired cache entries");
                        }
                    }
                }
            }
        })
    }
}
