//! In-flight request deduplication.
//!
//! When several callers submit the same fingerprint at the same time, only
//! the first one (the leader) reaches a backend. Everyone else becomes a
//! follower and awaits the leader's shared outcome.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use dispatch_core::{DispatchError, DispatchResult, Fingerprint};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Outcome of a leader's execution as seen by followers
pub type SharedOutcome = Shared<BoxFuture<'static, DispatchResult<String>>>;

struct PendingExecution {
    id: u64,
    outcome: SharedOutcome,
    started_at: Instant,
}

/// Result of admitting a fingerprint
pub enum Admission {
    /// First caller: execute and settle the guard
    Leader(LeaderGuard),
    /// An identical execution is in flight: await its outcome
    Follower(SharedOutcome),
    /// Deduplication is disabled
    Bypass,
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Leader(guard) => f.debug_tuple("Leader").field(guard).finish(),
            Self::Follower(_) => f.write_str("Follower"),
            Self::Bypass => f.write_str("Bypass"),
        }
    }
}

/// Deduplication statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DedupStats {
    /// Executions currently in flight
    pub in_flight: usize,
    /// Executions started by leaders
    pub leaders: u64,
    /// Callers that joined an execution
    pub followers: u64,
}

/// Tracks in-flight executions by fingerprint
pub struct Deduplicator {
    enabled: bool,
    pending: Arc<DashMap<Fingerprint, PendingExecution>>,
    next_id: AtomicU64,
    leaders: AtomicU64,
    followers: AtomicU64,
}

impl Deduplicator {
    /// Create a deduplicator
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            pending: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            leaders: AtomicU64::new(0),
            followers: AtomicU64::new(0),
        }
    }

    /// Register interest in a fingerprint.
    ///
    /// Lookup and registration happen under the same map entry lock, so two
    /// concurrent callers can never both become leader.
    pub fn admit(&self, fingerprint: &Fingerprint) -> Admission {
        if !self.enabled {
            return Admission::Bypass;
        }

        match self.pending.entry(fingerprint.clone()) {
            Entry::Occupied(existing) => {
                self.followers.fetch_add(1, Ordering::Relaxed);
                trace!(
                    fingerprint = %fingerprint.short(),
                    running_for_ms = existing.get().started_at.elapsed().as_millis() as u64,
                    "Joining in-flight execution"
                );
                Admission::Follower(existing.get().outcome.clone())
            }
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel::<DispatchResult<String>>();
                let outcome = rx
                    .map(|received| {
                        received.unwrap_or_else(|_| {
                            Err(DispatchError::cancelled(
                                "in-flight execution was abandoned",
                            ))
                        })
                    })
                    .boxed()
                    .shared();
                slot.insert(PendingExecution {
                    id,
                    outcome,
                    started_at: Instant::now(),
                });
                self.leaders.fetch_add(1, Ordering::Relaxed);
                Admission::Leader(LeaderGuard {
                    fingerprint: fingerprint.clone(),
                    id,
                    sender: Some(tx),
                    pending: Arc::clone(&self.pending),
                })
            }
        }
    }

    /// Whether an execution for the fingerprint is in flight
    #[must_use]
    pub fn is_pending(&self, fingerprint: &Fingerprint) -> bool {
        self.pending.contains_key(fingerprint)
    }

    /// Number of executions in flight
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> DedupStats {
        DedupStats {
            in_flight: self.in_flight(),
            leaders: self.leaders.load(Ordering::Relaxed),
            followers: self.followers.load(Ordering::Relaxed),
        }
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(true)
    }
}

impl std::fmt::Debug for Deduplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deduplicator")
            .field("enabled", &self.enabled)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Held by the leader of an execution.
///
/// The pending entry is removed exactly once: on [`LeaderGuard::settle`], or
/// when the guard is dropped, in which case followers observe a cancellation.
pub struct LeaderGuard {
    fingerprint: Fingerprint,
    id: u64,
    sender: Option<oneshot::Sender<DispatchResult<String>>>,
    pending: Arc<DashMap<Fingerprint, PendingExecution>>,
}

impl LeaderGuard {
    /// Fingerprint being executed
    #[must_use]
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Publish the outcome to followers and release the fingerprint.
    pub fn settle(mut self, outcome: DispatchResult<String>) {
        self.release();
        if let Some(tx) = self.sender.take() {
            // Nobody may be listening; that is fine
            let _ = tx.send(outcome);
        }
    }

    fn release(&self) {
        // Only remove our own entry
        let removed = self
            .pending
            .remove_if(&self.fingerprint, |_, p| p.id == self.id)
            .is_some();
        if removed {
            trace!(fingerprint = %self.fingerprint.short(), "Released in-flight execution");
        }
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        if self.sender.is_some() {
            debug!(
                fingerprint = %self.fingerprint.short(),
                "Leader dropped without settling"
            );
            self.release();
        }
    }
}

impl std::fmt::Debug for LeaderGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderGuard")
            .field("fingerprint", &self.fingerprint.short())
            .field("settled", &self.sender.is_none())
            .finish()
    }
}
