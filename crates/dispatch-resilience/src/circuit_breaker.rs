//! Circuit breaker pattern implementation.
//!
//! The circuit breaker stops sending requests to a backend after repeated
//! failures and gives it time to recover. After the cool-down exactly one
//! trial request is let through; its outcome decides whether the circuit
//! closes again.

use dashmap::DashMap;
use dispatch_core::{Backend, DispatchError, DispatchResult};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally
    Closed,
    /// Circuit is open, requests are rejected
    Open,
    /// The single trial request is in flight
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Time to wait before admitting a trial request
    pub cool_down: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Circuit breaker for a single backend
#[derive(Debug)]
pub struct CircuitBreaker {
    backend: Backend,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    #[must_use]
    pub fn new(backend: Backend, config: CircuitBreakerConfig) -> Self {
        Self {
            backend,
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults(backend: Backend) -> Self {
        Self::new(backend, CircuitBreakerConfig::default())
    }

    /// Backend guarded by this breaker
    #[must_use]
    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Get the current state
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Check if the circuit allows a request.
    ///
    /// The first check after the cool-down moves the breaker to half-open and
    /// is admitted as the trial. Checks while the trial is in flight are
    /// rejected.
    ///
    /// # Errors
    /// Returns `DispatchError::CircuitOpen` if the request must not proceed
    pub fn check(&self) -> DispatchResult<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => Err(self.open_error(Duration::ZERO)),
            CircuitState::Open => {
                let remaining = self.remaining_cool_down(&inner);
                if remaining.is_zero() {
                    inner.state = CircuitState::HalfOpen;
                    info!(backend = %self.backend, "Circuit breaker half-open, admitting trial");
                    Ok(())
                } else {
                    Err(self.open_error(remaining))
                }
            }
        }
    }

    /// Whether a request would currently be rejected. Never claims the trial.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => false,
            CircuitState::HalfOpen => true,
            CircuitState::Open => !self.remaining_cool_down(&inner).is_zero(),
        }
    }

    /// Record a successful request.
    ///
    /// Returns the new state when the call changed it.
    pub fn record_success(&self) -> Option<CircuitState> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_sub(1);
                None
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                info!(backend = %self.backend, "Circuit breaker closed after successful trial");
                Some(CircuitState::Closed)
            }
            // A request admitted before the circuit opened; the open period stands
            CircuitState::Open => None,
        }
    }

    /// Record a failed request.
    ///
    /// Returns the new state when the call changed it.
    pub fn record_failure(&self) -> Option<CircuitState> {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(
                        backend = %self.backend,
                        failures = inner.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker opened"
                    );
                    Some(CircuitState::Open)
                } else {
                    debug!(
                        backend = %self.backend,
                        failures = inner.consecutive_failures,
                        "Circuit breaker recorded failure"
                    );
                    None
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                warn!(backend = %self.backend, "Circuit breaker trial failed, reopening");
                Some(CircuitState::Open)
            }
            CircuitState::Open => None,
        }
    }

    /// Record a request that ended without saying anything about backend
    /// health, such as a cancellation.
    ///
    /// A cancelled trial puts the breaker back to open without restarting
    /// the cool-down, so the next check may try again immediately.
    pub fn record_cancelled(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Open;
            debug!(backend = %self.backend, "Circuit breaker trial cancelled");
        }
    }

    /// Reset the circuit breaker to closed state
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        info!(backend = %self.backend, "Circuit breaker reset");
    }

    /// Force the circuit open (for testing or manual intervention)
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.consecutive_failures = inner
            .consecutive_failures
            .max(self.config.failure_threshold);
        warn!(backend = %self.backend, "Circuit breaker forced open");
    }

    /// Get current statistics
    #[must_use]
    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            backend: self.backend,
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            retry_after: match inner.state {
                CircuitState::Open => Some(self.remaining_cool_down(&inner)),
                _ => None,
            },
        }
    }

    fn remaining_cool_down(&self, inner: &BreakerInner) -> Duration {
        inner.opened_at.map_or(Duration::ZERO, |opened| {
            self.config.cool_down.saturating_sub(opened.elapsed())
        })
    }

    fn open_error(&self, retry_after: Duration) -> DispatchError {
        DispatchError::CircuitOpen {
            backend: self.backend,
            retry_after,
        }
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    /// Backend
    pub backend: Backend,
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures
    pub consecutive_failures: u32,
    /// Remaining cool-down while open
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<Duration>,
}

/// One breaker per backend, created on first use
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<Backend, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    /// Create a registry sharing one configuration
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Breaker for a backend
    #[must_use]
    pub fn get(&self, backend: Backend) -> Arc<CircuitBreaker> {
        Arc::clone(
            self.breakers
                .entry(backend)
                .or_insert_with(|| Arc::new(CircuitBreaker::new(backend, self.config.clone())))
                .value(),
        )
    }

    /// Statistics for every breaker created so far
    #[must_use]
    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<_> = self.breakers.iter().map(|b| b.stats()).collect();
        stats.sort_by_key(|s| s.backend);
        stats
    }

    /// Reset every breaker
    pub fn reset_all(&self) {
        for breaker in self.breakers.iter() {
            breaker.reset();
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
