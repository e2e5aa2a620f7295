//! Fixed-window rate limiting per backend.

use dispatch_core::Backend;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Rate limiter configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Window length
    pub window: Duration,
    /// Quota for backends without an explicit entry
    pub default_quota: u32,
    /// Per-backend quotas
    pub quotas: HashMap<Backend, u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            default_quota: 60,
            quotas: HashMap::from([(Backend::Ollama, 1000)]),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RateLimitWindow {
    count: u32,
    window_start: Instant,
}

impl RateLimitWindow {
    fn roll(&mut self, now: Instant, window: Duration) {
        if now.duration_since(self.window_start) >= window {
            self.count = 0;
            self.window_start = now;
        }
    }
}

/// Snapshot of one backend's window
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStatus {
    /// Backend
    pub backend: Backend,
    /// Requests admitted in the current window
    pub count: u32,
    /// Requests allowed per window
    pub quota: u32,
    /// Time until the window resets
    pub resets_in: Duration,
}

/// Fixed-window request counter for every backend
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<Backend, RateLimitWindow>>,
}

impl RateLimiter {
    /// Create a rate limiter
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Quota for a backend
    #[must_use]
    pub fn quota(&self, backend: Backend) -> u32 {
        self.config
            .quotas
            .get(&backend)
            .copied()
            .unwrap_or(self.config.default_quota)
    }

    /// Count a request if the backend is under quota.
    pub fn try_acquire(&self, backend: Backend) -> bool {
        let now = Instant::now();
        let quota = self.quota(backend);
        let mut windows = self.windows.lock();
        let window = windows.entry(backend).or_insert(RateLimitWindow {
            count: 0,
            window_start: now,
        });
        window.roll(now, self.config.window);

        if window.count < quota {
            window.count += 1;
            trace!(backend = %backend, count = window.count, quota, "Rate limit slot acquired");
            true
        } else {
            false
        }
    }

    /// Whether `try_acquire` would succeed right now. Does not count.
    #[must_use]
    pub fn would_allow(&self, backend: Backend) -> bool {
        self.status(backend).count < self.quota(backend)
    }

    /// Current window state for a backend
    #[must_use]
    pub fn status(&self, backend: Backend) -> RateLimitStatus {
        let now = Instant::now();
        let quota = self.quota(backend);
        let windows = self.windows.lock();
        let (count, resets_in) = match windows.get(&backend) {
            Some(w) if now.duration_since(w.window_start) < self.config.window => (
                w.count,
                self.config.window - now.duration_since(w.window_start),
            ),
            _ => (0, Duration::ZERO),
        };
        RateLimitStatus {
            backend,
            count,
            quota,
            resets_in,
        }
    }

    /// Forget all windows
    pub fn reset(&self) {
        self.windows.lock().clear();
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
