//! Dispatcher metrics.
//!
//! Counters only ever grow until [`Metrics::reset`]. Per-backend breakdowns
//! are created lazily on first use.

use dashmap::DashMap;
use dispatch_core::Backend;
use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    cancellations: AtomicU64,
    cache_hits: AtomicU64,
    dedup_hits: AtomicU64,
    queued: AtomicU64,
    circuit_rejections: AtomicU64,
    retries: AtomicU64,
    timeouts: AtomicU64,
    latency_total_ms: AtomicU64,
    latency_samples: AtomicU64,
}

impl Counters {
    fn all(&self) -> [&AtomicU64; 12] {
        [
            &self.requests,
            &self.successes,
            &self.failures,
            &self.cancellations,
            &self.cache_hits,
            &self.dedup_hits,
            &self.queued,
            &self.circuit_rejections,
            &self.retries,
            &self.timeouts,
            &self.latency_total_ms,
            &self.latency_samples,
        ]
    }

    fn average_latency_ms(&self) -> f64 {
        let samples = self.latency_samples.load(Ordering::Relaxed);
        if samples == 0 {
            0.0
        } else {
            self.latency_total_ms.load(Ordering::Relaxed) as f64 / samples as f64
        }
    }
}

/// Per-backend counters at a point in time
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackendSnapshot {
    /// Requests resolved to this backend
    pub requests: u64,
    /// Successful completions
    pub successes: u64,
    /// Terminal failures
    pub failures: u64,
    /// Cancelled requests
    pub cancellations: u64,
    /// Requests answered from the cache
    pub cache_hits: u64,
    /// Requests that joined an in-flight execution
    pub dedup_hits: u64,
    /// Requests that waited in the queue
    pub queued: u64,
    /// Requests rejected by an open circuit
    pub circuit_rejections: u64,
    /// Retry attempts
    pub retries: u64,
    /// Executions cut off by the request timeout
    pub timeouts: u64,
    /// Mean latency of backend-served successes
    pub average_latency_ms: f64,
}

/// Dispatcher-wide counters at a point in time
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Requests that passed validation
    pub requests: u64,
    /// Successful completions from any source
    pub successes: u64,
    /// Terminal failures
    pub failures: u64,
    /// Cancelled requests
    pub cancellations: u64,
    /// Cache hits
    pub cache_hits: u64,
    /// Cache misses
    pub cache_misses: u64,
    /// Requests that joined an in-flight execution
    pub dedup_hits: u64,
    /// Requests that waited in the queue
    pub queued: u64,
    /// Requests rejected by an open circuit
    pub circuit_rejections: u64,
    /// Retry attempts
    pub retries: u64,
    /// Executions cut off by the request timeout
    pub timeouts: u64,
    /// Requests rejected before any I/O
    pub validation_failures: u64,
    /// Mean latency of backend-served successes
    pub average_latency_ms: f64,
    /// Fraction of cache lookups that hit
    pub cache_hit_rate: f64,
    /// Per-backend breakdown
    pub backends: BTreeMap<Backend, BackendSnapshot>,
}

/// Dispatcher metrics registry
#[derive(Debug, Default)]
pub struct Metrics {
    totals: Counters,
    cache_misses: AtomicU64,
    validation_failures: AtomicU64,
    backends: DashMap<Backend, Counters>,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Metrics {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, backend: Backend, field: impl Fn(&Counters) -> &AtomicU64) {
        bump(field(&self.totals));
        let per_backend = self.backends.entry(backend).or_default();
        bump(field(&*per_backend));
    }

    /// A validated request resolved to `backend`
    pub fn record_request(&self, backend: Backend) {
        self.record(backend, |c| &c.requests);
    }

    /// A request rejected by the validator
    pub fn record_validation_failure(&self) {
        bump(&self.validation_failures);
    }

    /// A cache lookup that hit
    pub fn record_cache_hit(&self, backend: Backend) {
        self.record(backend, |c| &c.cache_hits);
    }

    /// A cache lookup that missed
    pub fn record_cache_miss(&self) {
        bump(&self.cache_misses);
    }

    /// A request that joined an identical in-flight execution
    pub fn record_dedup_hit(&self, backend: Backend) {
        self.record(backend, |c| &c.dedup_hits);
    }

    /// A request that entered the queue
    pub fn record_queued(&self, backend: Backend) {
        self.record(backend, |c| &c.queued);
    }

    /// A request rejected by an open circuit
    pub fn record_circuit_rejection(&self, backend: Backend) {
        self.record(backend, |c| &c.circuit_rejections);
    }

    /// A retry attempt about to run
    pub fn record_retry(&self, backend: Backend) {
        self.record(backend, |c| &c.retries);
    }

    /// An execution that hit the request timeout
    pub fn record_timeout(&self, backend: Backend) {
        self.record(backend, |c| &c.timeouts);
    }

    /// A successful completion. `latency` is only given for responses the
    /// backend actually produced.
    pub fn record_success(&self, backend: Backend, latency: Option<Duration>) {
        self.record(backend, |c| &c.successes);
        if let Some(latency) = latency {
            let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
            let per_backend = self.backends.entry(backend).or_default();
            for counters in [&self.totals, &*per_backend] {
                counters.latency_total_ms.fetch_add(ms, Ordering::Relaxed);
                bump(&counters.latency_samples);
            }
        }
    }

    /// A terminal failure
    pub fn record_failure(&self, backend: Option<Backend>) {
        match backend {
            Some(backend) => self.record(backend, |c| &c.failures),
            None => bump(&self.totals.failures),
        }
    }

    /// A cancelled request
    pub fn record_cancellation(&self, backend: Backend) {
        self.record(backend, |c| &c.cancellations);
    }

    /// Point-in-time copy of every counter
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let cache_hits = load(&self.totals.cache_hits);
        let cache_misses = load(&self.cache_misses);
        let lookups = cache_hits + cache_misses;

        let backends = self
            .backends
            .iter()
            .map(|entry| {
                let c = entry.value();
                let snapshot = BackendSnapshot {
                    requests: load(&c.requests),
                    successes: load(&c.successes),
                    failures: load(&c.failures),
                    cancellations: load(&c.cancellations),
                    cache_hits: load(&c.cache_hits),
                    dedup_hits: load(&c.dedup_hits),
                    queued: load(&c.queued),
                    circuit_rejections: load(&c.circuit_rejections),
                    retries: load(&c.retries),
                    timeouts: load(&c.timeouts),
                    average_latency_ms: c.average_latency_ms(),
                };
                (*entry.key(), snapshot)
            })
            .collect();

        MetricsSnapshot {
            requests: load(&self.totals.requests),
            successes: load(&self.totals.successes),
            failures: load(&self.totals.failures),
            cancellations: load(&self.totals.cancellations),
            cache_hits,
            cache_misses,
            dedup_hits: load(&self.totals.dedup_hits),
            queued: load(&self.totals.queued),
            circuit_rejections: load(&self.totals.circuit_rejections),
            retries: load(&self.totals.retries),
            timeouts: load(&self.totals.timeouts),
            validation_failures: load(&self.validation_failures),
            average_latency_ms: self.totals.average_latency_ms(),
            cache_hit_rate: if lookups == 0 {
                0.0
            } else {
                cache_hits as f64 / lookups as f64
            },
            backends,
        }
    }

    /// Zero every counter and forget per-backend breakdowns
    pub fn reset(&self) {
        for counter in self.totals.all() {
            counter.store(0, Ordering::Relaxed);
        }
        self.cache_misses.store(0, Ordering::Relaxed);
        self.validation_failures.store(0, Ordering::Relaxed);
        self.backends.clear();
    }

    /// Render the current snapshot in the Prometheus text format
    ///
    /// # Errors
    /// Returns error if a metric cannot be registered or encoded
    pub fn render_prometheus(&self) -> Result<String, prometheus::Error> {
        let snapshot = self.snapshot();
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new("llm_dispatch_requests_total", "Requests by backend and outcome"),
            &["backend", "outcome"],
        )?;
        registry.register(Box::new(requests.clone()))?;

        let events = IntCounterVec::new(
            Opts::new("llm_dispatch_events_total", "Dispatcher events by backend"),
            &["backend", "event"],
        )?;
        registry.register(Box::new(events.clone()))?;

        for (backend, b) in &snapshot.backends {
            let name = backend.as_str();
            for (outcome, value) in [
                ("received", b.requests),
                ("success", b.successes),
                ("failure", b.failures),
                ("cancelled", b.cancellations),
            ] {
                requests.with_label_values(&[name, outcome]).inc_by(value);
            }
            for (event, value) in [
                ("cache_hit", b.cache_hits),
                ("dedup_hit", b.dedup_hits),
                ("queued", b.queued),
                ("circuit_rejection", b.circuit_rejections),
                ("retry", b.retries),
                ("timeout", b.timeouts),
            ] {
                events.with_label_values(&[name, event]).inc_by(value);
            }
        }

        let cache_misses = IntCounter::new("llm_dispatch_cache_misses_total", "Cache misses")?;
        cache_misses.inc_by(snapshot.cache_misses);
        registry.register(Box::new(cache_misses))?;

        let validation = IntCounter::new(
            "llm_dispatch_validation_failures_total",
            "Requests rejected before any I/O",
        )?;
        validation.inc_by(snapshot.validation_failures);
        registry.register(Box::new(validation))?;

        let latency = Gauge::new(
            "llm_dispatch_average_latency_ms",
            "Mean latency of backend-served successes",
        )?;
        latency.set(snapshot.average_latency_ms);
        registry.register(Box::new(latency))?;

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
