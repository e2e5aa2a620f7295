//! The dispatcher: composition root and request pipeline.
//!
//! A request passes through validation, target resolution and
//! fingerprinting on the caller's task, then runs on its own task:
//! deduplication, cache lookup, circuit check, rate limiting (or the queue),
//! and finally the retrying executor. Every terminal outcome updates
//! metrics, publishes an event and is written to the audit sink.

use crate::executor::{ExecutionPlan, RetryExecutor};
use crate::queue::RequestQueue;
use crate::scheduler::{DrainReport, Scheduler};
use crate::selection::{ModelSelection, ModelSelector, Target};
use crate::stream::{Completion, CompletionSource, CompletionStream, StreamMessage};
use crate::stream_registry::{ActiveStream, StreamGuard, StreamRegistry};
use crate::validator::RequestValidator;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dispatch_cache::{
    fingerprint, Admission, CacheStats, Deduplicator, FingerprintInput, ResponseCache,
    ResponseCacheConfig, SharedOutcome,
};
use dispatch_config::{AuditSinkKind, DispatcherConfig, RetrySettings};
use dispatch_core::{
    Backend, ChatMessage, CompletionRequest, ConnectionStatus, DispatchError, DispatchEvent,
    DispatchResult, EventBus, EventKind, Fingerprint, GenerationOptions, HandlerId,
    ProviderAdapter, RequestOptions, StreamId,
};
use dispatch_core::CancellationToken;
use dispatch_providers::ProviderRegistry;
use dispatch_resilience::{
    CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerStats, RateLimitConfig,
    RateLimitStatus, RateLimiter, RetryConfig, RetryPolicy,
};
use dispatch_telemetry::{
    AuditWriter, JsonlFileSink, MemorySink, Metrics, MetricsSnapshot, NullSink, OutcomeRecord,
    PersistenceSink, RequestRecord,
};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

/// Multi-provider request dispatcher.
///
/// Cheap to clone; clones share all state. Must be built inside a tokio
/// runtime because it owns a background scheduler task.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    config: DispatcherConfig,
    validator: RequestValidator,
    selector: ModelSelector,
    providers: ProviderRegistry,
    cache: Arc<ResponseCache>,
    dedup: Deduplicator,
    breakers: Arc<CircuitBreakerRegistry>,
    limiter: Arc<RateLimiter>,
    queue: Arc<RequestQueue>,
    scheduler: Arc<Scheduler>,
    executor: RetryExecutor,
    streams: StreamRegistry,
    metrics: Arc<Metrics>,
    events: Arc<EventBus>,
    audit: AuditWriter,
    models: DashMap<Backend, Vec<String>>,
    refresh: RetryPolicy,
    shutdown: CancellationToken,
    scheduler_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for DispatcherInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// One accepted request on its way through the pipeline
struct Job {
    stream_id: StreamId,
    target: Target,
    fingerprint: Fingerprint,
    messages: Vec<ChatMessage>,
    options: RequestOptions,
    token: CancellationToken,
    guard: StreamGuard,
    tx: mpsc::UnboundedSender<StreamMessage>,
    started: Instant,
    received_at: DateTime<Utc>,
}

/// How a request ended, before it is reported
struct Resolution {
    result: DispatchResult<String>,
    source: CompletionSource,
    attempts: u32,
    partial: String,
}

impl Resolution {
    fn local(result: DispatchResult<String>, source: CompletionSource) -> Self {
        Self {
            result,
            source,
            attempts: 0,
            partial: String::new(),
        }
    }
}

impl Dispatcher {
    /// Start building a dispatcher
    #[must_use]
    pub fn builder(config: DispatcherConfig) -> DispatcherBuilder {
        DispatcherBuilder::new(config)
    }

    /// Build a dispatcher with adapters and audit sink taken from `config`
    pub fn from_config(config: DispatcherConfig) -> DispatchResult<Self> {
        DispatcherBuilder::new(config).build()
    }

    /// Submit a request and stream its output.
    ///
    /// Validation runs before this returns; everything else happens on a
    /// background task feeding the returned stream.
    ///
    /// # Errors
    /// Returns `Validation` for malformed requests and `DispatcherShutdown`
    /// after [`Dispatcher::shutdown`]
    pub fn stream(&self, request: CompletionRequest) -> DispatchResult<CompletionStream> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(DispatchError::DispatcherShutdown);
        }

        let validated = match inner.validator.validate(request) {
            Ok(validated) => validated,
            Err(error) => {
                debug!(error = %error, "Request rejected by validation");
                inner.metrics.record_validation_failure();
                inner.events.publish(DispatchEvent::RequestFailed {
                    stream_id: StreamId::generate(),
                    backend: None,
                    kind: error.kind(),
                    message: error.to_string(),
                });
                return Err(error);
            }
        };
        let (messages, options, cancellation) = validated.into_parts();

        let target = inner.selector.resolve(&options);
        let fingerprint = fingerprint(&FingerprintInput {
            messages: &messages,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            backend: target.backend,
            model: &target.model,
        });

        let stream_id = StreamId::generate();
        let guard = inner
            .streams
            .register(stream_id, target.backend, cancellation.as_ref());
        let token = guard.token().clone();
        let (tx, rx) = mpsc::unbounded_channel();

        inner.metrics.record_request(target.backend);
        inner.events.publish(DispatchEvent::RequestStarted {
            stream_id,
            fingerprint: fingerprint.clone(),
            backend: target.backend,
            model: target.model.clone(),
        });
        debug!(
            stream_id = %stream_id,
            backend = %target.backend,
            model = %target.model,
            fingerprint = %fingerprint.short(),
            "Request accepted"
        );

        let span = dispatch_telemetry::dispatch_span!(stream_id, target.backend, target.model);
        let job = Job {
            stream_id,
            target,
            fingerprint,
            messages,
            options,
            token: token.clone(),
            guard,
            tx,
            started: Instant::now(),
            received_at: Utc::now(),
        };
        tokio::spawn(Arc::clone(inner).run(job).instrument(span));

        Ok(CompletionStream::new(stream_id, rx, token))
    }

    /// Submit a request and wait for the full response
    ///
    /// # Errors
    /// Returns the error that ended the request
    pub async fn complete(&self, request: CompletionRequest) -> DispatchResult<Completion> {
        self.stream(request)?.collect().await
    }

    /// Probe a backend. Models reported by the probe replace the cached list.
    pub async fn test_connection(&self, backend: Backend) -> ConnectionStatus {
        let Some(adapter) = self.inner.providers.get(backend) else {
            return ConnectionStatus::failed(format!("no adapter registered for {backend}"));
        };
        let status = adapter.test_connection().await;
        if let Some(models) = &status.models {
            self.inner.models.insert(backend, models.clone());
        }
        info!(backend = %backend, ok = status.ok, message = %status.message, "Connection test");
        status
    }

    /// Fetch the model list for a backend, retrying transient failures
    ///
    /// # Errors
    /// Returns `BackendUnavailable` if no adapter is registered, or the
    /// adapter's error once retries are exhausted
    pub async fn refresh_models(&self, backend: Backend) -> DispatchResult<Vec<String>> {
        let adapter = self
            .inner
            .providers
            .get(backend)
            .ok_or(DispatchError::BackendUnavailable { backend })?;
        let models = self.inner.refresh.execute(|| adapter.list_models()).await?;

        info!(backend = %backend, count = models.len(), "Refreshed model list");
        self.inner.models.insert(backend, models.clone());
        self.inner.events.publish(DispatchEvent::ModelsRefreshed {
            backend,
            count: models.len(),
        });
        Ok(models)
    }

    /// Refresh every registered backend concurrently.
    ///
    /// A backend that fails is logged and reported with an empty list.
    pub async fn refresh_all_models(&self) -> BTreeMap<Backend, Vec<String>> {
        let backends = self.inner.providers.backends();
        let results = join_all(backends.iter().map(|b| self.refresh_models(*b))).await;
        backends
            .into_iter()
            .zip(results)
            .map(|(backend, result)| {
                let models = result.unwrap_or_else(|e| {
                    warn!(backend = %backend, error = %e, "Model refresh failed");
                    Vec::new()
                });
                (backend, models)
            })
            .collect()
    }

    /// Last known model list for a backend
    #[must_use]
    pub fn models(&self, backend: Backend) -> Vec<String> {
        self.inner
            .models
            .get(&backend)
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    /// Backends with a registered adapter
    #[must_use]
    pub fn backends(&self) -> Vec<Backend> {
        self.inner.providers.backends()
    }

    /// Counter snapshot
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Counters in Prometheus text format
    ///
    /// # Errors
    /// Returns `Internal` if encoding fails
    pub fn render_metrics(&self) -> DispatchResult<String> {
        self.inner
            .metrics
            .render_prometheus()
            .map_err(|e| DispatchError::internal(format!("metrics encoding failed: {e}")))
    }

    /// Zero every counter
    pub fn reset_metrics(&self) {
        self.inner.metrics.reset();
        self.inner.cache.reset_stats();
    }

    /// Drop every cached response
    pub fn clear_cache(&self) {
        self.inner.cache.clear();
        info!("Response cache cleared");
    }

    /// Response cache statistics
    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    /// Circuit breaker state per backend
    #[must_use]
    pub fn circuit_stats(&self) -> Vec<CircuitBreakerStats> {
        self.inner.breakers.stats()
    }

    /// Close every circuit breaker
    pub fn reset_circuits(&self) {
        self.inner.breakers.reset_all();
    }

    /// Rate limit window for a backend
    #[must_use]
    pub fn rate_limit_status(&self, backend: Backend) -> RateLimitStatus {
        self.inner.limiter.status(backend)
    }

    /// Cancel a running stream. Returns false if it is not running.
    pub fn abort_stream(&self, id: StreamId) -> bool {
        self.inner.streams.abort(id)
    }

    /// Cancel every running stream
    pub fn abort_all(&self) -> usize {
        let count = self.inner.streams.abort_all();
        if count > 0 {
            info!(count, "Aborted all streams");
        }
        count
    }

    /// Streams currently running
    #[must_use]
    pub fn active_streams(&self) -> Vec<ActiveStream> {
        self.inner.streams.active()
    }

    /// Route subsequent requests to `backend`, optionally with a model
    pub fn select_model(&self, backend: Backend, model: Option<String>) {
        self.inner.selector.select(backend, model);
    }

    /// Return to the configured default backend
    pub fn clear_selected_model(&self) {
        self.inner.selector.clear();
    }

    /// Current selection
    #[must_use]
    pub fn selected_model(&self) -> Option<ModelSelection> {
        self.inner.selector.selected()
    }

    /// Receive every event published from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.inner.events.subscribe()
    }

    /// Call `handler` synchronously for each event of `kind`
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&DispatchEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, handler)
    }

    /// Call `handler` synchronously for every event
    pub fn on_any<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&DispatchEvent) + Send + Sync + 'static,
    {
        self.inner.events.on_any(handler)
    }

    /// Remove a handler
    pub fn off(&self, id: HandlerId) -> bool {
        self.inner.events.off(id)
    }

    /// Run a scheduler pass now instead of waiting for the next tick
    pub fn drain_queue(&self) -> DrainReport {
        self.inner.scheduler.drain_once()
    }

    /// Requests waiting in the queue
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.inner.queue.len()
    }

    /// Effective configuration
    #[must_use]
    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    /// Whether [`Dispatcher::shutdown`] has been called
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Stop accepting requests, reject everything queued, cancel running
    /// streams and stop the scheduler. Idempotent.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return;
        }
        inner.shutdown.cancel();

        let queued = inner.queue.drain_all();
        let rejected = queued.len();
        for item in queued {
            item.reject(DispatchError::DispatcherShutdown);
        }
        let aborted = inner.streams.abort_all();
        if let Some(task) = inner.scheduler_task.lock().take() {
            task.abort();
        }
        info!(rejected, aborted, "Dispatcher shut down");
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("backends", &self.inner.providers.backends())
            .field("active_streams", &self.inner.streams.len())
            .field("queue_depth", &self.inner.queue.len())
            .field("shut_down", &self.inner.shutdown.is_cancelled())
            .finish()
    }
}

impl DispatcherInner {
    async fn run(self: Arc<Self>, job: Job) {
        let mut joined = false;
        let resolution = loop {
            match self.dedup.admit(&job.fingerprint) {
                Admission::Follower(shared) => {
                    let resolution = self.follow(&job, shared, !joined).await;
                    joined = true;
                    if self.should_take_over(&job, &resolution) {
                        debug!(
                            fingerprint = %job.fingerprint.short(),
                            "Leader was cancelled, taking over"
                        );
                        continue;
                    }
                    break resolution;
                }
                Admission::Leader(leader) => {
                    let resolution = self.lead(&job).await;
                    leader.settle(resolution.result.clone());
                    break resolution;
                }
                Admission::Bypass => break self.lead(&job).await,
            }
        };
        self.finish(job, resolution);
    }

    /// A follower whose leader was cancelled runs the request itself, unless
    /// it was cancelled too or the dispatcher is going away.
    fn should_take_over(&self, job: &Job, resolution: &Resolution) -> bool {
        matches!(&resolution.result, Err(e) if e.is_cancelled())
            && !job.token.is_cancelled()
            && !self.shutdown.is_cancelled()
    }

    /// Wait for an identical in-flight request and share its text
    async fn follow(&self, job: &Job, shared: SharedOutcome, first_join: bool) -> Resolution {
        if first_join {
            self.metrics.record_dedup_hit(job.target.backend);
            self.events.publish(DispatchEvent::DedupJoined {
                stream_id: job.stream_id,
                fingerprint: job.fingerprint.clone(),
            });
        }
        debug!(fingerprint = %job.fingerprint.short(), "Joined in-flight request");

        let result = tokio::select! {
            biased;
            () = job.token.cancelled() => Err(DispatchError::cancelled("stream cancelled")),
            shared = shared => shared,
        };
        if let Ok(text) = &result {
            if !text.is_empty() {
                let _ = job.tx.send(StreamMessage::Chunk(text.clone()));
            }
        }
        Resolution::local(result, CompletionSource::Deduplicated)
    }

    /// Serve from cache or execute against the backend
    async fn lead(&self, job: &Job) -> Resolution {
        let backend = job.target.backend;
        if let Some(text) = self.cache.get(&job.fingerprint) {
            self.metrics.record_cache_hit(backend);
            self.events.publish(DispatchEvent::CacheHit {
                stream_id: job.stream_id,
                fingerprint: job.fingerprint.clone(),
            });
            debug!(fingerprint = %job.fingerprint.short(), "Served from cache");
            if !text.is_empty() {
                let _ = job.tx.send(StreamMessage::Chunk(text.clone()));
            }
            return Resolution::local(Ok(text), CompletionSource::Cache);
        }
        if self.cache.is_enabled() {
            self.metrics.record_cache_miss();
        }

        let resolution = self.execute(job).await;
        if let Ok(text) = &resolution.result {
            if !text.is_empty() {
                self.cache.put(job.fingerprint.clone(), text.clone());
            }
        }
        resolution
    }

    async fn execute(&self, job: &Job) -> Resolution {
        let backend = job.target.backend;
        let backend_error = |error| Resolution::local(Err(error), CompletionSource::Backend);

        let Some(adapter) = self.providers.get(backend) else {
            return backend_error(DispatchError::BackendUnavailable { backend });
        };

        let breaker = self.breakers.get(backend);
        if breaker.is_blocked() {
            self.metrics.record_circuit_rejection(backend);
            let retry_after = breaker.stats().retry_after.unwrap_or_default();
            return backend_error(DispatchError::CircuitOpen {
                backend,
                retry_after,
            });
        }

        if let Err(error) = self.acquire_slot(job).await {
            return backend_error(error);
        }

        // Claims the half-open trial when the cool-down has elapsed
        if let Err(error) = breaker.check() {
            self.metrics.record_circuit_rejection(backend);
            return backend_error(error);
        }

        let options = GenerationOptions {
            model: job.target.model.clone(),
            temperature: job.options.temperature,
            max_tokens: job.options.max_tokens,
        };
        let outcome = self
            .executor
            .execute(ExecutionPlan {
                stream_id: job.stream_id,
                backend,
                adapter,
                messages: &job.messages,
                options: &options,
                cancel: &job.token,
                breaker: &breaker,
                sink: &job.tx,
            })
            .await;

        Resolution {
            result: outcome.result,
            source: CompletionSource::Backend,
            attempts: outcome.attempts,
            partial: outcome.partial,
        }
    }

    /// Take a rate limit slot, waiting in the queue if the window is spent.
    ///
    /// Requests already waiting for the backend go first.
    async fn acquire_slot(&self, job: &Job) -> DispatchResult<()> {
        let backend = job.target.backend;
        if self.queue.pending_for(backend) == 0 && self.limiter.try_acquire(backend) {
            return Ok(());
        }

        let priority = job.options.priority;
        let grant = self.queue.push(job.stream_id, backend, priority)?;
        let depth = self.queue.len();
        self.metrics.record_queued(backend);
        self.events.publish(DispatchEvent::RequestQueued {
            stream_id: job.stream_id,
            backend,
            priority,
            depth,
        });
        info!(
            stream_id = %job.stream_id,
            backend = %backend,
            priority,
            depth,
            "Rate limited, request queued"
        );

        // A rejection from shutdown takes precedence over the cancellation
        // that accompanies it
        tokio::select! {
            biased;
            granted = grant => granted.unwrap_or(Err(DispatchError::DispatcherShutdown)),
            () = job.token.cancelled() => Err(DispatchError::cancelled("cancelled while queued")),
        }
    }

    fn finish(&self, job: Job, resolution: Resolution) {
        let Job {
            stream_id,
            target,
            fingerprint,
            messages,
            options,
            guard,
            tx,
            started,
            received_at,
            ..
        } = job;
        // Unregister before the caller can observe the end of the stream
        drop(guard);

        let backend = target.backend;
        let latency = started.elapsed();
        let latency_ms = latency.as_millis() as u64;
        let Resolution {
            result,
            source,
            attempts,
            partial,
        } = resolution;

        let outcome = match &result {
            Ok(text) => {
                let backend_latency = (source == CompletionSource::Backend).then_some(latency);
                self.metrics.record_success(backend, backend_latency);
                self.events.publish(DispatchEvent::RequestCompleted {
                    stream_id,
                    backend,
                    latency,
                    chars: text.chars().count(),
                });
                info!(
                    stream_id = %stream_id,
                    backend = %backend,
                    source = source.as_str(),
                    attempts,
                    latency_ms,
                    "Request completed"
                );
                OutcomeRecord::success(source.as_str(), text.clone(), attempts, latency_ms)
            }
            Err(error) => {
                if error.is_cancelled() {
                    self.metrics.record_cancellation(backend);
                    self.events.publish(DispatchEvent::StreamAborted { stream_id });
                    info!(stream_id = %stream_id, backend = %backend, reason = %error, "Request cancelled");
                } else {
                    self.metrics.record_failure(Some(backend));
                    self.events.publish(DispatchEvent::RequestFailed {
                        stream_id,
                        backend: Some(backend),
                        kind: error.kind(),
                        message: error.to_string(),
                    });
                    warn!(
                        stream_id = %stream_id,
                        backend = %backend,
                        kind = %error.kind(),
                        attempts,
                        error = %error,
                        "Request failed"
                    );
                }
                OutcomeRecord::failure(source.as_str(), error, Some(partial), attempts, latency_ms)
            }
        };

        self.audit.submit(
            RequestRecord {
                stream_id,
                fingerprint: fingerprint.to_string(),
                backend,
                model: target.model.clone(),
                messages,
                temperature: options.temperature,
                max_tokens: options.max_tokens,
                priority: options.priority,
                received_at,
            },
            outcome,
        );

        let message = match result {
            Ok(text) => StreamMessage::Finished(Completion {
                stream_id,
                text,
                backend,
                model: target.model,
                source,
                latency,
            }),
            Err(error) => StreamMessage::Failed(error),
        };
        // The caller may already be gone
        let _ = tx.send(message);
    }
}

/// Builds a [`Dispatcher`]
pub struct DispatcherBuilder {
    config: DispatcherConfig,
    registry: Option<ProviderRegistry>,
    adapters: Vec<Arc<dyn ProviderAdapter>>,
    sink: Option<Arc<dyn PersistenceSink>>,
}

impl DispatcherBuilder {
    /// Start from a configuration
    #[must_use]
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            config,
            registry: None,
            adapters: Vec::new(),
            sink: None,
        }
    }

    /// Register an adapter. When any adapter or registry is supplied,
    /// adapters are no longer built from configuration.
    #[must_use]
    pub fn provider(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    /// Use a prepared registry
    #[must_use]
    pub fn providers(mut self, registry: ProviderRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Write audit records to `sink` instead of the configured one
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn PersistenceSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Validate the configuration, wire every component and start the
    /// scheduler
    ///
    /// # Errors
    /// Returns `Configuration` for invalid settings or when called outside a
    /// tokio runtime
    pub fn build(self) -> DispatchResult<Dispatcher> {
        let Self {
            config,
            registry,
            adapters,
            sink,
        } = self;
        config.check()?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(DispatchError::configuration(
                "the dispatcher must be built inside a tokio runtime",
            ));
        }

        let mut providers = match registry {
            Some(registry) => registry,
            None if adapters.is_empty() => ProviderRegistry::from_config(&config)?,
            None => ProviderRegistry::new(),
        };
        for adapter in adapters {
            providers.register(adapter);
        }
        if providers.is_empty() {
            warn!("No provider adapters registered, every request will fail");
        }

        let sink = match sink {
            Some(sink) => sink,
            None => audit_sink(&config)?,
        };

        let cache = Arc::new(ResponseCache::new(ResponseCacheConfig {
            enabled: config.cache.enabled,
            capacity: config.cache.capacity,
            ttl: config.cache.ttl,
        }));
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: config.circuit_breaker.failure_threshold,
            cool_down: config.circuit_breaker.cool_down,
        }));
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
            window: config.rate_limit.window,
            default_quota: config.rate_limit.default_quota,
            quotas: config
                .rate_limit
                .quotas
                .iter()
                .map(|(b, q)| (*b, *q))
                .collect(),
        }));
        let queue = Arc::new(RequestQueue::new(config.queue.capacity));
        let events = Arc::new(EventBus::new(config.event_capacity));
        let metrics = Arc::new(Metrics::new());
        let policy = RetryPolicy::new(retry_config(&config.retry));

        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&queue),
            Arc::clone(&limiter),
            Arc::clone(&breakers),
            Arc::clone(&events),
            config.queue.drain_policy,
        ));
        let shutdown = CancellationToken::new();
        let task = Arc::clone(&scheduler).spawn(
            config.queue.tick_interval,
            Arc::clone(&cache),
            config.cache.purge_interval,
            shutdown.clone(),
        );

        info!(
            backends = ?providers.backends(),
            default_backend = %config.default_backend,
            audit_sink = sink.name(),
            "Dispatcher started"
        );

        let inner = DispatcherInner {
            validator: RequestValidator::new(&config.validation),
            selector: ModelSelector::new(&config),
            providers,
            cache,
            dedup: Deduplicator::new(config.dedup.enabled),
            breakers,
            limiter,
            queue,
            scheduler,
            executor: RetryExecutor::new(
                policy.clone(),
                config.timeouts.request,
                Arc::clone(&metrics),
                Arc::clone(&events),
            ),
            streams: StreamRegistry::new(),
            metrics,
            events,
            audit: AuditWriter::new(sink),
            models: DashMap::new(),
            refresh: policy,
            shutdown,
            scheduler_task: Mutex::new(Some(task)),
            config,
        };
        Ok(Dispatcher {
            inner: Arc::new(inner),
        })
    }
}

impl std::fmt::Debug for DispatcherBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherBuilder")
            .field("adapters", &self.adapters.len())
            .field("registry", &self.registry)
            .field("custom_sink", &self.sink.is_some())
            .finish_non_exhaustive()
    }
}

fn retry_config(settings: &RetrySettings) -> RetryConfig {
    RetryConfig {
        max_retries: settings.max_retries,
        base_delay: settings.base_delay,
        max_delay: settings.max_delay,
        multiplier: settings.multiplier,
        jitter: settings.jitter,
        retry_on_status: settings.retry_on_status.clone(),
    }
}

fn audit_sink(config: &DispatcherConfig) -> DispatchResult<Arc<dyn PersistenceSink>> {
    Ok(match config.audit.sink {
        AuditSinkKind::None => Arc::new(NullSink),
        AuditSinkKind::Memory => Arc::new(MemorySink::new(config.audit.memory_capacity)),
        AuditSinkKind::Jsonl => {
            let path = config.audit.path.clone().ok_or_else(|| {
                DispatchError::configuration("audit.path is required for the jsonl sink")
            })?;
            Arc::new(JsonlFileSink::new(path))
        }
    })
}
