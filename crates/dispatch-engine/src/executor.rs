//! Backend execution with retry, timeout and breaker accounting.

use crate::stream::StreamMessage;
use dispatch_core::{
    Backend, CancellationToken, ChatMessage, DispatchError, DispatchEvent, DispatchResult,
    EventBus, GenerationOptions, ProviderAdapter, StreamId,
};
use dispatch_resilience::{CircuitBreaker, CircuitState, RetryAttempt, RetryPolicy};
use dispatch_telemetry::Metrics;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

/// Everything one execution needs
pub(crate) struct ExecutionPlan<'a> {
    pub stream_id: StreamId,
    pub backend: Backend,
    pub adapter: Arc<dyn ProviderAdapter>,
    pub messages: &'a [ChatMessage],
    pub options: &'a GenerationOptions,
    pub cancel: &'a CancellationToken,
    pub breaker: &'a CircuitBreaker,
    pub sink: &'a UnboundedSender<StreamMessage>,
}

/// Result of an execution
#[derive(Debug)]
pub(crate) struct ExecutionOutcome {
    pub result: DispatchResult<String>,
    pub attempts: u32,
    /// Text forwarded before a failure
    pub partial: String,
}

/// Runs requests against adapters.
///
/// The wall-clock limit covers every attempt and the backoff between them.
/// Once any chunk has reached the caller a failure is final, since a retry
/// would repeat text the caller already has.
#[derive(Debug)]
pub(crate) struct RetryExecutor {
    policy: RetryPolicy,
    request_timeout: Duration,
    metrics: Arc<Metrics>,
    events: Arc<EventBus>,
}

impl RetryExecutor {
    pub(crate) fn new(
        policy: RetryPolicy,
        request_timeout: Duration,
        metrics: Arc<Metrics>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            policy,
            request_timeout,
            metrics,
            events,
        }
    }

    pub(crate) async fn execute(&self, plan: ExecutionPlan<'_>) -> ExecutionOutcome {
        let buffer = Mutex::new(String::new());
        let streamed = AtomicBool::new(false);
        let attempts = AtomicU32::new(0);

        let result = {
            let (this, plan_ref, buffer_ref, streamed_ref, attempts_ref) =
                (self, &plan, &buffer, &streamed, &attempts);
            let run = self.policy.execute_cancellable(
                plan.cancel,
                move |_| {
                    attempts_ref.fetch_add(1, Ordering::Relaxed);
                    this.attempt(plan_ref, buffer_ref, streamed_ref)
                },
                |next| self.may_retry(&plan, &streamed, next),
            );
            match tokio::time::timeout(self.request_timeout, run).await {
                Ok(outcome) => outcome.into_result(),
                Err(_) => {
                    warn!(
                        stream_id = %plan.stream_id,
                        backend = %plan.backend,
                        timeout_ms = self.request_timeout.as_millis() as u64,
                        "Request timed out"
                    );
                    self.metrics.record_timeout(plan.backend);
                    Err(DispatchError::Timeout {
                        backend: plan.backend,
                        elapsed: self.request_timeout,
                    })
                }
            }
        };

        self.settle_breaker(&plan, &result);

        let text = buffer.into_inner();
        let attempts = attempts.into_inner();
        match result {
            Ok(()) => ExecutionOutcome {
                result: Ok(text),
                attempts,
                partial: String::new(),
            },
            Err(error) => ExecutionOutcome {
                result: Err(error),
                attempts,
                partial: text,
            },
        }
    }

    async fn attempt(
        &self,
        plan: &ExecutionPlan<'_>,
        buffer: &Mutex<String>,
        streamed: &AtomicBool,
    ) -> DispatchResult<()> {
        let mut chunks = tokio::select! {
            biased;
            () = plan.cancel.cancelled() => return Err(DispatchError::cancelled("stream cancelled")),
            opened = plan.adapter.stream(plan.messages, plan.options, plan.cancel.clone()) => opened?,
        };

        loop {
            let next = tokio::select! {
                biased;
                () = plan.cancel.cancelled() => return Err(DispatchError::cancelled("stream cancelled")),
                next = chunks.next() => next,
            };
            match next {
                None => return Ok(()),
                Some(Ok(text)) if text.is_empty() => {}
                Some(Ok(text)) => {
                    streamed.store(true, Ordering::Relaxed);
                    buffer.lock().push_str(&text);
                    // The caller may have dropped the stream; cancellation follows
                    let _ = plan.sink.send(StreamMessage::Chunk(text));
                }
                Some(Err(error)) => return Err(error),
            }
        }
    }

    fn may_retry(&self, plan: &ExecutionPlan<'_>, streamed: &AtomicBool, next: &RetryAttempt<'_>) -> bool {
        if streamed.load(Ordering::Relaxed) {
            debug!(
                stream_id = %plan.stream_id,
                error = %next.error,
                "Not retrying, output already streamed"
            );
            return false;
        }
        self.metrics.record_retry(plan.backend);
        self.events.publish(DispatchEvent::RetryScheduled {
            stream_id: plan.stream_id,
            backend: plan.backend,
            attempt: next.attempt + 1,
            delay: next.delay,
        });
        true
    }

    fn settle_breaker(&self, plan: &ExecutionPlan<'_>, result: &DispatchResult<()>) {
        let breaker = plan.breaker;
        match result {
            Ok(()) => {
                if breaker.record_success() == Some(CircuitState::Closed) {
                    info!(backend = %plan.backend, "Circuit closed");
                    self.events
                        .publish(DispatchEvent::CircuitClosed { backend: plan.backend });
                }
            }
            Err(error) if error.counts_as_backend_failure() => {
                if breaker.record_failure() == Some(CircuitState::Open) {
                    let failures = breaker.stats().consecutive_failures;
                    warn!(backend = %plan.backend, failures, "Circuit opened");
                    self.events.publish(DispatchEvent::CircuitOpened {
                        backend: plan.backend,
                        failures,
                    });
                }
            }
            // Cancellations and local errors say nothing about backend health
            Err(_) => breaker.record_cancelled(),
        }
    }
}
