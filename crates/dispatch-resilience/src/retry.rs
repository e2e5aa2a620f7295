//! Retry policy with exponential backoff.
//!
//! Failures are classified as retryable when the adapter says so, when the
//! HTTP status is in `retry_on_status`, or when the message looks like a
//! transient network problem. Backoff sleeps can be interrupted by a
//! cancellation token.

use dispatch_core::{DispatchError, DispatchResult};
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[allow(clippy::expect_used)]
static TRANSIENT_PATTERNS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(connection (reset|refused|closed)|econnreset|econnrefused|timed? ?out|dns|name resolution|rate limit|too many requests|bad gateway|service unavailable|gateway timeout|overloaded|temporarily unavailable)",
    )
    .expect("valid regex")
});

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries
    pub max_retries: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
    /// Jitter factor (0.0 - 1.0)
    pub jitter: f64,
    /// HTTP status codes to retry on
    pub retry_on_status: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.0,
            retry_on_status: vec![429, 502, 503, 504],
        }
    }
}

/// A failed attempt that is about to be retried
#[derive(Debug)]
pub struct RetryAttempt<'a> {
    /// Zero-based index of the attempt that failed
    pub attempt: u32,
    /// Backoff before the next attempt
    pub delay: Duration,
    /// The failure
    pub error: &'a DispatchError,
}

/// Retry policy implementation
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create a new retry policy with the given configuration
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(RetryConfig::default())
    }

    /// Create a policy with custom max retries
    #[must_use]
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self::new(RetryConfig {
            max_retries,
            ..Default::default()
        })
    }

    /// Calculate delay for a given attempt (0-indexed)
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay.as_millis() as f64;
        let delay = base * self.config.multiplier.powi(attempt as i32);
        let delay = delay.min(self.config.max_delay.as_millis() as f64);

        let jitter_range = delay * self.config.jitter;
        let final_delay = if jitter_range > 0.0 {
            let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
            (delay + jitter).max(0.0)
        } else {
            delay
        };

        Duration::from_millis(final_delay as u64)
    }

    /// Check if an error is retryable
    #[must_use]
    pub fn is_retryable(&self, error: &DispatchError) -> bool {
        match error {
            DispatchError::Backend {
                retryable,
                status,
                message,
                ..
            } => {
                *retryable
                    || status.is_some_and(|code| self.config.retry_on_status.contains(&code))
                    || TRANSIENT_PATTERNS.is_match(message)
            }
            // The wall-clock timeout covers every attempt, so it is terminal
            _ => false,
        }
    }

    /// Execute an operation with retry logic
    ///
    /// # Errors
    /// Returns the last error if all retries are exhausted
    pub async fn execute<F, Fut, T>(&self, operation: F) -> DispatchResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = DispatchResult<T>>,
    {
        self.execute_cancellable(&CancellationToken::new(), |_| operation(), |_| true)
            .await
            .into_result()
    }

    /// Execute an operation with retry logic, stopping early on cancellation.
    ///
    /// `operation` receives the zero-based attempt number. Before each retry
    /// `may_retry` is consulted; returning false surfaces the error as
    /// non-retryable. The backoff sleep ends early when `cancel` fires.
    pub async fn execute_cancellable<F, Fut, T, G>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
        mut may_retry: G,
    ) -> RetryResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = DispatchResult<T>>,
        G: FnMut(&RetryAttempt<'_>) -> bool,
    {
        let mut attempt = 0;
        loop {
            let error = match operation(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempt = attempt, "Retry succeeded");
                    }
                    return RetryResult::Success(value);
                }
                Err(error) => error,
            };

            if error.is_cancelled() || !self.is_retryable(&error) {
                return RetryResult::NonRetryable { error };
            }
            if attempt >= self.config.max_retries {
                return RetryResult::Failed {
                    error,
                    attempts: attempt + 1,
                };
            }

            let delay = self.delay_for_attempt(attempt);
            let next = RetryAttempt {
                attempt,
                delay,
                error: &error,
            };
            if !may_retry(&next) {
                return RetryResult::NonRetryable { error };
            }

            warn!(
                attempt = attempt + 1,
                max_retries = self.config.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying after error"
            );

            tokio::select! {
                () = cancel.cancelled() => {
                    return RetryResult::NonRetryable {
                        error: DispatchError::cancelled("cancelled during retry backoff"),
                    };
                }
                () = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

/// Result of a retry operation
#[derive(Debug)]
pub enum RetryResult<T> {
    /// Operation succeeded
    Success(T),
    /// Operation failed after all retries
    Failed {
        /// The final error
        error: DispatchError,
        /// Number of attempts made
        attempts: u32,
    },
    /// Operation failed with non-retryable error
    NonRetryable {
        /// The error
        error: DispatchError,
    },
}

impl<T> RetryResult<T> {
    /// Convert to a Result
    ///
    /// # Errors
    /// Returns the error if the operation failed
    pub fn into_result(self) -> DispatchResult<T> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Failed { error, .. } | Self::NonRetryable { error } => Err(error),
        }
    }

    /// Check if the operation succeeded
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Builder for retry policy
#[derive(Debug, Default)]
pub struct RetryPolicyBuilder {
    config: RetryConfig,
}

impl RetryPolicyBuilder {
    /// Create a new builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set max retries
    #[must_use]
    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    /// Set base delay
    #[must_use]
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.config.base_delay = delay;
        self
    }

    /// Set max delay
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    /// Set backoff multiplier
    #[must_use]
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.config.multiplier = multiplier;
        self
    }

    /// Set jitter factor
    #[must_use]
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.config.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Set status codes to retry on
    #[must_use]
    pub fn retry_on_status(mut self, codes: Vec<u16>) -> Self {
        self.config.retry_on_status = codes;
        self
    }

    /// Build the policy
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        RetryPolicy::new(self.config)
    }
}
