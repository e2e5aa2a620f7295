//! Configuration structures.

use crate::error::{ConfigError, ConfigResult};
use dispatch_core::Backend;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use validator::Validate;

/// Root dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DispatcherConfig {
    /// Backend used when neither the request nor the model selection names one
    #[serde(default = "default_backend")]
    pub default_backend: Backend,

    /// Wall-clock limits
    #[serde(default)]
    #[validate(nested)]
    pub timeouts: TimeoutSettings,

    /// Response cache
    #[serde(default)]
    #[validate(nested)]
    pub cache: CacheSettings,

    /// In-flight deduplication
    #[serde(default)]
    pub dedup: DedupSettings,

    /// Per-backend circuit breaking
    #[serde(default)]
    #[validate(nested)]
    pub circuit_breaker: CircuitBreakerSettings,

    /// Per-backend fixed-window rate limits
    #[serde(default)]
    #[validate(nested)]
    pub rate_limit: RateLimitSettings,

    /// Queue for rate limited requests
    #[serde(default)]
    #[validate(nested)]
    pub queue: QueueSettings,

    /// Retry policy
    #[serde(default)]
    #[validate(nested)]
    pub retry: RetrySettings,

    /// Request validation limits
    #[serde(default)]
    #[validate(nested)]
    pub validation: ValidationSettings,

    /// Per-backend connection settings
    #[serde(default)]
    pub providers: BTreeMap<Backend, ProviderSettings>,

    /// Logging and tracing
    #[serde(default)]
    #[validate(nested)]
    pub telemetry: TelemetrySettings,

    /// Request/response audit log
    #[serde(default)]
    #[validate(nested)]
    pub audit: AuditSettings,

    /// Broadcast buffer for dispatcher events
    #[serde(default = "default_event_capacity")]
    #[validate(range(min = 1))]
    pub event_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_backend: default_backend(),
            timeouts: TimeoutSettings::default(),
            cache: CacheSettings::default(),
            dedup: DedupSettings::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            rate_limit: RateLimitSettings::default(),
            queue: QueueSettings::default(),
            retry: RetrySettings::default(),
            validation: ValidationSettings::default(),
            providers: BTreeMap::new(),
            telemetry: TelemetrySettings::default(),
            audit: AuditSettings::default(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl DispatcherConfig {
    /// Run field validation and the cross-field rules.
    pub fn check(&self) -> ConfigResult<()> {
        self.validate()?;

        if self.timeouts.request.is_zero() {
            return Err(ConfigError::Invalid(
                "timeouts.request must be greater than zero".to_string(),
            ));
        }
        if self.cache.ttl.is_zero() {
            return Err(ConfigError::Invalid(
                "cache.ttl must be greater than zero".to_string(),
            ));
        }
        if self.circuit_breaker.cool_down.is_zero() {
            return Err(ConfigError::Invalid(
                "circuit_breaker.cool_down must be greater than zero".to_string(),
            ));
        }
        if self.rate_limit.window.is_zero() {
            return Err(ConfigError::Invalid(
                "rate_limit.window must be greater than zero".to_string(),
            ));
        }
        if let Some((backend, _)) = self.rate_limit.quotas.iter().find(|(_, q)| **q == 0) {
            return Err(ConfigError::Invalid(format!(
                "rate_limit.quotas.{backend} must be at least 1"
            )));
        }
        if self.queue.tick_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "queue.tick_interval must be greater than zero".to_string(),
            ));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(ConfigError::Invalid(format!(
                "retry.base_delay ({:?}) exceeds retry.max_delay ({:?})",
                self.retry.base_delay, self.retry.max_delay
            )));
        }
        if self.validation.max_message_chars > self.validation.max_total_chars {
            return Err(ConfigError::Invalid(
                "validation.max_message_chars exceeds validation.max_total_chars".to_string(),
            ));
        }
        for (backend, provider) in &self.providers {
            if let Some(base_url) = &provider.base_url {
                url::Url::parse(base_url).map_err(|e| {
                    ConfigError::Invalid(format!("providers.{backend}.base_url: {e}"))
                })?;
            }
            if matches!(&provider.default_model, Some(m) if m.trim().is_empty()) {
                return Err(ConfigError::Invalid(format!(
                    "providers.{backend}.default_model must not be empty"
                )));
            }
        }
        if self.audit.sink == AuditSinkKind::Jsonl && self.audit.path.is_none() {
            return Err(ConfigError::Invalid(
                "audit.path is required for the jsonl sink".to_string(),
            ));
        }
        Ok(())
    }

    /// Settings for a backend, if configured
    #[must_use]
    pub fn provider(&self, backend: Backend) -> Option<&ProviderSettings> {
        self.providers.get(&backend)
    }

    /// Backends that are configured and enabled
    pub fn enabled_backends(&self) -> impl Iterator<Item = Backend> + '_ {
        self.providers
            .iter()
            .filter(|(_, p)| p.enabled)
            .map(|(b, _)| *b)
    }

    /// Effective default model for a backend
    #[must_use]
    pub fn default_model(&self, backend: Backend) -> String {
        self.provider(backend)
            .and_then(|p| p.default_model.clone())
            .unwrap_or_else(|| backend.default_model().to_string())
    }
}

/// Wall-clock limits
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TimeoutSettings {
    /// Maximum time for one request, retries included
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request: Duration,

    /// TCP connect timeout for HTTP adapters
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect: Duration,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
            connect: default_connect_timeout(),
        }
    }
}

/// Response cache settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CacheSettings {
    /// Enable the response cache
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum number of entries
    #[serde(default = "default_cache_capacity")]
    #[validate(range(min = 1))]
    pub capacity: usize,

    /// Entry time to live
    #[serde(default = "default_cache_ttl", with = "humantime_serde")]
    pub ttl: Duration,

    /// How often expired entries are swept
    #[serde(default = "default_purge_interval", with = "humantime_serde")]
    pub purge_interval: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: default_cache_capacity(),
            ttl: default_cache_ttl(),
            purge_interval: default_purge_interval(),
        }
    }
}

/// Deduplication settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupSettings {
    /// Share one backend call between concurrent identical requests
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Circuit breaker settings, applied to every backend
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures before opening
    #[serde(default = "default_failure_threshold")]
    #[validate(range(min = 1))]
    pub failure_threshold: u32,

    /// Time the breaker stays open before admitting a trial
    #[serde(default = "default_cool_down", with = "humantime_serde")]
    pub cool_down: Duration,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cool_down: default_cool_down(),
        }
    }
}

/// Fixed-window rate limiting settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RateLimitSettings {
    /// Window length
    #[serde(default = "default_rate_window", with = "humantime_serde")]
    pub window: Duration,

    /// Requests per window for backends without an explicit quota
    #[serde(default = "default_quota")]
    #[validate(range(min = 1))]
    pub default_quota: u32,

    /// Per-backend quotas
    #[serde(default = "default_quotas")]
    pub quotas: BTreeMap<Backend, u32>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            window: default_rate_window(),
            default_quota: default_quota(),
            quotas: default_quotas(),
        }
    }
}

impl RateLimitSettings {
    /// Effective quota for a backend
    #[must_use]
    pub fn quota(&self, backend: Backend) -> u32 {
        self.quotas
            .get(&backend)
            .copied()
            .unwrap_or(self.default_quota)
    }
}

/// How the scheduler treats a queue head it cannot run yet
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainPolicy {
    /// Stop the pass at the first blocked item
    StrictPriority,
    /// Set blocked items aside and keep draining other backends
    #[default]
    SkipBlocked,
}

/// Queue and scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct QueueSettings {
    /// Maximum number of queued requests
    #[serde(default = "default_queue_capacity")]
    #[validate(range(min = 1))]
    pub capacity: usize,

    /// Scheduler tick
    #[serde(default = "default_tick_interval", with = "humantime_serde")]
    pub tick_interval: Duration,

    /// Drain policy
    #[serde(default)]
    pub drain_policy: DrainPolicy,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            tick_interval: default_tick_interval(),
            drain_policy: DrainPolicy::default(),
        }
    }
}

/// Retry settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RetrySettings {
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    #[validate(range(max = 10))]
    pub max_retries: u32,

    /// Delay before the first retry
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,

    /// Upper bound for any delay
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,

    /// Backoff multiplier
    #[serde(default = "default_multiplier")]
    #[validate(range(min = 1.0, max = 10.0))]
    pub multiplier: f64,

    /// Jitter factor (0.0 - 1.0)
    #[serde(default)]
    #[validate(range(min = 0.0, max = 1.0))]
    pub jitter: f64,

    /// HTTP statuses that are always retried
    #[serde(default = "default_retry_on_status")]
    pub retry_on_status: Vec<u16>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            multiplier: default_multiplier(),
            jitter: 0.0,
            retry_on_status: default_retry_on_status(),
        }
    }
}

/// Request validation limits
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ValidationSettings {
    /// Maximum characters in one message
    #[serde(default = "default_max_message_chars")]
    #[validate(range(min = 1))]
    pub max_message_chars: usize,

    /// Maximum characters across all messages
    #[serde(default = "default_max_total_chars")]
    #[validate(range(min = 1))]
    pub max_total_chars: usize,

    /// Largest accepted `max_tokens`
    #[serde(default = "default_max_tokens_cap")]
    #[validate(range(min = 1))]
    pub max_tokens_cap: u32,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            max_message_chars: default_max_message_chars(),
            max_total_chars: default_max_total_chars(),
            max_tokens_cap: default_max_tokens_cap(),
        }
    }
}

/// Connection settings for one backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Register an adapter for this backend
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Override the public API endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Inline API key
    #[serde(default, skip_serializing)]
    pub api_key: Option<SecretString>,

    /// Environment variable holding the API key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Model used when the request does not name one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: None,
            api_key: None,
            api_key_env: None,
            default_model: None,
        }
    }
}

impl ProviderSettings {
    /// Resolve the API key: inline value, then `api_key_env`, then the
    /// backend's conventional variable.
    pub fn resolve_api_key(
        &self,
        backend: Backend,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Option<SecretString> {
        if let Some(key) = &self.api_key {
            return Some(key.clone());
        }
        self.api_key_env
            .as_deref()
            .or_else(|| backend.api_key_env())
            .and_then(lookup)
            .filter(|v| !v.trim().is_empty())
            .map(SecretString::new)
    }
}

/// Logging and tracing settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TelemetrySettings {
    /// Default log filter
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines
    #[serde(default)]
    pub json_logs: bool,

    /// Install the OpenTelemetry layer
    #[serde(default)]
    pub otel_enabled: bool,

    /// Service name reported to OpenTelemetry
    #[serde(default = "default_service_name")]
    #[validate(length(min = 1))]
    pub service_name: String,

    /// Trace sampling rate (0.0 - 1.0)
    #[serde(default = "default_sampling_rate")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub sampling_rate: f64,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            otel_enabled: false,
            service_name: default_service_name(),
            sampling_rate: default_sampling_rate(),
        }
    }
}

/// Where audit records go
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSinkKind {
    /// Discard records
    #[default]
    None,
    /// Keep the most recent records in memory
    Memory,
    /// Append JSON lines to a file
    Jsonl,
}

/// Audit log settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AuditSettings {
    /// Sink kind
    #[serde(default)]
    pub sink: AuditSinkKind,

    /// Output file for the jsonl sink
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Records kept by the memory sink
    #[serde(default = "default_memory_capacity")]
    #[validate(range(min = 1))]
    pub memory_capacity: usize,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            sink: AuditSinkKind::None,
            path: None,
            memory_capacity: default_memory_capacity(),
        }
    }
}

// Default value functions
const fn default_backend() -> Backend {
    Backend::Ollama
}

const fn default_true() -> bool {
    true
}

const fn default_event_capacity() -> usize {
    256
}

const fn default_request_timeout() -> Duration {
    Duration::from_secs(120)
}

const fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

const fn default_cache_capacity() -> usize {
    500
}

const fn default_cache_ttl() -> Duration {
    Duration::from_secs(3600)
}

const fn default_purge_interval() -> Duration {
    Duration::from_secs(60)
}

const fn default_failure_threshold() -> u32 {
    5
}

const fn default_cool_down() -> Duration {
    Duration::from_secs(30)
}

const fn default_rate_window() -> Duration {
    Duration::from_secs(60)
}

const fn default_quota() -> u32 {
    60
}

fn default_quotas() -> BTreeMap<Backend, u32> {
    BTreeMap::from([(Backend::Ollama, 1000)])
}

const fn default_queue_capacity() -> usize {
    100
}

const fn default_tick_interval() -> Duration {
    Duration::from_secs(1)
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}

const fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

const fn default_multiplier() -> f64 {
    2.0
}

fn default_retry_on_status() -> Vec<u16> {
    vec![429, 502, 503, 504]
}

const fn default_max_message_chars() -> usize {
    100_000
}

const fn default_max_total_chars() -> usize {
    500_000
}

const fn default_max_tokens_cap() -> u32 {
    200_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_service_name() -> String {
    "llm-dispatcher".to_string()
}

const fn default_sampling_rate() -> f64 {
    1.0
}

const fn default_memory_capacity() -> usize {
    1000
}
