//! # Dispatch Config
//!
//! Configuration management for the LLM dispatcher.
//!
//! Configuration is read from a YAML, TOML or JSON file (picked by
//! extension), `${VAR}` references in the file are expanded from the
//! environment, and `LLM_DISPATCH_*` variables override individual settings.
//! The result is checked with `validator` plus cross-field rules.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod loader;

pub use config::{
    AuditSettings, AuditSinkKind, CacheSettings, CircuitBreakerSettings, DedupSettings,
    DispatcherConfig, DrainPolicy, ProviderSettings, QueueSettings, RateLimitSettings,
    RetrySettings, TelemetrySettings, TimeoutSettings, ValidationSettings,
};
pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigFormat, ConfigLoader, CONFIG_PATH_ENV, ENV_PREFIX};
