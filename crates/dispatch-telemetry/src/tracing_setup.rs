//! Tracing subscriber setup.
//!
//! Installs an `EnvFilter`-controlled fmt layer (plain or JSON) and, when
//! requested, an OpenTelemetry layer backed by an SDK tracer provider.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::{
    trace::{Config, RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use std::collections::BTreeMap;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Tracing configuration
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Attach an OpenTelemetry layer
    pub otel_enabled: bool,
    /// Emit log lines as JSON objects
    pub json: bool,
    /// Service name
    pub service_name: String,
    /// Service version
    pub service_version: String,
    /// Sampling rate (0.0 - 1.0)
    pub sampling_rate: f64,
    /// Additional resource attributes
    pub attributes: BTreeMap<String, String>,
    /// Default filter directive when `RUST_LOG` is unset
    pub log_level: String,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            otel_enabled: false,
            json: false,
            service_name: "llm-dispatcher".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            sampling_rate: 1.0,
            attributes: BTreeMap::new(),
            log_level: "info".to_string(),
        }
    }
}

impl TracingConfig {
    /// Create a configuration for a service
    #[must_use]
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    /// Enable or disable the OpenTelemetry layer
    #[must_use]
    pub const fn with_otel(mut self, enabled: bool) -> Self {
        self.otel_enabled = enabled;
        self
    }

    /// Switch between JSON and human readable output
    #[must_use]
    pub const fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    /// Set the sampling rate
    #[must_use]
    pub fn with_sampling_rate(mut self, rate: f64) -> Self {
        self.sampling_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Set the log level
    #[must_use]
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Add a resource attribute
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    fn sampler(&self) -> Sampler {
        if self.sampling_rate >= 1.0 {
            Sampler::AlwaysOn
        } else if self.sampling_rate <= 0.0 {
            Sampler::AlwaysOff
        } else {
            Sampler::TraceIdRatioBased(self.sampling_rate)
        }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.log_level))
    }
}

/// Initialize the global subscriber. Log lines go to stderr.
///
/// Returns the tracer provider when the OpenTelemetry layer is enabled so the
/// caller can hand it back to [`shutdown_tracing`].
///
/// # Errors
/// Returns error if a global subscriber is already installed
pub fn init_tracing(config: &TracingConfig) -> Result<Option<TracerProvider>, TracingError> {
    let fmt_layer = if config.json {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_current_span(true)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    };

    let provider = config.otel_enabled.then(|| build_provider(config));
    let otel_layer = provider.as_ref().map(|provider| {
        tracing_opentelemetry::layer().with_tracer(provider.tracer(config.service_name.clone()))
    });

    tracing_subscriber::registry()
        .with(otel_layer)
        .with(fmt_layer.with_filter(config.filter()))
        .try_init()
        .map_err(|e| TracingError::Init(e.to_string()))?;

    info!(
        service = %config.service_name,
        otel = config.otel_enabled,
        json = config.json,
        sampling_rate = config.sampling_rate,
        "Tracing initialized"
    );

    Ok(provider)
}

fn build_provider(config: &TracingConfig) -> TracerProvider {
    let mut attributes = vec![
        opentelemetry::KeyValue::new("service.name", config.service_name.clone()),
        opentelemetry::KeyValue::new("service.version", config.service_version.clone()),
    ];
    attributes.extend(
        config
            .attributes
            .iter()
            .map(|(k, v)| opentelemetry::KeyValue::new(k.clone(), v.clone())),
    );

    let tracer_config = Config::default()
        .with_sampler(config.sampler())
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(Resource::new(attributes));

    TracerProvider::builder().with_config(tracer_config).build()
}

/// Flush and drop the tracer provider
pub fn shutdown_tracing(provider: Option<TracerProvider>) {
    if let Some(provider) = provider {
        drop(provider);
        info!("Tracing shutdown complete");
    }
}

/// Tracing initialization error
#[derive(Debug, thiserror::Error)]
pub enum TracingError {
    /// Failed to initialize tracing
    #[error("Failed to initialize tracing: {0}")]
    Init(String),
}

/// Create a span for one dispatched request
#[macro_export]
macro_rules! dispatch_span {
    ($stream_id:expr, $backend:expr, $model:expr) => {
        tracing::info_span!(
            "dispatch",
            stream_id = %$stream_id,
            backend = %$backend,
            model = %$model,
            otel.kind = "internal"
        )
    };
}

/// Create a span for provider communication
#[macro_export]
macro_rules! provider_span {
    ($backend:expr, $operation:expr) => {
        tracing::info_span!(
            "provider_call",
            backend = %$backend,
            operation = %$operation,
            otel.kind = "client"
        )
    };
}
