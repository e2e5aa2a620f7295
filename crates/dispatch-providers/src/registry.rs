//! Backend to adapter mapping.

use crate::{AdapterConfig, AnthropicAdapter, GeminiAdapter, OllamaAdapter, OpenAIAdapter};
use dispatch_config::DispatcherConfig;
use dispatch_core::{Backend, DispatchResult, ProviderAdapter};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Adapters by backend
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: BTreeMap<Backend, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build adapters from configuration, reading API keys from the process
    /// environment.
    ///
    /// # Errors
    /// Returns error if an HTTP client cannot be created
    pub fn from_config(config: &DispatcherConfig) -> DispatchResult<Self> {
        Self::from_config_with_env(config, |name| std::env::var(name).ok())
    }

    /// Build adapters from configuration with an explicit environment lookup.
    ///
    /// Disabled backends are skipped, as are hosted backends without an API
    /// key. Requests for a skipped backend fail with `BackendUnavailable`.
    ///
    /// # Errors
    /// Returns error if an HTTP client cannot be created
    pub fn from_config_with_env(
        config: &DispatcherConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> DispatchResult<Self> {
        let mut registry = Self::new();
        for backend in Backend::ALL {
            let settings = config.provider(backend).cloned().unwrap_or_default();
            if !settings.enabled {
                debug!(backend = %backend, "Backend disabled");
                continue;
            }

            let api_key = settings.resolve_api_key(backend, &lookup);
            if api_key.is_none() && !backend.is_local() {
                info!(backend = %backend, "No API key configured, backend not registered");
                continue;
            }

            let adapter_config = AdapterConfig {
                base_url: settings.base_url.clone(),
                api_key,
                connect_timeout: config.timeouts.connect,
            };
            let adapter: Arc<dyn ProviderAdapter> = match backend {
                Backend::OpenAI => Arc::new(OpenAIAdapter::new(adapter_config)?),
                Backend::Anthropic => Arc::new(AnthropicAdapter::new(adapter_config)?),
                Backend::Gemini => Arc::new(GeminiAdapter::new(adapter_config)?),
                Backend::Ollama => Arc::new(OllamaAdapter::new(adapter_config)?),
            };
            registry.register(adapter);
        }
        Ok(registry)
    }

    /// Register an adapter, replacing any previous one for its backend
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        let backend = adapter.backend();
        if self.adapters.insert(backend, adapter).is_some() {
            debug!(backend = %backend, "Replaced provider adapter");
        }
    }

    /// Adapter for a backend
    #[must_use]
    pub fn get(&self, backend: Backend) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&backend).cloned()
    }

    /// Whether an adapter is registered for a backend
    #[must_use]
    pub fn contains(&self, backend: Backend) -> bool {
        self.adapters.contains_key(&backend)
    }

    /// Registered backends in order
    #[must_use]
    pub fn backends(&self) -> Vec<Backend> {
        self.adapters.keys().copied().collect()
    }

    /// Number of registered adapters
    #[must_use]
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    /// Whether no adapter is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("backends", &self.backends())
            .finish()
    }
}
