//! Backend and model resolution.

use arc_swap::ArcSwapOption;
use dispatch_config::DispatcherConfig;
use dispatch_core::{Backend, RequestOptions};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Backend and model chosen by the user for subsequent requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelSelection {
    /// Selected backend
    pub backend: Backend,
    /// Selected model, `None` for the backend default
    pub model: Option<String>,
}

/// Where a request will run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Backend
    pub backend: Backend,
    /// Model identifier
    pub model: String,
}

/// Resolves the target of each request.
///
/// Precedence for the backend: request override, current selection,
/// configured default. The model follows the request override, then the
/// selection when it names the same backend, then the backend default.
#[derive(Debug)]
pub struct ModelSelector {
    default_backend: Backend,
    default_models: Vec<(Backend, String)>,
    selected: ArcSwapOption<ModelSelection>,
}

impl ModelSelector {
    /// Create a selector from configuration
    #[must_use]
    pub fn new(config: &DispatcherConfig) -> Self {
        Self {
            default_backend: config.default_backend,
            default_models: Backend::ALL
                .iter()
                .map(|b| (*b, config.default_model(*b)))
                .collect(),
            selected: ArcSwapOption::empty(),
        }
    }

    /// Select a backend and optionally a model for later requests
    pub fn select(&self, backend: Backend, model: Option<String>) {
        info!(backend = %backend, model = ?model, "Model selected");
        self.selected
            .store(Some(Arc::new(ModelSelection { backend, model })));
    }

    /// Return to the configured default
    pub fn clear(&self) {
        self.selected.store(None);
    }

    /// Current selection
    #[must_use]
    pub fn selected(&self) -> Option<ModelSelection> {
        self.selected.load_full().map(|s| (*s).clone())
    }

    /// Resolve the target for a request
    #[must_use]
    pub fn resolve(&self, options: &RequestOptions) -> Target {
        let selection = self.selected.load_full();
        let backend = options
            .backend_override
            .or_else(|| selection.as_ref().map(|s| s.backend))
            .unwrap_or(self.default_backend);

        let model = options
            .model_override
            .clone()
            .or_else(|| {
                selection
                    .as_ref()
                    .filter(|s| s.backend == backend)
                    .and_then(|s| s.model.clone())
            })
            .unwrap_or_else(|| self.default_model(backend));

        Target { backend, model }
    }

    fn default_model(&self, backend: Backend) -> String {
        self.default_models
            .iter()
            .find(|(b, _)| *b == backend)
            .map_or_else(|| backend.default_model().to_string(), |(_, m)| m.clone())
    }
}
