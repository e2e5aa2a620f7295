//! Loading configuration from files and the environment.

use crate::config::{AuditSinkKind, DispatcherConfig};
use crate::error::{ConfigError, ConfigResult};
use dispatch_core::Backend;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "LLM_DISPATCH_";

/// Variable naming a config file when none is passed explicitly
pub const CONFIG_PATH_ENV: &str = "LLM_DISPATCH_CONFIG";

#[allow(clippy::expect_used)]
static ENV_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex"));

/// Supported file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// YAML (`.yaml`, `.yml`)
    Yaml,
    /// TOML (`.toml`)
    Toml,
    /// JSON (`.json`)
    Json,
}

impl ConfigFormat {
    /// Pick a format from a file extension
    pub fn from_path(path: &Path) -> ConfigResult<Self> {
        match path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase) {
            Some(ext) if ext == "yaml" || ext == "yml" => Ok(Self::Yaml),
            Some(ext) if ext == "toml" => Ok(Self::Toml),
            Some(ext) if ext == "json" => Ok(Self::Json),
            other => Err(ConfigError::UnsupportedFormat(
                other.unwrap_or_else(|| "<none>".to_string()),
            )),
        }
    }

    const fn name(self) -> &'static str {
        match self {
            Self::Yaml => "yaml",
            Self::Toml => "toml",
            Self::Json => "json",
        }
    }
}

/// Builds a [`DispatcherConfig`] from a file, the environment and defaults
pub struct ConfigLoader {
    path: Option<PathBuf>,
    env: Box<dyn Fn(&str) -> Option<String> + Send + Sync>,
}

impl std::fmt::Debug for ConfigLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigLoader").field("path", &self.path).finish()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Loader reading the process environment
    #[must_use]
    pub fn new() -> Self {
        Self {
            path: None,
            env: Box::new(|name| std::env::var(name).ok()),
        }
    }

    /// Read this file instead of `LLM_DISPATCH_CONFIG`
    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Replace the environment lookup
    #[must_use]
    pub fn with_env<F>(mut self, env: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env = Box::new(env);
        self
    }

    /// Load, override and validate.
    pub async fn load(&self) -> ConfigResult<DispatcherConfig> {
        let path = self
            .path
            .clone()
            .or_else(|| (self.env)(CONFIG_PATH_ENV).map(PathBuf::from));

        let mut config = match path {
            Some(path) => {
                let raw = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|source| ConfigError::Io {
                        path: path.clone(),
                        source,
                    })?;
                let config = self.parse(&raw, ConfigFormat::from_path(&path)?)?;
                info!(path = %path.display(), "Loaded configuration file");
                config
            }
            None => {
                debug!("No configuration file given, using defaults");
                DispatcherConfig::default()
            }
        };

        self.apply_env_overrides(&mut config)?;
        config.check()?;
        Ok(config)
    }

    /// Parse configuration text after expanding `${VAR}` references.
    pub fn parse(&self, raw: &str, format: ConfigFormat) -> ConfigResult<DispatcherConfig> {
        let expanded = self.expand_env_refs(raw);
        let parse_err = |message: String| ConfigError::Parse {
            format: format.name(),
            message,
        };
        match format {
            ConfigFormat::Yaml => {
                serde_yaml::from_str(&expanded).map_err(|e| parse_err(e.to_string()))
            }
            ConfigFormat::Toml => toml::from_str(&expanded).map_err(|e| parse_err(e.to_string())),
            ConfigFormat::Json => {
                serde_json::from_str(&expanded).map_err(|e| parse_err(e.to_string()))
            }
        }
    }

    fn expand_env_refs(&self, raw: &str) -> String {
        ENV_REF
            .replace_all(raw, |caps: &regex::Captures<'_>| {
                let name = &caps[1];
                (self.env)(name).unwrap_or_else(|| {
                    warn!(variable = %name, "Referenced environment variable is not set");
                    String::new()
                })
            })
            .into_owned()
    }

    /// Apply `LLM_DISPATCH_*` overrides.
    pub fn apply_env_overrides(&self, config: &mut DispatcherConfig) -> ConfigResult<()> {
        if let Some(value) = self.var("DEFAULT_BACKEND") {
            config.default_backend = parse_backend("DEFAULT_BACKEND", &value)?;
        }
        if let Some(value) = self.var("LOG_LEVEL") {
            config.telemetry.log_level = value;
        }
        if let Some(value) = self.var("JSON_LOGS") {
            config.telemetry.json_logs = parse_bool("JSON_LOGS", &value)?;
        }
        if let Some(value) = self.var("REQUEST_TIMEOUT") {
            config.timeouts.request = parse_duration("REQUEST_TIMEOUT", &value)?;
        }
        if let Some(value) = self.var("CACHE_ENABLED") {
            config.cache.enabled = parse_bool("CACHE_ENABLED", &value)?;
        }
        if let Some(value) = self.var("CACHE_TTL") {
            config.cache.ttl = parse_duration("CACHE_TTL", &value)?;
        }
        if let Some(value) = self.var("DEDUP_ENABLED") {
            config.dedup.enabled = parse_bool("DEDUP_ENABLED", &value)?;
        }
        if let Some(value) = self.var("AUDIT_PATH") {
            config.audit.path = Some(PathBuf::from(value));
            config.audit.sink = AuditSinkKind::Jsonl;
        }

        for backend in Backend::ALL {
            let upper = backend.as_str().to_ascii_uppercase();
            let base_url = self.var(&format!("{upper}_BASE_URL"));
            let model = self.var(&format!("{upper}_MODEL"));
            if base_url.is_none() && model.is_none() {
                continue;
            }
            let provider = config.providers.entry(backend).or_default();
            if base_url.is_some() {
                provider.base_url = base_url;
            }
            if model.is_some() {
                provider.default_model = model;
            }
        }
        Ok(())
    }

    fn var(&self, suffix: &str) -> Option<String> {
        (self.env)(&format!("{ENV_PREFIX}{suffix}")).filter(|v| !v.is_empty())
    }
}

fn env_error(suffix: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::EnvOverride {
        var: format!("{ENV_PREFIX}{suffix}"),
        message: message.into(),
    }
}

fn parse_backend(suffix: &str, value: &str) -> ConfigResult<Backend> {
    value
        .parse::<Backend>()
        .map_err(|e| env_error(suffix, e))
}

fn parse_bool(suffix: &str, value: &str) -> ConfigResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(env_error(suffix, format!("expected a boolean, got '{other}'"))),
    }
}

fn parse_duration(suffix: &str, value: &str) -> ConfigResult<Duration> {
    humantime_serde::re::humantime::parse_duration(value.trim())
        .map_err(|e| env_error(suffix, e.to_string()))
}
