//! Configuration errors.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Reading the file failed
    #[error("Failed to read config file {path}: {source}")]
    Io {
        /// File that could not be read
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The file extension is not a known format
    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(String),

    /// The file could not be parsed
    #[error("Failed to parse {format} config: {message}")]
    Parse {
        /// Format being parsed
        format: &'static str,
        /// Parser message
        message: String,
    },

    /// An environment override had a bad value
    #[error("Invalid value for {var}: {message}")]
    EnvOverride {
        /// Variable name
        var: String,
        /// What was wrong
        message: String,
    },

    /// Field-level validation failed
    #[error("Config validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),

    /// Cross-field rule violated
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for dispatch_core::DispatchError {
    fn from(err: ConfigError) -> Self {
        Self::configuration(err.to_string())
    }
}
