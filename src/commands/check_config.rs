//! Check-config command - load and validate the configuration.

use anyhow::Result;
use clap::Args;
use dispatch_config::{ConfigResult, DispatcherConfig};
use dispatch_core::Backend;

use crate::output::{self, OutputFormat};

/// Arguments for the check-config command.
#[derive(Args, Debug)]
pub struct CheckConfigArgs {
    /// Print the effective configuration
    #[arg(long)]
    pub show: bool,
}

/// Execute the check-config command.
pub fn execute(
    args: &CheckConfigArgs,
    loaded: ConfigResult<DispatcherConfig>,
    format: OutputFormat,
) -> Result<()> {
    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            if format.is_json() {
                output::json(&serde_json::json!({ "valid": false, "error": e.to_string() }))?;
            } else {
                output::error(format!("Invalid configuration: {e}"));
            }
            return Err(e.into());
        }
    };

    if format.is_json() {
        return if args.show {
            output::json(&serde_json::json!({ "valid": true, "config": config }))
        } else {
            output::json(&serde_json::json!({ "valid": true }))
        };
    }

    output::success("Configuration is valid");
    output::key_value("Default backend", config.default_backend.as_str());
    let enabled: Vec<&str> = Backend::ALL
        .iter()
        .filter(|b| config.provider(**b).map_or(true, |p| p.enabled))
        .map(Backend::as_str)
        .collect();
    output::key_value("Enabled backends", &enabled.join(", "));
    output::key_value("Max retries", config.retry.max_retries);
    output::key_value("Request timeout", &format!("{:?}", config.timeouts.request));
    output::key_value(
        "Cache",
        &if config.cache.enabled {
            format!("{} entries, ttl {:?}", config.cache.capacity, config.cache.ttl)
        } else {
            "disabled".to_string()
        },
    );

    if args.show {
        output::section("Effective configuration");
        output::json(&config)?;
    }
    Ok(())
}
