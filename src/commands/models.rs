//! Models command - list the models each backend offers.

use anyhow::Result;
use clap::Args;
use dispatch_config::DispatcherConfig;
use dispatch_core::Backend;
use std::collections::BTreeMap;

use crate::output::{self, OutputFormat};

/// Arguments for the models command.
#[derive(Args, Debug)]
pub struct ModelsArgs {
    /// Only query this backend
    #[arg(short, long)]
    pub backend: Option<Backend>,
}

/// Execute the models command.
pub async fn execute(args: &ModelsArgs, config: DispatcherConfig, format: OutputFormat) -> Result<()> {
    let dispatcher = super::dispatcher(config)?;

    let models: BTreeMap<Backend, Vec<String>> = match args.backend {
        Some(backend) => {
            let models = dispatcher.refresh_models(backend).await?;
            BTreeMap::from([(backend, models)])
        }
        None => dispatcher.refresh_all_models().await,
    };
    dispatcher.shutdown();

    if format.is_json() {
        return output::json(&models);
    }
    for (backend, names) in &models {
        output::section(backend.as_str());
        if names.is_empty() {
            println!("  (no models)");
        }
        for name in names {
            println!("  {name}");
        }
    }
    Ok(())
}
