//! CLI argument definitions using clap.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dispatch_config::{ConfigLoader, ConfigResult, DispatcherConfig, TelemetrySettings};
use dispatch_telemetry::{init_tracing, shutdown_tracing, TracingConfig};
use std::path::PathBuf;

use crate::commands;
use crate::output::OutputFormat;

/// LLM Dispatcher - route prompts to OpenAI, Anthropic, Gemini or Ollama
#[derive(Parser, Debug)]
#[command(name = "llm-dispatcher")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, env = "LLM_DISPATCH_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send a prompt and stream the reply
    Chat(commands::chat::ChatArgs),

    /// List the models each backend offers
    Models(commands::models::ModelsArgs),

    /// Probe backend connectivity
    Test(commands::test::TestArgs),

    /// Load and validate the configuration
    #[command(name = "check-config")]
    CheckConfig(commands::check_config::CheckConfigArgs),
}

impl Cli {
    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        let format = OutputFormat::from_json_flag(self.json);
        let loaded = self.loader().load().await;

        let telemetry = loaded
            .as_ref()
            .map(|c| c.telemetry.clone())
            .unwrap_or_default();
        let provider = init_tracing(&self.tracing_config(&telemetry))
            .context("Failed to initialize tracing")?;

        let result = run(self.command, loaded, format).await;
        shutdown_tracing(provider);
        result
    }

    fn loader(&self) -> ConfigLoader {
        match &self.config {
            Some(path) => ConfigLoader::new().with_path(path),
            None => ConfigLoader::new(),
        }
    }

    /// Logging follows the config file, except that the console stays quiet
    /// unless `-v` is given.
    fn tracing_config(&self, telemetry: &TelemetrySettings) -> TracingConfig {
        let level = match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        TracingConfig::new(telemetry.service_name.clone())
            .with_json(telemetry.json_logs)
            .with_otel(telemetry.otel_enabled)
            .with_sampling_rate(telemetry.sampling_rate)
            .with_log_level(level)
    }
}

async fn run(
    command: Commands,
    loaded: ConfigResult<DispatcherConfig>,
    format: OutputFormat,
) -> Result<()> {
    match command {
        Commands::CheckConfig(args) => commands::check_config::execute(&args, loaded, format),
        Commands::Chat(args) => commands::chat::execute(args, require(loaded)?, format).await,
        Commands::Models(args) => commands::models::execute(&args, require(loaded)?, format).await,
        Commands::Test(args) => commands::test::execute(&args, require(loaded)?, format).await,
    }
}

fn require(loaded: ConfigResult<DispatcherConfig>) -> Result<DispatcherConfig> {
    loaded.context("Failed to load configuration")
}
