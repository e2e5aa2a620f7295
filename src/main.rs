//! # LLM Dispatcher
//!
//! Command-line front end for the multi-provider request dispatcher.
//!
//! ## Usage
//!
//! ```bash
//! # Stream a completion from the default backend
//! llm-dispatcher chat "Why is the sky blue?"
//!
//! # Pick a backend and model, then print the metrics
//! llm-dispatcher chat --backend openai --model gpt-4o "Hello" --metrics
//!
//! # List models and probe every configured backend
//! llm-dispatcher models
//! llm-dispatcher test
//!
//! # Validate a configuration file
//! llm-dispatcher --config dispatcher.yaml check-config
//! ```

use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;
mod output;

use cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    // API keys usually live in .env during development
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    cli.execute().await
}
