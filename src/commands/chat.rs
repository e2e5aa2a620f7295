//! Chat command - send one prompt and stream the reply.

use anyhow::{bail, Result};
use clap::Args;
use dispatch_config::DispatcherConfig;
use dispatch_core::{Backend, CompletionRequest};
use futures::StreamExt;
use std::io::{self, Read};

use crate::output::{self, OutputFormat};

/// Arguments for the chat command.
#[derive(Args, Debug)]
pub struct ChatArgs {
    /// Prompt to send (if not provided, reads from stdin)
    pub prompt: Option<String>,

    /// System prompt
    #[arg(short, long)]
    pub system: Option<String>,

    /// Backend to route to
    #[arg(short, long)]
    pub backend: Option<Backend>,

    /// Model to use
    #[arg(short = 'M', long)]
    pub model: Option<String>,

    /// Temperature (0.0 to 2.0)
    #[arg(short, long)]
    pub temperature: Option<f64>,

    /// Maximum tokens to generate
    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// Queue priority when the backend is rate limited
    #[arg(long, default_value_t = 0)]
    pub priority: i32,

    /// Print dispatcher metrics afterwards
    #[arg(long)]
    pub metrics: bool,
}

/// Execute the chat command.
pub async fn execute(args: ChatArgs, config: DispatcherConfig, format: OutputFormat) -> Result<()> {
    let prompt = match args.prompt.clone() {
        Some(prompt) => prompt,
        None => {
            let mut input = String::new();
            io::stdin().read_to_string(&mut input)?;
            input
        }
    };
    if prompt.trim().is_empty() {
        bail!("No prompt provided");
    }

    let dispatcher = super::dispatcher(config)?;
    let request = build_request(&args, prompt);
    let mut stream = dispatcher.stream(request)?;

    let mut failed = None;
    loop {
        let item = tokio::select! {
            item = stream.next() => item,
            _ = tokio::signal::ctrl_c() => {
                stream.cancel();
                continue;
            }
        };
        match item {
            Some(Ok(chunk)) => {
                if !format.is_json() {
                    output::stream_text(&chunk);
                }
            }
            Some(Err(e)) => {
                failed = Some(e);
                break;
            }
            None => break,
        }
    }

    if format.is_json() {
        match (stream.completion(), &failed) {
            (Some(completion), _) => output::json(completion)?,
            (None, Some(e)) => output::json(&serde_json::json!({
                "error": e.to_string(),
                "kind": e.kind(),
            }))?,
            (None, None) => {}
        }
    } else {
        output::stream_newline();
    }

    if args.metrics {
        print_metrics(&dispatcher, format)?;
    }
    dispatcher.shutdown();

    match failed {
        Some(e) if e.is_cancelled() => {
            output::warning("Cancelled");
            Ok(())
        }
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

fn build_request(args: &ChatArgs, prompt: String) -> CompletionRequest {
    let mut builder = CompletionRequest::builder().priority(args.priority);
    if let Some(system) = &args.system {
        builder = builder.system(system.clone());
    }
    builder = builder.user(prompt);
    if let Some(backend) = args.backend {
        builder = builder.backend(backend);
    }
    if let Some(model) = &args.model {
        builder = builder.model(model.clone());
    }
    if let Some(temperature) = args.temperature {
        builder = builder.temperature(temperature);
    }
    if let Some(max_tokens) = args.max_tokens {
        builder = builder.max_tokens(max_tokens);
    }
    builder.build()
}

fn print_metrics(dispatcher: &dispatch_engine::Dispatcher, format: OutputFormat) -> Result<()> {
    if format.is_json() {
        return output::json(&dispatcher.metrics());
    }

    let metrics = dispatcher.metrics();
    output::section("Metrics");
    output::key_value("Requests", metrics.requests);
    output::key_value("Successes", metrics.successes);
    output::key_value("Failures", metrics.failures);
    output::key_value("Retries", metrics.retries);
    output::key_value("Cache hits", metrics.cache_hits);
    output::key_value(
        "Average latency",
        &format!("{:.1} ms", metrics.average_latency_ms),
    );
    Ok(())
}
