//! Command implementations.

pub mod chat;
pub mod check_config;
pub mod models;

use anyhow::{Context, Result};
use dispatch_config::DispatcherConfig;
use dispatch_engine::Dispatcher;

/// Build a dispatcher from the loaded configuration.
pub fn dispatcher(config: DispatcherConfig) -> Result<Dispatcher> {
    Dispatcher::from_config(config).context("Failed to start dispatcher")
}
