//! Terminal rendering for the dispatcher CLI.
//!
//! Results go to stdout and diagnostics to stderr, so piping `chat` captures
//! only the reply.

use colored::{Color, Colorize};
use serde::Serialize;
use std::fmt::Display;
use std::io::Write;

/// How command results are rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Colored, aligned text
    Human,
    /// Pretty-printed JSON documents
    Json,
}

impl OutputFormat {
    /// `--json` selects JSON, otherwise human output
    pub const fn from_json_flag(json: bool) -> Self {
        if json {
            Self::Json
        } else {
            Self::Human
        }
    }

    /// Whether results should be printed as JSON
    pub const fn is_json(self) -> bool {
        matches!(self, Self::Json)
    }
}

/// Width of the key column in [`key_value`]
const KEY_WIDTH: usize = 18;

fn tag(label: &str, color: Color) -> colored::ColoredString {
    format!("[{label}]").color(color).bold()
}

pub fn success(message: impl Display) {
    println!("{} {message}", tag("ok", Color::Green));
}

pub fn warning(message: impl Display) {
    eprintln!("{} {message}", tag("warn", Color::Yellow));
}

pub fn error(message: impl Display) {
    eprintln!("{} {message}", tag("error", Color::Red));
}

/// One aligned `key  value` row
pub fn key_value(key: &str, value: impl Display) {
    let key = format!("{key:<KEY_WIDTH$}");
    println!("  {} {value}", key.dimmed());
}

/// Heading for a group of rows
pub fn section(title: &str) {
    println!();
    println!("{}", title.cyan().bold());
}

/// Reachability row used by `test`
pub fn status(label: &str, ok: bool) {
    let state = if ok {
        format!("{:<5}", "up").green()
    } else {
        format!("{:<5}", "down").red()
    };
    println!("  {state} {label}");
}

pub fn json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a reply chunk as soon as it arrives
pub fn stream_text(chunk: &str) {
    let mut stdout = std::io::stdout().lock();
    let _ = write!(stdout, "{chunk}");
    let _ = stdout.flush();
}

/// Terminate a streamed reply
pub fn stream_newline() {
    println!();
}
