//! Request validation and content sanitization.
//!
//! Runs before any I/O. A request either comes out as an immutable
//! [`ValidatedRequest`] or is rejected with `DispatchError::Validation`.

use dispatch_config::ValidationSettings;
use dispatch_core::{
    CancellationToken, ChatMessage, CompletionRequest, DispatchError, DispatchResult,
    RequestOptions,
};
use once_cell::sync::Lazy;
use regex::Regex;

/// Three or more consecutive blank (or whitespace-only) lines
#[allow(clippy::expect_used)]
static BLANK_RUNS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n(?:[ \t]*\n){3,}").expect("valid regex"));

const TEMPERATURE_RANGE: std::ops::RangeInclusive<f64> = 0.0..=2.0;

/// Characters stripped regardless of category
fn is_invisible(c: char) -> bool {
    matches!(
        c,
        // zero-width space, non-joiner, joiner, word joiner, BOM
        '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}'
        // directional marks, embeddings, overrides and isolates
        | '\u{200E}' | '\u{200F}' | '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}'
    )
}

/// Normalize message content.
///
/// Line endings become `\n`, control characters other than `\n` and `\t`
/// are removed along with zero-width and bidirectional formatting
/// characters, and long runs of blank lines collapse to a single blank line.
#[must_use]
pub fn sanitize(content: &str) -> String {
    let normalized = content.replace("\r\n", "\n").replace('\r', "\n");
    let stripped: String = normalized
        .chars()
        .filter(|&c| c == '\n' || c == '\t' || !(c.is_control() || is_invisible(c)))
        .collect();
    BLANK_RUNS.replace_all(&stripped, "\n\n").into_owned()
}

/// A request that passed validation
#[derive(Debug, Clone)]
pub struct ValidatedRequest {
    messages: Vec<ChatMessage>,
    options: RequestOptions,
    cancellation: Option<CancellationToken>,
}

impl ValidatedRequest {
    /// Sanitized conversation
    #[must_use]
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Options as submitted
    #[must_use]
    pub fn options(&self) -> &RequestOptions {
        &self.options
    }

    /// Caller cancellation token
    #[must_use]
    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancellation.as_ref()
    }

    /// Split into parts
    #[must_use]
    pub fn into_parts(self) -> (Vec<ChatMessage>, RequestOptions, Option<CancellationToken>) {
        (self.messages, self.options, self.cancellation)
    }
}

/// Checks requests against the configured limits
#[derive(Debug, Clone)]
pub struct RequestValidator {
    max_message_chars: usize,
    max_total_chars: usize,
    max_tokens_cap: u32,
}

impl RequestValidator {
    /// Create a validator
    #[must_use]
    pub fn new(settings: &ValidationSettings) -> Self {
        Self {
            max_message_chars: settings.max_message_chars,
            max_total_chars: settings.max_total_chars,
            max_tokens_cap: settings.max_tokens_cap,
        }
    }

    /// Sanitize and validate a request
    ///
    /// # Errors
    /// Returns `DispatchError::Validation` naming the offending field
    pub fn validate(&self, request: CompletionRequest) -> DispatchResult<ValidatedRequest> {
        let CompletionRequest {
            messages,
            options,
            cancellation,
        } = request;

        if messages.is_empty() {
            return Err(DispatchError::validation(
                "messages",
                "at least one message is required",
            ));
        }

        let mut total = 0usize;
        let mut sanitized = Vec::with_capacity(messages.len());
        for (i, message) in messages.into_iter().enumerate() {
            let content = sanitize(&message.content);
            if content.trim().is_empty() {
                return Err(DispatchError::validation(
                    format!("messages[{i}].content"),
                    "content must not be empty",
                ));
            }
            let chars = content.chars().count();
            if chars > self.max_message_chars {
                return Err(DispatchError::validation(
                    format!("messages[{i}].content"),
                    format!(
                        "content is {chars} characters, limit is {}",
                        self.max_message_chars
                    ),
                ));
            }
            total += chars;
            sanitized.push(ChatMessage::new(message.role, content));
        }
        if total > self.max_total_chars {
            return Err(DispatchError::validation(
                "messages",
                format!(
                    "conversation is {total} characters, limit is {}",
                    self.max_total_chars
                ),
            ));
        }

        self.check_options(&options)?;

        Ok(ValidatedRequest {
            messages: sanitized,
            options,
            cancellation,
        })
    }

    fn check_options(&self, options: &RequestOptions) -> DispatchResult<()> {
        if let Some(t) = options.temperature {
            if !t.is_finite() || !TEMPERATURE_RANGE.contains(&t) {
                return Err(DispatchError::validation(
                    "options.temperature",
                    format!("temperature must be between 0 and 2, got {t}"),
                ));
            }
        }
        if let Some(max_tokens) = options.max_tokens {
            if max_tokens == 0 || max_tokens > self.max_tokens_cap {
                return Err(DispatchError::validation(
                    "options.max_tokens",
                    format!(
                        "max_tokens must be between 1 and {}, got {max_tokens}",
                        self.max_tokens_cap
                    ),
                ));
            }
        }
        if options
            .model_override
            .as_deref()
            .is_some_and(|m| m.trim().is_empty())
        {
            return Err(DispatchError::validation(
                "options.model_override",
                "model must not be empty",
            ));
        }
        Ok(())
    }
}
