//! Request fingerprinting.
//!
//! A fingerprint is the lowercase hex SHA-256 of a canonical JSON rendering
//! of everything that influences the response: the resolved backend and
//! model, sampling options and the ordered messages.

use dispatch_core::{Backend, ChatMessage, Fingerprint, MessageRole};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Semantic content of a request after backend and model resolution
#[derive(Debug, Clone, Copy)]
pub struct FingerprintInput<'a> {
    /// Ordered conversation
    pub messages: &'a [ChatMessage],
    /// Sampling temperature
    pub temperature: Option<f64>,
    /// Maximum tokens
    pub max_tokens: Option<u32>,
    /// Resolved backend
    pub backend: Backend,
    /// Resolved model
    pub model: &'a str,
}

#[derive(Serialize)]
struct Canonical<'a> {
    v: u8,
    backend: &'static str,
    model: &'a str,
    temperature: Option<String>,
    max_tokens: Option<u32>,
    messages: Vec<CanonicalMessage<'a>>,
}

#[derive(Serialize)]
struct CanonicalMessage<'a> {
    role: MessageRole,
    content: &'a str,
}

/// Compute the fingerprint of a request
#[must_use]
pub fn fingerprint(input: &FingerprintInput<'_>) -> Fingerprint {
    let canonical = Canonical {
        v: 1,
        backend: input.backend.as_str(),
        model: input.model,
        temperature: input.temperature.map(|t| format!("{t:.4}")),
        max_tokens: input.max_tokens,
        messages: input
            .messages
            .iter()
            .map(|m| CanonicalMessage {
                role: m.role,
                content: &m.content,
            })
            .collect(),
    };

    // Plain structs of strings and integers always serialize
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    Fingerprint::from_digest(hex::encode(Sha256::digest(&bytes)))
}
