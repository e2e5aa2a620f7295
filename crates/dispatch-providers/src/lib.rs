//! # Dispatch Providers
//!
//! Thin HTTP adapters implementing [`dispatch_core::ProviderAdapter`]:
//! - OpenAI chat completions (SSE)
//! - Anthropic messages (SSE)
//! - Google Gemini `streamGenerateContent` (SSE)
//! - Ollama `/api/chat` (newline-delimited JSON)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod anthropic;
pub mod gemini;
pub mod http;
pub mod ollama;
pub mod openai;
pub mod registry;
pub mod sse;

pub use anthropic::AnthropicAdapter;
pub use gemini::GeminiAdapter;
pub use http::AdapterConfig;
pub use ollama::OllamaAdapter;
pub use openai::OpenAIAdapter;
pub use registry::ProviderRegistry;
