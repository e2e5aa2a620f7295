//! Shared HTTP plumbing for the adapters.

use dispatch_core::{Backend, DispatchError, DispatchResult};
use reqwest::Client;
use secrecy::SecretString;
use serde::Deserialize;
use std::time::Duration;

/// Connection settings for one adapter
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// API root. The adapter's public endpoint when unset.
    pub base_url: Option<String>,
    /// API key
    pub api_key: Option<SecretString>,
    /// TCP connect timeout
    pub connect_timeout: Duration,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl AdapterConfig {
    /// Config pointing at `base_url`
    #[must_use]
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: Some(base_url.into()),
            ..Self::default()
        }
    }

    /// Set the API key
    #[must_use]
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(SecretString::new(key.into()));
        self
    }

    pub(crate) fn resolved_base_url(&self, default: &str) -> String {
        self.base_url
            .as_deref()
            .unwrap_or(default)
            .trim_end_matches('/')
            .to_string()
    }

    /// Build the HTTP client.
    ///
    /// No overall timeout is set: bodies stream for as long as the backend
    /// produces tokens and the dispatcher bounds the request as a whole.
    pub(crate) fn client(&self, backend: Backend) -> DispatchResult<Client> {
        Client::builder()
            .connect_timeout(self.connect_timeout)
            .pool_max_idle_per_host(16)
            .build()
            .map_err(|e| {
                DispatchError::configuration(format!("Failed to create HTTP client for {backend}: {e}"))
            })
    }
}

/// Map a non-success response to an error.
///
/// Request timeouts, throttling and server errors are marked retryable.
pub(crate) fn status_error(backend: Backend, status: u16, body: &str) -> DispatchError {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ErrorBody {
        Nested { error: ErrorDetail },
        Flat { error: String },
    }

    #[derive(Deserialize)]
    struct ErrorDetail {
        message: String,
    }

    let message = match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody::Nested { error }) => error.message,
        Ok(ErrorBody::Flat { error }) => error,
        Err(_) if body.trim().is_empty() => format!("HTTP {status}"),
        Err(_) => format!("HTTP {status}: {}", body.trim()),
    };
    let retryable = matches!(status, 408 | 429 | 500..=599);
    DispatchError::backend(backend, message, Some(status), retryable)
}

/// Map a transport failure. Connect failures and timeouts are retryable.
pub(crate) fn transport_error(backend: Backend, error: &reqwest::Error) -> DispatchError {
    let retryable = error.is_timeout() || error.is_connect();
    DispatchError::backend(
        backend,
        format!("Request failed: {error}"),
        error.status().map(|s| s.as_u16()),
        retryable,
    )
}

/// Map a malformed payload
pub(crate) fn decode_error(backend: Backend, error: &serde_json::Error) -> DispatchError {
    DispatchError::backend(backend, format!("Invalid response JSON: {error}"), None, false)
}

/// Send a request and turn non-success statuses into errors
pub(crate) async fn send(
    backend: Backend,
    request: reqwest::RequestBuilder,
) -> DispatchResult<reqwest::Response> {
    let response = request
        .send()
        .await
        .map_err(|e| transport_error(backend, &e))?;
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(status_error(backend, status.as_u16(), &body))
    }
}

/// Fetch and decode a JSON document
pub(crate) async fn get_json<T: serde::de::DeserializeOwned>(
    backend: Backend,
    request: reqwest::RequestBuilder,
) -> DispatchResult<T> {
    let body = send(backend, request)
        .await?
        .text()
        .await
        .map_err(|e| transport_error(backend, &e))?;
    serde_json::from_str(&body).map_err(|e| decode_error(backend, &e))
}
