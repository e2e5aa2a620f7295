//! Streamed response bodies.
//!
//! Server-sent events go through [`reqwest_eventsource`], which handles
//! event framing and UTF-8 across body chunks. Ollama's newline-delimited
//! JSON is split here with [`LineDecoder`].

use crate::http::{status_error, transport_error};
use async_stream::try_stream;
use dispatch_core::{Backend, CancellationToken, ChunkStream, DispatchError, DispatchResult};
use futures::StreamExt;
use reqwest_eventsource::retry::Never;
use eventsource_stream::Event as MessageEvent;
use reqwest_eventsource::{Error as EventSourceError, Event, EventSource};
use tracing::{trace, warn};

/// What a parsed frame contributes to the response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delta {
    /// Response text
    Text(String),
    /// Nothing to forward
    Skip,
    /// The response is complete
    Done,
}

/// Start an event stream and wait for the response headers.
///
/// Status and content-type failures surface here rather than on the first
/// chunk. The source never reconnects: retries belong to the dispatcher.
pub(crate) async fn open_events(
    backend: Backend,
    request: reqwest::RequestBuilder,
) -> DispatchResult<EventSource> {
    let mut source = EventSource::new(request).map_err(|e| {
        DispatchError::internal(format!("Failed to create event source for {backend}: {e}"))
    })?;
    source.set_retry_policy(Box::new(Never));

    match source.next().await {
        Some(Ok(Event::Open)) => {
            trace!(backend = %backend, "Event stream opened");
            Ok(source)
        }
        Some(Ok(Event::Message(_))) => {
            source.close();
            Err(DispatchError::internal("Event received before the stream opened"))
        }
        Some(Err(error)) => {
            source.close();
            Err(event_error(backend, error).await)
        }
        None => Err(DispatchError::backend(
            backend,
            "Event stream closed before opening",
            None,
            true,
        )),
    }
}

/// Map an event source failure
async fn event_error(backend: Backend, error: EventSourceError) -> DispatchError {
    match error {
        EventSourceError::InvalidStatusCode(status, response) => {
            let body = response.text().await.unwrap_or_default();
            status_error(backend, status.as_u16(), &body)
        }
        EventSourceError::Transport(e) => transport_error(backend, &e),
        EventSourceError::InvalidContentType(content_type, _) => DispatchError::backend(
            backend,
            format!(
                "Expected an event stream, got {}",
                content_type.to_str().unwrap_or("a non-text content type")
            ),
            None,
            false,
        ),
        other => {
            warn!(backend = %backend, error = %other, "Event stream error");
            DispatchError::backend(backend, format!("Stream error: {other}"), None, false)
        }
    }
}

/// Turn an opened event source into a chunk stream.
///
/// The cancellation token is raced against every event. Dropping the
/// returned stream drops the source and releases the connection.
pub(crate) fn event_stream<F>(
    backend: Backend,
    mut source: EventSource,
    cancel: CancellationToken,
    mut parse: F,
) -> ChunkStream
where
    F: FnMut(MessageEvent) -> DispatchResult<Delta> + Send + 'static,
{
    let stream = try_stream! {
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => Err(DispatchError::cancelled("stream cancelled")),
                next = source.next() => Ok(next),
            };
            let next = match next {
                Ok(next) => next,
                Err(cancelled) => {
                    source.close();
                    Err(cancelled)?
                }
            };

            match next {
                Some(Ok(Event::Open)) => {}
                Some(Ok(Event::Message(message))) => match parse(message)? {
                    Delta::Text(text) if !text.is_empty() => yield text,
                    Delta::Done => break,
                    _ => {}
                },
                Some(Err(EventSourceError::StreamEnded)) | None => break,
                Some(Err(error)) => {
                    source.close();
                    Err(event_error(backend, error).await)?
                }
            }
        }
        source.close();
    };
    Box::pin(stream)
}

/// Newline-delimited JSON decoder. Blank lines are skipped.
///
/// Raw bytes are buffered until a newline so multi-byte characters split
/// across chunks are never mangled.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    /// Feed bytes, returning every line completed by them
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    /// Flush the trailing line once the body ends
    pub fn finish(&mut self) -> Vec<String> {
        let raw = std::mem::take(&mut self.buffer);
        let line = String::from_utf8_lossy(&raw).trim().to_string();
        if line.is_empty() {
            Vec::new()
        } else {
            vec![line]
        }
    }
}

/// Turn a newline-delimited JSON response into a chunk stream.
///
/// The cancellation token is checked before every body read.
pub(crate) fn ndjson_stream<F>(
    backend: Backend,
    response: reqwest::Response,
    cancel: CancellationToken,
    mut parse: F,
) -> ChunkStream
where
    F: FnMut(String) -> DispatchResult<Delta> + Send + 'static,
{
    let stream = try_stream! {
        let mut decoder = LineDecoder::default();
        let mut body = response.bytes_stream();
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => Some(Err(DispatchError::cancelled("stream cancelled"))),
                next = body.next() => next.map(|r| r.map_err(|e| transport_error(backend, &e))),
            };
            let (lines, ended) = match next {
                Some(bytes) => (decoder.push(&bytes?), false),
                None => (decoder.finish(), true),
            };
            for line in lines {
                match parse(line)? {
                    Delta::Text(text) if !text.is_empty() => yield text,
                    Delta::Done => return,
                    _ => {}
                }
            }
            if ended {
                break;
            }
        }
    };
    Box::pin(stream)
}
