//! Caller-facing completion stream.

use dispatch_core::{Backend, CancellationToken, DispatchError, DispatchResult, StreamId};
use futures::Stream;
use serde::Serialize;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;

/// Where a completion's text came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionSource {
    /// Generated by the backend for this request
    Backend,
    /// Served from the response cache
    Cache,
    /// Shared from an identical in-flight request
    Deduplicated,
}

impl CompletionSource {
    /// Stable name used in logs and audit records
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Backend => "backend",
            Self::Cache => "cache",
            Self::Deduplicated => "deduplicated",
        }
    }
}

/// A finished completion
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Completion {
    /// Stream that produced it
    pub stream_id: StreamId,
    /// Full response text
    pub text: String,
    /// Backend the request targeted
    pub backend: Backend,
    /// Model the request targeted
    pub model: String,
    /// Origin of the text
    pub source: CompletionSource,
    /// Time from submission to completion
    #[serde(with = "duration_ms")]
    pub latency: Duration,
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

/// Messages from the pipeline task to the stream
#[derive(Debug)]
pub(crate) enum StreamMessage {
    Chunk(String),
    Finished(Completion),
    Failed(DispatchError),
}

/// Stream of text chunks for one request.
///
/// Yields each chunk as it arrives. Ends after the last chunk on success,
/// or after a single `Err` on failure. Dropping the stream before it ends
/// cancels the request.
#[derive(Debug)]
pub struct CompletionStream {
    id: StreamId,
    rx: mpsc::UnboundedReceiver<StreamMessage>,
    token: CancellationToken,
    completion: Option<Completion>,
    done: bool,
}

impl CompletionStream {
    pub(crate) fn new(
        id: StreamId,
        rx: mpsc::UnboundedReceiver<StreamMessage>,
        token: CancellationToken,
    ) -> Self {
        Self {
            id,
            rx,
            token,
            completion: None,
            done: false,
        }
    }

    /// Stream identifier, usable with `Dispatcher::abort_stream`
    #[must_use]
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Cancel the request
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Completion details, available once the stream has ended successfully
    #[must_use]
    pub fn completion(&self) -> Option<&Completion> {
        self.completion.as_ref()
    }

    /// Drain the stream into a [`Completion`]
    ///
    /// # Errors
    /// Returns the error that ended the stream
    pub async fn collect(mut self) -> DispatchResult<Completion> {
        use futures::StreamExt;

        while let Some(item) = self.next().await {
            item?;
        }
        self.completion
            .take()
            .ok_or_else(|| DispatchError::internal("stream ended without a completion"))
    }
}

impl Stream for CompletionStream {
    type Item = DispatchResult<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(StreamMessage::Chunk(text))) => Poll::Ready(Some(Ok(text))),
            Poll::Ready(Some(StreamMessage::Finished(completion))) => {
                self.completion = Some(completion);
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(StreamMessage::Failed(error))) => {
                self.done = true;
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(Some(Err(DispatchError::internal(
                    "request task ended without a result",
                ))))
            }
        }
    }
}

impl Drop for CompletionStream {
    fn drop(&mut self) {
        if !self.done {
            self.token.cancel();
        }
    }
}
