//! Streaming requests: a request body written in chunks and a response
//! read back as a sequence of events.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use protocol::MsgType;
use tokio::sync::mpsc;

use crate::error::SockError;
use crate::sock::Sock;

/// Event delivered to a [`StreamRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// One response chunk.
    Data(Vec<u8>),
    /// The response is complete. Carries the error when the request failed.
    /// Always the last event.
    Close(Option<SockError>),
}

/// Handle to an in-flight stream request, created by
/// [`Sock::stream_request`].
///
/// The first [`write`](Self::write) sends the request under the operation
/// name; later writes send request parts. An empty chunk ends the request
/// body. Response events are read with [`recv`](Self::recv) or by polling
/// the handle as a `Stream`.
///
/// Dropping the handle forgets the request; any later responses for it
/// are ignored.
#[derive(Debug)]
pub struct StreamRequest {
    sock: Sock,
    id: String,
    op: String,
    started: bool,
    ended: bool,
    closed: bool,
    events: mpsc::UnboundedReceiver<StreamEvent>,
}

impl StreamRequest {
    pub(crate) fn new(sock: Sock, id: String, op: String, events: mpsc::UnboundedReceiver<StreamEvent>) -> Self {
        Self { sock, id, op, started: false, ended: false, closed: false, events }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn op(&self) -> &str {
        &self.op
    }

    /// Whether the request body has been terminated.
    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Write one chunk of the request body. An empty chunk ends the body.
    /// Writes after the end are ignored.
    ///
    /// # Errors
    ///
    /// See [`Sock::send_msg`].
    pub fn write(&mut self, chunk: &[u8]) -> Result<(), SockError> {
        if self.ended {
            return Ok(());
        }
        let result = if self.started {
            self.sock.send_msg(MsgType::StreamRequestPart, Some(&self.id), None, 0, chunk)
        } else {
            self.started = true;
            self.sock.send_msg(MsgType::StreamRequest, Some(&self.id), Some(&self.op), 0, chunk)
        };
        if chunk.is_empty() {
            self.ended = true;
        }
        result
    }

    /// End the request body. Same as writing an empty chunk.
    ///
    /// # Errors
    ///
    /// See [`Sock::send_msg`].
    pub fn end(&mut self) -> Result<(), SockError> {
        self.write(&[])
    }

    /// Next response event. Returns `None` after the `Close` event has been
    /// delivered.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        if self.closed {
            return None;
        }
        let event = self.events.recv().await;
        self.observe(event.as_ref());
        event
    }

    fn observe(&mut self, event: Option<&StreamEvent>) {
        if matches!(event, None | Some(StreamEvent::Close(_))) {
            self.closed = true;
        }
    }
}

impl Stream for StreamRequest {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.closed {
            return Poll::Ready(None);
        }
        let polled = self.events.poll_recv(cx);
        if let Poll::Ready(event) = &polled {
            self.observe(event.as_ref());
        }
        polled
    }
}

impl Drop for StreamRequest {
    fn drop(&mut self) {
        self.events.close();
        self.sock.release_stream(&self.id);
    }
}

#[cfg(test)]
#[path = "stream_test.rs"]
mod tests;
