//! Transports a socket can be attached to.
//!
//! DESIGN
//! ======
//! A transport is a duplex, message-oriented channel: a `Stream` of inbound
//! units plus a `Sink` of outbound ones. Close is in-band on both sides so
//! the socket sees the peer's close status in order with the data that
//! preceded it.
//!
//! - [`WsTransport`] adapts a `tokio-tungstenite` stream.
//! - [`MemoryTransport`] pairs with a [`MemoryPeer`] for in-process use.
//!
//! Opening is behind the [`Connect`] trait so a keepalive controller can
//! reconnect without knowing which transport it is reconnecting.

use std::pin::Pin;
use std::task::{Context, Poll, ready};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{Sink, SinkExt, Stream, StreamExt};
use protocol::Unit;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::error::SockError;

/// Something read from a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Unit(Unit),
    /// The peer closed the channel, with its status when it sent one.
    Close(Option<u16>),
}

/// Something written to a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Unit(Unit),
    /// Close the channel with this status.
    Close(u16),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self(e.to_string())
    }
}

/// A duplex message channel. Implemented for every type with the right
/// `Stream` and `Sink` shape, including `Box<dyn Transport>`.
pub trait Transport:
    Stream<Item = Result<Inbound, TransportError>> + Sink<Outbound, Error = TransportError> + Send + Unpin + 'static
{
}

impl<T> Transport for T where
    T: Stream<Item = Result<Inbound, TransportError>> + Sink<Outbound, Error = TransportError> + Send + Unpin + 'static
{
}

/// Opens transports to an address.
#[async_trait]
pub trait Connect: Send + Sync + 'static {
    /// Open a transport to `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`SockError::ConnectFailed`] when the peer cannot be reached.
    async fn connect(&self, addr: &str) -> Result<Box<dyn Transport>, SockError>;
}

// =============================================================================
// WEBSOCKET
// =============================================================================

/// [`Transport`] over a `tokio-tungstenite` WebSocket. Binary and text
/// messages map to the matching unit kind; ping and pong are answered by
/// tungstenite and never surface.
pub struct WsTransport<S> {
    inner: WebSocketStream<S>,
}

impl<S> WsTransport<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self { inner }
    }
}

impl<S> Stream for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    type Item = Result<Inbound, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let msg = match ready!(self.inner.poll_next_unpin(cx)) {
                None => return Poll::Ready(None),
                Some(Err(e)) => return Poll::Ready(Some(Err(e.into()))),
                Some(Ok(msg)) => msg,
            };
            let item = match msg {
                Message::Binary(bytes) => Inbound::Unit(Unit::Binary(bytes.to_vec())),
                Message::Text(text) => Inbound::Unit(Unit::Text(text.as_str().to_owned())),
                Message::Close(frame) => Inbound::Close(frame.map(|f| u16::from(f.code))),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            };
            return Poll::Ready(Some(Ok(item)));
        }
    }
}

impl<S> Sink<Outbound> for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    type Error = TransportError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready_unpin(cx).map_err(Into::into)
    }

    fn start_send(mut self: Pin<&mut Self>, item: Outbound) -> Result<(), Self::Error> {
        let msg = match item {
            Outbound::Unit(Unit::Binary(bytes)) => Message::binary(bytes),
            Outbound::Unit(Unit::Text(text)) => Message::text(text),
            Outbound::Close(code) => Message::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: "".into(),
            })),
        };
        self.inner.start_send_unpin(msg).map_err(Into::into)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_flush_unpin(cx).map_err(Into::into)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_close_unpin(cx).map_err(Into::into)
    }
}

/// Opens [`WsTransport`]s with `tokio_tungstenite::connect_async`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connect for WsConnector {
    async fn connect(&self, addr: &str) -> Result<Box<dyn Transport>, SockError> {
        let (stream, _) = tokio_tungstenite::connect_async(addr)
            .await
            .map_err(|e| SockError::ConnectFailed(e.to_string()))?;
        tracing::info!(%addr, "gotalk: websocket connected");
        Ok(Box::new(WsTransport::new(stream)))
    }
}

// =============================================================================
// IN-MEMORY
// =============================================================================

/// Socket side of an in-process channel pair. See [`memory_pair`].
pub struct MemoryTransport {
    rx: mpsc::UnboundedReceiver<Result<Inbound, TransportError>>,
    tx: mpsc::UnboundedSender<Outbound>,
}

/// Far side of a [`MemoryTransport`]. Plays the remote peer: feeds units to
/// the socket and observes everything the socket writes.
pub struct MemoryPeer {
    tx: mpsc::UnboundedSender<Result<Inbound, TransportError>>,
    rx: mpsc::UnboundedReceiver<Outbound>,
}

/// Create a connected transport/peer pair.
#[must_use]
pub fn memory_pair() -> (MemoryTransport, MemoryPeer) {
    let (to_sock, from_peer) = mpsc::unbounded();
    let (to_peer, from_sock) = mpsc::unbounded();
    (
        MemoryTransport { rx: from_peer, tx: to_peer },
        MemoryPeer { tx: to_sock, rx: from_sock },
    )
}

impl Stream for MemoryTransport {
    type Item = Result<Inbound, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_next_unpin(cx)
    }
}

impl Sink<Outbound> for MemoryTransport {
    type Error = TransportError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.tx.poll_ready_unpin(cx).map_err(|_| peer_gone())
    }

    fn start_send(mut self: Pin<&mut Self>, item: Outbound) -> Result<(), Self::Error> {
        self.tx.start_send_unpin(item).map_err(|_| peer_gone())
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.tx.poll_flush_unpin(cx).map_err(|_| peer_gone())
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.tx.poll_close_unpin(cx).map_err(|_| peer_gone())
    }
}

fn peer_gone() -> TransportError {
    TransportError("memory peer dropped".into())
}

impl MemoryPeer {
    /// Deliver a unit to the socket. Returns `false` once the socket side
    /// has been dropped.
    pub fn send(&self, unit: Unit) -> bool {
        self.tx.unbounded_send(Ok(Inbound::Unit(unit))).is_ok()
    }

    /// Close the channel from the peer side.
    pub fn close(&self, status: Option<u16>) {
        let _ = self.tx.unbounded_send(Ok(Inbound::Close(status)));
    }

    /// Inject a read error.
    pub fn fail(&self, message: impl Into<String>) {
        let _ = self.tx.unbounded_send(Err(TransportError(message.into())));
    }

    /// Next item the socket wrote, or `None` once the socket side is gone.
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.rx.next().await
    }
}

#[cfg(test)]
#[path = "transport_test.rs"]
mod tests;
