//! Error taxonomy for the engine.
//!
//! DESIGN
//! ======
//! `SockError` is `Clone` because one failure fans out to many parties: a
//! connection reset settles every pending request with the same error and
//! re-raises it on the `close` event for every subscriber.
//!
//! Handler faults never appear here directly. A handler that rejects or
//! panics is turned into an `ErrorResponse` on the wire, and the requesting
//! peer sees it as `SockError::Response`.

use protocol::{CodecError, ErrorCode};

/// Errors surfaced by sockets, requests, stream requests and keepalives.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SockError {
    /// Wire-level protocol error, delivered both to the peer and locally.
    #[error("{0}")]
    Protocol(ErrorCode),
    /// Synthetic error settling requests still pending when a connection
    /// resets without a more specific cause.
    #[error("connection closed")]
    ConnectionClosed,
    /// No transport is attached and the send queue is full (or disabled).
    #[error("socket is closed")]
    SocketClosed,
    /// The transport closed with a non-normal status and no causal error.
    #[error("websocket closed: {}", status_label(.0))]
    CloseStatus(u16),
    /// The peer answered with an `ErrorResponse`. Displays the peer's
    /// message verbatim.
    #[error("{0}")]
    Response(String),
    /// The peer answered with a `RetryResponse`.
    #[error("retry in {wait_ms}ms: {message}")]
    Retry { wait_ms: u32, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("connection failed: {0}")]
    ConnectFailed(String),
    #[error("address not specified")]
    AddressNotSpecified,
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("invalid json: {0}")]
    Json(String),
    #[error("heartbeat interval is too low")]
    HeartbeatIntervalTooLow,
    #[error("socket already has an attached transport")]
    AlreadyAttached,
    /// Every correlation ID of the requested kind is pending.
    #[error("no free request ids")]
    IdsExhausted,
}

impl SockError {
    /// Protocol error code, when this is a wire-level protocol error.
    #[must_use]
    pub fn protocol_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Protocol(code) => Some(*code),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for SockError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e.to_string())
    }
}

/// Name of a WebSocket close status, when it has a well-known one.
#[must_use]
pub fn close_status_name(code: u16) -> Option<&'static str> {
    match code {
        1000 => Some("normal"),
        1001 => Some("going away"),
        1002 => Some("protocol error"),
        1003 => Some("unsupported"),
        1005 => Some("no status"),
        1006 => Some("abnormal"),
        1007 => Some("inconsistent"),
        1008 => Some("invalid message"),
        1009 => Some("too large"),
        _ => None,
    }
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn status_label(code: &u16) -> String {
    close_status_msg(*code)
}

/// Render a close status as `#1006 (abnormal)`.
#[must_use]
pub fn close_status_msg(code: u16) -> String {
    match close_status_name(code) {
        Some(name) => format!("#{code} ({name})"),
        None => format!("#{code}"),
    }
}

// =============================================================================
// HANDLER ERROR
// =============================================================================

/// Rejection returned by a request handler. Its message is sent to the
/// requesting peer as an `ErrorResponse`.
///
/// Any `std::error::Error` converts into it, so handlers can use `?`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl<E: std::error::Error> From<E> for HandlerError {
    fn from(e: E) -> Self {
        Self { message: e.to_string() }
    }
}

#[cfg(test)]
#[path = "error_test.rs"]
mod tests;
