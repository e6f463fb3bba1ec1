//! Wire codec for the gotalk duplex RPC protocol.
//!
//! This crate owns the frame representation shared by every part of the
//! engine. It performs no I/O: it turns message headers into transport units
//! and back.
//!
//! DESIGN
//! ======
//! A message travels as one header unit optionally followed by one payload
//! unit. Two codecs share one [`Protocol`] contract:
//! - [`Binary`] reads and writes `Vec<u8>` units at fixed byte offsets.
//! - [`Text`] reads and writes `String` units.
//!
//! Both produce the same layout, driven by the per-type [`Layout`] table
//! below, so a peer can tell which variant the initiator picked from the
//! kind of unit carrying the version handshake and nothing else differs.
//!
//! LAYOUT
//! ======
//! `tag id(4)? text3(name)? wait(N)? size(8)`, all integers zero-padded
//! lowercase hex. `text3` is a 3-digit length followed by that many bytes.

mod binary;
mod text;

use std::fmt;
use std::str::FromStr;

pub use binary::Binary;
pub use text::Text;

// =============================================================================
// CONSTANTS
// =============================================================================

/// Version of the protocol implemented by this crate.
pub const VERSION: u32 = 1;

/// Number of hex digits used for the version handshake unit.
pub const VERSION_DIGITS: usize = 2;

/// Byte length of every correlation ID on the wire.
pub const ID_LEN: usize = 4;

/// Hex digits of the `text3` length prefix.
pub const NAME_LEN_DIGITS: usize = 3;

/// Largest name that fits a `text3` field.
pub const MAX_NAME_LEN: usize = 0xFFF;

/// Hex digits of the payload size field.
pub const SIZE_DIGITS: usize = 8;

/// Hex digits of the retry `wait` field.
pub const RETRY_WAIT_DIGITS: usize = 8;

/// Hex digits of the heartbeat `load` field.
pub const HEARTBEAT_LOAD_DIGITS: usize = 4;

/// Maximum value of a heartbeat's load.
pub const HEARTBEAT_MAX_LOAD: u16 = 0xFFFF;

/// Added to an [`ErrorCode`] to form the WebSocket close status used when a
/// connection is torn down because of that protocol error.
pub const CLOSE_STATUS_BASE: u16 = 4000;

// =============================================================================
// ERRORS
// =============================================================================

/// Error returned by the encoders and by version parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// A name does not fit the 3-hex-digit length prefix.
    #[error("name is {0} bytes, longer than {MAX_NAME_LEN}")]
    NameTooLong(usize),
    /// The message type requires a 4-byte correlation ID.
    #[error("message id must be exactly {ID_LEN} bytes")]
    InvalidId,
    /// The version unit is not a 2-digit hex number.
    #[error("invalid version unit")]
    InvalidVersion,
    /// A payload does not fit the 8-digit size field.
    #[error("payload is {0} bytes, larger than the size field allows")]
    PayloadTooLarge(usize),
}

/// Protocol error codes carried by [`MsgType::ProtocolError`] frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Abnormal,
    Unsupported,
    InvalidMsg,
    Timeout,
}

impl ErrorCode {
    /// Numeric code as carried on the wire.
    #[must_use]
    pub fn code(self) -> u32 {
        match self {
            Self::Abnormal => 0,
            Self::Unsupported => 1,
            Self::InvalidMsg => 2,
            Self::Timeout => 3,
        }
    }

    /// Map a wire code to an error. Unknown codes are treated as an invalid
    /// message.
    #[must_use]
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Abnormal,
            1 => Self::Unsupported,
            3 => Self::Timeout,
            _ => Self::InvalidMsg,
        }
    }

    /// WebSocket close status for a connection closed because of this error.
    #[must_use]
    pub fn close_status(self) -> u16 {
        match self {
            Self::Abnormal => CLOSE_STATUS_BASE,
            Self::Unsupported => CLOSE_STATUS_BASE + 1,
            Self::InvalidMsg => CLOSE_STATUS_BASE + 2,
            Self::Timeout => CLOSE_STATUS_BASE + 3,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::Abnormal => "abnormal protocol condition",
            Self::Unsupported => "unsupported protocol",
            Self::InvalidMsg => "invalid protocol message",
            Self::Timeout => "timeout",
        };
        f.write_str(msg)
    }
}

// =============================================================================
// MESSAGE TYPES
// =============================================================================

/// Message type, identified on the wire by its first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    SingleRequest,
    StreamRequest,
    StreamRequestPart,
    SingleResponse,
    StreamResponse,
    ErrorResponse,
    RetryResponse,
    Notification,
    Heartbeat,
    ProtocolError,
}

impl MsgType {
    /// Wire tag byte.
    #[must_use]
    pub fn as_byte(self) -> u8 {
        match self {
            Self::SingleRequest => b'r',
            Self::StreamRequest => b's',
            Self::StreamRequestPart => b'p',
            Self::SingleResponse => b'R',
            Self::StreamResponse => b'S',
            Self::ErrorResponse => b'E',
            Self::RetryResponse => b'e',
            Self::Notification => b'n',
            Self::Heartbeat => b'h',
            Self::ProtocolError => b'f',
        }
    }

    /// Parse a wire tag byte.
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'r' => Some(Self::SingleRequest),
            b's' => Some(Self::StreamRequest),
            b'p' => Some(Self::StreamRequestPart),
            b'R' => Some(Self::SingleResponse),
            b'S' => Some(Self::StreamResponse),
            b'E' => Some(Self::ErrorResponse),
            b'e' => Some(Self::RetryResponse),
            b'n' => Some(Self::Notification),
            b'h' => Some(Self::Heartbeat),
            b'f' => Some(Self::ProtocolError),
            _ => None,
        }
    }

    /// Whether a header of this type may be followed by a payload unit.
    #[must_use]
    pub fn carries_payload(self) -> bool {
        !matches!(self, Self::Heartbeat | Self::ProtocolError)
    }

    pub(crate) fn layout(self) -> Layout {
        match self {
            Self::SingleRequest | Self::StreamRequest => Layout { id: true, name: true, wait_digits: 0 },
            Self::StreamRequestPart | Self::SingleResponse | Self::StreamResponse | Self::ErrorResponse => {
                Layout { id: true, name: false, wait_digits: 0 }
            }
            Self::RetryResponse => Layout { id: true, name: false, wait_digits: RETRY_WAIT_DIGITS },
            Self::Notification => Layout { id: false, name: true, wait_digits: 0 },
            Self::Heartbeat => Layout { id: false, name: false, wait_digits: HEARTBEAT_LOAD_DIGITS },
            Self::ProtocolError => Layout { id: false, name: false, wait_digits: 0 },
        }
    }
}

/// Which optional header fields a message type carries. Every type ends
/// with an 8-digit size field.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Layout {
    pub(crate) id: bool,
    pub(crate) name: bool,
    pub(crate) wait_digits: usize,
}

/// A parsed message header. Payload bytes travel in a separate unit.
///
/// `wait` holds the retry delay for retry responses and the load for
/// heartbeats. `size` holds the payload size, except for heartbeats (unix
/// time in seconds) and protocol errors (the error code).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Msg {
    pub t: MsgType,
    pub id: Option<String>,
    pub name: Option<String>,
    pub wait: u32,
    pub size: u32,
}

impl Msg {
    /// Whether a payload unit follows this header on the wire.
    #[must_use]
    pub fn expects_payload(&self) -> bool {
        self.size != 0 && self.t.carries_payload()
    }
}

// =============================================================================
// UNITS
// =============================================================================

/// One discrete message delivered by, or handed to, a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unit {
    Binary(Vec<u8>),
    Text(String),
}

impl Unit {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Binary(b) => b,
            Self::Text(s) => s.as_bytes(),
        }
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Binary(b) => b,
            Self::Text(s) => s.into_bytes(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// PROTOCOL CONTRACT
// =============================================================================

/// Contract shared by the binary and text codecs.
pub trait Protocol {
    /// Transport unit this codec reads and writes.
    type Unit;

    /// Zero-padded fixed-width hex encoding of `n`. Values wider than
    /// `digits` are clamped to the largest value that fits.
    fn make_fixnum(n: u32, digits: usize) -> Self::Unit;

    /// Parse a version handshake unit.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidVersion`] unless the unit is exactly
    /// [`VERSION_DIGITS`] hex digits.
    fn parse_version(unit: &Self::Unit) -> Result<u32, CodecError>;

    /// Parse a header unit. Returns `None` for malformed input.
    fn parse_msg(unit: &Self::Unit) -> Option<Msg>;

    /// Encode a header unit. `wait` is only written for types that carry it.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidId`] when the type needs an ID and `id`
    /// is not exactly [`ID_LEN`] bytes, and [`CodecError::NameTooLong`] when
    /// `name` exceeds [`MAX_NAME_LEN`].
    fn make_msg(t: MsgType, id: Option<&str>, name: Option<&str>, wait: u32, size: u32) -> Result<Self::Unit, CodecError>;

    /// The local version handshake unit.
    #[must_use]
    fn version_unit() -> Self::Unit {
        Self::make_fixnum(VERSION, VERSION_DIGITS)
    }

    /// Encode a heartbeat header with `load` and a unix timestamp in seconds.
    #[must_use]
    fn make_heartbeat_msg(load: u16, time: u32) -> Self::Unit;
}

/// Largest value representable in `digits` hex digits.
pub(crate) fn max_for_digits(digits: usize) -> u32 {
    if digits >= 8 { u32::MAX } else { (1_u32 << (4 * digits)) - 1 }
}

/// Value of one ASCII hex digit.
pub(crate) fn hex_value(byte: u8) -> Option<u32> {
    match byte {
        b'0'..=b'9' => Some(u32::from(byte - b'0')),
        b'a'..=b'f' => Some(u32::from(byte - b'a') + 10),
        b'A'..=b'F' => Some(u32::from(byte - b'A') + 10),
        _ => None,
    }
}

/// Parse a run of ASCII hex digits. Rejects signs and other characters that
/// `u32::from_str_radix` would tolerate.
pub(crate) fn parse_hex(digits: &[u8]) -> Option<u32> {
    if digits.is_empty() || digits.len() > 8 {
        return None;
    }
    digits
        .iter()
        .try_fold(0_u32, |acc, &b| hex_value(b).map(|v| (acc << 4) | v))
}

// =============================================================================
// CODEC SELECTION
// =============================================================================

/// Codec picked for outbound traffic at socket construction time.
///
/// Inbound traffic is always parsed with the codec matching the unit kind
/// that arrived, see [`parse_msg`] and [`parse_version`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    #[default]
    Binary,
    Text,
}

impl Codec {
    /// Encode a header unit with this codec.
    ///
    /// # Errors
    ///
    /// See [`Protocol::make_msg`].
    pub fn make_msg(self, t: MsgType, id: Option<&str>, name: Option<&str>, wait: u32, size: u32) -> Result<Unit, CodecError> {
        match self {
            Self::Binary => Binary::make_msg(t, id, name, wait, size).map(Unit::Binary),
            Self::Text => Text::make_msg(t, id, name, wait, size).map(Unit::Text),
        }
    }

    #[must_use]
    pub fn make_heartbeat_msg(self, load: u16, time: u32) -> Unit {
        match self {
            Self::Binary => Unit::Binary(Binary::make_heartbeat_msg(load, time)),
            Self::Text => Unit::Text(Text::make_heartbeat_msg(load, time)),
        }
    }

    #[must_use]
    pub fn make_fixnum(self, n: u32, digits: usize) -> Unit {
        match self {
            Self::Binary => Unit::Binary(Binary::make_fixnum(n, digits)),
            Self::Text => Unit::Text(Text::make_fixnum(n, digits)),
        }
    }

    #[must_use]
    pub fn version_unit(self) -> Unit {
        match self {
            Self::Binary => Unit::Binary(Binary::version_unit()),
            Self::Text => Unit::Text(Text::version_unit()),
        }
    }

    /// Wrap payload bytes in the unit kind this codec sends. The text codec
    /// replaces invalid UTF-8 sequences.
    #[must_use]
    pub fn payload_unit(self, payload: &[u8]) -> Unit {
        match self {
            Self::Binary => Unit::Binary(payload.to_vec()),
            Self::Text => Unit::Text(String::from_utf8_lossy(payload).into_owned()),
        }
    }
}

impl FromStr for Codec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "binary" => Ok(Self::Binary),
            "text" => Ok(Self::Text),
            other => Err(format!("unknown codec '{other}' (expected 'binary' or 'text')")),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Binary => f.write_str("binary"),
            Self::Text => f.write_str("text"),
        }
    }
}

/// Parse a header unit with the codec matching its kind.
#[must_use]
pub fn parse_msg(unit: &Unit) -> Option<Msg> {
    match unit {
        Unit::Binary(b) => Binary::parse_msg(b),
        Unit::Text(s) => Text::parse_msg(s),
    }
}

/// Parse a version handshake unit with the codec matching its kind.
///
/// # Errors
///
/// Returns [`CodecError::InvalidVersion`] for malformed units.
pub fn parse_version(unit: &Unit) -> Result<u32, CodecError> {
    match unit {
        Unit::Binary(b) => Binary::parse_version(b),
        Unit::Text(s) => Text::parse_version(s),
    }
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
