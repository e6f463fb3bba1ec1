//! Client engine for the gotalk duplex RPC protocol.
//!
//! DESIGN
//! ======
//! Either side of a gotalk connection can make requests, send notifications
//! and answer requests. This crate is the engine for one end of it:
//!
//! - [`Sock`]: one connection. Multiplexes single and stream requests over a
//!   transport, dispatches inbound requests and notifications to
//!   [`Handlers`], buffers sends while offline, sends heartbeats.
//! - [`Keepalive`]: reopens a socket after it drops, with back-off.
//! - [`Context`]: default handlers, default address and settings, from which
//!   sockets are created.
//!
//! Framing lives in the `protocol` crate; transports in [`transport`].
//!
//! ```no_run
//! # async fn demo() -> Result<(), gotalk::SockError> {
//! let ctx = gotalk::Context::from_env();
//! ctx.handle_request("echo", |s: String, _| async move { Ok(s) });
//!
//! let sock = ctx.open(Some("localhost:1234/gotalk")).await?;
//! let reply: String = sock.request("echo", "hi").await?;
//! assert_eq!(reply, "hi");
//! sock.end();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod handlers;
pub mod keepalive;
pub mod netaccess;
mod sendq;
pub mod sock;
pub mod stream;
pub mod transport;

pub use config::{KeepaliveConfig, SockConfig};
pub use context::Context;
pub use error::{HandlerError, SockError};
pub use handlers::Handlers;
pub use keepalive::{Backoff, Keepalive};
pub use netaccess::NetMonitor;
pub use protocol::{Codec, ErrorCode, MsgType};
pub use sock::{Sock, SockEvent};
pub use stream::{StreamEvent, StreamRequest};
pub use transport::{Connect, Inbound, MemoryPeer, MemoryTransport, Outbound, Transport, WsConnector, WsTransport, memory_pair};
