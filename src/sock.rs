//! Connection state machine and request multiplexer.
//!
//! DESIGN
//! ======
//! A [`Sock`] is a cheap handle around shared state guarded by one mutex.
//! Attaching a transport spawns two tasks:
//! - a writer draining an unbounded channel into the transport sink, so
//!   every send is synchronous for the caller and frames reach the wire in
//!   the order they were issued;
//! - a reader processing inbound units strictly in arrival order, one
//!   header plus its optional payload at a time.
//!
//! Every attachment gets a new epoch. Tasks and late handler replies carry
//! the epoch they were started under and are ignored once it is stale, so a
//! reconnect can never be confused by traffic from the previous connection.
//!
//! LIFECYCLE
//! =========
//! `adopt` sends the version handshake, marks the socket open and flushes
//! the send queue. The peer's version is checked by the reader before any
//! other frame is accepted; heartbeats start once it checks out.
//!
//! Every path that tears a connection down ends in `State::reset`, which
//! settles every pending request with the causal error (or
//! `ConnectionClosed`) and emits exactly one `Close` event.
//!
//! User code (handlers, notification callbacks) never runs while the state
//! lock is held.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use protocol::{CodecError, ErrorCode, HEARTBEAT_MAX_LOAD, MsgType, Unit, VERSION};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};

use crate::config::{KeepaliveConfig, MIN_HEARTBEAT_INTERVAL_MS, SockConfig};
use crate::error::SockError;
use crate::handlers::{Handlers, decode_json};
use crate::keepalive::Keepalive;
use crate::netaccess::NetMonitor;
use crate::sendq::{Frame, SendQueue};
use crate::stream::{StreamEvent, StreamRequest};
use crate::transport::{Connect, Inbound, Outbound, Transport, TransportError, WsConnector};

const SINGLE_ID_SPACE: u32 = 36 * 36 * 36 * 36;
const SINGLE_ID_DIGITS: usize = 4;
const STREAM_ID_SPACE: u32 = 36 * 36 * 36;
const STREAM_ID_DIGITS: usize = 3;
const STREAM_ID_PREFIX: char = '!';

const EVENT_CAPACITY: usize = 64;
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) const NORMAL_CLOSURE: u16 = 1000;
const NO_STATUS: u16 = 1005;
const ABNORMAL_CLOSURE: u16 = 1006;

/// Connection-level event, delivered to every [`Sock::subscribe`] receiver.
#[derive(Debug, Clone, PartialEq)]
pub enum SockEvent {
    /// A transport was attached and the handshake sent.
    Open,
    /// The connection went away. `None` for a clean close.
    Close(Option<SockError>),
    /// The peer sent a heartbeat. `load` is a fraction in `[0, 1]`.
    Heartbeat { time: SystemTime, load: f64 },
}

// =============================================================================
// STATE
// =============================================================================

enum Pending {
    Single(oneshot::Sender<Result<Vec<u8>, SockError>>),
    Stream(mpsc::UnboundedSender<StreamEvent>),
}

impl Pending {
    /// Deliver a terminal outcome.
    fn settle(self, outcome: Result<Vec<u8>, SockError>) {
        match self {
            Self::Single(tx) => {
                let _ = tx.send(outcome);
            }
            Self::Stream(tx) => match outcome {
                Ok(payload) => {
                    if !payload.is_empty() {
                        let _ = tx.send(StreamEvent::Data(payload));
                    }
                    let _ = tx.send(StreamEvent::Close(None));
                }
                Err(e) => {
                    let _ = tx.send(StreamEvent::Close(Some(e)));
                }
            },
        }
    }
}

struct Conn {
    epoch: u64,
    out: mpsc::UnboundedSender<Outbound>,
    reader: AbortHandle,
    close_error: Option<SockError>,
    closing: bool,
}

struct State {
    config: SockConfig,
    address: Option<String>,
    epoch: u64,
    conn: Option<Conn>,
    is_open: bool,
    pending: HashMap<String, Pending>,
    next_op_id: u32,
    next_stream_id: u32,
    pending_close: bool,
    sendq: SendQueue,
    heartbeat: Option<JoinHandle<()>>,
    keepalive: Option<AbortHandle>,
}

/// Write a frame to the out channel, handing it back when the writer task
/// has gone away.
fn write_frame(out: &mpsc::UnboundedSender<Outbound>, frame: Frame) -> Result<(), Frame> {
    if out.is_closed() {
        return Err(frame);
    }
    let _ = out.send(Outbound::Unit(frame.header));
    if let Some(payload) = frame.payload {
        let _ = out.send(Outbound::Unit(payload));
    }
    Ok(())
}

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn base36(mut n: u32, digits: usize) -> String {
    let mut out = vec!['0'; digits];
    for slot in out.iter_mut().rev() {
        *slot = char::from(BASE36[(n % 36) as usize]);
        n /= 36;
    }
    out.into_iter().collect()
}

/// Next free ID in `space`, starting at `*next`. IDs still pending are
/// skipped.
fn alloc_id(
    pending: &HashMap<String, Pending>,
    next: &mut u32,
    space: u32,
    format: impl Fn(u32) -> String,
) -> Result<String, SockError> {
    for _ in 0..space {
        let n = *next;
        *next = (n + 1) % space;
        let id = format(n);
        if !pending.contains_key(&id) {
            return Ok(id);
        }
    }
    Err(SockError::IdsExhausted)
}

impl State {
    fn new(config: SockConfig) -> Self {
        Self {
            config,
            address: None,
            epoch: 0,
            conn: None,
            is_open: false,
            pending: HashMap::new(),
            next_op_id: 0,
            next_stream_id: 0,
            pending_close: false,
            sendq: SendQueue::new(config.send_buffer_limit),
            heartbeat: None,
            keepalive: None,
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.conn.as_ref().is_some_and(|c| c.epoch == epoch)
    }

    fn alloc_single_id(&mut self) -> Result<String, SockError> {
        alloc_id(&self.pending, &mut self.next_op_id, SINGLE_ID_SPACE, |n| base36(n, SINGLE_ID_DIGITS))
    }

    fn alloc_stream_id(&mut self) -> Result<String, SockError> {
        alloc_id(&self.pending, &mut self.next_stream_id, STREAM_ID_SPACE, |n| {
            format!("{STREAM_ID_PREFIX}{}", base36(n, STREAM_ID_DIGITS))
        })
    }

    fn send_msg(
        &mut self,
        t: MsgType,
        id: Option<&str>,
        name: Option<&str>,
        wait: u32,
        payload: &[u8],
    ) -> Result<(), SockError> {
        let codec = self.config.codec;
        let payload = (!payload.is_empty()).then(|| codec.payload_unit(payload));
        let len = payload.as_ref().map_or(0, Unit::len);
        let size = u32::try_from(len).map_err(|_| CodecError::PayloadTooLarge(len))?;
        let header = codec.make_msg(t, id, name, wait, size)?;
        tracing::trace!(?t, id, name, size, open = self.is_open, "gotalk: send");
        self.send_frame(Frame { header, payload, correlated: id.is_some() })
    }

    fn send_frame(&mut self, frame: Frame) -> Result<(), SockError> {
        let frame = match self.conn.as_ref() {
            Some(conn) if self.is_open => match write_frame(&conn.out, frame) {
                Ok(()) => return Ok(()),
                Err(frame) => {
                    self.is_open = false;
                    tracing::warn!("gotalk: send failed, transport is gone (requeueing)");
                    return self
                        .sendq
                        .push(frame)
                        .map_err(|_| SockError::Transport("transport is gone".into()));
                }
            },
            _ => frame,
        };
        self.sendq.push(frame)
    }

    fn flush(&mut self) {
        let Some(conn) = self.conn.as_ref() else { return };
        let queued = self.sendq.len();
        while let Some(frame) = self.sendq.pop() {
            if let Err(frame) = write_frame(&conn.out, frame) {
                let _ = self.sendq.push_front(frame);
                self.is_open = false;
                break;
            }
        }
        if queued > 0 {
            tracing::debug!(queued, "gotalk: flushed send queue");
        }
    }

    fn stop_heartbeats(&mut self) {
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
    }

    /// Ask the writer to close the transport. The connection is reset once
    /// the writer reports the close, or right away when the writer is gone.
    fn close(&mut self, status: u16, err: Option<SockError>) -> Option<SockEvent> {
        self.stop_heartbeats();
        self.is_open = false;
        let conn = self.conn.as_mut()?;
        if conn.closing {
            return None;
        }
        conn.closing = true;
        if err.is_some() {
            conn.close_error = err;
        }
        if conn.out.send(Outbound::Close(status)).is_err() {
            return Some(self.reset_with_status(Some(status)));
        }
        None
    }

    /// Close after sending the peer a protocol error frame.
    fn close_with_protocol_error(&mut self, code: ErrorCode) -> Option<SockEvent> {
        let codec = self.config.codec;
        if let Some(conn) = self.conn.as_ref().filter(|c| !c.closing) {
            if let Ok(unit) = codec.make_msg(MsgType::ProtocolError, None, None, 0, code.code()) {
                let _ = conn.out.send(Outbound::Unit(unit));
            }
        }
        self.close(code.close_status(), Some(SockError::Protocol(code)))
    }

    fn end(&mut self) -> Option<SockEvent> {
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.abort();
        }
        if !self.pending_close && !self.pending.is_empty() {
            self.pending_close = true;
            tracing::debug!(pending = self.pending.len(), "gotalk: close deferred until responses arrive");
            return None;
        }
        if self.conn.is_none() {
            // Nothing to close. Requests queued for a connection that will
            // not come are settled here.
            if !self.pending.is_empty() || self.sendq.len() > 0 {
                let _ = self.reset(None);
            }
            return None;
        }
        self.close(NORMAL_CLOSURE, None)
    }

    /// Called after a pending entry was removed.
    fn settled(&mut self) -> Option<SockEvent> {
        if self.pending_close && self.pending.is_empty() { self.end() } else { None }
    }

    fn reset_with_status(&mut self, status: Option<u16>) -> SockEvent {
        let recorded = self.conn.as_mut().and_then(|c| c.close_error.take());
        let err = recorded.or(match status {
            Some(NORMAL_CLOSURE) => None,
            Some(code) => Some(SockError::CloseStatus(code)),
            None => Some(SockError::CloseStatus(NO_STATUS)),
        });
        self.reset(err)
    }

    fn reset(&mut self, err: Option<SockError>) -> SockEvent {
        self.pending_close = false;
        self.stop_heartbeats();
        // Dropping the out channel lets the writer drain and exit.
        if let Some(conn) = self.conn.take() {
            conn.reader.abort();
        }
        self.is_open = false;
        self.next_op_id = 0;

        // Queued requests and responses carry IDs of this connection. Their
        // callers are settled below and the IDs will be handed out again.
        let dropped = self.sendq.drop_correlated();
        if dropped > 0 {
            tracing::debug!(dropped, "gotalk: dropped queued frames of the closed connection");
        }

        if !self.pending.is_empty() {
            let cause = err.clone().unwrap_or(SockError::ConnectionClosed);
            tracing::debug!(pending = self.pending.len(), error = %cause, "gotalk: failing pending requests");
            for (_, pending) in self.pending.drain() {
                pending.settle(Err(cause.clone()));
            }
        }
        SockEvent::Close(err)
    }
}

// =============================================================================
// SOCK
// =============================================================================

struct Shared {
    handlers: Handlers,
    state: Mutex<State>,
    events: broadcast::Sender<SockEvent>,
}

/// A gotalk connection endpoint. Clones share the same connection.
#[derive(Clone)]
pub struct Sock {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Sock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Sock")
            .field("address", &state.address)
            .field("open", &state.is_open)
            .field("pending", &state.pending.len())
            .finish_non_exhaustive()
    }
}

impl Default for Sock {
    fn default() -> Self {
        Self::new(Handlers::new(), SockConfig::default())
    }
}

/// Scale a `[0, 1]` load fraction to the wire range.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn scale_load(load: f64) -> u16 {
    (load.clamp(0.0, 1.0) * f64::from(HEARTBEAT_MAX_LOAD)).round() as u16
}

fn unix_seconds() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Handler faults are noise in production and useful in development.
fn log_fault(development_mode: bool, name: &str, detail: &str, what: &str) {
    if development_mode {
        tracing::warn!(%name, %detail, "gotalk: {what}");
    } else {
        tracing::debug!(%name, %detail, "gotalk: {what}");
    }
}

impl Sock {
    #[must_use]
    pub fn new(handlers: Handlers, config: SockConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                handlers,
                state: Mutex::new(State::new(config)),
                events,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SockEvent) {
        // No subscribers is fine.
        let _ = self.shared.events.send(event);
    }

    fn emit_opt(&self, event: Option<SockEvent>) {
        if let Some(event) = event {
            self.emit(event);
        }
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    #[must_use]
    pub fn handlers(&self) -> &Handlers {
        &self.shared.handlers
    }

    /// Receiver for connection events raised from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SockEvent> {
        self.shared.events.subscribe()
    }

    /// Address of the last transport opened through [`Sock::open`].
    #[must_use]
    pub fn address(&self) -> Option<String> {
        self.lock().address.clone()
    }

    /// Whether sends go straight to a transport rather than the queue.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.lock().is_open
    }

    /// Whether a transport is attached (open or closing).
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.lock().conn.is_some()
    }

    /// Requests and stream requests waiting for a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    #[must_use]
    pub fn config(&self) -> SockConfig {
        self.lock().config
    }

    pub fn set_send_buffer_limit(&self, limit: usize) {
        let mut state = self.lock();
        state.config.send_buffer_limit = limit;
        state.sendq.set_limit(limit);
    }

    /// Change the heartbeat interval. Zero disables heartbeats. Running
    /// heartbeats are restarted with the new interval.
    ///
    /// # Errors
    ///
    /// Returns [`SockError::HeartbeatIntervalTooLow`] for a non-zero
    /// interval under 10ms.
    pub fn set_heartbeat_interval(&self, interval: Duration) -> Result<(), SockError> {
        if !interval.is_zero() && interval < Duration::from_millis(MIN_HEARTBEAT_INTERVAL_MS) {
            return Err(SockError::HeartbeatIntervalTooLow);
        }
        let mut state = self.lock();
        state.config.heartbeat_interval = interval;
        if state.heartbeat.is_some() {
            if interval.is_zero() {
                state.stop_heartbeats();
            } else {
                self.start_heartbeats_locked(&mut state)?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // CONNECTING
    // =========================================================================

    /// Attach an already-connected transport. Sends the version handshake
    /// and flushes anything queued while offline. Must be called from
    /// within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`SockError::AlreadyAttached`] when a transport is attached.
    pub fn adopt<T: Transport>(&self, transport: T) -> Result<(), SockError> {
        self.attach(transport, None)
    }

    fn attach<T: Transport>(&self, transport: T, address: Option<&str>) -> Result<(), SockError> {
        let mut state = self.lock();
        if state.conn.is_some() {
            return Err(SockError::AlreadyAttached);
        }
        state.epoch += 1;
        let epoch = state.epoch;
        if let Some(address) = address {
            state.address = Some(address.to_owned());
        }

        let (sink, stream) = transport.split::<Outbound>();
        let (out, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(self.clone(), epoch, sink, rx));
        let reader = tokio::spawn(read_loop(self.clone(), epoch, stream)).abort_handle();

        let _ = out.send(Outbound::Unit(state.config.codec.version_unit()));
        state.conn = Some(Conn { epoch, out, reader, close_error: None, closing: false });
        state.is_open = true;
        state.flush();

        tracing::info!(epoch, address = state.address.as_deref(), "gotalk: connection open");
        self.emit(SockEvent::Open);
        Ok(())
    }

    /// Open a WebSocket to `addr` and attach it.
    ///
    /// # Errors
    ///
    /// Returns [`SockError::ConnectFailed`] when the connection cannot be
    /// established and [`SockError::AlreadyAttached`] when a transport is
    /// already attached.
    pub async fn open(&self, addr: &str) -> Result<(), SockError> {
        self.open_with(addr, &WsConnector).await
    }

    /// Open a transport to `addr` with `connector` and attach it.
    ///
    /// # Errors
    ///
    /// See [`Sock::open`].
    pub async fn open_with(&self, addr: &str, connector: &dyn Connect) -> Result<(), SockError> {
        if self.is_connected() {
            return Err(SockError::AlreadyAttached);
        }
        let transport = connector.connect(addr).await?;
        self.attach(transport, Some(addr))
    }

    /// Keep this socket connected to `addr`, reconnecting with back-off.
    #[must_use]
    pub fn open_keepalive(&self, addr: &str) -> Keepalive {
        let keepalive = Keepalive::new(
            self.clone(),
            addr,
            KeepaliveConfig::default(),
            Arc::new(WsConnector),
            NetMonitor::new(),
        );
        keepalive.enable();
        keepalive
    }

    pub(crate) fn set_keepalive(&self, handle: AbortHandle) {
        if let Some(old) = self.lock().keepalive.replace(handle) {
            old.abort();
        }
    }

    /// Close the connection. With responses outstanding, the first call
    /// defers the close until they have all arrived and a second call
    /// closes right away. Also disables any keepalive.
    pub fn end(&self) {
        let event = self.lock().end();
        self.emit_opt(event);
    }

    // =========================================================================
    // SENDING
    // =========================================================================

    /// Send one message, or queue it while no transport is open.
    ///
    /// # Errors
    ///
    /// Returns [`SockError::SocketClosed`] when it has to be queued and the
    /// queue is full, and a codec error for an unencodable header.
    pub fn send_msg(
        &self,
        t: MsgType,
        id: Option<&str>,
        name: Option<&str>,
        wait: u32,
        payload: &[u8],
    ) -> Result<(), SockError> {
        self.lock().send_msg(t, id, name, wait, payload)
    }

    /// Send a request with a raw payload. The request is written (or queued)
    /// before this returns; the future resolves with the response payload.
    pub fn buffer_request(
        &self,
        op: &str,
        payload: &[u8],
    ) -> impl Future<Output = Result<Vec<u8>, SockError>> + Send + use<> {
        let response = self.start_request(op, payload);
        async move {
            match response {
                Ok(rx) => rx.await.unwrap_or_else(|_| Err(SockError::ConnectionClosed)),
                Err(e) => Err(e),
            }
        }
    }

    fn start_request(
        &self,
        op: &str,
        payload: &[u8],
    ) -> Result<oneshot::Receiver<Result<Vec<u8>, SockError>>, SockError> {
        let mut state = self.lock();
        let id = state.alloc_single_id()?;
        let (tx, rx) = oneshot::channel();
        state.pending.insert(id.clone(), Pending::Single(tx));
        if let Err(e) = state.send_msg(MsgType::SingleRequest, Some(&id), Some(op), 0, payload) {
            state.pending.remove(&id);
            return Err(e);
        }
        Ok(rx)
    }

    /// Send a request with a JSON-encoded value and decode the JSON response.
    pub fn request<T, R>(&self, op: &str, value: &T) -> impl Future<Output = Result<R, SockError>> + Send + use<T, R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let response = serde_json::to_vec(value)
            .map_err(SockError::from)
            .map(|payload| self.buffer_request(op, &payload));
        async move {
            match response {
                Ok(fut) => match fut.await {
                    Ok(bytes) => decode_json(&bytes).map_err(SockError::from),
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            }
        }
    }

    /// Send a notification with a raw payload.
    ///
    /// # Errors
    ///
    /// See [`Sock::send_msg`].
    pub fn buffer_notify(&self, name: &str, payload: &[u8]) -> Result<(), SockError> {
        self.send_msg(MsgType::Notification, None, Some(name), 0, payload)
    }

    /// Send a notification with a JSON-encoded value.
    ///
    /// # Errors
    ///
    /// See [`Sock::send_msg`].
    pub fn notify<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<(), SockError> {
        let payload = serde_json::to_vec(value)?;
        self.buffer_notify(name, &payload)
    }

    /// Start a stream request. Nothing is sent until the first write.
    ///
    /// # Errors
    ///
    /// Returns [`SockError::IdsExhausted`] when every stream ID is in use.
    pub fn stream_request(&self, op: &str) -> Result<StreamRequest, SockError> {
        let mut state = self.lock();
        let id = state.alloc_stream_id()?;
        let (tx, rx) = mpsc::unbounded_channel();
        state.pending.insert(id.clone(), Pending::Stream(tx));
        Ok(StreamRequest::new(self.clone(), id, op.to_owned(), rx))
    }

    /// Drop the pending entry of a stream request whose handle went away.
    pub(crate) fn release_stream(&self, id: &str) {
        let mut state = self.lock();
        let abandoned = matches!(state.pending.get(id), Some(Pending::Stream(tx)) if tx.is_closed());
        if abandoned {
            state.pending.remove(id);
            let event = state.settled();
            drop(state);
            self.emit_opt(event);
        }
    }

    // =========================================================================
    // HEARTBEATS
    // =========================================================================

    /// Send one heartbeat carrying `load`, a fraction in `[0, 1]`.
    ///
    /// # Errors
    ///
    /// Returns [`SockError::SocketClosed`] when no transport is attached.
    pub fn send_heartbeat(&self, load: f64) -> Result<(), SockError> {
        let state = self.lock();
        let conn = state.conn.as_ref().filter(|c| !c.closing).ok_or(SockError::SocketClosed)?;
        let unit = state.config.codec.make_heartbeat_msg(scale_load(load), unix_seconds());
        conn.out.send(Outbound::Unit(unit)).map_err(|_| SockError::SocketClosed)
    }

    /// Send a heartbeat now and then every heartbeat interval.
    ///
    /// # Errors
    ///
    /// Returns [`SockError::HeartbeatIntervalTooLow`] when the interval is
    /// under 10ms (including zero).
    pub fn start_sending_heartbeats(&self) -> Result<(), SockError> {
        let mut state = self.lock();
        self.start_heartbeats_locked(&mut state)
    }

    pub fn stop_sending_heartbeats(&self) {
        self.lock().stop_heartbeats();
    }

    fn start_heartbeats_locked(&self, state: &mut State) -> Result<(), SockError> {
        let interval = state.config.heartbeat_interval;
        if interval < Duration::from_millis(MIN_HEARTBEAT_INTERVAL_MS) {
            return Err(SockError::HeartbeatIntervalTooLow);
        }
        state.stop_heartbeats();
        let sock = self.clone();
        state.heartbeat = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1)).await;
            loop {
                if let Err(e) = sock.send_heartbeat(0.0) {
                    tracing::debug!(error = %e, "gotalk: heartbeats stopped");
                    return;
                }
                tokio::time::sleep(interval).await;
            }
        }));
        Ok(())
    }

    // =========================================================================
    // INBOUND
    // =========================================================================

    fn read_unit(&self, epoch: u64, expect: ReadState, unit: Unit) -> ReadState {
        match expect {
            ReadState::Version => self.read_version(epoch, &unit),
            ReadState::Header => match protocol::parse_msg(&unit) {
                None => {
                    tracing::warn!(len = unit.len(), "gotalk: malformed message header");
                    self.protocol_violation(epoch, ErrorCode::InvalidMsg)
                }
                Some(msg) if msg.expects_payload() => ReadState::Payload(msg),
                Some(msg) => self.handle_msg(epoch, msg, Vec::new()),
            },
            ReadState::Payload(msg) => self.handle_msg(epoch, msg, unit.into_bytes()),
            ReadState::Closing => ReadState::Closing,
        }
    }

    fn read_version(&self, epoch: u64, unit: &Unit) -> ReadState {
        match protocol::parse_version(unit) {
            Ok(VERSION) => {
                let mut state = self.lock();
                if state.is_current(epoch) && !state.config.heartbeat_interval.is_zero() {
                    if let Err(e) = self.start_heartbeats_locked(&mut state) {
                        tracing::warn!(error = %e, "gotalk: heartbeats not started");
                    }
                }
                ReadState::Header
            }
            other => {
                tracing::warn!(peer_version = ?other, local_version = VERSION, "gotalk: unsupported peer protocol");
                self.protocol_violation(epoch, ErrorCode::Unsupported)
            }
        }
    }

    fn protocol_violation(&self, epoch: u64, code: ErrorCode) -> ReadState {
        let mut state = self.lock();
        if state.is_current(epoch) {
            let event = state.close_with_protocol_error(code);
            self.emit_opt(event);
        }
        ReadState::Closing
    }

    fn handle_msg(&self, epoch: u64, msg: protocol::Msg, payload: Vec<u8>) -> ReadState {
        tracing::trace!(t = ?msg.t, id = msg.id.as_deref(), name = msg.name.as_deref(), size = msg.size, "gotalk: recv");
        match msg.t {
            MsgType::SingleRequest => self.handle_request(epoch, msg.id, msg.name, payload),
            MsgType::SingleResponse => self.settle_response(epoch, msg.id, Ok(payload), false),
            MsgType::StreamResponse => {
                let more = !payload.is_empty();
                self.settle_response(epoch, msg.id, Ok(payload), more);
            }
            MsgType::ErrorResponse => {
                let message = String::from_utf8_lossy(&payload).into_owned();
                self.settle_response(epoch, msg.id, Err(SockError::Response(message)), false);
            }
            MsgType::RetryResponse => {
                let message = String::from_utf8_lossy(&payload).into_owned();
                let err = SockError::Retry { wait_ms: msg.wait, message };
                self.settle_response(epoch, msg.id, Err(err), false);
            }
            MsgType::Notification => self.handle_notification(msg.name.unwrap_or_default(), payload),
            MsgType::Heartbeat => self.emit(SockEvent::Heartbeat {
                time: UNIX_EPOCH + Duration::from_secs(u64::from(msg.size)),
                load: f64::from(msg.wait) / f64::from(HEARTBEAT_MAX_LOAD),
            }),
            MsgType::ProtocolError => {
                let code = ErrorCode::from_code(msg.size);
                tracing::warn!(code = msg.size, error = %code, "gotalk: peer reported protocol error");
                let mut state = self.lock();
                if state.is_current(epoch) {
                    let event = state.close(code.close_status(), Some(SockError::Protocol(code)));
                    self.emit_opt(event);
                }
                return ReadState::Closing;
            }
            MsgType::StreamRequest | MsgType::StreamRequestPart => {
                tracing::warn!(t = ?msg.t, "gotalk: inbound stream requests are not supported");
                return self.protocol_violation(epoch, ErrorCode::InvalidMsg);
            }
        }
        ReadState::Header
    }

    fn handle_request(&self, epoch: u64, id: Option<String>, op: Option<String>, payload: Vec<u8>) {
        let Some(id) = id else { return };
        let op = op.unwrap_or_default();
        let Some(handler) = self.shared.handlers.find_request_handler(&op) else {
            tracing::debug!(%op, "gotalk: no handler for operation");
            self.respond(epoch, &id, Err(format!("no such operation \"{op}\"")));
            return;
        };

        let development_mode = self.lock().config.development_mode;
        let sock = self.clone();
        tokio::spawn(async move {
            let name = op.clone();
            let outcome = AssertUnwindSafe(async move { handler(payload, name).await })
                .catch_unwind()
                .await;
            let reply = match outcome {
                Ok(Ok(bytes)) => Ok(bytes),
                Ok(Err(e)) => Err(e.to_string()),
                Err(panic) => {
                    log_fault(development_mode, &op, panic_message(panic.as_ref()), "request handler panicked");
                    Err("internal error".to_owned())
                }
            };
            sock.respond(epoch, &id, reply);
        });
    }

    fn respond(&self, epoch: u64, id: &str, reply: Result<Vec<u8>, String>) {
        let mut state = self.lock();
        if !state.is_current(epoch) {
            tracing::debug!(id, "gotalk: dropping response for a closed connection");
            return;
        }
        let (t, payload) = match reply {
            Ok(bytes) => (MsgType::SingleResponse, bytes),
            Err(message) => (MsgType::ErrorResponse, message.into_bytes()),
        };
        if let Err(e) = state.send_msg(t, Some(id), None, 0, &payload) {
            tracing::warn!(id, error = %e, "gotalk: failed to send response");
        }
    }

    /// Route a response to its pending request. `more` marks a non-terminal
    /// stream chunk.
    fn settle_response(&self, epoch: u64, id: Option<String>, outcome: Result<Vec<u8>, SockError>, more: bool) {
        let Some(id) = id else { return };
        let mut state = self.lock();
        if !state.is_current(epoch) {
            return;
        }
        if more {
            if let Some(Pending::Stream(tx)) = state.pending.get(&id) {
                if let Ok(chunk) = outcome {
                    let _ = tx.send(StreamEvent::Data(chunk));
                }
                return;
            }
        }
        let Some(pending) = state.pending.remove(&id) else {
            tracing::debug!(%id, "gotalk: ignoring response for unknown id");
            return;
        };
        pending.settle(outcome);
        let event = state.settled();
        self.emit_opt(event);
    }

    fn handle_notification(&self, name: String, payload: Vec<u8>) {
        let Some(handler) = self.shared.handlers.find_notification_handler(&name) else {
            tracing::trace!(%name, "gotalk: no handler for notification");
            return;
        };
        let development_mode = self.lock().config.development_mode;
        match std::panic::catch_unwind(AssertUnwindSafe(|| handler(payload, name.clone()))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log_fault(development_mode, &name, e.message(), "notification dropped"),
            Err(panic) => log_fault(development_mode, &name, panic_message(panic.as_ref()), "notification handler panicked"),
        }
    }

    fn on_transport_closed(&self, epoch: u64, status: Option<u16>) {
        let mut state = self.lock();
        if !state.is_current(epoch) {
            return;
        }
        tracing::info!(epoch, status, "gotalk: connection closed");
        let event = state.reset_with_status(status);
        self.emit(event);
    }

    fn on_transport_error(&self, epoch: u64, err: &TransportError) {
        let mut state = self.lock();
        if !state.is_current(epoch) {
            return;
        }
        tracing::warn!(epoch, error = %err, "gotalk: transport error");
        let recorded = state.conn.as_mut().and_then(|c| c.close_error.take());
        let event = state.reset(Some(recorded.unwrap_or_else(|| SockError::Transport(err.to_string()))));
        self.emit(event);
    }
}

// =============================================================================
// TRANSPORT TASKS
// =============================================================================

enum ReadState {
    Version,
    Header,
    Payload(protocol::Msg),
    /// A close is underway; remaining units are discarded.
    Closing,
}

async fn read_loop<S>(sock: Sock, epoch: u64, mut stream: S)
where
    S: Stream<Item = Result<Inbound, TransportError>> + Unpin,
{
    let mut expect = ReadState::Version;
    while let Some(item) = stream.next().await {
        match item {
            Ok(Inbound::Unit(unit)) => expect = sock.read_unit(epoch, expect, unit),
            Ok(Inbound::Close(status)) => {
                sock.on_transport_closed(epoch, Some(status.unwrap_or(NO_STATUS)));
                return;
            }
            Err(e) => {
                sock.on_transport_error(epoch, &e);
                return;
            }
        }
    }
    sock.on_transport_closed(epoch, Some(ABNORMAL_CLOSURE));
}

async fn write_loop<S>(sock: Sock, epoch: u64, mut sink: S, mut rx: mpsc::UnboundedReceiver<Outbound>)
where
    S: Sink<Outbound, Error = TransportError> + Unpin,
{
    while let Some(item) = rx.recv().await {
        let close = match item {
            Outbound::Close(status) => Some(status),
            Outbound::Unit(_) => None,
        };
        if let Err(e) = sink.send(item).await {
            sock.on_transport_error(epoch, &e);
            return;
        }
        if let Some(status) = close {
            let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, sink.close()).await;
            sock.on_transport_closed(epoch, Some(status));
            return;
        }
    }
}

#[cfg(test)]
#[path = "sock_test.rs"]
mod tests;
