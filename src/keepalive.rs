//! Stay connected by reopening a socket with back-off.
//!
//! DESIGN
//! ======
//! One driver task per enabled controller. Each round it opens the socket
//! (or adopts the connection already there), waits for the `Close` event,
//! then sleeps for a delay chosen by [`Backoff`] from the cause:
//!
//! - protocol timeout: retry immediately;
//! - any other protocol error: wait the maximum, since retrying with the
//!   same protocol version will not help and the caller should react to
//!   the `Close` event instead;
//! - connectivity error: double the delay, starting from the minimum;
//! - clean close: a short delay, `max(100ms, min - time since open)`.
//!
//! The clean-close rule does not consult the previous delay but does
//! overwrite it, so an error following a clean close doubles from the short
//! delay rather than from the minimum.
//!
//! While a [`NetMonitor`] reports the network offline, and the target is
//! not a local address, the driver waits for it to come back before the
//! next attempt.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use protocol::ErrorCode;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::KeepaliveConfig;
use crate::context::{address_host, hostname_is_local};
use crate::error::SockError;
use crate::netaccess::NetMonitor;
use crate::sock::{Sock, SockEvent};
use crate::transport::Connect;

/// Shortest delay used after a clean close.
pub const CLEAN_CLOSE_MIN_DELAY: Duration = Duration::from_millis(100);

/// Reconnect delay state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    delay: Duration,
}

impl Backoff {
    #[must_use]
    pub fn new(config: KeepaliveConfig) -> Self {
        Self { min: config.min_delay, max: config.max_delay, delay: Duration::ZERO }
    }

    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn reset(&mut self) {
        self.delay = Duration::ZERO;
    }

    /// Delay before the next attempt, given what ended the last one (`None`
    /// for a clean close) and how long ago it opened.
    pub fn next(&mut self, cause: Option<&SockError>, since_open: Duration) -> Duration {
        self.delay = match cause {
            Some(SockError::Protocol(ErrorCode::Timeout)) => Duration::ZERO,
            Some(SockError::Protocol(_)) => self.max,
            Some(_) if self.delay.is_zero() => self.min,
            Some(_) => self.delay.saturating_mul(2).min(self.max),
            None => self.min.saturating_sub(since_open).max(CLEAN_CLOSE_MIN_DELAY),
        };
        self.delay
    }
}

// =============================================================================
// CONTROLLER
// =============================================================================

struct Inner {
    sock: Sock,
    addr: String,
    config: KeepaliveConfig,
    connector: Arc<dyn Connect>,
    net: NetMonitor,
    connected: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Keeps a [`Sock`] connected to one address. Clones control the same
/// driver.
#[derive(Clone)]
pub struct Keepalive {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Keepalive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keepalive")
            .field("addr", &self.inner.addr)
            .field("enabled", &self.is_enabled())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl Keepalive {
    /// Create a disabled controller. Call [`Keepalive::enable`] to start it.
    pub fn new(
        sock: Sock,
        addr: impl Into<String>,
        config: KeepaliveConfig,
        connector: Arc<dyn Connect>,
        net: NetMonitor,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                sock,
                addr: addr.into(),
                config,
                connector,
                net,
                connected: AtomicBool::new(false),
                task: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn sock(&self) -> &Sock {
        &self.inner.sock
    }

    #[must_use]
    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    /// Whether the driver task is running. `Sock::end` stops it too.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Whether the last attempt succeeded and its connection is still up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire) && self.inner.sock.is_connected()
    }

    /// Start staying connected. Opens right away unless the socket is
    /// already connected. No-op when already enabled. Must be called from
    /// within a Tokio runtime.
    pub fn enable(&self) {
        let mut task = self.inner.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let handle = tokio::spawn(run(Arc::clone(&self.inner)));
        self.inner.sock.set_keepalive(handle.abort_handle());
        *task = Some(handle);
        tracing::debug!(addr = %self.inner.addr, "gotalk: keepalive enabled");
    }

    /// Stop reconnecting. An open connection is left open.
    pub fn disable(&self) {
        let task = self.inner.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            task.abort();
            tracing::debug!(addr = %self.inner.addr, "gotalk: keepalive disabled");
        }
    }
}

/// Wait for the next `Close` event. Lagging behind is harmless, a `Close`
/// is never coalesced away because it is the last event of a connection.
async fn next_close(events: &mut broadcast::Receiver<SockEvent>) -> Option<SockError> {
    loop {
        match events.recv().await {
            Ok(SockEvent::Close(err)) => return err,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            // The socket owns the sender and we hold the socket.
            Err(broadcast::error::RecvError::Closed) => return Some(SockError::ConnectionClosed),
        }
    }
}

async fn run(inner: Arc<Inner>) {
    let mut backoff = Backoff::new(inner.config);
    let local = hostname_is_local(address_host(&inner.addr));

    loop {
        let mut events = inner.sock.subscribe();
        let (cause, opened_at) = if inner.sock.is_connected() {
            let opened_at = Instant::now();
            inner.connected.store(true, Ordering::Release);
            (next_close(&mut events).await, opened_at)
        } else {
            let result = match inner.connector.connect(&inner.addr).await {
                Ok(transport) => inner.sock.adopt(transport),
                Err(e) => Err(e),
            };
            let opened_at = Instant::now();
            match result {
                Ok(()) => {
                    backoff.reset();
                    inner.connected.store(true, Ordering::Release);
                    tracing::info!(addr = %inner.addr, "gotalk: keepalive connected");
                    (next_close(&mut events).await, opened_at)
                }
                Err(e) => {
                    tracing::warn!(addr = %inner.addr, error = %e, "gotalk: keepalive connect failed");
                    (Some(e), opened_at)
                }
            }
        };
        inner.connected.store(false, Ordering::Release);

        let cause = if inner.net.is_available() && !inner.net.is_online() && !local {
            tracing::info!(addr = %inner.addr, "gotalk: network offline, waiting to reconnect");
            backoff.reset();
            inner.net.wait_online().await;
            None
        } else {
            cause
        };

        let delay = backoff.next(cause.as_ref(), opened_at.elapsed());
        tracing::debug!(addr = %inner.addr, delay_ms = delay.as_millis(), "gotalk: reconnect scheduled");
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
#[path = "keepalive_test.rs"]
mod tests;
