//! Network availability flag consulted by keepalive controllers.
//!
//! Nothing in a plain process reports link state, so a fresh monitor is
//! *unavailable* and keepalives never defer on it. Embedders that do know
//! (a mobile shell, a NetworkManager watcher) call [`NetMonitor::set_online`],
//! which also marks the monitor available.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;

#[derive(Debug)]
struct Inner {
    available: AtomicBool,
    online: watch::Sender<bool>,
}

/// Shared online/offline flag with change notification. Clones observe the
/// same state.
#[derive(Debug, Clone)]
pub struct NetMonitor {
    inner: Arc<Inner>,
}

impl Default for NetMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl NetMonitor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                available: AtomicBool::new(false),
                online: watch::Sender::new(true),
            }),
        }
    }

    /// Whether anything reports network state to this monitor.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.inner.online.borrow()
    }

    /// Record a link state change and wake anything waiting for the network.
    pub fn set_online(&self, online: bool) {
        self.inner.available.store(true, Ordering::Release);
        let was = self.inner.online.send_replace(online);
        if was != online {
            tracing::info!(online, "gotalk: network state changed");
        }
    }

    /// Resolve once the monitor reports online. Returns immediately when it
    /// already does.
    pub async fn wait_online(&self) {
        let mut rx = self.inner.online.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|online| *online).await;
    }
}

#[cfg(test)]
#[path = "netaccess_test.rs"]
mod tests;
