//! Explicit client context: default handlers, default address and
//! settings shared by every socket created through it.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::{KeepaliveConfig, SockConfig, env_flag};
use crate::error::{HandlerError, SockError};
use crate::handlers::Handlers;
use crate::keepalive::Keepalive;
use crate::netaccess::NetMonitor;
use crate::sock::Sock;
use crate::transport::{Connect, WsConnector};

/// Created once at startup and then handed to whatever opens connections.
/// Settings changed later apply to sockets created afterwards; handlers
/// registered later apply to every socket, since they share the registry.
#[derive(Clone)]
pub struct Context {
    handlers: Handlers,
    default_address: Option<String>,
    development_mode: bool,
    sock_config: SockConfig,
    keepalive_config: KeepaliveConfig,
    net: NetMonitor,
    connector: Arc<dyn Connect>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("handlers", &self.handlers)
            .field("default_address", &self.default_address)
            .field("development_mode", &self.development_mode)
            .field("sock_config", &self.sock_config)
            .field("keepalive_config", &self.keepalive_config)
            .finish_non_exhaustive()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: Handlers::new(),
            default_address: None,
            development_mode: false,
            sock_config: SockConfig::default(),
            keepalive_config: KeepaliveConfig::default(),
            net: NetMonitor::new(),
            connector: Arc::new(WsConnector),
        }
    }

    /// Build a context from environment variables.
    ///
    /// Optional:
    /// - `GOTALK_ADDR`: default responder address
    /// - `GOTALK_DEV`: development mode; defaults to on when the default
    ///   address points at this machine
    /// - everything read by [`SockConfig::from_env`] and
    ///   [`KeepaliveConfig::from_env`]
    #[must_use]
    pub fn from_env() -> Self {
        let default_address = std::env::var("GOTALK_ADDR").ok().filter(|a| !a.trim().is_empty());
        let development_mode = env_flag("GOTALK_DEV").unwrap_or_else(|| {
            default_address
                .as_deref()
                .is_some_and(|addr| hostname_is_local(address_host(addr)))
        });
        Self {
            default_address,
            development_mode,
            sock_config: SockConfig::from_env(),
            keepalive_config: KeepaliveConfig::from_env(),
            ..Self::new()
        }
    }

    // =========================================================================
    // SETTINGS
    // =========================================================================

    #[must_use]
    pub fn handlers(&self) -> &Handlers {
        &self.handlers
    }

    #[must_use]
    pub fn default_address(&self) -> Option<&str> {
        self.default_address.as_deref()
    }

    pub fn set_default_address(&mut self, addr: impl Into<String>) {
        self.default_address = Some(addr.into());
    }

    #[must_use]
    pub fn development_mode(&self) -> bool {
        self.development_mode
    }

    pub fn set_development_mode(&mut self, on: bool) {
        self.development_mode = on;
    }

    #[must_use]
    pub fn sock_config(&self) -> SockConfig {
        self.sock_config
    }

    pub fn set_sock_config(&mut self, config: SockConfig) {
        self.sock_config = config;
    }

    #[must_use]
    pub fn keepalive_config(&self) -> KeepaliveConfig {
        self.keepalive_config
    }

    pub fn set_keepalive_config(&mut self, config: KeepaliveConfig) {
        self.keepalive_config = config;
    }

    #[must_use]
    pub fn net(&self) -> &NetMonitor {
        &self.net
    }

    /// Replace the connector used by [`Context::open`] and
    /// [`Context::connection`].
    pub fn set_connector(&mut self, connector: Arc<dyn Connect>) {
        self.connector = connector;
    }

    // =========================================================================
    // HANDLERS
    // =========================================================================

    /// See [`Handlers::handle_request`].
    pub fn handle_request<In, Out, F, Fut>(&self, op: impl Into<String>, handler: F)
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + 'static,
        F: Fn(In, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, HandlerError>> + Send + 'static,
    {
        self.handlers.handle_request(op, handler);
    }

    /// See [`Handlers::handle_buffer_request`].
    pub fn handle_buffer_request<F, Fut>(&self, op: impl Into<String>, handler: F)
    where
        F: Fn(Vec<u8>, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>, HandlerError>> + Send + 'static,
    {
        self.handlers.handle_buffer_request(op, handler);
    }

    /// See [`Handlers::handle_notification`].
    pub fn handle_notification<In, F>(&self, name: impl Into<String>, handler: F)
    where
        In: DeserializeOwned + 'static,
        F: Fn(In, String) + Send + Sync + 'static,
    {
        self.handlers.handle_notification(name, handler);
    }

    /// See [`Handlers::handle_buffer_notification`].
    pub fn handle_buffer_notification<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Vec<u8>, String) + Send + Sync + 'static,
    {
        self.handlers.handle_buffer_notification(name, handler);
    }

    // =========================================================================
    // CONNECTIONS
    // =========================================================================

    /// Resolve `addr` against the default address and make it a WebSocket
    /// URL.
    ///
    /// # Errors
    ///
    /// Returns [`SockError::AddressNotSpecified`] when neither `addr` nor
    /// the default address is set.
    pub fn resolve_address(&self, addr: Option<&str>) -> Result<String, SockError> {
        let addr = addr
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .or_else(|| self.default_address.as_deref().map(str::trim))
            .filter(|a| !a.is_empty())
            .ok_or(SockError::AddressNotSpecified)?;
        if addr.starts_with("ws://") || addr.starts_with("wss://") {
            Ok(addr.to_owned())
        } else {
            Ok(format!("ws://{addr}"))
        }
    }

    /// A new socket using this context's handlers and settings, with no
    /// transport attached.
    #[must_use]
    pub fn sock(&self) -> Sock {
        let config = SockConfig { development_mode: self.development_mode, ..self.sock_config };
        Sock::new(self.handlers.clone(), config)
    }

    /// Open a one-shot connection.
    ///
    /// # Errors
    ///
    /// Returns [`SockError::AddressNotSpecified`] or a connect error.
    pub async fn open(&self, addr: Option<&str>) -> Result<Sock, SockError> {
        let addr = self.resolve_address(addr)?;
        let sock = self.sock();
        sock.open_with(&addr, self.connector.as_ref()).await?;
        Ok(sock)
    }

    /// A socket kept connected to `addr` by an enabled keepalive controller.
    /// Returns before the first connection attempt completes; requests made
    /// in the meantime are queued.
    ///
    /// # Errors
    ///
    /// Returns [`SockError::AddressNotSpecified`].
    pub fn connection(&self, addr: Option<&str>) -> Result<Keepalive, SockError> {
        let addr = self.resolve_address(addr)?;
        let keepalive = Keepalive::new(
            self.sock(),
            addr,
            self.keepalive_config,
            Arc::clone(&self.connector),
            self.net.clone(),
        );
        keepalive.enable();
        Ok(keepalive)
    }
}

// =============================================================================
// ADDRESSES
// =============================================================================

/// Host part of an address, with scheme, path, credentials and port
/// removed. IPv6 hosts keep their brackets.
#[must_use]
pub fn address_host(addr: &str) -> &str {
    let rest = addr.split_once("://").map_or(addr, |(_, rest)| rest);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
    strip_port(host_port)
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return host.find(']').map_or(host, |end| &host[..=end]);
    }
    host.split_once(':').map_or(host, |(name, _)| name)
}

/// Whether `host` names this machine: `localhost`, `127.0.0.1`, `[::1]` or
/// an mDNS `.local` name. A trailing port is ignored.
#[must_use]
pub fn hostname_is_local(host: &str) -> bool {
    let host = strip_port(host);
    host.eq_ignore_ascii_case("localhost")
        || host == "127.0.0.1"
        || host == "[::1]"
        || host.to_ascii_lowercase().ends_with(".local")
}

#[cfg(test)]
#[path = "context_test.rs"]
mod tests;
