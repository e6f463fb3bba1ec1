//! Request and notification handler registry.
//!
//! DESIGN
//! ======
//! Two name-keyed tables, one for request operations and one for
//! notification names. The empty name is the fallback slot: a lookup that
//! misses its exact name falls back to it.
//!
//! Handlers work on raw payload bytes. The JSON variants (`handle_request`,
//! `handle_notification`) wrap a typed closure in a byte-level one that
//! decodes the payload with `serde_json`, treating an empty payload as
//! `null`.
//!
//! A `Handlers` value is a shared handle. Sockets created from a context
//! hold a clone of its registry, so handlers registered later are seen by
//! sockets that already exist.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::HandlerError;

/// Name under which fallback handlers are registered.
pub const FALLBACK: &str = "";

pub type RequestFuture = Pin<Box<dyn Future<Output = Result<Vec<u8>, HandlerError>> + Send>>;

/// Byte-level request handler. Receives the payload and the operation name.
pub type RequestHandler = Arc<dyn Fn(Vec<u8>, String) -> RequestFuture + Send + Sync>;

/// Byte-level notification handler. Receives the payload and the
/// notification name. An `Err` is logged by the socket and otherwise
/// dropped; notifications have no reply.
pub type NotificationHandler = Arc<dyn Fn(Vec<u8>, String) -> Result<(), HandlerError> + Send + Sync>;

#[derive(Default)]
struct Tables {
    requests: HashMap<String, RequestHandler>,
    notifications: HashMap<String, NotificationHandler>,
}

#[derive(Clone, Default)]
pub struct Handlers {
    tables: Arc<RwLock<Tables>>,
}

impl std::fmt::Debug for Handlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        let mut requests: Vec<_> = tables.requests.keys().collect();
        let mut notifications: Vec<_> = tables.notifications.keys().collect();
        requests.sort();
        notifications.sort();
        f.debug_struct("Handlers")
            .field("requests", &requests)
            .field("notifications", &notifications)
            .finish()
    }
}

/// Decode a JSON payload. An empty payload is `null`, so `()` and `Option`
/// inputs accept bodiless messages.
pub(crate) fn decode_json<T: DeserializeOwned>(payload: &[u8]) -> Result<T, serde_json::Error> {
    if payload.is_empty() {
        serde_json::from_slice(b"null")
    } else {
        serde_json::from_slice(payload)
    }
}

impl Handlers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // REGISTRATION
    // =========================================================================

    /// Register a byte-level request handler for `op`. Pass `""` to set the
    /// fallback. Replaces any handler already registered under that name.
    pub fn handle_buffer_request<F, Fut>(&self, op: impl Into<String>, handler: F)
    where
        F: Fn(Vec<u8>, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>, HandlerError>> + Send + 'static,
    {
        let handler: RequestHandler = Arc::new(move |payload, op| Box::pin(handler(payload, op)));
        self.write().requests.insert(op.into(), handler);
    }

    /// Register a JSON request handler for `op`.
    ///
    /// A payload that does not decode as `In` is answered with an error
    /// response `invalid request payload: ...` without calling `handler`.
    pub fn handle_request<In, Out, F, Fut>(&self, op: impl Into<String>, handler: F)
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + 'static,
        F: Fn(In, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.handle_buffer_request(op, move |payload: Vec<u8>, op: String| {
            let handler = Arc::clone(&handler);
            async move {
                let input: In = decode_json(&payload)
                    .map_err(|e| HandlerError::new(format!("invalid request payload: {e}")))?;
                let output = handler(input, op).await?;
                Ok(serde_json::to_vec(&output)?)
            }
        });
    }

    /// Register a byte-level notification handler for `name`. Pass `""` to
    /// set the fallback.
    pub fn handle_buffer_notification<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Vec<u8>, String) + Send + Sync + 'static,
    {
        let handler: NotificationHandler = Arc::new(move |payload, name| {
            handler(payload, name);
            Ok(())
        });
        self.write().notifications.insert(name.into(), handler);
    }

    /// Register a JSON notification handler for `name`. Notifications whose
    /// payload does not decode as `In` are dropped.
    pub fn handle_notification<In, F>(&self, name: impl Into<String>, handler: F)
    where
        In: DeserializeOwned + 'static,
        F: Fn(In, String) + Send + Sync + 'static,
    {
        let handler: NotificationHandler = Arc::new(move |payload: Vec<u8>, name: String| {
            let input: In = decode_json(&payload)
                .map_err(|e| HandlerError::new(format!("invalid notification payload: {e}")))?;
            handler(input, name);
            Ok(())
        });
        self.write().notifications.insert(name.into(), handler);
    }

    // =========================================================================
    // LOOKUP
    // =========================================================================

    /// Handler for `op`, or the fallback when there is no exact match.
    #[must_use]
    pub fn find_request_handler(&self, op: &str) -> Option<RequestHandler> {
        let tables = self.read();
        tables
            .requests
            .get(op)
            .or_else(|| tables.requests.get(FALLBACK))
            .cloned()
    }

    /// Handler for `name`, or the fallback when there is no exact match.
    #[must_use]
    pub fn find_notification_handler(&self, name: &str) -> Option<NotificationHandler> {
        let tables = self.read();
        tables
            .notifications
            .get(name)
            .or_else(|| tables.notifications.get(FALLBACK))
            .cloned()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "handlers_test.rs"]
mod tests;
