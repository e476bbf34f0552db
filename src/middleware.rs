//! Optional interception hooks around outbound protocol traffic.
//!
//! Hooks are type-erased: they observe the method name and the already
//! serialized `params` value, and decide whether to forward (possibly
//! modified) input to `next`, short-circuit with their own result, or
//! transform the result on the way back. `next` is consumed by value, so a
//! hook can invoke it at most once; the runtime never retries after a
//! short-circuit.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::Result;

/// Continuation representing the default behavior of an intercepted request.
pub type NextRequest = Box<dyn FnOnce(Value) -> BoxFuture<'static, Result<Value>> + Send>;

/// Continuation representing the default behavior of an intercepted notification.
pub type NextNotification = Box<dyn FnOnce(Value) -> BoxFuture<'static, Result<()>> + Send>;

/// A hook wrapping every outbound feature request.
pub type RequestHook =
    dyn Fn(&'static str, Value, NextRequest) -> BoxFuture<'static, Result<Value>> + Send + Sync;

/// A hook wrapping every outbound document notification.
pub type NotificationHook =
    dyn Fn(&'static str, Value, NextNotification) -> BoxFuture<'static, Result<()>> + Send + Sync;

/// The set of middleware hooks supplied through
/// [`ClientOptions`](crate::ClientOptions).
///
/// Every field defaults to `None`, meaning the pipeline goes straight to the
/// wire.
#[derive(Clone, Default)]
pub struct Middleware {
    /// Wraps feature requests (hover, completion, diagnostics, ...).
    pub request: Option<Arc<RequestHook>>,
    /// Wraps document synchronization and file event notifications.
    pub notification: Option<Arc<NotificationHook>>,
}

impl std::fmt::Debug for Middleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Middleware")
            .field("request", &self.request.as_ref().map(|_| "..."))
            .field("notification", &self.notification.as_ref().map(|_| "..."))
            .finish()
    }
}
