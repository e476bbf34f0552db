//! Bookkeeping for in-flight JSON-RPC requests.

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::channel::oneshot;
use futures::future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Error, Id, Response};

/// Correlation slots for requests sent to the server.
///
/// Each outbound request reserves a slot holding the `oneshot` sender its
/// caller waits on. The table latches shut when the connection closes:
/// every open slot fails at once, and any reservation made after the latch
/// fails immediately, so a caller racing the close observes the same stable
/// "connection closed" outcome as one that arrived late.
pub(crate) struct OutboundRequests {
    slots: Mutex<Slots>,
}

enum Slots {
    Open(HashMap<Id, oneshot::Sender<Response>>),
    Closed,
}

impl OutboundRequests {
    /// Creates an open slot table.
    pub fn new() -> Self {
        OutboundRequests {
            slots: Mutex::new(Slots::Open(HashMap::new())),
        }
    }

    /// Reserves the slot for `id` and returns the receiver its response will
    /// be routed to.
    ///
    /// On a latched table the receiver fails straight away with
    /// [`oneshot::Canceled`], which callers surface as a connection-closed
    /// error.
    pub fn wait(&self, id: Id) -> oneshot::Receiver<Response> {
        let (tx, rx) = oneshot::channel();

        match &mut *self.slots.lock().expect("outbound slots poisoned") {
            Slots::Open(slots) => {
                let stale = slots.insert(id, tx);
                debug_assert!(stale.is_none(), "request IDs are allocated monotonically");
            }
            // Dropping `tx` here fails the receiver immediately.
            Slots::Closed => {}
        }

        rx
    }

    /// Routes a response to the caller waiting on its request ID.
    pub fn fulfil(&self, response: Response) {
        let waiter = match &mut *self.slots.lock().expect("outbound slots poisoned") {
            Slots::Open(slots) => slots.remove(response.id()),
            Slots::Closed => None,
        };

        match waiter {
            // The send only fails if the caller stopped waiting.
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => debug!(
                "discarding response for unknown or abandoned request ID: {}",
                response.id()
            ),
        }
    }

    /// Latches the table shut, failing every pending and future waiter.
    pub fn reject_all(&self) {
        *self.slots.lock().expect("outbound slots poisoned") = Slots::Closed;
    }
}

impl Debug for OutboundRequests {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match &*self.slots.lock().expect("outbound slots poisoned") {
            Slots::Open(slots) => f.debug_set().entries(slots.keys()).finish(),
            Slots::Closed => f.write_str("<closed>"),
        }
    }
}

/// Requests received from the server that are still being handled.
///
/// Each handler runs inside a cancellation scope keyed by its request ID. A
/// `$/cancelRequest` notification fires the scope, which resolves the wrapped
/// future to a "request cancelled" error response and drops the handler on
/// the spot; the scope entry is removed when the wrapper resolves, never by
/// the canceller, so cancelling twice is harmless.
pub(crate) struct InboundRequests {
    scopes: Arc<Mutex<HashMap<Id, CancellationToken>>>,
}

impl InboundRequests {
    /// Creates an empty scope table.
    pub fn new() -> Self {
        InboundRequests {
            scopes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Wraps `handler` in the cancellation scope for `id`.
    ///
    /// A request reusing a live ID is answered with an "invalid request"
    /// error without disturbing the handler already running under that ID.
    pub fn execute<F>(
        &self,
        id: Id,
        handler: F,
    ) -> std::pin::Pin<Box<dyn Future<Output = Option<Response>> + Send + 'static>>
    where
        F: Future<Output = Option<Response>> + Send + 'static,
    {
        let scope = CancellationToken::new();

        {
            let mut scopes = self.scopes.lock().expect("inbound scopes poisoned");
            if scopes.contains_key(&id) {
                let duplicate = Response::from_error(id, Error::invalid_request());
                return Box::pin(future::ready(Some(duplicate)));
            }
            scopes.insert(id.clone(), scope.clone());
        }

        let scopes = self.scopes.clone();
        Box::pin(async move {
            let response = tokio::select! {
                biased;
                _ = scope.cancelled() => {
                    Some(Response::from_error(id.clone(), Error::request_cancelled()))
                }
                response = handler => response,
            };

            scopes.lock().expect("inbound scopes poisoned").remove(&id);
            response
        })
    }

    /// Fires the cancellation scope for `id`, if it is still live.
    pub fn cancel(&self, id: &Id) {
        let scope = self
            .scopes
            .lock()
            .expect("inbound scopes poisoned")
            .get(id)
            .cloned();

        match scope {
            Some(scope) => {
                scope.cancel();
                info!("cancelling in-flight request with ID: {}", id);
            }
            None => debug!("no in-flight request with ID {} to cancel, ignoring", id),
        }
    }

    /// Fires every live scope; each handler resolves to a cancelled response.
    pub fn cancel_all(&self) {
        let scopes: Vec<CancellationToken> = self
            .scopes
            .lock()
            .expect("inbound scopes poisoned")
            .values()
            .cloned()
            .collect();

        for scope in scopes {
            scope.cancel();
        }
    }
}

impl Debug for InboundRequests {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let scopes = self.scopes.lock().expect("inbound scopes poisoned");
        f.debug_set().entries(scopes.keys()).finish()
    }
}
