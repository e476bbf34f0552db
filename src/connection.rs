//! A live JSON-RPC link to a language server.
//!
//! The connection owns request/response correlation, cancellation in both
//! directions, `$/progress` routing, and the consecutive-error accounting
//! that feeds the client's error policy. It is created fresh for every
//! start and discarded on close; the lifecycle controller never reuses one.

pub(crate) use self::router::Router;

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::channel::mpsc;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use lsp_types::notification::{Cancel, Notification};
use lsp_types::CancelParams;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::jsonrpc::{
    Error as RpcError, ErrorCode, Id, InboundRequests, Message, OutboundRequests, Request,
    Response,
};
use crate::transport::{MessageSink, MessageStream};
use crate::{Error, Result};

mod router;

/// Callback invoked with the raw `value` of a routed `$/progress` notification.
pub(crate) type ProgressHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Out-of-band connection conditions surfaced to the lifecycle controller.
#[derive(Debug)]
pub(crate) enum ConnectionEvent {
    /// A message failed to decode, encode, or transfer.
    Error {
        error: std::io::Error,
        /// Consecutive faults since the last successfully transferred message.
        consecutive: u32,
    },
    /// The connection closed; no further messages will flow.
    Closed,
}

pub(crate) struct Connection {
    tx: mpsc::UnboundedSender<Message>,
    outbound: OutboundRequests,
    inbound: InboundRequests,
    progress: DashMap<Id, ProgressHandler>,
    request_id: AtomicI64,
    closed: AtomicBool,
}

impl Connection {
    /// Creates a connection and the outgoing message queue drained by
    /// [`Connection::serve`].
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded();

        let connection = Arc::new(Connection {
            tx,
            outbound: OutboundRequests::new(),
            inbound: InboundRequests::new(),
            progress: DashMap::new(),
            request_id: AtomicI64::new(0),
            closed: AtomicBool::new(false),
        });

        (connection, rx)
    }

    /// Sends a request and waits for the matching response.
    ///
    /// Cancelling `token` sends a `$/cancelRequest` notification and keeps
    /// waiting: cancellation is a request to the server, which answers with
    /// a "request cancelled" error (surfaced as [`Error::Cancelled`]) or, if
    /// the work already finished, with the regular result. A cancel arriving
    /// after the response is a no-op.
    pub async fn send_request_raw(
        &self,
        method: &'static str,
        params: Value,
        token: &CancellationToken,
    ) -> Result<Value> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let id = Id::Number(self.request_id.fetch_add(1, Ordering::Relaxed));
        let mut rx = self.outbound.wait(id.clone());

        let mut request = Request::build(method).id(id.clone());
        if !params.is_null() {
            request = request.params(params);
        }
        self.enqueue(Message::Request(request.finish()))?;

        tokio::select! {
            biased;
            response = &mut rx => into_result(response),
            _ = token.cancelled() => {
                self.send_cancel(id);
                into_result(rx.await)
            }
        }
    }

    /// Sends a typed request.
    pub async fn send_request<R>(&self, params: R::Params, token: &CancellationToken) -> Result<R::Result>
    where
        R: lsp_types::request::Request,
    {
        let params = serde_json::to_value(params)?;
        let result = self.send_request_raw(R::METHOD, params, token).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Enqueues a notification without waiting.
    pub fn send_notification_raw(&self, method: &'static str, params: Value) -> Result<()> {
        let mut request = Request::build(method);
        if !params.is_null() {
            request = request.params(params);
        }
        self.enqueue(Message::Request(request.finish()))
    }

    /// Enqueues a typed notification without waiting.
    pub fn send_notification<N>(&self, params: N::Params) -> Result<()>
    where
        N: Notification,
    {
        let params = serde_json::to_value(params)?;
        self.send_notification_raw(N::METHOD, params)
    }

    /// Routes `$/progress` notifications carrying `token` to `handler`.
    pub fn on_progress(&self, token: Id, handler: ProgressHandler) {
        self.progress.insert(token, handler);
    }

    /// Stops routing progress for `token`.
    pub fn remove_progress(&self, token: &Id) {
        self.progress.remove(token);
    }

    /// Returns `true` once the connection has been closed from either side.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closes the connection, rejecting every pending outbound request with
    /// a stable "connection closed" failure and aborting inbound handlers.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.tx.close_channel();
            self.outbound.reject_all();
            self.inbound.cancel_all();
            self.progress.clear();
        }
    }

    /// Drives the connection until the server side closes.
    ///
    /// Inbound notifications are handled strictly in arrival order; inbound
    /// requests run concurrently under abort handles so `$/cancelRequest`
    /// can terminate them. `events` receives decode faults (with consecutive
    /// counting, reset by any good message) and the final `Closed` event.
    pub async fn serve(
        self: Arc<Self>,
        router: Router,
        mut reader: MessageStream,
        writer: MessageSink,
        rx: mpsc::UnboundedReceiver<Message>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        let mut write_task = Box::pin(rx.map(Ok).forward(writer).fuse());
        let mut inflight: FuturesUnordered<
            std::pin::Pin<Box<dyn futures::Future<Output = Option<Response>> + Send>>,
        > = FuturesUnordered::new();
        let mut consecutive = 0u32;

        loop {
            tokio::select! {
                biased;
                Some(response) = inflight.next(), if !inflight.is_empty() => {
                    if let Some(response) = response {
                        let _ = self.tx.unbounded_send(Message::Response(response));
                    }
                }
                result = &mut write_task => {
                    if let Err(error) = result {
                        consecutive += 1;
                        let _ = events.unbounded_send(ConnectionEvent::Error { error, consecutive });
                    }
                }
                message = reader.next() => match message {
                    Some(Ok(message)) => match self.handle(message, &router, &mut inflight).await {
                        Ok(()) => consecutive = 0,
                        Err(error) => {
                            consecutive += 1;
                            let _ = events.unbounded_send(ConnectionEvent::Error { error, consecutive });
                        }
                    },
                    Some(Err(error)) => {
                        consecutive += 1;
                        let _ = events.unbounded_send(ConnectionEvent::Error { error, consecutive });
                    }
                    None => break,
                }
            }
        }

        self.close();
        let _ = events.unbounded_send(ConnectionEvent::Closed);
    }

    async fn handle(
        &self,
        message: Message,
        router: &Router,
        inflight: &mut FuturesUnordered<
            std::pin::Pin<Box<dyn futures::Future<Output = Option<Response>> + Send>>,
        >,
    ) -> std::io::Result<()> {
        match message {
            Message::Response(response) => self.outbound.fulfil(response),
            Message::Request(request) => match request.id().cloned() {
                Some(id) if request.method().is_empty() => {
                    let response = Response::from_error(id, RpcError::invalid_request());
                    let _ = self.tx.unbounded_send(Message::Response(response));
                    return Err(invalid_traffic("request without a method"));
                }
                Some(id) => {
                    let handler = router.dispatch_request(request);
                    inflight.push(self.inbound.execute(id, handler));
                }
                None => match request.method() {
                    Cancel::METHOD => self.handle_cancel(request),
                    "$/progress" => self.dispatch_progress(request),
                    _ => router.dispatch_notification(request).await,
                },
            },
            Message::Invalid { id } => {
                if let Some(Some(id)) = id {
                    let response = Response::from_error(id, RpcError::invalid_request());
                    let _ = self.tx.unbounded_send(Message::Response(response));
                }
                return Err(invalid_traffic("invalid JSON-RPC message"));
            }
        }

        Ok(())
    }

    fn handle_cancel(&self, request: Request) {
        let (_, _, params) = request.into_parts();
        match serde_json::from_value::<CancelParams>(params.unwrap_or(Value::Null)) {
            Ok(params) => self.inbound.cancel(&Id::from(params.id)),
            Err(e) => warn!("malformed $/cancelRequest: {}", e),
        }
    }

    fn dispatch_progress(&self, request: Request) {
        let (_, _, params) = request.into_parts();
        let params = match params {
            Some(params) => params,
            None => return,
        };

        let token = match params.get("token").cloned().map(serde_json::from_value::<Id>) {
            Some(Ok(token)) => token,
            _ => {
                warn!("malformed $/progress notification");
                return;
            }
        };

        let value = params.get("value").cloned().unwrap_or(Value::Null);
        let handler = self.progress.get(&token).map(|entry| entry.value().clone());
        match handler {
            Some(handler) => handler(value),
            None => debug!("dropping progress for unknown token: {}", token),
        }
    }

    fn send_cancel(&self, id: Id) {
        let params = CancelParams { id: id.into() };
        match serde_json::to_value(params) {
            Ok(params) => {
                let _ = self.send_notification_raw(Cancel::METHOD, params);
            }
            Err(e) => warn!("failed to serialize $/cancelRequest: {}", e),
        }
    }

    fn enqueue(&self, message: Message) -> Result<()> {
        self.tx
            .unbounded_send(message)
            .map_err(|_| Error::ConnectionClosed)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("outbound", &self.outbound)
            .field("inbound", &self.inbound)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn into_result(
    response: std::result::Result<Response, futures::channel::oneshot::Canceled>,
) -> Result<Value> {
    let response = response.map_err(|_| Error::ConnectionClosed)?;
    let (_, body) = response.into_parts();
    body.map_err(|err| {
        if err.code == ErrorCode::RequestCancelled {
            Error::Cancelled
        } else {
            Error::Rpc(err)
        }
    })
}

fn invalid_traffic(message: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, message.to_string())
}

#[cfg(test)]
mod tests {
    use lsp_types::notification::LogMessage;
    use lsp_types::request::Shutdown;
    use serde_json::json;

    use crate::test_support::MockServer;

    use super::*;

    #[tokio::test(flavor = "current_thread")]
    async fn correlates_request_and_response() {
        let (server, _events) = MockServer::spawn(Router::new());

        let respond = {
            let server = server.clone();
            tokio::spawn(async move {
                let request = server.recv_request().await;
                server
                    .respond(Response::from_ok(request.id().unwrap().clone(), json!(null)))
                    .await;
            })
        };

        let token = CancellationToken::new();
        let result = server
            .connection()
            .send_request::<Shutdown>((), &token)
            .await;
        assert!(result.is_ok());
        respond.await.unwrap();
    }

    #[tokio::test(flavor = "current_thread")]
    async fn cancelled_request_sends_cancel_notification() {
        let (server, _events) = MockServer::spawn(Router::new());

        let token = CancellationToken::new();
        let connection = server.connection();

        let request_fut = tokio::spawn({
            let connection = connection.clone();
            let token = token.clone();
            async move { connection.send_request::<Shutdown>((), &token).await }
        });

        // Wait for the request to hit the wire, then cancel it.
        let request = server.recv_request().await;
        token.cancel();

        let cancel = server.recv_request().await;
        assert_eq!(cancel.method(), "$/cancelRequest");
        assert_eq!(
            cancel.params().unwrap()["id"],
            json!(match request.id().unwrap() {
                Id::Number(n) => *n,
                _ => panic!("expected numeric id"),
            })
        );

        // The caller keeps waiting until the server acknowledges the cancel.
        server
            .respond(Response::from_error(
                request.id().unwrap().clone(),
                crate::jsonrpc::Error::request_cancelled(),
            ))
            .await;

        let result = request_fut.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn notifications_dispatch_in_order() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut router = Router::new();
        {
            let seen = seen.clone();
            router.notification::<LogMessage, _, _>(move |params| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(params.message);
                }
            });
        }

        let (server, _events) = MockServer::spawn(router);
        for i in 0..3 {
            server
                .notify(
                    "window/logMessage",
                    json!({"type": 4, "message": format!("msg-{i}")}),
                )
                .await;
        }
        server.settle().await;

        assert_eq!(*seen.lock().unwrap(), vec!["msg-0", "msg-1", "msg-2"]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn malformed_traffic_counts_consecutive_errors() {
        let (server, mut events) = MockServer::spawn(Router::new());

        server.send_raw_error().await;
        server.send_raw_error().await;
        server.notify("window/logMessage", json!({"type": 4, "message": ""})).await;
        server.send_raw_error().await;
        server.settle().await;

        let mut counts = Vec::new();
        while let Ok(Some(event)) = events.try_next() {
            if let ConnectionEvent::Error { consecutive, .. } = event {
                counts.push(consecutive);
            }
        }
        assert_eq!(counts, vec![1, 2, 1]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn close_rejects_pending_requests() {
        let (server, _events) = MockServer::spawn(Router::new());
        let connection = server.connection();

        let token = CancellationToken::new();
        let request_fut = tokio::spawn({
            let connection = connection.clone();
            async move { connection.send_request::<Shutdown>((), &token).await }
        });

        let _ = server.recv_request().await;
        connection.close();

        let result = request_fut.await.unwrap();
        assert!(matches!(result, Err(Error::ConnectionClosed)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn server_end_emits_closed_event() {
        let (server, mut events) = MockServer::spawn(Router::new());
        server.disconnect().await;
        server.settle().await;

        let mut closed = false;
        while let Ok(Some(event)) = events.try_next() {
            if matches!(event, ConnectionEvent::Closed) {
                closed = true;
            }
        }
        assert!(closed);
    }
}
