//! In-process mock servers for runtime tests.
//!
//! Two layers: [`MockServer`] drives a bare [`Connection`] for transport
//! level tests, while [`ServerFixture`] implements [`Connect`] and speaks
//! enough of the protocol (initialize, shutdown, scripted responses, held
//! requests) to exercise a full [`LanguageClient`].

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use lsp_types::{InitializeResult, MessageType, ProgressToken, ServerCapabilities, Url, WorkDoneProgress};
use serde_json::Value;

use crate::connection::{Connection, ConnectionEvent, Router};
use crate::host::Host;
use crate::jsonrpc::{Error as RpcError, Id, Message, Request, Response};
use crate::transport::{Connect, MessageSink, MessageStream};

fn sink_error(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, e.to_string())
}

/// Lets other tasks on the current-thread runtime run to completion.
pub(crate) async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

/// A mock server driving a bare [`Connection`].
#[derive(Clone)]
pub(crate) struct MockServer {
    inner: Arc<MockServerInner>,
}

struct MockServerInner {
    connection: Arc<Connection>,
    to_client: mpsc::UnboundedSender<io::Result<Message>>,
    from_client: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
}

impl MockServer {
    pub fn spawn(router: Router) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (connection, outgoing) = Connection::new();
        let (to_client, to_client_rx) = mpsc::unbounded::<io::Result<Message>>();
        let (seen_tx, seen_rx) = mpsc::unbounded::<Message>();

        let reader: MessageStream = Box::pin(to_client_rx);
        let writer: MessageSink = Box::pin(seen_tx.sink_map_err(sink_error));

        let (events_tx, events_rx) = mpsc::unbounded();
        tokio::spawn(connection.clone().serve(router, reader, writer, outgoing, events_tx));

        let server = MockServer {
            inner: Arc::new(MockServerInner {
                connection,
                to_client,
                from_client: tokio::sync::Mutex::new(seen_rx),
            }),
        };
        (server, events_rx)
    }

    pub fn connection(&self) -> Arc<Connection> {
        self.inner.connection.clone()
    }

    /// The next request or notification the client sends.
    pub async fn recv_request(&self) -> Request {
        let mut from_client = self.inner.from_client.lock().await;
        loop {
            match from_client.next().await {
                Some(Message::Request(request)) => return request,
                Some(_) => continue,
                None => panic!("client hung up"),
            }
        }
    }

    pub async fn respond(&self, response: Response) {
        let _ = self
            .inner
            .to_client
            .unbounded_send(Ok(Message::Response(response)));
    }

    pub async fn notify(&self, method: &str, params: Value) {
        let message = Request::build(method.to_owned()).params(params).finish();
        let _ = self
            .inner
            .to_client
            .unbounded_send(Ok(Message::Request(message)));
        settle().await;
    }

    pub async fn send_raw_error(&self) {
        let _ = self.inner.to_client.unbounded_send(Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "bad frame",
        )));
        settle().await;
    }

    pub async fn disconnect(&self) {
        self.inner.to_client.close_channel();
    }

    pub async fn settle(&self) {
        settle().await;
    }
}

/// A scripted language server behind a [`Connect`] factory.
///
/// Every `connect` call produces a fresh session whose traffic is recorded.
/// `initialize` and `shutdown` are answered automatically; other requests
/// are answered from the scripted response table, parked when their method
/// is held, or answered with `null`.
#[derive(Clone)]
pub(crate) struct ServerFixture {
    inner: Arc<FixtureInner>,
}

struct FixtureInner {
    capabilities: Mutex<ServerCapabilities>,
    responses: Mutex<HashMap<String, Value>>,
    held: Mutex<HashSet<String>>,
    pending: Mutex<Vec<Request>>,
    sessions: Mutex<Vec<Session>>,
    initialize_errors: AtomicU32,
    request_seq: AtomicI64,
}

#[derive(Clone)]
struct Session {
    to_client: mpsc::UnboundedSender<io::Result<Message>>,
    log: Arc<Mutex<Vec<Message>>>,
}

impl ServerFixture {
    pub fn new(capabilities: ServerCapabilities) -> Self {
        ServerFixture {
            inner: Arc::new(FixtureInner {
                capabilities: Mutex::new(capabilities),
                responses: Mutex::new(HashMap::new()),
                held: Mutex::new(HashSet::new()),
                pending: Mutex::new(Vec::new()),
                sessions: Mutex::new(Vec::new()),
                initialize_errors: AtomicU32::new(0),
                request_seq: AtomicI64::new(1_000),
            }),
        }
    }

    /// Scripts the result value for a request method.
    pub fn set_response(&self, method: &str, result: Value) {
        self.inner
            .responses
            .lock()
            .unwrap()
            .insert(method.to_owned(), result);
    }

    /// Parks requests for `method` until [`respond_held`](Self::respond_held).
    pub fn hold(&self, method: &str) {
        self.inner.held.lock().unwrap().insert(method.to_owned());
    }

    /// Fails the next `count` initialize requests with an internal error.
    pub fn fail_initialize(&self, count: u32) {
        self.inner.initialize_errors.store(count, Ordering::SeqCst);
    }

    /// The number of parked requests for `method`.
    pub fn held_count(&self, method: &str) -> usize {
        self.inner
            .pending
            .lock()
            .unwrap()
            .iter()
            .filter(|request| request.method() == method)
            .count()
    }

    /// Responds to the oldest parked request for `method`.
    pub async fn respond_held(&self, method: &str, result: Value) -> bool {
        let request = {
            let mut pending = self.inner.pending.lock().unwrap();
            let index = pending.iter().position(|request| request.method() == method);
            match index {
                Some(index) => pending.remove(index),
                None => return false,
            }
        };

        let id = request.id().expect("held requests carry ids").clone();
        self.send(Message::Response(Response::from_ok(id, result)));
        settle().await;
        true
    }

    /// The number of sessions `connect` has produced so far.
    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().unwrap().len()
    }

    /// Injects a decode fault into the current session's stream.
    pub async fn send_error(&self) {
        let session = self.latest_session();
        let _ = session.to_client.unbounded_send(Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "bad frame",
        )));
        settle().await;
    }

    /// Closes the current session's stream, as if the server died.
    pub async fn disconnect(&self) {
        let session = self.latest_session();
        session.to_client.close_channel();
        settle().await;
    }

    /// Sends a notification to the client.
    pub async fn notify(&self, method: &str, params: Value) {
        let message = Request::build(method.to_owned()).params(params).finish();
        self.send(Message::Request(message));
        settle().await;
    }

    /// Sends a request to the client and returns its id.
    pub async fn request(&self, method: &str, params: Value) -> Id {
        let id = Id::Number(self.inner.request_seq.fetch_add(1, Ordering::SeqCst));
        let message = Request::build(method.to_owned())
            .params(params)
            .id(id.clone())
            .finish();
        self.send(Message::Request(message));
        settle().await;
        id
    }

    /// The client's response to a fixture-initiated request, if it arrived.
    pub fn response_for(&self, id: &Id) -> Option<Response> {
        let session = self.latest_session();
        let log = session.log.lock().unwrap();
        log.iter().find_map(|message| match message {
            Message::Response(response) if response.id() == id => Some(response.clone()),
            _ => None,
        })
    }

    /// Every request/notification method the client sent, in order.
    pub fn sent_methods(&self) -> Vec<String> {
        let session = self.latest_session();
        let log = session.log.lock().unwrap();
        log.iter()
            .filter_map(|message| match message {
                Message::Request(request) => Some(request.method().to_owned()),
                _ => None,
            })
            .collect()
    }

    /// How many times the client sent `method` in the current session.
    pub fn sent_count(&self, method: &str) -> usize {
        self.sent_methods().iter().filter(|m| *m == method).count()
    }

    /// The params of the `index`-th occurrence of `method`.
    pub fn sent_params(&self, method: &str, index: usize) -> Option<Value> {
        let session = self.latest_session();
        let log = session.log.lock().unwrap();
        log.iter()
            .filter_map(|message| match message {
                Message::Request(request) if request.method() == method => {
                    Some(request.params().cloned().unwrap_or(Value::Null))
                }
                _ => None,
            })
            .nth(index)
    }

    /// Polls until the client has sent `method` at least `count` times.
    pub async fn wait_for(&self, method: &str, count: usize) {
        for _ in 0..1_000 {
            if self.sent_count(method) >= count {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!(
            "client never sent {method} x{count}; saw {:?}",
            self.sent_methods()
        );
    }

    fn send(&self, message: Message) {
        let session = self.latest_session();
        let _ = session.to_client.unbounded_send(Ok(message));
    }

    fn latest_session(&self) -> Session {
        self.inner
            .sessions
            .lock()
            .unwrap()
            .last()
            .expect("no session; did the client start?")
            .clone()
    }
}

#[async_trait]
impl Connect for ServerFixture {
    async fn connect(&self) -> io::Result<(MessageStream, MessageSink)> {
        let (to_client, to_client_rx) = mpsc::unbounded::<io::Result<Message>>();
        let (from_client_tx, from_client_rx) = mpsc::unbounded::<Message>();

        let log = Arc::new(Mutex::new(Vec::new()));
        self.inner.sessions.lock().unwrap().push(Session {
            to_client: to_client.clone(),
            log: log.clone(),
        });

        tokio::spawn(pump(self.inner.clone(), from_client_rx, to_client, log));

        let reader: MessageStream = Box::pin(to_client_rx);
        let writer: MessageSink = Box::pin(from_client_tx.sink_map_err(sink_error));
        Ok((reader, writer))
    }
}

async fn pump(
    inner: Arc<FixtureInner>,
    mut from_client: mpsc::UnboundedReceiver<Message>,
    to_client: mpsc::UnboundedSender<io::Result<Message>>,
    log: Arc<Mutex<Vec<Message>>>,
) {
    while let Some(message) = from_client.next().await {
        log.lock().unwrap().push(message.clone());

        let request = match message {
            Message::Request(request) => request,
            _ => continue,
        };
        let id = match request.id() {
            Some(id) => id.clone(),
            None => continue,
        };
        let method = request.method().to_owned();

        if inner.held.lock().unwrap().contains(&method) {
            inner.pending.lock().unwrap().push(request);
            continue;
        }

        let response = if method == "initialize" {
            if inner.initialize_errors.load(Ordering::SeqCst) > 0 {
                inner.initialize_errors.fetch_sub(1, Ordering::SeqCst);
                Response::from_error(id, RpcError::internal_error())
            } else {
                let capabilities = inner.capabilities.lock().unwrap().clone();
                let result = InitializeResult {
                    capabilities,
                    server_info: None,
                };
                Response::from_ok(id, serde_json::to_value(result).unwrap())
            }
        } else if let Some(result) = inner.responses.lock().unwrap().get(&method).cloned() {
            Response::from_ok(id, result)
        } else {
            Response::from_ok(id, Value::Null)
        };

        let _ = to_client.unbounded_send(Ok(Message::Response(response)));
    }
}

/// A recording [`Host`] implementation.
#[derive(Default)]
pub(crate) struct TestHost {
    pub open_documents: Mutex<Vec<lsp_types::TextDocumentItem>>,
    pub messages: Mutex<Vec<(MessageType, String)>>,
    pub logs: Mutex<Vec<(MessageType, String)>>,
    pub diagnostics: Mutex<HashMap<Url, Vec<lsp_types::Diagnostic>>>,
    pub watchers: Mutex<Vec<String>>,
    pub progress: Mutex<Vec<(ProgressToken, WorkDoneProgress)>>,
    pub telemetry: Mutex<Vec<Value>>,
}

impl TestHost {
    pub fn new() -> Arc<Self> {
        Arc::new(TestHost::default())
    }

    pub fn diagnostics_for(&self, uri: &Url) -> Vec<lsp_types::Diagnostic> {
        self.diagnostics
            .lock()
            .unwrap()
            .get(uri)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Host for TestHost {
    fn open_documents(&self) -> Vec<lsp_types::TextDocumentItem> {
        self.open_documents.lock().unwrap().clone()
    }

    fn show_message(&self, typ: MessageType, message: String) {
        self.messages.lock().unwrap().push((typ, message));
    }

    fn log_message(&self, typ: MessageType, message: String) {
        self.logs.lock().unwrap().push((typ, message));
    }

    fn diagnostics_changed(
        &self,
        uri: &Url,
        _version: Option<i32>,
        diagnostics: &[lsp_types::Diagnostic],
    ) {
        self.diagnostics
            .lock()
            .unwrap()
            .insert(uri.clone(), diagnostics.to_vec());
    }

    fn work_done_progress(&self, token: &ProgressToken, progress: &WorkDoneProgress) {
        self.progress
            .lock()
            .unwrap()
            .push((token.clone(), progress.clone()));
    }

    fn telemetry(&self, data: Value) {
        self.telemetry.lock().unwrap().push(data);
    }

    fn watch_files(&self, id: &str, _watchers: Vec<lsp_types::FileSystemWatcher>) {
        self.watchers.lock().unwrap().push(id.to_owned());
    }

    fn unwatch_files(&self, id: &str) {
        self.watchers.lock().unwrap().retain(|existing| existing != id);
    }
}

/// Options with a single-language default document selector.
pub(crate) fn selector_options(language: &str) -> crate::ClientOptions {
    crate::ClientOptions {
        document_selector: Some(vec![lsp_types::DocumentFilter {
            language: Some(language.to_owned()),
            scheme: None,
            pattern: None,
        }]),
        ..Default::default()
    }
}

/// Builds and starts a client against the fixture.
pub(crate) async fn start_client(
    fixture: &ServerFixture,
    host: &Arc<TestHost>,
    options: crate::ClientOptions,
) -> crate::LanguageClient {
    let client = crate::LanguageClient::new(fixture.clone(), host.clone(), options);
    client.start().await.expect("client failed to start");
    client
}

/// A diagnostic value for assertions.
pub(crate) fn diagnostic(message: &str) -> lsp_types::Diagnostic {
    lsp_types::Diagnostic {
        range: lsp_types::Range::new(
            lsp_types::Position::new(0, 0),
            lsp_types::Position::new(0, 1),
        ),
        message: message.to_owned(),
        ..Default::default()
    }
}

/// A `file://` URI for tests.
pub(crate) fn uri(path: &str) -> Url {
    Url::parse(&format!("file://{path}")).unwrap()
}
