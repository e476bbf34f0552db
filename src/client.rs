//! The client lifecycle controller.
//!
//! [`LanguageClient`] drives the `initialize` → `initialized` → running →
//! `shutdown` → `exit` state machine over connections produced by a
//! [`Connect`] factory, restarts under the configured error policy, and is
//! the entry point for every host-facing operation: the generic feature
//! pipeline, document lifecycle notifications, file events, and progress
//! cancellation.

pub use self::state::PublicState;

pub(crate) use self::state::{State, StateCell};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::channel::mpsc;
use futures::StreamExt;
use lsp_types::notification::{
    DidChangeConfiguration, DidChangeWorkspaceFolders, Exit, Initialized, LogMessage, LogTrace,
    Notification as _, PublishDiagnostics, SetTrace, ShowMessage, TelemetryEvent,
};
use lsp_types::request::{
    ApplyWorkspaceEdit, CodeLensRefresh, ExecuteCommand, Initialize, InlayHintRefreshRequest,
    InlineValueRefreshRequest, RegisterCapability, SemanticTokensRefresh, ShowDocument,
    ShowMessageRequest, Shutdown, UnregisterCapability, WorkDoneProgressCreate,
    WorkspaceConfiguration, WorkspaceDiagnosticRefresh, WorkspaceFoldersRequest,
};
use lsp_types::{
    ConfigurationItem, Diagnostic, DidChangeConfigurationParams,
    DidChangeWorkspaceFoldersParams, ExecuteCommandParams, FileEvent, InitializeParams,
    InitializedParams, MessageType, OneOf, ProgressToken, ServerCapabilities, SetTraceParams,
    ShowDocumentResult, TextDocumentContentChangeEvent, TextDocumentItem, TextDocumentSaveReason,
    TextEdit, TraceValue, Url, WorkspaceEdit, WorkspaceFoldersChangeEvent,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::capabilities::{self, ResolvedTextDocumentSync};
use crate::connection::{Connection, ConnectionEvent, Router};
use crate::diagnostics::{DiagnosticFeature, DiagnosticState};
use crate::error::{CloseAction, DefaultErrorHandler, ErrorAction, ErrorHandler};
use crate::file_events::{FileEventBridge, FileOperationFeature, WatchedFilesFeature};
use crate::host::{Host, RefreshKind};
use crate::jsonrpc::{Error as RpcError, ErrorCode, Id};
use crate::middleware::{NextNotification, NextRequest};
use crate::options::ClientOptions;
use crate::progress::ProgressState;
use crate::registry::{
    self, FeatureRegistration, FeatureRegistry, ProviderFeature, ProviderRegistry,
};
use crate::sync::{DocumentSync, SyncFeature};
use crate::transport::Connect;
use crate::{Error, Result};

mod state;

/// Shared state behind a [`LanguageClient`] and all of its tasks.
pub(crate) struct Core {
    pub(crate) options: ClientOptions,
    pub(crate) host: Arc<dyn Host>,
    pub(crate) providers: ProviderRegistry,
    pub(crate) sync: DocumentSync,
    pub(crate) diagnostics: DiagnosticState,
    pub(crate) file_events: FileEventBridge,
    pub(crate) progress: ProgressState,
    connect: Arc<dyn Connect>,
    features: FeatureRegistry,
    state: StateCell,
    connection: Mutex<Option<Arc<Connection>>>,
    error_handler: Arc<dyn ErrorHandler>,
    server_capabilities: Mutex<Option<ServerCapabilities>>,
    resolved_sync: Mutex<ResolvedTextDocumentSync>,
    registration_seq: AtomicU64,
    progress_seq: AtomicU64,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Core {
    pub(crate) fn connection(&self) -> Result<Arc<Connection>> {
        self.connection
            .lock()
            .expect("connection slot poisoned")
            .clone()
            .ok_or(Error::NotRunning)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state.get() == State::Running
    }

    pub(crate) fn resolved_sync(&self) -> ResolvedTextDocumentSync {
        self.resolved_sync
            .lock()
            .expect("sync options poisoned")
            .clone()
    }

    /// Spawns a task owned by the current connection; aborted on teardown.
    pub(crate) fn spawn(&self, fut: impl std::future::Future<Output = ()> + Send + 'static) {
        let handle = tokio::spawn(fut);
        let mut tasks = self.tasks.lock().expect("task list poisoned");
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// A process-unique id for registrations the server left unnamed.
    pub(crate) fn next_registration_id(&self) -> String {
        let n = self.registration_seq.fetch_add(1, Ordering::Relaxed);
        format!("tower-lsp-client/{n}")
    }

    /// A fresh token for partial-result progress.
    pub(crate) fn next_progress_token(&self) -> Id {
        let n = self.progress_seq.fetch_add(1, Ordering::Relaxed);
        Id::String(format!("tower-lsp-client/progress/{n}"))
    }

    /// Sends a request through the middleware hook, if one is configured.
    pub(crate) async fn invoke_request(
        &self,
        method: &'static str,
        params: Value,
        token: &CancellationToken,
    ) -> Result<Value> {
        let connection = self.connection()?;
        match &self.options.middleware.request {
            Some(hook) => {
                let token = token.clone();
                let next: NextRequest = Box::new(move |params| {
                    Box::pin(async move { connection.send_request_raw(method, params, &token).await })
                });
                hook(method, params, next).await
            }
            None => connection.send_request_raw(method, params, token).await,
        }
    }

    /// Sends a notification through the middleware hook, if one is configured.
    pub(crate) async fn invoke_notification(&self, method: &'static str, params: Value) -> Result<()> {
        let connection = self.connection()?;
        match &self.options.middleware.notification {
            Some(hook) => {
                let next: NextNotification = Box::new(move |params| {
                    Box::pin(async move { connection.send_notification_raw(method, params) })
                });
                hook(method, params, next).await
            }
            None => connection.send_notification_raw(method, params),
        }
    }

    /// Sends a request and applies the unified failure policy: cancellation
    /// and connection loss propagate, `ContentModified` quietly becomes the
    /// default value, and other protocol errors are logged with the method
    /// name before yielding the default.
    pub(crate) async fn request_or_default(
        &self,
        method: &'static str,
        params: Value,
        token: &CancellationToken,
    ) -> Result<Option<Value>> {
        match self.invoke_request(method, params, token).await {
            Ok(value) => Ok(Some(value)),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(Error::ConnectionClosed) => Err(Error::ConnectionClosed),
            Err(Error::NotRunning) => Err(Error::NotRunning),
            Err(Error::Rpc(err)) if err.code == ErrorCode::ContentModified => Ok(None),
            Err(Error::Rpc(err)) => {
                error!("request {} failed: {}", method, err);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn start<'a>(self: &'a Arc<Self>) -> futures::future::BoxFuture<'a, Result<()>> {
        Box::pin(self.start_inner())
    }

    async fn start_inner(self: &Arc<Self>) -> Result<()> {
        match self.state.get() {
            State::Initial | State::Stopped | State::StartFailed => {}
            State::Starting | State::Running => return Err(Error::AlreadyRunning),
            State::Stopping => return Err(Error::NotRunning),
        }
        self.state.set(State::Starting);

        let mut capabilities = self.features.fill_client_capabilities();
        capabilities::fill_base_capabilities(&mut capabilities);

        let mut params = InitializeParams {
            process_id: Some(std::process::id()),
            capabilities,
            initialization_options: self.options.initialization_options.clone(),
            client_info: self.options.client_info.clone(),
            workspace_folders: self
                .options
                .workspace_folders
                .clone()
                .or_else(|| self.host.workspace_folders()),
            trace: self.options.trace,
            ..Default::default()
        };
        self.features.fill_initialize_params(&mut params);

        let (reader, writer) = match self.connect.connect().await {
            Ok(pair) => pair,
            Err(e) => {
                self.state.set(State::StartFailed);
                return Err(Error::Io(e));
            }
        };

        let (connection, outgoing) = Connection::new();
        *self.connection.lock().expect("connection slot poisoned") = Some(connection.clone());

        let (events_tx, events_rx) = mpsc::unbounded();
        self.spawn(
            connection
                .clone()
                .serve(self.build_router(), reader, writer, outgoing, events_tx),
        );
        // The event consumer outlives connection teardown on purpose: it is
        // the task that performs the teardown.
        tokio::spawn(Core::run_events(self.clone(), events_rx));

        let token = CancellationToken::new();
        let result = loop {
            match connection.send_request::<Initialize>(params.clone(), &token).await {
                Ok(result) => break result,
                Err(e) => {
                    let retry = self
                        .options
                        .initialization_failed_handler
                        .as_ref()
                        .map(|handler| handler(&e))
                        .unwrap_or(false);

                    if !retry {
                        error!("initialize failed: {}", e);
                        self.host.show_message(
                            MessageType::ERROR,
                            format!("Server initialization failed: {e}"),
                        );
                        self.teardown_connection();
                        self.state.set(State::StartFailed);
                        return Err(e);
                    }
                }
            }
        };

        *self
            .server_capabilities
            .lock()
            .expect("capability slot poisoned") = Some(result.capabilities.clone());
        *self.resolved_sync.lock().expect("sync options poisoned") =
            capabilities::resolve_text_document_sync(result.capabilities.text_document_sync.as_ref());

        connection.send_notification::<Initialized>(InitializedParams {})?;
        if let Some(trace) = self.options.trace {
            connection.send_notification::<SetTrace>(SetTraceParams { value: trace })?;
        }

        self.state.set(State::Running);
        self.features.initialize(self, &result.capabilities);
        info!("language client running");
        Ok(())
    }

    async fn stop(self: &Arc<Self>) -> Result<()> {
        match self.state.get() {
            State::Stopped | State::Stopping | State::Initial => return Ok(()),
            State::StartFailed => {
                self.state.set(State::Stopped);
                return Ok(());
            }
            State::Starting | State::Running => {}
        }
        self.state.set(State::Stopping);

        self.features.dispose_all(self);
        self.progress.dispose();

        let connection = self
            .connection
            .lock()
            .expect("connection slot poisoned")
            .take();
        if let Some(connection) = connection {
            let token = CancellationToken::new();
            if let Err(e) = connection.send_request::<Shutdown>((), &token).await {
                warn!("shutdown request failed: {}", e);
            }
            let _ = connection.send_notification::<Exit>(());

            // Let the write task drain the exit notification before the
            // connection tasks are aborted.
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
            connection.close();
        }

        self.abort_tasks();
        self.state.set(State::Stopped);
        info!("language client stopped");
        Ok(())
    }

    fn teardown_connection(&self) {
        let connection = self
            .connection
            .lock()
            .expect("connection slot poisoned")
            .take();
        if let Some(connection) = connection {
            connection.close();
        }
        self.abort_tasks();
    }

    fn abort_tasks(&self) {
        let tasks: Vec<_> = {
            let mut tasks = self.tasks.lock().expect("task list poisoned");
            tasks.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }
    }

    async fn run_events(core: Arc<Core>, mut events: mpsc::UnboundedReceiver<ConnectionEvent>) {
        while let Some(event) = events.next().await {
            match event {
                ConnectionEvent::Error { error, consecutive } => {
                    let action = core.error_handler.error(&error, None, consecutive);
                    if action == ErrorAction::Shutdown {
                        warn!(
                            "shutting down after {} consecutive connection errors: {}",
                            consecutive, error
                        );
                        let _ = core.stop().await;
                        break;
                    }
                }
                ConnectionEvent::Closed => {
                    core.handle_closed().await;
                    break;
                }
            }
        }
    }

    async fn handle_closed(self: &Arc<Self>) {
        match self.state.get() {
            // A close during deliberate teardown is the expected outcome.
            State::Stopping | State::Stopped | State::Initial => return,
            State::Starting | State::StartFailed => {
                self.teardown_connection();
                if self.state.get() == State::Starting {
                    self.state.set(State::StartFailed);
                }
                return;
            }
            State::Running => {}
        }

        warn!("connection to the language server closed unexpectedly");
        self.features.dispose_all(self);
        self.progress.dispose();
        self.teardown_connection();

        match self.error_handler.closed() {
            CloseAction::Restart => {
                info!("restarting language server connection");
                self.state.set(State::Initial);
                if let Err(e) = self.start().await {
                    error!("restart failed: {}", e);
                    self.host.show_message(
                        MessageType::ERROR,
                        format!("Restarting the language server failed: {e}"),
                    );
                }
            }
            CloseAction::DoNotRestart => {
                self.state.set(State::Stopped);
                self.host.show_message(
                    MessageType::ERROR,
                    "The connection to the language server got closed; the server will not be restarted.".to_owned(),
                );
            }
        }
    }

    async fn handle_register(
        self: &Arc<Self>,
        params: lsp_types::RegistrationParams,
    ) -> crate::jsonrpc::Result<()> {
        for registration in params.registrations {
            let feature = self.features.get(&registration.method).ok_or_else(|| {
                RpcError::request_failed(format!(
                    "no feature accepts registrations for method {}",
                    registration.method
                ))
            })?;

            let id = if registration.id.is_empty() {
                self.next_registration_id()
            } else {
                registration.id
            };

            let mut options = registration
                .register_options
                .unwrap_or_else(|| Value::Object(Default::default()));
            capabilities::merge_default_selector(self, &mut options);

            feature
                .register(self, FeatureRegistration { id, options })
                .map_err(|e| RpcError::request_failed(e.to_string()))?;
        }
        Ok(())
    }

    async fn handle_unregister(
        self: &Arc<Self>,
        params: lsp_types::UnregistrationParams,
    ) -> crate::jsonrpc::Result<()> {
        for unregistration in params.unregisterations {
            let feature = self.features.get(&unregistration.method).ok_or_else(|| {
                RpcError::request_failed(format!(
                    "no feature accepts registrations for method {}",
                    unregistration.method
                ))
            })?;
            feature.unregister(self, &unregistration.id);
        }
        Ok(())
    }

    fn build_router(self: &Arc<Self>) -> Router {
        let mut router = Router::new();
        let weak = Arc::downgrade(self);

        {
            let weak = weak.clone();
            router.request::<RegisterCapability, _, _>(move |params| {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(core) => core.handle_register(params).await,
                        None => Err(RpcError::internal_error()),
                    }
                }
            });
        }

        {
            let weak = weak.clone();
            router.request::<UnregisterCapability, _, _>(move |params| {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(core) => core.handle_unregister(params).await,
                        None => Err(RpcError::internal_error()),
                    }
                }
            });
        }

        {
            let weak = weak.clone();
            router.request::<ApplyWorkspaceEdit, _, _>(move |params| {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(core) => Ok(core.host.apply_edit(params).await),
                        None => Err(RpcError::internal_error()),
                    }
                }
            });
        }

        {
            let weak = weak.clone();
            router.request::<WorkspaceConfiguration, _, _>(move |params: lsp_types::ConfigurationParams| {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(core) => Ok(core.host.configuration(params.items).await),
                        None => Err(RpcError::internal_error()),
                    }
                }
            });
        }

        {
            let weak = weak.clone();
            router.request::<WorkspaceFoldersRequest, _, _>(move |_params: ()| {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(core) => Ok(core.host.workspace_folders()),
                        None => Err(RpcError::internal_error()),
                    }
                }
            });
        }

        {
            let weak = weak.clone();
            router.request::<ShowMessageRequest, _, _>(move |params| {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(core) => Ok(core.host.show_message_request(params).await),
                        None => Err(RpcError::internal_error()),
                    }
                }
            });
        }

        {
            let weak = weak.clone();
            router.request::<ShowDocument, _, _>(move |params| {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(core) => Ok(ShowDocumentResult {
                            success: core.host.show_document(params).await,
                        }),
                        None => Err(RpcError::internal_error()),
                    }
                }
            });
        }

        {
            let weak = weak.clone();
            router.request::<WorkDoneProgressCreate, _, _>(
                move |params: lsp_types::WorkDoneProgressCreateParams| {
                    let weak = weak.clone();
                    async move {
                        match weak.upgrade() {
                            Some(core) => core
                                .progress
                                .create(&core, params.token)
                                .map_err(|_| RpcError::internal_error()),
                            None => Err(RpcError::internal_error()),
                        }
                    }
                },
            );
        }

        {
            let weak = weak.clone();
            router.request::<WorkspaceDiagnosticRefresh, _, _>(move |_params: ()| {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(core) => {
                            core.diagnostics.refresh(&core);
                            Ok(())
                        }
                        None => Err(RpcError::internal_error()),
                    }
                }
            });
        }

        self.refresh_handler::<CodeLensRefresh>(&mut router, RefreshKind::CodeLens);
        self.refresh_handler::<SemanticTokensRefresh>(&mut router, RefreshKind::SemanticTokens);
        self.refresh_handler::<InlayHintRefreshRequest>(&mut router, RefreshKind::InlayHint);
        self.refresh_handler::<InlineValueRefreshRequest>(&mut router, RefreshKind::InlineValue);

        {
            let weak = weak.clone();
            router.notification::<LogMessage, _, _>(move |params: lsp_types::LogMessageParams| {
                let weak = weak.clone();
                async move {
                    if let Some(core) = weak.upgrade() {
                        let typ = params.typ;
                        core.host.log_message(typ, params.message);
                        if core.options.reveal_output_channel_on.should_reveal(typ) {
                            core.host.reveal_output_channel();
                        }
                    }
                }
            });
        }

        {
            let weak = weak.clone();
            router.notification::<ShowMessage, _, _>(move |params: lsp_types::ShowMessageParams| {
                let weak = weak.clone();
                async move {
                    if let Some(core) = weak.upgrade() {
                        core.host.show_message(params.typ, params.message);
                    }
                }
            });
        }

        {
            let weak = weak.clone();
            router.notification::<TelemetryEvent, _, _>(move |params| {
                let weak = weak.clone();
                async move {
                    if let Some(core) = weak.upgrade() {
                        match serde_json::to_value(params) {
                            Ok(value) => core.host.telemetry(value),
                            Err(e) => warn!("unserializable telemetry payload: {}", e),
                        }
                    }
                }
            });
        }

        {
            let weak = weak.clone();
            router.notification::<PublishDiagnostics, _, _>(
                move |params: lsp_types::PublishDiagnosticsParams| {
                    let weak = weak.clone();
                    async move {
                        if let Some(core) = weak.upgrade() {
                            core.host.diagnostics_changed(
                                &params.uri,
                                params.version,
                                &params.diagnostics,
                            );
                        }
                    }
                },
            );
        }

        {
            let weak = weak.clone();
            router.notification::<LogTrace, _, _>(move |params: lsp_types::LogTraceParams| {
                let weak = weak.clone();
                async move {
                    if let Some(core) = weak.upgrade() {
                        let mut message = params.message;
                        if let Some(verbose) = params.verbose {
                            message.push('\n');
                            message.push_str(&verbose);
                        }
                        core.host.log_message(MessageType::LOG, message);
                    }
                }
            });
        }

        router
    }

    fn refresh_handler<R>(self: &Arc<Self>, router: &mut Router, kind: RefreshKind)
    where
        R: lsp_types::request::Request<Params = (), Result = ()>,
    {
        let weak = Arc::downgrade(self);
        router.request::<R, _, _>(move |_params: ()| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(core) => {
                        core.host.refresh(kind);
                        Ok(())
                    }
                    None => Err(RpcError::internal_error()),
                }
            }
        });
    }
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("state", &self.state.get())
            .field("providers", &self.providers)
            .finish_non_exhaustive()
    }
}

/// A Language Server Protocol client runtime instance.
///
/// Create one with [`LanguageClient::new`], then call [`start`] to connect
/// and perform the `initialize` handshake. All document lifecycle events and
/// feature requests flow through this handle; it is cheap to clone.
///
/// [`start`]: LanguageClient::start
#[derive(Clone, Debug)]
pub struct LanguageClient {
    core: Arc<Core>,
}

impl LanguageClient {
    /// Creates a stopped client over the given transport factory, host, and
    /// options.
    pub fn new<C>(connect: C, host: Arc<dyn Host>, options: ClientOptions) -> Self
    where
        C: Connect,
    {
        let mut features: Vec<Arc<dyn registry::DynamicFeature>> = Vec::new();
        features.extend(SyncFeature::all());
        features.extend(capabilities::provider_features());
        features.push(Arc::new(DiagnosticFeature));
        features.push(Arc::new(WatchedFilesFeature));
        features.extend(FileOperationFeature::all());
        features.push(ProviderFeature::new(
            DidChangeConfiguration::METHOD,
            false,
            |_caps| {},
            |_caps| None,
        ));
        features.push(ProviderFeature::new(
            DidChangeWorkspaceFolders::METHOD,
            false,
            |_caps| {},
            |caps| {
                let folders = caps.workspace.as_ref()?.workspace_folders.as_ref()?;
                match &folders.change_notifications {
                    Some(OneOf::Left(true)) => Some(Value::Object(Default::default())),
                    Some(OneOf::Right(id)) => Some(serde_json::json!({ "id": id })),
                    _ => None,
                }
            },
        ));

        let error_handler = options
            .error_handler
            .clone()
            .unwrap_or_else(|| Arc::new(DefaultErrorHandler::new(options.max_restart_count())));

        let core = Arc::new(Core {
            options,
            host,
            providers: ProviderRegistry::new(),
            sync: DocumentSync::new(),
            diagnostics: DiagnosticState::new(),
            file_events: FileEventBridge::new(),
            progress: ProgressState::new(),
            connect: Arc::new(connect),
            features: FeatureRegistry::new(features),
            state: StateCell::new(),
            connection: Mutex::new(None),
            error_handler,
            server_capabilities: Mutex::new(None),
            resolved_sync: Mutex::new(ResolvedTextDocumentSync::default()),
            registration_seq: AtomicU64::new(0),
            progress_seq: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
        });

        LanguageClient { core }
    }

    /// The coarse lifecycle state.
    pub fn state(&self) -> PublicState {
        self.core.state.public()
    }

    /// The configuration this client was built with, including rendering
    /// hints such as `markdown_is_trusted`.
    pub fn options(&self) -> &ClientOptions {
        &self.core.options
    }

    /// The capabilities the server reported during the handshake, if running.
    pub fn server_capabilities(&self) -> Option<ServerCapabilities> {
        self.core
            .server_capabilities
            .lock()
            .expect("capability slot poisoned")
            .clone()
    }

    /// Connects and runs the `initialize`/`initialized` handshake.
    pub async fn start(&self) -> Result<()> {
        self.core.start().await
    }

    /// Stops the client: `shutdown` request, `exit` notification, connection
    /// close, feature disposal. Idempotent against `Stopping` and `Stopped`.
    pub async fn stop(&self) -> Result<()> {
        self.core.stop().await
    }

    /// Sends a typed request without selector matching or failure policy.
    pub async fn send_request<R>(&self, params: R::Params, token: &CancellationToken) -> Result<R::Result>
    where
        R: lsp_types::request::Request,
    {
        let value = self
            .core
            .invoke_request(R::METHOD, serde_json::to_value(params)?, token)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Sends a typed notification through the middleware hook.
    pub async fn send_notification<N>(&self, params: N::Params) -> Result<()>
    where
        N: lsp_types::notification::Notification,
    {
        self.core
            .invoke_notification(N::METHOD, serde_json::to_value(params)?)
            .await
    }

    /// The generic document-scoped feature pipeline.
    ///
    /// Returns `Ok(None)` when no registered provider's selector matches the
    /// document ("no provider"), when the server answered `ContentModified`,
    /// or when the request failed with a logged protocol error. Any pending
    /// debounced change for the document is flushed before the request goes
    /// out.
    pub async fn document_request<R>(
        &self,
        uri: &Url,
        params: R::Params,
        token: &CancellationToken,
    ) -> Result<Option<R::Result>>
    where
        R: lsp_types::request::Request,
    {
        let core = &self.core;
        if !core.is_running() {
            return Err(Error::NotRunning);
        }

        let method = registry::registration_method(R::METHOD);
        let language = core.sync.language_of(uri);
        if core
            .providers
            .first_match(method, uri, language.as_deref())
            .is_none()
        {
            return Ok(None);
        }

        core.sync.flush_document(core, uri).await?;

        let result = core
            .request_or_default(R::METHOD, serde_json::to_value(params)?, token)
            .await?;
        match result {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// The pipeline for workspace-scoped and resolve-style requests: no
    /// document selector, but registration presence is still required.
    pub async fn workspace_request<R>(
        &self,
        params: R::Params,
        token: &CancellationToken,
    ) -> Result<Option<R::Result>>
    where
        R: lsp_types::request::Request,
    {
        let core = &self.core;
        if !core.is_running() {
            return Err(Error::NotRunning);
        }

        if !core.providers.has_any(registry::registration_method(R::METHOD)) {
            return Ok(None);
        }

        core.sync.flush_all(core).await?;

        let result = core
            .request_or_default(R::METHOD, serde_json::to_value(params)?, token)
            .await?;
        match result {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Runs a command on the server, if it registered any.
    pub async fn execute_command(
        &self,
        params: ExecuteCommandParams,
        token: &CancellationToken,
    ) -> Result<Option<Value>> {
        Ok(self
            .workspace_request::<ExecuteCommand>(params, token)
            .await?
            .flatten())
    }

    // Document lifecycle.

    /// Reports a document opened in the editor.
    ///
    /// Tracked documents that match no registration yet are replayed once a
    /// matching `didOpen` registration arrives, so this may be called before
    /// [`start`](LanguageClient::start).
    pub async fn did_open(&self, document: TextDocumentItem) -> Result<()> {
        self.core.sync.did_open(&self.core, document).await
    }

    /// Reports a content change; `text` is the full post-change content.
    pub async fn did_change(
        &self,
        uri: &Url,
        version: i32,
        changes: Vec<TextDocumentContentChangeEvent>,
        text: &str,
    ) -> Result<()> {
        self.core
            .sync
            .did_change(&self.core, uri, version, changes, text)
            .await
    }

    /// Reports an imminent save.
    pub async fn will_save(&self, uri: &Url, reason: TextDocumentSaveReason) -> Result<()> {
        self.core.sync.will_save(&self.core, uri, reason).await
    }

    /// Asks the server for pre-save edits; they must be applied before the
    /// save completes.
    pub async fn will_save_wait_until(
        &self,
        uri: &Url,
        reason: TextDocumentSaveReason,
        token: &CancellationToken,
    ) -> Result<Vec<TextEdit>> {
        self.core
            .sync
            .will_save_wait_until(&self.core, uri, reason, token)
            .await
    }

    /// Reports a completed save.
    pub async fn did_save(&self, uri: &Url) -> Result<()> {
        self.core.sync.did_save(&self.core, uri).await
    }

    /// Reports a document closed in the editor.
    pub async fn did_close(&self, uri: &Url) -> Result<()> {
        let version = self.core.sync.version_of(uri).unwrap_or(0);
        self.core.sync.did_close(&self.core, uri, version).await
    }

    /// Replaces the set of visible editor tabs and the active editor.
    pub fn editor_tabs_changed(&self, visible: Vec<Url>, active: Option<Url>) {
        self.core
            .diagnostics
            .tabs_changed(&self.core, visible, active);
    }

    /// The pull-diagnostic collection entry for a document.
    pub fn diagnostics(&self, uri: &Url) -> Vec<Diagnostic> {
        self.core.diagnostics.diagnostics(uri)
    }

    // File events and operations.

    /// Feeds an event observed by a host file watcher.
    pub fn notify_file_event(&self, event: FileEvent) {
        self.core.file_events.notify(&self.core, event);
    }

    /// Asks the server for edits to apply before files are created.
    pub async fn will_create_files(&self, files: &[Url]) -> Result<Option<WorkspaceEdit>> {
        self.core.file_events.will_create_files(&self.core, files).await
    }

    /// Notifies the server that files were created.
    pub async fn did_create_files(&self, files: &[Url]) -> Result<()> {
        self.core.file_events.did_create_files(&self.core, files).await
    }

    /// Asks the server for edits to apply before files are renamed.
    pub async fn will_rename_files(&self, files: &[(Url, Url)]) -> Result<Option<WorkspaceEdit>> {
        self.core.file_events.will_rename_files(&self.core, files).await
    }

    /// Notifies the server that files were renamed.
    pub async fn did_rename_files(&self, files: &[(Url, Url)]) -> Result<()> {
        self.core.file_events.did_rename_files(&self.core, files).await
    }

    /// Asks the server for edits to apply before files are deleted.
    pub async fn will_delete_files(&self, files: &[Url]) -> Result<Option<WorkspaceEdit>> {
        self.core.file_events.will_delete_files(&self.core, files).await
    }

    /// Notifies the server that files were deleted.
    pub async fn did_delete_files(&self, files: &[Url]) -> Result<()> {
        self.core.file_events.did_delete_files(&self.core, files).await
    }

    // Configuration and workspace.

    /// Reports changes to the configured `synchronize.configuration_section`
    /// values, resolved through [`Host::configuration`].
    pub async fn did_change_configuration(&self) -> Result<()> {
        let core = &self.core;
        let sections = &core.options.synchronize.configuration_section;
        if sections.is_empty() {
            return Ok(());
        }

        let items = sections
            .iter()
            .map(|section| ConfigurationItem {
                scope_uri: None,
                section: Some(section.clone()),
            })
            .collect();
        let values = core.host.configuration(items).await;

        let mut settings = serde_json::Map::new();
        for (section, value) in sections.iter().zip(values) {
            settings.insert(section.clone(), value);
        }

        let params = DidChangeConfigurationParams {
            settings: Value::Object(settings),
        };
        core.invoke_notification(DidChangeConfiguration::METHOD, serde_json::to_value(params)?)
            .await
    }

    /// Reports workspace folder changes.
    pub async fn did_change_workspace_folders(
        &self,
        event: WorkspaceFoldersChangeEvent,
    ) -> Result<()> {
        let params = DidChangeWorkspaceFoldersParams { event };
        self.core
            .invoke_notification(DidChangeWorkspaceFolders::METHOD, serde_json::to_value(params)?)
            .await
    }

    /// Cancels a server-created progress part on the user's behalf.
    pub fn cancel_progress(&self, token: ProgressToken) -> Result<()> {
        self.core.progress.cancel(&self.core, token)
    }

    /// Changes the server's trace value via `$/setTrace`.
    pub fn set_trace(&self, value: TraceValue) -> Result<()> {
        self.core
            .connection()?
            .send_notification::<SetTrace>(SetTraceParams { value })
    }
}
