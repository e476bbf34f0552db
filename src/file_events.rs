//! File watcher bridge and file operation filters.
//!
//! Watchers themselves live on the host; registrations only tell the host
//! which globs to observe, and observed events flow back through
//! [`LanguageClient::notify_file_event`](crate::LanguageClient::notify_file_event).
//! Events are buffered and flushed after a short debounce, preceded by a
//! forced document-sync flush so the server sees them in a coherent order
//! relative to document changes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use globset::{GlobBuilder, GlobMatcher};
use indexmap::IndexMap;
use lsp_types::notification::{
    DidChangeWatchedFiles, DidCreateFiles, DidDeleteFiles, DidRenameFiles, Notification,
};
use lsp_types::request::{Request as _, WillCreateFiles, WillDeleteFiles, WillRenameFiles};
use lsp_types::{
    CreateFilesParams, DeleteFilesParams, DidChangeWatchedFilesParams,
    DidChangeWatchedFilesRegistrationOptions, FileCreate, FileDelete, FileEvent,
    FileOperationRegistrationOptions, FileRename, RenameFilesParams, ServerCapabilities, Url,
    WorkspaceEdit,
};
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::capabilities;
use crate::client::Core;
use crate::registry::{DynamicFeature, FeatureRegistration, StaticFeature};
use crate::{Error, Result};

/// Debounce applied to buffered watcher events before delivery.
pub(crate) const FILE_EVENT_DEBOUNCE: Duration = Duration::from_millis(250);

/// Watcher id used for the watchers configured through
/// `synchronize.file_events`.
const CONFIG_WATCHERS_ID: &str = "tower-lsp-client/config-file-events";

#[derive(Debug)]
struct OperationFilter {
    scheme: Option<String>,
    glob: GlobMatcher,
}

impl OperationFilter {
    fn matches(&self, uri: &Url) -> bool {
        if let Some(scheme) = &self.scheme {
            if scheme != uri.scheme() {
                return false;
            }
        }
        self.glob.is_match(uri.path())
    }
}

/// Buffers watcher events and owns the per-operation glob filters.
pub(crate) struct FileEventBridge {
    queue: Mutex<Vec<FileEvent>>,
    generation: AtomicU64,
    watcher_ids: Mutex<Vec<String>>,
    operations: DashMap<&'static str, IndexMap<String, Vec<OperationFilter>>>,
}

impl FileEventBridge {
    pub fn new() -> Self {
        FileEventBridge {
            queue: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
            watcher_ids: Mutex::new(Vec::new()),
            operations: DashMap::new(),
        }
    }

    /// Buffers an event observed by a host watcher.
    pub fn notify(&self, core: &Arc<Core>, event: FileEvent) {
        self.queue.lock().expect("file event queue poisoned").push(event);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        core.spawn({
            let core = core.clone();
            async move {
                tokio::time::sleep(FILE_EVENT_DEBOUNCE).await;
                if core.file_events.generation.load(Ordering::SeqCst) == generation {
                    core.file_events.flush(&core).await;
                }
            }
        });
    }

    async fn flush(&self, core: &Arc<Core>) {
        let changes: Vec<FileEvent> = {
            let mut queue = self.queue.lock().expect("file event queue poisoned");
            queue.drain(..).collect()
        };
        if changes.is_empty() {
            return;
        }

        // The server must not observe watcher events older than the document
        // content it already has.
        if let Err(e) = core.sync.flush_all(core).await {
            error!("failed to flush document changes before file events: {}", e);
        }

        let params = DidChangeWatchedFilesParams { changes };
        match serde_json::to_value(params) {
            Ok(params) => {
                if let Err(e) = core
                    .invoke_notification(DidChangeWatchedFiles::METHOD, params)
                    .await
                {
                    error!("failed to send didChangeWatchedFiles: {}", e);
                }
            }
            Err(e) => error!("failed to serialize didChangeWatchedFiles: {}", e),
        }
    }

    fn filter_uris(&self, method: &str, uris: &[Url]) -> Vec<Url> {
        let filters = match self.operations.get(method) {
            Some(filters) => filters,
            None => return Vec::new(),
        };

        uris.iter()
            .filter(|uri| {
                filters
                    .values()
                    .flatten()
                    .any(|filter| filter.matches(uri))
            })
            .cloned()
            .collect()
    }

    pub async fn will_create_files(
        &self,
        core: &Arc<Core>,
        files: &[Url],
    ) -> Result<Option<WorkspaceEdit>> {
        let matched = self.filter_uris(WillCreateFiles::METHOD, files);
        if matched.is_empty() {
            return Ok(None);
        }

        let params = CreateFilesParams {
            files: matched
                .iter()
                .map(|uri| FileCreate { uri: uri.to_string() })
                .collect(),
        };
        self.will_operation(core, WillCreateFiles::METHOD, serde_json::to_value(params)?)
            .await
    }

    pub async fn did_create_files(&self, core: &Arc<Core>, files: &[Url]) -> Result<()> {
        let matched = self.filter_uris(DidCreateFiles::METHOD, files);
        if matched.is_empty() {
            return Ok(());
        }

        let params = CreateFilesParams {
            files: matched
                .iter()
                .map(|uri| FileCreate { uri: uri.to_string() })
                .collect(),
        };
        core.invoke_notification(DidCreateFiles::METHOD, serde_json::to_value(params)?)
            .await
    }

    pub async fn will_rename_files(
        &self,
        core: &Arc<Core>,
        files: &[(Url, Url)],
    ) -> Result<Option<WorkspaceEdit>> {
        let matched = self.filter_renames(WillRenameFiles::METHOD, files);
        if matched.is_empty() {
            return Ok(None);
        }

        let params = RenameFilesParams { files: matched };
        self.will_operation(core, WillRenameFiles::METHOD, serde_json::to_value(params)?)
            .await
    }

    pub async fn did_rename_files(&self, core: &Arc<Core>, files: &[(Url, Url)]) -> Result<()> {
        let matched = self.filter_renames(DidRenameFiles::METHOD, files);
        if matched.is_empty() {
            return Ok(());
        }

        let params = RenameFilesParams { files: matched };
        core.invoke_notification(DidRenameFiles::METHOD, serde_json::to_value(params)?)
            .await
    }

    pub async fn will_delete_files(
        &self,
        core: &Arc<Core>,
        files: &[Url],
    ) -> Result<Option<WorkspaceEdit>> {
        let matched = self.filter_uris(WillDeleteFiles::METHOD, files);
        if matched.is_empty() {
            return Ok(None);
        }

        let params = DeleteFilesParams {
            files: matched
                .iter()
                .map(|uri| FileDelete { uri: uri.to_string() })
                .collect(),
        };
        self.will_operation(core, WillDeleteFiles::METHOD, serde_json::to_value(params)?)
            .await
    }

    pub async fn did_delete_files(&self, core: &Arc<Core>, files: &[Url]) -> Result<()> {
        let matched = self.filter_uris(DidDeleteFiles::METHOD, files);
        if matched.is_empty() {
            return Ok(());
        }

        let params = DeleteFilesParams {
            files: matched
                .iter()
                .map(|uri| FileDelete { uri: uri.to_string() })
                .collect(),
        };
        core.invoke_notification(DidDeleteFiles::METHOD, serde_json::to_value(params)?)
            .await
    }

    fn filter_renames(&self, method: &str, files: &[(Url, Url)]) -> Vec<FileRename> {
        let filters = match self.operations.get(method) {
            Some(filters) => filters,
            None => return Vec::new(),
        };

        files
            .iter()
            .filter(|(old, _)| filters.values().flatten().any(|filter| filter.matches(old)))
            .map(|(old, new)| FileRename {
                old_uri: old.to_string(),
                new_uri: new.to_string(),
            })
            .collect()
    }

    async fn will_operation(
        &self,
        core: &Arc<Core>,
        method: &'static str,
        params: serde_json::Value,
    ) -> Result<Option<WorkspaceEdit>> {
        let token = CancellationToken::new();
        match core.request_or_default(method, params, &token).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(None),
        }
    }

    fn register_operation(
        &self,
        method: &'static str,
        id: String,
        options: FileOperationRegistrationOptions,
    ) -> Result<()> {
        let mut compiled = Vec::with_capacity(options.filters.len());
        for filter in &options.filters {
            let glob = GlobBuilder::new(&filter.pattern.glob)
                .case_insensitive(
                    filter
                        .pattern
                        .options
                        .as_ref()
                        .and_then(|o| o.ignore_case)
                        .unwrap_or(false),
                )
                .build()
                .map_err(|e| {
                    Error::Registration(format!(
                        "invalid file operation glob {:?}: {e}",
                        filter.pattern.glob
                    ))
                })?
                .compile_matcher();

            compiled.push(OperationFilter {
                scheme: filter.scheme.clone(),
                glob,
            });
        }

        self.operations.entry(method).or_default().insert(id, compiled);
        Ok(())
    }
}

impl std::fmt::Debug for FileEventBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileEventBridge")
            .field("queued", &self.queue.lock().expect("file event queue poisoned").len())
            .finish_non_exhaustive()
    }
}

/// The `workspace/didChangeWatchedFiles` feature.
pub(crate) struct WatchedFilesFeature;

impl StaticFeature for WatchedFilesFeature {
    fn fill_client_capabilities(&self, capabilities: &mut lsp_types::ClientCapabilities) {
        capabilities::fills::watched_files(capabilities);
    }

    fn initialize(&self, core: &Arc<Core>, _capabilities: &ServerCapabilities) {
        let watchers = core.options.synchronize.file_events.clone();
        if !watchers.is_empty() {
            core.host.watch_files(CONFIG_WATCHERS_ID, watchers);
            core.file_events
                .watcher_ids
                .lock()
                .expect("watcher ids poisoned")
                .push(CONFIG_WATCHERS_ID.to_owned());
        }
    }

    fn dispose(&self, core: &Arc<Core>) {
        let ids: Vec<String> = {
            let mut ids = core
                .file_events
                .watcher_ids
                .lock()
                .expect("watcher ids poisoned");
            ids.drain(..).collect()
        };
        for id in ids {
            core.host.unwatch_files(&id);
        }
        core.file_events
            .queue
            .lock()
            .expect("file event queue poisoned")
            .clear();
    }
}

impl DynamicFeature for WatchedFilesFeature {
    fn registration_method(&self) -> &'static str {
        DidChangeWatchedFiles::METHOD
    }

    fn register(&self, core: &Arc<Core>, registration: FeatureRegistration) -> Result<()> {
        let options: DidChangeWatchedFilesRegistrationOptions =
            serde_json::from_value(registration.options)?;

        core.host.watch_files(&registration.id, options.watchers);
        core.file_events
            .watcher_ids
            .lock()
            .expect("watcher ids poisoned")
            .push(registration.id);
        Ok(())
    }

    fn unregister(&self, core: &Arc<Core>, id: &str) {
        core.host.unwatch_files(id);
        core.file_events
            .watcher_ids
            .lock()
            .expect("watcher ids poisoned")
            .retain(|existing| existing != id);
    }
}

/// One of the six file operation methods.
pub(crate) struct FileOperationFeature {
    method: &'static str,
}

impl FileOperationFeature {
    pub fn all() -> Vec<Arc<dyn DynamicFeature>> {
        [
            WillCreateFiles::METHOD,
            DidCreateFiles::METHOD,
            WillRenameFiles::METHOD,
            DidRenameFiles::METHOD,
            WillDeleteFiles::METHOD,
            DidDeleteFiles::METHOD,
        ]
        .into_iter()
        .map(|method| Arc::new(FileOperationFeature { method }) as Arc<dyn DynamicFeature>)
        .collect()
    }

    fn capability_options(
        &self,
        capabilities: &ServerCapabilities,
    ) -> Option<FileOperationRegistrationOptions> {
        let operations = capabilities.workspace.as_ref()?.file_operations.as_ref()?;
        let options = match self.method {
            m if m == WillCreateFiles::METHOD => &operations.will_create,
            m if m == DidCreateFiles::METHOD => &operations.did_create,
            m if m == WillRenameFiles::METHOD => &operations.will_rename,
            m if m == DidRenameFiles::METHOD => &operations.did_rename,
            m if m == WillDeleteFiles::METHOD => &operations.will_delete,
            m if m == DidDeleteFiles::METHOD => &operations.did_delete,
            _ => &None,
        };
        options.clone()
    }
}

impl StaticFeature for FileOperationFeature {
    fn fill_client_capabilities(&self, capabilities: &mut lsp_types::ClientCapabilities) {
        if self.method == WillCreateFiles::METHOD {
            capabilities::fills::file_operations(capabilities);
        }
    }

    fn initialize(&self, core: &Arc<Core>, capabilities: &ServerCapabilities) {
        if let Some(options) = self.capability_options(capabilities) {
            let id = format!("static:{}", self.method);
            if let Err(e) = core.file_events.register_operation(self.method, id, options) {
                error!("static registration for {} failed: {}", self.method, e);
            }
        }
    }

    fn dispose(&self, core: &Arc<Core>) {
        core.file_events.operations.remove(self.method);
    }
}

impl DynamicFeature for FileOperationFeature {
    fn registration_method(&self) -> &'static str {
        self.method
    }

    fn register(&self, core: &Arc<Core>, registration: FeatureRegistration) -> Result<()> {
        let options: FileOperationRegistrationOptions =
            serde_json::from_value(registration.options)?;
        core.file_events
            .register_operation(self.method, registration.id, options)
    }

    fn unregister(&self, core: &Arc<Core>, id: &str) {
        if let Some(mut filters) = core.file_events.operations.get_mut(self.method) {
            filters.shift_remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use lsp_types::{
        FileChangeType, FileOperationFilter, FileOperationPattern, ServerCapabilities,
        TextDocumentContentChangeEvent, TextDocumentItem, TextDocumentSyncCapability,
        TextDocumentSyncKind, WorkspaceFileOperationsServerCapabilities,
        WorkspaceServerCapabilities,
    };
    use serde_json::json;

    use crate::test_support::{selector_options, settle, start_client, uri, ServerFixture, TestHost};
    use crate::ClientOptions;

    use super::*;

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn buffers_watcher_events_and_flushes_documents_first() {
        let caps = ServerCapabilities {
            text_document_sync: Some(TextDocumentSyncCapability::Kind(TextDocumentSyncKind::FULL)),
            ..Default::default()
        };
        let fixture = ServerFixture::new(caps);
        let host = TestHost::new();
        let client = start_client(&fixture, &host, selector_options("foo")).await;

        // Dynamic watcher registration lands on the host.
        let id = fixture
            .request(
                "client/registerCapability",
                json!({"registrations": [{
                    "id": "watch-1",
                    "method": "workspace/didChangeWatchedFiles",
                    "registerOptions": {"watchers": [{"globPattern": "**/*.foo"}]},
                }]}),
            )
            .await;
        assert!(fixture.response_for(&id).unwrap().is_ok());
        assert!(host.watchers.lock().unwrap().contains(&"watch-1".to_owned()));

        let u = uri("/src/u.foo");
        client
            .did_open(TextDocumentItem::new(u.clone(), "foo".into(), 1, "u0".into()))
            .await
            .unwrap();
        settle().await;

        client.notify_file_event(FileEvent::new(uri("/src/a.foo"), FileChangeType::CREATED));
        client.notify_file_event(FileEvent::new(uri("/src/b.foo"), FileChangeType::DELETED));
        settle().await;

        // A pending document change must reach the server before the events.
        client
            .did_change(
                &u,
                2,
                vec![TextDocumentContentChangeEvent {
                    range: None,
                    range_length: None,
                    text: "u1".into(),
                }],
                "u1",
            )
            .await
            .unwrap();
        settle().await;

        tokio::time::advance(FILE_EVENT_DEBOUNCE).await;
        settle().await;

        assert_eq!(fixture.sent_count("workspace/didChangeWatchedFiles"), 1);
        let params = fixture
            .sent_params("workspace/didChangeWatchedFiles", 0)
            .unwrap();
        assert_eq!(params["changes"].as_array().unwrap().len(), 2);

        let methods = fixture.sent_methods();
        let change = methods
            .iter()
            .position(|m| m == "textDocument/didChange")
            .unwrap();
        let events = methods
            .iter()
            .position(|m| m == "workspace/didChangeWatchedFiles")
            .unwrap();
        assert!(change < events, "document flush precedes watcher events");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn file_operations_filter_by_glob() {
        let caps = ServerCapabilities {
            workspace: Some(WorkspaceServerCapabilities {
                workspace_folders: None,
                file_operations: Some(WorkspaceFileOperationsServerCapabilities {
                    will_create: Some(FileOperationRegistrationOptions {
                        filters: vec![FileOperationFilter {
                            scheme: None,
                            pattern: FileOperationPattern {
                                glob: "**/*.rs".into(),
                                matches: None,
                                options: None,
                            },
                        }],
                    }),
                    did_create: None,
                    will_rename: None,
                    did_rename: None,
                    will_delete: None,
                    did_delete: None,
                }),
            }),
            ..Default::default()
        };

        let fixture = ServerFixture::new(caps);
        fixture.set_response("workspace/willCreateFiles", json!({"changes": {}}));
        let host = TestHost::new();
        let client = start_client(&fixture, &host, ClientOptions::default()).await;

        let edit = client
            .will_create_files(&[uri("/src/lib.rs"), uri("/notes.txt")])
            .await
            .unwrap();
        assert!(edit.is_some());

        let params = fixture.sent_params("workspace/willCreateFiles", 0).unwrap();
        let files = params["files"].as_array().unwrap();
        assert_eq!(files.len(), 1, "only glob matches are forwarded");
        assert!(files[0]["uri"].as_str().unwrap().ends_with("lib.rs"));

        // No matches means no request at all.
        let edit = client.will_create_files(&[uri("/notes.txt")]).await.unwrap();
        assert!(edit.is_none());
        assert_eq!(fixture.sent_count("workspace/willCreateFiles"), 1);
    }
}
