//! Document synchronization.
//!
//! Tracks which document snapshots have been forwarded to the server, drives
//! the `didOpen`/`didChange`/`willSave`/`didSave`/`didClose` notifications
//! according to the server's declared sync kind, and owns the full-sync
//! change delayer. The delayer holds at most one pending document: a change
//! for a different document flushes the pending one synchronously before its
//! own debounce starts, and every feature request forces a flush for its
//! document so the server's view is at least as new as the request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lsp_types::notification::{
    DidChangeTextDocument, DidCloseTextDocument, DidOpenTextDocument, DidSaveTextDocument,
    Notification, WillSaveTextDocument,
};
use lsp_types::request::{Request as _, WillSaveWaitUntil};
use lsp_types::{
    DidChangeTextDocumentParams, DidCloseTextDocumentParams, DidOpenTextDocumentParams,
    DidSaveTextDocumentParams, TextDocumentContentChangeEvent, TextDocumentIdentifier,
    TextDocumentItem, TextDocumentSaveReason, TextDocumentSyncKind, TextEdit, Url,
    VersionedTextDocumentIdentifier, WillSaveTextDocumentParams,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::capabilities;
use crate::client::Core;
use crate::registry::{DynamicFeature, FeatureRegistration, ProviderEntry, StaticFeature};
use crate::selector::CompiledSelector;
use crate::Result;

/// Debounce applied to full-document sync before a change is delivered.
pub(crate) const CHANGE_DEBOUNCE: Duration = Duration::from_millis(200);

#[derive(Debug)]
struct DocumentEntry {
    language_id: String,
    version: i32,
    text: String,
    synced: bool,
}

#[derive(Debug)]
struct PendingChange {
    uri: Url,
    generation: u64,
}

/// The synced document set plus the full-sync change delayer.
#[derive(Debug)]
pub(crate) struct DocumentSync {
    documents: Mutex<HashMap<Url, DocumentEntry>>,
    pending: Mutex<Option<PendingChange>>,
    generation: AtomicU64,
}

impl DocumentSync {
    pub fn new() -> Self {
        DocumentSync {
            documents: Mutex::new(HashMap::new()),
            pending: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// The language id of a tracked document.
    pub fn language_of(&self, uri: &Url) -> Option<String> {
        self.documents
            .lock()
            .expect("document store poisoned")
            .get(uri)
            .map(|entry| entry.language_id.clone())
    }

    /// The most recently stored version of a tracked document.
    pub fn version_of(&self, uri: &Url) -> Option<i32> {
        self.documents
            .lock()
            .expect("document store poisoned")
            .get(uri)
            .map(|entry| entry.version)
    }

    /// Returns `true` if the document is known to the store.
    pub fn is_open(&self, uri: &Url) -> bool {
        self.documents
            .lock()
            .expect("document store poisoned")
            .contains_key(uri)
    }

    pub async fn did_open(&self, core: &Arc<Core>, item: TextDocumentItem) -> Result<()> {
        {
            let mut documents = self.documents.lock().expect("document store poisoned");
            documents.insert(
                item.uri.clone(),
                DocumentEntry {
                    language_id: item.language_id.clone(),
                    version: item.version,
                    text: item.text.clone(),
                    synced: false,
                },
            );
        }

        self.sync_open(core, &item.uri).await?;
        core.diagnostics.on_open(core, &item.uri);
        Ok(())
    }

    pub async fn did_change(
        &self,
        core: &Arc<Core>,
        uri: &Url,
        version: i32,
        changes: Vec<TextDocumentContentChangeEvent>,
        text: &str,
    ) -> Result<()> {
        let (synced, language) = {
            let mut documents = self.documents.lock().expect("document store poisoned");
            match documents.get_mut(uri) {
                Some(entry) => {
                    entry.version = version;
                    entry.text = text.to_owned();
                    (entry.synced, entry.language_id.clone())
                }
                None => {
                    debug!("change for untracked document {} dropped", uri);
                    return Ok(());
                }
            }
        };

        let has_changes = !changes.is_empty();

        if synced {
            match self.change_sync_kind(core, uri, &language) {
                Some(kind) if kind == TextDocumentSyncKind::FULL => {
                    self.schedule_full(core, uri).await?;
                }
                Some(kind) if kind == TextDocumentSyncKind::INCREMENTAL => {
                    let params = DidChangeTextDocumentParams {
                        text_document: VersionedTextDocumentIdentifier {
                            uri: uri.clone(),
                            version,
                        },
                        content_changes: changes,
                    };
                    core.invoke_notification(
                        DidChangeTextDocument::METHOD,
                        serde_json::to_value(params)?,
                    )
                    .await?;
                }
                _ => {}
            }
        }

        core.diagnostics.on_change(core, uri, has_changes);
        Ok(())
    }

    pub async fn will_save(
        &self,
        core: &Arc<Core>,
        uri: &Url,
        reason: TextDocumentSaveReason,
    ) -> Result<()> {
        let language = self.language_of(uri);
        if core
            .providers
            .first_match(WillSaveTextDocument::METHOD, uri, language.as_deref())
            .is_none()
        {
            return Ok(());
        }

        let params = WillSaveTextDocumentParams {
            text_document: TextDocumentIdentifier { uri: uri.clone() },
            reason,
        };
        core.invoke_notification(WillSaveTextDocument::METHOD, serde_json::to_value(params)?)
            .await
    }

    /// Sends `textDocument/willSaveWaitUntil` and returns the server's edits.
    ///
    /// A missing result yields an empty edit list.
    pub async fn will_save_wait_until(
        &self,
        core: &Arc<Core>,
        uri: &Url,
        reason: TextDocumentSaveReason,
        token: &CancellationToken,
    ) -> Result<Vec<TextEdit>> {
        let language = self.language_of(uri);
        if core
            .providers
            .first_match(WillSaveWaitUntil::METHOD, uri, language.as_deref())
            .is_none()
        {
            return Ok(Vec::new());
        }

        self.flush_document(core, uri).await?;

        let params = WillSaveTextDocumentParams {
            text_document: TextDocumentIdentifier { uri: uri.clone() },
            reason,
        };
        let result = core
            .request_or_default(WillSaveWaitUntil::METHOD, serde_json::to_value(params)?, token)
            .await?;

        match result {
            Some(value) => {
                let edits: Option<Vec<TextEdit>> = serde_json::from_value(value)?;
                Ok(edits.unwrap_or_default())
            }
            None => Ok(Vec::new()),
        }
    }

    pub async fn did_save(&self, core: &Arc<Core>, uri: &Url) -> Result<()> {
        let language = self.language_of(uri);
        let registration =
            core.providers
                .first_match(DidSaveTextDocument::METHOD, uri, language.as_deref());

        if let Some((_, options)) = registration {
            self.flush_document(core, uri).await?;

            let include_text = options
                .get("includeText")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let text = if include_text {
                self.documents
                    .lock()
                    .expect("document store poisoned")
                    .get(uri)
                    .map(|entry| entry.text.clone())
            } else {
                None
            };

            let params = DidSaveTextDocumentParams {
                text_document: TextDocumentIdentifier { uri: uri.clone() },
                text,
            };
            core.invoke_notification(DidSaveTextDocument::METHOD, serde_json::to_value(params)?)
                .await?;
        }

        core.diagnostics.on_save(core, uri);
        Ok(())
    }

    pub async fn did_close(&self, core: &Arc<Core>, uri: &Url, version: i32) -> Result<()> {
        let was_synced = {
            let mut documents = self.documents.lock().expect("document store poisoned");
            documents.remove(uri).map(|entry| entry.synced).unwrap_or(false)
        };

        // Drop any pending change for the document; there is nothing left to
        // deliver it for.
        {
            let mut pending = self.pending.lock().expect("change delayer poisoned");
            if pending.as_ref().map(|p| p.uri == *uri).unwrap_or(false) {
                *pending = None;
            }
        }

        if was_synced && core.providers.has_any(DidCloseTextDocument::METHOD) {
            let params = DidCloseTextDocumentParams {
                text_document: TextDocumentIdentifier { uri: uri.clone() },
            };
            core.invoke_notification(DidCloseTextDocument::METHOD, serde_json::to_value(params)?)
                .await?;
        }

        core.diagnostics.on_close(core, uri, version);
        Ok(())
    }

    /// Drains a pending debounced change for `uri`, if any.
    pub async fn flush_document(&self, core: &Arc<Core>, uri: &Url) -> Result<()> {
        let should_flush = {
            let mut pending = self.pending.lock().expect("change delayer poisoned");
            match &*pending {
                Some(p) if p.uri == *uri => {
                    *pending = None;
                    true
                }
                _ => false,
            }
        };

        if should_flush {
            self.send_full(core, uri).await?;
        }
        Ok(())
    }

    /// Drains whatever pending change exists, regardless of document.
    pub async fn flush_all(&self, core: &Arc<Core>) -> Result<()> {
        let uri = {
            let mut pending = self.pending.lock().expect("change delayer poisoned");
            pending.take().map(|p| p.uri)
        };

        if let Some(uri) = uri {
            self.send_full(core, &uri).await?;
        }
        Ok(())
    }

    /// Replays `didOpen` for unsynced documents matching a new registration.
    pub async fn replay_open(&self, core: &Arc<Core>, selector: &CompiledSelector) {
        for item in core.host.open_documents() {
            let mut documents = self.documents.lock().expect("document store poisoned");
            documents.entry(item.uri.clone()).or_insert(DocumentEntry {
                language_id: item.language_id,
                version: item.version,
                text: item.text,
                synced: false,
            });
        }

        let to_open: Vec<Url> = {
            let documents = self.documents.lock().expect("document store poisoned");
            documents
                .iter()
                .filter(|(uri, entry)| !entry.synced && selector.matches(uri, Some(&entry.language_id)))
                .map(|(uri, _)| uri.clone())
                .collect()
        };

        for uri in to_open {
            if let Err(e) = self.sync_open(core, &uri).await {
                error!("failed to replay didOpen for {}: {}", uri, e);
            } else {
                core.diagnostics.on_open(core, &uri);
            }
        }
    }

    /// Replays `didClose` for synced documents no longer matched by any
    /// remaining `didOpen` registration.
    pub async fn replay_close(&self, core: &Arc<Core>) {
        let to_close: Vec<Url> = {
            let documents = self.documents.lock().expect("document store poisoned");
            documents
                .iter()
                .filter(|(uri, entry)| {
                    entry.synced
                        && core
                            .providers
                            .first_match(DidOpenTextDocument::METHOD, uri, Some(&entry.language_id))
                            .is_none()
                })
                .map(|(uri, _)| uri.clone())
                .collect()
        };

        for uri in to_close {
            {
                let mut documents = self.documents.lock().expect("document store poisoned");
                if let Some(entry) = documents.get_mut(&uri) {
                    entry.synced = false;
                }
            }

            let params = DidCloseTextDocumentParams {
                text_document: TextDocumentIdentifier { uri: uri.clone() },
            };
            match serde_json::to_value(params) {
                Ok(params) => {
                    if let Err(e) = core.invoke_notification(DidCloseTextDocument::METHOD, params).await
                    {
                        error!("failed to replay didClose for {}: {}", uri, e);
                    }
                }
                Err(e) => error!("failed to serialize didClose for {}: {}", uri, e),
            }
        }
    }

    /// Forgets every tracked document without notifying the server.
    pub fn clear(&self) {
        self.documents
            .lock()
            .expect("document store poisoned")
            .clear();
        *self.pending.lock().expect("change delayer poisoned") = None;
    }

    async fn sync_open(&self, core: &Arc<Core>, uri: &Url) -> Result<()> {
        let item = {
            let mut documents = self.documents.lock().expect("document store poisoned");
            match documents.get_mut(uri) {
                Some(entry) if !entry.synced => {
                    if core
                        .providers
                        .first_match(DidOpenTextDocument::METHOD, uri, Some(&entry.language_id))
                        .is_none()
                    {
                        return Ok(());
                    }
                    entry.synced = true;
                    TextDocumentItem {
                        uri: uri.clone(),
                        language_id: entry.language_id.clone(),
                        version: entry.version,
                        text: entry.text.clone(),
                    }
                }
                _ => return Ok(()),
            }
        };

        let params = DidOpenTextDocumentParams {
            text_document: item,
        };
        core.invoke_notification(DidOpenTextDocument::METHOD, serde_json::to_value(params)?)
            .await
    }

    fn change_sync_kind(
        &self,
        core: &Arc<Core>,
        uri: &Url,
        language: &str,
    ) -> Option<TextDocumentSyncKind> {
        let (_, options) =
            core.providers
                .first_match(DidChangeTextDocument::METHOD, uri, Some(language))?;

        match options.get("syncKind").and_then(Value::as_i64) {
            Some(1) => Some(TextDocumentSyncKind::FULL),
            Some(2) => Some(TextDocumentSyncKind::INCREMENTAL),
            _ => Some(TextDocumentSyncKind::NONE),
        }
    }

    /// Enqueues a debounced full-document change, flushing any pending change
    /// for a different document first.
    async fn schedule_full(&self, core: &Arc<Core>, uri: &Url) -> Result<()> {
        let (flush_first, generation) = {
            let mut pending = self.pending.lock().expect("change delayer poisoned");
            let flush_first = match &*pending {
                Some(p) if p.uri != *uri => Some(p.uri.clone()),
                _ => None,
            };
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            *pending = Some(PendingChange {
                uri: uri.clone(),
                generation,
            });
            (flush_first, generation)
        };

        if let Some(other) = flush_first {
            self.send_full(core, &other).await?;
        }

        core.spawn({
            let core = core.clone();
            async move {
                tokio::time::sleep(CHANGE_DEBOUNCE).await;
                core.sync.flush_generation(&core, generation).await;
            }
        });

        Ok(())
    }

    async fn flush_generation(&self, core: &Arc<Core>, generation: u64) {
        let uri = {
            let mut pending = self.pending.lock().expect("change delayer poisoned");
            match &*pending {
                Some(p) if p.generation == generation => pending.take().map(|p| p.uri),
                _ => None,
            }
        };

        if let Some(uri) = uri {
            if let Err(e) = self.send_full(core, &uri).await {
                error!("failed to flush change for {}: {}", uri, e);
            }
        }
    }

    async fn send_full(&self, core: &Arc<Core>, uri: &Url) -> Result<()> {
        let (version, text) = {
            let documents = self.documents.lock().expect("document store poisoned");
            match documents.get(uri) {
                Some(entry) => (entry.version, entry.text.clone()),
                None => return Ok(()),
            }
        };

        let params = DidChangeTextDocumentParams {
            text_document: VersionedTextDocumentIdentifier {
                uri: uri.clone(),
                version,
            },
            content_changes: vec![TextDocumentContentChangeEvent {
                range: None,
                range_length: None,
                text,
            }],
        };
        core.invoke_notification(DidChangeTextDocument::METHOD, serde_json::to_value(params)?)
            .await
    }
}

/// Registers the sync notifications against the server's declared sync
/// options. Each notification method is its own dynamic feature.
pub(crate) struct SyncFeature {
    method: &'static str,
}

impl SyncFeature {
    pub fn all() -> Vec<Arc<dyn DynamicFeature>> {
        [
            DidOpenTextDocument::METHOD,
            DidChangeTextDocument::METHOD,
            WillSaveTextDocument::METHOD,
            WillSaveWaitUntil::METHOD,
            DidSaveTextDocument::METHOD,
            DidCloseTextDocument::METHOD,
        ]
        .into_iter()
        .map(|method| Arc::new(SyncFeature { method }) as Arc<dyn DynamicFeature>)
        .collect()
    }

    fn static_options(&self, core: &Arc<Core>) -> Option<Value> {
        let resolved = core.resolved_sync();

        match self.method {
            DidOpenTextDocument::METHOD | DidCloseTextDocument::METHOD => {
                (resolved.open_close || resolved.change != TextDocumentSyncKind::NONE)
                    .then(|| json!({}))
            }
            DidChangeTextDocument::METHOD => {
                if resolved.change == TextDocumentSyncKind::NONE {
                    None
                } else if resolved.change == TextDocumentSyncKind::FULL {
                    Some(json!({ "syncKind": 1 }))
                } else {
                    Some(json!({ "syncKind": 2 }))
                }
            }
            WillSaveTextDocument::METHOD => resolved.will_save.then(|| json!({})),
            WillSaveWaitUntil::METHOD => resolved.will_save_wait_until.then(|| json!({})),
            DidSaveTextDocument::METHOD => resolved
                .save
                .map(|save| json!({ "includeText": save.include_text })),
            _ => None,
        }
    }
}

impl StaticFeature for SyncFeature {
    fn fill_client_capabilities(&self, capabilities: &mut lsp_types::ClientCapabilities) {
        if self.method == DidOpenTextDocument::METHOD {
            capabilities::fills::text_document_sync(capabilities);
        }
    }

    fn initialize(&self, core: &Arc<Core>, _capabilities: &lsp_types::ServerCapabilities) {
        if let Some(options) = self.static_options(core) {
            let registration = capabilities::static_registration(core, self.method, options);
            if let Err(e) = self.register(core, registration) {
                error!("static registration for {} failed: {}", self.method, e);
            }
        }
    }

    fn dispose(&self, core: &Arc<Core>) {
        core.providers.clear_method(self.method);
        if self.method == DidOpenTextDocument::METHOD {
            core.sync.clear();
        }
    }
}

impl DynamicFeature for SyncFeature {
    fn registration_method(&self) -> &'static str {
        self.method
    }

    fn register(&self, core: &Arc<Core>, registration: FeatureRegistration) -> Result<()> {
        let selector = Arc::new(crate::registry::parse_selector(
            self.method,
            &registration.options,
        )?);

        core.providers.register(
            self.method,
            registration.id,
            ProviderEntry {
                selector: Some(selector.clone()),
                options: registration.options,
            },
        );

        if self.method == DidOpenTextDocument::METHOD {
            core.spawn({
                let core = core.clone();
                async move {
                    core.sync.replay_open(&core, &selector).await;
                }
            });
        }

        Ok(())
    }

    fn unregister(&self, core: &Arc<Core>, id: &str) {
        core.providers.unregister(self.method, id);

        if self.method == DidOpenTextDocument::METHOD
            || self.method == DidCloseTextDocument::METHOD
        {
            core.spawn({
                let core = core.clone();
                async move {
                    core.sync.replay_close(&core).await;
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use lsp_types::request::HoverRequest;
    use lsp_types::{
        HoverParams, HoverProviderCapability, Position, SaveOptions, ServerCapabilities,
        TextDocumentPositionParams, TextDocumentSyncCapability, TextDocumentSyncOptions,
        TextDocumentSyncSaveOptions,
    };
    use serde_json::json;
    use tokio::time::advance;

    use crate::test_support::{selector_options, settle, start_client, uri, ServerFixture, TestHost};

    use super::*;

    fn full_sync_caps() -> ServerCapabilities {
        ServerCapabilities {
            text_document_sync: Some(TextDocumentSyncCapability::Kind(TextDocumentSyncKind::FULL)),
            ..Default::default()
        }
    }

    fn incremental_caps() -> ServerCapabilities {
        ServerCapabilities {
            text_document_sync: Some(TextDocumentSyncCapability::Kind(
                TextDocumentSyncKind::INCREMENTAL,
            )),
            ..Default::default()
        }
    }

    fn document(uri: &Url, text: &str) -> TextDocumentItem {
        TextDocumentItem::new(uri.clone(), "foo".to_owned(), 1, text.to_owned())
    }

    fn full_change(text: &str) -> Vec<TextDocumentContentChangeEvent> {
        vec![TextDocumentContentChangeEvent {
            range: None,
            range_length: None,
            text: text.to_owned(),
        }]
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn full_sync_coalesces_and_flushes_on_document_switch() {
        let fixture = ServerFixture::new(full_sync_caps());
        let host = TestHost::new();
        let client = start_client(&fixture, &host, selector_options("foo")).await;

        let u = uri("/u.foo");
        let v = uri("/v.foo");
        client.did_open(document(&u, "u0")).await.unwrap();
        client.did_open(document(&v, "v0")).await.unwrap();
        settle().await;
        assert_eq!(fixture.sent_count("textDocument/didOpen"), 2);

        client.did_change(&u, 2, full_change("one"), "one").await.unwrap();
        settle().await;
        advance(Duration::from_millis(50)).await;
        client.did_change(&u, 3, full_change("two"), "two").await.unwrap();
        settle().await;
        advance(Duration::from_millis(50)).await;
        client.did_change(&u, 4, full_change("three"), "three").await.unwrap();
        settle().await;
        advance(Duration::from_millis(20)).await;

        // A change for a different document flushes the pending one first.
        client.did_change(&v, 2, full_change("vee"), "vee").await.unwrap();
        settle().await;

        assert_eq!(fixture.sent_count("textDocument/didChange"), 1);
        let flushed = fixture.sent_params("textDocument/didChange", 0).unwrap();
        assert_eq!(flushed["textDocument"]["uri"], json!(u.as_str()));
        assert_eq!(flushed["textDocument"]["version"], json!(4));
        assert_eq!(flushed["contentChanges"][0]["text"], json!("three"));

        advance(Duration::from_millis(200)).await;
        settle().await;

        assert_eq!(fixture.sent_count("textDocument/didChange"), 2);
        let second = fixture.sent_params("textDocument/didChange", 1).unwrap();
        assert_eq!(second["textDocument"]["uri"], json!(v.as_str()));
        assert_eq!(second["contentChanges"][0]["text"], json!("vee"));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn pending_change_flushes_before_feature_request() {
        let mut caps = full_sync_caps();
        caps.hover_provider = Some(HoverProviderCapability::Simple(true));

        let fixture = ServerFixture::new(caps);
        let host = TestHost::new();
        let client = start_client(&fixture, &host, selector_options("foo")).await;

        let u = uri("/u.foo");
        client.did_open(document(&u, "u0")).await.unwrap();
        client.did_change(&u, 2, full_change("new"), "new").await.unwrap();
        settle().await;
        assert_eq!(fixture.sent_count("textDocument/didChange"), 0);

        let params = HoverParams {
            text_document_position_params: TextDocumentPositionParams {
                text_document: TextDocumentIdentifier { uri: u.clone() },
                position: Position::new(0, 0),
            },
            work_done_progress_params: Default::default(),
        };
        client
            .document_request::<HoverRequest>(&u, params, &CancellationToken::new())
            .await
            .unwrap();

        let methods = fixture.sent_methods();
        let change = methods.iter().position(|m| m == "textDocument/didChange").unwrap();
        let hover = methods.iter().position(|m| m == "textDocument/hover").unwrap();
        assert!(change < hover, "flush precedes the request");

        // The debounce timer finds nothing left to deliver.
        advance(CHANGE_DEBOUNCE).await;
        settle().await;
        assert_eq!(fixture.sent_count("textDocument/didChange"), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn incremental_changes_forward_in_arrival_order() {
        let fixture = ServerFixture::new(incremental_caps());
        let host = TestHost::new();
        let client = start_client(&fixture, &host, selector_options("foo")).await;

        let u = uri("/u.foo");
        client.did_open(document(&u, "u0")).await.unwrap();

        client.did_change(&u, 2, full_change("a"), "a").await.unwrap();
        client.did_change(&u, 3, full_change("b"), "b").await.unwrap();
        settle().await;

        assert_eq!(fixture.sent_count("textDocument/didChange"), 2);
        let first = fixture.sent_params("textDocument/didChange", 0).unwrap();
        let second = fixture.sent_params("textDocument/didChange", 1).unwrap();
        assert_eq!(first["textDocument"]["version"], json!(2));
        assert_eq!(second["textDocument"]["version"], json!(3));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn will_save_wait_until_returns_edits() {
        let caps = ServerCapabilities {
            text_document_sync: Some(TextDocumentSyncCapability::Options(TextDocumentSyncOptions {
                open_close: Some(true),
                change: Some(TextDocumentSyncKind::INCREMENTAL),
                will_save: Some(true),
                will_save_wait_until: Some(true),
                save: Some(TextDocumentSyncSaveOptions::Supported(true)),
            })),
            ..Default::default()
        };

        let fixture = ServerFixture::new(caps);
        let host = TestHost::new();
        let client = start_client(&fixture, &host, selector_options("foo")).await;

        let u = uri("/u.foo");
        client.did_open(document(&u, "u0")).await.unwrap();

        fixture.set_response(
            "textDocument/willSaveWaitUntil",
            json!([{
                "range": {"start": {"line": 0, "character": 0}, "end": {"line": 0, "character": 0}},
                "newText": "edited",
            }]),
        );
        let edits = client
            .will_save_wait_until(&u, TextDocumentSaveReason::MANUAL, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].new_text, "edited");

        // A missing result yields an empty edit list.
        fixture.set_response("textDocument/willSaveWaitUntil", json!(null));
        let edits = client
            .will_save_wait_until(&u, TextDocumentSaveReason::MANUAL, &CancellationToken::new())
            .await
            .unwrap();
        assert!(edits.is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn did_save_includes_text_when_requested() {
        let caps = ServerCapabilities {
            text_document_sync: Some(TextDocumentSyncCapability::Options(TextDocumentSyncOptions {
                open_close: Some(true),
                change: Some(TextDocumentSyncKind::INCREMENTAL),
                will_save: None,
                will_save_wait_until: None,
                save: Some(TextDocumentSyncSaveOptions::SaveOptions(SaveOptions {
                    include_text: Some(true),
                })),
            })),
            ..Default::default()
        };

        let fixture = ServerFixture::new(caps);
        let host = TestHost::new();
        let client = start_client(&fixture, &host, selector_options("foo")).await;

        let u = uri("/u.foo");
        client.did_open(document(&u, "saved body")).await.unwrap();
        client.did_save(&u).await.unwrap();
        settle().await;

        let params = fixture.sent_params("textDocument/didSave", 0).unwrap();
        assert_eq!(params["text"], json!("saved body"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn close_suppressed_for_documents_never_synced() {
        let fixture = ServerFixture::new(ServerCapabilities::default());
        let host = TestHost::new();
        let client = start_client(&fixture, &host, selector_options("foo")).await;

        let u = uri("/u.foo");
        client.did_open(document(&u, "u0")).await.unwrap();
        client.did_close(&u).await.unwrap();
        settle().await;

        assert_eq!(fixture.sent_count("textDocument/didOpen"), 0);
        assert_eq!(fixture.sent_count("textDocument/didClose"), 0);
    }
}
