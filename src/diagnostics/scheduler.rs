//! Per-document pull state machine.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lsp_types::request::{DocumentDiagnosticRequest, Request as _};
use lsp_types::{
    Diagnostic, DiagnosticRegistrationOptions, DocumentDiagnosticParams, DocumentDiagnosticReport,
    DocumentDiagnosticReportKind, DocumentDiagnosticReportResult, FullDocumentDiagnosticReport,
    TextDocumentIdentifier, Url,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::client::Core;
use crate::jsonrpc::ErrorCode;
use crate::selector::CompiledSelector;
use crate::{Error, Result};

use super::workspace;

/// Interval of the background rotation over non-active visible documents.
pub(crate) const BACKGROUND_INTERVAL: Duration = Duration::from_millis(200);

/// The state of the at-most-one in-flight pull per document.
#[derive(Debug)]
enum RequestState {
    /// A request is on the wire.
    Active {
        version: i32,
        token: CancellationToken,
    },
    /// The in-flight request was superseded; re-pull once it terminates.
    Reschedule { version: i32 },
    /// Drop the pending response without mutating the collection.
    OutDated,
}

#[derive(Debug, Clone)]
struct PullRecord {
    version: i32,
    result_id: Option<String>,
}

/// One diagnostic registration's scheduler, collection, and background tasks.
pub(crate) struct DiagnosticScheduler {
    selector: Arc<CompiledSelector>,
    identifier: Option<String>,
    inter_file_dependencies: bool,
    workspace_diagnostics: bool,
    requests: Mutex<HashMap<Url, RequestState>>,
    pulled: Mutex<HashMap<Url, PullRecord>>,
    workspace_results: Mutex<HashMap<Url, String>>,
    collection: Mutex<HashMap<Url, Vec<Diagnostic>>>,
    rotation: Mutex<VecDeque<Url>>,
    trigger: Notify,
    shutdown_token: CancellationToken,
}

impl DiagnosticScheduler {
    pub fn new(
        _core: &Arc<Core>,
        id: &str,
        options: DiagnosticRegistrationOptions,
    ) -> Result<Arc<Self>> {
        let selector = match &options.text_document_registration_options.document_selector {
            Some(selector) => CompiledSelector::new(selector)?,
            None => {
                return Err(Error::Registration(format!(
                    "diagnostic registration {id} carries no document selector"
                )))
            }
        };

        Ok(Arc::new(DiagnosticScheduler {
            selector: Arc::new(selector),
            identifier: options.diagnostic_options.identifier.clone(),
            inter_file_dependencies: options.diagnostic_options.inter_file_dependencies,
            workspace_diagnostics: options.diagnostic_options.workspace_diagnostics,
            requests: Mutex::new(HashMap::new()),
            pulled: Mutex::new(HashMap::new()),
            workspace_results: Mutex::new(HashMap::new()),
            collection: Mutex::new(HashMap::new()),
            rotation: Mutex::new(VecDeque::new()),
            trigger: Notify::new(),
            shutdown_token: CancellationToken::new(),
        }))
    }

    pub fn matches(&self, uri: &Url, language: Option<&str>) -> bool {
        self.selector.matches(uri, language)
    }

    /// Wakes the background rotation immediately.
    pub fn trigger_background(&self) {
        self.trigger.notify_one();
    }

    /// Stops every task and in-flight request owned by this scheduler.
    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
    }

    /// Spawns the background rotation and workspace pull loops as declared by
    /// the registration options.
    pub fn start_background(self: &Arc<Self>, core: &Arc<Core>) {
        if self.inter_file_dependencies {
            core.spawn({
                let scheduler = self.clone();
                let core = core.clone();
                async move { scheduler.background_loop(core).await }
            });
        }

        if self.workspace_diagnostics {
            core.spawn({
                let scheduler = self.clone();
                let core = core.clone();
                async move { workspace::workspace_loop(scheduler, core).await }
            });
        }
    }

    /// Requests fresh diagnostics for a document.
    ///
    /// At most one request per URI is in flight: a pull while one is active
    /// cancels it and records a reschedule, which re-issues a single
    /// consolidated pull once the previous response terminates.
    pub fn pull(self: &Arc<Self>, core: &Arc<Core>, uri: &Url) {
        let version = core.sync.version_of(uri).unwrap_or(0);
        self.pull_version(core, uri, version);
    }

    pub fn pull_version(self: &Arc<Self>, core: &Arc<Core>, uri: &Url, version: i32) {
        let token = {
            let mut requests = self.requests.lock().expect("request states poisoned");
            match requests.get(uri) {
                Some(RequestState::Active { token, .. }) => {
                    token.cancel();
                    requests.insert(uri.clone(), RequestState::Reschedule { version });
                    return;
                }
                Some(RequestState::Reschedule { .. }) | Some(RequestState::OutDated) => {
                    requests.insert(uri.clone(), RequestState::Reschedule { version });
                    return;
                }
                None => {
                    let token = self.shutdown_token.child_token();
                    requests.insert(
                        uri.clone(),
                        RequestState::Active {
                            version,
                            token: token.clone(),
                        },
                    );
                    token
                }
            }
        };

        self.touch(uri);

        core.spawn({
            let scheduler = self.clone();
            let core = core.clone();
            let uri = uri.clone();
            async move { scheduler.run_pull(&core, uri, version, token).await }
        });
    }

    async fn run_pull(self: Arc<Self>, core: &Arc<Core>, uri: Url, version: i32, token: CancellationToken) {
        // The server must observe the document version this pull claims.
        let _ = core.sync.flush_document(core, &uri).await;

        let previous_result_id = self
            .pulled
            .lock()
            .expect("pull records poisoned")
            .get(&uri)
            .and_then(|record| record.result_id.clone());

        let params = DocumentDiagnosticParams {
            text_document: TextDocumentIdentifier { uri: uri.clone() },
            identifier: self.identifier.clone(),
            previous_result_id,
            work_done_progress_params: Default::default(),
            partial_result_params: Default::default(),
        };

        let result: Result<DocumentDiagnosticReportResult> = match serde_json::to_value(params) {
            Ok(params) => match core
                .invoke_request(DocumentDiagnosticRequest::METHOD, params, &token)
                .await
            {
                Ok(value) => serde_json::from_value(value).map_err(Error::from),
                Err(e) => Err(e),
            },
            Err(e) => Err(Error::from(e)),
        };

        let state = self
            .requests
            .lock()
            .expect("request states poisoned")
            .remove(&uri);

        let rescheduled = match state {
            Some(RequestState::OutDated) => {
                // Drop the response; whoever marked the state already cleaned
                // up the bookkeeping.
                return;
            }
            Some(RequestState::Reschedule { version }) => Some(version),
            _ => None,
        };

        if !core.diagnostics.tracker.is_visible(&uri) {
            self.untrack(&uri);
            return;
        }

        match result {
            Ok(report) => self.apply_report(core, &uri, version, report),
            // A cancelled request was superseded; the reschedule below
            // re-issues it.
            Err(Error::Cancelled) => {}
            Err(Error::ConnectionClosed) | Err(Error::NotRunning) => return,
            Err(Error::Rpc(err)) if err.code == ErrorCode::ServerCancelled => {
                if err.retrigger_request() {
                    self.pull_version(core, &uri, rescheduled.unwrap_or(version));
                }
                return;
            }
            Err(e) => {
                error!("diagnostic pull for {} failed: {}", uri, e);
            }
        }

        if let Some(version) = rescheduled {
            self.pull_version(core, &uri, version);
        }
    }

    fn apply_report(
        &self,
        core: &Arc<Core>,
        uri: &Url,
        version: i32,
        report: DocumentDiagnosticReportResult,
    ) {
        match report {
            DocumentDiagnosticReportResult::Report(DocumentDiagnosticReport::Full(related)) => {
                self.record_full(core, uri, version, related.full_document_diagnostic_report);
                if let Some(related_documents) = related.related_documents {
                    self.apply_related(core, related_documents);
                }
            }
            DocumentDiagnosticReportResult::Report(DocumentDiagnosticReport::Unchanged(related)) => {
                self.record_unchanged(
                    uri,
                    version,
                    related.unchanged_document_diagnostic_report.result_id,
                );
                if let Some(related_documents) = related.related_documents {
                    self.apply_related(core, related_documents);
                }
            }
            DocumentDiagnosticReportResult::Partial(partial) => {
                if let Some(related_documents) = partial.related_documents {
                    self.apply_related(core, related_documents);
                }
            }
        }
    }

    fn apply_related(
        &self,
        core: &Arc<Core>,
        related: std::collections::HashMap<Url, DocumentDiagnosticReportKind>,
    ) {
        for (uri, kind) in related {
            match kind {
                DocumentDiagnosticReportKind::Full(full) => {
                    let version = core.sync.version_of(&uri).unwrap_or(0);
                    self.record_full(core, &uri, version, full);
                }
                DocumentDiagnosticReportKind::Unchanged(unchanged) => {
                    let version = core.sync.version_of(&uri).unwrap_or(0);
                    self.record_unchanged(&uri, version, unchanged.result_id);
                }
            }
        }
    }

    fn record_full(
        &self,
        core: &Arc<Core>,
        uri: &Url,
        version: i32,
        report: FullDocumentDiagnosticReport,
    ) {
        self.pulled.lock().expect("pull records poisoned").insert(
            uri.clone(),
            PullRecord {
                version,
                result_id: report.result_id,
            },
        );

        self.collection
            .lock()
            .expect("collection poisoned")
            .insert(uri.clone(), report.items.clone());
        core.host
            .diagnostics_changed(uri, Some(version), &report.items);
    }

    /// An unchanged report rotates the result id; diagnostics stay as-is.
    fn record_unchanged(&self, uri: &Url, version: i32, result_id: String) {
        self.pulled.lock().expect("pull records poisoned").insert(
            uri.clone(),
            PullRecord {
                version,
                result_id: Some(result_id),
            },
        );
    }

    /// Close semantics: with workspace support (or inter-file dependencies),
    /// one last pull gives the workspace provider an accurate baseline;
    /// otherwise the in-flight request is cancelled, marked outdated, and the
    /// collection entry deleted.
    pub fn document_closed(self: &Arc<Self>, core: &Arc<Core>, uri: &Url, version: i32) {
        if self.workspace_diagnostics || self.inter_file_dependencies {
            self.pull_version(core, uri, version);
            return;
        }

        {
            let mut requests = self.requests.lock().expect("request states poisoned");
            match requests.get(uri) {
                Some(RequestState::Active { token, .. }) => {
                    token.cancel();
                    requests.insert(uri.clone(), RequestState::OutDated);
                }
                Some(_) => {
                    requests.insert(uri.clone(), RequestState::OutDated);
                }
                None => {}
            }
        }

        self.untrack(uri);
        let removed = self
            .collection
            .lock()
            .expect("collection poisoned")
            .remove(uri)
            .is_some();
        if removed {
            core.host.diagnostics_changed(uri, None, &[]);
        }
    }

    /// Forgets the pull bookkeeping for a document without touching the
    /// collection. Used when a document leaves the visible set.
    pub fn untrack(&self, uri: &Url) {
        self.pulled.lock().expect("pull records poisoned").remove(uri);
        self.workspace_results
            .lock()
            .expect("workspace results poisoned")
            .remove(uri);
        self.rotation
            .lock()
            .expect("rotation poisoned")
            .retain(|u| u != uri);
    }

    pub fn collection_entry(&self, uri: &Url) -> Option<Vec<Diagnostic>> {
        self.collection
            .lock()
            .expect("collection poisoned")
            .get(uri)
            .cloned()
    }

    /// Moves a document to the most-recently-pulled end of the rotation.
    fn touch(&self, uri: &Url) {
        let mut rotation = self.rotation.lock().expect("rotation poisoned");
        rotation.retain(|u| u != uri);
        rotation.push_back(uri.clone());
    }

    async fn background_loop(self: Arc<Self>, core: Arc<Core>) {
        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => return,
                _ = tokio::time::sleep(BACKGROUND_INTERVAL) => {}
                _ = self.trigger.notified() => {}
            }

            if let Some(uri) = self.next_background(&core) {
                self.pull(&core, &uri);
            }
        }
    }

    /// The least recently pulled visible document that is not the active
    /// editor.
    fn next_background(&self, core: &Arc<Core>) -> Option<Url> {
        let active = core.diagnostics.tracker.active();
        let mut rotation = self.rotation.lock().expect("rotation poisoned");

        for _ in 0..rotation.len() {
            let uri = match rotation.pop_front() {
                Some(uri) => uri,
                None => return None,
            };
            rotation.push_back(uri.clone());

            if Some(&uri) == active.as_ref() {
                continue;
            }
            if !core.diagnostics.tracker.is_visible(&uri) || !core.sync.is_open(&uri) {
                continue;
            }
            return Some(uri);
        }
        None
    }

    pub(super) fn shutdown_child_token(&self) -> CancellationToken {
        self.shutdown_token.child_token()
    }

    pub(super) fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    pub(super) fn identifier(&self) -> Option<String> {
        self.identifier.clone()
    }

    /// Result ids for the next workspace pull: the union of workspace-pull
    /// and document-pull ids, the latter winning on conflict.
    pub(super) fn previous_result_ids(&self) -> Vec<(Url, String)> {
        let mut ids: HashMap<Url, String> = self
            .workspace_results
            .lock()
            .expect("workspace results poisoned")
            .clone();

        for (uri, record) in self.pulled.lock().expect("pull records poisoned").iter() {
            if let Some(result_id) = &record.result_id {
                ids.insert(uri.clone(), result_id.clone());
            }
        }

        ids.into_iter().collect()
    }

    /// Whether a document is tracked by document pull, in which case
    /// workspace reports for it are ignored.
    pub(super) fn is_document_pulled(&self, uri: &Url) -> bool {
        self.pulled
            .lock()
            .expect("pull records poisoned")
            .contains_key(uri)
    }

    pub(super) fn record_workspace_full(
        &self,
        core: &Arc<Core>,
        uri: &Url,
        version: Option<i32>,
        report: FullDocumentDiagnosticReport,
    ) {
        if let Some(result_id) = &report.result_id {
            self.workspace_results
                .lock()
                .expect("workspace results poisoned")
                .insert(uri.clone(), result_id.clone());
        }

        self.collection
            .lock()
            .expect("collection poisoned")
            .insert(uri.clone(), report.items.clone());
        core.host.diagnostics_changed(uri, version, &report.items);
    }

    pub(super) fn record_workspace_unchanged(&self, uri: &Url, result_id: String) {
        self.workspace_results
            .lock()
            .expect("workspace results poisoned")
            .insert(uri.clone(), result_id);
    }
}

impl std::fmt::Debug for DiagnosticScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosticScheduler")
            .field("identifier", &self.identifier)
            .field("inter_file_dependencies", &self.inter_file_dependencies)
            .field("workspace_diagnostics", &self.workspace_diagnostics)
            .finish_non_exhaustive()
    }
}
