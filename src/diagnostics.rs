//! Pull-model diagnostics.
//!
//! The client, not the server, decides when diagnostics are computed: open
//! and visible documents are pulled eagerly, non-active visible documents
//! rotate through a background cycle when the server declares inter-file
//! dependencies, and a long-running workspace pull covers everything else.
//! Each diagnostic registration owns one [`DiagnosticScheduler`] with its own
//! diagnostic collection; no other component writes to that collection.

pub(crate) use self::scheduler::DiagnosticScheduler;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use lsp_types::{Diagnostic, DiagnosticRegistrationOptions, ServerCapabilities, Url};
use tracing::error;

use crate::capabilities;
use crate::client::Core;
use crate::options::DiagnosticPullMode;
use crate::registry::{DynamicFeature, FeatureRegistration, StaticFeature};
use crate::Result;

mod scheduler;
mod workspace;

/// The set of URIs currently visible in editor tabs, plus the active editor.
///
/// Fed by the host through
/// [`LanguageClient::editor_tabs_changed`](crate::LanguageClient::editor_tabs_changed).
#[derive(Debug, Default)]
pub(crate) struct EditorTracker {
    visible: Mutex<HashSet<Url>>,
    active: Mutex<Option<Url>>,
}

impl EditorTracker {
    pub fn is_visible(&self, uri: &Url) -> bool {
        self.visible.lock().expect("editor tracker poisoned").contains(uri)
    }

    pub fn active(&self) -> Option<Url> {
        self.active.lock().expect("editor tracker poisoned").clone()
    }

    pub fn visible_snapshot(&self) -> Vec<Url> {
        self.visible
            .lock()
            .expect("editor tracker poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Replaces the visible set, returning the newly visible and the no
    /// longer visible URIs.
    fn update(&self, visible: Vec<Url>, active: Option<Url>) -> (Vec<Url>, Vec<Url>) {
        let next: HashSet<Url> = visible.into_iter().collect();
        let mut current = self.visible.lock().expect("editor tracker poisoned");

        let added = next.difference(&current).cloned().collect();
        let removed = current.difference(&next).cloned().collect();
        *current = next;
        drop(current);

        *self.active.lock().expect("editor tracker poisoned") = active;
        (added, removed)
    }
}

/// Fan-out point from document lifecycle events to every active scheduler.
pub(crate) struct DiagnosticState {
    pub tracker: EditorTracker,
    schedulers: Mutex<IndexMap<String, Arc<DiagnosticScheduler>>>,
}

impl DiagnosticState {
    pub fn new() -> Self {
        DiagnosticState {
            tracker: EditorTracker::default(),
            schedulers: Mutex::new(IndexMap::new()),
        }
    }

    fn snapshot(&self) -> Vec<Arc<DiagnosticScheduler>> {
        self.schedulers
            .lock()
            .expect("scheduler table poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Every matching and visible document is pulled on open.
    pub fn on_open(&self, core: &Arc<Core>, uri: &Url) {
        if !self.tracker.is_visible(uri) {
            return;
        }

        let language = core.sync.language_of(uri);
        for scheduler in self.snapshot() {
            if scheduler.matches(uri, language.as_deref()) {
                scheduler.pull(core, uri);
            }
        }
    }

    pub fn on_change(&self, core: &Arc<Core>, uri: &Url, has_changes: bool) {
        if !has_changes {
            return;
        }
        self.triggered_pull(core, uri, DiagnosticPullMode::OnChange);
    }

    pub fn on_save(&self, core: &Arc<Core>, uri: &Url) {
        self.triggered_pull(core, uri, DiagnosticPullMode::OnSave);
    }

    fn triggered_pull(&self, core: &Arc<Core>, uri: &Url, mode: DiagnosticPullMode) {
        let options = &core.options.diagnostic_pull_options;
        let enabled = match mode {
            DiagnosticPullMode::OnChange => options.on_change,
            DiagnosticPullMode::OnSave => options.on_save,
        };
        if !enabled || !core.sync.is_open(uri) || !self.tracker.is_visible(uri) {
            return;
        }

        if let Some(filter) = &options.filter {
            if filter(uri, mode) {
                return;
            }
        }

        let language = core.sync.language_of(uri);
        for scheduler in self.snapshot() {
            if scheduler.matches(uri, language.as_deref()) {
                scheduler.pull(core, uri);
                scheduler.trigger_background();
            }
        }
    }

    /// Close semantics depend on the server's workspace support; see
    /// [`DiagnosticScheduler::document_closed`].
    pub fn on_close(&self, core: &Arc<Core>, uri: &Url, version: i32) {
        for scheduler in self.snapshot() {
            scheduler.document_closed(core, uri, version);
        }
    }

    /// Serves `workspace/diagnostic/refresh`: every matching and visible
    /// document is pulled again.
    pub fn refresh(&self, core: &Arc<Core>) {
        for uri in self.tracker.visible_snapshot() {
            if !core.sync.is_open(&uri) {
                continue;
            }
            let language = core.sync.language_of(&uri);
            for scheduler in self.snapshot() {
                if scheduler.matches(&uri, language.as_deref()) {
                    scheduler.pull(core, &uri);
                }
            }
        }
    }

    pub fn tabs_changed(&self, core: &Arc<Core>, visible: Vec<Url>, active: Option<Url>) {
        let (added, removed) = self.tracker.update(visible, active);

        for uri in &removed {
            for scheduler in self.snapshot() {
                scheduler.untrack(uri);
            }
        }

        for uri in &added {
            if !core.sync.is_open(uri) {
                continue;
            }
            let language = core.sync.language_of(uri);
            for scheduler in self.snapshot() {
                if scheduler.matches(uri, language.as_deref()) {
                    scheduler.pull(core, uri);
                }
            }
        }
    }

    /// The current pull-diagnostic collection entry for a document.
    pub fn diagnostics(&self, uri: &Url) -> Vec<Diagnostic> {
        for scheduler in self.snapshot() {
            if let Some(diagnostics) = scheduler.collection_entry(uri) {
                return diagnostics;
            }
        }
        Vec::new()
    }

    fn register(&self, core: &Arc<Core>, id: String, options: DiagnosticRegistrationOptions) -> Result<()> {
        let scheduler = DiagnosticScheduler::new(core, &id, options)?;

        let previous = self
            .schedulers
            .lock()
            .expect("scheduler table poisoned")
            .insert(id, scheduler.clone());
        if let Some(previous) = previous {
            previous.shutdown();
        }

        scheduler.start_background(core);

        // Documents already visible get a baseline pull right away.
        for uri in self.tracker.visible_snapshot() {
            if core.sync.is_open(&uri) {
                let language = core.sync.language_of(&uri);
                if scheduler.matches(&uri, language.as_deref()) {
                    scheduler.pull(core, &uri);
                }
            }
        }

        Ok(())
    }

    fn unregister(&self, id: &str) {
        let removed = self
            .schedulers
            .lock()
            .expect("scheduler table poisoned")
            .shift_remove(id);
        if let Some(scheduler) = removed {
            scheduler.shutdown();
        }
    }

    pub fn dispose(&self) {
        let mut schedulers = self.schedulers.lock().expect("scheduler table poisoned");
        for (_, scheduler) in schedulers.drain(..) {
            scheduler.shutdown();
        }
    }
}

impl std::fmt::Debug for DiagnosticState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosticState")
            .field("tracker", &self.tracker)
            .finish_non_exhaustive()
    }
}

/// The `textDocument/diagnostic` feature.
pub(crate) struct DiagnosticFeature;

impl StaticFeature for DiagnosticFeature {
    fn fill_client_capabilities(&self, capabilities: &mut lsp_types::ClientCapabilities) {
        capabilities::fills::diagnostics(capabilities);
    }

    fn initialize(&self, core: &Arc<Core>, capabilities: &ServerCapabilities) {
        let provider = match &capabilities.diagnostic_provider {
            Some(provider) => provider,
            None => return,
        };

        let value = match serde_json::to_value(provider) {
            Ok(value) => value,
            Err(e) => {
                error!("failed to serialize diagnostic capability: {}", e);
                return;
            }
        };

        let registration =
            capabilities::static_registration(core, "textDocument/diagnostic", value);
        if let Err(e) = self.register(core, registration) {
            error!("static registration for textDocument/diagnostic failed: {}", e);
        }
    }

    fn dispose(&self, core: &Arc<Core>) {
        core.diagnostics.dispose();
    }
}

impl DynamicFeature for DiagnosticFeature {
    fn registration_method(&self) -> &'static str {
        "textDocument/diagnostic"
    }

    fn register(&self, core: &Arc<Core>, registration: FeatureRegistration) -> Result<()> {
        let options: DiagnosticRegistrationOptions =
            serde_json::from_value(registration.options.clone())?;
        core.diagnostics.register(core, registration.id, options)
    }

    fn unregister(&self, core: &Arc<Core>, id: &str) {
        core.diagnostics.unregister(id);
    }
}
