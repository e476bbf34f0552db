//! The editor-side surface the runtime calls back into.

use async_trait::async_trait;
use auto_impl::auto_impl;
use lsp_types::{
    ApplyWorkspaceEditParams, ApplyWorkspaceEditResponse, ConfigurationItem, Diagnostic,
    FileSystemWatcher, MessageActionItem, MessageType, ProgressToken, ShowDocumentParams,
    ShowMessageRequestParams, TextDocumentItem, Url, WorkDoneProgress, WorkspaceFolder,
};
use serde_json::Value;

/// A server-initiated request asking the host to recompute derived state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RefreshKind {
    /// `workspace/codeLens/refresh`
    CodeLens,
    /// `workspace/semanticTokens/refresh`
    SemanticTokens,
    /// `workspace/inlayHint/refresh`
    InlayHint,
    /// `workspace/inlineValue/refresh`
    InlineValue,
}

/// Everything the client runtime needs from the embedding editor.
///
/// All methods have conservative defaults so a host only implements the
/// surfaces it actually provides. Methods are invoked from the runtime's
/// task context and must not block.
#[async_trait]
#[auto_impl(Arc)]
pub trait Host: Send + Sync + 'static {
    /// Documents currently open in the editor.
    ///
    /// Queried when a `didOpen` registration arrives so that already-open
    /// matching documents can be replayed to the server.
    fn open_documents(&self) -> Vec<TextDocumentItem> {
        Vec::new()
    }

    /// Applies a workspace edit requested by the server.
    async fn apply_edit(&self, params: ApplyWorkspaceEditParams) -> ApplyWorkspaceEditResponse {
        let _ = params;
        ApplyWorkspaceEditResponse {
            applied: false,
            failure_reason: Some("host does not support workspace edits".into()),
            failed_change: None,
        }
    }

    /// Resolves configuration values for `workspace/configuration`.
    ///
    /// The returned vector must be index-aligned with `items`; unknown
    /// sections resolve to `null`.
    async fn configuration(&self, items: Vec<ConfigurationItem>) -> Vec<Value> {
        items.iter().map(|_| Value::Null).collect()
    }

    /// Presents a message with actions and waits for the user's choice.
    async fn show_message_request(
        &self,
        params: ShowMessageRequestParams,
    ) -> Option<MessageActionItem> {
        let _ = params;
        None
    }

    /// Shows a resource in the user interface.
    ///
    /// Returns `true` if the document was successfully shown.
    async fn show_document(&self, params: ShowDocumentParams) -> bool {
        let _ = params;
        false
    }

    /// The workspace folders currently open in the editor.
    fn workspace_folders(&self) -> Option<Vec<WorkspaceFolder>> {
        None
    }

    /// Displays a message in the user interface.
    fn show_message(&self, typ: MessageType, message: String) {
        let _ = (typ, message);
    }

    /// Appends a message to the log output.
    fn log_message(&self, typ: MessageType, message: String) {
        let _ = (typ, message);
    }

    /// Asks the host to reveal its log output, per the configured
    /// [`RevealOutputChannelOn`](crate::RevealOutputChannelOn) threshold.
    fn reveal_output_channel(&self) {}

    /// Forwards a `telemetry/event` payload.
    fn telemetry(&self, data: Value) {
        let _ = data;
    }

    /// Reports the current diagnostics for a document.
    ///
    /// Called both for server-published diagnostics and for updates to the
    /// pull-diagnostic collection. An empty slice clears the document.
    fn diagnostics_changed(&self, uri: &Url, version: Option<i32>, diagnostics: &[Diagnostic]) {
        let _ = (uri, version, diagnostics);
    }

    /// Reports work-done progress for a server-created token.
    fn work_done_progress(&self, token: &ProgressToken, progress: &WorkDoneProgress) {
        let _ = (token, progress);
    }

    /// Recomputes host state in response to a server refresh request.
    fn refresh(&self, kind: RefreshKind) {
        let _ = kind;
    }

    /// Installs file watchers for a `workspace/didChangeWatchedFiles`
    /// registration. Observed events are reported back through
    /// [`LanguageClient::notify_file_event`](crate::LanguageClient::notify_file_event).
    fn watch_files(&self, id: &str, watchers: Vec<FileSystemWatcher>) {
        let _ = (id, watchers);
    }

    /// Removes the watchers previously installed under `id`.
    fn unwatch_files(&self, id: &str) {
        let _ = id;
    }
}
