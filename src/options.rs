//! Client configuration surface.

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use lsp_types::{ClientInfo, DocumentSelector, FileSystemWatcher, TraceValue, Url, WorkspaceFolder};
use serde_json::Value;

use crate::error::ErrorHandler;
use crate::middleware::Middleware;
use crate::Error;

/// Default restart budget within the three-minute restart window.
pub const DEFAULT_MAX_RESTART_COUNT: u32 = 4;

/// Predicate consulted when `initialize` fails, returning whether to retry.
pub type InitializationFailedHandler = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Predicate suppressing individual diagnostic pulls.
///
/// Returning `true` skips the pull. Only change- and save-triggered pulls are
/// filtered; open and refresh pulls always run.
pub type DiagnosticPullFilter = Arc<dyn Fn(&Url, DiagnosticPullMode) -> bool + Send + Sync>;

/// The trigger that caused a diagnostic pull.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DiagnosticPullMode {
    /// The document changed.
    OnChange,
    /// The document was saved.
    OnSave,
}

/// Controls when log traffic asks the host to reveal its output channel.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum RevealOutputChannelOn {
    /// Reveal on info, warning, and error messages.
    Info,
    /// Reveal on warning and error messages.
    Warn,
    /// Reveal on error messages only.
    #[default]
    Error,
    /// Never reveal automatically.
    Never,
}

/// Which state the client synchronizes to the server on its own.
#[derive(Clone, Debug, Default)]
pub struct SynchronizeOptions {
    /// Configuration sections reported through `workspace/didChangeConfiguration`.
    pub configuration_section: Vec<String>,
    /// Watchers installed on start and fed into `workspace/didChangeWatchedFiles`.
    pub file_events: Vec<FileSystemWatcher>,
}

/// Options for the diagnostic pull scheduler.
#[derive(Clone, Default)]
pub struct DiagnosticPullOptions {
    /// Pull on every content change.
    pub on_change: bool,
    /// Pull on save.
    pub on_save: bool,
    /// Optional per-document suppression hook.
    pub filter: Option<DiagnosticPullFilter>,
}

impl Debug for DiagnosticPullOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiagnosticPullOptions")
            .field("on_change", &self.on_change)
            .field("on_save", &self.on_save)
            .field("filter", &self.filter.as_ref().map(|_| "..."))
            .finish()
    }
}

/// Configuration for a [`LanguageClient`](crate::LanguageClient).
#[derive(Clone, Default)]
pub struct ClientOptions {
    /// Default selector applied when a server registration omits one.
    pub document_selector: Option<DocumentSelector>,
    /// Client-initiated synchronization.
    pub synchronize: SynchronizeOptions,
    /// Diagnostic pull scheduling.
    pub diagnostic_pull_options: DiagnosticPullOptions,
    /// Output channel reveal threshold for `window/logMessage` traffic.
    pub reveal_output_channel_on: RevealOutputChannelOn,
    /// Opaque value forwarded in `initialize` params.
    pub initialization_options: Option<Value>,
    /// Consulted when `initialize` fails; `true` retries the handshake.
    pub initialization_failed_handler: Option<InitializationFailedHandler>,
    /// Connection fault and close policy. Defaults to
    /// [`DefaultErrorHandler`](crate::DefaultErrorHandler) with
    /// [`max_restart_count`](Self::max_restart_count).
    pub error_handler: Option<Arc<dyn ErrorHandler>>,
    /// Interception hooks around outbound traffic.
    pub middleware: Middleware,
    /// Restart budget used by the default error handler.
    pub max_restart_count: Option<u32>,
    /// Rendering hint forwarded to hover/completion consumers on the host.
    pub markdown_is_trusted: bool,
    /// Whether server-created progress parts are surfaced during `initialize`.
    pub progress_on_initialization: bool,
    /// Name and version reported in `initialize` params.
    pub client_info: Option<ClientInfo>,
    /// Workspace folders reported in `initialize` params.
    pub workspace_folders: Option<Vec<WorkspaceFolder>>,
    /// Initial trace value, sent via `$/setTrace` after the handshake.
    pub trace: Option<TraceValue>,
}

impl ClientOptions {
    pub(crate) fn max_restart_count(&self) -> u32 {
        self.max_restart_count.unwrap_or(DEFAULT_MAX_RESTART_COUNT)
    }
}

impl Debug for ClientOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("document_selector", &self.document_selector)
            .field("synchronize", &self.synchronize)
            .field("diagnostic_pull_options", &self.diagnostic_pull_options)
            .field("reveal_output_channel_on", &self.reveal_output_channel_on)
            .field("initialization_options", &self.initialization_options)
            .field("max_restart_count", &self.max_restart_count)
            .field("markdown_is_trusted", &self.markdown_is_trusted)
            .field("progress_on_initialization", &self.progress_on_initialization)
            .field("client_info", &self.client_info)
            .field("workspace_folders", &self.workspace_folders)
            .field("trace", &self.trace)
            .finish_non_exhaustive()
    }
}

impl RevealOutputChannelOn {
    /// Returns `true` if a message of the given type crosses the threshold.
    pub(crate) fn should_reveal(&self, typ: lsp_types::MessageType) -> bool {
        use lsp_types::MessageType;

        let threshold = match self {
            RevealOutputChannelOn::Info => 3,
            RevealOutputChannelOn::Warn => 2,
            RevealOutputChannelOn::Error => 1,
            RevealOutputChannelOn::Never => return false,
        };

        let severity = if typ == MessageType::ERROR {
            1
        } else if typ == MessageType::WARNING {
            2
        } else if typ == MessageType::INFO {
            3
        } else if typ == MessageType::LOG {
            4
        } else {
            return false;
        };

        severity <= threshold
    }
}

#[cfg(test)]
mod tests {
    use lsp_types::MessageType;

    use super::*;

    #[test]
    fn reveal_threshold_ordering() {
        assert!(RevealOutputChannelOn::Error.should_reveal(MessageType::ERROR));
        assert!(!RevealOutputChannelOn::Error.should_reveal(MessageType::WARNING));
        assert!(RevealOutputChannelOn::Info.should_reveal(MessageType::WARNING));
        assert!(!RevealOutputChannelOn::Info.should_reveal(MessageType::LOG));
        assert!(!RevealOutputChannelOn::Never.should_reveal(MessageType::ERROR));
    }

    #[test]
    fn default_restart_budget() {
        assert_eq!(ClientOptions::default().max_restart_count(), 4);
    }
}
