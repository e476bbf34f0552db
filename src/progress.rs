//! Work-done progress parts.
//!
//! A part is created per `window/workDoneProgress/create` token and lives
//! until its `end` report. Percentages are clamped into `0..=100` and never
//! regress, matching what progress UIs expect from a well-behaved server.

use std::sync::Arc;

use dashmap::DashMap;
use lsp_types::notification::{Notification, WorkDoneProgressCancel};
use lsp_types::{ProgressToken, WorkDoneProgress, WorkDoneProgressCancelParams};
use serde_json::Value;
use tracing::debug;

use crate::client::Core;
use crate::jsonrpc::Id;
use crate::Result;

#[derive(Debug, Default)]
struct ProgressPart {
    percentage: Option<u32>,
}

/// The set of live progress parts, keyed by token.
#[derive(Debug, Default)]
pub(crate) struct ProgressState {
    parts: DashMap<Id, ProgressPart>,
}

impl ProgressState {
    pub fn new() -> Self {
        ProgressState::default()
    }

    /// Serves `window/workDoneProgress/create`.
    ///
    /// During `Starting`, parts are only accepted when
    /// `progress_on_initialization` is set; the request still succeeds so the
    /// server can proceed, but its progress reports are dropped.
    pub fn create(&self, core: &Arc<Core>, token: ProgressToken) -> Result<()> {
        if !core.is_running() && !core.options.progress_on_initialization {
            return Ok(());
        }

        let id = Id::from(token);
        self.parts.insert(id.clone(), ProgressPart::default());

        let connection = core.connection()?;
        let weak = Arc::downgrade(core);
        let route_id = id.clone();
        connection.on_progress(
            id,
            Arc::new(move |value| {
                if let Some(core) = weak.upgrade() {
                    core.progress.update(&core, &route_id, value);
                }
            }),
        );
        Ok(())
    }

    fn update(&self, core: &Arc<Core>, id: &Id, value: Value) {
        let mut progress: WorkDoneProgress = match serde_json::from_value(value) {
            Ok(progress) => progress,
            Err(e) => {
                debug!("malformed work-done progress for {}: {}", id, e);
                return;
            }
        };

        match &mut progress {
            WorkDoneProgress::Begin(begin) => {
                begin.percentage = self.clamp(id, begin.percentage);
            }
            WorkDoneProgress::Report(report) => {
                report.percentage = self.clamp(id, report.percentage);
            }
            WorkDoneProgress::End(_) => {}
        }

        let token = ProgressToken::from(id.clone());
        core.host.work_done_progress(&token, &progress);

        if matches!(progress, WorkDoneProgress::End(_)) {
            self.parts.remove(id);
            if let Ok(connection) = core.connection() {
                connection.remove_progress(id);
            }
        }
    }

    /// Clamps a reported percentage into `0..=100`, monotonically rising.
    fn clamp(&self, id: &Id, reported: Option<u32>) -> Option<u32> {
        let reported = reported?;
        let mut part = self.parts.entry(id.clone()).or_default();

        let bounded = reported.min(100);
        let next = match part.percentage {
            Some(current) => current.max(bounded),
            None => bounded,
        };
        part.percentage = Some(next);
        Some(next)
    }

    /// Host-initiated cancellation of a progress part.
    pub fn cancel(&self, core: &Arc<Core>, token: ProgressToken) -> Result<()> {
        let id = Id::from(token.clone());
        self.parts.remove(&id);
        if let Ok(connection) = core.connection() {
            connection.remove_progress(&id);
        }

        let params = WorkDoneProgressCancelParams { token };
        core.connection()?
            .send_notification_raw(WorkDoneProgressCancel::METHOD, serde_json::to_value(params)?)
    }

    pub fn dispose(&self) {
        self.parts.clear();
    }
}
