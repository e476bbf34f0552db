//! The long-running workspace diagnostic pull.

use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc;
use futures::StreamExt;
use lsp_types::request::{Request as _, WorkspaceDiagnosticRequest};
use lsp_types::{
    PreviousResultId, WorkspaceDiagnosticParams, WorkspaceDiagnosticReportPartialResult,
    WorkspaceDiagnosticReportResult, WorkspaceDocumentDiagnosticReport,
};
use tracing::{debug, warn};

use crate::client::Core;
use crate::{Error, Result};

use super::DiagnosticScheduler;

/// Pause between the end of one workspace pull and the start of the next.
pub(crate) const WORKSPACE_PULL_DELAY: Duration = Duration::from_secs(2);

/// Failures tolerated before the workspace loop gives up.
pub(crate) const WORKSPACE_ERROR_BUDGET: u32 = 5;

/// Runs workspace pulls until the scheduler shuts down or the error budget
/// is exhausted. The loop reschedules itself a fixed delay after each
/// completed pull rather than on a fixed cadence, so slow servers are never
/// asked to overlap computations.
pub(super) async fn workspace_loop(scheduler: Arc<DiagnosticScheduler>, core: Arc<Core>) {
    let mut failures = 0u32;

    loop {
        if scheduler.is_shutdown() {
            return;
        }

        match workspace_pull(&scheduler, &core).await {
            Ok(()) => failures = 0,
            Err(Error::Cancelled) | Err(Error::ConnectionClosed) | Err(Error::NotRunning) => {
                return;
            }
            Err(e) => {
                failures += 1;
                warn!("workspace diagnostic pull failed ({failures}): {e}");
                if failures >= WORKSPACE_ERROR_BUDGET {
                    warn!("workspace diagnostics stopped after {failures} consecutive failures");
                    return;
                }
            }
        }

        let shutdown = scheduler.shutdown_child_token();
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(WORKSPACE_PULL_DELAY) => {}
        }
    }
}

async fn workspace_pull(scheduler: &Arc<DiagnosticScheduler>, core: &Arc<Core>) -> Result<()> {
    let previous_result_ids = scheduler
        .previous_result_ids()
        .into_iter()
        .map(|(uri, value)| PreviousResultId { uri, value })
        .collect();

    let partial_token = core.next_progress_token();
    let params = WorkspaceDiagnosticParams {
        identifier: scheduler.identifier(),
        previous_result_ids,
        work_done_progress_params: Default::default(),
        partial_result_params: lsp_types::PartialResultParams {
            partial_result_token: Some(partial_token.clone().into()),
        },
    };

    let connection = core.connection()?;
    let (partials_tx, mut partials) = mpsc::unbounded::<WorkspaceDiagnosticReportPartialResult>();
    connection.on_progress(
        partial_token.clone(),
        Arc::new(move |value| match serde_json::from_value(value) {
            Ok(partial) => {
                let _ = partials_tx.unbounded_send(partial);
            }
            Err(e) => debug!("malformed workspace diagnostic partial result: {}", e),
        }),
    );

    let token = scheduler.shutdown_child_token();
    let request = core.invoke_request(
        WorkspaceDiagnosticRequest::METHOD,
        serde_json::to_value(params)?,
        &token,
    );
    tokio::pin!(request);

    let result = loop {
        tokio::select! {
            biased;
            Some(partial) = partials.next() => {
                apply_items(scheduler, core, partial.items);
            }
            result = &mut request => break result,
        }
    };

    connection.remove_progress(&partial_token);

    // Drain whatever partial results raced with the final response.
    while let Ok(Some(partial)) = partials.try_next() {
        apply_items(scheduler, core, partial.items);
    }

    let report: WorkspaceDiagnosticReportResult = serde_json::from_value(result?)?;
    match report {
        WorkspaceDiagnosticReportResult::Report(report) => {
            apply_items(scheduler, core, report.items)
        }
        WorkspaceDiagnosticReportResult::Partial(partial) => {
            apply_items(scheduler, core, partial.items)
        }
    }

    Ok(())
}

/// Writes workspace report items, skipping URIs the document pull owns.
fn apply_items(
    scheduler: &Arc<DiagnosticScheduler>,
    core: &Arc<Core>,
    items: Vec<WorkspaceDocumentDiagnosticReport>,
) {
    for item in items {
        match item {
            WorkspaceDocumentDiagnosticReport::Full(full) => {
                if scheduler.is_document_pulled(&full.uri) {
                    continue;
                }
                let uri = full.uri;
                let version = full.version.map(|v| v as i32);
                scheduler.record_workspace_full(
                    core,
                    &uri,
                    version,
                    full.full_document_diagnostic_report,
                );
            }
            WorkspaceDocumentDiagnosticReport::Unchanged(unchanged) => {
                if scheduler.is_document_pulled(&unchanged.uri) {
                    continue;
                }
                scheduler.record_workspace_unchanged(
                    &unchanged.uri,
                    unchanged.unchanged_document_diagnostic_report.result_id,
                );
            }
        }
    }
}
