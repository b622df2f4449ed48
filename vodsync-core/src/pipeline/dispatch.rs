use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::shutdown::ShutdownSignal;
use crate::watcher::{EventFilter, WatchEvent};

use super::{Orchestrator, PipelineOutcome, PipelineResult};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub received: usize,
    pub filtered: usize,
    pub duplicates: usize,
    pub succeeded: usize,
    pub queued: usize,
    pub restored: usize,
    pub dry_run: usize,
    pub failed: usize,
}

impl DispatchReport {
    fn record(&mut self, result: PipelineResult<PipelineOutcome>) {
        match result {
            Ok(PipelineOutcome::Succeeded { .. }) => self.succeeded += 1,
            Ok(PipelineOutcome::Queued { .. }) => self.queued += 1,
            Ok(PipelineOutcome::Restored { .. }) => self.restored += 1,
            Ok(PipelineOutcome::DryRun { .. }) => self.dry_run += 1,
            Ok(PipelineOutcome::Duplicate) => self.duplicates += 1,
            Err(_) => self.failed += 1,
        }
    }
}

/// Consumes watch events until shutdown or until the channel closes, running
/// one pipeline task per admitted file. In-flight pipelines are awaited
/// before returning.
pub async fn run_dispatch(
    orchestrator: Orchestrator,
    filter: EventFilter,
    mut events: mpsc::UnboundedReceiver<WatchEvent>,
    shutdown: ShutdownSignal,
) -> DispatchReport {
    let mut report = DispatchReport::default();
    let mut tasks: JoinSet<PipelineResult<PipelineOutcome>> = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = shutdown.wait() => {
                info!(in_flight = tasks.len(), "shutdown requested, no longer admitting files");
                break;
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                match joined {
                    Ok(result) => report.record(result),
                    Err(err) => {
                        error!(error = %err, "pipeline task panicked");
                        report.failed += 1;
                    }
                }
            }
            event = events.recv() => {
                let Some(event) = event else {
                    debug!("event source closed");
                    break;
                };
                report.received += 1;
                let path = event.path().to_path_buf();
                if orchestrator.take_restored(&path) {
                    debug!(path = %path.display(), "skipping event for restored file");
                    report.filtered += 1;
                    continue;
                }
                if !filter.admits(&path) {
                    report.filtered += 1;
                    continue;
                }
                let Some(guard) = orchestrator.admit(&path) else {
                    debug!(path = %path.display(), "pipeline already active for path, dropping event");
                    report.duplicates += 1;
                    continue;
                };
                info!(path = %path.display(), event = ?event, "admitted recording");
                let orchestrator = orchestrator.clone();
                tasks.spawn(async move { orchestrator.process_admitted(guard).await });
            }
        }
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(result) => report.record(result),
            Err(err) => {
                error!(error = %err, "pipeline task panicked");
                report.failed += 1;
            }
        }
    }
    info!(
        received = report.received,
        succeeded = report.succeeded,
        queued = report.queued,
        restored = report.restored,
        failed = report.failed,
        "dispatch loop stopped"
    );
    report
}
