mod dispatch;
mod error;
mod types;

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::fs;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::{RelocationMode, UploaderConfig};
use crate::delivery::{DeliveryEngine, DeliveryFailure, DeliveryMetadata};
use crate::fsutil;
use crate::naming::{display_title, NameResolver, ResolvedName};
use crate::pending::{complete_delivery, remove_if_present, PendingDelivery, PendingQueue};
use crate::stability::StabilityDetector;
use crate::transform::Transcoder;

pub use dispatch::{run_dispatch, DispatchReport};
pub use error::{PipelineError, PipelineResult};
pub use types::{PipelineOutcome, PipelineRecord, Stage};

const MAX_NAME_ATTEMPTS: u32 = 1_000;
const RESTORE_ECHO_WINDOW: Duration = Duration::from_secs(5);

/// Values the orchestrator reads from the configuration once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub backup_suffix: String,
    pub relocation_dir: Option<PathBuf>,
    pub relocation_mode: RelocationMode,
    pub title_prefix: String,
    pub metadata: DeliveryMetadata,
    pub dry_run: bool,
}

impl From<&UploaderConfig> for PipelineSettings {
    fn from(config: &UploaderConfig) -> Self {
        Self {
            backup_suffix: config.watch.backup_suffix.clone(),
            relocation_dir: config.relocation.directory.clone(),
            relocation_mode: config.relocation.mode,
            title_prefix: config.naming.title_prefix.clone(),
            metadata: DeliveryMetadata::from(&config.delivery),
            dry_run: config.delivery.dry_run,
        }
    }
}

/// Components one pipeline run drives.
pub struct PipelineComponents {
    pub detector: StabilityDetector,
    pub resolver: NameResolver,
    pub transcoder: Transcoder,
    pub delivery: DeliveryEngine,
    pub pending: Arc<PendingQueue>,
}

struct Inner {
    settings: PipelineSettings,
    detector: StabilityDetector,
    resolver: NameResolver,
    transcoder: Transcoder,
    delivery: DeliveryEngine,
    pending: Arc<PendingQueue>,
    in_flight: Mutex<HashSet<PathBuf>>,
    restored: RestoreMarkers,
}

impl Inner {
    fn in_flight(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        lock(&self.in_flight)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Paths put back by a restore, each swallowing at most one event that
/// arrives within `window` of the restore.
#[derive(Debug)]
pub struct RestoreMarkers {
    window: Duration,
    marks: Mutex<HashMap<PathBuf, Instant>>,
}

impl RestoreMarkers {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            marks: Mutex::new(HashMap::new()),
        }
    }

    pub fn mark(&self, path: &Path) {
        let now = Instant::now();
        let mut marks = lock(&self.marks);
        marks.retain(|_, marked| now.duration_since(*marked) <= self.window);
        marks.insert(path.to_path_buf(), now);
    }

    /// Removes the marker for `path`, returning `true` if it was still
    /// inside the window.
    pub fn take(&self, path: &Path) -> bool {
        match lock(&self.marks).remove(path) {
            Some(marked) => marked.elapsed() <= self.window,
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.marks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Claim on a source path. The path is released when the guard drops.
pub struct InFlightGuard {
    inner: Arc<Inner>,
    path: PathBuf,
}

impl InFlightGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight().remove(&self.path);
    }
}

/// Drives files through stability, rename, transform and delivery.
///
/// Cheap to clone; clones share the in-flight set.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(settings: PipelineSettings, components: PipelineComponents) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                detector: components.detector,
                resolver: components.resolver,
                transcoder: components.transcoder,
                delivery: components.delivery,
                pending: components.pending,
                in_flight: Mutex::new(HashSet::new()),
                restored: RestoreMarkers::new(RESTORE_ECHO_WINDOW),
            }),
        }
    }

    pub fn delivery(&self) -> &DeliveryEngine {
        &self.inner.delivery
    }

    pub fn pending(&self) -> &Arc<PendingQueue> {
        &self.inner.pending
    }

    pub fn is_in_flight(&self, path: &Path) -> bool {
        self.inner.in_flight().contains(path)
    }

    /// Consumes the marker left by a restore, so the event produced by
    /// moving the backup back is not treated as a new recording.
    pub fn take_restored(&self, path: &Path) -> bool {
        self.inner.restored.take(path)
    }

    /// Claims `path`, or returns `None` when another pipeline holds it.
    pub fn admit(&self, path: &Path) -> Option<InFlightGuard> {
        if !self.inner.in_flight().insert(path.to_path_buf()) {
            return None;
        }
        Some(InFlightGuard {
            inner: Arc::clone(&self.inner),
            path: path.to_path_buf(),
        })
    }

    pub async fn process(&self, path: &Path) -> PipelineResult<PipelineOutcome> {
        match self.admit(path) {
            Some(guard) => self.process_admitted(guard).await,
            None => {
                info!(path = %path.display(), "pipeline already active for path, dropping event");
                Ok(PipelineOutcome::Duplicate)
            }
        }
    }

    pub async fn process_admitted(&self, guard: InFlightGuard) -> PipelineResult<PipelineOutcome> {
        let mut record = PipelineRecord::new(guard.path());
        let result = self.run(&mut record).await;
        match &result {
            Ok(outcome) => info!(path = %record.original_path.display(), stage = %record.stage, outcome = ?outcome, "pipeline finished"),
            Err(err) => error!(path = %record.original_path.display(), stage = %record.stage, error = %err, "pipeline failed"),
        }
        drop(guard);
        result
    }

    async fn run(&self, record: &mut PipelineRecord) -> PipelineResult<PipelineOutcome> {
        let inner = &self.inner;
        record.advance(Stage::Stabilizing);
        inner
            .detector
            .wait_until_stable(&record.original_path)
            .await?;
        record.advance(Stage::Stable);

        let (resolved, renamed) = self.resolve_free_name(&record.original_path).await?;
        self.backup_and_rename(record, &renamed).await?;
        record.advance(Stage::Renamed);

        if inner.settings.dry_run {
            info!(path = %renamed.display(), "dry run, skipping transform and delivery");
            self.discard_backup(record).await;
            return Ok(PipelineOutcome::DryRun { renamed });
        }

        let title = display_title(&resolved.file_name(), &inner.settings.title_prefix);

        record.advance(Stage::Transforming);
        let transformed = inner.transcoder.transform(&renamed).await;
        if transformed.transformed {
            record.transformed_path = Some(transformed.path.clone());
        }

        record.advance(Stage::Delivering);
        let pending = PendingDelivery {
            artifact_path: transformed.path.clone(),
            original_path: renamed.clone(),
            cleanup_path: record.transformed_path.clone(),
            relocation_target: self.relocation_target(&renamed),
            relocation_mode: inner.settings.relocation_mode,
            title,
            metadata: inner.settings.metadata.clone(),
            enqueued_at: None,
            last_error: None,
        };
        match inner
            .delivery
            .deliver(&pending.artifact_path, &pending.title, &pending.metadata)
            .await
        {
            Ok(receipt) => {
                complete_delivery(&pending).await;
                self.discard_backup(record).await;
                record.advance(Stage::Succeeded);
                Ok(PipelineOutcome::Succeeded {
                    renamed,
                    remote_id: receipt.remote_id,
                })
            }
            Err(failure) if failure.is_queueable() => {
                self.queue_or_restore(record, pending, failure).await
            }
            Err(failure) => {
                error!(
                    path = %record.original_path.display(),
                    attempts = failure.attempts(),
                    error = %failure,
                    "fatal delivery failure, restoring original"
                );
                self.restore(record, failure.to_string()).await
            }
        }
    }

    async fn queue_or_restore(
        &self,
        record: &mut PipelineRecord,
        mut pending: PendingDelivery,
        failure: DeliveryFailure,
    ) -> PipelineResult<PipelineOutcome> {
        pending.enqueued_at = Some(Utc::now());
        pending.last_error = Some(failure.to_string());
        let renamed = pending.original_path.clone();
        match self.inner.pending.enqueue(pending).await {
            Ok(()) => {
                warn!(
                    path = %renamed.display(),
                    attempts = failure.attempts(),
                    error = %failure,
                    "delivery deferred to pending queue"
                );
                // Recovery now belongs to the queue.
                self.discard_backup(record).await;
                record.advance(Stage::Queued);
                Ok(PipelineOutcome::Queued { renamed })
            }
            Err(err) => {
                error!(path = %renamed.display(), error = %err, "failed to enqueue pending delivery, restoring original");
                self.restore(record, format!("{failure}; enqueue failed: {err}"))
                    .await
            }
        }
    }

    /// Takes the next sequence until the resolved name is free in the
    /// source directory.
    async fn resolve_free_name(&self, source: &Path) -> PipelineResult<(ResolvedName, PathBuf)> {
        let directory = source.parent().unwrap_or_else(|| Path::new("."));
        for _ in 0..MAX_NAME_ATTEMPTS {
            let resolved = self.inner.resolver.resolve_name(source).await;
            let target = directory.join(resolved.file_name());
            if !fsutil::exists(&target).await {
                return Ok((resolved, target));
            }
            warn!(target = %target.display(), "resolved name already exists, taking next sequence");
        }
        Err(PipelineError::NameExhausted {
            path: source.to_path_buf(),
            attempts: MAX_NAME_ATTEMPTS,
        })
    }

    async fn backup_and_rename(
        &self,
        record: &mut PipelineRecord,
        renamed: &Path,
    ) -> PipelineResult<()> {
        let original = record.original_path.clone();
        let backup = backup_path_for(&original, &self.inner.settings.backup_suffix);
        if let Err(source) = fs::copy(&original, &backup).await {
            remove_if_present(&backup).await;
            return Err(PipelineError::Backup {
                source,
                path: original,
            });
        }
        record.backup_path = Some(backup.clone());
        if let Err(source) = fs::rename(&original, renamed).await {
            remove_if_present(&backup).await;
            record.backup_path = None;
            return Err(PipelineError::Rename {
                source,
                from: original,
                to: renamed.to_path_buf(),
            });
        }
        record.renamed_path = Some(renamed.to_path_buf());
        info!(from = %original.display(), to = %renamed.display(), backup = %backup.display(), "renamed artifact");
        Ok(())
    }

    async fn discard_backup(&self, record: &mut PipelineRecord) {
        if let Some(backup) = record.backup_path.take() {
            remove_if_present(&backup).await;
        }
    }

    /// Puts the backup back at the original path and discards every
    /// derived file.
    async fn restore(
        &self,
        record: &mut PipelineRecord,
        reason: String,
    ) -> PipelineResult<PipelineOutcome> {
        if let Some(transformed) = record.transformed_path.take() {
            remove_if_present(&transformed).await;
        }
        let original = record.original_path.clone();
        if let Some(backup) = record.backup_path.clone() {
            match fsutil::move_file(&backup, &original).await {
                Ok(()) => {
                    record.backup_path = None;
                    self.inner.restored.mark(&original);
                }
                Err(source) => {
                    return Err(PipelineError::Restore {
                        source,
                        original,
                        backup,
                    })
                }
            }
            if let Some(renamed) = record.renamed_path.take() {
                match fs::remove_file(&renamed).await {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => {
                        warn!(path = %renamed.display(), error = %err, "failed to remove renamed artifact after restore")
                    }
                }
            }
        }
        record.advance(Stage::Restored);
        Ok(PipelineOutcome::Restored { original, reason })
    }

    fn relocation_target(&self, renamed: &Path) -> Option<PathBuf> {
        let directory = self.inner.settings.relocation_dir.as_ref()?;
        let file_name = renamed.file_name()?;
        Some(directory.join(file_name))
    }
}

pub fn backup_path_for(original: &Path, suffix: &str) -> PathBuf {
    let mut name = original
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    original.with_file_name(name)
}
