use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::RelocationMode;
use crate::delivery::{DeliveryMetadata, DeliveryReceipt, DeliveryResult};
use crate::fsutil::{self, write_atomic};
use crate::shutdown::ShutdownSignal;

#[derive(Debug, Error)]
pub enum PendingError {
    #[error("failed to read pending queue {path}: {source}")]
    Read { source: io::Error, path: PathBuf },
    #[error("failed to persist pending queue {path}: {source}")]
    Persist { source: io::Error, path: PathBuf },
    #[error("failed to encode pending queue: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type PendingResult<T> = Result<T, PendingError>;

/// A delivery that ran out of attempts and must be retried on a later run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingDelivery {
    /// File handed to the remote host, possibly a transcoded copy.
    pub artifact_path: PathBuf,
    /// Renamed recording in the watch directory.
    pub original_path: PathBuf,
    /// Removed after a successful delivery.
    #[serde(default)]
    pub cleanup_path: Option<PathBuf>,
    /// Destination file the original is relocated to after success.
    #[serde(default)]
    pub relocation_target: Option<PathBuf>,
    #[serde(default)]
    pub relocation_mode: RelocationMode,
    pub title: String,
    pub metadata: DeliveryMetadata,
    #[serde(default)]
    pub enqueued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainOptions {
    /// Upper bound on delivery attempts in one pass.
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub loaded: usize,
    pub attempted: usize,
    pub delivered: usize,
    /// Records whose artifact no longer exists.
    pub dropped: usize,
    pub retained: usize,
}

/// Durable list of pending deliveries, stored as one JSON array.
///
/// Every mutation rewrites the document through [`write_atomic`] while the
/// queue lock is held.
#[derive(Debug)]
pub struct PendingQueue {
    path: PathBuf,
    lock: Mutex<()>,
}

impl PendingQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn enqueue(&self, record: PendingDelivery) -> PendingResult<()> {
        let _guard = self.lock.lock().await;
        let mut records = self.read_records().await?;
        info!(
            artifact = %record.artifact_path.display(),
            queued = records.len() + 1,
            "enqueued pending delivery"
        );
        records.push(record);
        self.persist(&records).await
    }

    /// Absent or unreadable documents load as empty. Malformed entries are
    /// skipped.
    pub async fn load(&self) -> PendingResult<Vec<PendingDelivery>> {
        let _guard = self.lock.lock().await;
        self.read_records().await
    }

    pub async fn clear(&self) -> PendingResult<usize> {
        let _guard = self.lock.lock().await;
        let removed = self.read_records().await?.len();
        self.persist(&[]).await?;
        info!(path = %self.path.display(), removed, "cleared pending queue");
        Ok(removed)
    }

    /// Retries every queued delivery once.
    ///
    /// Delivered and unrecoverable records are removed from the document
    /// after the pass; records enqueued while the pass ran are kept.
    pub async fn drain<F, Fut>(
        &self,
        mut deliver: F,
        options: DrainOptions,
        shutdown: &ShutdownSignal,
    ) -> PendingResult<DrainReport>
    where
        F: FnMut(PendingDelivery) -> Fut,
        Fut: Future<Output = DeliveryResult<DeliveryReceipt>>,
    {
        let records = self.load().await?;
        let mut report = DrainReport {
            loaded: records.len(),
            ..DrainReport::default()
        };
        let mut finished: Vec<PendingDelivery> = Vec::new();

        for record in records {
            if shutdown.is_triggered() {
                info!("shutdown requested, leaving remaining pending deliveries queued");
                break;
            }
            if !fsutil::exists(&record.artifact_path).await {
                warn!(
                    artifact = %record.artifact_path.display(),
                    "pending artifact no longer exists, dropping record"
                );
                report.dropped += 1;
                finished.push(record);
                continue;
            }
            if options.limit.is_some_and(|limit| report.attempted >= limit) {
                info!(limit = ?options.limit, "drain limit reached");
                break;
            }
            report.attempted += 1;
            match deliver(record.clone()).await {
                Ok(receipt) => {
                    info!(
                        artifact = %record.artifact_path.display(),
                        remote_id = %receipt.remote_id,
                        attempts = receipt.attempts,
                        "pending delivery succeeded"
                    );
                    complete_delivery(&record).await;
                    report.delivered += 1;
                    finished.push(record);
                }
                Err(err) => {
                    warn!(
                        artifact = %record.artifact_path.display(),
                        attempts = err.attempts(),
                        error = %err,
                        "pending delivery failed, keeping record"
                    );
                }
            }
        }

        let _guard = self.lock.lock().await;
        let mut remaining = self.read_records().await?;
        for done in &finished {
            if let Some(index) = remaining.iter().position(|record| record == done) {
                remaining.remove(index);
            }
        }
        report.retained = remaining.len();
        self.persist(&remaining).await?;
        info!(
            loaded = report.loaded,
            delivered = report.delivered,
            dropped = report.dropped,
            retained = report.retained,
            "pending queue drained"
        );
        Ok(report)
    }

    async fn read_records(&self) -> PendingResult<Vec<PendingDelivery>> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(PendingError::Read {
                    source,
                    path: self.path.clone(),
                })
            }
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        let entries: Vec<serde_json::Value> = match serde_json::from_str(&content) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "pending queue is not a JSON array, treating as empty");
                return Ok(Vec::new());
            }
        };
        let mut records = Vec::with_capacity(entries.len());
        for (index, entry) in entries.into_iter().enumerate() {
            match serde_json::from_value::<PendingDelivery>(entry) {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!(path = %self.path.display(), index, error = %err, "skipping malformed pending record")
                }
            }
        }
        Ok(records)
    }

    async fn persist(&self, records: &[PendingDelivery]) -> PendingResult<()> {
        let encoded = serde_json::to_string_pretty(records)?;
        write_atomic(&self.path, encoded.as_bytes())
            .await
            .map_err(|source| PendingError::Persist {
                source,
                path: self.path.clone(),
            })
    }
}

/// Post-success cleanup shared by the pipeline and the drain pass.
pub async fn complete_delivery(record: &PendingDelivery) {
    if let Some(cleanup) = &record.cleanup_path {
        remove_if_present(cleanup).await;
    }
    if let Some(target) = &record.relocation_target {
        relocate(&record.original_path, target, record.relocation_mode).await;
    }
}

pub(crate) async fn remove_if_present(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => info!(path = %path.display(), "removed temporary artifact"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to remove temporary artifact"),
    }
}

async fn relocate(from: &Path, to: &Path, mode: RelocationMode) {
    if let Some(parent) = to.parent() {
        if let Err(err) = fs::create_dir_all(parent).await {
            error!(target_dir = %parent.display(), error = %err, "failed to create relocation directory");
            return;
        }
    }
    let result = match mode {
        RelocationMode::Move => fsutil::move_file(from, to).await,
        RelocationMode::Copy => fs::copy(from, to).await.map(|_| ()),
    };
    match result {
        Ok(()) => info!(from = %from.display(), to = %to.display(), mode = ?mode, "relocated artifact"),
        Err(err) => error!(from = %from.display(), to = %to.display(), error = %err, "failed to relocate artifact"),
    }
}
