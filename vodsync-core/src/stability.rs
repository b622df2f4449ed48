use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

use crate::config::StabilitySection;
use crate::shutdown::ShutdownSignal;

#[derive(Debug, Error)]
pub enum StabilityError {
    #[error("file {path} vanished while waiting for it to stabilize")]
    FileVanished { path: PathBuf },
    #[error("failed to inspect {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("shutdown requested while waiting for {path}")]
    Interrupted { path: PathBuf },
}

pub type StabilityResult<T> = Result<T, StabilityError>;

/// One observation of a candidate file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSample {
    pub size: u64,
    pub modified: SystemTime,
    /// Time elapsed since `modified` when the sample was taken.
    pub age: Duration,
}

impl FileSample {
    fn matches(&self, other: &FileSample) -> bool {
        self.size == other.size && self.modified == other.modified
    }
}

#[async_trait]
pub trait FileProbe: Send + Sync {
    /// Returns `Ok(None)` when the path does not exist.
    async fn sample(&self, path: &Path) -> io::Result<Option<FileSample>>;
}

#[derive(Debug, Default)]
pub struct FsProbe;

#[async_trait]
impl FileProbe for FsProbe {
    async fn sample(&self, path: &Path) -> io::Result<Option<FileSample>> {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        let modified = metadata.modified()?;
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or_default();
        Ok(Some(FileSample {
            size: metadata.len(),
            modified,
            age,
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StabilityPolicy {
    pub checks_required: u32,
    pub poll_interval: Duration,
    pub min_age: Duration,
}

impl From<&StabilitySection> for StabilityPolicy {
    fn from(section: &StabilitySection) -> Self {
        Self {
            checks_required: section.checks.max(1),
            poll_interval: section.interval(),
            min_age: section.min_age(),
        }
    }
}

#[derive(Clone)]
pub struct StabilityDetector {
    policy: StabilityPolicy,
    probe: Arc<dyn FileProbe>,
    shutdown: ShutdownSignal,
}

impl StabilityDetector {
    pub fn new(policy: StabilityPolicy, shutdown: ShutdownSignal) -> Self {
        Self {
            policy,
            probe: Arc::new(FsProbe),
            shutdown,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn FileProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Blocks this caller until `path` has produced `checks_required`
    /// consecutive unchanged samples, each old enough to satisfy `min_age`.
    pub async fn wait_until_stable(&self, path: &Path) -> StabilityResult<FileSample> {
        let required = self.policy.checks_required.max(1);
        let mut previous: Option<FileSample> = None;
        let mut consecutive = 0u32;
        loop {
            let sample = self
                .probe
                .sample(path)
                .await
                .map_err(|source| StabilityError::Io {
                    source,
                    path: path.to_path_buf(),
                })?
                .ok_or_else(|| StabilityError::FileVanished {
                    path: path.to_path_buf(),
                })?;

            let unchanged = previous.is_some_and(|prev| prev.matches(&sample));
            if unchanged && sample.age >= self.policy.min_age {
                consecutive += 1;
            } else {
                consecutive = 0;
            }
            previous = Some(sample);
            debug!(
                path = %path.display(),
                size = sample.size,
                consecutive,
                required,
                "stability sample"
            );
            if consecutive >= required {
                return Ok(sample);
            }

            tokio::select! {
                _ = sleep(self.policy.poll_interval) => {}
                _ = self.shutdown.wait() => {
                    return Err(StabilityError::Interrupted { path: path.to_path_buf() });
                }
            }
        }
    }
}
