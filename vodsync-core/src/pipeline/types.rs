use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use crate::delivery::RemoteId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Detected,
    Stabilizing,
    Stable,
    Renamed,
    Transforming,
    Delivering,
    Succeeded,
    Queued,
    Restored,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Detected => "detected",
            Stage::Stabilizing => "stabilizing",
            Stage::Stable => "stable",
            Stage::Renamed => "renamed",
            Stage::Transforming => "transforming",
            Stage::Delivering => "delivering",
            Stage::Succeeded => "succeeded",
            Stage::Queued => "queued",
            Stage::Restored => "restored",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Succeeded | Stage::Queued | Stage::Restored)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live state of one file moving through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineRecord {
    pub original_path: PathBuf,
    pub backup_path: Option<PathBuf>,
    pub renamed_path: Option<PathBuf>,
    pub transformed_path: Option<PathBuf>,
    pub stage: Stage,
}

impl PipelineRecord {
    pub fn new(original_path: impl Into<PathBuf>) -> Self {
        Self {
            original_path: original_path.into(),
            backup_path: None,
            renamed_path: None,
            transformed_path: None,
            stage: Stage::Detected,
        }
    }

    pub fn advance(&mut self, stage: Stage) {
        info!(
            path = %self.original_path.display(),
            from = %self.stage,
            stage = %stage,
            "pipeline stage transition"
        );
        self.stage = stage;
    }

    /// The file currently holding the recording's bytes under its new name.
    pub fn artifact(&self) -> &Path {
        self.renamed_path.as_deref().unwrap_or(&self.original_path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PipelineOutcome {
    Succeeded {
        renamed: PathBuf,
        remote_id: RemoteId,
    },
    Queued {
        renamed: PathBuf,
    },
    Restored {
        original: PathBuf,
        reason: String,
    },
    /// Renamed only; transform, delivery and relocation were skipped.
    DryRun {
        renamed: PathBuf,
    },
    /// Another pipeline already owns the path.
    Duplicate,
}
