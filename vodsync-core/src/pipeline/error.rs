use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::stability::StabilityError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Stability(#[from] StabilityError),
    #[error("failed to back up {path}: {source}")]
    Backup { source: io::Error, path: PathBuf },
    #[error("failed to rename {from} to {to}: {source}")]
    Rename {
        source: io::Error,
        from: PathBuf,
        to: PathBuf,
    },
    #[error("no free artifact name for {path} after {attempts} attempts")]
    NameExhausted { path: PathBuf, attempts: u32 },
    #[error("failed to restore {original} from {backup}: {source}")]
    Restore {
        source: io::Error,
        original: PathBuf,
        backup: PathBuf,
    },
}

pub type PipelineResult<T> = Result<T, PipelineError>;
