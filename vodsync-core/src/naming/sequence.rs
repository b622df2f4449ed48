use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

use crate::fsutil::write_atomic;

#[derive(Debug, Error)]
pub enum SequenceError {
    #[error("failed to read sequence store {path}: {source}")]
    Read { source: io::Error, path: PathBuf },
    #[error("sequence store {path} is not a valid counter map: {source}")]
    Corrupt {
        source: serde_json::Error,
        path: PathBuf,
    },
    #[error("failed to persist sequence store {path}: {source}")]
    Persist { source: io::Error, path: PathBuf },
    #[error("failed to encode sequence store: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type SequenceResult<T> = Result<T, SequenceError>;

pub fn sequence_key(date: NaiveDate, context: &str) -> String {
    format!("{}_{}", date.format("%Y-%m-%d"), context)
}

/// Durable per-(day, context) occurrence counters.
///
/// Counters only grow. Every increment rewrites the whole map while the lock
/// is held so concurrent pipelines cannot clobber each other's updates.
#[derive(Debug)]
pub struct SequenceStore {
    path: PathBuf,
    counts: Mutex<BTreeMap<String, u64>>,
}

impl SequenceStore {
    /// Loads the persisted map. A missing file is an empty map.
    pub async fn open(path: impl Into<PathBuf>) -> SequenceResult<Self> {
        let path = path.into();
        let counts = match tokio::fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => BTreeMap::new(),
            Ok(content) => serde_json::from_str(&content).map_err(|source| {
                SequenceError::Corrupt {
                    source,
                    path: path.clone(),
                }
            })?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(SequenceError::Read { source, path }),
        };
        Ok(Self {
            path,
            counts: Mutex::new(counts),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Increments and returns the counter for `(date, context)`, starting at 1.
    ///
    /// A failed write is logged and the in-memory value still advances.
    pub async fn next_sequence(&self, context: &str, date: NaiveDate) -> u64 {
        let key = sequence_key(date, context);
        let mut counts = self.counts.lock().await;
        let value = {
            let entry = counts.entry(key.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        if let Err(err) = self.persist(&counts).await {
            warn!(key = %key, value, error = %err, "sequence counter advanced without being persisted");
        }
        value
    }

    pub async fn current(&self, context: &str, date: NaiveDate) -> u64 {
        let counts = self.counts.lock().await;
        counts
            .get(&sequence_key(date, context))
            .copied()
            .unwrap_or(0)
    }

    async fn persist(&self, counts: &BTreeMap<String, u64>) -> SequenceResult<()> {
        let encoded = serde_json::to_string_pretty(counts)?;
        write_atomic(&self.path, encoded.as_bytes())
            .await
            .map_err(|source| SequenceError::Persist {
                source,
                path: self.path.clone(),
            })
    }
}
