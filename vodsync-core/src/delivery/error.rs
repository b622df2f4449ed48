use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Transport statuses worth another attempt.
pub const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

#[derive(Debug, Error)]
pub enum HostError {
    #[error("remote host responded with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("artifact {0} is missing")]
    ArtifactMissing(PathBuf),
    #[error("io error at {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("missing credential material at {0}")]
    MissingCredentials(PathBuf),
    #[error("invalid endpoint {0}")]
    InvalidEndpoint(String),
    #[error("unexpected response: {0}")]
    Response(String),
}

impl HostError {
    pub fn status(&self) -> Option<u16> {
        match self {
            HostError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn class(&self) -> FailureClass {
        classify_status(self.status())
    }
}

impl From<reqwest::Error> for HostError {
    fn from(error: reqwest::Error) -> Self {
        match error.status() {
            Some(status) => HostError::Status {
                status: status.as_u16(),
                body: error.to_string(),
            },
            None => HostError::Transport(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    Fatal,
}

/// Only a status in [`RETRYABLE_STATUSES`] is transient; everything else,
/// including failures without a status, is fatal.
pub fn classify_status(status: Option<u16>) -> FailureClass {
    match status {
        Some(code) if RETRYABLE_STATUSES.contains(&code) => FailureClass::Transient,
        _ => FailureClass::Fatal,
    }
}

/// Tagged result of one submission attempt.
#[derive(Debug)]
pub enum AttemptOutcome<T> {
    Success(T),
    Transient(HostError),
    Fatal(HostError),
}

impl<T> AttemptOutcome<T> {
    pub fn classify(result: Result<T, HostError>) -> Self {
        match result {
            Ok(value) => AttemptOutcome::Success(value),
            Err(error) => match error.class() {
                FailureClass::Transient => AttemptOutcome::Transient(error),
                FailureClass::Fatal => AttemptOutcome::Fatal(error),
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum DeliveryFailure {
    #[error("delivery exhausted after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: HostError },
    #[error("fatal delivery error on attempt {attempts}: {error}")]
    Fatal { attempts: u32, error: HostError },
    #[error("delivery interrupted by shutdown after {attempts} attempts")]
    Interrupted {
        attempts: u32,
        last_error: Option<HostError>,
    },
}

impl DeliveryFailure {
    pub fn attempts(&self) -> u32 {
        match self {
            DeliveryFailure::Exhausted { attempts, .. }
            | DeliveryFailure::Fatal { attempts, .. }
            | DeliveryFailure::Interrupted { attempts, .. } => *attempts,
        }
    }

    /// Whether the failure hands recovery to the pending-delivery queue.
    pub fn is_queueable(&self) -> bool {
        matches!(
            self,
            DeliveryFailure::Exhausted { .. } | DeliveryFailure::Interrupted { .. }
        )
    }
}

pub type DeliveryResult<T> = Result<T, DeliveryFailure>;
