mod error;
mod host;
mod jitter;

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::{DeliverySection, RetrySection, Visibility};
use crate::fsutil;
use crate::shutdown::ShutdownSignal;

pub use error::{
    classify_status, AttemptOutcome, DeliveryFailure, DeliveryResult, FailureClass, HostError,
    RETRYABLE_STATUSES,
};
pub use host::{load_token, HttpVideoHost, VideoHost};
pub use jitter::{JitterSource, NoJitter, SeededJitter, ThreadRngJitter};

fn default_category() -> String {
    "20".to_string()
}

/// Descriptive fields sent alongside an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryMetadata {
    pub description: String,
    pub tags: Vec<String>,
    pub visibility: Visibility,
    #[serde(default)]
    pub collection_id: Option<String>,
    #[serde(default = "default_category")]
    pub category_id: String,
}

impl From<&DeliverySection> for DeliveryMetadata {
    fn from(section: &DeliverySection) -> Self {
        Self {
            description: section.description.clone(),
            tags: section.tags.clone(),
            visibility: section.visibility,
            collection_id: section.collection_id.clone(),
            category_id: section.category_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(String);

impl RemoteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub remote_id: RemoteId,
    pub attempts: u32,
    /// `None` when no collection was configured.
    pub collection_attached: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempt bound.
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub multiplier: f64,
    pub jitter_max: Duration,
}

impl RetryPolicy {
    /// Deterministic part of the delay after the 0-indexed `attempt` failed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let seconds = self.base_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
    }
}

impl From<&RetrySection> for RetryPolicy {
    fn from(section: &RetrySection) -> Self {
        Self {
            max_retries: section.max_retries.max(1),
            base_backoff: Duration::from_millis(section.base_backoff_ms),
            multiplier: section.multiplier,
            jitter_max: Duration::from_millis(section.jitter_max_ms),
        }
    }
}

/// Submits artifacts and retries transient failures with exponential
/// backoff plus jitter.
#[derive(Clone)]
pub struct DeliveryEngine {
    host: Arc<dyn VideoHost>,
    policy: RetryPolicy,
    jitter: Arc<dyn JitterSource>,
    shutdown: ShutdownSignal,
}

impl fmt::Debug for DeliveryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryEngine")
            .field("policy", &self.policy)
            .finish()
    }
}

impl DeliveryEngine {
    pub fn new(host: Arc<dyn VideoHost>, policy: RetryPolicy, shutdown: ShutdownSignal) -> Self {
        Self {
            host,
            policy,
            jitter: Arc::new(ThreadRngJitter),
            shutdown,
        }
    }

    pub fn with_jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self
    }

    pub async fn deliver(
        &self,
        artifact: &Path,
        title: &str,
        metadata: &DeliveryMetadata,
    ) -> DeliveryResult<DeliveryReceipt> {
        let max_attempts = self.policy.max_retries.max(1);
        let mut attempt = 0u32;
        loop {
            let attempts = attempt + 1;
            let result = if fsutil::exists(artifact).await {
                self.host.submit(artifact, title, metadata).await
            } else {
                Err(HostError::ArtifactMissing(artifact.to_path_buf()))
            };
            match AttemptOutcome::classify(result) {
                AttemptOutcome::Success(remote_id) => {
                    info!(artifact = %artifact.display(), remote_id = %remote_id, attempts, "delivery succeeded");
                    let collection_attached = self.attach(&remote_id, metadata).await;
                    return Ok(DeliveryReceipt {
                        remote_id,
                        attempts,
                        collection_attached,
                    });
                }
                AttemptOutcome::Fatal(error) => {
                    error!(artifact = %artifact.display(), attempt = attempts, error = %error, "fatal delivery error");
                    return Err(DeliveryFailure::Fatal {
                        attempts,
                        error,
                    });
                }
                AttemptOutcome::Transient(error) => {
                    if attempts >= max_attempts {
                        warn!(artifact = %artifact.display(), attempts, error = %error, "delivery retries exhausted");
                        return Err(DeliveryFailure::Exhausted {
                            attempts,
                            last_error: error,
                        });
                    }
                    let delay = self
                        .policy
                        .backoff(attempt)
                        .saturating_add(self.jitter.draw(self.policy.jitter_max));
                    warn!(
                        artifact = %artifact.display(),
                        attempt = attempts,
                        status = ?error.status(),
                        wait = ?delay,
                        error = %error,
                        "transient delivery failure, retrying"
                    );
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = self.shutdown.wait() => {
                            warn!(artifact = %artifact.display(), attempts, "shutdown during delivery backoff");
                            return Err(DeliveryFailure::Interrupted {
                                attempts,
                                last_error: Some(error),
                            });
                        }
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn attach(&self, remote_id: &RemoteId, metadata: &DeliveryMetadata) -> Option<bool> {
        let collection_id = metadata.collection_id.as_deref()?;
        match self
            .host
            .attach_to_collection(remote_id, collection_id)
            .await
        {
            Ok(()) => {
                info!(remote_id = %remote_id, collection = collection_id, "attached to collection");
                Some(true)
            }
            Err(err) => {
                warn!(remote_id = %remote_id, collection = collection_id, error = %err, "failed to attach to collection");
                Some(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tempfile::tempdir;
    use tokio::time::Instant;

    use crate::shutdown::shutdown_channel;

    struct ScriptedHost {
        results: Mutex<VecDeque<Result<RemoteId, HostError>>>,
        submissions: Mutex<u32>,
        attach_result: Mutex<Option<Result<(), HostError>>>,
    }

    impl ScriptedHost {
        fn new(results: Vec<Result<RemoteId, HostError>>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results.into()),
                submissions: Mutex::new(0),
                attach_result: Mutex::new(None),
            })
        }

        fn submissions(&self) -> u32 {
            *self.submissions.lock().unwrap()
        }
    }

    #[async_trait]
    impl VideoHost for ScriptedHost {
        async fn submit(
            &self,
            _artifact: &Path,
            _title: &str,
            _metadata: &DeliveryMetadata,
        ) -> Result<RemoteId, HostError> {
            *self.submissions.lock().unwrap() += 1;
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(status(503)))
        }

        async fn attach_to_collection(
            &self,
            _id: &RemoteId,
            _collection_id: &str,
        ) -> Result<(), HostError> {
            self.attach_result.lock().unwrap().take().unwrap_or(Ok(()))
        }
    }

    struct FixedJitter(Duration);

    impl JitterSource for FixedJitter {
        fn draw(&self, _max: Duration) -> Duration {
            self.0
        }
    }

    fn status(code: u16) -> HostError {
        HostError::Status {
            status: code,
            body: String::new(),
        }
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_backoff: Duration::from_secs(2),
            multiplier: 3.0,
            jitter_max: Duration::from_millis(500),
        }
    }

    fn metadata(collection: Option<&str>) -> DeliveryMetadata {
        DeliveryMetadata {
            description: "Raid Upload".into(),
            tags: vec!["WoW".into(), "WoW".into()],
            visibility: Visibility::Unlisted,
            collection_id: collection.map(str::to_string),
            category_id: "20".into(),
        }
    }

    fn artifact() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("W1_Foe_Pull1_Sep03_10-16PM.mp4");
        std::fs::write(&path, b"video").unwrap();
        (dir, path)
    }

    #[test]
    fn backoff_grows_geometrically() {
        let policy = policy(5);
        assert_eq!(policy.backoff(0), Duration::from_secs(2));
        assert_eq!(policy.backoff(1), Duration::from_secs(6));
        assert_eq!(policy.backoff(2), Duration::from_secs(18));
        assert_eq!(policy.backoff(8), Duration::from_secs(13_122));
        assert_eq!(policy.backoff(u32::MAX), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_third_attempt_after_two_backoffs() {
        let (_dir, path) = artifact();
        let host = ScriptedHost::new(vec![
            Err(status(503)),
            Err(status(503)),
            Ok(RemoteId::new("third")),
        ]);
        let engine = DeliveryEngine::new(host.clone(), policy(5), ShutdownSignal::never())
            .with_jitter(Arc::new(FixedJitter(Duration::from_millis(250))));
        let started = Instant::now();
        let receipt = engine
            .deliver(&path, "title", &metadata(None))
            .await
            .unwrap();
        assert_eq!(receipt.remote_id, RemoteId::new("third"));
        assert_eq!(receipt.attempts, 3);
        assert_eq!(receipt.collection_attached, None);
        // 2s * 3^0 + 2s * 3^1 plus two 250ms jitter draws.
        assert_eq!(started.elapsed(), Duration::from_millis(8_500));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_stops_after_one_attempt() {
        let (_dir, path) = artifact();
        let host = ScriptedHost::new(vec![Err(status(400)), Ok(RemoteId::new("never"))]);
        let engine = DeliveryEngine::new(host.clone(), policy(5), ShutdownSignal::never())
            .with_jitter(Arc::new(NoJitter));
        let err = engine
            .deliver(&path, "title", &metadata(None))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryFailure::Fatal { attempts: 1, .. }));
        assert!(!err.is_queueable());
        assert_eq!(host.submissions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_exhaust_the_budget() {
        let (_dir, path) = artifact();
        let host = ScriptedHost::new(Vec::new());
        let engine = DeliveryEngine::new(host.clone(), policy(3), ShutdownSignal::never())
            .with_jitter(Arc::new(NoJitter));
        let started = Instant::now();
        let err = engine
            .deliver(&path, "title", &metadata(None))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryFailure::Exhausted { attempts: 3, .. }));
        assert!(err.is_queueable());
        assert_eq!(host.submissions(), 3);
        // No sleep after the final failure.
        assert_eq!(started.elapsed(), Duration::from_secs(2 + 6));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_after_transient_counts_both_attempts() {
        let (_dir, path) = artifact();
        let host = ScriptedHost::new(vec![Err(status(429)), Err(status(403))]);
        let engine = DeliveryEngine::new(host.clone(), policy(5), ShutdownSignal::never())
            .with_jitter(Arc::new(NoJitter));
        let err = engine
            .deliver(&path, "title", &metadata(None))
            .await
            .unwrap_err();
        assert_eq!(err.attempts(), 2);
        assert!(matches!(err, DeliveryFailure::Fatal { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_artifact_is_fatal_without_submission() {
        let dir = tempdir().unwrap();
        let host = ScriptedHost::new(vec![Ok(RemoteId::new("x"))]);
        let engine = DeliveryEngine::new(host.clone(), policy(5), ShutdownSignal::never());
        let err = engine
            .deliver(&dir.path().join("gone.mp4"), "title", &metadata(None))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DeliveryFailure::Fatal {
                error: HostError::ArtifactMissing(_),
                ..
            }
        ));
        assert_eq!(host.submissions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn collection_failure_does_not_invalidate_success() {
        let (_dir, path) = artifact();
        let host = ScriptedHost::new(vec![Ok(RemoteId::new("vid"))]);
        *host.attach_result.lock().unwrap() = Some(Err(status(404)));
        let engine = DeliveryEngine::new(host.clone(), policy(5), ShutdownSignal::never());
        let receipt = engine
            .deliver(&path, "title", &metadata(Some("PL123")))
            .await
            .unwrap();
        assert_eq!(receipt.remote_id.as_str(), "vid");
        assert_eq!(receipt.collection_attached, Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_backoff() {
        let (_dir, path) = artifact();
        let (trigger, signal) = shutdown_channel();
        let host = ScriptedHost::new(Vec::new());
        let engine =
            DeliveryEngine::new(host.clone(), policy(5), signal).with_jitter(Arc::new(NoJitter));
        trigger.trigger();
        let err = engine
            .deliver(&path, "title", &metadata(None))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryFailure::Interrupted { attempts: 1, .. }));
        assert!(err.is_queueable());
        assert_eq!(host.submissions(), 1);
    }
}
