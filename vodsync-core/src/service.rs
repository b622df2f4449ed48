use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

use crate::config::UploaderConfig;
use crate::delivery::{DeliveryEngine, RetryPolicy, VideoHost};
use crate::naming::{NameResolver, SequenceError, SequenceStore};
use crate::pending::{DrainOptions, DrainReport, PendingError, PendingQueue};
use crate::pipeline::{
    run_dispatch, DispatchReport, Orchestrator, PipelineComponents, PipelineSettings,
};
use crate::shutdown::ShutdownSignal;
use crate::stability::{StabilityDetector, StabilityPolicy};
use crate::transform::{TransformOptions, Transcoder};
use crate::watcher::{watch_directory, EventFilter, WatchError, WatchEvent};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Sequence(#[from] SequenceError),
    #[error(transparent)]
    Pending(#[from] PendingError),
    #[error(transparent)]
    Watch(#[from] WatchError),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Every component wired from one configuration value.
#[derive(Clone)]
pub struct UploaderService {
    config: Arc<UploaderConfig>,
    orchestrator: Orchestrator,
    filter: EventFilter,
    shutdown: ShutdownSignal,
}

impl UploaderService {
    pub async fn build(
        config: UploaderConfig,
        host: Arc<dyn VideoHost>,
        shutdown: ShutdownSignal,
    ) -> ServiceResult<Self> {
        let sequences = Arc::new(SequenceStore::open(&config.state.sequence_path).await?);
        let resolver = NameResolver::new(config.naming.season_start_date(), sequences);
        let detector =
            StabilityDetector::new(StabilityPolicy::from(&config.stability), shutdown.clone());
        let transcoder = Transcoder::new(TransformOptions::from(&config.transcode));
        let delivery = DeliveryEngine::new(
            host,
            RetryPolicy::from(&config.retry),
            shutdown.clone(),
        );
        Ok(Self::from_components(
            config.clone(),
            PipelineComponents {
                detector,
                resolver,
                transcoder,
                delivery,
                pending: Arc::new(PendingQueue::new(&config.state.pending_path)),
            },
            shutdown,
        ))
    }

    /// Wires pre-built components, letting callers substitute probes,
    /// executors or jitter sources.
    pub fn from_components(
        config: UploaderConfig,
        components: PipelineComponents,
        shutdown: ShutdownSignal,
    ) -> Self {
        let orchestrator = Orchestrator::new(PipelineSettings::from(&config), components);
        let filter = EventFilter::from_config(&config.watch);
        Self {
            config: Arc::new(config),
            orchestrator,
            filter,
            shutdown,
        }
    }

    pub fn config(&self) -> &UploaderConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn pending(&self) -> &PendingQueue {
        self.orchestrator.pending()
    }

    /// One pass over the pending queue, bounded by `max_uploads_per_run`.
    pub async fn drain_pending(&self) -> ServiceResult<DrainReport> {
        let delivery = self.orchestrator.delivery().clone();
        let options = DrainOptions {
            limit: self.config.delivery.max_uploads_per_run,
        };
        let report = self
            .pending()
            .drain(
                move |record| {
                    let delivery = delivery.clone();
                    async move {
                        delivery
                            .deliver(&record.artifact_path, &record.title, &record.metadata)
                            .await
                    }
                },
                options,
                &self.shutdown,
            )
            .await?;
        Ok(report)
    }

    /// Drains the pending queue, then dispatches watch events until
    /// shutdown.
    ///
    /// The watcher is registered before the drain starts, so recordings that
    /// land while queued deliveries are retried wait in the channel.
    pub async fn run(&self) -> ServiceResult<DispatchReport> {
        let (_watcher, events) = watch_directory(&self.config.watch.directory)?;
        if self.config.delivery.dry_run {
            info!("dry run, pending queue left untouched");
        } else {
            self.drain_pending().await?;
        }
        Ok(self.run_with_events(events).await)
    }

    /// Dispatch loop over an arbitrary event source.
    pub async fn run_with_events(
        &self,
        events: mpsc::UnboundedReceiver<WatchEvent>,
    ) -> DispatchReport {
        run_dispatch(
            self.orchestrator.clone(),
            self.filter.clone(),
            events,
            self.shutdown.clone(),
        )
        .await
    }
}
