pub mod config;
pub mod delivery;
pub mod error;
pub mod fsutil;
pub mod naming;
pub mod pending;
pub mod pipeline;
pub mod service;
pub mod shutdown;
pub mod stability;
pub mod transform;
pub mod watcher;

pub use config::{
    load_uploader_config, write_default_config, ConfigOverrides, RelocationMode, UploaderConfig,
    Visibility, DEFAULT_CONFIG_FILE,
};
pub use delivery::{
    DeliveryEngine, DeliveryFailure, DeliveryMetadata, DeliveryReceipt, HostError, HttpVideoHost,
    RemoteId, RetryPolicy, VideoHost,
};
pub use error::{ConfigError, Result};
pub use naming::{display_title, NameResolver, ResolvedName, SequenceStore};
pub use pending::{DrainOptions, DrainReport, PendingDelivery, PendingQueue};
pub use pipeline::{DispatchReport, Orchestrator, PipelineError, PipelineOutcome, Stage};
pub use service::{ServiceError, UploaderService};
pub use shutdown::{shutdown_channel, ShutdownSignal, ShutdownTrigger};
pub use stability::{StabilityDetector, StabilityError, StabilityPolicy};
pub use transform::{Transcoder, TransformOptions};
pub use watcher::{EventFilter, WatchEvent};
