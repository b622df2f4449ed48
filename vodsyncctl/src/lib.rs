use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vodsync_core::{
    display_title, load_uploader_config, shutdown_channel, write_default_config, ConfigOverrides,
    DispatchReport, DrainReport, HttpVideoHost, PendingDelivery, PendingQueue, RelocationMode,
    UploaderConfig, UploaderService, Visibility,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] vodsync_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("service error: {0}")]
    Service(#[from] vodsync_core::ServiceError),
    #[error("pending queue error: {0}")]
    Pending(#[from] vodsync_core::pending::PendingError),
    #[error("remote host error: {0}")]
    Host(#[from] vodsync_core::HostError),
    #[error("required resource missing: {0}")]
    MissingResource(String),
    #[error("credential file {0} not found")]
    MissingCredentials(PathBuf),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Recording watcher and uploader", long_about = None)]
pub struct Cli {
    /// Path to vodsync.toml
    #[arg(long, default_value = vodsync_core::DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Drain the pending queue, then watch for new recordings until Ctrl-C
    Watch(OverrideArgs),
    /// Retry pending deliveries once and exit
    Drain(OverrideArgs),
    /// Inspect or reset the pending-delivery queue
    #[command(subcommand)]
    Pending(PendingCommands),
    /// Write a default configuration document
    InitConfig(InitConfigArgs),
    /// Print the display title for a resolved artifact name
    Title(TitleArgs),
}

#[derive(Subcommand, Debug)]
pub enum PendingCommands {
    /// List queued deliveries
    List,
    /// Remove every queued delivery
    Reset,
}

#[derive(Args, Debug)]
pub struct InitConfigArgs {
    /// Destination, defaults to --config
    #[arg(long)]
    pub path: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct TitleArgs {
    pub file_name: String,
    /// Title prefix, defaults to naming.title_prefix
    #[arg(long)]
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum RelocationArg {
    Move,
    Copy,
}

impl From<RelocationArg> for RelocationMode {
    fn from(value: RelocationArg) -> Self {
        match value {
            RelocationArg::Move => RelocationMode::Move,
            RelocationArg::Copy => RelocationMode::Copy,
        }
    }
}

/// Flags overriding the loaded configuration document.
#[derive(Args, Debug, Default)]
pub struct OverrideArgs {
    #[arg(long)]
    pub watch_dir: Option<PathBuf>,
    #[arg(long)]
    pub relocation_dir: Option<PathBuf>,
    #[arg(long, value_enum)]
    pub relocation_mode: Option<RelocationArg>,
    #[arg(long)]
    pub collection_id: Option<String>,
    /// YYYY-MM-DD
    #[arg(long)]
    pub season_start: Option<String>,
    #[arg(long)]
    pub visibility: Option<Visibility>,
    #[arg(long)]
    pub description: Option<String>,
    #[arg(long, value_delimiter = ',')]
    pub tags: Vec<String>,
    /// Rename only; skip transform, delivery and relocation
    #[arg(long)]
    pub dry_run: bool,
    #[arg(long)]
    pub stable_checks: Option<u32>,
    #[arg(long)]
    pub stable_interval_ms: Option<u64>,
    #[arg(long)]
    pub min_age_seconds: Option<u64>,
    #[arg(long, value_delimiter = ',')]
    pub ignore_patterns: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    pub ignore_extensions: Vec<String>,
    #[arg(long)]
    pub max_retries: Option<u32>,
    #[arg(long)]
    pub base_backoff_ms: Option<u64>,
    #[arg(long)]
    pub backoff_multiplier: Option<f64>,
    #[arg(long)]
    pub jitter_max_ms: Option<u64>,
    #[arg(long, conflicts_with = "no_transcode")]
    pub transcode: bool,
    #[arg(long)]
    pub no_transcode: bool,
    #[arg(long)]
    pub crf: Option<u8>,
    #[arg(long)]
    pub audio_bitrate: Option<String>,
    #[arg(long)]
    pub max_width: Option<u32>,
    #[arg(long)]
    pub max_uploads_per_run: Option<usize>,
    #[arg(long)]
    pub token_path: Option<PathBuf>,
}

fn non_empty(values: &[String]) -> Option<Vec<String>> {
    (!values.is_empty()).then(|| values.to_vec())
}

impl OverrideArgs {
    pub fn to_overrides(&self) -> ConfigOverrides {
        let transcode = if self.transcode {
            Some(true)
        } else if self.no_transcode {
            Some(false)
        } else {
            None
        };
        ConfigOverrides {
            watch_dir: self.watch_dir.clone(),
            relocation_dir: self.relocation_dir.clone(),
            relocation_mode: self.relocation_mode.map(RelocationMode::from),
            collection_id: self.collection_id.clone(),
            season_start: self.season_start.clone(),
            visibility: self.visibility,
            description: self.description.clone(),
            tags: non_empty(&self.tags),
            dry_run: self.dry_run.then_some(true),
            stable_checks: self.stable_checks,
            stable_interval_ms: self.stable_interval_ms,
            min_age_seconds: self.min_age_seconds,
            ignore_patterns: non_empty(&self.ignore_patterns),
            ignore_extensions: non_empty(&self.ignore_extensions),
            max_retries: self.max_retries,
            base_backoff_ms: self.base_backoff_ms,
            backoff_multiplier: self.backoff_multiplier,
            jitter_max_ms: self.jitter_max_ms,
            transcode,
            crf: self.crf,
            audio_bitrate: self.audio_bitrate.clone(),
            max_width: self.max_width,
            max_uploads_per_run: self.max_uploads_per_run,
            token_path: self.token_path.clone(),
        }
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}

pub fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Commands::Watch(args) => {
            let config = resolve_config(&cli.config, args)?;
            let report = run_watch(config)?;
            render(&report, cli.format)?;
        }
        Commands::Drain(args) => {
            let config = resolve_config(&cli.config, args)?;
            let report = run_drain(config)?;
            render(&report, cli.format)?;
        }
        Commands::Pending(PendingCommands::List) => {
            let config = load_config_or_default(&cli.config)?;
            let list = pending_list(&config)?;
            render(&list, cli.format)?;
        }
        Commands::Pending(PendingCommands::Reset) => {
            let config = load_config_or_default(&cli.config)?;
            let result = pending_reset(&config)?;
            render(&result, cli.format)?;
        }
        Commands::InitConfig(args) => {
            let path = args.path.clone().unwrap_or_else(|| cli.config.clone());
            write_default_config(&path)?;
            render(&InitConfigResult { path }, cli.format)?;
        }
        Commands::Title(args) => {
            let prefix = match &args.prefix {
                Some(prefix) => prefix.clone(),
                None => load_config_or_default(&cli.config)?.naming.title_prefix,
            };
            let output = TitleOutput {
                file_name: args.file_name.clone(),
                title: display_title(&args.file_name, &prefix),
            };
            render(&output, cli.format)?;
        }
    }
    Ok(())
}

/// Loads the document when present; otherwise starts from defaults.
pub fn load_config_or_default(path: &Path) -> Result<UploaderConfig> {
    if path.exists() {
        Ok(load_uploader_config(path)?)
    } else {
        warn!(path = %path.display(), "configuration file not found, using defaults");
        Ok(UploaderConfig::default())
    }
}

pub fn resolve_config(path: &Path, args: &OverrideArgs) -> Result<UploaderConfig> {
    let mut config = load_config_or_default(path)?;
    args.to_overrides().apply(&mut config);
    config.validate()?;
    Ok(config)
}

fn ensure_startup_resources(config: &UploaderConfig, require_watch_dir: bool) -> Result<()> {
    if require_watch_dir && !config.watch.directory.is_dir() {
        return Err(AppError::MissingResource(format!(
            "watch directory {}",
            config.watch.directory.display()
        )));
    }
    if !config.delivery.dry_run && !config.delivery.token_path.is_file() {
        return Err(AppError::MissingCredentials(
            config.delivery.token_path.clone(),
        ));
    }
    Ok(())
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}

pub fn run_watch(config: UploaderConfig) -> Result<DispatchReport> {
    ensure_startup_resources(&config, true)?;
    let runtime = build_runtime()?;
    runtime.block_on(async move {
        let host = Arc::new(HttpVideoHost::new(&config.delivery)?);
        let (trigger, shutdown) = shutdown_channel();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, finishing in-flight recordings");
                trigger.trigger();
            }
        });
        let service = UploaderService::build(config, host, shutdown).await?;
        Ok::<_, AppError>(service.run().await?)
    })
}

pub fn run_drain(config: UploaderConfig) -> Result<DrainReport> {
    ensure_startup_resources(&config, false)?;
    let runtime = build_runtime()?;
    runtime.block_on(async move {
        let host = Arc::new(HttpVideoHost::new(&config.delivery)?);
        let (trigger, shutdown) = shutdown_channel();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                trigger.trigger();
            }
        });
        let service = UploaderService::build(config, host, shutdown).await?;
        Ok::<_, AppError>(service.drain_pending().await?)
    })
}

fn pending_list(config: &UploaderConfig) -> Result<PendingList> {
    let runtime = build_runtime()?;
    let queue = PendingQueue::new(&config.state.pending_path);
    let entries = runtime.block_on(queue.load())?;
    Ok(PendingList {
        path: config.state.pending_path.clone(),
        entries,
    })
}

fn pending_reset(config: &UploaderConfig) -> Result<PendingResetResult> {
    let runtime = build_runtime()?;
    let queue = PendingQueue::new(&config.state.pending_path);
    let removed = runtime.block_on(queue.clear())?;
    Ok(PendingResetResult {
        path: config.state.pending_path.clone(),
        removed,
    })
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug, Serialize)]
pub struct PendingList {
    pub path: PathBuf,
    pub entries: Vec<PendingDelivery>,
}

impl DisplayFallback for PendingList {
    fn display(&self) -> String {
        if self.entries.is_empty() {
            return format!("No pending deliveries in {}", self.path.display());
        }
        let mut lines = vec![format!(
            "{} pending deliveries in {}",
            self.entries.len(),
            self.path.display()
        )];
        for entry in &self.entries {
            let enqueued = entry
                .enqueued_at
                .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string());
            lines.push(format!(
                "  - {} | {} | enqueued {}",
                entry.artifact_path.display(),
                entry.title,
                enqueued
            ));
            if let Some(error) = &entry.last_error {
                lines.push(format!("      last error: {error}"));
            }
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct PendingResetResult {
    pub path: PathBuf,
    pub removed: usize,
}

impl DisplayFallback for PendingResetResult {
    fn display(&self) -> String {
        format!(
            "Removed {} pending deliveries from {}",
            self.removed,
            self.path.display()
        )
    }
}

#[derive(Debug, Serialize)]
pub struct InitConfigResult {
    pub path: PathBuf,
}

impl DisplayFallback for InitConfigResult {
    fn display(&self) -> String {
        format!("Wrote default configuration to {}", self.path.display())
    }
}

#[derive(Debug, Serialize)]
pub struct TitleOutput {
    pub file_name: String,
    pub title: String,
}

impl DisplayFallback for TitleOutput {
    fn display(&self) -> String {
        self.title.clone()
    }
}

impl DisplayFallback for DrainReport {
    fn display(&self) -> String {
        format!(
            "Drained pending queue: {} loaded, {} attempted, {} delivered, {} dropped, {} retained",
            self.loaded, self.attempted, self.delivered, self.dropped, self.retained
        )
    }
}

impl DisplayFallback for DispatchReport {
    fn display(&self) -> String {
        let lines = [
            format!("Events received: {}", self.received),
            format!("  - filtered: {}", self.filtered),
            format!("  - duplicates: {}", self.duplicates),
            format!("  - succeeded: {}", self.succeeded),
            format!("  - queued: {}", self.queued),
            format!("  - restored: {}", self.restored),
            format!("  - dry run: {}", self.dry_run),
            format!("  - failed: {}", self.failed),
        ];
        lines.join("\n")
    }
}
