use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

pub const DEFAULT_CONFIG_FILE: &str = "vodsync.toml";

/// Fallback used whenever `naming.season_start` is missing or unparsable.
pub fn default_season_start() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 9, 1).unwrap_or(NaiveDate::MIN)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct UploaderConfig {
    pub watch: WatchSection,
    pub relocation: RelocationSection,
    pub naming: NamingSection,
    pub stability: StabilitySection,
    pub delivery: DeliverySection,
    pub retry: RetrySection,
    pub transcode: TranscodeSection,
    pub state: StateSection,
}

impl UploaderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.watch.extensions.is_empty() {
            return Err(ConfigError::Invalid(
                "watch.extensions must list at least one extension".into(),
            ));
        }
        if self.stability.checks == 0 {
            return Err(ConfigError::Invalid(
                "stability.checks must be greater than zero".into(),
            ));
        }
        if self.retry.max_retries == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_retries must be greater than zero".into(),
            ));
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "retry.multiplier must be a finite value >= 1.0, got {}",
                self.retry.multiplier
            )));
        }
        if self.transcode.crf > 51 {
            return Err(ConfigError::Invalid(format!(
                "transcode.crf must be within 0..=51, got {}",
                self.transcode.crf
            )));
        }
        if self.watch.backup_suffix.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "watch.backup_suffix must not be empty".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchSection {
    pub directory: PathBuf,
    pub extensions: Vec<String>,
    pub ignore_patterns: Vec<String>,
    pub ignore_extensions: Vec<String>,
    pub backup_suffix: String,
}

impl Default for WatchSection {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("recordings"),
            extensions: vec![".mp4".into()],
            ignore_patterns: vec!["*.tmp".into(), "*.part".into(), "*.crdownload".into()],
            ignore_extensions: vec![".tmp".into(), ".part".into(), ".crdownload".into()],
            backup_suffix: ".backup".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelocationMode {
    #[default]
    Move,
    Copy,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelocationSection {
    pub directory: Option<PathBuf>,
    pub mode: RelocationMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingSection {
    pub season_start: String,
    pub title_prefix: String,
}

impl NamingSection {
    pub fn season_start_date(&self) -> NaiveDate {
        NaiveDate::parse_from_str(self.season_start.trim(), "%Y-%m-%d").unwrap_or_else(|_| {
            tracing::warn!(
                season_start = %self.season_start,
                "invalid season start date, using default"
            );
            default_season_start()
        })
    }
}

impl Default for NamingSection {
    fn default() -> Self {
        Self {
            season_start: "2024-09-01".into(),
            title_prefix: "WoW Raid".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilitySection {
    pub checks: u32,
    pub interval_ms: u64,
    pub min_age_seconds: u64,
}

impl StabilitySection {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn min_age(&self) -> Duration {
        Duration::from_secs(self.min_age_seconds)
    }
}

impl Default for StabilitySection {
    fn default() -> Self {
        Self {
            checks: 3,
            interval_ms: 2_000,
            min_age_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    #[default]
    Unlisted,
    Private,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Unlisted => "unlisted",
            Visibility::Private => "private",
        }
    }
}

impl std::fmt::Display for Visibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Visibility {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "public" => Ok(Self::Public),
            "unlisted" => Ok(Self::Unlisted),
            "private" => Ok(Self::Private),
            other => Err(ConfigError::Invalid(format!("unknown visibility: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliverySection {
    pub visibility: Visibility,
    pub description: String,
    pub tags: Vec<String>,
    pub category_id: String,
    pub collection_id: Option<String>,
    pub dry_run: bool,
    pub max_uploads_per_run: Option<usize>,
    pub token_path: PathBuf,
    pub api_base: String,
    pub upload_base: String,
    pub request_timeout_seconds: u64,
}

impl Default for DeliverySection {
    fn default() -> Self {
        Self {
            visibility: Visibility::Unlisted,
            description: "Raid Upload".into(),
            tags: vec![
                "World of Warcraft".into(),
                "WoW".into(),
                "Raid".into(),
                "POV".into(),
            ],
            category_id: "20".into(),
            collection_id: None,
            dry_run: false,
            max_uploads_per_run: None,
            token_path: PathBuf::from("token.json"),
            api_base: "https://www.googleapis.com/youtube/v3".into(),
            upload_base: "https://www.googleapis.com/upload/youtube/v3".into(),
            request_timeout_seconds: 3_600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub multiplier: f64,
    pub jitter_max_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_backoff_ms: 2_000,
            multiplier: 2.0,
            jitter_max_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeSection {
    pub enabled: bool,
    pub ffmpeg: PathBuf,
    pub crf: u8,
    pub preset: String,
    pub audio_bitrate: String,
    pub max_width: Option<u32>,
    pub work_dir: Option<PathBuf>,
}

impl TranscodeSection {
    pub fn work_dir(&self) -> PathBuf {
        self.work_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("vodsync"))
    }
}

impl Default for TranscodeSection {
    fn default() -> Self {
        Self {
            enabled: false,
            ffmpeg: PathBuf::from("ffmpeg"),
            crf: 23,
            preset: "medium".into(),
            audio_bitrate: "160k".into(),
            max_width: None,
            work_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateSection {
    pub sequence_path: PathBuf,
    pub pending_path: PathBuf,
}

impl Default for StateSection {
    fn default() -> Self {
        Self {
            sequence_path: PathBuf::from("pull_counts.json"),
            pending_path: PathBuf::from("pending_uploads.json"),
        }
    }
}

/// Command-line values layered over a loaded document. `None` keeps the
/// document's value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub watch_dir: Option<PathBuf>,
    pub relocation_dir: Option<PathBuf>,
    pub relocation_mode: Option<RelocationMode>,
    pub collection_id: Option<String>,
    pub season_start: Option<String>,
    pub visibility: Option<Visibility>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
    pub dry_run: Option<bool>,
    pub stable_checks: Option<u32>,
    pub stable_interval_ms: Option<u64>,
    pub min_age_seconds: Option<u64>,
    pub ignore_patterns: Option<Vec<String>>,
    pub ignore_extensions: Option<Vec<String>>,
    pub max_retries: Option<u32>,
    pub base_backoff_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub jitter_max_ms: Option<u64>,
    pub transcode: Option<bool>,
    pub crf: Option<u8>,
    pub audio_bitrate: Option<String>,
    pub max_width: Option<u32>,
    pub max_uploads_per_run: Option<usize>,
    pub token_path: Option<PathBuf>,
}

impl ConfigOverrides {
    pub fn apply(self, config: &mut UploaderConfig) {
        fn set<T>(slot: &mut T, value: Option<T>) {
            if let Some(value) = value {
                *slot = value;
            }
        }

        set(&mut config.watch.directory, self.watch_dir);
        if let Some(dir) = self.relocation_dir {
            config.relocation.directory = Some(dir);
        }
        set(&mut config.relocation.mode, self.relocation_mode);
        if let Some(collection) = self.collection_id {
            config.delivery.collection_id = Some(collection);
        }
        set(&mut config.naming.season_start, self.season_start);
        set(&mut config.delivery.visibility, self.visibility);
        set(&mut config.delivery.description, self.description);
        set(&mut config.delivery.tags, self.tags);
        set(&mut config.delivery.dry_run, self.dry_run);
        set(&mut config.stability.checks, self.stable_checks);
        set(&mut config.stability.interval_ms, self.stable_interval_ms);
        set(&mut config.stability.min_age_seconds, self.min_age_seconds);
        set(&mut config.watch.ignore_patterns, self.ignore_patterns);
        set(&mut config.watch.ignore_extensions, self.ignore_extensions);
        set(&mut config.retry.max_retries, self.max_retries);
        set(&mut config.retry.base_backoff_ms, self.base_backoff_ms);
        set(&mut config.retry.multiplier, self.backoff_multiplier);
        set(&mut config.retry.jitter_max_ms, self.jitter_max_ms);
        set(&mut config.transcode.enabled, self.transcode);
        set(&mut config.transcode.crf, self.crf);
        set(&mut config.transcode.audio_bitrate, self.audio_bitrate);
        if let Some(width) = self.max_width {
            config.transcode.max_width = Some(width);
        }
        if let Some(limit) = self.max_uploads_per_run {
            config.delivery.max_uploads_per_run = Some(limit);
        }
        set(&mut config.delivery.token_path, self.token_path);
    }
}

pub fn load_uploader_config<P: AsRef<Path>>(path: P) -> Result<UploaderConfig> {
    let config: UploaderConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

/// Writes the default document to `path`. Never replaces an existing file.
pub fn write_default_config<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    if path.exists() {
        return Err(ConfigError::AlreadyExists(path.to_path_buf()));
    }
    let content = toml::to_string_pretty(&UploaderConfig::default())?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
            source,
            path: parent.to_path_buf(),
        })?;
    }
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
