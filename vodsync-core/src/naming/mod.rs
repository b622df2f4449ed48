mod sequence;
mod title;

use std::fmt;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use chrono::{Local, NaiveDate, NaiveDateTime};
use regex::Regex;
use tracing::{info, warn};

pub use sequence::{sequence_key, SequenceError, SequenceResult, SequenceStore};
pub use title::{display_title, MAX_TITLE_CHARS};

pub const FALLBACK_CONTEXT: &str = "Unknown";

const SOURCE_SEPARATOR: &str = " - ";
const SOURCE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H-%M-%S";
const ELLIPSIS_MARKER: &str = "...";

/// Timestamp and context label recovered from a recorder file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSource {
    pub timestamp: NaiveDateTime,
    pub context: String,
    /// `true` when the name did not follow the recorder grammar and the
    /// wall-clock time and [`FALLBACK_CONTEXT`] were substituted.
    pub fallback: bool,
}

/// Parses `<timestamp> - <recorder> - <context>...` names.
pub fn extract_context(file_name: &str, now: NaiveDateTime) -> ParsedSource {
    match parse_recorder_name(file_name) {
        Some((timestamp, context)) => ParsedSource {
            timestamp,
            context,
            fallback: false,
        },
        None => {
            warn!(file = file_name, "could not parse recorder file name, using fallback context");
            ParsedSource {
                timestamp: now,
                context: FALLBACK_CONTEXT.to_string(),
                fallback: true,
            }
        }
    }
}

fn parse_recorder_name(file_name: &str) -> Option<(NaiveDateTime, String)> {
    let stem = Path::new(file_name).file_stem()?.to_str()?;
    let mut parts = stem.split(SOURCE_SEPARATOR);
    let timestamp = parts.next()?;
    let _recorder = parts.next()?;
    let context = parts.next()?;
    let timestamp = NaiveDateTime::parse_from_str(timestamp.trim(), SOURCE_TIMESTAMP_FORMAT).ok()?;
    let context = context.replace(ELLIPSIS_MARKER, "").trim().to_string();
    if context.is_empty() {
        return None;
    }
    Some((timestamp, context))
}

/// Week of the season containing `today`, starting at 1.
pub fn week_label(today: NaiveDate, season_start: NaiveDate) -> u32 {
    let days = (today - season_start).num_days();
    let week = days.div_euclid(7) + 1;
    u32::try_from(week.max(1)).unwrap_or(u32::MAX)
}

/// `W<week>_<context>_Pull<seq>_<Mon><dd>_<hh>-<mm><AM|PM>.<ext>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedName {
    pub week: u32,
    pub context: String,
    pub sequence: u64,
    pub date_token: String,
    pub time_token: String,
    /// Without the leading dot; empty when the source had no extension.
    pub extension: String,
}

impl ResolvedName {
    pub fn compose(
        timestamp: NaiveDateTime,
        context: &str,
        sequence: u64,
        season_start: NaiveDate,
        extension: &str,
    ) -> Self {
        Self {
            week: week_label(timestamp.date(), season_start),
            context: context.to_string(),
            sequence,
            date_token: timestamp.format("%b%d").to_string(),
            time_token: timestamp.format("%I-%M%p").to_string(),
            extension: extension.trim_start_matches('.').to_string(),
        }
    }

    pub fn week_label(&self) -> String {
        format!("W{}", self.week)
    }

    pub fn file_name(&self) -> String {
        self.to_string()
    }

    /// Inverse of [`ResolvedName::file_name`]. Context labels may themselves
    /// contain underscores.
    pub fn parse(file_name: &str) -> Option<Self> {
        let captures = resolved_name_regex().captures(file_name)?;
        Some(Self {
            week: captures[1].parse().ok()?,
            context: captures[2].to_string(),
            sequence: captures[3].parse().ok()?,
            date_token: captures[4].to_string(),
            time_token: captures[5].to_string(),
            extension: captures
                .get(6)
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
        })
    }
}

impl fmt::Display for ResolvedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "W{}_{}_Pull{}_{}_{}",
            self.week, self.context, self.sequence, self.date_token, self.time_token
        )?;
        if !self.extension.is_empty() {
            write!(f, ".{}", self.extension)?;
        }
        Ok(())
    }
}

fn resolved_name_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^W(\d+)_(.+)_Pull(\d+)_([A-Z][a-z]{2}\d{2})_(\d{2}-\d{2}[AP]M)(?:\.([A-Za-z0-9]+))?$",
        )
        .expect("valid regex")
    })
}

/// Turns source paths into resolved artifact names, consuming one sequence
/// value per call.
#[derive(Debug, Clone)]
pub struct NameResolver {
    season_start: NaiveDate,
    sequences: Arc<SequenceStore>,
}

impl NameResolver {
    pub fn new(season_start: NaiveDate, sequences: Arc<SequenceStore>) -> Self {
        Self {
            season_start,
            sequences,
        }
    }

    fn parse_source(&self, path: &Path) -> ParsedSource {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        extract_context(&file_name, Local::now().naive_local())
    }

    pub async fn next_sequence(&self, context: &str, date: NaiveDate) -> u64 {
        self.sequences.next_sequence(context, date).await
    }

    async fn assign(&self, source: &ParsedSource, extension: &str) -> ResolvedName {
        let sequence = self
            .next_sequence(&source.context, source.timestamp.date())
            .await;
        ResolvedName::compose(
            source.timestamp,
            &source.context,
            sequence,
            self.season_start,
            extension,
        )
    }

    pub async fn resolve_name(&self, path: &Path) -> ResolvedName {
        let source = self.parse_source(path);
        let extension = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_string())
            .unwrap_or_default();
        let resolved = self.assign(&source, &extension).await;
        info!(
            source = %path.display(),
            resolved = %resolved,
            fallback = source.fallback,
            "resolved artifact name"
        );
        resolved
    }
}
