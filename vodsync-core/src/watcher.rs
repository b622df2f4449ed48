use std::path::{Path, PathBuf};

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use glob::{MatchOptions, Pattern};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::WatchSection;
use crate::naming::ResolvedName;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watch directory {0} does not exist")]
    MissingDirectory(PathBuf),
    #[error("filesystem watcher error: {0}")]
    Notify(#[from] notify::Error),
}

pub type WatchResult<T> = Result<T, WatchError>;

const IGNORE_MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Created(PathBuf),
    /// Carries the destination of the rename.
    Renamed(PathBuf),
}

impl WatchEvent {
    pub fn path(&self) -> &Path {
        match self {
            WatchEvent::Created(path) | WatchEvent::Renamed(path) => path,
        }
    }
}

/// Only creations and rename destinations are candidates.
///
/// A rename inside the watched directory arrives as `From`, `To` and a
/// combined `Both`; only `To` is mapped so each rename yields one event.
pub fn map_notify_event(event: Event) -> Vec<WatchEvent> {
    match event.kind {
        EventKind::Create(_) => event.paths.into_iter().map(WatchEvent::Created).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            event.paths.into_iter().map(WatchEvent::Renamed).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Any)) => event
            .paths
            .into_iter()
            .filter(|path| path.exists())
            .map(WatchEvent::Renamed)
            .collect(),
        _ => Vec::new(),
    }
}

/// Decides which paths start a pipeline.
#[derive(Debug, Clone)]
pub struct EventFilter {
    extensions: Vec<String>,
    ignore_extensions: Vec<String>,
    ignore_patterns: Vec<Pattern>,
    backup_suffix: String,
}

impl EventFilter {
    pub fn from_config(section: &WatchSection) -> Self {
        let ignore_patterns = section
            .ignore_patterns
            .iter()
            .filter_map(|pattern| match Pattern::new(pattern) {
                Ok(compiled) => Some(compiled),
                Err(err) => {
                    warn!(pattern = %pattern, error = %err, "ignoring invalid ignore pattern");
                    None
                }
            })
            .collect();
        Self {
            extensions: normalize_extensions(&section.extensions),
            ignore_extensions: normalize_extensions(&section.ignore_extensions),
            ignore_patterns,
            backup_suffix: section.backup_suffix.to_lowercase(),
        }
    }

    pub fn admits(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            return false;
        };
        let lowered = name.to_lowercase();
        if !self.extensions.iter().any(|ext| lowered.ends_with(ext.as_str())) {
            return false;
        }
        if self
            .ignore_extensions
            .iter()
            .any(|ext| lowered.ends_with(ext.as_str()))
        {
            debug!(path = %path.display(), "ignored by extension");
            return false;
        }
        if !self.backup_suffix.is_empty() && lowered.ends_with(&self.backup_suffix) {
            return false;
        }
        if self
            .ignore_patterns
            .iter()
            .any(|pattern| pattern.matches_with(name, IGNORE_MATCH_OPTIONS))
        {
            debug!(path = %path.display(), "ignored by pattern");
            return false;
        }
        if path.is_dir() {
            return false;
        }
        if ResolvedName::parse(name).is_some() {
            debug!(path = %path.display(), "already carries a resolved name");
            return false;
        }
        true
    }
}

fn normalize_extensions(extensions: &[String]) -> Vec<String> {
    extensions
        .iter()
        .map(|ext| ext.trim().to_lowercase())
        .filter(|ext| !ext.is_empty())
        .map(|ext| {
            if ext.starts_with('.') {
                ext
            } else {
                format!(".{ext}")
            }
        })
        .collect()
}

/// Watches `directory` non-recursively. The returned watcher must be kept
/// alive for events to keep flowing.
pub fn watch_directory(
    directory: &Path,
) -> WatchResult<(RecommendedWatcher, mpsc::UnboundedReceiver<WatchEvent>)> {
    if !directory.is_dir() {
        return Err(WatchError::MissingDirectory(directory.to_path_buf()));
    }
    let (tx, rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
        match result {
            Ok(event) => {
                for mapped in map_notify_event(event) {
                    if tx.send(mapped).is_err() {
                        return;
                    }
                }
            }
            Err(err) => warn!(error = %err, "filesystem watcher reported an error"),
        }
    })?;
    watcher.watch(directory, RecursiveMode::NonRecursive)?;
    info!(directory = %directory.display(), "watching for recordings");
    Ok((watcher, rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::CreateKind;
    use tempfile::tempdir;

    fn filter() -> EventFilter {
        EventFilter::from_config(&WatchSection {
            extensions: vec!["MP4".into()],
            ignore_patterns: vec!["*draft*".into(), "temp_??.mp4".into()],
            ignore_extensions: vec![".part.mp4".into()],
            ..WatchSection::default()
        })
    }

    #[test]
    fn admits_recordings_case_insensitively() {
        let filter = filter();
        assert!(filter.admits(Path::new("/rec/2025-09-03 22-16-58 - Rec - Foe....mp4")));
        assert!(filter.admits(Path::new("/rec/CLIP.MP4")));
        assert!(!filter.admits(Path::new("/rec/clip.mkv")));
    }

    #[test]
    fn rejects_ignored_and_derived_names() {
        let filter = filter();
        assert!(!filter.admits(Path::new("/rec/My DRAFT clip.mp4")));
        assert!(!filter.admits(Path::new("/rec/temp_01.mp4")));
        assert!(!filter.admits(Path::new("/rec/clip.part.mp4")));
        assert!(!filter.admits(Path::new("/rec/clip.mp4.backup")));
        assert!(!filter.admits(Path::new("/rec/W53_Foe_Pull1_Sep03_10-16PM.mp4")));
    }

    #[test]
    fn rejects_directories() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("folder.mp4");
        std::fs::create_dir(&nested).unwrap();
        assert!(!filter().admits(&nested));
    }

    #[test]
    fn ignore_patterns_support_character_classes() {
        let filter = EventFilter::from_config(&WatchSection {
            extensions: vec!["mp4".into()],
            ignore_patterns: vec!["take[0-9].mp4".into(), "a.b*".into()],
            ..WatchSection::default()
        });
        assert!(!filter.admits(Path::new("/rec/TAKE3.mp4")));
        assert!(filter.admits(Path::new("/rec/takeX.mp4")));
        assert!(!filter.admits(Path::new("/rec/A.Bcd.mp4")));
        assert!(filter.admits(Path::new("/rec/axbcd.mp4")));
    }

    #[test]
    fn invalid_ignore_pattern_is_skipped() {
        let filter = EventFilter::from_config(&WatchSection {
            extensions: vec!["mp4".into()],
            ignore_patterns: vec!["[unclosed".into()],
            ..WatchSection::default()
        });
        assert!(filter.admits(Path::new("/rec/[unclosed.mp4")));
    }

    #[test]
    fn maps_creations() {
        let created = Event::new(EventKind::Create(CreateKind::File)).add_path("/rec/a.mp4".into());
        assert_eq!(
            map_notify_event(created),
            vec![WatchEvent::Created("/rec/a.mp4".into())]
        );
    }

    #[test]
    fn rename_inside_directory_yields_one_event() {
        let from = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::From)))
            .add_path("/rec/a.mp4.backup".into());
        let to = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::To)))
            .add_path("/rec/a.mp4".into());
        let both = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path("/rec/a.mp4.backup".into())
            .add_path("/rec/a.mp4".into());
        let mapped: Vec<WatchEvent> = [from, to, both]
            .into_iter()
            .flat_map(map_notify_event)
            .collect();
        assert_eq!(mapped, vec![WatchEvent::Renamed("/rec/a.mp4".into())]);
    }

    #[test]
    fn removals_are_ignored() {
        let removed = Event::new(EventKind::Remove(notify::event::RemoveKind::File))
            .add_path("/rec/a.mp4".into());
        assert!(map_notify_event(removed).is_empty());
    }

    #[test]
    fn missing_directory_is_reported() {
        let dir = tempdir().unwrap();
        let err = watch_directory(&dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, WatchError::MissingDirectory(_)));
    }
}
