use std::path::Path;
use std::str::FromStr;

use chrono::Month;

use super::ResolvedName;

/// Upper bound the remote host accepts for a title.
pub const MAX_TITLE_CHARS: usize = 100;

/// Builds the human-readable title for a resolved artifact file name, e.g.
/// `WoW Raid - W53 Foe Pull #1 - September 3 10:16 PM`.
///
/// Names that do not parse fall back to the file stem.
pub fn display_title(file_name: &str, prefix: &str) -> String {
    let title = match ResolvedName::parse(file_name) {
        Some(name) => {
            let body = format!(
                "{} {} Pull #{} - {} {}",
                name.week_label(),
                name.context,
                name.sequence,
                beautify_date(&name.date_token),
                beautify_time(&name.time_token)
            );
            if prefix.trim().is_empty() {
                body
            } else {
                format!("{} - {}", prefix.trim(), body)
            }
        }
        None => Path::new(file_name)
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| file_name.to_string()),
    };
    truncate_chars(&title, MAX_TITLE_CHARS)
}

fn beautify_date(token: &str) -> String {
    let (month, day) = token.split_at(token.len().min(3));
    let month = Month::from_str(month)
        .map(|m| m.name().to_string())
        .unwrap_or_else(|_| month.to_string());
    let day = day
        .parse::<u32>()
        .map(|d| d.to_string())
        .unwrap_or_else(|_| day.to_string());
    format!("{month} {day}")
}

fn beautify_time(token: &str) -> String {
    let (clock, marker) = token.split_at(token.len().saturating_sub(2));
    format!("{} {}", clock.replace('-', ":"), marker)
}

fn truncate_chars(value: &str, max: usize) -> String {
    match value.char_indices().nth(max) {
        Some((index, _)) => value[..index].trim_end().to_string(),
        None => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_resolved_name() {
        assert_eq!(
            display_title("W53_Foe_Pull1_Sep03_10-16PM.mp4", "WoW Raid"),
            "WoW Raid - W53 Foe Pull #1 - September 3 10:16 PM"
        );
        assert_eq!(
            display_title("W2_Gally_Pull12_Oct15_02-30AM.mp4", ""),
            "W2 Gally Pull #12 - October 15 02:30 AM"
        );
    }

    #[test]
    fn context_with_underscores_is_preserved() {
        assert_eq!(
            display_title("W1_Mug_Zee_Pull3_Mar07_11-05PM.mp4", "Raid"),
            "Raid - W1 Mug_Zee Pull #3 - March 7 11:05 PM"
        );
    }

    #[test]
    fn unparsable_names_fall_back_to_stem() {
        assert_eq!(display_title("session recap.mp4", "Raid"), "session recap");
    }

    #[test]
    fn long_titles_are_truncated() {
        let context = "X".repeat(150);
        let file_name = format!("W1_{context}_Pull1_Sep03_10-16PM.mp4");
        let title = display_title(&file_name, "Raid");
        assert_eq!(title.chars().count(), MAX_TITLE_CHARS);
        assert!(title.starts_with("Raid - W1 XXX"));
    }
}
