//! Pure transforms applied to raw metadata-tool output.
//!
//! Everything in this module is a function of its arguments (plus the clock
//! for the missing-upload-date default) so the conversion rules can be tested
//! without spawning the tool.

use chrono::Utc;
use serde::Deserialize;

/// One entry of a yt-dlp `thumbnails` array. All fields are optional because
/// older videos frequently miss width/height or the named id.
#[derive(Debug, Clone, Deserialize)]
pub struct Thumbnail {
    pub id: Option<String>,
    pub url: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
}

/// Renders durations as `H:MM:SS` for an hour or more, `M:SS` otherwise.
/// Zero renders as `0:00`.
pub fn format_duration(seconds: i64) -> String {
    let seconds = seconds.max(0);
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes}:{secs:02}")
    }
}

/// Inverse of [`format_duration`]: parses `M:SS` or `H:MM:SS` back into
/// seconds. Returns `None` for anything else.
pub fn parse_duration_seconds(text: &str) -> Option<i64> {
    let parts: Vec<&str> = text.split(':').collect();
    match parts.len() {
        2 => {
            let minutes: i64 = parts[0].parse().ok()?;
            let seconds: i64 = parts[1].parse().ok()?;
            Some(minutes * 60 + seconds)
        }
        3 => {
            let hours: i64 = parts[0].parse().ok()?;
            let minutes: i64 = parts[1].parse().ok()?;
            let seconds: i64 = parts[2].parse().ok()?;
            Some(hours * 3600 + minutes * 60 + seconds)
        }
        _ => None,
    }
}

/// Picks the best thumbnail URL: the `maxresdefault` entry, else
/// `hqdefault`, else the widest, else the first, else the empty string.
pub fn best_thumbnail(thumbnails: &[Thumbnail]) -> String {
    let by_id = |wanted: &str| {
        thumbnails
            .iter()
            .find(|t| t.id.as_deref() == Some(wanted))
            .and_then(|t| t.url.clone())
    };

    by_id("maxresdefault")
        .or_else(|| by_id("hqdefault"))
        .or_else(|| {
            thumbnails
                .iter()
                .filter(|t| t.url.is_some())
                .max_by_key(|t| t.width.unwrap_or(0))
                .and_then(|t| t.url.clone())
        })
        .or_else(|| thumbnails.first().and_then(|t| t.url.clone()))
        .unwrap_or_default()
}

/// Maps yt-dlp's availability strings onto the values the library stores.
/// Anything unrecognized (or absent) becomes `unknown`.
pub fn normalize_availability(raw: Option<&str>) -> &'static str {
    match raw {
        Some("public") => "public",
        Some("private") | Some("needs_auth") => "private",
        Some("unavailable") | Some("premium_only") | Some("subscriber_only") => "unavailable",
        _ => "unknown",
    }
}

/// Today's date in yt-dlp's `YYYYMMDD` upload-date format, used when a record
/// carries no upload date at all.
pub fn default_upload_date() -> String {
    Utc::now().format("%Y%m%d").to_string()
}
