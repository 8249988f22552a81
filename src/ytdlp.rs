//! Wrapper around the yt-dlp binary.
//!
//! Every invocation goes through [`MetadataTool::run_tool`], which spawns the
//! binary directly with an argument vector (never through a shell), enforces
//! a wall-clock deadline, and caps how many bytes of output it will buffer.
//! A process that outlives its deadline is killed, not abandoned.
//!
//! Playlist listings come back as NDJSON, one JSON object per line. Lines
//! that fail to parse are logged and skipped so one broken entry never sinks
//! a whole import.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::library::{Availability, Video};
use crate::normalize::{
    Thumbnail, best_thumbnail, default_upload_date, format_duration, normalize_availability,
};
use crate::url::extract_playlist_id;

const FLAT_LIST_TIMEOUT: Duration = Duration::from_secs(30);
const HEADER_TIMEOUT: Duration = Duration::from_secs(15);
const QUALITIES_TIMEOUT: Duration = Duration::from_secs(15);
const VERSION_TIMEOUT: Duration = Duration::from_secs(5);
const UPDATE_TIMEOUT: Duration = Duration::from_secs(60);

const FLAT_LIST_MAX_OUTPUT: usize = 10 * 1024 * 1024;
const HEADER_MAX_OUTPUT: usize = 5 * 1024 * 1024;
const FULL_LIST_MAX_OUTPUT: usize = 50 * 1024 * 1024;
const STDERR_MAX_OUTPUT: usize = 256 * 1024;

/// Per-batch-of-ten allowance when dumping full video metadata. Large
/// playlists get proportionally more time.
const FULL_LIST_TIMEOUT_PER_BATCH: Duration = Duration::from_secs(60);

/// Summary of a playlist fetched without enumerating full video metadata.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistMetadata {
    pub id: String,
    pub title: String,
    pub description: String,
    pub uploader: String,
    pub uploader_url: String,
    pub video_count: i64,
    pub thumbnail_url: String,
    pub availability: Availability,
}

/// One playable MP4 rendition of a video.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoQuality {
    pub quality: String,
    pub format_id: String,
    pub ext: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesize: Option<i64>,
}

/// Result of probing the tool binary itself.
#[derive(Debug, Clone, Serialize)]
pub struct ToolStatus {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of asking the tool to self-update.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateOutcome {
    pub success: bool,
    pub message: String,
}

/// One line of `--dump-json` output, flat or full. Everything is optional
/// because deleted and private entries come back with most fields null.
#[derive(Debug, Deserialize)]
struct RawEntry {
    id: Option<String>,
    title: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
    duration: Option<f64>,
    view_count: Option<i64>,
    upload_date: Option<String>,
    #[serde(default)]
    thumbnails: Vec<Thumbnail>,
    availability: Option<String>,
    playlist_id: Option<String>,
    playlist_title: Option<String>,
    playlist_uploader: Option<String>,
}

/// `--dump-single-json --playlist-items 0` payload: playlist-level fields
/// only, no entries.
#[derive(Debug, Deserialize)]
struct RawHeader {
    id: Option<String>,
    title: Option<String>,
    description: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
    uploader_url: Option<String>,
    channel_url: Option<String>,
    #[serde(default)]
    thumbnails: Vec<Thumbnail>,
    availability: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawFormats {
    #[serde(default)]
    formats: Vec<RawFormat>,
}

#[derive(Debug, Deserialize)]
struct RawFormat {
    format_id: Option<String>,
    ext: Option<String>,
    vcodec: Option<String>,
    height: Option<i64>,
    filesize: Option<i64>,
}

/// Handle on a yt-dlp binary. Cheap to clone; holds no process state.
#[derive(Debug, Clone)]
pub struct MetadataTool {
    binary: PathBuf,
}

impl MetadataTool {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Fetches playlist-level metadata without downloading per-video details.
    ///
    /// Two invocations: a flat listing to count entries, then a header fetch
    /// for the playlist's own title/uploader/thumbnail. The header fetch is
    /// best-effort; when it fails the flat entries' playlist fields fill in.
    pub async fn fetch_playlist_metadata(&self, url: &str) -> Result<PlaylistMetadata> {
        let entries = self.flat_entries(url).await?;
        if entries.is_empty() {
            return Err(Error::EmptyPlaylist);
        }

        let header = match self
            .run_tool(
                &["--dump-single-json", "--playlist-items", "0", "--no-warnings", url],
                HEADER_TIMEOUT,
                HEADER_MAX_OUTPUT,
            )
            .await
        {
            Ok(output) => serde_json::from_str::<RawHeader>(output.stdout.trim()).ok(),
            Err(err) => {
                log::warn!("playlist header fetch failed, using flat metadata: {err}");
                None
            }
        };

        let first = &entries[0];
        let title = header
            .as_ref()
            .and_then(|h| h.title.clone())
            .or_else(|| first.playlist_title.clone())
            .unwrap_or_else(|| "Unknown Playlist".to_string());
        let description = header
            .as_ref()
            .and_then(|h| h.description.clone())
            .unwrap_or_default();
        let uploader = header
            .as_ref()
            .and_then(|h| h.uploader.clone().or_else(|| h.channel.clone()))
            .or_else(|| first.playlist_uploader.clone())
            .unwrap_or_else(|| "Unknown".to_string());
        let uploader_url = header
            .as_ref()
            .and_then(|h| h.uploader_url.clone().or_else(|| h.channel_url.clone()))
            .unwrap_or_default();
        let id = header
            .as_ref()
            .and_then(|h| h.id.clone())
            .or_else(|| first.playlist_id.clone())
            .or_else(|| extract_playlist_id(url))
            .unwrap_or_default();
        let thumbnail_url = header
            .as_ref()
            .map(|h| best_thumbnail(&h.thumbnails))
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| best_thumbnail(&first.thumbnails));
        let availability = header
            .as_ref()
            .and_then(|h| h.availability.as_deref())
            .map(|raw| Availability::parse(normalize_availability(Some(raw))))
            .unwrap_or(Availability::Unknown);

        Ok(PlaylistMetadata {
            id,
            title,
            description,
            uploader,
            uploader_url,
            video_count: entries.len() as i64,
            thumbnail_url,
            availability,
        })
    }

    /// Fetches full metadata for every video in the playlist.
    ///
    /// `on_progress` is called once per successfully parsed entry with a
    /// 0..=100 percentage (of parsed entries) and the entry's title, so the
    /// final callback always reports 100. Malformed lines are logged and
    /// skipped; they never trigger a callback.
    pub async fn fetch_playlist_videos(
        &self,
        url: &str,
        mut on_progress: impl FnMut(u8, &str),
    ) -> Result<Vec<Video>> {
        let expected = self.flat_entries(url).await?.len();
        if expected == 0 {
            return Err(Error::EmptyPlaylist);
        }

        let batches = (expected as u64).div_ceil(10).max(1);
        let timeout = FULL_LIST_TIMEOUT_PER_BATCH * batches as u32;
        let output = self
            .run_tool(
                &["--dump-json", "--no-warnings", url],
                timeout,
                FULL_LIST_MAX_OUTPUT,
            )
            .await?;

        let mut videos = Vec::new();
        for line in output.stdout.lines().filter(|line| !line.trim().is_empty()) {
            let entry: RawEntry = match serde_json::from_str(line) {
                Ok(entry) => entry,
                Err(err) => {
                    log::warn!("skipping unparseable playlist entry: {err}");
                    continue;
                }
            };
            let Some(video) = video_from_entry(entry) else {
                log::warn!("skipping playlist entry without a video id");
                continue;
            };
            videos.push(video);
        }

        if videos.is_empty() {
            return Err(Error::EmptyPlaylist);
        }
        let total = videos.len();
        for (index, video) in videos.iter().enumerate() {
            let percent = ((index + 1) as f64 * 100.0 / total as f64).round() as u8;
            on_progress(percent, &video.title);
        }
        Ok(videos)
    }

    /// Lists the MP4 renditions available for one video, best first. Errors
    /// are swallowed into an empty list; quality probing is advisory.
    pub async fn fetch_video_qualities(&self, video_id: &str) -> Vec<VideoQuality> {
        let url = format!("https://www.youtube.com/watch?v={video_id}");
        let output = match self
            .run_tool(
                &["--dump-single-json", "--no-warnings", &url],
                QUALITIES_TIMEOUT,
                HEADER_MAX_OUTPUT,
            )
            .await
        {
            Ok(output) => output,
            Err(err) => {
                log::warn!("quality probe for {video_id} failed: {err}");
                return Vec::new();
            }
        };
        let parsed: RawFormats = match serde_json::from_str(output.stdout.trim()) {
            Ok(parsed) => parsed,
            Err(err) => {
                log::warn!("quality probe for {video_id} returned bad JSON: {err}");
                return Vec::new();
            }
        };

        let mut qualities: Vec<(i64, VideoQuality)> = parsed
            .formats
            .into_iter()
            .filter(|f| f.vcodec.as_deref().is_some_and(|v| v != "none"))
            .filter(|f| f.ext.as_deref() == Some("mp4"))
            .filter_map(|f| {
                let height = f.height?;
                Some((
                    height,
                    VideoQuality {
                        quality: format!("{height}p"),
                        format_id: f.format_id.unwrap_or_default(),
                        ext: "mp4".to_string(),
                        filesize: f.filesize,
                    },
                ))
            })
            .collect();
        qualities.sort_by(|a, b| b.0.cmp(&a.0));
        qualities.dedup_by_key(|(height, _)| *height);
        qualities.into_iter().map(|(_, q)| q).collect()
    }

    /// Checks whether the binary runs at all and reports its version.
    pub async fn check_availability(&self) -> ToolStatus {
        match self
            .run_tool(&["--version"], VERSION_TIMEOUT, 4096)
            .await
        {
            Ok(output) => ToolStatus {
                available: true,
                version: Some(output.stdout.trim().to_string()),
                error: None,
            },
            Err(err) => ToolStatus {
                available: false,
                version: None,
                error: Some(err.to_string()),
            },
        }
    }

    /// Asks the tool to update itself. Failures are reported in the outcome,
    /// never as an error; an out-of-date tool still works.
    pub async fn self_update(&self) -> UpdateOutcome {
        match self.run_tool(&["-U"], UPDATE_TIMEOUT, 64 * 1024).await {
            Ok(output) => UpdateOutcome {
                success: true,
                message: output.stdout.trim().to_string(),
            },
            Err(err) => UpdateOutcome {
                success: false,
                message: err.to_string(),
            },
        }
    }

    async fn flat_entries(&self, url: &str) -> Result<Vec<RawEntry>> {
        let output = self
            .run_tool(
                &["--flat-playlist", "--dump-json", "--no-warnings", url],
                FLAT_LIST_TIMEOUT,
                FLAT_LIST_MAX_OUTPUT,
            )
            .await?;

        if output.stdout.trim().is_empty() && !stderr_is_noise(&output.stderr) {
            return Err(Error::tool_failure(&output.stderr));
        }

        let mut entries = Vec::new();
        for line in output.stdout.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<RawEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(err) => log::warn!("skipping unparseable flat entry: {err}"),
            }
        }
        Ok(entries)
    }

    /// Spawns the binary with the given arguments, enforcing a wall-clock
    /// deadline and output caps. On timeout the child is killed and reaped.
    async fn run_tool(
        &self,
        args: &[&str],
        timeout: Duration,
        max_output: usize,
    ) -> Result<ToolOutput> {
        log::debug!("running {} {}", self.binary.display(), args.join(" "));
        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                Error::ToolExecution(format!(
                    "failed to launch {}: {err}",
                    self.binary.display()
                ))
            })?;

        // The pipes are always piped above, so take() cannot return None.
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();

        let run = async {
            let (stdout, stderr) = tokio::join!(
                read_capped(stdout_pipe, max_output),
                read_capped(stderr_pipe, STDERR_MAX_OUTPUT),
            );
            let status = child.wait().await;
            (stdout, stderr, status)
        };

        let outcome = tokio::time::timeout(timeout, run).await;
        let (stdout, stderr, status) = match outcome {
            Ok(done) => done,
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(Error::ToolTimeout(timeout.as_secs()));
            }
        };

        let stdout = match stdout {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(err) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(err);
            }
        };
        let stderr = String::from_utf8_lossy(&stderr.unwrap_or_default()).into_owned();
        let status = status?;

        if !status.success() {
            return Err(Error::tool_failure(&stderr));
        }
        Ok(ToolOutput { stdout, stderr })
    }
}

#[derive(Debug)]
struct ToolOutput {
    stdout: String,
    stderr: String,
}

async fn read_capped<R: AsyncRead + Unpin>(reader: Option<R>, cap: usize) -> Result<Vec<u8>> {
    let Some(mut reader) = reader else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    let mut buf = [0u8; 16 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(out);
        }
        if out.len() + n > cap {
            return Err(Error::ToolExecution(format!(
                "tool output exceeded {cap} bytes"
            )));
        }
        out.extend_from_slice(&buf[..n]);
    }
}

/// Stderr consisting only of WARNING lines does not indicate failure.
fn stderr_is_noise(stderr: &str) -> bool {
    stderr
        .lines()
        .filter(|line| !line.trim().is_empty())
        .all(|line| line.contains("WARNING"))
}

/// Builds a library [`Video`] from one NDJSON entry, applying the defaults
/// for fields the source omits. Entries without an id are unusable.
fn video_from_entry(entry: RawEntry) -> Option<Video> {
    let id = entry.id?;
    let duration_seconds = entry.duration.map(|d| d as i64).unwrap_or(0).max(0);
    let thumbnail_url = {
        let best = best_thumbnail(&entry.thumbnails);
        if best.is_empty() {
            format!("https://i.ytimg.com/vi/{id}/hqdefault.jpg")
        } else {
            best
        }
    };
    Some(Video {
        title: entry.title.unwrap_or_else(|| "Untitled".to_string()),
        channel_name: entry
            .uploader
            .or(entry.channel)
            .unwrap_or_else(|| "Unknown".to_string()),
        duration_seconds,
        duration: format_duration(duration_seconds),
        view_count: entry.view_count.unwrap_or(0),
        upload_date: entry
            .upload_date
            .filter(|d| !d.is_empty())
            .unwrap_or_else(default_upload_date),
        thumbnail_url,
        availability: Availability::parse(normalize_availability(
            entry.availability.as_deref(),
        )),
        created_at: String::new(),
        updated_at: String::new(),
        id,
    })
}
