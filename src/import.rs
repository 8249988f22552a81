//! Playlist import orchestration.
//!
//! An import walks a fixed sequence of phases: validating the URL, fetching
//! playlist metadata, creating the library playlist, fetching per-video
//! metadata, then persisting memberships. Observers receive progress events
//! over a channel; progress never decreases and every import finishes with
//! exactly one terminal event (COMPLETED or FAILED).
//!
//! Two imports of the same source playlist cannot run at once. The second
//! caller gets an immediate error instead of a duplicate library playlist.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::library::{
    MAX_DESCRIPTION_LEN, MAX_TITLE_LEN, NewPlaylist, Playlist, PlaylistKind, PlaylistStore,
};
use crate::url::{extract_playlist_id, is_valid_playlist_url, sanitize_url};
use crate::ytdlp::MetadataTool;

/// Phase of an import, in the order they occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImportPhase {
    Validating,
    FetchingMetadata,
    CreatingPlaylist,
    FetchingVideos,
    Persisting,
    Completed,
    Failed,
}

impl ImportPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn status(self) -> ImportStatus {
        match self {
            Self::Completed => ImportStatus::Completed,
            Self::Failed => ImportStatus::Failed,
            _ => ImportStatus::InProgress,
        }
    }
}

/// Coarse state of an import: still running, or which way it ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImportStatus {
    InProgress,
    Completed,
    Failed,
}

/// One progress update. `progress` is a 0..=100 percentage and never moves
/// backwards within a single import.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportProgressEvent {
    pub phase: ImportPhase,
    pub status: ImportStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playlist_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_video_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_videos: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What a finished import produced.
#[derive(Debug, Clone)]
pub struct ImportOutcome {
    pub playlist: Playlist,
    pub video_count: usize,
}

/// Drives imports end to end: URL validation, the metadata tool, and the
/// playlist store. Shared behind an `Arc` by the API and the CLI.
pub struct ImportOrchestrator {
    store: Arc<PlaylistStore>,
    tool: MetadataTool,
    in_flight: Mutex<HashSet<String>>,
}

impl ImportOrchestrator {
    pub fn new(store: Arc<PlaylistStore>, tool: MetadataTool) -> Self {
        Self {
            store,
            tool,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Imports one playlist, emitting progress events as it goes. On error
    /// the library is left without the half-imported playlist.
    pub async fn import_playlist(
        &self,
        url: &str,
        events: mpsc::UnboundedSender<ImportProgressEvent>,
    ) -> Result<ImportOutcome> {
        let mut emitter = Emitter::new(events);
        emitter.phase(ImportPhase::Validating);

        if !is_valid_playlist_url(url) {
            let err = Error::InvalidUrl(format!("not a playlist URL: {url}"));
            emitter.failed(&err);
            return Err(err);
        }
        let sanitized = sanitize_url(url)?;
        let source_id = extract_playlist_id(&sanitized).unwrap_or_else(|| sanitized.clone());

        if !self.in_flight.lock().insert(source_id.clone()) {
            let err = Error::ImportInProgress(source_id);
            emitter.failed(&err);
            return Err(err);
        }

        let result = self.run_import(&sanitized, &mut emitter).await;
        self.in_flight.lock().remove(&source_id);

        match result {
            Ok(outcome) => {
                emitter.completed(&outcome);
                Ok(outcome)
            }
            Err(err) => {
                emitter.failed(&err);
                Err(err)
            }
        }
    }

    async fn run_import(&self, url: &str, emitter: &mut Emitter) -> Result<ImportOutcome> {
        emitter.phase(ImportPhase::FetchingMetadata);
        let meta = self.tool.fetch_playlist_metadata(url).await?;
        log::info!(
            "importing playlist \"{}\" ({} entries) from {url}",
            meta.title,
            meta.video_count
        );

        emitter.phase(ImportPhase::CreatingPlaylist);
        // Source titles and descriptions can be arbitrarily long; keep what fits.
        let title: String = meta.title.chars().take(MAX_TITLE_LEN).collect();
        let description: String = meta.description.chars().take(MAX_DESCRIPTION_LEN).collect();
        let playlist = self.store.create_playlist(NewPlaylist {
            owner_id: None,
            title,
            description: Some(description).filter(|d| !d.is_empty()),
            kind: PlaylistKind::YoutubeImported,
            thumbnail_url: Some(meta.thumbnail_url.clone()).filter(|t| !t.is_empty()),
        })?;
        emitter.playlist_id = Some(playlist.id.clone());

        emitter.phase(ImportPhase::FetchingVideos);
        let fetched = self
            .tool
            .fetch_playlist_videos(url, |percent, title| {
                emitter.progress(ImportPhase::FetchingVideos, percent, title);
            })
            .await;
        let videos = match fetched {
            Ok(videos) => videos,
            Err(err) => {
                self.discard_playlist(&playlist.id);
                return Err(err);
            }
        };

        emitter.phase(ImportPhase::Persisting);
        let video_count = match self.store.attach_videos(&playlist.id, &videos) {
            Ok(count) => count,
            Err(err) => {
                self.discard_playlist(&playlist.id);
                return Err(err);
            }
        };

        let playlist = self
            .store
            .get_playlist(&playlist.id)?
            .map(|p| p.playlist)
            .ok_or_else(|| Error::NotFound(format!("playlist {}", playlist.id)))?;

        Ok(ImportOutcome {
            playlist,
            video_count,
        })
    }

    /// Best-effort cleanup after a mid-import failure.
    fn discard_playlist(&self, id: &str) {
        if let Err(err) = self.store.delete_playlist(id) {
            log::warn!("failed to discard partial playlist {id}: {err}");
        }
    }

    #[cfg(test)]
    fn mark_in_flight(&self, source_id: &str) {
        self.in_flight.lock().insert(source_id.to_string());
    }
}

/// Wraps the event channel with the monotonic-progress rule and the shared
/// event fields. Send failures mean the observer went away, which is fine.
struct Emitter {
    events: mpsc::UnboundedSender<ImportProgressEvent>,
    last_progress: u8,
    playlist_id: Option<String>,
}

impl Emitter {
    fn new(events: mpsc::UnboundedSender<ImportProgressEvent>) -> Self {
        Self {
            events,
            last_progress: 0,
            playlist_id: None,
        }
    }

    fn phase(&mut self, phase: ImportPhase) {
        let progress = self.last_progress;
        self.emit(phase, progress, None, None, None);
    }

    fn progress(&mut self, phase: ImportPhase, percent: u8, title: &str) {
        self.emit(phase, percent, Some(title.to_string()), None, None);
    }

    fn completed(&mut self, outcome: &ImportOutcome) {
        self.playlist_id = Some(outcome.playlist.id.clone());
        self.emit(
            ImportPhase::Completed,
            100,
            None,
            Some(outcome.video_count),
            None,
        );
    }

    fn failed(&mut self, err: &Error) {
        let progress = self.last_progress;
        self.emit(ImportPhase::Failed, progress, None, None, Some(err.to_string()));
    }

    fn emit(
        &mut self,
        phase: ImportPhase,
        progress: u8,
        current_video_title: Option<String>,
        total_videos: Option<usize>,
        error: Option<String>,
    ) {
        let progress = progress.clamp(self.last_progress, 100);
        self.last_progress = progress;
        let _ = self.events.send(ImportProgressEvent {
            phase,
            status: phase.status(),
            progress,
            playlist_id: self.playlist_id.clone(),
            current_video_title,
            total_videos,
            error,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::{Availability, ListOptions};
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn stub_tool(dir: &Path, script: &str) -> MetadataTool {
        let path = dir.join("yt-dlp-stub");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        MetadataTool::new(path)
    }

    const IMPORT_STUB: &str = r#"#!/bin/bash
for arg in "$@"; do
  if [ "$arg" = "--playlist-items" ]; then
    echo '{"id":"PL123","title":"Road Trip","uploader":"DJ","thumbnails":[{"id":"hqdefault","url":"https://img/hq.jpg"}]}'
    exit 0
  fi
done
for arg in "$@"; do
  if [ "$arg" = "--flat-playlist" ]; then
    echo '{"id":"v1","title":"First","playlist_id":"PL123"}'
    echo '{"id":"v2","title":"Second","playlist_id":"PL123"}'
    exit 0
  fi
done
echo '{"id":"v1","title":"First","uploader":"DJ","duration":213,"view_count":10,"upload_date":"20240101","availability":"public"}'
echo '{"id":"v2","title":"Second","uploader":"DJ","duration":282,"view_count":20,"upload_date":"20240102","availability":"public"}'
"#;

    fn orchestrator(tool: MetadataTool) -> (ImportOrchestrator, Arc<PlaylistStore>) {
        let store = Arc::new(PlaylistStore::open_in_memory().unwrap());
        (ImportOrchestrator::new(store.clone(), tool), store)
    }

    fn drain(
        rx: &mut mpsc::UnboundedReceiver<ImportProgressEvent>,
    ) -> Vec<ImportProgressEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn import_walks_all_phases_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, store) = orchestrator(stub_tool(dir.path(), IMPORT_STUB));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let outcome = orchestrator
            .import_playlist("https://www.youtube.com/playlist?list=PL123", tx)
            .await
            .unwrap();
        assert_eq!(outcome.video_count, 2);
        assert_eq!(outcome.playlist.title, "Road Trip");
        assert_eq!(outcome.playlist.kind, PlaylistKind::YoutubeImported);
        assert_eq!(outcome.playlist.video_count, 2);

        let events = drain(&mut rx);
        assert_eq!(events[0].phase, ImportPhase::Validating);
        let terminal: Vec<_> = events.iter().filter(|e| e.phase.is_terminal()).collect();
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].phase, ImportPhase::Completed);
        assert_eq!(terminal[0].progress, 100);
        assert_eq!(terminal[0].total_videos, Some(2));
        for pair in events.windows(2) {
            assert!(pair[0].progress <= pair[1].progress);
        }

        let stored = store
            .get_playlist(&outcome.playlist.id)
            .unwrap()
            .unwrap();
        assert_eq!(stored.videos.len(), 2);
        assert_eq!(stored.videos[0].id, "v1");
        assert_eq!(stored.videos[0].availability, Availability::Public);
    }

    #[tokio::test]
    async fn invalid_url_fails_before_touching_the_tool() {
        let (orchestrator, store) = orchestrator(MetadataTool::new("/nonexistent/yt-dlp"));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let err = orchestrator
            .import_playlist("https://example.com/?list=PL123", tx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidUrl(_)));

        let events = drain(&mut rx);
        let terminal: Vec<_> = events.iter().filter(|e| e.phase.is_terminal()).collect();
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].phase, ImportPhase::Failed);
        assert!(terminal[0].error.is_some());
        assert!(store.list_playlists(&ListOptions::default()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn tool_failure_leaves_no_partial_playlist() {
        let dir = tempfile::tempdir().unwrap();
        // Metadata succeeds, full video dump fails.
        let tool = stub_tool(
            dir.path(),
            r#"#!/bin/bash
for arg in "$@"; do
  if [ "$arg" = "--playlist-items" ]; then
    echo '{"id":"PL1","title":"Doomed","uploader":"x"}'
    exit 0
  fi
done
for arg in "$@"; do
  if [ "$arg" = "--flat-playlist" ]; then
    echo '{"id":"v1","title":"First"}'
    exit 0
  fi
done
echo 'ERROR: network unreachable' >&2
exit 1
"#,
        );
        let (orchestrator, store) = orchestrator(tool);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let err = orchestrator
            .import_playlist("https://www.youtube.com/playlist?list=PL1", tx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ToolExecution(_)));

        let events = drain(&mut rx);
        assert_eq!(events.last().unwrap().phase, ImportPhase::Failed);
        assert!(store.list_playlists(&ListOptions::default()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_import_of_same_playlist_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, _store) = orchestrator(stub_tool(dir.path(), IMPORT_STUB));
        orchestrator.mark_in_flight("PL123");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let err = orchestrator
            .import_playlist("https://www.youtube.com/playlist?list=PL123", tx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ImportInProgress(_)));
        assert_eq!(drain(&mut rx).last().unwrap().phase, ImportPhase::Failed);
    }

    #[tokio::test]
    async fn empty_playlist_import_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, store) = orchestrator(stub_tool(dir.path(), "#!/bin/bash\nexit 0\n"));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let err = orchestrator
            .import_playlist("https://www.youtube.com/playlist?list=PLempty", tx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmptyPlaylist));
        assert_eq!(drain(&mut rx).last().unwrap().phase, ImportPhase::Failed);
        assert!(store.list_playlists(&ListOptions::default()).unwrap().is_empty());
    }
}
