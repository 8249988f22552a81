//! Typed errors shared by the tubelib library and binaries.
//!
//! The API boundary maps these onto HTTP statuses, so every variant here is a
//! distinct user-visible failure mode rather than an internal detail. Raw
//! yt-dlp stderr is rewritten into friendlier text for the handful of cases
//! we can recognize by substring.

use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or non-playlist URL; user-correctable.
    #[error("invalid playlist URL: {0}")]
    InvalidUrl(String),

    /// The metadata tool exceeded its deadline. Retryable by the caller,
    /// never retried automatically.
    #[error("metadata tool timed out after {0}s")]
    ToolTimeout(u64),

    /// Nonzero exit or unexpected stderr from the metadata tool.
    #[error("metadata tool failed: {0}")]
    ToolExecution(String),

    /// The tool produced zero parseable playlist entries.
    #[error("playlist contains no entries")]
    EmptyPlaylist,

    /// Bad input to create/update (empty or over-long title/description).
    #[error("{0}")]
    Validation(String),

    /// Case-insensitive title collision for the same owner.
    #[error("a playlist titled \"{0}\" already exists")]
    DuplicateTitle(String),

    /// The video is already a member of the playlist.
    #[error("video {video_id} is already in playlist {playlist_id}")]
    DuplicateMembership {
        playlist_id: String,
        video_id: String,
    },

    /// The video is not a member of the playlist.
    #[error("video {video_id} is not in playlist {playlist_id}")]
    MembershipNotFound {
        playlist_id: String,
        video_id: String,
    },

    /// A reorder request that is not a valid permutation of the playlist.
    #[error("invalid order assignment: {0}")]
    InvalidOrder(String),

    /// Playlist (or referenced video) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An import for the same source playlist is already running.
    #[error("an import is already running for playlist {0}")]
    ImportInProgress(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl Error {
    /// Wraps a raw tool error, substituting a friendlier message for the
    /// failure texts yt-dlp is known to emit for private/removed content.
    pub fn tool_failure(raw: impl AsRef<str>) -> Self {
        let raw = raw.as_ref().trim();
        if raw.contains("Private video") {
            return Self::ToolExecution(
                "this playlist contains a private video or is itself private".to_string(),
            );
        }
        if raw.contains("does not exist") || raw.contains("This playlist is unavailable") {
            return Self::ToolExecution(
                "the playlist was deleted or is unavailable".to_string(),
            );
        }
        if raw.is_empty() {
            return Self::ToolExecution("unknown tool error".to_string());
        }
        Self::ToolExecution(raw.to_string())
    }
}
