//! Playlist library persistence layer.
//!
//! All structs in this module mirror how playlists and videos are serialized
//! to disk and exposed to the API. The SQLite layout keeps videos in a single
//! shared table; a playlist only ever owns membership rows, so one video can
//! sit in any number of playlists without duplication. Membership positions
//! are a dense zero-based sequence per playlist and every mutating operation
//! here leaves that sequence contiguous.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::normalize::format_duration;

/// Owner recorded for playlists created without an explicit owner. The
/// library is single-user today but the schema keeps the column so imports
/// from multiple accounts stay distinguishable.
pub const DEFAULT_OWNER: &str = "local";

pub const MAX_TITLE_LEN: usize = 255;
pub const MAX_DESCRIPTION_LEN: usize = 1000;

/// How a playlist came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaylistKind {
    Custom,
    YoutubeImported,
}

impl PlaylistKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Custom => "custom",
            Self::YoutubeImported => "youtube_imported",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "youtube_imported" => Self::YoutubeImported,
            _ => Self::Custom,
        }
    }
}

/// Source-side availability of a video, refreshed on import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Public,
    Private,
    Unavailable,
    Unknown,
}

impl Availability {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
            Self::Unavailable => "unavailable",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "public" => Self::Public,
            "private" => Self::Private,
            "unavailable" => Self::Unavailable,
            _ => Self::Unknown,
        }
    }
}

/// Rows stored in the `playlists` table. `video_count` is derived from the
/// membership table on every read, never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Playlist {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(rename = "type")]
    pub kind: PlaylistKind,
    pub video_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_health_check_at: Option<String>,
}

/// Rows stored in the `videos` table. `duration` is derived from
/// `duration_seconds` on read so the two can never disagree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Video {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub channel_name: String,
    pub duration_seconds: i64,
    pub duration: String,
    pub view_count: i64,
    pub upload_date: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub thumbnail_url: String,
    #[serde(rename = "availabilityStatus")]
    pub availability: Availability,
    pub created_at: String,
    pub updated_at: String,
}

/// A playlist together with its member videos in membership order.
#[derive(Debug, Clone, Serialize)]
pub struct PlaylistWithVideos {
    pub playlist: Playlist,
    pub videos: Vec<Video>,
}

/// Input for [`PlaylistStore::create_playlist`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPlaylist {
    #[serde(default)]
    pub owner_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub kind: PlaylistKind,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
}

/// Partial update for [`PlaylistStore::update_playlist`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistUpdate {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

impl Default for SortOrder {
    fn default() -> Self {
        Self::Asc
    }
}

/// Filter/sort/page options for [`PlaylistStore::list_playlists`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListOptions {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<PlaylistKind>,
    #[serde(default)]
    pub sort_by: Option<String>,
    #[serde(default)]
    pub sort_order: Option<SortOrder>,
    #[serde(default)]
    pub offset: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Options for [`PlaylistStore::search_videos_in_playlist`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoSearch {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub sort_by: Option<String>,
    #[serde(default)]
    pub sort_order: Option<SortOrder>,
}

/// One entry of a full reorder request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoOrder {
    pub video_id: String,
    pub order: usize,
}

/// Aggregate numbers for a single playlist.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistStats {
    pub total_videos: i64,
    pub total_duration: String,
    pub total_views: i64,
    pub last_updated: String,
}

/// Wrapper around the SQLite connection that performs all playlist/video
/// operations. The single mutex serializes mutations store-wide, which keeps
/// one playlist's membership order from ever being torn by a concurrent
/// writer.
pub struct PlaylistStore {
    conn: Mutex<Connection>,
}

const PLAYLIST_SELECT: &str = "
    SELECT p.id, p.owner_id, p.title, p.description, p.kind, p.thumbnail_url,
           p.created_at, p.updated_at, p.last_health_check_at,
           (SELECT COUNT(*) FROM playlist_videos pv WHERE pv.playlist_id = p.id) AS video_count
    FROM playlists p
";

const VIDEO_COLUMNS: &str = "
    v.id, v.title, v.channel_name, v.duration_seconds, v.view_count,
    v.upload_date, v.thumbnail_url, v.availability, v.created_at, v.updated_at
";

impl PlaylistStore {
    /// Opens (and if necessary creates) the SQLite DB and ensures the
    /// expected schema exists. WAL mode is enabled to avoid readers blocking
    /// writers.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    /// In-memory store, used by tests and by the CLI's dry runs.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let mut conn = conn;
        Self::ensure_tables(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Runs the SQL required to create the tables if they do not already
    /// exist. Wrapped in a transaction so a failure leaves the DB untouched.
    fn ensure_tables(conn: &mut Connection) -> Result<()> {
        let tx = conn.transaction()?;
        tx.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS playlists (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                kind TEXT NOT NULL,
                thumbnail_url TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_health_check_at TEXT
            );

            CREATE TABLE IF NOT EXISTS videos (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                channel_name TEXT NOT NULL DEFAULT '',
                duration_seconds INTEGER NOT NULL DEFAULT 0,
                view_count INTEGER NOT NULL DEFAULT 0,
                upload_date TEXT NOT NULL DEFAULT '',
                thumbnail_url TEXT NOT NULL DEFAULT '',
                availability TEXT NOT NULL DEFAULT 'unknown',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS playlist_videos (
                playlist_id TEXT NOT NULL,
                video_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                PRIMARY KEY (playlist_id, video_id),
                FOREIGN KEY (playlist_id) REFERENCES playlists(id) ON DELETE CASCADE,
                FOREIGN KEY (video_id) REFERENCES videos(id)
            );

            CREATE INDEX IF NOT EXISTS idx_playlist_videos_position
                ON playlist_videos(playlist_id, position);
            "#,
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Lists playlists with optional substring filter (title/description,
    /// case-insensitive), kind filter, field sort, and offset/limit paging.
    pub fn list_playlists(&self, options: &ListOptions) -> Result<Vec<Playlist>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{PLAYLIST_SELECT} ORDER BY p.created_at ASC"))?;
        let mut rows = stmt.query([])?;
        let mut playlists = Vec::new();
        while let Some(row) = rows.next()? {
            playlists.push(row_to_playlist(row)?);
        }
        drop(rows);
        drop(stmt);
        drop(conn);

        if let Some(query) = options.query.as_deref().filter(|q| !q.is_empty()) {
            let needle = query.to_lowercase();
            playlists.retain(|p| {
                p.title.to_lowercase().contains(&needle)
                    || p.description.to_lowercase().contains(&needle)
            });
        }
        if let Some(kind) = options.kind {
            playlists.retain(|p| p.kind == kind);
        }

        if let Some(key) = options.sort_by.as_deref()
            && sort_playlists(&mut playlists, key)
            && options.sort_order == Some(SortOrder::Desc)
        {
            playlists.reverse();
        }

        let offset = options.offset.unwrap_or(0).min(playlists.len());
        let mut playlists = playlists.split_off(offset);
        if let Some(limit) = options.limit {
            playlists.truncate(limit);
        }
        Ok(playlists)
    }

    /// Fetches one playlist together with its videos in membership order.
    pub fn get_playlist(&self, id: &str) -> Result<Option<PlaylistWithVideos>> {
        let conn = self.conn.lock();
        let playlist = match fetch_playlist(&conn, id)? {
            Some(playlist) => playlist,
            None => return Ok(None),
        };
        let videos = member_videos(&conn, id)?;
        Ok(Some(PlaylistWithVideos { playlist, videos }))
    }

    /// Creates a playlist. Titles are stored trimmed and must be unique per
    /// owner, case-insensitively, among existing playlists.
    pub fn create_playlist(&self, input: NewPlaylist) -> Result<Playlist> {
        let title = input.title.trim().to_string();
        let description = input.description.unwrap_or_default();
        validate_title(&title)?;
        validate_description(&description)?;
        let owner = input.owner_id.unwrap_or_else(|| DEFAULT_OWNER.to_string());

        let conn = self.conn.lock();
        if title_taken(&conn, &owner, &title, None)? {
            return Err(Error::DuplicateTitle(title));
        }

        let id = next_playlist_id();
        let now = now();
        conn.execute(
            "INSERT INTO playlists (id, owner_id, title, description, kind, thumbnail_url,
                                    created_at, updated_at, last_health_check_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, NULL)",
            params![
                id,
                owner,
                title,
                description,
                input.kind.as_str(),
                input.thumbnail_url,
                now,
            ],
        )?;

        fetch_playlist(&conn, &id)?.ok_or_else(|| Error::NotFound(id))
    }

    /// Renames and/or re-describes a playlist, with the same validation as
    /// create. A rename collides only with other playlists of the same owner.
    pub fn update_playlist(&self, id: &str, update: PlaylistUpdate) -> Result<Playlist> {
        let conn = self.conn.lock();
        let existing = fetch_playlist(&conn, id)?
            .ok_or_else(|| Error::NotFound(format!("playlist {id}")))?;

        let title = match update.title {
            Some(title) => {
                let title = title.trim().to_string();
                validate_title(&title)?;
                if title_taken(&conn, &existing.owner_id, &title, Some(id))? {
                    return Err(Error::DuplicateTitle(title));
                }
                title
            }
            None => existing.title,
        };
        let description = match update.description {
            Some(description) => {
                validate_description(&description)?;
                description
            }
            None => existing.description,
        };

        conn.execute(
            "UPDATE playlists SET title = ?1, description = ?2, updated_at = ?3 WHERE id = ?4",
            params![title, description, now(), id],
        )?;
        fetch_playlist(&conn, id)?.ok_or_else(|| Error::NotFound(format!("playlist {id}")))
    }

    /// Deletes a playlist and its membership rows. Member videos stay in the
    /// shared table because other playlists may still reference them.
    pub fn delete_playlist(&self, id: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM playlist_videos WHERE playlist_id = ?1", [id])?;
        let deleted = tx.execute("DELETE FROM playlists WHERE id = ?1", [id])?;
        if deleted == 0 {
            return Err(Error::NotFound(format!("playlist {id}")));
        }
        tx.commit()?;
        Ok(())
    }

    /// Inserts or refreshes a video in the shared table. `created_at` is kept
    /// from the first insert; everything else follows the newest metadata.
    pub fn upsert_video(&self, video: &Video) -> Result<()> {
        let conn = self.conn.lock();
        upsert_video_row(&conn, video)
    }

    /// Looks up one video by source id.
    pub fn get_video(&self, id: &str) -> Result<Option<Video>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {VIDEO_COLUMNS} FROM videos v WHERE v.id = ?1"),
            [id],
            |row| Ok(row_to_video_raw(row)),
        )
        .optional()?
        .transpose()
        .map_err(Into::into)
    }

    /// Appends a video at the playlist's tail position.
    pub fn add_video_to_playlist(&self, playlist_id: &str, video_id: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        require_playlist(&tx, playlist_id)?;
        require_video(&tx, video_id)?;
        let already: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM playlist_videos WHERE playlist_id = ?1 AND video_id = ?2)",
            params![playlist_id, video_id],
            |row| row.get(0),
        )?;
        if already {
            return Err(Error::DuplicateMembership {
                playlist_id: playlist_id.to_string(),
                video_id: video_id.to_string(),
            });
        }
        let position: i64 = tx.query_row(
            "SELECT COUNT(*) FROM playlist_videos WHERE playlist_id = ?1",
            [playlist_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO playlist_videos (playlist_id, video_id, position) VALUES (?1, ?2, ?3)",
            params![playlist_id, video_id, position],
        )?;
        touch_playlist(&tx, playlist_id)?;
        tx.commit()?;
        Ok(())
    }

    /// Removes one membership row and compacts the remaining positions so the
    /// sequence stays `0..N-1`.
    pub fn remove_video_from_playlist(&self, playlist_id: &str, video_id: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        require_playlist(&tx, playlist_id)?;
        let position: Option<i64> = tx
            .query_row(
                "SELECT position FROM playlist_videos WHERE playlist_id = ?1 AND video_id = ?2",
                params![playlist_id, video_id],
                |row| row.get(0),
            )
            .optional()?;
        let position = position.ok_or_else(|| Error::MembershipNotFound {
            playlist_id: playlist_id.to_string(),
            video_id: video_id.to_string(),
        })?;
        tx.execute(
            "DELETE FROM playlist_videos WHERE playlist_id = ?1 AND video_id = ?2",
            params![playlist_id, video_id],
        )?;
        tx.execute(
            "UPDATE playlist_videos SET position = position - 1
             WHERE playlist_id = ?1 AND position > ?2",
            params![playlist_id, position],
        )?;
        touch_playlist(&tx, playlist_id)?;
        tx.commit()?;
        Ok(())
    }

    /// Applies a full permutation of the playlist's membership positions. The
    /// supplied orders must reference every current member exactly once with
    /// positions `0..N-1`.
    pub fn reorder_videos(&self, playlist_id: &str, orders: &[VideoOrder]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        require_playlist(&tx, playlist_id)?;

        let mut stmt =
            tx.prepare("SELECT video_id FROM playlist_videos WHERE playlist_id = ?1")?;
        let members: std::collections::HashSet<String> = stmt
            .query_map([playlist_id], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        drop(stmt);

        if orders.len() != members.len() {
            return Err(Error::InvalidOrder(format!(
                "expected {} entries, got {}",
                members.len(),
                orders.len()
            )));
        }
        let mut seen = vec![false; members.len()];
        for order in orders {
            if !members.contains(&order.video_id) {
                return Err(Error::MembershipNotFound {
                    playlist_id: playlist_id.to_string(),
                    video_id: order.video_id.clone(),
                });
            }
            match seen.get_mut(order.order) {
                Some(slot) if !*slot => *slot = true,
                Some(_) => {
                    return Err(Error::InvalidOrder(format!(
                        "position {} assigned twice",
                        order.order
                    )));
                }
                None => {
                    return Err(Error::InvalidOrder(format!(
                        "position {} out of range",
                        order.order
                    )));
                }
            }
        }

        for order in orders {
            tx.execute(
                "UPDATE playlist_videos SET position = ?1
                 WHERE playlist_id = ?2 AND video_id = ?3",
                params![order.order as i64, playlist_id, order.video_id],
            )?;
        }
        touch_playlist(&tx, playlist_id)?;
        tx.commit()?;
        Ok(())
    }

    /// Bulk append used by the importer: upserts each video and attaches it
    /// at the tail, in one transaction. Entries already in the playlist are
    /// skipped (a source playlist may list the same video twice). Returns how
    /// many memberships were created.
    pub fn attach_videos(&self, playlist_id: &str, videos: &[Video]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        require_playlist(&tx, playlist_id)?;
        let mut position: i64 = tx.query_row(
            "SELECT COUNT(*) FROM playlist_videos WHERE playlist_id = ?1",
            [playlist_id],
            |row| row.get(0),
        )?;
        let mut attached = 0;
        for video in videos {
            upsert_video_row(&tx, video)?;
            let inserted = tx.execute(
                "INSERT INTO playlist_videos (playlist_id, video_id, position)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(playlist_id, video_id) DO NOTHING",
                params![playlist_id, video.id, position],
            )?;
            if inserted == 1 {
                position += 1;
                attached += 1;
            }
        }
        // A bulk attach comes from an import, which reconciles the playlist
        // against its source.
        tx.execute(
            "UPDATE playlists SET last_health_check_at = ?1 WHERE id = ?2",
            params![now(), playlist_id],
        )?;
        touch_playlist(&tx, playlist_id)?;
        tx.commit()?;
        Ok(attached)
    }

    /// Substring search over a playlist's videos with optional sorting by
    /// title, upload date, or duration. Unknown sort keys leave the
    /// membership order untouched.
    pub fn search_videos_in_playlist(
        &self,
        playlist_id: &str,
        search: &VideoSearch,
    ) -> Result<Vec<Video>> {
        let conn = self.conn.lock();
        require_playlist(&conn, playlist_id)?;
        let mut videos = member_videos(&conn, playlist_id)?;
        drop(conn);

        if let Some(query) = search.query.as_deref().filter(|q| !q.is_empty()) {
            let needle = query.to_lowercase();
            videos.retain(|v| {
                v.title.to_lowercase().contains(&needle)
                    || v.channel_name.to_lowercase().contains(&needle)
            });
        }

        // Only a recognized key sorts; unknown keys leave the order alone,
        // so the descending flag must not reverse either.
        let sorted = match search.sort_by.as_deref() {
            Some("title") => {
                videos.sort_by_key(|v| v.title.to_lowercase());
                true
            }
            Some("uploadDate") | Some("upload_date") => {
                // YYYYMMDD strings sort chronologically as text.
                videos.sort_by(|a, b| a.upload_date.cmp(&b.upload_date));
                true
            }
            Some("duration") => {
                videos.sort_by_key(|v| v.duration_seconds);
                true
            }
            _ => false,
        };
        if sorted && search.sort_order == Some(SortOrder::Desc) {
            videos.reverse();
        }
        Ok(videos)
    }

    /// Aggregate statistics for one playlist.
    pub fn playlist_stats(&self, playlist_id: &str) -> Result<PlaylistStats> {
        let conn = self.conn.lock();
        let playlist = fetch_playlist(&conn, playlist_id)?
            .ok_or_else(|| Error::NotFound(format!("playlist {playlist_id}")))?;
        let (total_videos, total_seconds, total_views): (i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(v.duration_seconds), 0), COALESCE(SUM(v.view_count), 0)
             FROM playlist_videos pv
             JOIN videos v ON v.id = pv.video_id
             WHERE pv.playlist_id = ?1",
            [playlist_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(PlaylistStats {
            total_videos,
            total_duration: format_duration(total_seconds),
            total_views,
            last_updated: playlist.updated_at,
        })
    }

    #[cfg(test)]
    fn membership_positions(&self, playlist_id: &str) -> Vec<(String, i64)> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT video_id, position FROM playlist_videos
                 WHERE playlist_id = ?1 ORDER BY position ASC",
            )
            .unwrap();
        let rows = stmt
            .query_map([playlist_id], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap();
        rows.map(|row| row.unwrap()).collect()
    }
}

/// Returns whether the key was recognized and a sort actually happened.
fn sort_playlists(playlists: &mut [Playlist], key: &str) -> bool {
    match key {
        "title" => playlists.sort_by_key(|p| p.title.to_lowercase()),
        "createdAt" | "created_at" => playlists.sort_by(|a, b| a.created_at.cmp(&b.created_at)),
        "updatedAt" | "updated_at" => playlists.sort_by(|a, b| a.updated_at.cmp(&b.updated_at)),
        "videoCount" | "video_count" => playlists.sort_by_key(|p| p.video_count),
        _ => return false,
    }
    true
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

/// Process-unique playlist id: creation time plus a counter so two playlists
/// created in the same instant still differ.
fn next_playlist_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("pl-{:x}-{:x}", nanos, COUNTER.fetch_add(1, Ordering::Relaxed))
}

fn validate_title(title: &str) -> Result<()> {
    if title.trim().is_empty() {
        return Err(Error::Validation("title must not be empty".to_string()));
    }
    if title.chars().count() > MAX_TITLE_LEN {
        return Err(Error::Validation(format!(
            "title must be at most {MAX_TITLE_LEN} characters"
        )));
    }
    Ok(())
}

fn validate_description(description: &str) -> Result<()> {
    if description.chars().count() > MAX_DESCRIPTION_LEN {
        return Err(Error::Validation(format!(
            "description must be at most {MAX_DESCRIPTION_LEN} characters"
        )));
    }
    Ok(())
}

fn title_taken(
    conn: &Connection,
    owner: &str,
    title: &str,
    exclude_id: Option<&str>,
) -> Result<bool> {
    let taken: bool = conn.query_row(
        "SELECT EXISTS(
             SELECT 1 FROM playlists
             WHERE owner_id = ?1 AND LOWER(title) = LOWER(?2) AND id != COALESCE(?3, '')
         )",
        params![owner, title, exclude_id],
        |row| row.get(0),
    )?;
    Ok(taken)
}

fn fetch_playlist(conn: &Connection, id: &str) -> Result<Option<Playlist>> {
    conn.query_row(
        &format!("{PLAYLIST_SELECT} WHERE p.id = ?1"),
        [id],
        |row| Ok(row_to_playlist_raw(row)),
    )
    .optional()?
    .transpose()
    .map_err(Into::into)
}

fn require_playlist(conn: &Connection, id: &str) -> Result<()> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM playlists WHERE id = ?1)",
        [id],
        |row| row.get(0),
    )?;
    if exists {
        Ok(())
    } else {
        Err(Error::NotFound(format!("playlist {id}")))
    }
}

fn require_video(conn: &Connection, id: &str) -> Result<()> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM videos WHERE id = ?1)",
        [id],
        |row| row.get(0),
    )?;
    if exists {
        Ok(())
    } else {
        Err(Error::NotFound(format!("video {id}")))
    }
}

fn touch_playlist(conn: &Connection, id: &str) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE playlists SET updated_at = ?1 WHERE id = ?2",
        params![now(), id],
    )?;
    Ok(())
}

fn upsert_video_row(conn: &Connection, video: &Video) -> Result<()> {
    conn.execute(
        "INSERT INTO videos (id, title, channel_name, duration_seconds, view_count,
                             upload_date, thumbnail_url, availability, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
         ON CONFLICT(id) DO UPDATE SET
             title = excluded.title,
             channel_name = excluded.channel_name,
             duration_seconds = excluded.duration_seconds,
             view_count = excluded.view_count,
             upload_date = excluded.upload_date,
             thumbnail_url = excluded.thumbnail_url,
             availability = excluded.availability,
             updated_at = excluded.updated_at",
        params![
            video.id,
            video.title,
            video.channel_name,
            video.duration_seconds,
            video.view_count,
            video.upload_date,
            video.thumbnail_url,
            video.availability.as_str(),
            now(),
        ],
    )?;
    Ok(())
}

fn member_videos(conn: &Connection, playlist_id: &str) -> Result<Vec<Video>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {VIDEO_COLUMNS}
         FROM playlist_videos pv
         JOIN videos v ON v.id = pv.video_id
         WHERE pv.playlist_id = ?1
         ORDER BY pv.position ASC"
    ))?;
    let mut rows = stmt.query([playlist_id])?;
    let mut videos = Vec::new();
    while let Some(row) = rows.next()? {
        videos.push(row_to_video(row)?);
    }
    Ok(videos)
}

fn row_to_playlist(row: &Row<'_>) -> Result<Playlist> {
    row_to_playlist_raw(row).map_err(Into::into)
}

fn row_to_playlist_raw(row: &Row<'_>) -> rusqlite::Result<Playlist> {
    let kind: String = row.get("kind")?;
    Ok(Playlist {
        id: row.get("id")?,
        owner_id: row.get("owner_id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        kind: PlaylistKind::parse(&kind),
        video_count: row.get("video_count")?,
        thumbnail_url: row.get("thumbnail_url")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        last_health_check_at: row.get("last_health_check_at")?,
    })
}

fn row_to_video(row: &Row<'_>) -> Result<Video> {
    row_to_video_raw(row).map_err(Into::into)
}

fn row_to_video_raw(row: &Row<'_>) -> rusqlite::Result<Video> {
    let duration_seconds: i64 = row.get("duration_seconds")?;
    let availability: String = row.get("availability")?;
    Ok(Video {
        id: row.get("id")?,
        title: row.get("title")?,
        channel_name: row.get("channel_name")?,
        duration_seconds,
        duration: format_duration(duration_seconds),
        view_count: row.get("view_count")?,
        upload_date: row.get("upload_date")?,
        thumbnail_url: row.get("thumbnail_url")?,
        availability: Availability::parse(&availability),
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> PlaylistStore {
        PlaylistStore::open_in_memory().unwrap()
    }

    fn new_playlist(title: &str) -> NewPlaylist {
        NewPlaylist {
            owner_id: None,
            title: title.to_string(),
            description: None,
            kind: PlaylistKind::Custom,
            thumbnail_url: None,
        }
    }

    fn video(id: &str, title: &str, seconds: i64, views: i64) -> Video {
        Video {
            id: id.to_string(),
            title: title.to_string(),
            channel_name: format!("{title} channel"),
            duration_seconds: seconds,
            duration: format_duration(seconds),
            view_count: views,
            upload_date: "20240101".to_string(),
            thumbnail_url: String::new(),
            availability: Availability::Public,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn seeded(titles: &[(&str, i64, i64)]) -> (PlaylistStore, String) {
        let store = store();
        let playlist = store.create_playlist(new_playlist("Seeded")).unwrap();
        for (index, (title, seconds, views)) in titles.iter().enumerate() {
            let v = video(&format!("v{index}"), title, *seconds, *views);
            store.upsert_video(&v).unwrap();
            store.add_video_to_playlist(&playlist.id, &v.id).unwrap();
        }
        (store, playlist.id)
    }

    fn assert_contiguous(store: &PlaylistStore, playlist_id: &str) {
        let positions: Vec<i64> = store
            .membership_positions(playlist_id)
            .into_iter()
            .map(|(_, position)| position)
            .collect();
        let expected: Vec<i64> = (0..positions.len() as i64).collect();
        assert_eq!(positions, expected);
    }

    #[test]
    fn create_playlist_assigns_id_and_defaults() {
        let store = store();
        let playlist = store.create_playlist(new_playlist("  Music  ")).unwrap();
        assert_eq!(playlist.title, "Music");
        assert_eq!(playlist.owner_id, DEFAULT_OWNER);
        assert_eq!(playlist.video_count, 0);
        assert!(playlist.id.starts_with("pl-"));
    }

    #[test]
    fn create_playlist_rejects_duplicate_title_case_insensitive() {
        let store = store();
        store.create_playlist(new_playlist("Music")).unwrap();
        let err = store.create_playlist(new_playlist("music")).unwrap_err();
        assert!(matches!(err, Error::DuplicateTitle(_)));
    }

    #[test]
    fn create_playlist_allows_same_title_for_other_owner() {
        let store = store();
        store.create_playlist(new_playlist("Music")).unwrap();
        let mut other = new_playlist("Music");
        other.owner_id = Some("someone-else".to_string());
        assert!(store.create_playlist(other).is_ok());
    }

    #[test]
    fn create_playlist_validates_lengths() {
        let store = store();
        assert!(matches!(
            store.create_playlist(new_playlist("   ")).unwrap_err(),
            Error::Validation(_)
        ));
        assert!(matches!(
            store
                .create_playlist(new_playlist(&"x".repeat(256)))
                .unwrap_err(),
            Error::Validation(_)
        ));
        let mut long_desc = new_playlist("Fine");
        long_desc.description = Some("d".repeat(1001));
        assert!(matches!(
            store.create_playlist(long_desc).unwrap_err(),
            Error::Validation(_)
        ));
    }

    #[test]
    fn update_playlist_renames_and_detects_collisions() {
        let store = store();
        let a = store.create_playlist(new_playlist("Alpha")).unwrap();
        store.create_playlist(new_playlist("Beta")).unwrap();

        // Renaming to itself (different case) is fine.
        let renamed = store
            .update_playlist(
                &a.id,
                PlaylistUpdate {
                    title: Some("ALPHA".to_string()),
                    description: None,
                },
            )
            .unwrap();
        assert_eq!(renamed.title, "ALPHA");

        let err = store
            .update_playlist(
                &a.id,
                PlaylistUpdate {
                    title: Some("beta".to_string()),
                    description: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateTitle(_)));

        let err = store
            .update_playlist("missing", PlaylistUpdate::default())
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn delete_playlist_removes_memberships_but_keeps_videos() {
        let (store, playlist_id) = seeded(&[("One", 60, 1)]);
        let other = store.create_playlist(new_playlist("Other")).unwrap();
        store.add_video_to_playlist(&other.id, "v0").unwrap();

        store.delete_playlist(&playlist_id).unwrap();
        assert!(store.get_playlist(&playlist_id).unwrap().is_none());
        assert!(store.get_video("v0").unwrap().is_some());
        let remaining = store.get_playlist(&other.id).unwrap().unwrap();
        assert_eq!(remaining.videos.len(), 1);

        assert!(matches!(
            store.delete_playlist(&playlist_id).unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[test]
    fn add_video_appends_and_rejects_duplicates() {
        let (store, playlist_id) = seeded(&[("One", 60, 1), ("Two", 120, 2)]);
        assert_contiguous(&store, &playlist_id);

        let err = store
            .add_video_to_playlist(&playlist_id, "v0")
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateMembership { .. }));

        let err = store
            .add_video_to_playlist("missing", "v0")
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let err = store
            .add_video_to_playlist(&playlist_id, "no-such-video")
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn remove_video_compacts_positions() {
        let (store, playlist_id) = seeded(&[("One", 60, 1), ("Two", 120, 2), ("Three", 180, 3)]);
        store
            .remove_video_from_playlist(&playlist_id, "v1")
            .unwrap();
        assert_contiguous(&store, &playlist_id);
        let members = store.membership_positions(&playlist_id);
        assert_eq!(members[0].0, "v0");
        assert_eq!(members[1].0, "v2");

        let err = store
            .remove_video_from_playlist(&playlist_id, "v1")
            .unwrap_err();
        assert!(matches!(err, Error::MembershipNotFound { .. }));
    }

    #[test]
    fn removed_video_readds_at_tail() {
        let (store, playlist_id) = seeded(&[("One", 60, 1), ("Two", 120, 2), ("Three", 180, 3)]);
        store
            .remove_video_from_playlist(&playlist_id, "v0")
            .unwrap();
        store.add_video_to_playlist(&playlist_id, "v0").unwrap();
        let members = store.membership_positions(&playlist_id);
        assert_eq!(members.last().unwrap(), &("v0".to_string(), 2));
        assert_contiguous(&store, &playlist_id);
    }

    #[test]
    fn reorder_applies_full_permutation() {
        let (store, playlist_id) = seeded(&[("One", 60, 1), ("Two", 120, 2), ("Three", 180, 3)]);
        store
            .reorder_videos(
                &playlist_id,
                &[
                    VideoOrder {
                        video_id: "v2".to_string(),
                        order: 0,
                    },
                    VideoOrder {
                        video_id: "v0".to_string(),
                        order: 1,
                    },
                    VideoOrder {
                        video_id: "v1".to_string(),
                        order: 2,
                    },
                ],
            )
            .unwrap();
        let members = store.membership_positions(&playlist_id);
        let ids: Vec<&str> = members.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, ["v2", "v0", "v1"]);
        assert_contiguous(&store, &playlist_id);
    }

    #[test]
    fn reorder_rejects_bad_permutations() {
        let (store, playlist_id) = seeded(&[("One", 60, 1), ("Two", 120, 2)]);

        let err = store
            .reorder_videos(
                &playlist_id,
                &[VideoOrder {
                    video_id: "v0".to_string(),
                    order: 0,
                }],
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOrder(_)));

        let err = store
            .reorder_videos(
                &playlist_id,
                &[
                    VideoOrder {
                        video_id: "v0".to_string(),
                        order: 0,
                    },
                    VideoOrder {
                        video_id: "ghost".to_string(),
                        order: 1,
                    },
                ],
            )
            .unwrap_err();
        assert!(matches!(err, Error::MembershipNotFound { .. }));

        let err = store
            .reorder_videos(
                &playlist_id,
                &[
                    VideoOrder {
                        video_id: "v0".to_string(),
                        order: 0,
                    },
                    VideoOrder {
                        video_id: "v1".to_string(),
                        order: 0,
                    },
                ],
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOrder(_)));

        let err = store
            .reorder_videos(
                &playlist_id,
                &[
                    VideoOrder {
                        video_id: "v0".to_string(),
                        order: 0,
                    },
                    VideoOrder {
                        video_id: "v1".to_string(),
                        order: 5,
                    },
                ],
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOrder(_)));

        assert_contiguous(&store, &playlist_id);
    }

    #[test]
    fn attach_videos_appends_in_order_and_skips_duplicates() {
        let store = store();
        let playlist = store.create_playlist(new_playlist("Imported")).unwrap();
        let videos = vec![
            video("a", "First", 60, 1),
            video("b", "Second", 120, 2),
            video("a", "First again", 60, 1),
        ];
        let attached = store.attach_videos(&playlist.id, &videos).unwrap();
        assert_eq!(attached, 2);
        let members = store.membership_positions(&playlist.id);
        let ids: Vec<&str> = members.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
        assert_contiguous(&store, &playlist.id);
    }

    #[test]
    fn search_filters_and_sorts() {
        let (store, playlist_id) = seeded(&[
            ("banana song", 213, 10),
            ("Apple tune", 282, 20),
            ("cherry jam", 100, 5),
        ]);

        let by_title = store
            .search_videos_in_playlist(
                &playlist_id,
                &VideoSearch {
                    sort_by: Some("title".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        let titles: Vec<&str> = by_title.iter().map(|v| v.title.as_str()).collect();
        assert_eq!(titles, ["Apple tune", "banana song", "cherry jam"]);

        let by_duration_desc = store
            .search_videos_in_playlist(
                &playlist_id,
                &VideoSearch {
                    sort_by: Some("duration".to_string()),
                    sort_order: Some(SortOrder::Desc),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(by_duration_desc[0].duration_seconds, 282);

        let filtered = store
            .search_videos_in_playlist(
                &playlist_id,
                &VideoSearch {
                    query: Some("APPLE".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].title, "Apple tune");

        // Unknown sort keys keep membership order, even descending.
        for order in [None, Some(SortOrder::Desc)] {
            let unsorted = store
                .search_videos_in_playlist(
                    &playlist_id,
                    &VideoSearch {
                        sort_by: Some("viewCount".to_string()),
                        sort_order: order,
                        ..Default::default()
                    },
                )
                .unwrap();
            let titles: Vec<&str> = unsorted.iter().map(|v| v.title.as_str()).collect();
            assert_eq!(titles, ["banana song", "Apple tune", "cherry jam"]);
        }

        assert!(matches!(
            store
                .search_videos_in_playlist("missing", &VideoSearch::default())
                .unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[test]
    fn stats_sum_durations_and_views() {
        let (store, playlist_id) = seeded(&[("A", 213, 10), ("B", 282, 20)]);
        let stats = store.playlist_stats(&playlist_id).unwrap();
        assert_eq!(stats.total_videos, 2);
        assert_eq!(stats.total_duration, "8:15");
        assert_eq!(stats.total_views, 30);
    }

    #[test]
    fn list_playlists_filters_sorts_and_pages() {
        let store = store();
        store.create_playlist(new_playlist("Rock anthems")).unwrap();
        let mut jazz = new_playlist("Jazz");
        jazz.description = Some("smooth evening music".to_string());
        jazz.kind = PlaylistKind::YoutubeImported;
        store.create_playlist(jazz).unwrap();
        store.create_playlist(new_playlist("Ambient")).unwrap();

        let all = store.list_playlists(&ListOptions::default()).unwrap();
        assert_eq!(all.len(), 3);

        let matched = store
            .list_playlists(&ListOptions {
                query: Some("evening".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].title, "Jazz");

        let imported = store
            .list_playlists(&ListOptions {
                kind: Some(PlaylistKind::YoutubeImported),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(imported.len(), 1);

        let sorted = store
            .list_playlists(&ListOptions {
                sort_by: Some("title".to_string()),
                sort_order: Some(SortOrder::Desc),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(sorted[0].title, "Rock anthems");

        let paged = store
            .list_playlists(&ListOptions {
                sort_by: Some("title".to_string()),
                offset: Some(1),
                limit: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(paged.len(), 1);
        assert_eq!(paged[0].title, "Jazz");

        // An unrecognized sort key keeps creation order; the descending flag
        // must not reverse an order that was never applied.
        let unsorted = store
            .list_playlists(&ListOptions {
                sort_by: Some("owner".to_string()),
                sort_order: Some(SortOrder::Desc),
                ..Default::default()
            })
            .unwrap();
        let titles: Vec<&str> = unsorted.iter().map(|p| p.title.as_str()).collect();
        assert_eq!(titles, ["Rock anthems", "Jazz", "Ambient"]);
    }

    #[test]
    fn upsert_video_refreshes_metadata_but_keeps_created_at() {
        let store = store();
        store.upsert_video(&video("v", "Old title", 60, 1)).unwrap();
        let first = store.get_video("v").unwrap().unwrap();
        store
            .upsert_video(&video("v", "New title", 90, 5))
            .unwrap();
        let second = store.get_video("v").unwrap().unwrap();
        assert_eq!(second.title, "New title");
        assert_eq!(second.duration_seconds, 90);
        assert_eq!(second.duration, "1:30");
        assert_eq!(second.created_at, first.created_at);
    }
}
