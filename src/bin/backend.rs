#![forbid(unsafe_code)]

//! REST API server for the tubelib playlist library.
//!
//! Exposes playlist CRUD, in-playlist search and ordering, and the YouTube
//! playlist importer. Imports run in the background; clients poll
//! `/api/imports/{id}` for the accumulated progress events instead of holding
//! a connection open for the whole import.

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task;
use tubelib_tools::config::load_runtime_config;
use tubelib_tools::error::Error;
use tubelib_tools::import::{ImportOrchestrator, ImportProgressEvent};
use tubelib_tools::library::{
    ListOptions, NewPlaylist, Playlist, PlaylistStats, PlaylistStore, PlaylistUpdate,
    PlaylistWithVideos, Video, VideoOrder, VideoSearch,
};
use tubelib_tools::security::ensure_not_root;
use tubelib_tools::url::{extract_playlist_id, is_valid_playlist_url, sanitize_url};
use tubelib_tools::ytdlp::{MetadataTool, PlaylistMetadata, ToolStatus, UpdateOutcome, VideoQuality};

#[derive(Clone)]
struct AppState {
    store: Arc<PlaylistStore>,
    tool: MetadataTool,
    orchestrator: Arc<ImportOrchestrator>,
    imports: Arc<ImportRegistry>,
}

/// Finished imports kept around for late polls; the oldest are evicted past
/// this bound so a long-lived process does not accumulate every import ever
/// run. Running imports are never evicted.
const MAX_FINISHED_IMPORTS: usize = 128;

/// In-memory record of the imports started by this process. Events pile up
/// until the client polls them.
struct ImportRegistry {
    next_id: AtomicU64,
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    jobs: HashMap<String, ImportJob>,
    finished: VecDeque<String>,
}

#[derive(Default, Clone, serde::Serialize)]
struct ImportJob {
    events: Vec<ImportProgressEvent>,
    done: bool,
}

impl ImportRegistry {
    fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    fn create(&self) -> String {
        let id = format!("imp-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .lock()
            .jobs
            .insert(id.clone(), ImportJob::default());
        id
    }

    fn push(&self, id: &str, event: ImportProgressEvent) {
        if let Some(job) = self.inner.lock().jobs.get_mut(id) {
            job.events.push(event);
        }
    }

    fn finish(&self, id: &str) {
        let mut inner = self.inner.lock();
        let Some(job) = inner.jobs.get_mut(id) else {
            return;
        };
        job.done = true;
        inner.finished.push_back(id.to_string());
        while inner.finished.len() > MAX_FINISHED_IMPORTS {
            if let Some(oldest) = inner.finished.pop_front() {
                inner.jobs.remove(&oldest);
            }
        }
    }

    fn snapshot(&self, id: &str) -> Option<ImportJob> {
        self.inner.lock().jobs.get(id).cloned()
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::InvalidUrl(_) | Error::InvalidOrder(_) => StatusCode::BAD_REQUEST,
            Error::Validation(_) | Error::EmptyPlaylist => StatusCode::UNPROCESSABLE_ENTITY,
            Error::NotFound(_) | Error::MembershipNotFound { .. } => StatusCode::NOT_FOUND,
            Error::DuplicateTitle(_)
            | Error::DuplicateMembership { .. }
            | Error::ImportInProgress(_) => StatusCode::CONFLICT,
            Error::ToolTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::ToolExecution(_) => StatusCode::BAD_GATEWAY,
            Error::Io(_) | Error::Serialization(_) | Error::Database(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        if let Ok(value) = "application/json".parse() {
            headers.insert(header::CONTENT_TYPE, value);
        }
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, headers, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Runs a synchronous store operation off the async runtime.
async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> tubelib_tools::error::Result<T> + Send + 'static,
    T: Send + 'static,
{
    task::spawn_blocking(f)
        .await
        .map_err(|err| ApiError::internal(format!("task join error: {err}")))?
        .map_err(ApiError::from)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    ensure_not_root("tubelib-backend")?;

    let cfg = load_runtime_config().context("loading runtime config")?;
    let port = std::env::var("TUBELIB_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(cfg.tubelib_port);

    let store = Arc::new(
        PlaylistStore::open(&cfg.library_db)
            .with_context(|| format!("opening library DB at {}", cfg.library_db.display()))?,
    );
    let tool = MetadataTool::new(&cfg.ytdlp_bin);
    let orchestrator = Arc::new(ImportOrchestrator::new(store.clone(), tool.clone()));

    let state = AppState {
        store,
        tool,
        orchestrator,
        imports: Arc::new(ImportRegistry::new()),
    };

    let app = Router::new()
        .route("/api/validate-url", get(validate_url))
        .route("/api/playlist-metadata", get(playlist_metadata))
        .route("/api/imports", post(start_import))
        .route("/api/imports/{id}", get(import_status))
        .route("/api/tool", get(tool_status))
        .route("/api/tool/update", post(tool_update))
        .route("/api/playlists", get(list_playlists).post(create_playlist))
        .route(
            "/api/playlists/{id}",
            get(get_playlist).patch(update_playlist).delete(delete_playlist),
        )
        .route("/api/playlists/{id}/videos", get(search_videos).post(add_video))
        .route("/api/playlists/{id}/videos/{video_id}", delete(remove_video))
        .route("/api/playlists/{id}/videos/order", put(reorder_videos))
        .route("/api/playlists/{id}/stats", get(playlist_stats))
        .route("/api/videos/{id}/qualities", get(video_qualities))
        .with_state(state);

    let addr = SocketAddr::new(cfg.tubelib_host.parse()?, port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    println!("API server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        eprintln!("Failed to install Ctrl+C handler: {}", err);
    }
}

#[derive(Deserialize)]
struct UrlQuery {
    url: String,
}

async fn validate_url(Query(query): Query<UrlQuery>) -> Json<serde_json::Value> {
    let valid = is_valid_playlist_url(&query.url);
    let sanitized = sanitize_url(&query.url).ok();
    let playlist_id = sanitized.as_deref().and_then(extract_playlist_id);
    Json(serde_json::json!({
        "isValid": valid,
        "sanitizedUrl": sanitized,
        "playlistId": playlist_id,
    }))
}

async fn playlist_metadata(
    State(state): State<AppState>,
    Query(query): Query<UrlQuery>,
) -> ApiResult<Json<PlaylistMetadata>> {
    let url = sanitize_url(&query.url)?;
    let metadata = state.tool.fetch_playlist_metadata(&url).await?;
    Ok(Json(metadata))
}

#[derive(Deserialize)]
struct ImportRequest {
    url: String,
}

async fn start_import(
    State(state): State<AppState>,
    Json(request): Json<ImportRequest>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    // Reject obviously bad URLs before spawning anything.
    if !is_valid_playlist_url(&request.url) {
        return Err(Error::InvalidUrl(format!("not a playlist URL: {}", request.url)).into());
    }

    let id = state.imports.create();
    let registry = state.imports.clone();
    let orchestrator = state.orchestrator.clone();
    let job_id = id.clone();
    tokio::spawn(async move {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let run = orchestrator.import_playlist(&request.url, tx);
        let drain = async {
            while let Some(event) = rx.recv().await {
                registry.push(&job_id, event);
            }
        };
        let (result, ()) = tokio::join!(run, drain);
        if let Err(err) = result {
            log::warn!("import {job_id} failed: {err}");
        }
        registry.finish(&job_id);
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "importId": id })),
    ))
}

async fn import_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ImportJob>> {
    state
        .imports
        .snapshot(&id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("import not found"))
}

async fn tool_status(State(state): State<AppState>) -> Json<ToolStatus> {
    Json(state.tool.check_availability().await)
}

async fn tool_update(State(state): State<AppState>) -> Json<UpdateOutcome> {
    Json(state.tool.self_update().await)
}

async fn list_playlists(
    State(state): State<AppState>,
    Query(options): Query<ListOptions>,
) -> ApiResult<Json<Vec<Playlist>>> {
    let store = state.store.clone();
    let playlists = blocking(move || store.list_playlists(&options)).await?;
    Ok(Json(playlists))
}

async fn create_playlist(
    State(state): State<AppState>,
    Json(input): Json<NewPlaylist>,
) -> ApiResult<(StatusCode, Json<Playlist>)> {
    let store = state.store.clone();
    let playlist = blocking(move || store.create_playlist(input)).await?;
    Ok((StatusCode::CREATED, Json(playlist)))
}

async fn get_playlist(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<PlaylistWithVideos>> {
    let store = state.store.clone();
    let playlist = blocking(move || store.get_playlist(&id)).await?;
    playlist
        .map(Json)
        .ok_or_else(|| ApiError::not_found("playlist not found"))
}

async fn update_playlist(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<PlaylistUpdate>,
) -> ApiResult<Json<Playlist>> {
    let store = state.store.clone();
    let playlist = blocking(move || store.update_playlist(&id, update)).await?;
    Ok(Json(playlist))
}

async fn delete_playlist(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let store = state.store.clone();
    blocking(move || store.delete_playlist(&id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddVideoRequest {
    video_id: String,
}

async fn add_video(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<AddVideoRequest>,
) -> ApiResult<StatusCode> {
    let store = state.store.clone();
    blocking(move || store.add_video_to_playlist(&id, &request.video_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_video(
    State(state): State<AppState>,
    Path((id, video_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let store = state.store.clone();
    blocking(move || store.remove_video_from_playlist(&id, &video_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn reorder_videos(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(orders): Json<Vec<VideoOrder>>,
) -> ApiResult<StatusCode> {
    let store = state.store.clone();
    blocking(move || store.reorder_videos(&id, &orders)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn search_videos(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(search): Query<VideoSearch>,
) -> ApiResult<Json<Vec<Video>>> {
    let store = state.store.clone();
    let videos = blocking(move || store.search_videos_in_playlist(&id, &search)).await?;
    Ok(Json(videos))
}

async fn playlist_stats(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<PlaylistStats>> {
    let store = state.store.clone();
    let stats = blocking(move || store.playlist_stats(&id)).await?;
    Ok(Json(stats))
}

async fn video_qualities(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<Vec<VideoQuality>> {
    Json(state.tool.fetch_video_qualities(&id).await)
}
