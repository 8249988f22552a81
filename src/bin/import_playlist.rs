#![forbid(unsafe_code)]

//! Command-line driver for the playlist importer. Prints progress as the
//! import advances and a one-line summary at the end.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tubelib_tools::config::{DEFAULT_CONFIG_PATH, load_runtime_config_from};
use tubelib_tools::import::{ImportOrchestrator, ImportPhase, ImportProgressEvent};
use tubelib_tools::library::PlaylistStore;
use tubelib_tools::ytdlp::MetadataTool;

#[derive(Parser)]
#[command(
    name = "import-playlist",
    about = "Import a YouTube playlist into the local library"
)]
struct Args {
    /// Playlist URL to import.
    url: String,

    /// Path to the env-style config file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the library database path from the config file.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Override the yt-dlp binary path from the config file.
    #[arg(long)]
    ytdlp: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut cfg = load_runtime_config_from(&args.config)
        .with_context(|| format!("loading config from {}", args.config.display()))?;
    if let Some(db) = args.db {
        cfg.library_db = db;
    }
    if let Some(bin) = args.ytdlp {
        cfg.ytdlp_bin = bin;
    }

    let store = Arc::new(
        PlaylistStore::open(&cfg.library_db)
            .with_context(|| format!("opening library DB at {}", cfg.library_db.display()))?,
    );
    let orchestrator = ImportOrchestrator::new(store, MetadataTool::new(&cfg.ytdlp_bin));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(&event);
        }
    });

    let result = orchestrator.import_playlist(&args.url, tx).await;
    let _ = printer.await;

    let outcome = result.context("importing playlist")?;
    println!(
        "Imported \"{}\" ({} videos, id {})",
        outcome.playlist.title, outcome.video_count, outcome.playlist.id
    );
    Ok(())
}

fn print_event(event: &ImportProgressEvent) {
    match event.phase {
        ImportPhase::Validating => println!("Validating URL..."),
        ImportPhase::FetchingMetadata => println!("Fetching playlist metadata..."),
        ImportPhase::CreatingPlaylist => println!("Creating playlist..."),
        ImportPhase::FetchingVideos => {
            if let Some(title) = &event.current_video_title {
                println!("  [{:>3}%] {}", event.progress, title);
            } else {
                println!("Fetching video metadata...");
            }
        }
        ImportPhase::Persisting => println!("Saving videos..."),
        ImportPhase::Completed => {}
        ImportPhase::Failed => {
            if let Some(error) = &event.error {
                eprintln!("  Warning: import failed: {}", error);
            }
        }
    }
}
