//! Runtime configuration, read from a simple KEY="value" env file.
//!
//! Every key has a sensible default so a missing config file still yields a
//! working setup (local SQLite DB, `yt-dlp` from PATH, loopback listener).

use anyhow::{Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/tubelib-env";
pub const DEFAULT_LIBRARY_DB: &str = "/var/lib/tubelib/library.db";
pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";
pub const DEFAULT_TUBELIB_PORT: u16 = 8080;
pub const DEFAULT_TUBELIB_HOST: &str = "127.0.0.1";

/// Raw key/value content of the env file; `None` means the key was absent.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub library_db: Option<PathBuf>,
    pub ytdlp_bin: Option<PathBuf>,
    pub tubelib_port: Option<u16>,
    pub tubelib_host: Option<String>,
}

/// Fully resolved configuration with defaults applied.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub library_db: PathBuf,
    pub ytdlp_bin: PathBuf,
    pub tubelib_port: u16,
    pub tubelib_host: String,
}

pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let mut cfg = EnvConfig::default();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((key, value_raw)) = trimmed.split_once('=') {
            let value = value_raw.trim().trim_matches('"');
            match key {
                "LIBRARY_DB" => cfg.library_db = Some(PathBuf::from(value)),
                "YTDLP_BIN" => cfg.ytdlp_bin = Some(PathBuf::from(value)),
                "TUBELIB_PORT" => {
                    let port: u16 = value.parse().with_context(|| {
                        format!("Parsing TUBELIB_PORT from {}", path.display())
                    })?;
                    cfg.tubelib_port = Some(port);
                }
                "TUBELIB_HOST" => {
                    if !value.is_empty() {
                        cfg.tubelib_host = Some(value.to_string());
                    }
                }
                _ => {}
            }
        }
    }
    Ok(Some(cfg))
}

pub fn load_runtime_config() -> Result<RuntimeConfig> {
    load_runtime_config_from(Path::new(DEFAULT_CONFIG_PATH))
}

pub fn load_runtime_config_from(path: impl AsRef<Path>) -> Result<RuntimeConfig> {
    let cfg = read_env_config(path.as_ref())?.unwrap_or_default();
    Ok(RuntimeConfig {
        library_db: cfg
            .library_db
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LIBRARY_DB)),
        ytdlp_bin: cfg
            .ytdlp_bin
            .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP_BIN)),
        tubelib_port: cfg.tubelib_port.unwrap_or(DEFAULT_TUBELIB_PORT),
        tubelib_host: cfg
            .tubelib_host
            .unwrap_or_else(|| DEFAULT_TUBELIB_HOST.to_string()),
    })
}
