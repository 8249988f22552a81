//! Playlist URL validation and normalization.
//!
//! Pure functions: nothing here touches the network or the filesystem. A URL
//! is accepted when it points at a recognized YouTube host and carries a
//! `list` query parameter, whether as a bare playlist link or as a watch link
//! that happens to reference a playlist.

use url::Url;

use crate::error::{Error, Result};

/// Hosts we accept playlist URLs from. Anything else is rejected even if it
/// carries a `list` parameter.
const YOUTUBE_HOSTS: &[&str] = &["youtube.com", "www.youtube.com", "youtu.be"];

fn parse(url: &str) -> Option<Url> {
    Url::parse(url.trim()).ok()
}

fn is_youtube_host(url: &Url) -> bool {
    url.host_str()
        .is_some_and(|host| YOUTUBE_HOSTS.contains(&host.to_ascii_lowercase().as_str()))
}

fn list_param(url: &Url) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == "list")
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

/// Returns true when the URL matches a YouTube playlist or watch-with-list
/// pattern on a recognized host.
pub fn is_valid_playlist_url(url: &str) -> bool {
    parse(url).is_some_and(|parsed| is_youtube_host(&parsed) && list_param(&parsed).is_some())
}

/// Extracts the `list` query parameter, if any. Does not insist on a YouTube
/// host; callers wanting full validation go through [`sanitize_url`].
pub fn extract_playlist_id(url: &str) -> Option<String> {
    parse(url).and_then(|parsed| list_param(&parsed))
}

/// Normalizes any accepted playlist URL into the canonical
/// `https://www.youtube.com/playlist?list=<id>` form.
pub fn sanitize_url(url: &str) -> Result<String> {
    let parsed =
        parse(url).ok_or_else(|| Error::InvalidUrl(format!("not a parseable URL: {url}")))?;

    if !is_youtube_host(&parsed) {
        return Err(Error::InvalidUrl(format!(
            "not a YouTube host: {}",
            parsed.host_str().unwrap_or("<none>")
        )));
    }

    let id = list_param(&parsed)
        .ok_or_else(|| Error::InvalidUrl("URL has no list parameter".to_string()))?;

    Ok(format!("https://www.youtube.com/playlist?list={id}"))
}
