use async_trait::async_trait;
use serde::Deserialize;
use std::{path::PathBuf, time::Duration};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{Query, TrackResolver};
use crate::{
    audio::track::{SourceKind, Track},
    error::ResolveError,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolver que consulta metadatos con yt-dlp, sin descargar audio.
pub struct YtDlpResolver {
    binary: String,
    timeout: Duration,
    cookies: Option<PathBuf>,
}

impl YtDlpResolver {
    pub fn new() -> Self {
        Self {
            binary: "yt-dlp".to_string(),
            timeout: DEFAULT_TIMEOUT,
            cookies: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Usa el primer archivo de cookies que exista entre los candidatos
    pub fn with_cookies_from(mut self, candidates: &[PathBuf]) -> Self {
        match candidates.iter().find(|path| path.is_file()) {
            Some(path) => {
                info!("🍪 Cookies encontradas en: {}", path.display());
                self.cookies = Some(path.clone());
            }
            None => warn!("🍪 No se encontraron cookies - algunos videos pueden fallar"),
        }
        self
    }

    /// Verifica que yt-dlp esté disponible
    pub async fn verify(&self) -> Result<String, ResolveError> {
        let output = Command::new(&self.binary)
            .arg("--version")
            .output()
            .await
            .map_err(|e| ResolveError::Source(format!("{} no disponible: {}", self.binary, e)))?;

        if !output.status.success() {
            return Err(ResolveError::Source(format!("{} --version falló", self.binary)));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn command(&self, target: &str) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args([
            "--dump-single-json",
            "--no-playlist",
            "--skip-download",
            "--no-warnings",
            "--socket-timeout",
            "15",
        ]);

        if let Some(cookies) = &self.cookies {
            cmd.arg("--cookies").arg(cookies);
        }

        cmd.arg(target).kill_on_drop(true);
        cmd
    }
}

impl Default for YtDlpResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TrackResolver for YtDlpResolver {
    async fn resolve(&self, query: &str) -> Result<Track, ResolveError> {
        let target = match Query::classify(query)? {
            Query::Url {
                kind: SourceKind::Spotify,
                ..
            } => {
                // Spotify streams are DRM protected; only metadata would resolve
                return Err(ResolveError::UnsupportedSource("Spotify".into()));
            }
            Query::Url { url, .. } => url,
            Query::Search(terms) => format!("ytsearch1:{}", terms),
        };

        debug!("🔍 yt-dlp resolviendo: {}", target);

        let output = tokio::time::timeout(self.timeout, self.command(&target).output())
            .await
            .map_err(|_| ResolveError::Source(format!("yt-dlp tardó más de {:?}", self.timeout)))?
            .map_err(|e| ResolveError::Source(format!("no se pudo ejecutar yt-dlp: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("Unsupported URL") {
                return Err(ResolveError::UnsupportedSource(query.to_string()));
            }
            if stderr.contains("Video unavailable") || stderr.contains("Private video") {
                return Err(ResolveError::NotFound(query.to_string()));
            }
            return Err(ResolveError::Source(stderr.trim().to_string()));
        }

        track_from_dump(query, &output.stdout)
    }
}

#[derive(Debug, Deserialize)]
struct Dump {
    title: Option<String>,
    webpage_url: Option<String>,
    original_url: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    #[serde(default)]
    entries: Option<Vec<Dump>>,
}

/// Builds a track from `yt-dlp --dump-single-json` output. Search results
/// arrive as a playlist whose first entry is the hit.
fn track_from_dump(query: &str, raw: &[u8]) -> Result<Track, ResolveError> {
    let mut dump: Dump = serde_json::from_slice(raw)
        .map_err(|e| ResolveError::Source(format!("respuesta de yt-dlp inválida: {}", e)))?;

    if let Some(entries) = dump.entries.take() {
        dump = entries
            .into_iter()
            .next()
            .ok_or_else(|| ResolveError::NotFound(query.to_string()))?;
    }

    let url = dump
        .webpage_url
        .or(dump.original_url)
        .ok_or_else(|| ResolveError::NotFound(query.to_string()))?;
    let title = dump.title.unwrap_or_else(|| "Unknown".to_string());

    let mut track = Track::new(title, url.clone(), SourceKind::detect(&url));
    if let Some(duration) = dump
        .duration
        .filter(|secs| *secs > 0.0)
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    {
        track = track.with_duration(duration);
    }
    if let Some(thumbnail) = dump.thumbnail {
        track = track.with_thumbnail(thumbnail);
    }

    Ok(track)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_track_from_video_dump() {
        let raw = br#"{
            "title": "Rick Astley - Never Gonna Give You Up",
            "webpage_url": "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "duration": 212.0,
            "thumbnail": "https://i.ytimg.com/vi/dQw4w9WgXcQ/maxresdefault.jpg"
        }"#;

        let track = track_from_dump("rick", raw).unwrap();
        assert_eq!(track.title(), "Rick Astley - Never Gonna Give You Up");
        assert_eq!(track.source_url(), "https://www.youtube.com/watch?v=dQw4w9WgXcQ");
        assert_eq!(track.source_kind(), SourceKind::YouTube);
        assert_eq!(track.duration(), Some(Duration::from_secs(212)));
        assert!(track.thumbnail_url().is_some());
    }

    #[test]
    fn test_track_from_search_dump() {
        let raw = br#"{
            "_type": "playlist",
            "title": "one more time",
            "entries": [
                {"title": "Daft Punk - One More Time", "webpage_url": "https://www.youtube.com/watch?v=FGBhQbmPwH8", "duration": null}
            ]
        }"#;

        let track = track_from_dump("one more time", raw).unwrap();
        assert_eq!(track.title(), "Daft Punk - One More Time");
        assert_eq!(track.duration(), None);
    }

    #[test]
    fn test_out_of_range_duration_is_dropped() {
        let raw = br#"{"title": "forever", "webpage_url": "https://www.youtube.com/watch?v=forever", "duration": 1e300}"#;
        let track = track_from_dump("forever", raw).unwrap();
        assert_eq!(track.duration(), None);
    }

    #[test]
    fn test_empty_search_is_not_found() {
        let raw = br#"{"title": "nothing", "entries": []}"#;
        assert_eq!(
            track_from_dump("nothing", raw),
            Err(ResolveError::NotFound("nothing".into()))
        );
    }

    #[test]
    fn test_garbage_is_source_error() {
        assert!(matches!(track_from_dump("x", b"not json"), Err(ResolveError::Source(_))));
    }

    #[tokio::test]
    async fn test_spotify_is_unsupported() {
        let resolver = YtDlpResolver::new();
        let err = resolver
            .resolve("https://open.spotify.com/track/4cOdK2wGLETKBW3PvgPWqT")
            .await
            .unwrap_err();
        assert_eq!(err, ResolveError::UnsupportedSource("Spotify".into()));
    }
}
