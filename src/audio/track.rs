use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::LazyLock, time::Duration};

static YOUTUBE_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(https?://)?(www\.|m\.)?(youtube\.com/(watch\?v=|embed/|v/|shorts/)|youtu\.be/|music\.youtube\.com/)")
        .expect("youtube pattern compiles")
});

static SPOTIFY_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(https?://)?open\.spotify\.com/(intl-[a-z]+/)?(track|album|playlist)/")
        .expect("spotify pattern compiles")
});

static SOUNDCLOUD_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(https?://)?(www\.|m\.)?(soundcloud\.com|on\.soundcloud\.com)/")
        .expect("soundcloud pattern compiles")
});

/// Catalog a track was resolved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    YouTube,
    Spotify,
    SoundCloud,
    Unknown,
}

impl SourceKind {
    /// Classifies a URL by host pattern. Anything unrecognised is `Unknown`.
    pub fn detect(url: &str) -> Self {
        if YOUTUBE_URL.is_match(url) {
            SourceKind::YouTube
        } else if SPOTIFY_URL.is_match(url) {
            SourceKind::Spotify
        } else if SOUNDCLOUD_URL.is_match(url) {
            SourceKind::SoundCloud
        } else {
            SourceKind::Unknown
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SourceKind::YouTube => "YouTube",
            SourceKind::Spotify => "Spotify",
            SourceKind::SoundCloud => "SoundCloud",
            SourceKind::Unknown => "unknown",
        }
    }
}

/// Immutable descriptor of a playable item.
///
/// Two tracks are equal when they point at the same `source_url`, whatever
/// metadata the resolver attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    title: String,
    source_url: String,
    duration: Option<Duration>,
    thumbnail_url: Option<String>,
    source_kind: SourceKind,
}

impl Track {
    pub fn new(title: impl Into<String>, source_url: impl Into<String>, source_kind: SourceKind) -> Self {
        Self {
            title: title.into(),
            source_url: source_url.into(),
            duration: None,
            thumbnail_url: None,
            source_kind,
        }
    }

    /// A zero duration means the resolver did not know it.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = (!duration.is_zero()).then_some(duration);
        self
    }

    pub fn with_thumbnail(mut self, thumbnail_url: impl Into<String>) -> Self {
        self.thumbnail_url = Some(thumbnail_url.into());
        self
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    pub fn thumbnail_url(&self) -> Option<&str> {
        self.thumbnail_url.as_deref()
    }

    pub fn source_kind(&self) -> SourceKind {
        self.source_kind
    }
}

impl PartialEq for Track {
    fn eq(&self, other: &Self) -> bool {
        self.source_url == other.source_url
    }
}

impl Eq for Track {}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.duration {
            Some(duration) => write!(f, "{} ({})", self.title, humantime::format_duration(duration)),
            None => write!(f, "{}", self.title),
        }
    }
}
