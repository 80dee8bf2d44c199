//! Turning user input (a URL or free text) into a playable [`Track`].

pub mod ytdlp;

use async_trait::async_trait;
use url::Url;

use crate::{
    audio::track::{SourceKind, Track},
    error::ResolveError,
};

pub use ytdlp::YtDlpResolver;

/// Resolves a query to track metadata. The session never retries resolution;
/// failures go straight back to the caller.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TrackResolver: Send + Sync {
    async fn resolve(&self, query: &str) -> Result<Track, ResolveError>;
}

/// What the user typed, after a first look.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Url { url: String, kind: SourceKind },
    Search(String),
}

impl Query {
    /// Classifies raw input. Anything that parses as an http(s) URL is a URL;
    /// the rest is a search.
    pub fn classify(input: &str) -> Result<Self, ResolveError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ResolveError::NotFound("empty query".into()));
        }

        match Url::parse(input) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {
                let kind = SourceKind::detect(input);
                if kind == SourceKind::Unknown {
                    return Err(ResolveError::UnsupportedSource(
                        url.host_str().unwrap_or(input).to_string(),
                    ));
                }
                Ok(Query::Url {
                    url: input.to_string(),
                    kind,
                })
            }
            _ => Ok(Query::Search(input.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_classify() {
        assert_eq!(
            Query::classify(" https://www.youtube.com/watch?v=dQw4w9WgXcQ ").unwrap(),
            Query::Url {
                url: "https://www.youtube.com/watch?v=dQw4w9WgXcQ".into(),
                kind: SourceKind::YouTube,
            }
        );
        assert_eq!(
            Query::classify("daft punk one more time").unwrap(),
            Query::Search("daft punk one more time".into())
        );
        assert!(matches!(Query::classify("   "), Err(ResolveError::NotFound(_))));
        assert_eq!(
            Query::classify("https://example.com/song.mp3"),
            Err(ResolveError::UnsupportedSource("example.com".into()))
        );
    }
}
