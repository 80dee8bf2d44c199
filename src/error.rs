//! Error types for the playback core.
//!
//! Command-facing failures are [`PlayerError`]. The consumed capabilities
//! (resolver, transport, queue store) each have their own enum so adapters
//! can report failures without knowing about sessions.

use thiserror::Error;

/// Failures reported by a [`TrackResolver`](crate::sources::TrackResolver).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no track found for `{0}`")]
    NotFound(String),

    #[error("source rejected the request: {0}")]
    Source(String),

    #[error("unsupported source: {0}")]
    UnsupportedSource(String),
}

/// Failures reported by a [`Transport`](crate::transport::Transport).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("could not connect to voice: {0}")]
    Connect(String),

    #[error("stream failed to start: {0}")]
    StreamStart(String),

    #[error("transport handle is no longer connected")]
    Disconnected,
}

/// Failures reported by a [`QueueStore`](crate::storage::QueueStore).
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("queue store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("queue snapshot is malformed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("queue store backend failed: {0}")]
    Backend(String),
}

/// Errors returned by the per-guild playback surface.
#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("the queue is full (max {max} tracks)")]
    QueueFull { max: usize },

    #[error("the queue is empty")]
    EmptyQueue,

    #[error("already playing")]
    AlreadyPlaying,

    #[error("nothing is playing")]
    NotPlaying,

    #[error("volume must be between 0.0 and 1.0, got {0}")]
    InvalidVolume(f32),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The in-memory operation was applied; only durability is degraded.
    #[error("queue persistence degraded: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("session invariant violated: {0}")]
    InvariantViolation(String),

    /// The session retired before it could process the command.
    #[error("session for this guild has been retired")]
    SessionRetired,
}

/// Coarse classification used by callers to decide how to present an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    User,
    Upstream,
    Transport,
    Persistence,
    Invariant,
}

impl PlayerError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            PlayerError::QueueFull { .. }
            | PlayerError::EmptyQueue
            | PlayerError::AlreadyPlaying
            | PlayerError::NotPlaying
            | PlayerError::InvalidVolume(_) => ErrorCategory::User,
            PlayerError::Resolve(_) => ErrorCategory::Upstream,
            PlayerError::Transport(_) => ErrorCategory::Transport,
            PlayerError::Persistence(_) => ErrorCategory::Persistence,
            PlayerError::InvariantViolation(_) | PlayerError::SessionRetired => {
                ErrorCategory::Invariant
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, PlayerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories_follow_taxonomy() {
        assert_eq!(PlayerError::InvalidVolume(1.5).category(), ErrorCategory::User);
        assert_eq!(PlayerError::EmptyQueue.category(), ErrorCategory::User);
        assert_eq!(
            PlayerError::from(ResolveError::NotFound("x".into())).category(),
            ErrorCategory::Upstream
        );
        assert_eq!(
            PlayerError::from(TransportError::Connect("refused".into())).category(),
            ErrorCategory::Transport
        );
        assert_eq!(
            PlayerError::from(PersistenceError::Backend("down".into())).category(),
            ErrorCategory::Persistence
        );
        assert_eq!(
            PlayerError::InvariantViolation("x".into()).category(),
            ErrorCategory::Invariant
        );
    }
}
