//! # Transport
//!
//! The audio delivery channel a session drives: connect to a guild's voice
//! channel, stream a source URL into it, control gain, and report lifecycle
//! events back.
//!
//! Events are not delivered through callbacks that capture guild state.
//! Every stream gets an [`EventSink`] bound to the owning session's inbox and
//! tagged with a [`StreamId`], so late events from a stream the session has
//! already moved past can be recognised and dropped.

pub mod discord;

#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId};
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use crate::error::TransportError;

pub use self::discord::SongbirdTransport;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// Where to connect: a voice channel inside a guild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoiceTarget {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
}

/// Opaque reference to an established voice connection.
///
/// Owned by exactly one session while connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportHandle {
    target: VoiceTarget,
    connection: u64,
}

impl TransportHandle {
    pub fn new(target: VoiceTarget) -> Self {
        Self {
            target,
            connection: NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn guild_id(&self) -> GuildId {
        self.target.guild_id
    }

    pub fn channel_id(&self) -> ChannelId {
        self.target.channel_id
    }

    pub fn connection(&self) -> u64 {
        self.connection
    }
}

/// Identifies one `stream` call within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle signal for a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Started,
    Finished,
    Errored(String),
}

type Deliver = dyn Fn(StreamId, TransportEvent) -> bool + Send + Sync;

/// Delivery endpoint for one stream's events.
#[derive(Clone)]
pub struct EventSink {
    stream: StreamId,
    deliver: Arc<Deliver>,
}

impl EventSink {
    pub fn new<F>(stream: StreamId, deliver: F) -> Self
    where
        F: Fn(StreamId, TransportEvent) -> bool + Send + Sync + 'static,
    {
        Self {
            stream,
            deliver: Arc::new(deliver),
        }
    }

    pub fn stream(&self) -> StreamId {
        self.stream
    }

    /// Returns `false` once the receiving session is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        (self.deliver)(self.stream, event)
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink").field("stream", &self.stream).finish()
    }
}

/// Voice transport consumed by playback sessions.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, target: VoiceTarget) -> Result<TransportHandle, TransportError>;

    /// Tears the connection down. Never fails from the caller's point of view.
    async fn disconnect(&self, handle: &TransportHandle);

    /// Starts streaming `source_url` at `gain`, replacing whatever was
    /// playing on the handle. Lifecycle events go to `sink`.
    async fn stream(
        &self,
        handle: &TransportHandle,
        source_url: &str,
        gain: f32,
        sink: EventSink,
    ) -> Result<(), TransportError>;

    async fn set_gain(&self, handle: &TransportHandle, gain: f32) -> Result<(), TransportError>;

    async fn pause(&self, handle: &TransportHandle) -> Result<(), TransportError>;

    async fn resume(&self, handle: &TransportHandle) -> Result<(), TransportError>;

    /// Stops the current stream without disconnecting.
    async fn stop_stream(&self, handle: &TransportHandle) -> Result<(), TransportError>;
}
