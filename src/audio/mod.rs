//! # Audio Module
//!
//! Per-guild playback orchestration.
//!
//! ### [`track`]
//! Immutable track descriptors and source detection.
//!
//! ### [`queue`]
//! A guild's ordered pending list plus the current track, persisted through a
//! [`QueueStore`](crate::storage::QueueStore) on every mutation.
//!
//! ### [`session`]
//! The playback state machine. One actor task per guild owns its queue and
//! voice connection, and serialises commands, transport events and timers.
//!
//! ### [`registry`]
//! Guild → session map with per-guild creation exclusion.
//!
//! ### [`player`]
//! The facade the command layer talks to.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use guild_jukebox::{
//!     audio::{player::AudioPlayer, registry::SessionRegistry, track::{SourceKind, Track}},
//!     config::PlayerConfig,
//!     storage::MemoryQueueStore,
//!     transport::Transport,
//! };
//! use serenity::all::{ChannelId, GuildId};
//! use std::sync::Arc;
//!
//! # async fn example(transport: Arc<dyn Transport>) -> guild_jukebox::error::Result<()> {
//! let registry = SessionRegistry::new(transport, Arc::new(MemoryQueueStore::new()), PlayerConfig::default());
//! let player = AudioPlayer::new(Arc::new(registry));
//! let guild_id = GuildId::new(123456789);
//!
//! let track = Track::new("Song", "https://youtu.be/dQw4w9WgXcQ", SourceKind::YouTube);
//! player.enqueue(guild_id, ChannelId::new(42), track).await?;
//!
//! player.pause(guild_id).await?;
//! player.resume(guild_id).await?;
//! player.skip(guild_id).await?;
//! player.stop(guild_id).await;
//! # Ok(())
//! # }
//! ```

pub mod player;
pub mod queue;
pub mod registry;
pub mod session;
pub mod track;

pub use player::AudioPlayer;
pub use registry::SessionRegistry;
pub use session::{SessionEvent, SessionState, StopReason};
pub use track::{SourceKind, Track};
