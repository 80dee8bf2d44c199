//! # Guild Jukebox
//!
//! Multi-guild audio playback for Discord: every guild gets its own queue
//! and playback session, driven by chat commands and voice events, with
//! queues persisted across restarts.
//!
//! - [`audio`]: queues, sessions, the session registry and the player facade
//! - [`transport`]: the voice transport contract and its Songbird backend
//! - [`sources`]: resolving queries to tracks
//! - [`storage`]: queue persistence
//! - [`bot`]: Serenity event handler
//! - [`config`]: environment configuration
//! - [`error`]: error types

pub mod audio;
pub mod bot;
pub mod config;
pub mod error;
pub mod sources;
pub mod storage;
pub mod transport;
