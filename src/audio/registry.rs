use dashmap::{mapref::entry::Entry, DashMap};
use futures::future::join_all;
use serenity::model::id::GuildId;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::session::{PlaybackSession, SessionContext, SessionEvent, SessionHandle, StopReason};
use crate::{config::PlayerConfig, storage::QueueStore, transport::Transport};

const EVENT_CAPACITY: usize = 256;

/// Guild → live session map shared between the registry and its sessions.
#[derive(Clone, Default)]
pub(crate) struct SessionDirectory {
    sessions: Arc<DashMap<GuildId, SessionHandle>>,
}

impl SessionDirectory {
    /// Drops the entry for `guild_id` only if it still belongs to `instance`,
    /// so a stopping session never evicts its replacement.
    pub(crate) fn remove(&self, guild_id: GuildId, instance: u64) -> bool {
        let removed = self
            .sessions
            .remove_if(&guild_id, |_, handle| handle.instance() == instance)
            .is_some();

        if removed {
            debug!("🗑️ Sesión {} de guild {} eliminada del registro", instance, guild_id);
        }
        removed
    }
}

/// Owns the mapping from guild to its single live [`PlaybackSession`].
pub struct SessionRegistry {
    ctx: SessionContext,
    next_instance: AtomicU64,
}

impl SessionRegistry {
    pub fn new(transport: Arc<dyn Transport>, store: Arc<dyn QueueStore>, config: PlayerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            ctx: SessionContext {
                transport,
                store,
                config: Arc::new(config),
                events,
                directory: SessionDirectory::default(),
            },
            next_instance: AtomicU64::new(1),
        }
    }

    /// Returns the guild's live session, creating it if there is none.
    ///
    /// Concurrent callers for the same guild all receive the same session.
    /// A session that retired but has not yet unregistered is replaced.
    pub fn get_or_create(&self, guild_id: GuildId) -> SessionHandle {
        match self.ctx.directory.sessions.entry(guild_id) {
            Entry::Occupied(entry) if !entry.get().is_retired() => entry.get().clone(),
            Entry::Occupied(mut entry) => {
                let handle = self.spawn(guild_id);
                entry.insert(handle.clone());
                handle
            }
            Entry::Vacant(entry) => {
                let handle = self.spawn(guild_id);
                entry.insert(handle.clone());
                handle
            }
        }
    }

    /// Returns the guild's live session without creating one.
    pub fn get(&self, guild_id: GuildId) -> Option<SessionHandle> {
        self.ctx
            .directory
            .sessions
            .get(&guild_id)
            .map(|handle| handle.clone())
            .filter(|handle| !handle.is_retired())
    }

    pub fn contains(&self, guild_id: GuildId) -> bool {
        self.get(guild_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.ctx.directory.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ctx.directory.sessions.is_empty()
    }

    pub fn guild_ids(&self) -> Vec<GuildId> {
        self.ctx.directory.sessions.iter().map(|entry| *entry.key()).collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.ctx.events.subscribe()
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.ctx.config
    }

    /// Stops every live session, keeping their queues for the next start.
    pub async fn shutdown(&self) {
        let handles: Vec<SessionHandle> = self
            .ctx
            .directory
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        info!("🛑 Cerrando {} sesiones activas", handles.len());
        join_all(handles.iter().map(|handle| handle.stop(StopReason::Shutdown))).await;
    }

    fn spawn(&self, guild_id: GuildId) -> SessionHandle {
        let instance = self.next_instance.fetch_add(1, Ordering::Relaxed);
        PlaybackSession::spawn(guild_id, instance, self.ctx.clone())
    }
}
