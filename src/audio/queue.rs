use serenity::model::id::GuildId;
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tracing::{debug, info, warn};

use crate::{
    audio::track::Track,
    error::{PersistenceError, PlayerError},
    storage::{QueueSnapshot, QueueStore},
};

/// Result of a queue mutation that was applied in memory.
///
/// `degraded` carries the store failure, if any. The mutation stands either
/// way; callers decide whether to surface the failure or just log it.
#[must_use]
#[derive(Debug)]
pub struct Persisted<T> {
    pub value: T,
    pub degraded: Option<PersistenceError>,
}

impl<T> Persisted<T> {
    fn new(value: T, degraded: Option<PersistenceError>) -> Self {
        Self { value, degraded }
    }

    pub fn into_result(self) -> Result<T, PlayerError> {
        match self.degraded {
            Some(e) => Err(e.into()),
            None => Ok(self.value),
        }
    }
}

/// Ordered, store-backed track queue of one guild plus the track currently
/// bound to the transport.
pub struct GuildQueue {
    guild_id: GuildId,
    pending: VecDeque<Track>,
    current: Option<Track>,
    max_depth: Option<usize>,
    store: Arc<dyn QueueStore>,
}

impl GuildQueue {
    pub fn new(guild_id: GuildId, store: Arc<dyn QueueStore>, max_depth: Option<usize>) -> Self {
        Self {
            guild_id,
            pending: VecDeque::new(),
            current: None,
            max_depth,
            store,
        }
    }

    /// Rebuilds the queue from its stored row. A failed load starts empty and
    /// reports the failure so the caller can log degraded persistence.
    pub async fn load(guild_id: GuildId, store: Arc<dyn QueueStore>, max_depth: Option<usize>) -> Persisted<Self> {
        let mut queue = Self::new(guild_id, store, max_depth);

        match queue.store.load(guild_id).await {
            Ok(Some(snapshot)) => {
                info!(
                    "📂 Cola restaurada para guild {}: {} pendientes, actual: {}",
                    guild_id,
                    snapshot.pending.len(),
                    snapshot.current.as_ref().map(|t| t.title()).unwrap_or("ninguna")
                );
                queue.pending = snapshot.pending.into();
                queue.current = snapshot.current;
                Persisted::new(queue, None)
            }
            Ok(None) => Persisted::new(queue, None),
            Err(e) => {
                warn!("⚠️ No se pudo cargar la cola de guild {}: {}", guild_id, e);
                Persisted::new(queue, Some(e))
            }
        }
    }

    /// Appends a track and returns the new number of pending tracks.
    pub async fn enqueue(&mut self, track: Track) -> Result<Persisted<usize>, PlayerError> {
        if let Some(max) = self.max_depth {
            if self.pending.len() >= max {
                return Err(PlayerError::QueueFull { max });
            }
        }

        info!("➕ Agregado a la cola de guild {}: {}", self.guild_id, track.title());
        self.pending.push_back(track);

        let degraded = self.persist().await;
        Ok(Persisted::new(self.pending.len(), degraded))
    }

    /// Promotes the head of `pending` into `current`, or clears `current` when
    /// nothing is left. This is the only mutation that changes what is playing.
    pub async fn advance(&mut self) -> Persisted<Option<Track>> {
        self.current = self.pending.pop_front();

        match &self.current {
            Some(track) => info!("➡️ Siguiente en cola (guild {}): {}", self.guild_id, track.title()),
            None => info!("📭 Cola vacía en guild {}", self.guild_id),
        }

        let degraded = self.persist().await;
        Persisted::new(self.current.clone(), degraded)
    }

    /// Puts `current` back at the head of `pending`. Returns whether there was
    /// a current track to move.
    pub async fn requeue_current(&mut self) -> Persisted<bool> {
        let Some(track) = self.current.take() else {
            return Persisted::new(false, None);
        };

        debug!("↩️ Track devuelto al frente de la cola: {}", track.title());
        self.pending.push_front(track);

        let degraded = self.persist().await;
        Persisted::new(true, degraded)
    }

    /// Drops everything and removes the stored row. Returns how many pending
    /// tracks were discarded.
    pub async fn clear(&mut self) -> Persisted<usize> {
        let cleared = self.pending.len();
        self.pending.clear();
        self.current = None;

        info!("🗑️ Cola limpiada en guild {}: {} tracks removidos", self.guild_id, cleared);

        let degraded = self.persist().await;
        Persisted::new(cleared, degraded)
    }

    pub fn peek_current(&self) -> Option<&Track> {
        self.current.as_ref()
    }

    pub fn peek_pending(&self) -> Vec<Track> {
        self.pending.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.current.is_none()
    }

    /// Known duration of the current track plus everything pending.
    pub fn total_duration(&self) -> Duration {
        self.current
            .iter()
            .chain(self.pending.iter())
            .filter_map(Track::duration)
            .sum()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot::new(self.guild_id, self.peek_pending(), self.current.clone())
    }

    async fn persist(&self) -> Option<PersistenceError> {
        let result = if self.is_empty() {
            self.store.delete(self.guild_id).await
        } else {
            self.store.save(self.guild_id, &self.snapshot()).await
        };

        result
            .map_err(|e| {
                warn!("⚠️ Persistencia degradada para guild {}: {}", self.guild_id, e);
                e
            })
            .err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::track::SourceKind,
        storage::{MemoryQueueStore, MockQueueStore},
    };
    use pretty_assertions::assert_eq;

    fn track(name: &str) -> Track {
        Track::new(name, format!("https://youtu.be/{name}"), SourceKind::YouTube)
    }

    fn titles(tracks: &[Track]) -> Vec<&str> {
        tracks.iter().map(Track::title).collect()
    }

    #[tokio::test]
    async fn test_enqueue_preserves_order() {
        let store = Arc::new(MemoryQueueStore::new());
        let mut queue = GuildQueue::new(GuildId::new(1), store.clone(), None);

        for (i, name) in ["a", "b", "c", "d"].into_iter().enumerate() {
            let len = queue.enqueue(track(name)).await.unwrap().into_result().unwrap();
            assert_eq!(len, i + 1);
        }

        assert_eq!(titles(&queue.peek_pending()), vec!["a", "b", "c", "d"]);
        assert_eq!(store.get(GuildId::new(1)).unwrap().pending.len(), 4);
    }

    #[tokio::test]
    async fn test_advance_walks_the_queue() {
        let store = Arc::new(MemoryQueueStore::new());
        let mut queue = GuildQueue::new(GuildId::new(1), store.clone(), None);
        let _ = queue.enqueue(track("a")).await.unwrap();
        let _ = queue.enqueue(track("b")).await.unwrap();

        assert_eq!(queue.advance().await.value, Some(track("a")));
        assert_eq!(queue.peek_current(), Some(&track("a")));
        assert_eq!(queue.peek_pending(), vec![track("b")]);

        assert_eq!(queue.advance().await.value, Some(track("b")));
        assert!(queue.peek_pending().is_empty());
        let row = store.get(GuildId::new(1)).unwrap();
        assert_eq!(row.current, Some(track("b")));

        assert_eq!(queue.advance().await.value, None);
        assert_eq!(queue.peek_current(), None);
        // empty queue means the row is gone
        assert!(!store.contains(GuildId::new(1)));
    }

    #[tokio::test]
    async fn test_max_depth_rejects_without_adding() {
        let store = Arc::new(MemoryQueueStore::new());
        let mut queue = GuildQueue::new(GuildId::new(1), store, Some(2));
        let _ = queue.enqueue(track("a")).await.unwrap();
        let _ = queue.enqueue(track("b")).await.unwrap();

        let err = queue.enqueue(track("c")).await.unwrap_err();
        assert!(matches!(err, PlayerError::QueueFull { max: 2 }));
        assert_eq!(titles(&queue.peek_pending()), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_requeue_current_goes_to_the_front() {
        let store = Arc::new(MemoryQueueStore::new());
        let mut queue = GuildQueue::new(GuildId::new(1), store, None);
        let _ = queue.enqueue(track("a")).await.unwrap();
        let _ = queue.enqueue(track("b")).await.unwrap();
        let _ = queue.advance().await;

        assert!(queue.requeue_current().await.value);
        assert_eq!(queue.peek_current(), None);
        assert_eq!(titles(&queue.peek_pending()), vec!["a", "b"]);
        assert!(!queue.requeue_current().await.value);
    }

    #[tokio::test]
    async fn test_clear_deletes_row() {
        let store = Arc::new(MemoryQueueStore::new());
        let mut queue = GuildQueue::new(GuildId::new(5), store.clone(), None);
        let _ = queue.enqueue(track("a")).await.unwrap();
        let _ = queue.enqueue(track("b")).await.unwrap();
        let _ = queue.advance().await;

        assert_eq!(queue.clear().await.value, 1);
        assert!(queue.is_empty());
        assert!(!store.contains(GuildId::new(5)));
    }

    #[tokio::test]
    async fn test_load_restores_snapshot() {
        let store = Arc::new(MemoryQueueStore::new());
        let guild = GuildId::new(8);
        let snapshot = QueueSnapshot::new(guild, vec![track("b"), track("c")], Some(track("a")));
        store.save(guild, &snapshot).await.unwrap();

        let loaded = GuildQueue::load(guild, store, None).await;
        assert!(loaded.degraded.is_none());
        let queue = loaded.value;
        assert_eq!(queue.peek_current(), Some(&track("a")));
        assert_eq!(titles(&queue.peek_pending()), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_total_duration_skips_unknown() {
        let store = Arc::new(MemoryQueueStore::new());
        let mut queue = GuildQueue::new(GuildId::new(1), store, None);
        let _ = queue.enqueue(track("a").with_duration(Duration::from_secs(100))).await.unwrap();
        let _ = queue.enqueue(track("b")).await.unwrap();
        let _ = queue.enqueue(track("c").with_duration(Duration::from_secs(20))).await.unwrap();
        let _ = queue.advance().await;

        assert_eq!(queue.total_duration(), Duration::from_secs(120));
    }

    #[tokio::test]
    async fn test_store_failure_keeps_mutation() {
        let mut store = MockQueueStore::new();
        store
            .expect_save()
            .returning(|_, _| Err(PersistenceError::Backend("disk full".into())));
        let mut queue = GuildQueue::new(GuildId::new(1), Arc::new(store), None);

        let result = queue.enqueue(track("a")).await.unwrap();
        assert!(result.degraded.is_some());
        assert!(matches!(result.into_result(), Err(PlayerError::Persistence(_))));
        // in-memory state is still authoritative
        assert_eq!(queue.peek_pending(), vec![track("a")]);
    }

    #[tokio::test]
    async fn test_failed_load_starts_empty() {
        let mut store = MockQueueStore::new();
        store
            .expect_load()
            .returning(|_| Err(PersistenceError::Backend("unreachable".into())));

        let loaded = GuildQueue::load(GuildId::new(1), Arc::new(store), None).await;
        assert!(loaded.degraded.is_some());
        assert!(loaded.value.is_empty());
    }
}
