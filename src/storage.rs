use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serenity::model::id::GuildId;
use std::{io::ErrorKind, path::PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::{audio::track::Track, error::PersistenceError};

/// Persisted state of one guild's queue. Always written as a whole row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub guild_id: GuildId,
    pub pending: Vec<Track>,
    pub current: Option<Track>,
    pub saved_at: DateTime<Utc>,
}

impl QueueSnapshot {
    pub fn new(guild_id: GuildId, pending: Vec<Track>, current: Option<Track>) -> Self {
        Self {
            guild_id,
            pending,
            current,
            saved_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.current.is_none()
    }
}

/// Durable key-value persistence of per-guild queue state.
///
/// Every operation touches a single guild's row; implementations must make
/// `save` an atomic replacement so `pending` and `current` never disagree.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn load(&self, guild_id: GuildId) -> Result<Option<QueueSnapshot>, PersistenceError>;

    async fn save(&self, guild_id: GuildId, snapshot: &QueueSnapshot) -> Result<(), PersistenceError>;

    async fn delete(&self, guild_id: GuildId) -> Result<(), PersistenceError>;
}

/// File-per-guild JSON store under `<data_dir>/queues`.
pub struct JsonQueueStore {
    queues_dir: PathBuf,
}

impl JsonQueueStore {
    pub async fn new(data_dir: PathBuf) -> Result<Self, PersistenceError> {
        let queues_dir = data_dir.join("queues");
        fs::create_dir_all(&queues_dir).await?;

        info!("📁 Queue store inicializado en: {}", queues_dir.display());

        Ok(Self { queues_dir })
    }

    /// Guilds that currently have a persisted queue row.
    pub async fn stored_guilds(&self) -> Result<Vec<GuildId>, PersistenceError> {
        let mut files = fs::read_dir(&self.queues_dir).await?;
        let mut guilds = Vec::new();

        while let Some(entry) = files.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                let guild = path
                    .file_stem()
                    .and_then(|n| n.to_str())
                    .and_then(|n| n.strip_prefix("guild_"))
                    .and_then(|id| id.parse::<u64>().ok())
                    .filter(|id| *id != 0);

                match guild {
                    Some(id) => guilds.push(GuildId::new(id)),
                    None => warn!("Archivo de cola ignorado: {}", path.display()),
                }
            }
        }

        Ok(guilds)
    }

    fn guild_file_path(&self, guild_id: GuildId) -> PathBuf {
        self.queues_dir.join(format!("guild_{}.json", guild_id))
    }
}

#[async_trait]
impl QueueStore for JsonQueueStore {
    async fn load(&self, guild_id: GuildId) -> Result<Option<QueueSnapshot>, PersistenceError> {
        let content = match fs::read_to_string(self.guild_file_path(guild_id)).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let snapshot: QueueSnapshot = serde_json::from_str(&content)?;
        debug!("📂 Cola cargada para guild {}: {} pendientes", guild_id, snapshot.pending.len());
        Ok(Some(snapshot))
    }

    async fn save(&self, guild_id: GuildId, snapshot: &QueueSnapshot) -> Result<(), PersistenceError> {
        let path = self.guild_file_path(guild_id);
        let tmp_path = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(snapshot)?;

        // rename is atomic on the same filesystem, so readers never see a torn row
        fs::write(&tmp_path, content).await?;
        fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    async fn delete(&self, guild_id: GuildId) -> Result<(), PersistenceError> {
        match fs::remove_file(self.guild_file_path(guild_id)).await {
            Ok(()) => {
                debug!("🗑️ Cola eliminada para guild {}", guild_id);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryQueueStore {
    rows: DashMap<GuildId, QueueSnapshot>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, guild_id: GuildId) -> bool {
        self.rows.contains_key(&guild_id)
    }

    pub fn get(&self, guild_id: GuildId) -> Option<QueueSnapshot> {
        self.rows.get(&guild_id).map(|row| row.clone())
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn load(&self, guild_id: GuildId) -> Result<Option<QueueSnapshot>, PersistenceError> {
        Ok(self.get(guild_id))
    }

    async fn save(&self, guild_id: GuildId, snapshot: &QueueSnapshot) -> Result<(), PersistenceError> {
        self.rows.insert(guild_id, snapshot.clone());
        Ok(())
    }

    async fn delete(&self, guild_id: GuildId) -> Result<(), PersistenceError> {
        self.rows.remove(&guild_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::track::SourceKind;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn snapshot(guild: u64) -> QueueSnapshot {
        QueueSnapshot::new(
            GuildId::new(guild),
            vec![
                Track::new("B", "https://youtu.be/b", SourceKind::YouTube).with_duration(Duration::from_secs(61)),
                Track::new("C", "https://soundcloud.com/x/c", SourceKind::SoundCloud)
                    .with_thumbnail("https://img/c.jpg"),
            ],
            Some(Track::new("A", "https://youtu.be/a", SourceKind::YouTube)),
        )
    }

    #[tokio::test]
    async fn test_json_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonQueueStore::new(dir.path().to_path_buf()).await.unwrap();
        let saved = snapshot(42);

        store.save(GuildId::new(42), &saved).await.unwrap();
        let loaded = store.load(GuildId::new(42)).await.unwrap().unwrap();

        assert_eq!(loaded, saved);
        assert_eq!(loaded.pending[0].duration(), Some(Duration::from_secs(61)));
        assert_eq!(loaded.pending[1].thumbnail_url(), Some("https://img/c.jpg"));
    }

    #[tokio::test]
    async fn test_json_store_missing_row_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonQueueStore::new(dir.path().to_path_buf()).await.unwrap();

        assert!(store.load(GuildId::new(7)).await.unwrap().is_none());
        // deleting an absent row is not an error
        store.delete(GuildId::new(7)).await.unwrap();

        store.save(GuildId::new(7), &snapshot(7)).await.unwrap();
        assert_eq!(store.stored_guilds().await.unwrap(), vec![GuildId::new(7)]);

        store.delete(GuildId::new(7)).await.unwrap();
        assert!(store.load(GuildId::new(7)).await.unwrap().is_none());
        assert!(store.stored_guilds().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_json_store_save_replaces_whole_row() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonQueueStore::new(dir.path().to_path_buf()).await.unwrap();
        let guild = GuildId::new(9);

        store.save(guild, &snapshot(9)).await.unwrap();
        let replacement = QueueSnapshot::new(guild, Vec::new(), Some(Track::new("Z", "https://youtu.be/z", SourceKind::YouTube)));
        store.save(guild, &replacement).await.unwrap();

        let loaded = store.load(guild).await.unwrap().unwrap();
        assert!(loaded.pending.is_empty());
        assert_eq!(loaded.current.map(|t| t.title().to_string()), Some("Z".to_string()));
        assert!(!dir.path().join("queues").join("guild_9.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_row_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonQueueStore::new(dir.path().to_path_buf()).await.unwrap();
        tokio::fs::write(dir.path().join("queues").join("guild_3.json"), "{not json")
            .await
            .unwrap();

        let err = store.load(GuildId::new(3)).await.unwrap_err();
        assert!(matches!(err, PersistenceError::Serialization(_)));
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryQueueStore::new();
        let saved = snapshot(1);

        store.save(GuildId::new(1), &saved).await.unwrap();
        assert_eq!(store.load(GuildId::new(1)).await.unwrap(), Some(saved));

        store.delete(GuildId::new(1)).await.unwrap();
        assert!(!store.contains(GuildId::new(1)));
    }
}
