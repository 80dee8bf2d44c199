use serenity::model::id::{ChannelId, GuildId};
use std::{future::Future, sync::Arc};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    audio::{
        registry::SessionRegistry,
        session::{SessionEvent, SessionHandle, SessionState, SessionStatus, StopReason},
        track::Track,
    },
    error::{PlayerError, ResolveError, Result},
    sources::TrackResolver,
};

/// Retries against a fresh session when the one we reached retired mid-call.
const MAX_SESSION_ATTEMPTS: usize = 3;

/// Punto de entrada de la capa de comandos: una operación por guild.
pub struct AudioPlayer {
    registry: Arc<SessionRegistry>,
    resolver: Option<Arc<dyn TrackResolver>>,
}

impl AudioPlayer {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            resolver: None,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn TrackResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Agrega un track a la cola; devuelve cuántos quedan pendientes
    pub async fn enqueue(&self, guild_id: GuildId, channel_id: ChannelId, track: Track) -> Result<usize> {
        debug!("➕ Encolando en guild {}: {}", guild_id, track.title());
        self.with_session(guild_id, |session| {
            let track = track.clone();
            async move { session.enqueue(channel_id, track).await }
        })
        .await
    }

    /// Resuelve una búsqueda o URL y la agrega a la cola
    pub async fn resolve_and_enqueue(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        query: &str,
    ) -> Result<(Track, usize)> {
        let resolver = self
            .resolver
            .as_ref()
            .ok_or_else(|| ResolveError::Source("no track resolver configured".into()))?;

        let track = resolver.resolve(query).await?;
        info!("🔍 '{}' resuelto como: {}", query, track);

        let position = self.enqueue(guild_id, channel_id, track.clone()).await?;
        Ok((track, position))
    }

    /// Inicia la reproducción desde la cola, o reanuda si está pausada
    pub async fn play(&self, guild_id: GuildId) -> Result<()> {
        self.with_session(guild_id, |session| async move { session.play().await })
            .await
    }

    /// Pausa la reproducción actual
    pub async fn pause(&self, guild_id: GuildId) -> Result<()> {
        self.existing(guild_id)?.pause().await
    }

    /// Reanuda la reproducción
    pub async fn resume(&self, guild_id: GuildId) -> Result<()> {
        self.existing(guild_id)?.resume().await
    }

    /// Salta a la siguiente canción
    pub async fn skip(&self, guild_id: GuildId) -> Result<()> {
        self.existing(guild_id)?.skip().await
    }

    /// Detiene la reproducción, limpia la cola y sale del canal
    pub async fn stop(&self, guild_id: GuildId) {
        match self.registry.get(guild_id) {
            Some(session) => session.stop(StopReason::Command).await,
            None => debug!("Stop en guild {} sin sesión activa", guild_id),
        }
    }

    /// El bot fue desconectado del canal de voz. Solo detiene la sesión si
    /// tenía conexión: una sesión creada después de esa salida no se toca.
    pub async fn voice_lost(&self, guild_id: GuildId) {
        let Some(session) = self.registry.get(guild_id) else {
            return;
        };

        match session.status().await {
            Ok(status) if status.connected => session.stop(StopReason::Command).await,
            Ok(_) => debug!("Desconexión de voz ajena a la sesión de guild {}", guild_id),
            Err(e) => debug!("Sesión de guild {} ya retirada: {}", guild_id, e),
        }
    }

    /// Ajusta el volumen (0.0 - 1.0)
    pub async fn set_volume(&self, guild_id: GuildId, volume: f32) -> Result<()> {
        if !(0.0..=1.0).contains(&volume) {
            return Err(PlayerError::InvalidVolume(volume));
        }

        self.with_session(guild_id, |session| async move { session.set_volume(volume).await })
            .await
    }

    /// Obtiene el track actual
    pub async fn current_track(&self, guild_id: GuildId) -> Option<Track> {
        self.with_session(guild_id, |session| async move { session.current_track().await })
            .await
            .unwrap_or_else(|e| {
                warn!("⚠️ No se pudo consultar el track actual de guild {}: {}", guild_id, e);
                None
            })
    }

    /// Obtiene la cola pendiente (sin el track actual)
    pub async fn list_queue(&self, guild_id: GuildId) -> Vec<Track> {
        self.with_session(guild_id, |session| async move { session.list_queue().await })
            .await
            .unwrap_or_else(|e| {
                warn!("⚠️ No se pudo consultar la cola de guild {}: {}", guild_id, e);
                Vec::new()
            })
    }

    /// Estado de la sesión, si existe
    pub async fn status(&self, guild_id: GuildId) -> Option<SessionStatus> {
        self.registry.get(guild_id)?.status().await.ok()
    }

    pub async fn state(&self, guild_id: GuildId) -> Option<SessionState> {
        self.status(guild_id).await.map(|status| status.state)
    }

    pub async fn volume(&self, guild_id: GuildId) -> Option<f32> {
        self.status(guild_id).await.map(|status| status.volume)
    }

    /// Nadie más queda en el canal de voz del bot
    pub async fn channel_empty(&self, guild_id: GuildId) {
        if let Some(session) = self.registry.get(guild_id) {
            let _ = session.channel_empty().await;
        }
    }

    /// Alguien volvió al canal de voz del bot
    pub async fn channel_occupied(&self, guild_id: GuildId) {
        if let Some(session) = self.registry.get(guild_id) {
            let _ = session.channel_occupied().await;
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.registry.subscribe()
    }

    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }

    fn existing(&self, guild_id: GuildId) -> Result<SessionHandle> {
        self.registry.get(guild_id).ok_or(PlayerError::NotPlaying)
    }

    async fn with_session<T, F, Fut>(&self, guild_id: GuildId, op: F) -> Result<T>
    where
        F: Fn(SessionHandle) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            let session = self.registry.get_or_create(guild_id);
            match op(session).await {
                Err(PlayerError::SessionRetired) if attempt < MAX_SESSION_ATTEMPTS => {
                    debug!("Sesión de guild {} retirada, reintentando ({})", guild_id, attempt);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}
