use async_trait::async_trait;
use dashmap::DashMap;
use serenity::model::id::GuildId;
use songbird::{
    input::{Input, YoutubeDl},
    tracks::{PlayMode, TrackHandle},
    Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{EventSink, Transport, TransportEvent, TransportHandle, VoiceTarget};
use crate::error::TransportError;

/// Voice transport backed by Songbird. Audio is pulled through yt-dlp.
pub struct SongbirdTransport {
    manager: Arc<Songbird>,
    http: reqwest::Client,
    tracks: DashMap<GuildId, TrackHandle>,
}

impl SongbirdTransport {
    pub fn new(manager: Arc<Songbird>) -> Self {
        Self {
            manager,
            http: reqwest::Client::new(),
            tracks: DashMap::new(),
        }
    }

    fn track(&self, handle: &TransportHandle) -> Result<TrackHandle, TransportError> {
        self.tracks
            .get(&handle.guild_id())
            .map(|track| track.clone())
            .ok_or(TransportError::Disconnected)
    }
}

#[async_trait]
impl Transport for SongbirdTransport {
    async fn connect(&self, target: VoiceTarget) -> Result<TransportHandle, TransportError> {
        info!("🔗 Conectando al canal {} en guild {}", target.channel_id, target.guild_id);

        self.manager
            .join(target.guild_id, target.channel_id)
            .await
            .map_err(|e| TransportError::Connect(format!("{:?}", e)))?;

        info!("✅ Conectado al canal {} en guild {}", target.channel_id, target.guild_id);
        Ok(TransportHandle::new(target))
    }

    async fn disconnect(&self, handle: &TransportHandle) {
        if let Some((_, track)) = self.tracks.remove(&handle.guild_id()) {
            let _ = track.stop();
        }

        if let Err(e) = self.manager.remove(handle.guild_id()).await {
            warn!("⚠️ Error al salir del canal en guild {}: {:?}", handle.guild_id(), e);
        } else {
            info!("👋 Desconectado de guild {}", handle.guild_id());
        }
    }

    async fn stream(
        &self,
        handle: &TransportHandle,
        source_url: &str,
        gain: f32,
        sink: EventSink,
    ) -> Result<(), TransportError> {
        let call = self
            .manager
            .get(handle.guild_id())
            .ok_or(TransportError::Disconnected)?;

        let input: Input = YoutubeDl::new(self.http.clone(), source_url.to_string()).into();

        let track = {
            let mut call = call.lock().await;
            // one stream per call; the replaced track's End event is stale for the session
            call.stop();
            call.play_input(input)
        };

        track
            .set_volume(gain)
            .map_err(|e| TransportError::StreamStart(format!("{:?}", e)))?;

        for event in [TrackEvent::Play, TrackEvent::End, TrackEvent::Error] {
            track
                .add_event(
                    Event::Track(event),
                    StreamEventForwarder {
                        guild_id: handle.guild_id(),
                        sink: sink.clone(),
                    },
                )
                .map_err(|e| TransportError::StreamStart(format!("{:?}", e)))?;
        }

        debug!("🎵 Stream {} iniciado en guild {}: {}", sink.stream(), handle.guild_id(), source_url);
        self.tracks.insert(handle.guild_id(), track);
        Ok(())
    }

    async fn set_gain(&self, handle: &TransportHandle, gain: f32) -> Result<(), TransportError> {
        self.track(handle)?
            .set_volume(gain)
            .map_err(|_| TransportError::Disconnected)
    }

    async fn pause(&self, handle: &TransportHandle) -> Result<(), TransportError> {
        self.track(handle)?.pause().map_err(|_| TransportError::Disconnected)
    }

    async fn resume(&self, handle: &TransportHandle) -> Result<(), TransportError> {
        self.track(handle)?.play().map_err(|_| TransportError::Disconnected)
    }

    async fn stop_stream(&self, handle: &TransportHandle) -> Result<(), TransportError> {
        match self.tracks.remove(&handle.guild_id()) {
            Some((_, track)) => track.stop().map_err(|_| TransportError::Disconnected),
            None => Ok(()),
        }
    }
}

/// Forwards Songbird track events into the owning session's inbox.
struct StreamEventForwarder {
    guild_id: GuildId,
    sink: EventSink,
}

#[async_trait]
impl VoiceEventHandler for StreamEventForwarder {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        if let EventContext::Track(track_list) = ctx {
            for (state, _handle) in *track_list {
                let event = match &state.playing {
                    PlayMode::Play => TransportEvent::Started,
                    PlayMode::End | PlayMode::Stop => TransportEvent::Finished,
                    PlayMode::Errored(e) => TransportEvent::Errored(format!("{:?}", e)),
                    _ => continue,
                };

                if !self.sink.emit(event) {
                    debug!("Sesión de guild {} ya no existe, evento descartado", self.guild_id);
                }
            }
        }

        None
    }
}
