//! Per-guild playback session.
//!
//! A session is an actor: one tokio task owning the guild's [`GuildQueue`]
//! and transport handle, fed by a single inbox. Commands, transport events
//! and timer expirations all arrive through that inbox and are handled one
//! at a time, in arrival order.
//!
//! ```text
//!          enqueue / play              stream started
//!   Idle ─────────────────► Connecting ──────────────► Playing ⇄ Paused
//!    ▲ ▲    connect failed     │   ▲                      │
//!    │ └───────────────────────┘   │ retry / next track   │ finished, error, skip
//!    │       queue drained         │                      ▼
//!    └─────────────────────────────┴──────────────── Transitioning
//!
//!   any ── stop / idle timeout / empty channel / invariant ──► Leaving ──► Stopped
//! ```

use serenity::model::id::{ChannelId, GuildId};
use std::{fmt, sync::Arc, time::Duration};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    audio::{
        queue::{GuildQueue, Persisted},
        registry::SessionDirectory,
        track::Track,
    },
    config::PlayerConfig,
    error::{PlayerError, Result, TransportError},
    storage::QueueStore,
    transport::{EventSink, StreamId, Transport, TransportEvent, TransportHandle, VoiceTarget},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Playing,
    Paused,
    Transitioning,
    Leaving,
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Why a session left its voice channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Command,
    IdleTimeout,
    ChannelEmpty,
    InvariantViolation,
    Shutdown,
}

impl StopReason {
    /// Explicit stops discard the queue; teardown for other reasons keeps it
    /// so the guild can pick up where it left off.
    fn clears_queue(self) -> bool {
        matches!(self, StopReason::Command | StopReason::ChannelEmpty)
    }
}

/// Notifications published to every [`SessionRegistry`](super::registry::SessionRegistry) subscriber.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    TrackStarted {
        guild_id: GuildId,
        track: Track,
    },
    /// The retry budget for `track` ran out and playback moved on.
    TrackSkippedAfterFailures {
        guild_id: GuildId,
        track: Track,
        attempts: u32,
        detail: String,
    },
    QueueDrained {
        guild_id: GuildId,
    },
    PersistenceDegraded {
        guild_id: GuildId,
        detail: String,
    },
    SessionStopped {
        guild_id: GuildId,
        reason: StopReason,
    },
}

/// Point-in-time view of a session for presentation.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub state: SessionState,
    pub volume: f32,
    pub retry_count: u32,
    pub current: Option<Track>,
    pub pending: usize,
    pub total_duration: Duration,
    /// Whether the session holds a voice connection.
    pub connected: bool,
}

type Reply<T> = oneshot::Sender<Result<T>>;

pub(crate) enum Command {
    Enqueue { channel_id: ChannelId, track: Track, reply: Reply<usize> },
    Play { reply: Reply<()> },
    Pause { reply: Reply<()> },
    Resume { reply: Reply<()> },
    Skip { reply: Reply<()> },
    Stop { reason: StopReason, reply: Reply<()> },
    SetVolume { volume: f32, reply: Reply<()> },
    CurrentTrack { reply: Reply<Option<Track>> },
    ListQueue { reply: Reply<Vec<Track>> },
    Status { reply: Reply<SessionStatus> },
    ChannelEmpty { reply: Reply<()> },
    ChannelOccupied { reply: Reply<()> },
}

impl Command {
    /// Answers a command that reached a session after it stopped.
    fn retire(self) {
        match self {
            // stopping a stopped session is a success
            Command::Stop { reply, .. } => {
                let _ = reply.send(Ok(()));
            }
            Command::Enqueue { reply, .. } => {
                let _ = reply.send(Err(PlayerError::SessionRetired));
            }
            Command::Play { reply }
            | Command::Pause { reply }
            | Command::Resume { reply }
            | Command::Skip { reply }
            | Command::SetVolume { reply, .. }
            | Command::ChannelEmpty { reply }
            | Command::ChannelOccupied { reply } => {
                let _ = reply.send(Err(PlayerError::SessionRetired));
            }
            Command::CurrentTrack { reply } => {
                let _ = reply.send(Err(PlayerError::SessionRetired));
            }
            Command::ListQueue { reply } => {
                let _ = reply.send(Err(PlayerError::SessionRetired));
            }
            Command::Status { reply } => {
                let _ = reply.send(Err(PlayerError::SessionRetired));
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    Retry,
    Idle,
    EmptyChannel,
}

pub(crate) enum SessionMessage {
    Command(Command),
    Transport { stream: StreamId, event: TransportEvent },
    TimerFired { kind: TimerKind, id: u64 },
}

/// Cloneable address of a running session.
#[derive(Clone)]
pub struct SessionHandle {
    guild_id: GuildId,
    instance: u64,
    tx: mpsc::UnboundedSender<SessionMessage>,
}

impl SessionHandle {
    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    /// Distinguishes successive sessions of the same guild.
    pub fn instance(&self) -> u64 {
        self.instance
    }

    /// `true` once the session task has stopped accepting messages.
    pub fn is_retired(&self) -> bool {
        self.tx.is_closed()
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionMessage::Command(command(reply)))
            .map_err(|_| PlayerError::SessionRetired)?;
        rx.await.map_err(|_| PlayerError::SessionRetired)?
    }

    /// Returns the number of pending tracks after the append.
    pub async fn enqueue(&self, channel_id: ChannelId, track: Track) -> Result<usize> {
        self.request(|reply| Command::Enqueue { channel_id, track, reply }).await
    }

    pub async fn play(&self) -> Result<()> {
        self.request(|reply| Command::Play { reply }).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.request(|reply| Command::Pause { reply }).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.request(|reply| Command::Resume { reply }).await
    }

    pub async fn skip(&self) -> Result<()> {
        self.request(|reply| Command::Skip { reply }).await
    }

    /// Idempotent. Returns once teardown finished or the session was already gone.
    pub async fn stop(&self, reason: StopReason) {
        let _ = self.request(|reply| Command::Stop { reason, reply }).await;
    }

    pub async fn set_volume(&self, volume: f32) -> Result<()> {
        self.request(|reply| Command::SetVolume { volume, reply }).await
    }

    pub async fn current_track(&self) -> Result<Option<Track>> {
        self.request(|reply| Command::CurrentTrack { reply }).await
    }

    pub async fn list_queue(&self) -> Result<Vec<Track>> {
        self.request(|reply| Command::ListQueue { reply }).await
    }

    pub async fn status(&self) -> Result<SessionStatus> {
        self.request(|reply| Command::Status { reply }).await
    }

    pub async fn channel_empty(&self) -> Result<()> {
        self.request(|reply| Command::ChannelEmpty { reply }).await
    }

    pub async fn channel_occupied(&self) -> Result<()> {
        self.request(|reply| Command::ChannelOccupied { reply }).await
    }
}

/// Shared collaborators every session of a registry is built with.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) store: Arc<dyn QueueStore>,
    pub(crate) config: Arc<PlayerConfig>,
    pub(crate) events: broadcast::Sender<SessionEvent>,
    pub(crate) directory: SessionDirectory,
}

struct ArmedTimer {
    id: u64,
    token: CancellationToken,
}

#[derive(Default)]
struct Timers {
    next_id: u64,
    retry: Option<ArmedTimer>,
    idle: Option<ArmedTimer>,
    empty_channel: Option<ArmedTimer>,
}

impl Timers {
    fn slot(&mut self, kind: TimerKind) -> &mut Option<ArmedTimer> {
        match kind {
            TimerKind::Retry => &mut self.retry,
            TimerKind::Idle => &mut self.idle,
            TimerKind::EmptyChannel => &mut self.empty_channel,
        }
    }

    fn arm(&mut self, kind: TimerKind, delay: Duration, inbox: &mpsc::UnboundedSender<SessionMessage>) {
        self.cancel(kind);

        self.next_id += 1;
        let id = self.next_id;
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let inbox = inbox.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = inbox.send(SessionMessage::TimerFired { kind, id });
                }
            }
        });

        *self.slot(kind) = Some(ArmedTimer { id, token });
    }

    fn cancel(&mut self, kind: TimerKind) {
        if let Some(timer) = self.slot(kind).take() {
            timer.token.cancel();
        }
    }

    fn cancel_all(&mut self) {
        for kind in [TimerKind::Retry, TimerKind::Idle, TimerKind::EmptyChannel] {
            self.cancel(kind);
        }
    }

    fn is_armed(&mut self, kind: TimerKind) -> bool {
        self.slot(kind).is_some()
    }

    /// Consumes the timer if `id` is the one currently armed. A mismatch means
    /// the timer was cancelled or re-armed after it fired.
    fn fire(&mut self, kind: TimerKind, id: u64) -> bool {
        let slot = self.slot(kind);
        if slot.as_ref().is_some_and(|timer| timer.id == id) {
            *slot = None;
            true
        } else {
            false
        }
    }
}

/// The per-guild playback state machine.
pub struct PlaybackSession {
    guild_id: GuildId,
    instance: u64,
    state: SessionState,
    volume: f32,
    retry_count: u32,
    queue: GuildQueue,
    handle: Option<TransportHandle>,
    destination: Option<ChannelId>,
    stream_seq: u64,
    active_stream: Option<StreamId>,
    announced: Option<StreamId>,
    timers: Timers,
    inbox: mpsc::UnboundedSender<SessionMessage>,
    ctx: SessionContext,
}

impl PlaybackSession {
    /// Starts the session task and returns its address. The queue is loaded
    /// from the store inside the task, before any message is handled.
    pub(crate) fn spawn(guild_id: GuildId, instance: u64, ctx: SessionContext) -> SessionHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            guild_id,
            instance,
            tx: tx.clone(),
        };

        tokio::spawn(async move {
            let session = PlaybackSession::start(guild_id, instance, ctx, tx).await;
            session.run(rx).await;
        });

        handle
    }

    async fn start(
        guild_id: GuildId,
        instance: u64,
        ctx: SessionContext,
        inbox: mpsc::UnboundedSender<SessionMessage>,
    ) -> Self {
        let Persisted { value: queue, degraded } =
            GuildQueue::load(guild_id, ctx.store.clone(), ctx.config.max_queue_depth).await;

        let mut session = Self {
            guild_id,
            instance,
            state: SessionState::Idle,
            volume: ctx.config.default_volume,
            retry_count: 0,
            queue,
            handle: None,
            destination: None,
            stream_seq: 0,
            active_stream: None,
            announced: None,
            timers: Timers::default(),
            inbox,
            ctx,
        };

        if let Some(e) = &degraded {
            session.announce_degraded(e);
        }

        // a track that was playing when the previous session died plays first
        let requeued = session.queue.requeue_current().await;
        session.absorb(requeued);

        info!(
            "🆕 Sesión {} creada para guild {} ({} en cola)",
            instance,
            guild_id,
            session.queue.len()
        );

        session.enter_idle(false);
        session
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionMessage>) {
        while let Some(message) = rx.recv().await {
            self.handle_message(message).await;

            if self.state == SessionState::Stopped {
                break;
            }
        }

        rx.close();
        while let Ok(message) = rx.try_recv() {
            if let SessionMessage::Command(command) = message {
                command.retire();
            }
        }

        debug!("Sesión {} de guild {} finalizada", self.instance, self.guild_id);
    }

    async fn handle_message(&mut self, message: SessionMessage) {
        match message {
            SessionMessage::Command(command) => self.handle_command(command).await,
            SessionMessage::Transport { stream, event } => {
                self.on_transport_event(stream, event).await;
                self.enforce_invariants().await;
            }
            SessionMessage::TimerFired { kind, id } => {
                if self.timers.fire(kind, id) {
                    self.on_timer(kind).await;
                    self.enforce_invariants().await;
                } else {
                    debug!("Timer {:?} #{} obsoleto en guild {}", kind, id, self.guild_id);
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Enqueue { channel_id, track, reply } => {
                let result = self.enqueue(channel_id, track).await;
                self.respond(reply, result).await;
            }
            Command::Play { reply } => {
                let result = self.play().await;
                self.respond(reply, result).await;
            }
            Command::Pause { reply } => {
                let result = self.pause().await;
                self.respond(reply, result).await;
            }
            Command::Resume { reply } => {
                let result = self.resume().await;
                self.respond(reply, result).await;
            }
            Command::Skip { reply } => {
                let result = self.skip().await;
                self.respond(reply, result).await;
            }
            Command::Stop { reason, reply } => {
                self.leave(reason, reason.clears_queue()).await;
                self.respond(reply, Ok(())).await;
            }
            Command::SetVolume { volume, reply } => {
                let result = self.set_volume(volume).await;
                self.respond(reply, result).await;
            }
            Command::CurrentTrack { reply } => {
                let current = self.queue.peek_current().cloned();
                self.respond(reply, Ok(current)).await;
            }
            Command::ListQueue { reply } => {
                let pending = self.queue.peek_pending();
                self.respond(reply, Ok(pending)).await;
            }
            Command::Status { reply } => {
                let status = self.status();
                self.respond(reply, Ok(status)).await;
            }
            Command::ChannelEmpty { reply } => {
                let result = self.channel_empty().await;
                self.respond(reply, result).await;
            }
            Command::ChannelOccupied { reply } => {
                self.timers.cancel(TimerKind::EmptyChannel);
                self.respond(reply, Ok(())).await;
            }
        }
    }

    /// Sends the reply, first turning any invariant violation into a forced stop.
    async fn respond<T>(&mut self, reply: Reply<T>, result: Result<T>) {
        let result = match result {
            Err(PlayerError::InvariantViolation(detail)) => {
                self.abort(&detail).await;
                Err(PlayerError::InvariantViolation(detail))
            }
            result => match self.check_invariants() {
                Ok(()) => result,
                Err(detail) => {
                    self.abort(&detail).await;
                    Err(PlayerError::InvariantViolation(detail))
                }
            },
        };

        let _ = reply.send(result);
    }

    // Commands

    async fn enqueue(&mut self, channel_id: ChannelId, track: Track) -> Result<usize> {
        self.destination = Some(channel_id);

        let persisted = self.queue.enqueue(track).await?;
        if let Some(e) = &persisted.degraded {
            self.announce_degraded(e);
        }

        if self.state == SessionState::Idle {
            // a non-empty queue is not idle teardown material
            self.timers.cancel(TimerKind::Idle);

            if self.ctx.config.auto_start {
                match self.start_from_idle().await {
                    Err(e @ PlayerError::InvariantViolation(_)) => return Err(e),
                    // the track is queued either way; a later play retries the connect
                    Err(e) => warn!("⚠️ Autoplay no pudo iniciar en guild {}: {}", self.guild_id, e),
                    Ok(()) => {}
                }
            }
        }

        persisted.into_result()
    }

    async fn play(&mut self) -> Result<()> {
        match self.state {
            SessionState::Idle => self.start_from_idle().await,
            SessionState::Paused => self.resume().await,
            SessionState::Playing | SessionState::Connecting | SessionState::Transitioning => {
                Err(PlayerError::AlreadyPlaying)
            }
            SessionState::Leaving | SessionState::Stopped => Err(PlayerError::SessionRetired),
        }
    }

    async fn pause(&mut self) -> Result<()> {
        match (self.state, self.handle.clone()) {
            (SessionState::Playing, Some(handle)) => {
                self.ctx.transport.pause(&handle).await?;
                self.set_state(SessionState::Paused);
                info!("⏸️ Reproducción pausada en guild {}", self.guild_id);
                Ok(())
            }
            (SessionState::Paused, _) => Ok(()),
            _ => Err(PlayerError::NotPlaying),
        }
    }

    async fn resume(&mut self) -> Result<()> {
        match (self.state, self.handle.clone()) {
            (SessionState::Paused, Some(handle)) => {
                self.ctx.transport.resume(&handle).await?;
                self.set_state(SessionState::Playing);
                info!("▶️ Reproducción reanudada en guild {}", self.guild_id);
                Ok(())
            }
            (SessionState::Playing, _) => Ok(()),
            _ => Err(PlayerError::NotPlaying),
        }
    }

    async fn skip(&mut self) -> Result<()> {
        match self.state {
            SessionState::Playing
            | SessionState::Paused
            | SessionState::Connecting
            | SessionState::Transitioning => {
                if let Some(track) = self.queue.peek_current() {
                    info!("⏭️ Saltando en guild {}: {}", self.guild_id, track.title());
                }

                // forget the stream first so its Finished event is stale on arrival
                if self.active_stream.take().is_some() {
                    if let Some(handle) = &self.handle {
                        if let Err(e) = self.ctx.transport.stop_stream(handle).await {
                            warn!("⚠️ No se pudo detener el stream en guild {}: {}", self.guild_id, e);
                        }
                    }
                }

                if let Err(e) = self.advance_to_next().await {
                    warn!("⚠️ Siguiente track no pudo iniciar en guild {}: {}", self.guild_id, e);
                }
                Ok(())
            }
            _ => Err(PlayerError::NotPlaying),
        }
    }

    async fn set_volume(&mut self, volume: f32) -> Result<()> {
        if !(0.0..=1.0).contains(&volume) {
            return Err(PlayerError::InvalidVolume(volume));
        }

        self.volume = volume;

        if self.active_stream.is_some() {
            if let Some(handle) = &self.handle {
                self.ctx.transport.set_gain(handle, volume).await?;
            }
        }

        info!("🔊 Volumen ajustado a {}% en guild {}", (volume * 100.0).round() as u8, self.guild_id);
        Ok(())
    }

    async fn channel_empty(&mut self) -> Result<()> {
        let grace = self.ctx.config.empty_channel_grace;

        if grace.is_zero() {
            info!("👥 Canal de voz vacío en guild {}, saliendo", self.guild_id);
            self.leave(StopReason::ChannelEmpty, StopReason::ChannelEmpty.clears_queue())
                .await;
        } else if !self.timers.is_armed(TimerKind::EmptyChannel) {
            debug!("👥 Canal vacío en guild {}, saliendo en {:?}", self.guild_id, grace);
            self.arm(TimerKind::EmptyChannel, grace);
        }

        Ok(())
    }

    fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.state,
            volume: self.volume,
            retry_count: self.retry_count,
            current: self.queue.peek_current().cloned(),
            pending: self.queue.len(),
            total_duration: self.queue.total_duration(),
            connected: self.handle.is_some(),
        }
    }

    // Playback

    async fn start_from_idle(&mut self) -> Result<()> {
        if let Some(track) = self.queue.peek_current() {
            return Err(PlayerError::InvariantViolation(format!(
                "idle session still holds `{}` as the current track",
                track.title()
            )));
        }

        if self.queue.len() == 0 {
            return Err(PlayerError::EmptyQueue);
        }

        self.timers.cancel(TimerKind::Idle);
        self.set_state(SessionState::Connecting);

        if let Err(e) = self.ensure_connected().await {
            // nothing was consumed: the head of the queue stays where it is
            self.enter_idle(false);
            return Err(e);
        }

        let advanced = self.queue.advance().await;
        match self.absorb(advanced) {
            Some(_) => self.play_current().await,
            None => {
                self.enter_idle(false);
                Err(PlayerError::EmptyQueue)
            }
        }
    }

    async fn ensure_connected(&mut self) -> Result<TransportHandle> {
        if let Some(handle) = &self.handle {
            return Ok(handle.clone());
        }

        let channel_id = self
            .destination
            .ok_or_else(|| TransportError::Connect("no voice channel to join".into()))?;
        let target = VoiceTarget {
            guild_id: self.guild_id,
            channel_id,
        };

        match self.ctx.transport.connect(target).await {
            Ok(handle) => {
                self.handle = Some(handle.clone());
                Ok(handle)
            }
            Err(e) => {
                warn!("❌ No se pudo conectar en guild {}: {}", self.guild_id, e);
                Err(e.into())
            }
        }
    }

    /// Streams the current track. Tracks whose retry budget is exhausted on
    /// a synchronous start failure are skipped until one starts or the queue
    /// runs dry.
    async fn play_current(&mut self) -> Result<()> {
        loop {
            let Some(track) = self.queue.peek_current().cloned() else {
                self.enter_idle(true);
                return Ok(());
            };

            self.set_state(SessionState::Connecting);

            let handle = match self.ensure_connected().await {
                Ok(handle) => handle,
                Err(e) => {
                    let requeued = self.queue.requeue_current().await;
                    self.absorb(requeued);
                    self.enter_idle(false);
                    return Err(e);
                }
            };

            self.stream_seq += 1;
            let stream = StreamId(self.stream_seq);
            let sink = self.sink_for(stream);

            match self
                .ctx
                .transport
                .stream(&handle, track.source_url(), self.volume, sink)
                .await
            {
                Ok(()) => {
                    self.active_stream = Some(stream);
                    self.set_state(SessionState::Playing);
                    info!("🎵 Reproduciendo en guild {}: {}", self.guild_id, track);
                    return Ok(());
                }
                Err(e) => {
                    let detail = e.to_string();
                    if self.register_failure(&track, &detail) {
                        return Ok(());
                    }

                    self.report_skipped(&track, detail);
                    self.retry_count = 0;
                    let advanced = self.queue.advance().await;
                    self.absorb(advanced);
                }
            }
        }
    }

    /// Ends the current playback attempt (finish, skip or exhausted retries)
    /// and moves to whatever comes next.
    async fn advance_to_next(&mut self) -> Result<()> {
        self.set_state(SessionState::Transitioning);
        self.retry_count = 0;
        self.timers.cancel(TimerKind::Retry);
        self.active_stream = None;

        let advanced = self.queue.advance().await;
        match self.absorb(advanced) {
            Some(_) => self.play_current().await,
            None => {
                self.enter_idle(true);
                Ok(())
            }
        }
    }

    /// Counts a failed attempt on `track`. Returns `true` when a retry of the
    /// same track was scheduled, `false` when the budget is spent.
    fn register_failure(&mut self, track: &Track, detail: &str) -> bool {
        self.active_stream = None;
        self.retry_count += 1;
        self.set_state(SessionState::Transitioning);

        let max_retries = self.ctx.config.max_retries;
        if self.retry_count <= max_retries {
            let backoff = self.ctx.config.retry_backoff;
            warn!(
                "🔄 Fallo en '{}' (reintento {}/{} en {:?}): {}",
                track.title(),
                self.retry_count,
                max_retries,
                backoff,
                detail
            );
            self.arm(TimerKind::Retry, backoff);
            true
        } else {
            false
        }
    }

    fn report_skipped(&self, track: &Track, detail: String) {
        error!(
            "⏭️ '{}' falló {} veces seguidas en guild {}, saltando: {}",
            track.title(),
            self.retry_count,
            self.guild_id,
            detail
        );
        self.emit(SessionEvent::TrackSkippedAfterFailures {
            guild_id: self.guild_id,
            track: track.clone(),
            attempts: self.retry_count,
            detail,
        });
    }

    fn enter_idle(&mut self, drained: bool) {
        self.set_state(SessionState::Idle);
        self.active_stream = None;
        self.timers.cancel(TimerKind::Retry);

        if drained {
            info!("📭 Cola terminada en guild {}", self.guild_id);
            self.emit(SessionEvent::QueueDrained { guild_id: self.guild_id });
        }

        self.arm(TimerKind::Idle, self.ctx.config.idle_timeout);
    }

    /// Tears the session down. Safe to call repeatedly.
    async fn leave(&mut self, reason: StopReason, clear_queue: bool) {
        if matches!(self.state, SessionState::Leaving | SessionState::Stopped) {
            return;
        }

        info!("🚪 Cerrando sesión de guild {} ({:?})", self.guild_id, reason);
        self.set_state(SessionState::Leaving);
        self.timers.cancel_all();
        self.active_stream = None;

        if clear_queue {
            let cleared = self.queue.clear().await;
            self.absorb(cleared);
        } else {
            let requeued = self.queue.requeue_current().await;
            self.absorb(requeued);
        }

        if let Some(handle) = self.handle.take() {
            self.ctx.transport.disconnect(&handle).await;
        }

        self.set_state(SessionState::Stopped);
        self.ctx.directory.remove(self.guild_id, self.instance);
        self.emit(SessionEvent::SessionStopped {
            guild_id: self.guild_id,
            reason,
        });
    }

    // Events

    async fn on_transport_event(&mut self, stream: StreamId, event: TransportEvent) {
        if self.active_stream != Some(stream) {
            debug!("Evento {:?} del stream {} descartado en guild {}", event, stream, self.guild_id);
            return;
        }

        match event {
            TransportEvent::Started => {
                if self.announced != Some(stream) {
                    self.announced = Some(stream);
                    if let Some(track) = self.queue.peek_current() {
                        self.emit(SessionEvent::TrackStarted {
                            guild_id: self.guild_id,
                            track: track.clone(),
                        });
                    }
                }
            }
            TransportEvent::Finished => {
                debug!("🎵 Track terminó en guild {}", self.guild_id);
                if let Err(e) = self.advance_to_next().await {
                    warn!("⚠️ Siguiente track no pudo iniciar en guild {}: {}", self.guild_id, e);
                }
            }
            TransportEvent::Errored(detail) => {
                let Some(track) = self.queue.peek_current().cloned() else {
                    return;
                };
                if self.register_failure(&track, &detail) {
                    return;
                }

                self.report_skipped(&track, detail);
                if let Err(e) = self.advance_to_next().await {
                    warn!("⚠️ Siguiente track no pudo iniciar en guild {}: {}", self.guild_id, e);
                }
            }
        }
    }

    async fn on_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::Retry => {
                if self.state == SessionState::Transitioning {
                    if let Some(track) = self.queue.peek_current() {
                        info!("🔁 Reintentando '{}' en guild {}", track.title(), self.guild_id);
                    }
                    if let Err(e) = self.play_current().await {
                        warn!("⚠️ Reintento no pudo conectar en guild {}: {}", self.guild_id, e);
                    }
                }
            }
            TimerKind::Idle => {
                if self.state == SessionState::Idle {
                    info!("⏰ Guild {} inactiva, liberando sesión", self.guild_id);
                    self.leave(StopReason::IdleTimeout, StopReason::IdleTimeout.clears_queue())
                        .await;
                }
            }
            TimerKind::EmptyChannel => {
                info!("👥 Canal de voz sigue vacío en guild {}, saliendo", self.guild_id);
                self.leave(StopReason::ChannelEmpty, StopReason::ChannelEmpty.clears_queue())
                    .await;
            }
        }
    }

    // Invariants

    fn check_invariants(&self) -> std::result::Result<(), String> {
        let has_current = self.queue.peek_current().is_some();

        match self.state {
            SessionState::Idle | SessionState::Stopped if has_current => {
                Err(format!("{} session holds a current track", self.state))
            }
            SessionState::Playing | SessionState::Paused
                if !has_current || self.handle.is_none() || self.active_stream.is_none() =>
            {
                Err(format!("{} session has no active stream", self.state))
            }
            _ => Ok(()),
        }
    }

    async fn enforce_invariants(&mut self) {
        if let Err(detail) = self.check_invariants() {
            self.abort(&detail).await;
        }
    }

    /// Fatal to this session only: stop now, the registry recreates on next use.
    async fn abort(&mut self, detail: &str) {
        error!("🚨 Invariante violada en guild {}: {}", self.guild_id, detail);
        self.leave(StopReason::InvariantViolation, StopReason::InvariantViolation.clears_queue())
            .await;
    }

    // Helpers

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!("Guild {}: {} → {}", self.guild_id, self.state, state);
            self.state = state;
        }
    }

    fn arm(&mut self, kind: TimerKind, delay: Duration) {
        self.timers.arm(kind, delay, &self.inbox);
    }

    fn sink_for(&self, stream: StreamId) -> EventSink {
        let inbox = self.inbox.clone();
        EventSink::new(stream, move |stream, event| {
            inbox.send(SessionMessage::Transport { stream, event }).is_ok()
        })
    }

    fn emit(&self, event: SessionEvent) {
        // no subscribers is fine
        let _ = self.ctx.events.send(event);
    }

    fn announce_degraded(&self, e: &crate::error::PersistenceError) {
        self.emit(SessionEvent::PersistenceDegraded {
            guild_id: self.guild_id,
            detail: e.to_string(),
        });
    }

    /// Announces degraded persistence, if any, and returns the mutation's value.
    fn absorb<T>(&self, persisted: Persisted<T>) -> T {
        if let Some(e) = &persisted.degraded {
            self.announce_degraded(e);
        }
        persisted.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::{registry::SessionRegistry, track::SourceKind},
        error::PersistenceError,
        storage::{MemoryQueueStore, MockQueueStore},
        transport::fake::FakeTransport,
    };
    use pretty_assertions::assert_eq;

    const GUILD: GuildId = GuildId::new(9);
    const CHANNEL: ChannelId = ChannelId::new(99);

    fn track(name: &str) -> Track {
        Track::new(name, format!("https://youtu.be/{}", name), SourceKind::YouTube)
    }

    fn context(transport: Arc<FakeTransport>, store: Arc<dyn QueueStore>) -> SessionContext {
        let (events, _) = broadcast::channel(16);
        SessionContext {
            transport,
            store,
            config: Arc::new(PlayerConfig::default()),
            events,
            directory: SessionDirectory::default(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_invariant_violation_stops_session() {
        let transport = Arc::new(FakeTransport::new());
        let ctx = context(transport.clone(), Arc::new(MemoryQueueStore::new()));
        let mut events = ctx.events.subscribe();
        let (tx, _rx) = mpsc::unbounded_channel();

        let mut session = PlaybackSession::start(GUILD, 1, ctx, tx).await;
        session.destination = Some(CHANNEL);
        session.queue.enqueue(track("a")).await.unwrap().value;
        session.play().await.unwrap();
        assert_eq!(session.state, SessionState::Playing);
        assert!(session.check_invariants().is_ok());

        // a playing session that lost its stream is inconsistent
        session.active_stream = None;
        session.enforce_invariants().await;

        assert_eq!(session.state, SessionState::Stopped);
        assert_eq!(transport.disconnects(), 1);
        // the interrupted track is kept for the next session
        assert_eq!(session.queue.peek_pending(), vec![track("a")]);

        let mut reason = None;
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::SessionStopped { reason: r, .. } = event {
                reason = Some(r);
            }
        }
        assert_eq!(reason, Some(StopReason::InvariantViolation));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_with_current_is_rejected() {
        let transport = Arc::new(FakeTransport::new());
        let ctx = context(transport, Arc::new(MemoryQueueStore::new()));
        let (tx, _rx) = mpsc::unbounded_channel();

        let mut session = PlaybackSession::start(GUILD, 1, ctx, tx).await;
        session.destination = Some(CHANNEL);
        session.queue.enqueue(track("a")).await.unwrap().value;
        session.queue.advance().await.value;

        let err = session.start_from_idle().await.unwrap_err();
        assert!(matches!(err, PlayerError::InvariantViolation(_)));
        assert!(session.check_invariants().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_persistence_keeps_playing() {
        let mut store = MockQueueStore::new();
        store.expect_load().returning(|_| Ok(None));
        store
            .expect_save()
            .returning(|_, _| Err(PersistenceError::Backend("disk full".into())));
        store.expect_delete().returning(|_| Ok(()));

        let registry = SessionRegistry::new(
            Arc::new(FakeTransport::new()),
            Arc::new(store),
            PlayerConfig::default(),
        );
        let mut events = registry.subscribe();
        let session = registry.get_or_create(GUILD);

        let err = session.enqueue(CHANNEL, track("a")).await.unwrap_err();
        assert!(matches!(err, PlayerError::Persistence(_)));

        // in-memory state moved on regardless
        let status = session.status().await.unwrap();
        assert_eq!(status.state, SessionState::Playing);
        assert_eq!(status.current, Some(track("a")));

        let mut degraded = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SessionEvent::PersistenceDegraded { .. }) {
                degraded += 1;
            }
        }
        assert!(degraded >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_is_ignored() {
        let transport = Arc::new(FakeTransport::new());
        let ctx = context(transport, Arc::new(MemoryQueueStore::new()));
        let (tx, _rx) = mpsc::unbounded_channel();

        let mut session = PlaybackSession::start(GUILD, 1, ctx, tx).await;
        let first = session.timers.idle.as_ref().map(|timer| timer.id).unwrap();

        // re-arming replaces the idle timer; the old id no longer fires
        session.enter_idle(false);
        assert!(!session.timers.fire(TimerKind::Idle, first));
        assert!(session.timers.is_armed(TimerKind::Idle));

        session
            .handle_message(SessionMessage::TimerFired {
                kind: TimerKind::Idle,
                id: first,
            })
            .await;
        assert_eq!(session.state, SessionState::Idle);
    }

    #[test]
    fn test_retired_commands_get_answers() {
        let (reply, mut rx) = oneshot::channel();
        Command::Skip { reply }.retire();
        assert!(matches!(rx.try_recv(), Ok(Err(PlayerError::SessionRetired))));

        let (reply, mut rx) = oneshot::channel();
        Command::Stop {
            reason: StopReason::Command,
            reply,
        }
        .retire();
        assert!(matches!(rx.try_recv(), Ok(Ok(()))));
    }
}
