//! # Bot Module
//!
//! Serenity glue between Discord and the [`AudioPlayer`].
//!
//! Prefix commands in guild text channels are parsed into [`BotCommand`]s
//! and forwarded to the player; replies are plain text. Voice state updates
//! are turned into channel-membership signals so a session can leave a
//! channel nobody is listening in.

use serenity::{
    all::{ChannelId, Context, EventHandler, GuildId, Message, Ready, UserId, VoiceState},
    async_trait,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::{
    audio::{player::AudioPlayer, track::Track},
    error::{ErrorCategory, PlayerError},
};

const QUEUE_PREVIEW: usize = 10;

/// A chat command understood by the bot.
#[derive(Debug, Clone, PartialEq)]
pub enum BotCommand {
    /// `play <query>` enqueues; a bare `play` starts or resumes.
    Play(Option<String>),
    Pause,
    Resume,
    Skip,
    Stop,
    /// Gain in `[0, 1]`, typed by users as a percentage.
    Volume(f32),
    Queue,
    NowPlaying,
    Help,
    Invalid(String),
}

impl BotCommand {
    /// Parses `content` if it starts with `prefix`. Returns `None` for
    /// ordinary chat.
    pub fn parse(prefix: &str, content: &str) -> Option<Self> {
        let body = content.trim().strip_prefix(prefix)?;
        let (name, args) = match body.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim()),
            None => (body, ""),
        };

        let command = match name.to_lowercase().as_str() {
            "play" | "p" => Self::Play((!args.is_empty()).then(|| args.to_string())),
            "pause" => Self::Pause,
            "resume" | "unpause" => Self::Resume,
            "skip" | "next" => Self::Skip,
            "stop" | "leave" => Self::Stop,
            "volume" | "vol" => match args.parse::<f32>() {
                Ok(percent) => Self::Volume(percent / 100.0),
                Err(_) => Self::Invalid(format!("Uso: {}volume <0-100>", prefix)),
            },
            "queue" | "q" => Self::Queue,
            "np" | "nowplaying" => Self::NowPlaying,
            "help" => Self::Help,
            _ => return None,
        };

        Some(command)
    }
}

/// Main Discord event handler.
pub struct JukeboxBot {
    player: Arc<AudioPlayer>,
    prefix: String,
}

impl JukeboxBot {
    pub fn new(player: Arc<AudioPlayer>, prefix: impl Into<String>) -> Self {
        Self {
            player,
            prefix: prefix.into(),
        }
    }

    async fn execute(&self, ctx: &Context, guild_id: GuildId, author: UserId, command: BotCommand) -> String {
        match command {
            BotCommand::Play(Some(query)) => {
                let Some(channel_id) = voice_channel_of(ctx, guild_id, author) else {
                    return "❌ Debes estar en un canal de voz".to_string();
                };

                match self.player.resolve_and_enqueue(guild_id, channel_id, &query).await {
                    Ok((track, position)) => {
                        format!("🎵 Agregado a la cola (#{}): {}", position, track)
                    }
                    Err(e) => describe_error(&e),
                }
            }
            BotCommand::Play(None) => self
                .player
                .play(guild_id)
                .await
                .map_or_else(|e| describe_error(&e), |_| "▶️ Reproduciendo".to_string()),
            BotCommand::Pause => self
                .player
                .pause(guild_id)
                .await
                .map_or_else(|e| describe_error(&e), |_| "⏸️ Pausado".to_string()),
            BotCommand::Resume => self
                .player
                .resume(guild_id)
                .await
                .map_or_else(|e| describe_error(&e), |_| "▶️ Reanudado".to_string()),
            BotCommand::Skip => self
                .player
                .skip(guild_id)
                .await
                .map_or_else(|e| describe_error(&e), |_| "⏭️ Saltado".to_string()),
            BotCommand::Stop => {
                self.player.stop(guild_id).await;
                "⏹️ Reproducción detenida y cola limpiada".to_string()
            }
            BotCommand::Volume(volume) => self
                .player
                .set_volume(guild_id, volume)
                .await
                .map_or_else(
                    |e| describe_error(&e),
                    |_| format!("🔊 Volumen: {}%", (volume * 100.0).round() as u8),
                ),
            BotCommand::Queue => {
                let current = self.player.current_track(guild_id).await;
                let pending = self.player.list_queue(guild_id).await;
                format_queue(current.as_ref(), &pending)
            }
            BotCommand::NowPlaying => match self.player.current_track(guild_id).await {
                Some(track) => format!("🎵 Sonando: {}", track),
                None => "📭 No hay nada sonando".to_string(),
            },
            BotCommand::Help => help(&self.prefix),
            BotCommand::Invalid(usage) => format!("❌ {}", usage),
        }
    }
}

#[async_trait]
impl EventHandler for JukeboxBot {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!("✅ {} conectado en {} guilds", ready.user.name, ready.guilds.len());
    }

    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }
        let Some(guild_id) = msg.guild_id else {
            return;
        };
        let Some(command) = BotCommand::parse(&self.prefix, &msg.content) else {
            return;
        };

        debug!("📨 Comando {:?} de {} en guild {}", command, msg.author.name, guild_id);
        let reply = self.execute(&ctx, guild_id, msg.author.id, command).await;

        if let Err(e) = msg.channel_id.say(&ctx.http, reply).await {
            warn!("⚠️ No se pudo responder en {}: {:?}", msg.channel_id, e);
        }
    }

    /// Maps voice state changes onto the session: the bot being kicked stops
    /// it, and the bot's channel emptying or refilling arms or cancels the
    /// empty-channel teardown.
    async fn voice_state_update(&self, ctx: Context, _old: Option<VoiceState>, new: VoiceState) {
        let Some(guild_id) = new.guild_id else {
            return;
        };
        let me = ctx.cache.current_user().id;

        if new.user_id == me && new.channel_id.is_none() {
            info!("🔌 Bot desconectado en guild {}", guild_id);
            self.player.voice_lost(guild_id).await;
            return;
        }

        let Some(listeners) = listeners_with_bot(&ctx, guild_id, me) else {
            return;
        };

        if listeners == 0 {
            self.player.channel_empty(guild_id).await;
        } else {
            self.player.channel_occupied(guild_id).await;
        }
    }
}

fn voice_channel_of(ctx: &Context, guild_id: GuildId, user_id: UserId) -> Option<ChannelId> {
    ctx.cache
        .guild(guild_id)?
        .voice_states
        .get(&user_id)
        .and_then(|voice_state| voice_state.channel_id)
}

/// Humans sharing a voice channel with the bot, or `None` if the bot is not
/// in one.
fn listeners_with_bot(ctx: &Context, guild_id: GuildId, me: UserId) -> Option<usize> {
    let guild = ctx.cache.guild(guild_id)?;
    let channel_id = guild.voice_states.get(&me)?.channel_id?;

    let listeners = guild
        .voice_states
        .values()
        .filter(|voice_state| voice_state.channel_id == Some(channel_id))
        .filter(|voice_state| voice_state.user_id != me)
        .filter(|voice_state| !voice_state.member.as_ref().is_some_and(|member| member.user.bot))
        .count();

    Some(listeners)
}

/// User-facing text for a failed command.
pub fn describe_error(error: &PlayerError) -> String {
    match error {
        PlayerError::NotPlaying => "❌ No hay nada reproduciéndose".to_string(),
        PlayerError::AlreadyPlaying => "❌ Ya se está reproduciendo".to_string(),
        PlayerError::EmptyQueue => "📭 La cola está vacía".to_string(),
        PlayerError::QueueFull { max } => format!("❌ La cola está llena (máximo {} canciones)", max),
        PlayerError::InvalidVolume(_) => "❌ El volumen debe estar entre 0 y 100".to_string(),
        e => match e.category() {
            ErrorCategory::Upstream => format!("❌ No se pudo obtener la canción: {}", e),
            ErrorCategory::Transport => format!("❌ Error de conexión de voz: {}", e),
            ErrorCategory::Persistence => {
                warn!("💾 {}", e);
                "⚠️ Hecho, pero la cola no se pudo guardar".to_string()
            }
            _ => {
                error!("Error interno: {:?}", e);
                "❌ Error interno, inténtalo de nuevo".to_string()
            }
        },
    }
}

fn format_queue(current: Option<&Track>, pending: &[Track]) -> String {
    let mut lines = Vec::new();

    match current {
        Some(track) => lines.push(format!("🎵 Sonando: {}", track)),
        None if pending.is_empty() => return "📭 La cola está vacía".to_string(),
        None => {}
    }

    for (i, track) in pending.iter().take(QUEUE_PREVIEW).enumerate() {
        lines.push(format!("{}. {}", i + 1, track));
    }
    if pending.len() > QUEUE_PREVIEW {
        lines.push(format!("... y {} más", pending.len() - QUEUE_PREVIEW));
    }

    lines.join("\n")
}

fn help(prefix: &str) -> String {
    [
        "play <búsqueda o URL>",
        "play",
        "pause",
        "resume",
        "skip",
        "stop",
        "volume <0-100>",
        "queue",
        "np",
    ]
    .iter()
    .map(|usage| format!("`{}{}`", prefix, usage))
    .collect::<Vec<_>>()
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{audio::track::SourceKind, error::ResolveError};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[test]
    fn test_parse() {
        assert_eq!(
            BotCommand::parse("!", "!play  never gonna give you up "),
            Some(BotCommand::Play(Some("never gonna give you up".to_string())))
        );
        assert_eq!(BotCommand::parse("!", "!play"), Some(BotCommand::Play(None)));
        assert_eq!(BotCommand::parse("!", "!SKIP"), Some(BotCommand::Skip));
        assert_eq!(BotCommand::parse("!", "!leave"), Some(BotCommand::Stop));
        assert_eq!(BotCommand::parse("!", "!vol 80"), Some(BotCommand::Volume(0.8)));
        assert!(matches!(BotCommand::parse("!", "!volume loud"), Some(BotCommand::Invalid(_))));
        assert_eq!(BotCommand::parse("!", "hello there"), None);
        assert_eq!(BotCommand::parse("!", "!dance"), None);
        assert_eq!(BotCommand::parse("$$", "$$np"), Some(BotCommand::NowPlaying));
    }

    #[test]
    fn test_describe_error() {
        assert_eq!(describe_error(&PlayerError::NotPlaying), "❌ No hay nada reproduciéndose");
        assert!(describe_error(&PlayerError::QueueFull { max: 5 }).contains("5"));
        assert!(describe_error(&PlayerError::from(ResolveError::NotFound("x".into())))
            .starts_with("❌ No se pudo obtener"));
    }

    #[test]
    fn test_format_queue() {
        assert_eq!(format_queue(None, &[]), "📭 La cola está vacía");

        let current = Track::new("Intro", "https://youtu.be/intro", SourceKind::YouTube)
            .with_duration(Duration::from_secs(90));
        let pending: Vec<Track> = (1..=12)
            .map(|i| Track::new(format!("Song {}", i), format!("https://youtu.be/s{}", i), SourceKind::YouTube))
            .collect();

        let text = format_queue(Some(&current), &pending);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "🎵 Sonando: Intro (1m 30s)");
        assert!(lines[1].starts_with("1. Song 1"));
        assert_eq!(lines.last(), Some(&"... y 2 más"));
        assert_eq!(lines.len(), 1 + QUEUE_PREVIEW + 1);
    }
}
