use anyhow::Result;
use serenity::{model::gateway::GatewayIntents, Client};
use songbird::{SerenityInit, Songbird};
use std::{path::PathBuf, sync::Arc};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use guild_jukebox::{
    audio::{AudioPlayer, SessionEvent, SessionRegistry},
    bot::JukeboxBot,
    config::Config,
    sources::YtDlpResolver,
    storage::JsonQueueStore,
    transport::SongbirdTransport,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("guild_jukebox=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    // Manejar health check si es necesario
    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check().await;
    }

    info!("🎵 Iniciando Guild Jukebox v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Config::load()?;
    info!("{}", config.summary());

    // Colas persistidas
    let store = Arc::new(JsonQueueStore::new(config.data_dir.clone()).await?);
    match store.stored_guilds().await {
        Ok(guilds) => info!("💾 {} colas guardadas de sesiones anteriores", guilds.len()),
        Err(e) => warn!("⚠️ No se pudieron listar las colas guardadas: {}", e),
    }

    // Resolver de tracks
    let resolver = YtDlpResolver::new().with_cookies_from(&cookie_candidates(&config));
    match resolver.verify().await {
        Ok(version) => info!("✅ yt-dlp versión: {}", version),
        Err(e) => warn!("❌ {} - las búsquedas fallarán", e),
    }

    // Voz + sesiones
    let songbird = Songbird::serenity();
    let transport = Arc::new(SongbirdTransport::new(songbird.clone()));
    let registry = Arc::new(SessionRegistry::new(transport, store, config.player()));
    let player = Arc::new(AudioPlayer::new(registry).with_resolver(Arc::new(resolver)));

    spawn_event_logger(&player);

    // Configurar intents mínimos necesarios
    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_VOICE_STATES
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT;

    let handler = JukeboxBot::new(player.clone(), config.command_prefix.clone());

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .register_songbird_with(songbird)
        .await?;

    // Manejar shutdown graceful
    let shard_manager = client.shard_manager.clone();
    let shutdown_player = player.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Error al registrar Ctrl+C: {:?}", e);
            return;
        }
        info!("⚠️ Señal de shutdown recibida, cerrando...");
        shutdown_player.shutdown().await;
        shard_manager.shutdown_all().await;
    });

    // Iniciar bot
    info!("🚀 Bot iniciado exitosamente");
    if let Err(why) = client.start().await {
        error!("Error al ejecutar cliente: {:?}", why);
    }

    Ok(())
}

fn cookie_candidates(config: &Config) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Ok(home) = std::env::var("HOME") {
        candidates.push(PathBuf::from(home).join(".config/yt-dlp/cookies.txt"));
    }
    candidates.push(config.data_dir.join("cookies.txt"));
    candidates.push(PathBuf::from("./cookies.txt"));
    candidates
}

fn spawn_event_logger(player: &AudioPlayer) {
    let mut events = player.subscribe();

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::TrackSkippedAfterFailures {
                    guild_id,
                    track,
                    attempts,
                    ..
                }) => {
                    warn!("⏭️ Guild {}: '{}' omitido tras {} intentos", guild_id, track.title(), attempts);
                }
                Ok(SessionEvent::PersistenceDegraded { guild_id, detail }) => {
                    warn!("💾 Guild {}: cola sin persistir ({})", guild_id, detail);
                }
                Ok(event) => debug!("📣 {:?}", event),
                Err(RecvError::Lagged(missed)) => warn!("📣 {} eventos de sesión perdidos", missed),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

async fn health_check() -> Result<()> {
    // Verificar dependencias críticas
    let yt_dlp = async_process::Command::new("yt-dlp")
        .arg("--version")
        .output()
        .await?;

    let ffmpeg = async_process::Command::new("ffmpeg")
        .arg("-version")
        .output()
        .await?;

    if yt_dlp.status.success() && ffmpeg.status.success() {
        println!("OK");
        Ok(())
    } else {
        anyhow::bail!("Dependencias faltantes");
    }
}
