use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Settings the playback core needs. Carries no credentials, so tests and
/// embedders can build one directly.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerConfig {
    /// Gain applied to new sessions, in `[0, 1]`.
    pub default_volume: f32,
    /// `None` means unbounded.
    pub max_queue_depth: Option<usize>,
    /// Consecutive stream failures tolerated on one track before it is skipped.
    pub max_retries: u32,
    pub retry_backoff: Duration,
    /// Grace period an idle session waits for new tracks before leaving.
    pub idle_timeout: Duration,
    /// Debounce before leaving a voice channel nobody else is in.
    pub empty_channel_grace: Duration,
    /// Start connecting as soon as a track is enqueued on an idle session.
    pub auto_start: bool,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            default_volume: 0.5,
            max_queue_depth: None,
            max_retries: 2,
            retry_backoff: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(300),
            empty_channel_grace: Duration::ZERO,
            auto_start: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub command_prefix: String,

    // Paths
    pub data_dir: PathBuf,

    // Audio
    pub default_volume: f32,
    pub max_queue_depth: Option<usize>,
    pub auto_start: bool,

    // Recuperación y limpieza
    pub max_retries: u32,
    pub retry_backoff_secs: u64,
    pub idle_timeout_secs: u64,
    pub empty_channel_grace_secs: u64,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            // Discord
            discord_token: std::env::var("DISCORD_TOKEN")?,
            command_prefix: std::env::var("COMMAND_PREFIX").unwrap_or_else(|_| "!".to_string()),

            // Paths
            data_dir: std::env::var("DATA_DIR")
                .unwrap_or_else(|_| "/app/data".to_string())
                .into(),

            // Audio
            default_volume: std::env::var("DEFAULT_VOLUME")
                .unwrap_or_else(|_| "0.5".to_string())
                .parse()?,
            max_queue_depth: match std::env::var("MAX_QUEUE_DEPTH") {
                Ok(val) if !val.trim().is_empty() => Some(val.trim().parse()?),
                _ => None,
            },
            auto_start: std::env::var("AUTO_START")
                .unwrap_or_else(|_| "true".to_string())
                .parse()?,

            // Recuperación y limpieza
            max_retries: std::env::var("MAX_RETRIES")
                .unwrap_or_else(|_| "2".to_string())
                .parse()?,
            retry_backoff_secs: std::env::var("RETRY_BACKOFF_SECS")
                .unwrap_or_else(|_| "2".to_string())
                .parse()?,
            idle_timeout_secs: std::env::var("IDLE_TIMEOUT_SECS")
                .unwrap_or_else(|_| "300".to_string()) // 5 minutos
                .parse()?,
            empty_channel_grace_secs: std::env::var("EMPTY_CHANNEL_GRACE_SECS")
                .unwrap_or_else(|_| "0".to_string())
                .parse()?,
        };

        std::fs::create_dir_all(&config.data_dir)?;

        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Volume must be between 0.0 and 1.0
    /// - A configured queue depth must be greater than 0
    /// - The command prefix must not be empty
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.default_volume) {
            anyhow::bail!("Default volume must be between 0.0 and 1.0, got: {}", self.default_volume);
        }

        if self.max_queue_depth == Some(0) {
            anyhow::bail!("Max queue depth must be greater than 0 (unset it for unlimited)");
        }

        if self.command_prefix.trim().is_empty() {
            anyhow::bail!("Command prefix must not be empty");
        }

        Ok(())
    }

    /// Playback core settings derived from this configuration.
    pub fn player(&self) -> PlayerConfig {
        PlayerConfig {
            default_volume: self.default_volume,
            max_queue_depth: self.max_queue_depth,
            max_retries: self.max_retries,
            retry_backoff: Duration::from_secs(self.retry_backoff_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            empty_channel_grace: Duration::from_secs(self.empty_channel_grace_secs),
            auto_start: self.auto_start,
        }
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// Excludes the Discord token.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Discord: prefix '{}'\n  \
            Audio: {}% vol, queue {}, autostart={}\n  \
            Recovery: {} retries, {} backoff\n  \
            Teardown: idle {}, empty channel {}\n  \
            Data: {}",
            self.command_prefix,
            (self.default_volume * 100.0) as u32,
            self.max_queue_depth.map_or("unlimited".to_string(), |max| max.to_string()),
            self.auto_start,
            self.max_retries,
            humantime::format_duration(Duration::from_secs(self.retry_backoff_secs)),
            humantime::format_duration(Duration::from_secs(self.idle_timeout_secs)),
            humantime::format_duration(Duration::from_secs(self.empty_channel_grace_secs)),
            self.data_dir.display(),
        )
    }
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        let player = PlayerConfig::default();

        Self {
            // Discord (no defaults - must be provided)
            discord_token: String::new(),
            command_prefix: "!".to_string(),

            data_dir: "/app/data".into(),

            default_volume: player.default_volume,
            max_queue_depth: player.max_queue_depth,
            auto_start: player.auto_start,

            max_retries: player.max_retries,
            retry_backoff_secs: player.retry_backoff.as_secs(),
            idle_timeout_secs: player.idle_timeout.as_secs(),
            empty_channel_grace_secs: player.empty_channel_grace.as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_map_to_player_defaults() {
        assert_eq!(Config::default().player(), PlayerConfig::default());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = Config {
            default_volume: 1.5,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            max_queue_depth: Some(0),
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            command_prefix: "  ".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_err());

        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_summary_hides_token() {
        let config = Config {
            discord_token: "super-secret".to_string(),
            max_queue_depth: Some(50),
            ..Config::default()
        };
        let summary = config.summary();

        assert!(!summary.contains("super-secret"));
        assert!(summary.contains("queue 50"));
        assert!(summary.contains("idle 5m"));
    }
}
