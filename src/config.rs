use anyhow::{Context, Result};
use std::{net::SocketAddr, time::Duration};

#[derive(Debug, Clone)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub application_id: u64,
    pub guild_id: Option<u64>, // Para comandos de desarrollo

    // Cola
    pub max_queue_size: usize,
    pub queue_preview_size: usize,

    // Metadata
    pub metadata_ttl: Duration,
    pub metadata_timeout: Duration,

    // Herramientas externas
    pub ytdlp_path: String,
    pub ffmpeg_path: String,
    pub ytdlp_auth_header: Option<String>,
    pub opus_bitrate: u32,
    pub probe_timeout: Duration,
    pub stderr_tail_lines: usize,

    // Superficie HTTP
    pub http_bind: Option<SocketAddr>,
    pub http_guild_id: Option<u64>,
    pub http_voice_channel_id: Option<u64>,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            // Discord
            discord_token: std::env::var("DISCORD_TOKEN").context("DISCORD_TOKEN no definido")?,
            application_id: std::env::var("APPLICATION_ID")
                .context("APPLICATION_ID no definido")?
                .parse::<std::num::NonZeroU64>()?
                .get(),
            guild_id: std::env::var("GUILD_ID").ok().and_then(|s| s.parse().ok()),

            // Cola
            max_queue_size: std::env::var("MAX_QUEUE_SIZE")
                .unwrap_or_else(|_| "500".to_string())
                .parse()?,
            queue_preview_size: std::env::var("QUEUE_PREVIEW_SIZE")
                .unwrap_or_else(|_| "10".to_string())
                .parse()?,

            // Metadata
            metadata_ttl: duration_var("METADATA_TTL", "30m")?,
            metadata_timeout: duration_var("METADATA_TIMEOUT", "20s")?,

            // Herramientas
            ytdlp_path: std::env::var("YTDLP_PATH").unwrap_or_else(|_| "yt-dlp".to_string()),
            ffmpeg_path: std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),
            ytdlp_auth_header: std::env::var("YTDLP_AUTH_HEADER")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            opus_bitrate: std::env::var("OPUS_BITRATE")
                .unwrap_or_else(|_| "128000".to_string())
                .parse()?,
            probe_timeout: duration_var("PROBE_TIMEOUT", "8s")?,
            stderr_tail_lines: std::env::var("STDERR_TAIL_LINES")
                .unwrap_or_else(|_| "20".to_string())
                .parse()?,

            // HTTP
            http_bind: match std::env::var("HTTP_BIND") {
                Ok(val) if !val.trim().is_empty() => Some(val.parse()?),
                _ => None,
            },
            http_guild_id: std::env::var("HTTP_GUILD_ID").ok().and_then(|s| s.parse().ok()),
            http_voice_channel_id: std::env::var("HTTP_VOICE_CHANNEL_ID")
                .ok()
                .and_then(|s| s.parse().ok()),
        };

        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Opus bitrate must be within 8kbps..=510kbps
    /// - Queue and preview sizes must be > 0
    /// - Timeouts and TTL must be non-zero
    /// - The HTTP surface needs a default guild when it is enabled
    /// - Optional Discord ids are never 0
    pub fn validate(&self) -> Result<()> {
        let ids = [
            self.guild_id,
            self.http_guild_id,
            self.http_voice_channel_id,
        ];
        if ids.into_iter().flatten().any(|id| id == 0) {
            anyhow::bail!("Discord ids must be non-zero");
        }

        if self.opus_bitrate > 510_000 {
            anyhow::bail!("Opus bitrate cannot exceed 510kbps, got: {}", self.opus_bitrate);
        }

        if self.opus_bitrate < 8_000 {
            anyhow::bail!("Opus bitrate too low, minimum 8kbps, got: {}", self.opus_bitrate);
        }

        if self.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        if self.queue_preview_size == 0 {
            anyhow::bail!("Queue preview size must be greater than 0");
        }

        if self.metadata_ttl.is_zero() {
            anyhow::bail!("Metadata TTL must be greater than 0");
        }

        if self.probe_timeout.is_zero() || self.metadata_timeout.is_zero() {
            anyhow::bail!("Timeouts must be greater than 0");
        }

        if self.http_bind.is_some() && self.http_guild_id.is_none() {
            anyhow::bail!("HTTP_BIND requires HTTP_GUILD_ID");
        }

        Ok(())
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// Excludes the Discord token and the auth header value.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Discord: App ID {} (Guild: {})\n  \
            Queue: {} max, {} preview\n  \
            Metadata: TTL {}, timeout {}\n  \
            Tools: {} / {} (auth header: {}), probe {}, {}kbps fallback\n  \
            HTTP: {}",
            self.application_id,
            self.guild_id.map_or("global".to_string(), |id| id.to_string()),
            self.max_queue_size,
            self.queue_preview_size,
            humantime::format_duration(self.metadata_ttl),
            humantime::format_duration(self.metadata_timeout),
            self.ytdlp_path,
            self.ffmpeg_path,
            if self.ytdlp_auth_header.is_some() { "sí" } else { "no" },
            humantime::format_duration(self.probe_timeout),
            self.opus_bitrate / 1000,
            self.http_bind.map_or("desactivado".to_string(), |addr| addr.to_string()),
        )
    }
}

fn duration_var(name: &str, default: &str) -> Result<Duration> {
    let raw = std::env::var(name).unwrap_or_else(|_| default.to_string());
    humantime::parse_duration(raw.trim()).with_context(|| format!("{name} inválido: {raw}"))
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Discord (no defaults - must be provided)
            discord_token: String::new(),
            application_id: 0,
            guild_id: None,

            max_queue_size: 500,
            queue_preview_size: 10,

            metadata_ttl: Duration::from_secs(30 * 60),
            metadata_timeout: Duration::from_secs(20),

            ytdlp_path: "yt-dlp".to_string(),
            ffmpeg_path: "ffmpeg".to_string(),
            ytdlp_auth_header: None,
            opus_bitrate: 128_000,
            probe_timeout: Duration::from_secs(8),
            stderr_tail_lines: 20,

            http_bind: None,
            http_guild_id: None,
            http_voice_channel_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_bitrate() {
        let config = Config {
            opus_bitrate: 600_000,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn http_surface_requires_default_guild() {
        let mut config = Config {
            http_bind: Some("127.0.0.1:8080".parse().unwrap()),
            ..Config::default()
        };
        assert!(config.validate().is_err());

        config.http_guild_id = Some(42);
        assert!(config.validate().is_ok());

        config.http_voice_channel_id = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn summary_hides_auth_header() {
        let config = Config {
            ytdlp_auth_header: Some("Cookie: secreto".into()),
            ..Config::default()
        };
        let summary = config.summary();
        assert!(!summary.contains("secreto"));
        assert!(summary.contains("auth header: sí"));
    }
}
