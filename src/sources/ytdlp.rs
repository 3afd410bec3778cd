use async_trait::async_trait;
use std::{process::Stdio, time::Duration};
use tokio::process::Command;
use tracing::{debug, warn};

use super::{MetadataSource, TrackReference};
use crate::{
    audio::resolver::StreamCommands,
    cache::TrackMetadata,
    config::Config,
    error::ResolutionError,
    process::{CommandSpec, CommandTemplate, REFERENCE_PLACEHOLDER},
};

const PRINT_FORMAT: &str = "%(id)s|%(webpage_url)s|%(duration_string)s|%(title)s";
const FAST_PATH_FORMAT: &str = "bestaudio[acodec=opus][asr=48000]";
const FALLBACK_FORMAT: &str = "bestaudio/best";

/// Plantillas de `yt-dlp` y `ffmpeg` construidas a partir de la configuración.
#[derive(Debug, Clone)]
pub struct YtDlpTools {
    pub metadata: CommandTemplate,
    pub streams: StreamCommands,
    pub ytdlp_version: CommandSpec,
    pub ffmpeg_version: CommandSpec,
}

impl YtDlpTools {
    pub fn from_config(config: &Config) -> Self {
        let ytdlp = |extra: &[&str]| {
            let mut spec = CommandSpec::new("yt-dlp", config.ytdlp_path.clone()).args([
                "--force-ipv4",
                "--no-playlist",
                "--no-warnings",
                "--quiet",
            ]);
            if let Some(header) = &config.ytdlp_auth_header {
                spec = spec.arg("--add-header").arg(header.clone());
            }
            CommandTemplate::new(spec.args(extra.iter().copied()).arg(REFERENCE_PLACEHOLDER))
        };

        let bitrate = config.opus_bitrate.to_string();
        let transcode = CommandSpec::new("ffmpeg", config.ffmpeg_path.clone()).args([
            "-hide_banner",
            "-loglevel",
            "error",
            // análisis mínimo de la entrada
            "-analyzeduration",
            "0",
            "-probesize",
            "32768",
            "-fflags",
            "nobuffer",
            "-i",
            "pipe:0",
            "-vn",
            "-ar",
            "48000",
            "-ac",
            "2",
            "-c:a",
            "libopus",
            "-b:a",
            bitrate.as_str(),
            "-flush_packets",
            "1",
            "-f",
            "ogg",
            "pipe:1",
        ]);

        let metadata = ytdlp(&["--skip-download", "--print", PRINT_FORMAT]);
        let ytdlp_version = metadata.version_check("--version");
        let transcode = CommandTemplate::new(transcode);
        let ffmpeg_version = transcode.version_check("-version");

        Self {
            metadata,
            streams: StreamCommands {
                fast_path: ytdlp(&["-f", FAST_PATH_FORMAT, "-o", "-"]),
                extract: ytdlp(&["-f", FALLBACK_FORMAT, "-o", "-"]),
                transcode,
            },
            ytdlp_version,
            ffmpeg_version,
        }
    }
}

/// Metadata vía `yt-dlp --print`, con tiempo límite.
pub struct YtDlpMetadataSource {
    template: CommandTemplate,
    timeout: Duration,
}

impl YtDlpMetadataSource {
    pub fn new(template: CommandTemplate, timeout: Duration) -> Self {
        Self { template, timeout }
    }
}

#[async_trait]
impl MetadataSource for YtDlpMetadataSource {
    async fn lookup(&self, reference: &TrackReference) -> Result<TrackMetadata, ResolutionError> {
        let spec = self.template.render(&reference.argument());
        debug!("🔍 {}", spec);

        let output = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, output)
            .await
            .map_err(|_| ResolutionError::Timeout {
                tool: spec.label.clone(),
            })?
            .map_err(|e| ResolutionError::ToolUnavailable {
                tool: spec.label.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("❌ {} falló para {}: {}", spec.label, reference.argument(), stderr.trim());
            return Err(ResolutionError::ToolFailed {
                tool: spec.label,
                code: output.status.code(),
                stderr: tail_lines(&stderr, 5),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .ok_or(ResolutionError::EmptyOutput { tool: spec.label })?;

        parse_print_line(line)
    }

    fn source_name(&self) -> &'static str {
        "yt-dlp"
    }
}

/// Interpreta una línea `id|url|duración|título`.
///
/// El título va al final porque puede contener `|`.
pub fn parse_print_line(line: &str) -> Result<TrackMetadata, ResolutionError> {
    let mut parts = line.splitn(4, '|');
    let (Some(id), Some(url), Some(duration), Some(title)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ResolutionError::MalformedOutput(line.to_string()));
    };

    if id.trim().is_empty() || url.trim().is_empty() {
        return Err(ResolutionError::MalformedOutput(line.to_string()));
    }

    let duration_label = match duration.trim() {
        "" | "NA" => "LIVE".to_string(),
        other => other.to_string(),
    };

    Ok(TrackMetadata {
        id: id.trim().to_string(),
        title: title.trim().to_string(),
        url: url.trim().to_string(),
        duration_label,
    })
}

fn tail_lines(text: &str, limit: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    lines[lines.len().saturating_sub(limit)..].join("\n")
}
