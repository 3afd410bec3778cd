//! Voice transport seam.
//!
//! The engine only needs to connect, attach a resolved stream, control it and
//! hear back when it ends. [`SongbirdTransport`] does that on top of songbird;
//! tests drive the engine with an in-memory transport instead.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serenity::{
    all::ChannelType,
    cache::Cache,
    model::id::{ChannelId, GuildId},
};
use songbird::{
    error::JoinError,
    input::{AudioStream, Input, LiveInput},
    tracks::{PlayMode, Track, TrackHandle},
    Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent,
};
use std::{
    fs::File,
    io::{self, Cursor, Read, Seek, SeekFrom},
    sync::Arc,
};
use symphonia::core::{io::MediaSource, probe::Hint};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{player::RoomCommand, resolver::ResolvedStream};
use crate::{
    error::VoiceError,
    process::{AttemptGuard, AttemptId},
};

/// Canal de vuelta hacia la sala para avisar que el stream terminó.
#[derive(Debug, Clone)]
pub struct PlaybackSignal {
    room: mpsc::UnboundedSender<RoomCommand>,
    attempt: AttemptId,
}

impl PlaybackSignal {
    pub fn new(room: mpsc::UnboundedSender<RoomCommand>, attempt: AttemptId) -> Self {
        Self { room, attempt }
    }

    pub fn attempt(&self) -> AttemptId {
        self.attempt
    }

    /// El stream terminó normalmente o fue detenido.
    pub fn finished(&self) {
        self.send(None);
    }

    /// El reproductor falló; se trata igual que un final.
    pub fn failed(&self, reason: impl Into<String>) {
        self.send(Some(reason.into()));
    }

    fn send(&self, error: Option<String>) {
        // si la sala ya cerró no hay nadie a quien avisar
        let _ = self.room.send(RoomCommand::PlaybackEnded {
            attempt: self.attempt,
            error,
        });
    }
}

#[async_trait]
pub trait VoiceTransport: Send + Sync {
    async fn connect(&self, guild: GuildId, channel: ChannelId) -> Result<(), VoiceError>;

    /// Reemplaza lo que esté sonando por `stream`. Si `paused`, queda
    /// cargado pero en pausa.
    async fn play(
        &self,
        guild: GuildId,
        stream: ResolvedStream,
        signal: PlaybackSignal,
        paused: bool,
    ) -> Result<(), VoiceError>;

    async fn pause(&self, guild: GuildId) -> Result<(), VoiceError>;

    async fn unpause(&self, guild: GuildId) -> Result<(), VoiceError>;

    /// Fuerza el final del stream actual; la señal reporta el final.
    async fn stop(&self, guild: GuildId) -> Result<(), VoiceError>;

    async fn disconnect(&self, guild: GuildId) -> Result<(), VoiceError>;
}

/// Stream de un proceso externo visto como `MediaSource` bloqueante.
///
/// Conserva el guard del intento: cuando songbird suelta el input, los
/// procesos que lo alimentaban terminan.
pub struct ProcessMediaSource {
    reader: io::Chain<Cursor<Bytes>, File>,
    _attempt: AttemptGuard,
}

impl ProcessMediaSource {
    pub fn new(stream: ResolvedStream) -> io::Result<Self> {
        let (head, stdout, attempt) = stream.into_parts();
        let file = File::from(stdout.into_owned_fd()?);

        Ok(Self {
            reader: Cursor::new(head).chain(file),
            _attempt: attempt,
        })
    }
}

impl Read for ProcessMediaSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Seek for ProcessMediaSource {
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "stream en vivo sin seek",
        ))
    }
}

impl MediaSource for ProcessMediaSource {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}

/// Transporte de voz sobre songbird.
pub struct SongbirdTransport {
    manager: Arc<Songbird>,
    cache: Arc<Cache>,
    tracks: DashMap<GuildId, TrackHandle>,
}

impl SongbirdTransport {
    pub fn new(manager: Arc<Songbird>, cache: Arc<Cache>) -> Self {
        Self {
            manager,
            cache,
            tracks: DashMap::new(),
        }
    }

    fn is_voice_channel(&self, guild: GuildId, channel: ChannelId) -> Option<bool> {
        let guild = self.cache.guild(guild)?;
        Some(guild.channels.get(&channel).is_some_and(|c| {
            matches!(c.kind, ChannelType::Voice | ChannelType::Stage)
        }))
    }

    fn track(&self, guild: GuildId) -> Result<TrackHandle, VoiceError> {
        self.tracks
            .get(&guild)
            .map(|handle| handle.clone())
            .ok_or(VoiceError::NotInChannel)
    }
}

#[async_trait]
impl VoiceTransport for SongbirdTransport {
    async fn connect(&self, guild: GuildId, channel: ChannelId) -> Result<(), VoiceError> {
        // sin el guild en cache no se puede validar; songbird decidirá
        if self.is_voice_channel(guild, channel) == Some(false) {
            return Err(VoiceError::ChannelNotFound);
        }

        self.manager
            .join(guild, channel)
            .await
            .map_err(|e| VoiceError::Transport(e.to_string()))?;

        info!("🔊 Conectado al canal de voz {} en guild {}", channel, guild);
        Ok(())
    }

    async fn play(
        &self,
        guild: GuildId,
        stream: ResolvedStream,
        signal: PlaybackSignal,
        paused: bool,
    ) -> Result<(), VoiceError> {
        let call = self.manager.get(guild).ok_or(VoiceError::NotInChannel)?;

        let codec = stream.codec();
        let source =
            ProcessMediaSource::new(stream).map_err(|e| VoiceError::Transport(e.to_string()))?;

        let mut hint = Hint::new();
        hint.with_extension(codec.extension());
        hint.mime_type(codec.mime_type());

        let input = Input::Live(
            LiveInput::Raw(AudioStream {
                input: Box::new(source) as Box<dyn MediaSource>,
                hint: Some(hint),
            }),
            None,
        );

        let mut track = Track::from(input);
        if paused {
            track = track.pause();
        }

        let handle = {
            let mut call = call.lock().await;
            call.play_only(track)
        };

        for event in [TrackEvent::End, TrackEvent::Error] {
            handle
                .add_event(
                    Event::Track(event),
                    TrackEndRelay {
                        signal: signal.clone(),
                    },
                )
                .map_err(|e| VoiceError::Transport(e.to_string()))?;
        }

        debug!("🎧 Stream adjuntado en guild {} (intento {})", guild, signal.attempt());
        self.tracks.insert(guild, handle);
        Ok(())
    }

    async fn pause(&self, guild: GuildId) -> Result<(), VoiceError> {
        self.track(guild)?
            .pause()
            .map_err(|e| VoiceError::Transport(e.to_string()))
    }

    async fn unpause(&self, guild: GuildId) -> Result<(), VoiceError> {
        self.track(guild)?
            .play()
            .map_err(|e| VoiceError::Transport(e.to_string()))
    }

    async fn stop(&self, guild: GuildId) -> Result<(), VoiceError> {
        if let Some((_, handle)) = self.tracks.remove(&guild) {
            // Finished: ya había terminado, el evento End está en camino
            if let Err(e) = handle.stop() {
                debug!("Track ya detenido en guild {}: {}", guild, e);
            }
        }
        Ok(())
    }

    async fn disconnect(&self, guild: GuildId) -> Result<(), VoiceError> {
        self.tracks.remove(&guild);
        match self.manager.remove(guild).await {
            Ok(()) | Err(JoinError::NoCall) => {
                info!("👋 Desconectado del canal de voz en guild {}", guild);
                Ok(())
            }
            Err(e) => Err(VoiceError::Transport(e.to_string())),
        }
    }
}

/// Reenvía End/Error del track a la sala.
struct TrackEndRelay {
    signal: PlaybackSignal,
}

#[async_trait]
impl VoiceEventHandler for TrackEndRelay {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        let failure = match ctx {
            EventContext::Track(tracks) => tracks.iter().find_map(|(state, _)| match &state.playing {
                PlayMode::Errored(e) => Some(format!("{:?}", e)),
                _ => None,
            }),
            _ => None,
        };

        match failure {
            Some(reason) => {
                warn!("⚠️ Error de reproducción: {}", reason);
                self.signal.failed(reason);
            }
            None => self.signal.finished(),
        }

        // un solo aviso por track
        Some(Event::Cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::{
            probe::fixtures::ogg_opus_head,
            resolver::{StreamCommands, StreamResolver},
        },
        process::{CommandSpec, CommandTemplate, ProcessSupervisor},
    };
    use std::time::Duration;

    #[tokio::test]
    async fn media_source_replays_head_then_rest_of_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("track.ogg");
        let mut payload = ogg_opus_head();
        payload.extend_from_slice(&[7u8; 100_000]);
        std::fs::write(&path, &payload).unwrap();

        let cat = |label: &str| {
            CommandTemplate::new(CommandSpec::new(label, "sh").args(["-c", "cat '{reference}'"]))
        };
        let supervisor = ProcessSupervisor::new(5);
        let resolver = StreamResolver::new(
            supervisor.clone(),
            StreamCommands {
                fast_path: cat("yt-dlp"),
                extract: cat("yt-dlp"),
                transcode: CommandTemplate::new(CommandSpec::new("ffmpeg", "cat")),
            },
            Duration::from_secs(5),
        );

        let stream = resolver
            .resolve(&path.display().to_string(), supervisor.begin_attempt())
            .await
            .unwrap();
        let mut source = ProcessMediaSource::new(stream).unwrap();
        assert!(!source.is_seekable());
        assert!(source.seek(SeekFrom::Start(0)).is_err());

        let read = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            source.read_to_end(&mut out).map(|_| out)
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(read, payload);

        // el guard se soltó junto con la fuente
        assert_eq!(supervisor.open_attempts(), 0);
    }

    #[tokio::test]
    async fn signal_reports_attempt_and_reason() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let supervisor = ProcessSupervisor::new(1);
        let attempt = supervisor.begin_attempt();
        let signal = PlaybackSignal::new(tx, attempt.id());

        signal.failed("decoder");
        signal.finished();

        match rx.recv().await {
            Some(RoomCommand::PlaybackEnded { attempt: a, error }) => {
                assert_eq!(a, attempt.id());
                assert_eq!(error.as_deref(), Some("decoder"));
            }
            other => panic!("inesperado: {:?}", other.is_some()),
        }
        assert!(matches!(
            rx.recv().await,
            Some(RoomCommand::PlaybackEnded { error: None, .. })
        ));
    }
}
