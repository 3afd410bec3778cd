//! Per-guild playback engine.
//!
//! Every guild gets a room actor: a tokio task that owns the room's queue,
//! now-playing slot and voice connection, and processes [`RoomCommand`]s one
//! at a time. User commands, stream completion and resolution results all
//! arrive through the same channel, so no lock guards room state.
//!
//! Resolution runs in its own task and reports back with
//! [`RoomCommand::StreamReady`]. Each resolution has an [`AttemptId`]; results
//! and end events tagged with an attempt that is no longer current are
//! dropped, which also kills whatever processes they still hold.

use dashmap::DashMap;
use serde::Serialize;
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::{
    ops::ControlFlow,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Duration,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::{
    queue::TrackQueue,
    resolver::{ResolvedStream, StreamResolver},
    transport::{PlaybackSignal, VoiceTransport},
};
use crate::{
    error::{PlaybackError, ResolutionError, VoiceError},
    process::AttemptId,
    sources::{Track, TrackLookup},
};

/// Tope para unirse a un canal de voz; la sala no atiende otros comandos
/// mientras tanto.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Dónde ocurrió un evento de reproducción.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomContext {
    pub guild_id: GuildId,
    pub text_channel: Option<ChannelId>,
}

/// Avisos hacia los usuarios. Sin retorno: un fallo aquí nunca afecta la
/// reproducción.
#[cfg_attr(test, mockall::automock)]
pub trait PlaybackNotifier: Send + Sync {
    fn track_started(&self, room: &RoomContext, track: &Track);

    fn track_queued(&self, room: &RoomContext, track: &Track, as_next: bool);

    fn track_failed(&self, room: &RoomContext, track: &Track, error: &PlaybackError);
}

/// Quién pide algo y desde dónde.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requester {
    pub user_id: UserId,
    /// Canal de voz en el que está el usuario
    pub voice_channel: Option<ChannelId>,
    /// Canal de texto para los anuncios
    pub text_channel: Option<ChannelId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackStatus {
    Idle,
    Playing,
    Paused,
}

/// Vista de solo lectura de una sala.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomSnapshot {
    pub status: PlaybackStatus,
    pub now_playing: Option<Track>,
    pub upcoming: Vec<Track>,
    pub queued: usize,
}

impl RoomSnapshot {
    fn idle() -> Self {
        Self {
            status: PlaybackStatus::Idle,
            now_playing: None,
            upcoming: Vec::new(),
            queued: 0,
        }
    }
}

type Reply<T = ()> = oneshot::Sender<Result<T, PlaybackError>>;

/// Mensajes que procesa el actor de una sala.
pub enum RoomCommand {
    Enqueue {
        track: Track,
        requester: Requester,
        at_front: bool,
        reply: Reply,
    },
    Skip {
        reply: Reply,
    },
    Stop {
        reply: Reply,
    },
    Pause {
        reply: Reply,
    },
    Resume {
        reply: Reply,
    },
    Leave {
        reply: Reply,
    },
    Snapshot {
        reply: Reply<RoomSnapshot>,
    },
    StreamReady {
        attempt: AttemptId,
        result: Result<ResolvedStream, ResolutionError>,
    },
    PlaybackEnded {
        attempt: AttemptId,
        error: Option<String>,
    },
}

/// Colaboradores compartidos por todas las salas.
pub struct PlaybackServices {
    pub lookup: TrackLookup,
    pub resolver: StreamResolver,
    pub transport: Arc<dyn VoiceTransport>,
    pub notifier: Arc<dyn PlaybackNotifier>,
    pub max_queue_size: usize,
    pub preview_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    /// Stream pedido pero aún no adjuntado
    Resolving { attempt: AttemptId, paused: bool },
    Playing { attempt: AttemptId },
    Paused { attempt: AttemptId },
}

impl Phase {
    fn attempt(&self) -> Option<AttemptId> {
        match *self {
            Phase::Idle => None,
            Phase::Resolving { attempt, .. } | Phase::Playing { attempt } | Phase::Paused { attempt } => {
                Some(attempt)
            }
        }
    }

    fn is_attached(&self) -> bool {
        matches!(self, Phase::Playing { .. } | Phase::Paused { .. })
    }

    fn status(&self) -> PlaybackStatus {
        match self {
            Phase::Idle => PlaybackStatus::Idle,
            Phase::Resolving { paused: true, .. } | Phase::Paused { .. } => PlaybackStatus::Paused,
            Phase::Resolving { paused: false, .. } | Phase::Playing { .. } => PlaybackStatus::Playing,
        }
    }
}

struct RoomActor {
    guild_id: GuildId,
    queue: TrackQueue,
    now_playing: Option<Track>,
    phase: Phase,
    connection: Option<ChannelId>,
    text_channel: Option<ChannelId>,
    services: Arc<PlaybackServices>,
    /// Débil: la sala termina cuando nadie más guarda un handle
    commands: mpsc::WeakUnboundedSender<RoomCommand>,
    inbox: mpsc::UnboundedReceiver<RoomCommand>,
}

impl RoomActor {
    async fn run(mut self) {
        debug!("🏠 Sala creada para guild {}", self.guild_id);

        while let Some(command) = self.inbox.recv().await {
            if self.handle(command).await.is_break() {
                break;
            }
        }

        // lo que quede en el canal se descarta y sus respuestas fallan
        self.inbox.close();
        info!("👋 Sala de guild {} cerrada", self.guild_id);
    }

    async fn handle(&mut self, command: RoomCommand) -> ControlFlow<()> {
        match command {
            RoomCommand::Enqueue {
                track,
                requester,
                at_front,
                reply,
            } => {
                let result = self.enqueue(track, requester, at_front).await;
                let _ = reply.send(result);
            }
            RoomCommand::Skip { reply } => {
                let result = self.skip().await;
                let _ = reply.send(result);
            }
            RoomCommand::Stop { reply } => {
                self.stop().await;
                let _ = reply.send(Ok(()));
            }
            RoomCommand::Pause { reply } => {
                let result = self.pause().await;
                let _ = reply.send(result);
            }
            RoomCommand::Resume { reply } => {
                let result = self.resume().await;
                let _ = reply.send(result);
            }
            RoomCommand::Leave { reply } => {
                let result = self.leave().await;
                let closed = result.is_ok();
                let _ = reply.send(result);
                if closed {
                    return ControlFlow::Break(());
                }
            }
            RoomCommand::Snapshot { reply } => {
                let _ = reply.send(Ok(self.snapshot()));
            }
            RoomCommand::StreamReady { attempt, result } => {
                self.on_stream_ready(attempt, result).await;
            }
            RoomCommand::PlaybackEnded { attempt, error } => {
                self.on_playback_ended(attempt, error);
            }
        }
        ControlFlow::Continue(())
    }

    async fn enqueue(
        &mut self,
        track: Track,
        requester: Requester,
        at_front: bool,
    ) -> Result<(), PlaybackError> {
        let channel = requester
            .voice_channel
            .ok_or(PlaybackError::NotInVoiceChannel)?;

        match self.connection {
            Some(current) if current != channel => {
                return Err(VoiceError::AlreadyConnectedElsewhere.into())
            }
            Some(_) => {}
            None => {
                let connect = self.services.transport.connect(self.guild_id, channel);
                match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
                    Ok(result) => result?,
                    Err(_) => {
                        warn!("⏱️ Conexión de voz agotada en guild {}", self.guild_id);
                        return Err(VoiceError::Transport(
                            "tiempo de conexión agotado".to_string(),
                        )
                        .into());
                    }
                }
                self.connection = Some(channel);
            }
        }

        if requester.text_channel.is_some() {
            self.text_channel = requester.text_channel;
        }

        if self.phase == Phase::Idle {
            self.start(track, false);
            return Ok(());
        }

        if at_front {
            self.queue.push_front(track.clone())?;
        } else {
            self.queue.push_back(track.clone())?;
        }
        self.notify("track_queued", |notifier, room| {
            notifier.track_queued(room, &track, at_front)
        });
        Ok(())
    }

    async fn skip(&mut self) -> Result<(), PlaybackError> {
        let attempt = self.phase.attempt().ok_or(PlaybackError::NothingPlaying)?;

        self.services.resolver.supervisor().kill_attempt(attempt);
        if self.phase.is_attached() {
            self.stop_player().await;
        }
        if let Some(track) = &self.now_playing {
            info!("⏭️ Canción saltada: {}", track.title());
        }

        self.advance();
        Ok(())
    }

    async fn stop(&mut self) {
        self.queue.clear();

        if let Some(attempt) = self.phase.attempt() {
            self.services.resolver.supervisor().kill_attempt(attempt);
            if self.phase.is_attached() {
                self.stop_player().await;
            }
        }

        self.phase = Phase::Idle;
        self.now_playing = None;
        info!("⏹️ Reproducción detenida en guild {}", self.guild_id);
    }

    async fn pause(&mut self) -> Result<(), PlaybackError> {
        match self.phase {
            Phase::Idle => Err(PlaybackError::NothingPlaying),
            Phase::Paused { .. } | Phase::Resolving { paused: true, .. } => {
                Err(PlaybackError::AlreadyPaused)
            }
            Phase::Resolving { attempt, .. } => {
                // se adjunta en pausa cuando llegue el stream
                self.phase = Phase::Resolving {
                    attempt,
                    paused: true,
                };
                info!("⏸️ Reproducción pausada (pendiente)");
                Ok(())
            }
            Phase::Playing { attempt } => {
                self.services.transport.pause(self.guild_id).await?;
                self.phase = Phase::Paused { attempt };
                info!("⏸️ Reproducción pausada");
                Ok(())
            }
        }
    }

    async fn resume(&mut self) -> Result<(), PlaybackError> {
        match self.phase {
            Phase::Idle => Err(PlaybackError::NothingPlaying),
            Phase::Playing { .. } | Phase::Resolving { paused: false, .. } => {
                Err(PlaybackError::NotPaused)
            }
            Phase::Resolving { attempt, .. } => {
                self.phase = Phase::Resolving {
                    attempt,
                    paused: false,
                };
                info!("▶️ Reproducción reanudada");
                Ok(())
            }
            Phase::Paused { attempt } => {
                self.services.transport.unpause(self.guild_id).await?;
                self.phase = Phase::Playing { attempt };
                info!("▶️ Reproducción reanudada");
                Ok(())
            }
        }
    }

    async fn leave(&mut self) -> Result<(), PlaybackError> {
        if self.connection.is_none() {
            return Err(PlaybackError::NotConnected);
        }

        self.stop().await;
        if let Err(e) = self.services.transport.disconnect(self.guild_id).await {
            warn!("⚠️ Error al desconectar guild {}: {}", self.guild_id, e);
        }
        self.connection = None;
        Ok(())
    }

    fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            status: self.phase.status(),
            now_playing: self.now_playing.clone(),
            upcoming: self.queue.snapshot(self.services.preview_size),
            queued: self.queue.len(),
        }
    }

    /// Pone `track` como actual y lanza su resolución.
    fn start(&mut self, track: Track, paused: bool) {
        let Some(room) = self.commands.upgrade() else {
            debug!("Sala de guild {} sin handles, no se resuelve", self.guild_id);
            return;
        };
        let attempt = self.services.resolver.supervisor().begin_attempt();
        let id = attempt.id();
        let reference = track.stream_reference().to_string();

        info!("🔎 Preparando stream de {} (intento {})", track.title(), id);
        self.now_playing = Some(track);
        self.phase = Phase::Resolving {
            attempt: id,
            paused,
        };

        let services = Arc::clone(&self.services);
        tokio::spawn(async move {
            let task =
                tokio::spawn(async move { services.resolver.resolve(&reference, attempt).await });

            let result = match task.await {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(ResolutionError::Aborted(
                    "pánico durante la resolución".to_string(),
                )),
                Err(e) => Err(ResolutionError::Aborted(e.to_string())),
            };

            let _ = room.send(RoomCommand::StreamReady {
                attempt: id,
                result,
            });
        });
    }

    async fn on_stream_ready(
        &mut self,
        attempt: AttemptId,
        result: Result<ResolvedStream, ResolutionError>,
    ) {
        let paused = match self.phase {
            Phase::Resolving {
                attempt: current,
                paused,
            } if current == attempt => paused,
            _ => {
                debug!("🗑️ Resultado obsoleto del intento {} descartado", attempt);
                return;
            }
        };

        let stream = match result {
            Ok(stream) => stream,
            Err(e) => return self.fail_current(attempt, e.into()),
        };

        let Some(room) = self.commands.upgrade() else {
            return;
        };
        let signal = PlaybackSignal::new(room, attempt);
        if let Err(e) = self
            .services
            .transport
            .play(self.guild_id, stream, signal, paused)
            .await
        {
            return self.fail_current(attempt, e.into());
        }

        self.phase = if paused {
            Phase::Paused { attempt }
        } else {
            Phase::Playing { attempt }
        };

        if let Some(track) = self.now_playing.clone() {
            info!("🎵 Reproduciendo: {}", track.title());
            self.notify("track_started", |notifier, room| {
                notifier.track_started(room, &track)
            });
        }
    }

    fn on_playback_ended(&mut self, attempt: AttemptId, error: Option<String>) {
        match self.phase {
            Phase::Playing { attempt: current } | Phase::Paused { attempt: current }
                if current == attempt => {}
            _ => {
                debug!("Evento de fin obsoleto del intento {}", attempt);
                return;
            }
        }

        match error {
            Some(reason) => warn!("⚠️ Error de reproducción en guild {}: {}", self.guild_id, reason),
            None => debug!("🏁 Track terminado en guild {}", self.guild_id),
        }

        self.services.resolver.supervisor().kill_attempt(attempt);
        self.advance();
    }

    fn fail_current(&mut self, attempt: AttemptId, error: PlaybackError) {
        self.services.resolver.supervisor().kill_attempt(attempt);

        if let Some(track) = self.now_playing.clone() {
            warn!("❌ No se pudo reproducir {}: {}", track.title(), error);
            self.notify("track_failed", |notifier, room| {
                notifier.track_failed(room, &track, &error)
            });
        }

        self.advance();
    }

    fn advance(&mut self) {
        self.now_playing = None;
        self.phase = Phase::Idle;

        match self.queue.pop_front() {
            Some(next) => self.start(next, false),
            None => info!("📭 Cola terminada en guild {}", self.guild_id),
        }
    }

    async fn stop_player(&self) {
        if let Err(e) = self.services.transport.stop(self.guild_id).await {
            warn!("⚠️ No se pudo detener el reproductor: {}", e);
        }
    }

    fn notify(&self, event: &str, announce: impl FnOnce(&dyn PlaybackNotifier, &RoomContext)) {
        let room = RoomContext {
            guild_id: self.guild_id,
            text_channel: self.text_channel,
        };
        let notifier = self.services.notifier.as_ref();

        if panic::catch_unwind(AssertUnwindSafe(|| announce(notifier, &room))).is_err() {
            error!("💥 El notificador falló en {} (guild {})", event, self.guild_id);
        }
    }
}

#[derive(Clone)]
struct RoomHandle {
    commands: mpsc::UnboundedSender<RoomCommand>,
}

impl RoomHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> RoomCommand,
    ) -> Result<T, PlaybackError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| PlaybackError::RoomClosed)?;
        response.await.map_err(|_| PlaybackError::RoomClosed)?
    }
}

/// Registro de salas: una por guild, creada al primer uso.
pub struct PlaybackManager {
    rooms: DashMap<GuildId, RoomHandle>,
    services: Arc<PlaybackServices>,
}

impl PlaybackManager {
    pub fn new(services: PlaybackServices) -> Self {
        Self {
            rooms: DashMap::new(),
            services: Arc::new(services),
        }
    }

    pub fn services(&self) -> &PlaybackServices {
        &self.services
    }

    pub fn active_rooms(&self) -> usize {
        self.rooms.len()
    }

    /// Resuelve `raw` y lo encola. Si la sala está libre empieza a sonar.
    pub async fn enqueue(
        &self,
        guild_id: GuildId,
        raw: &str,
        requester: Requester,
        at_front: bool,
    ) -> Result<Track, PlaybackError> {
        if requester.voice_channel.is_none() {
            return Err(PlaybackError::NotInVoiceChannel);
        }

        let track = self
            .services
            .lookup
            .resolve(raw, requester.user_id)
            .await?;

        // una sala que cerraba justo en este momento se reemplaza una vez
        for _ in 0..2 {
            let room = self.room(guild_id);
            let result = room
                .request(|reply| RoomCommand::Enqueue {
                    track: track.clone(),
                    requester,
                    at_front,
                    reply,
                })
                .await;

            match result {
                Err(PlaybackError::RoomClosed) => self.forget(guild_id, &room),
                other => return other.map(|()| track),
            }
        }

        Err(PlaybackError::RoomClosed)
    }

    pub async fn skip(&self, guild_id: GuildId) -> Result<(), PlaybackError> {
        match self.existing(guild_id) {
            Some(room) => room.request(|reply| RoomCommand::Skip { reply }).await,
            None => Err(PlaybackError::NothingPlaying),
        }
    }

    pub async fn stop(&self, guild_id: GuildId) -> Result<(), PlaybackError> {
        match self.existing(guild_id) {
            Some(room) => room.request(|reply| RoomCommand::Stop { reply }).await,
            None => Ok(()),
        }
    }

    pub async fn pause(&self, guild_id: GuildId) -> Result<(), PlaybackError> {
        match self.existing(guild_id) {
            Some(room) => room.request(|reply| RoomCommand::Pause { reply }).await,
            None => Err(PlaybackError::NothingPlaying),
        }
    }

    pub async fn resume(&self, guild_id: GuildId) -> Result<(), PlaybackError> {
        match self.existing(guild_id) {
            Some(room) => room.request(|reply| RoomCommand::Resume { reply }).await,
            None => Err(PlaybackError::NothingPlaying),
        }
    }

    /// Detiene todo, desconecta y descarta la sala.
    pub async fn leave(&self, guild_id: GuildId) -> Result<(), PlaybackError> {
        let room = self.existing(guild_id).ok_or(PlaybackError::NotConnected)?;
        let result = room.request(|reply| RoomCommand::Leave { reply }).await;

        if matches!(result, Ok(()) | Err(PlaybackError::RoomClosed)) {
            self.forget(guild_id, &room);
        }
        match result {
            Err(PlaybackError::RoomClosed) => Err(PlaybackError::NotConnected),
            other => other,
        }
    }

    pub async fn snapshot(&self, guild_id: GuildId) -> RoomSnapshot {
        match self.existing(guild_id) {
            Some(room) => room
                .request(|reply| RoomCommand::Snapshot { reply })
                .await
                .unwrap_or_else(|_| RoomSnapshot::idle()),
            None => RoomSnapshot::idle(),
        }
    }

    /// Sale de todas las salas; usado al apagar.
    pub async fn shutdown(&self) {
        let guilds: Vec<GuildId> = self.rooms.iter().map(|entry| *entry.key()).collect();
        info!("🛑 Cerrando {} salas activas", guilds.len());

        for guild_id in guilds {
            match self.leave(guild_id).await {
                Ok(()) | Err(PlaybackError::NotConnected) => {}
                Err(e) => warn!("⚠️ Error cerrando sala de guild {}: {}", guild_id, e),
            }
        }
        self.rooms.clear();
    }

    fn existing(&self, guild_id: GuildId) -> Option<RoomHandle> {
        self.rooms
            .get(&guild_id)
            .map(|room| room.clone())
            .filter(|room| !room.commands.is_closed())
    }

    fn room(&self, guild_id: GuildId) -> RoomHandle {
        let mut entry = self
            .rooms
            .entry(guild_id)
            .or_insert_with(|| self.spawn_room(guild_id));
        if entry.commands.is_closed() {
            *entry = self.spawn_room(guild_id);
        }
        entry.clone()
    }

    fn forget(&self, guild_id: GuildId, room: &RoomHandle) {
        self.rooms
            .remove_if(&guild_id, |_, current| current.commands.same_channel(&room.commands));
    }

    fn spawn_room(&self, guild_id: GuildId) -> RoomHandle {
        let (commands, inbox) = mpsc::unbounded_channel();
        let actor = RoomActor {
            guild_id,
            queue: TrackQueue::new(self.services.max_queue_size),
            now_playing: None,
            phase: Phase::Idle,
            connection: None,
            text_channel: None,
            services: Arc::clone(&self.services),
            commands: commands.downgrade(),
            inbox,
        };
        tokio::spawn(actor.run());

        RoomHandle { commands }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::{
        audio::{probe::fixtures::ogg_opus_head, resolver::StreamCommands},
        cache::MetadataCache,
        process::{CommandSpec, CommandTemplate, ProcessSupervisor},
        sources::fixtures::CountingSource,
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::{collections::HashMap, time::Duration};
    use tempfile::TempDir;

    pub const GUILD: GuildId = GuildId::new(1);
    pub const MISSING_CHANNEL: u64 = 404;
    /// Canal cuyo `connect` nunca termina.
    pub const STUCK_CHANNEL: u64 = 408;

    /// Transporte en memoria: registra llamadas y guarda el stream adjuntado.
    #[derive(Default)]
    pub struct FakeTransport {
        calls: Mutex<Vec<String>>,
        attached: Mutex<HashMap<GuildId, (PlaybackSignal, ResolvedStream)>>,
    }

    impl FakeTransport {
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        pub fn count(&self, call: &str) -> usize {
            self.calls.lock().iter().filter(|c| c.as_str() == call).count()
        }

        pub fn is_attached(&self, guild: GuildId) -> bool {
            self.attached.lock().contains_key(&guild)
        }

        /// El stream actual termina por sí solo.
        pub fn finish(&self, guild: GuildId) {
            let attached = self.attached.lock().remove(&guild);
            if let Some((signal, _stream)) = attached {
                signal.finished();
            }
        }

        pub fn fail(&self, guild: GuildId) {
            let attached = self.attached.lock().remove(&guild);
            if let Some((signal, _stream)) = attached {
                signal.failed("decoder");
            }
        }
    }

    #[async_trait]
    impl VoiceTransport for FakeTransport {
        async fn connect(&self, _guild: GuildId, channel: ChannelId) -> Result<(), VoiceError> {
            match channel.get() {
                MISSING_CHANNEL => return Err(VoiceError::ChannelNotFound),
                STUCK_CHANNEL => std::future::pending::<()>().await,
                _ => {}
            }
            self.calls.lock().push(format!("connect:{}", channel));
            Ok(())
        }

        async fn play(
            &self,
            guild: GuildId,
            stream: ResolvedStream,
            signal: PlaybackSignal,
            paused: bool,
        ) -> Result<(), VoiceError> {
            self.calls
                .lock()
                .push(if paused { "play(paused)" } else { "play" }.to_string());
            self.attached.lock().insert(guild, (signal, stream));
            Ok(())
        }

        async fn pause(&self, _guild: GuildId) -> Result<(), VoiceError> {
            self.calls.lock().push("pause".into());
            Ok(())
        }

        async fn unpause(&self, _guild: GuildId) -> Result<(), VoiceError> {
            self.calls.lock().push("unpause".into());
            Ok(())
        }

        async fn stop(&self, guild: GuildId) -> Result<(), VoiceError> {
            self.calls.lock().push("stop".into());
            self.finish(guild);
            Ok(())
        }

        async fn disconnect(&self, guild: GuildId) -> Result<(), VoiceError> {
            self.calls.lock().push("disconnect".into());
            self.attached.lock().remove(&guild);
            Ok(())
        }
    }

    pub struct Harness {
        pub manager: Arc<PlaybackManager>,
        pub transport: Arc<FakeTransport>,
        pub source: Arc<CountingSource>,
        pub events: Arc<Mutex<Vec<String>>>,
        dir: TempDir,
    }

    impl Harness {
        /// Archivo donde la etapa rápida de una referencia `hang` deja su pid.
        pub fn pid_file(&self) -> std::path::PathBuf {
            self.dir.path().join("hang.pid")
        }
    }

    pub fn recording_notifier(events: &Arc<Mutex<Vec<String>>>) -> MockPlaybackNotifier {
        let mut notifier = MockPlaybackNotifier::new();
        let log = events.clone();
        notifier
            .expect_track_started()
            .returning(move |_, track| log.lock().push(format!("started:{}", track.title())));
        let log = events.clone();
        notifier
            .expect_track_queued()
            .returning(move |_, track, next| {
                log.lock().push(format!("queued:{}:{}", track.title(), next))
            });
        let log = events.clone();
        notifier
            .expect_track_failed()
            .returning(move |_, track, _| log.lock().push(format!("failed:{}", track.title())));
        notifier
    }

    pub fn harness() -> Harness {
        build_harness(10, recording_notifier)
    }

    /// Referencias con `slow` tardan un segundo en resolver; con `broken`
    /// fallan en ambas etapas; con `hang` la etapa rápida escribe su pid y no
    /// termina nunca.
    pub fn build_harness(
        max_queue_size: usize,
        notifier: impl FnOnce(&Arc<Mutex<Vec<String>>>) -> MockPlaybackNotifier,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("track.ogg");
        let mut payload = ogg_opus_head();
        payload.extend_from_slice(b"opus-frames");
        std::fs::write(&audio, payload).unwrap();

        let pid_file = dir.path().join("hang.pid");
        let script = |on_broken: &str, on_hang: &str| {
            format!(
                "case '{{reference}}' in *slow*) sleep 1;; esac; \
                 case '{{reference}}' in *hang*) {};; esac; \
                 case '{{reference}}' in *broken*) {};; esac; cat '{}'",
                on_hang,
                on_broken,
                audio.display()
            )
        };
        let hang = format!("echo $$ > '{}'; exec sleep 30", pid_file.display());
        let sh = |label: &str, script: String| {
            CommandTemplate::new(CommandSpec::new(label, "sh").args(["-c".to_string(), script]))
        };

        let resolver = StreamResolver::new(
            ProcessSupervisor::new(5),
            StreamCommands {
                fast_path: sh("yt-dlp", script("exit 1", hang.as_str())),
                extract: sh("yt-dlp", script("echo 'ERROR: roto' >&2; exit 2", ":")),
                transcode: CommandTemplate::new(CommandSpec::new("ffmpeg", "cat")),
            },
            Duration::from_secs(5),
        );

        let source = Arc::new(CountingSource {
            delay: Duration::from_millis(20),
            ..CountingSource::new()
        });
        let transport = Arc::new(FakeTransport::default());
        let events = Arc::new(Mutex::new(Vec::new()));

        let manager = Arc::new(PlaybackManager::new(PlaybackServices {
            lookup: TrackLookup::new(MetadataCache::new(), source.clone(), Duration::from_secs(1800)),
            resolver,
            transport: transport.clone(),
            notifier: Arc::new(notifier(&events)),
            max_queue_size,
            preview_size: 10,
        }));

        Harness {
            manager,
            transport,
            source,
            events,
            dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn user_in(channel: u64) -> Requester {
        Requester {
            user_id: UserId::new(42),
            voice_channel: Some(ChannelId::new(channel)),
            text_channel: Some(ChannelId::new(99)),
        }
    }

    fn titles(snapshot: &RoomSnapshot) -> Vec<&str> {
        snapshot.upcoming.iter().map(Track::title).collect()
    }

    fn now_playing(snapshot: &RoomSnapshot) -> Option<&str> {
        snapshot.now_playing.as_ref().map(Track::title)
    }

    async fn wait_until(h: &Harness, done: impl Fn(&RoomSnapshot, &FakeTransport) -> bool) -> RoomSnapshot {
        for _ in 0..500 {
            let snapshot = h.manager.snapshot(GUILD).await;
            if done(&snapshot, h.transport.as_ref()) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condición no alcanzada: {:?}", h.manager.snapshot(GUILD).await);
    }

    async fn wait_playing(h: &Harness, title: &str) -> RoomSnapshot {
        wait_until(h, |s, t| now_playing(s) == Some(title) && t.is_attached(GUILD)).await
    }

    #[tokio::test]
    async fn queued_track_plays_after_current_ends() {
        let h = harness();

        let track = h.manager.enqueue(GUILD, "A", user_in(7), false).await.unwrap();
        assert_eq!(track.title(), "A");
        let snapshot = h.manager.snapshot(GUILD).await;
        assert_eq!(now_playing(&snapshot), Some("A"));
        assert_eq!(snapshot.queued, 0);
        wait_playing(&h, "A").await;

        h.manager.enqueue(GUILD, "B", user_in(7), false).await.unwrap();
        let snapshot = h.manager.snapshot(GUILD).await;
        assert_eq!(now_playing(&snapshot), Some("A"));
        assert_eq!(titles(&snapshot), vec!["B"]);

        h.transport.finish(GUILD);
        let snapshot = wait_playing(&h, "B").await;
        assert_eq!(snapshot.queued, 0);
        assert_eq!(snapshot.status, PlaybackStatus::Playing);

        assert_eq!(
            *h.events.lock(),
            vec!["started:A", "queued:B:false", "started:B"]
        );
        assert_eq!(h.transport.count("connect:7"), 1);
    }

    #[tokio::test]
    async fn play_next_goes_before_the_previous_head() {
        let h = harness();
        h.manager.enqueue(GUILD, "A", user_in(7), false).await.unwrap();
        h.manager.enqueue(GUILD, "B", user_in(7), false).await.unwrap();
        h.manager.enqueue(GUILD, "C", user_in(7), false).await.unwrap();

        h.manager.enqueue(GUILD, "D", user_in(7), true).await.unwrap();

        let snapshot = h.manager.snapshot(GUILD).await;
        assert_eq!(titles(&snapshot), vec!["D", "B", "C"]);
        assert!(h.events.lock().contains(&"queued:D:true".to_string()));
    }

    #[tokio::test]
    async fn skip_with_nothing_playing_is_rejected() {
        let h = harness();
        assert_eq!(h.manager.skip(GUILD).await, Err(PlaybackError::NothingPlaying));

        h.manager.enqueue(GUILD, "A", user_in(7), false).await.unwrap();
        wait_playing(&h, "A").await;
        h.manager.stop(GUILD).await.unwrap();

        assert_eq!(h.manager.skip(GUILD).await, Err(PlaybackError::NothingPlaying));
        assert_eq!(h.manager.snapshot(GUILD).await, RoomSnapshot::idle());
    }

    #[tokio::test]
    async fn skip_advances_to_the_next_track() {
        let h = harness();
        h.manager.enqueue(GUILD, "A", user_in(7), false).await.unwrap();
        h.manager.enqueue(GUILD, "B", user_in(7), false).await.unwrap();
        wait_playing(&h, "A").await;

        h.manager.skip(GUILD).await.unwrap();
        wait_playing(&h, "B").await;

        h.manager.skip(GUILD).await.unwrap();
        let snapshot = h.manager.snapshot(GUILD).await;
        assert_eq!(snapshot.status, PlaybackStatus::Idle);
        assert_eq!(h.transport.count("stop"), 2);
    }

    #[tokio::test]
    async fn stop_always_ends_idle_with_empty_queue() {
        let h = harness();

        // sin sala
        h.manager.stop(GUILD).await.unwrap();

        // reproduciendo con cola
        h.manager.enqueue(GUILD, "A", user_in(7), false).await.unwrap();
        h.manager.enqueue(GUILD, "B", user_in(7), false).await.unwrap();
        wait_playing(&h, "A").await;
        h.manager.stop(GUILD).await.unwrap();
        assert_eq!(h.manager.snapshot(GUILD).await, RoomSnapshot::idle());

        // en pausa
        h.manager.enqueue(GUILD, "C", user_in(7), false).await.unwrap();
        wait_playing(&h, "C").await;
        h.manager.pause(GUILD).await.unwrap();
        h.manager.stop(GUILD).await.unwrap();
        assert_eq!(h.manager.snapshot(GUILD).await, RoomSnapshot::idle());

        // ya detenida
        h.manager.stop(GUILD).await.unwrap();
        assert_eq!(h.manager.snapshot(GUILD).await, RoomSnapshot::idle());
    }

    #[tokio::test]
    async fn pause_and_resume_only_from_the_matching_state() {
        let h = harness();
        assert_eq!(h.manager.pause(GUILD).await, Err(PlaybackError::NothingPlaying));
        assert_eq!(h.manager.resume(GUILD).await, Err(PlaybackError::NothingPlaying));

        h.manager.enqueue(GUILD, "A", user_in(7), false).await.unwrap();
        wait_playing(&h, "A").await;

        assert_eq!(h.manager.resume(GUILD).await, Err(PlaybackError::NotPaused));
        h.manager.pause(GUILD).await.unwrap();
        assert_eq!(h.manager.snapshot(GUILD).await.status, PlaybackStatus::Paused);
        assert_eq!(h.manager.pause(GUILD).await, Err(PlaybackError::AlreadyPaused));

        h.manager.resume(GUILD).await.unwrap();
        assert_eq!(h.manager.snapshot(GUILD).await.status, PlaybackStatus::Playing);
        assert_eq!(h.transport.count("pause"), 1);
        assert_eq!(h.transport.count("unpause"), 1);
    }

    #[tokio::test]
    async fn pause_while_resolving_attaches_paused() {
        let h = harness();
        h.manager.enqueue(GUILD, "slow A", user_in(7), false).await.unwrap();

        h.manager.pause(GUILD).await.unwrap();
        assert_eq!(h.manager.snapshot(GUILD).await.status, PlaybackStatus::Paused);

        let snapshot = wait_until(&h, |_, t| t.is_attached(GUILD)).await;
        assert_eq!(snapshot.status, PlaybackStatus::Paused);
        assert!(h.transport.calls().contains(&"play(paused)".to_string()));

        h.manager.resume(GUILD).await.unwrap();
        assert_eq!(h.manager.snapshot(GUILD).await.status, PlaybackStatus::Playing);
    }

    /// Vivo y sin recolectar: un zombi ya no cuenta.
    fn process_alive(pid: u32) -> bool {
        std::fs::read_to_string(format!("/proc/{pid}/stat"))
            .map(|stat| {
                let state = stat.rsplit(')').next().unwrap_or("").trim_start();
                !state.starts_with('Z')
            })
            .unwrap_or(false)
    }

    async fn hanging_stage_pid(h: &Harness) -> u32 {
        for _ in 0..500 {
            if let Ok(pid) = std::fs::read_to_string(h.pid_file()) {
                if let Ok(pid) = pid.trim().parse() {
                    return pid;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("la etapa rápida no arrancó");
    }

    async fn assert_killed_promptly(pid: u32) {
        for _ in 0..20 {
            if !process_alive(pid) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("el proceso {pid} sigue vivo");
    }

    #[tokio::test]
    async fn skip_while_resolving_kills_the_stage_process() {
        let h = harness();
        h.manager.enqueue(GUILD, "hang A", user_in(7), false).await.unwrap();
        h.manager.enqueue(GUILD, "B", user_in(7), false).await.unwrap();
        let pid = hanging_stage_pid(&h).await;
        assert!(process_alive(pid));

        h.manager.skip(GUILD).await.unwrap();
        assert_killed_promptly(pid).await;
        wait_playing(&h, "B").await;
    }

    #[tokio::test]
    async fn stop_while_resolving_kills_the_stage_process() {
        let h = harness();
        h.manager.enqueue(GUILD, "hang A", user_in(7), false).await.unwrap();
        let pid = hanging_stage_pid(&h).await;

        h.manager.stop(GUILD).await.unwrap();
        assert_killed_promptly(pid).await;
        assert_eq!(h.manager.snapshot(GUILD).await, RoomSnapshot::idle());
    }

    #[tokio::test]
    async fn leave_while_resolving_kills_the_stage_process() {
        let h = harness();
        h.manager.enqueue(GUILD, "hang A", user_in(7), false).await.unwrap();
        let pid = hanging_stage_pid(&h).await;

        h.manager.leave(GUILD).await.unwrap();
        assert_killed_promptly(pid).await;
        assert_eq!(h.transport.count("disconnect"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_voice_connect_times_out_and_room_keeps_working() {
        let h = harness();

        let err = h
            .manager
            .enqueue(GUILD, "A", user_in(STUCK_CHANNEL), false)
            .await
            .unwrap_err();
        assert!(matches!(err, PlaybackError::Voice(VoiceError::Transport(_))));

        h.manager.stop(GUILD).await.unwrap();
        assert_eq!(h.manager.snapshot(GUILD).await, RoomSnapshot::idle());
        assert!(h.transport.calls().is_empty());
    }

    #[tokio::test]
    async fn skip_while_resolving_kills_attempt_and_moves_on() {
        let h = harness();
        h.manager.enqueue(GUILD, "slow A", user_in(7), false).await.unwrap();
        h.manager.enqueue(GUILD, "B", user_in(7), false).await.unwrap();

        h.manager.skip(GUILD).await.unwrap();
        wait_playing(&h, "B").await;

        // el resultado de "slow A" llega tarde y se descarta
        tokio::time::sleep(Duration::from_millis(1200)).await;
        let snapshot = h.manager.snapshot(GUILD).await;
        assert_eq!(now_playing(&snapshot), Some("B"));
        assert_eq!(h.transport.count("play"), 1);
        assert!(!h.events.lock().contains(&"started:slow A".to_string()));
    }

    #[tokio::test]
    async fn leave_discards_room_and_next_enqueue_starts_fresh() {
        let h = harness();
        h.manager.enqueue(GUILD, "A", user_in(7), false).await.unwrap();
        h.manager.enqueue(GUILD, "B", user_in(7), false).await.unwrap();
        wait_playing(&h, "A").await;

        h.manager.leave(GUILD).await.unwrap();
        assert_eq!(h.manager.active_rooms(), 0);
        assert_eq!(h.manager.snapshot(GUILD).await, RoomSnapshot::idle());
        assert!(h.transport.calls().contains(&"disconnect".to_string()));
        assert_eq!(h.manager.leave(GUILD).await, Err(PlaybackError::NotConnected));

        h.manager.enqueue(GUILD, "C", user_in(8), false).await.unwrap();
        let snapshot = wait_playing(&h, "C").await;
        assert_eq!(snapshot.queued, 0);
        assert_eq!(h.transport.count("connect:7"), 1);
        assert_eq!(h.transport.count("connect:8"), 1);
    }

    #[tokio::test]
    async fn concurrent_identical_urls_resolve_metadata_once() {
        let h = harness();

        let (first, second) = tokio::join!(
            h.manager
                .enqueue(GUILD, "https://example.com/song", user_in(7), false),
            h.manager
                .enqueue(GUILD, "https://example.com/song#again", user_in(7), false),
        );
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_eq!(h.source.calls(), 1);
        assert_eq!(first.title(), second.title());
        assert_eq!(first.id(), second.id());
        assert_eq!(h.manager.snapshot(GUILD).await.queued, 1);
    }

    #[tokio::test]
    async fn resolution_failure_announces_and_advances() {
        let h = harness();
        h.manager
            .enqueue(GUILD, "slow broken", user_in(7), false)
            .await
            .unwrap();
        h.manager.enqueue(GUILD, "good", user_in(7), false).await.unwrap();

        let snapshot = wait_playing(&h, "good").await;
        assert_eq!(snapshot.queued, 0);
        assert_eq!(
            *h.events.lock(),
            vec!["queued:good:false", "failed:slow broken", "started:good"]
        );
    }

    #[tokio::test]
    async fn player_error_is_treated_as_end_of_stream() {
        let h = harness();
        h.manager.enqueue(GUILD, "A", user_in(7), false).await.unwrap();
        h.manager.enqueue(GUILD, "B", user_in(7), false).await.unwrap();
        wait_playing(&h, "A").await;

        h.transport.fail(GUILD);
        wait_playing(&h, "B").await;

        h.transport.fail(GUILD);
        let snapshot = wait_until(&h, |s, _| s.status == PlaybackStatus::Idle).await;
        assert_eq!(snapshot, RoomSnapshot::idle());
    }

    #[tokio::test]
    async fn panicking_notifier_does_not_break_the_room() {
        let h = build_harness(10, |events| {
            let mut notifier = MockPlaybackNotifier::new();
            notifier
                .expect_track_started()
                .returning(|_, _| panic!("notificador roto"));
            let log = events.clone();
            notifier
                .expect_track_queued()
                .returning(move |_, track, _| log.lock().push(format!("queued:{}", track.title())));
            notifier.expect_track_failed().returning(|_, _, _| ());
            notifier
        });

        h.manager.enqueue(GUILD, "A", user_in(7), false).await.unwrap();
        wait_playing(&h, "A").await;
        h.manager.enqueue(GUILD, "B", user_in(7), false).await.unwrap();

        h.transport.finish(GUILD);
        let snapshot = wait_playing(&h, "B").await;
        assert_eq!(snapshot.status, PlaybackStatus::Playing);
        assert_eq!(*h.events.lock(), vec!["queued:B"]);
    }

    #[tokio::test]
    async fn other_voice_channel_is_rejected_without_touching_queue() {
        let h = harness();
        h.manager.enqueue(GUILD, "A", user_in(7), false).await.unwrap();

        let err = h.manager.enqueue(GUILD, "B", user_in(8), false).await.unwrap_err();
        assert_eq!(err, PlaybackError::Voice(VoiceError::AlreadyConnectedElsewhere));
        assert_eq!(h.manager.snapshot(GUILD).await.queued, 0);
        assert_eq!(h.transport.count("connect:8"), 0);
    }

    #[tokio::test]
    async fn user_errors_leave_state_untouched() {
        let h = harness();

        let nowhere = Requester {
            voice_channel: None,
            ..user_in(7)
        };
        assert_eq!(
            h.manager.enqueue(GUILD, "A", nowhere, false).await,
            Err(PlaybackError::NotInVoiceChannel)
        );
        assert_eq!(h.source.calls(), 0);

        assert_eq!(
            h.manager.enqueue(GUILD, "A", user_in(MISSING_CHANNEL), false).await,
            Err(PlaybackError::Voice(VoiceError::ChannelNotFound))
        );
        assert_eq!(h.manager.snapshot(GUILD).await, RoomSnapshot::idle());
    }

    #[tokio::test]
    async fn full_queue_rejects_new_tracks() {
        let h = build_harness(1, recording_notifier);
        h.manager.enqueue(GUILD, "A", user_in(7), false).await.unwrap();
        h.manager.enqueue(GUILD, "B", user_in(7), false).await.unwrap();

        assert_eq!(
            h.manager.enqueue(GUILD, "C", user_in(7), true).await,
            Err(PlaybackError::QueueFull(1))
        );
        assert_eq!(titles(&h.manager.snapshot(GUILD).await), vec!["B"]);
    }

    #[tokio::test]
    async fn shutdown_leaves_every_room() {
        let h = harness();
        let other = GuildId::new(2);
        h.manager.enqueue(GUILD, "A", user_in(7), false).await.unwrap();
        h.manager.enqueue(other, "B", user_in(9), false).await.unwrap();
        assert_eq!(h.manager.active_rooms(), 2);

        h.manager.shutdown().await;

        assert_eq!(h.manager.active_rooms(), 0);
        assert_eq!(h.transport.count("disconnect"), 2);

        let supervisor = h.manager.services().resolver.supervisor();
        for _ in 0..200 {
            if supervisor.open_attempts() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(supervisor.open_attempts(), 0);
    }
}
