use anyhow::Result;
use serenity::{
    model::{
        gateway::GatewayIntents,
        id::{ChannelId, GuildId, UserId},
    },
    Client,
};
use songbird::{SerenityInit, Songbird};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use open_jukebox::{
    audio::{PlaybackManager, PlaybackServices, SongbirdTransport, StreamResolver},
    bot::{DiscordNotifier, JukeboxBot},
    cache::MetadataCache,
    config::Config,
    http::{self, AppState},
    process::ProcessSupervisor,
    sources::{TrackLookup, YtDlpMetadataSource, YtDlpTools},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("open_jukebox=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando Open Jukebox v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Config::load()?;
    info!("{}", config.summary());

    let supervisor = ProcessSupervisor::new(config.stderr_tail_lines);
    let tools = YtDlpTools::from_config(&config);

    // Manejar health check si es necesario
    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check(&supervisor, &tools).await;
    }

    // Precalentar herramientas en segundo plano
    supervisor.warm(&tools.ytdlp_version);
    supervisor.warm(&tools.ffmpeg_version);

    // Configurar intents mínimos necesarios
    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;

    // Construir cliente
    let songbird = Songbird::serenity();
    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(JukeboxBot::new(config.clone()))
        .register_songbird_with(songbird.clone())
        .await?;

    let lookup = TrackLookup::new(
        MetadataCache::new(),
        Arc::new(YtDlpMetadataSource::new(
            tools.metadata.clone(),
            config.metadata_timeout,
        )),
        config.metadata_ttl,
    );
    let manager = Arc::new(PlaybackManager::new(PlaybackServices {
        lookup,
        resolver: StreamResolver::new(supervisor, tools.streams.clone(), config.probe_timeout),
        transport: Arc::new(SongbirdTransport::new(songbird, client.cache.clone())),
        notifier: Arc::new(DiscordNotifier::new(client.http.clone())),
        max_queue_size: config.max_queue_size,
        preview_size: config.queue_preview_size,
    }));

    // Insertar el manager en el contexto del cliente
    {
        let mut data = client.data.write().await;
        data.insert::<PlaybackManager>(Arc::clone(&manager));
    }

    let shutdown = CancellationToken::new();

    // API HTTP opcional
    if let (Some(addr), Some(guild_id)) = (config.http_bind, config.http_guild_id) {
        let state = AppState {
            manager: Arc::clone(&manager),
            guild_id: GuildId::new(guild_id),
            voice_channel: config.http_voice_channel_id.map(ChannelId::new),
            requester: UserId::new(config.application_id),
        };
        if state.voice_channel.is_none() {
            warn!("⚠️ HTTP_VOICE_CHANNEL_ID no definido: /enqueue no podrá conectar");
        }

        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = http::serve(addr, state, token).await {
                error!("❌ Error en la API HTTP: {:?}", e);
            }
        });
    }

    // Manejar shutdown graceful
    let shard_manager = client.shard_manager.clone();
    let shutdown_manager = Arc::clone(&manager);
    let token = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Error al registrar Ctrl+C");
        info!("⚠️ Señal de shutdown recibida, cerrando...");

        // primero las salas: matan sus procesos y salen de voz
        shutdown_manager.shutdown().await;
        token.cancel();
        shard_manager.shutdown_all().await;
    });

    // Iniciar bot
    info!("🚀 Bot iniciado exitosamente");
    if let Err(why) = client.start().await {
        error!("Error al ejecutar cliente: {:?}", why);
    }

    shutdown.cancel();
    info!("👋 Open Jukebox detenido");
    Ok(())
}

async fn health_check(supervisor: &ProcessSupervisor, tools: &YtDlpTools) -> Result<()> {
    // Verificar dependencias críticas
    let ytdlp = supervisor.warm(&tools.ytdlp_version).await?;
    let ffmpeg = supervisor.warm(&tools.ffmpeg_version).await?;

    if ytdlp && ffmpeg {
        println!("OK");
        Ok(())
    } else {
        anyhow::bail!("Dependencias faltantes");
    }
}
