//! # Bot Module
//!
//! Discord front end for Open Jukebox.
//!
//! This module contains the Discord-facing logic:
//! - Slash command registration and dispatch ([`commands`], [`handlers`])
//! - Playback announcements in text channels ([`notifier`])
//! - Event handling (ready, interactions, voice state updates)
//! - Background maintenance of the metadata cache
//!
//! ## Architecture
//!
//! [`JukeboxBot`] implements Serenity's [`EventHandler`]. It owns no playback
//! state: every command is forwarded to the [`PlaybackManager`] stored in the
//! client's shared data, which routes it to the room of the guild.
//!
//! ## Example
//!
//! ```rust,no_run
//! use open_jukebox::bot::JukeboxBot;
//! use open_jukebox::config::Config;
//!
//! let config = Config::load()?;
//! let bot = JukeboxBot::new(config);
//! # Ok::<(), anyhow::Error>(())
//! ```

use anyhow::Result;
use serenity::{
    all::{Context, EventHandler, GuildId, Interaction, Ready, VoiceState},
    async_trait,
    prelude::TypeMapKey,
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, error, info, warn};

pub mod commands;
pub mod handlers;
pub mod notifier;

pub use notifier::DiscordNotifier;

use crate::{audio::PlaybackManager, config::Config, error::PlaybackError};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3600);

impl TypeMapKey for PlaybackManager {
    type Value = Arc<PlaybackManager>;
}

/// Main Discord event handler.
pub struct JukeboxBot {
    config: Arc<Config>,
    /// `ready` se repite en cada reconexión
    maintenance_started: AtomicBool,
}

impl JukeboxBot {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            maintenance_started: AtomicBool::new(false),
        }
    }

    /// Registers slash commands with Discord.
    ///
    /// Commands go to a single guild when `GUILD_ID` is set (propagates in
    /// about a second) and globally otherwise (up to an hour).
    async fn register_commands(&self, ctx: &Context) -> Result<()> {
        info!("📝 Registrando comandos slash...");
        info!("🔧 Application ID: {}", self.config.application_id);

        // Registrar comandos globales o por guild según configuración
        match self.config.guild_id {
            Some(guild_id) => {
                info!("🏠 Registrando comandos para guild específica: {}", guild_id);
                let guild_id = GuildId::new(guild_id);

                // Verificar que el bot esté en la guild
                if !ctx.cache.guilds().contains(&guild_id) {
                    warn!("⚠️ El bot no está en la guild especificada: {}", guild_id);
                    return Ok(());
                }

                commands::register_guild_commands(ctx, guild_id).await
                    .map_err(|e| {
                        error!("❌ Error registrando comandos de guild: {:?}", e);
                        anyhow::anyhow!("No se pudieron registrar comandos de guild. Verifica que el bot tenga permisos de 'applications.commands' en la guild.")
                    })?;
                info!("✅ Comandos de guild registrados para: {}", guild_id);
            }
            None => {
                info!("🌐 Registrando comandos globalmente");
                commands::register_global_commands(ctx).await
                    .map_err(|e| {
                        error!("❌ Error registrando comandos globales: {:?}", e);
                        anyhow::anyhow!("No se pudieron registrar comandos globales. Verifica que el bot tenga permisos de 'applications.commands'.")
                    })?;
                info!("✅ Comandos globales registrados");
            }
        }

        Ok(())
    }
}

/// Obtiene el manager compartido desde los datos del cliente.
pub async fn playback_manager(ctx: &Context) -> Option<Arc<PlaybackManager>> {
    let data = ctx.data.read().await;
    data.get::<PlaybackManager>().cloned()
}

#[async_trait]
impl EventHandler for JukeboxBot {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("🤖 {} está en línea!", ready.user.name);
        info!("📊 Conectado a {} servidores", ready.guilds.len());

        if let Err(e) = self.register_commands(&ctx).await {
            error!("Error al registrar comandos: {:?}", e);
        }

        if self.maintenance_started.swap(true, Ordering::SeqCst) {
            return;
        }

        // Iniciar tareas de mantenimiento
        match playback_manager(&ctx).await {
            Some(manager) => {
                tokio::spawn(maintenance_tasks(manager));
            }
            None => warn!("⚠️ PlaybackManager no registrado, sin mantenimiento de caché"),
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        let Interaction::Command(command) = interaction else {
            return;
        };

        let Some(manager) = playback_manager(&ctx).await else {
            error!("❌ PlaybackManager no registrado, comando /{} ignorado", command.data.name);
            return;
        };

        if let Err(e) = handlers::handle_command(&ctx, command, manager).await {
            error!("Error manejando comando: {:?}", e);
        }
    }

    /// Cleans up the room when the bot is disconnected from voice by someone
    /// else.
    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let current_user_id = ctx.cache.current_user().id;
        if new.user_id != current_user_id || old.is_none() || new.channel_id.is_some() {
            return;
        }
        let Some(guild_id) = new.guild_id else {
            return;
        };

        info!("🔌 Bot desconectado en guild {}", guild_id);
        let Some(manager) = playback_manager(&ctx).await else {
            return;
        };

        // NotConnected: la sala ya se había cerrado con /leave
        match manager.leave(guild_id).await {
            Ok(()) | Err(PlaybackError::NotConnected) => {}
            Err(e) => error!("Error al cerrar la sala de guild {}: {:?}", guild_id, e),
        }
    }
}

/// Periodic housekeeping: drops expired metadata entries every hour.
async fn maintenance_tasks(manager: Arc<PlaybackManager>) {
    let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
    // el primer tick es inmediato
    interval.tick().await;

    loop {
        interval.tick().await;

        manager.services().lookup.cache().cleanup_old_entries();
        debug!("🏠 Salas activas: {}", manager.active_rooms());

        info!("🧹 Tareas de mantenimiento completadas");
    }
}
