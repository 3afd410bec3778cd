use anyhow::Result;
use serenity::{
    builder::{CreateEmbed, CreateInteractionResponse, CreateInteractionResponseMessage, EditInteractionResponse},
    model::{
        application::CommandInteraction,
        id::{ChannelId, GuildId, UserId},
    },
    prelude::Context,
};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::{
    audio::{PlaybackManager, Requester},
    error::PlaybackError,
    ui::embeds,
};

/// Maneja comandos slash
pub async fn handle_command(
    ctx: &Context,
    command: CommandInteraction,
    manager: Arc<PlaybackManager>,
) -> Result<()> {
    let Some(guild_id) = command.guild_id else {
        let embed = embeds::error_embed(
            "Solo en servidores",
            "Este comando solo funciona dentro de un servidor",
        );
        return reply(ctx, &command, embed, true).await;
    };

    info!(
        "📝 Comando /{} usado por {} en guild {}",
        command.data.name, command.user.name, guild_id
    );

    match command.data.name.as_str() {
        "play" => handle_enqueue(ctx, &command, &manager, guild_id, false).await,
        "playnext" => handle_enqueue(ctx, &command, &manager, guild_id, true).await,
        "pause" => {
            let outcome = manager.pause(guild_id).await;
            respond(ctx, &command, guild_id, outcome, "⏸️ Pausado", "Reproducción pausada").await
        }
        "resume" => {
            let outcome = manager.resume(guild_id).await;
            respond(ctx, &command, guild_id, outcome, "▶️ Reanudado", "Reproducción reanudada").await
        }
        "skip" => {
            let outcome = manager.skip(guild_id).await;
            respond(ctx, &command, guild_id, outcome, "⏭️ Saltado", "Pasando a la siguiente canción").await
        }
        "stop" => {
            let outcome = manager.stop(guild_id).await;
            respond(ctx, &command, guild_id, outcome, "⏹️ Detenido", "Reproducción detenida y cola limpiada").await
        }
        "leave" => {
            let outcome = manager.leave(guild_id).await;
            respond(ctx, &command, guild_id, outcome, "👋 Desconectado", "Salí del canal de voz").await
        }
        "queue" => {
            let snapshot = manager.snapshot(guild_id).await;
            reply(ctx, &command, embeds::queue_embed(&snapshot), false).await
        }
        _ => {
            command
                .create_response(
                    &ctx.http,
                    CreateInteractionResponse::Message(
                        CreateInteractionResponseMessage::new()
                            .content("❌ Comando no reconocido")
                            .ephemeral(true),
                    ),
                )
                .await?;
            Ok(())
        }
    }
}

// Handlers específicos para cada comando

async fn handle_enqueue(
    ctx: &Context,
    command: &CommandInteraction,
    manager: &PlaybackManager,
    guild_id: GuildId,
    at_front: bool,
) -> Result<()> {
    let query = command
        .data
        .options
        .iter()
        .find(|opt| opt.name == "query")
        .and_then(|opt| opt.value.as_str())
        .unwrap_or_default()
        .to_string();

    // Defer la respuesta ya que la búsqueda puede tomar tiempo
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new()),
        )
        .await?;

    let requester = Requester {
        user_id: command.user.id,
        voice_channel: user_voice_channel(ctx, guild_id, command.user.id),
        text_channel: Some(command.channel_id),
    };

    let embed = match manager.enqueue(guild_id, &query, requester, at_front).await {
        Ok(track) => embeds::track_queued_embed(&track, at_front),
        Err(e) => failure_embed(guild_id, &e),
    };

    command
        .edit_response(&ctx.http, EditInteractionResponse::new().embed(embed))
        .await?;

    Ok(())
}

async fn respond(
    ctx: &Context,
    command: &CommandInteraction,
    guild_id: GuildId,
    outcome: Result<(), PlaybackError>,
    title: &str,
    description: &str,
) -> Result<()> {
    match outcome {
        Ok(()) => reply(ctx, command, embeds::success_embed(title, description), false).await,
        Err(e) => reply(ctx, command, failure_embed(guild_id, &e), true).await,
    }
}

async fn reply(
    ctx: &Context,
    command: &CommandInteraction,
    embed: CreateEmbed,
    ephemeral: bool,
) -> Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .embed(embed)
                    .ephemeral(ephemeral),
            ),
        )
        .await?;
    Ok(())
}

fn failure_embed(guild_id: GuildId, err: &PlaybackError) -> CreateEmbed {
    if err.is_user_error() {
        warn!("⚠️ Comando rechazado en guild {}: {}", guild_id, err);
        embeds::warning_embed("No se pudo completar", &user_message(err))
    } else if let PlaybackError::Resolution(e) = err {
        warn!("❌ No se pudo resolver la canción en guild {}: {}", guild_id, e);
        embeds::error_embed("No se pudo obtener la canción", &format!("`{}`", e))
    } else {
        error!("❌ Error en guild {}: {}", guild_id, err);
        embeds::error_embed("Error interno", &format!("`{}`", err))
    }
}

fn user_message(err: &PlaybackError) -> String {
    match err {
        PlaybackError::NotInVoiceChannel => "Debes estar en un canal de voz".to_string(),
        PlaybackError::NothingPlaying => "No hay nada reproduciéndose actualmente".to_string(),
        PlaybackError::NotPaused => "La reproducción no está en pausa".to_string(),
        PlaybackError::AlreadyPaused => "La reproducción ya está en pausa".to_string(),
        PlaybackError::NotConnected => "No estoy conectado a un canal de voz".to_string(),
        PlaybackError::QueueFull(max) => format!("La cola está llena ({} canciones)", max),
        PlaybackError::EmptyQuery => "Escribe una URL o algo para buscar".to_string(),
        other => other.to_string(),
    }
}

// Funciones auxiliares

fn user_voice_channel(ctx: &Context, guild_id: GuildId, user_id: UserId) -> Option<ChannelId> {
    let guild = guild_id.to_guild_cached(&ctx.cache)?;
    guild
        .voice_states
        .get(&user_id)
        .and_then(|voice_state| voice_state.channel_id)
}
