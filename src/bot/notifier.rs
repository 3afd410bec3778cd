use serenity::{builder::CreateMessage, http::Http};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{
    audio::{PlaybackNotifier, RoomContext},
    error::PlaybackError,
    sources::Track,
    ui::embeds,
};

/// Anuncia los cambios de reproducción en el canal de texto de la sala.
///
/// Cada mensaje sale en su propia tarea; la sala nunca espera a Discord.
pub struct DiscordNotifier {
    http: Arc<Http>,
}

impl DiscordNotifier {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }

    fn send(&self, room: &RoomContext, message: CreateMessage) {
        let Some(channel) = room.text_channel else {
            debug!("🔕 Sala de guild {} sin canal de texto, aviso omitido", room.guild_id);
            return;
        };

        let http = Arc::clone(&self.http);
        tokio::spawn(async move {
            if let Err(e) = channel.send_message(http.as_ref(), message).await {
                warn!("⚠️ No se pudo enviar aviso al canal {}: {}", channel, e);
            }
        });
    }
}

impl PlaybackNotifier for DiscordNotifier {
    fn track_started(&self, room: &RoomContext, track: &Track) {
        self.send(room, CreateMessage::new().embed(embeds::now_playing_embed(track)));
    }

    fn track_queued(&self, room: &RoomContext, track: &Track, as_next: bool) {
        // la respuesta del comando ya muestra el embed de "agregada"
        debug!(
            "📥 {} en cola de guild {} (siguiente: {})",
            track.title(),
            room.guild_id,
            as_next
        );
    }

    fn track_failed(&self, room: &RoomContext, track: &Track, error: &PlaybackError) {
        self.send(
            room,
            CreateMessage::new().embed(embeds::track_failed_embed(track, error)),
        );
    }
}
