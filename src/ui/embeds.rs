use serenity::{
    all::Timestamp,
    builder::{CreateEmbed, CreateEmbedFooter},
};

use crate::{
    audio::player::{PlaybackStatus, RoomSnapshot},
    error::PlaybackError,
    sources::Track,
};

/// Paleta de colores estandarizada para el bot
pub mod colors {
    use serenity::all::Colour;

    pub const SUCCESS_GREEN: Colour = Colour::from_rgb(67, 181, 129);
    pub const ERROR_RED: Colour = Colour::from_rgb(220, 53, 69);
    pub const WARNING_ORANGE: Colour = Colour::from_rgb(255, 193, 7);
    pub const INFO_BLUE: Colour = Colour::from_rgb(52, 144, 220);
    pub const MUSIC_PURPLE: Colour = Colour::from_rgb(138, 43, 226);
    pub const NEUTRAL_GRAY: Colour = Colour::from_rgb(108, 117, 125);
}

/// Footer estandarizado para todos los embeds
const STANDARD_FOOTER: &str = "🎵 Open Jukebox";

/// Crea un embed para mostrar la canción actual
pub fn now_playing_embed(track: &Track) -> CreateEmbed {
    track_embed(track)
        .title("🎵 Reproduciendo Ahora")
        .color(colors::SUCCESS_GREEN)
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

/// Crea un embed para mostrar que se agregó una canción
pub fn track_queued_embed(track: &Track, as_next: bool) -> CreateEmbed {
    let (title, footer) = if as_next {
        ("⏭️ Sonará a Continuación", "🎵 Se reproducirá después de la canción actual")
    } else {
        ("✅ Canción Agregada", "🎵 Se reproducirá automáticamente cuando le toque")
    };

    track_embed(track)
        .title(title)
        .color(colors::MUSIC_PURPLE)
        .footer(CreateEmbedFooter::new(footer))
}

/// Crea un embed para una canción que no se pudo reproducir
pub fn track_failed_embed(track: &Track, error: &PlaybackError) -> CreateEmbed {
    CreateEmbed::default()
        .title("❌ No se pudo reproducir")
        .description(format!("**{}**\n\n`{}`", track.title(), truncate(&error.to_string(), 300)))
        .url(track.url())
        .color(colors::ERROR_RED)
        .footer(CreateEmbedFooter::new("⏭️ Pasando a la siguiente canción"))
        .timestamp(Timestamp::now())
}

/// Crea un embed para mostrar la cola de reproducción
pub fn queue_embed(snapshot: &RoomSnapshot) -> CreateEmbed {
    let mut embed = CreateEmbed::default()
        .title("📋 Cola de Reproducción")
        .color(colors::INFO_BLUE);

    let Some(current) = &snapshot.now_playing else {
        return embed
            .description("😴 **No hay nada sonando**\n\n💡 Usa `/play <canción>` para agregar música")
            .color(colors::NEUTRAL_GRAY)
            .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
            .timestamp(Timestamp::now());
    };

    let status = match snapshot.status {
        PlaybackStatus::Paused => "⏸️ En pausa",
        _ => "▶️ Reproduciendo",
    };
    embed = embed.field(
        status,
        format!("**{}** `[{}]`", current.title(), current.duration_label()),
        false,
    );

    if !snapshot.upcoming.is_empty() {
        let description = snapshot
            .upcoming
            .iter()
            .enumerate()
            .map(|(i, track)| {
                format!(
                    "**{}**. {} `[{}]`",
                    i + 1,
                    truncate(track.title(), 80),
                    track.duration_label()
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        embed = embed.field("Próximas canciones", description, false);
    }

    let hidden = snapshot.queued.saturating_sub(snapshot.upcoming.len());
    let mut info = format!("**Total en cola:** {} canciones", snapshot.queued);
    if hidden > 0 {
        info.push_str(&format!(" • y {} más", hidden));
    }

    embed
        .field("Información", info, false)
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
        .timestamp(Timestamp::now())
}

/// Crea un embed de error
pub fn error_embed(title: &str, description: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title(format!("❌ {}", title))
        .description(description)
        .color(colors::ERROR_RED)
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

/// Crea un embed de advertencia
pub fn warning_embed(title: &str, description: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title(format!("⚠️ {}", title))
        .description(description)
        .color(colors::WARNING_ORANGE)
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

/// Crea un embed de éxito
pub fn success_embed(title: &str, description: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title(format!("✅ {}", title))
        .description(description)
        .color(colors::SUCCESS_GREEN)
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

/// Campos comunes de un track
fn track_embed(track: &Track) -> CreateEmbed {
    let duration = match track.duration_label() {
        "LIVE" => "🔴 En vivo".to_string(),
        label => label.to_string(),
    };

    let mut embed = CreateEmbed::default()
        .description(format!("**{}**", track.title()))
        .field("⏱️ Duración", duration, true)
        .field("👤 Solicitado por", format!("<@{}>", track.requested_by()), true)
        .url(track.url())
        .timestamp(Timestamp::now());

    if let Some(thumbnail) = track.thumbnail() {
        embed = embed.thumbnail(thumbnail);
    }

    embed
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    cut.push('…');
    cut
}
