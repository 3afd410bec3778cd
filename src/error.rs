//! # Error taxonomy
//!
//! Errors are split by who has to react to them:
//!
//! - [`ResolutionError`]: the extraction/transcoding tools could not produce
//!   metadata or audio. Surfaced to the command layer, never cached.
//! - [`ProbeError`]: the fast path produced something we cannot play as-is.
//!   Internal, it only triggers the transcoding fallback.
//! - [`VoiceError`]: the voice transport refused or failed an operation.
//! - [`PlaybackError`]: everything a command can get back from the engine.

use thiserror::Error;

/// Fallo al resolver metadata o audio de una referencia.
///
/// Es `Clone` porque un mismo fallo se entrega a todos los que esperaban
/// la misma búsqueda deduplicada.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("{tool} no está disponible: {reason}")]
    ToolUnavailable { tool: String, reason: String },

    #[error("{tool} terminó con código {code:?}: {stderr}")]
    ToolFailed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{tool} no produjo salida")]
    EmptyOutput { tool: String },

    #[error("{tool} no respondió a tiempo")]
    Timeout { tool: String },

    #[error("salida inesperada: {0}")]
    MalformedOutput(String),

    #[error("el intento de resolución fue reemplazado")]
    Superseded,

    #[error("la tarea de resolución se abortó: {0}")]
    Aborted(String),
}

/// Fallo del sondeo de la etapa rápida.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("códec incompatible")]
    Incompatible,

    #[error("el stream terminó antes de identificar el códec ({0} bytes)")]
    EndOfStream(usize),

    #[error("tiempo de sondeo agotado")]
    TimedOut,

    #[error("error de lectura: {0}")]
    Io(#[from] std::io::Error),
}

/// Errores del transporte de voz.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VoiceError {
    #[error("ya estoy conectado a otro canal de voz")]
    AlreadyConnectedElsewhere,

    #[error("el canal de voz no existe")]
    ChannelNotFound,

    #[error("no hay conexión de voz activa")]
    NotInChannel,

    #[error("error del transporte de voz: {0}")]
    Transport(String),
}

/// Errores devueltos por las operaciones del motor de reproducción.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlaybackError {
    #[error("debes estar en un canal de voz")]
    NotInVoiceChannel,

    #[error("no hay nada reproduciéndose")]
    NothingPlaying,

    #[error("la reproducción no está pausada")]
    NotPaused,

    #[error("la reproducción ya está pausada")]
    AlreadyPaused,

    #[error("no estoy conectado en este servidor")]
    NotConnected,

    #[error("la cola está llena (máximo {0} canciones)")]
    QueueFull(usize),

    #[error("la búsqueda está vacía")]
    EmptyQuery,

    #[error(transparent)]
    Voice(#[from] VoiceError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("la sala se cerró mientras se procesaba el comando")]
    RoomClosed,
}

impl PlaybackError {
    /// `true` para errores causados por el estado actual o por el usuario
    /// (comando inválido), en contraposición a fallos de herramientas.
    pub fn is_user_error(&self) -> bool {
        !matches!(
            self,
            PlaybackError::Resolution(_)
                | PlaybackError::RoomClosed
                | PlaybackError::Voice(VoiceError::Transport(_))
        )
    }
}
