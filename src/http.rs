//! HTTP status/control surface.
//!
//! A thin JSON layer over [`PlaybackManager`] for one configured guild. It
//! runs next to the Discord client when `HTTP_BIND` is set and calls exactly
//! the same operations the slash commands do.

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::{net::SocketAddr, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    audio::{PlaybackManager, Requester},
    error::{PlaybackError, VoiceError},
};

/// Estado compartido por todas las rutas.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<PlaybackManager>,
    pub guild_id: GuildId,
    /// Canal al que se conecta el bot cuando se encola por HTTP
    pub voice_channel: Option<ChannelId>,
    /// Usuario que figura como solicitante de lo encolado por HTTP
    pub requester: UserId,
}

impl AppState {
    fn requester(&self) -> Requester {
        Requester {
            user_id: self.requester,
            voice_channel: self.voice_channel,
            text_channel: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub query: String,
    #[serde(default)]
    pub next: bool,
}

/// Error de la API: código HTTP más cuerpo `{"error": ...}`.
#[derive(Debug)]
pub struct ApiError(PlaybackError);

impl From<PlaybackError> for ApiError {
    fn from(err: PlaybackError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            PlaybackError::EmptyQuery => StatusCode::BAD_REQUEST,
            PlaybackError::Resolution(_) | PlaybackError::Voice(VoiceError::Transport(_)) => {
                StatusCode::BAD_GATEWAY
            }
            PlaybackError::RoomClosed => StatusCode::SERVICE_UNAVAILABLE,
            err if err.is_user_error() => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!("⚠️ HTTP {}: {}", status.as_u16(), self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Creates the router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/enqueue", post(enqueue))
        .route("/skip", post(skip))
        .route("/stop", post(stop))
        .route("/pause", post(pause))
        .route("/resume", post(resume))
        .route("/leave", post(leave))
        .with_state(state)
}

/// Sirve la API hasta que se cancele `shutdown`.
pub async fn serve(addr: SocketAddr, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("🌐 API HTTP escuchando en {}", listener.local_addr()?);

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("🌐 API HTTP detenida");
    Ok(())
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.manager.snapshot(state.guild_id).await)
}

async fn enqueue(
    State(state): State<AppState>,
    Json(request): Json<EnqueueRequest>,
) -> ApiResult<impl IntoResponse> {
    let track = state
        .manager
        .enqueue(state.guild_id, &request.query, state.requester(), request.next)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(track)))
}

async fn skip(State(state): State<AppState>) -> ApiResult<StatusCode> {
    state.manager.skip(state.guild_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stop(State(state): State<AppState>) -> ApiResult<StatusCode> {
    state.manager.stop(state.guild_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn pause(State(state): State<AppState>) -> ApiResult<StatusCode> {
    state.manager.pause(state.guild_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn resume(State(state): State<AppState>) -> ApiResult<StatusCode> {
    state.manager.resume(state.guild_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn leave(State(state): State<AppState>) -> ApiResult<StatusCode> {
    state.manager.leave(state.guild_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
