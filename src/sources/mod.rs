//! # Sources Module
//!
//! Turns what a user typed into a [`Track`].
//!
//! - [`reference`]: parses and canonicalizes URLs and search queries so that
//!   equivalent inputs share one cache key.
//! - [`ytdlp`]: the `yt-dlp`/`ffmpeg` command templates and the `yt-dlp`
//!   backed [`MetadataSource`].
//! - [`TrackLookup`]: metadata resolution through the shared
//!   [`MetadataCache`](crate::cache::MetadataCache).

pub mod reference;
pub mod ytdlp;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serenity::model::id::UserId;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info};

use crate::{
    cache::{MetadataCache, TrackMetadata},
    error::{PlaybackError, ResolutionError},
};

pub use reference::TrackReference;
pub use ytdlp::{YtDlpMetadataSource, YtDlpTools};

/// Fuente de metadata para una referencia ya normalizada.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn lookup(&self, reference: &TrackReference) -> Result<TrackMetadata, ResolutionError>;

    /// Nombre de la fuente
    fn source_name(&self) -> &'static str;
}

/// Track pedido por un usuario. Inmutable una vez creado.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Track {
    id: String,
    title: String,
    url: String,
    duration_label: String,
    requested_by: UserId,
    requested_at: DateTime<Utc>,
    thumbnails: Vec<String>,
}

impl Track {
    pub fn from_metadata(metadata: TrackMetadata, requested_by: UserId) -> Self {
        let thumbnails = if reference::is_youtube_id(&metadata.id) {
            ["maxresdefault", "hqdefault", "mqdefault"]
                .iter()
                .map(|size| format!("https://i.ytimg.com/vi/{}/{}.jpg", metadata.id, size))
                .collect()
        } else {
            Vec::new()
        };

        Self {
            id: metadata.id,
            title: metadata.title,
            url: metadata.url,
            duration_label: metadata.duration_label,
            requested_by,
            requested_at: Utc::now(),
            thumbnails,
        }
    }

    // Getters
    pub fn id(&self) -> &str {
        &self.id
    }
    pub fn title(&self) -> &str {
        &self.title
    }
    pub fn url(&self) -> &str {
        &self.url
    }
    pub fn duration_label(&self) -> &str {
        &self.duration_label
    }
    pub fn requested_by(&self) -> UserId {
        self.requested_by
    }
    pub fn requested_at(&self) -> DateTime<Utc> {
        self.requested_at
    }
    pub fn thumbnail(&self) -> Option<&str> {
        self.thumbnails.first().map(String::as_str)
    }
    pub fn thumbnails(&self) -> &[String] {
        &self.thumbnails
    }

    /// Referencia que reciben las plantillas de streaming.
    pub fn stream_reference(&self) -> &str {
        &self.url
    }
}

/// Resuelve entradas de usuario a [`Track`]s pasando por el cache.
pub struct TrackLookup {
    cache: MetadataCache,
    source: Arc<dyn MetadataSource>,
    ttl: Duration,
}

impl TrackLookup {
    pub fn new(cache: MetadataCache, source: Arc<dyn MetadataSource>, ttl: Duration) -> Self {
        Self { cache, source, ttl }
    }

    pub fn cache(&self) -> &MetadataCache {
        &self.cache
    }

    pub async fn resolve(&self, raw: &str, requested_by: UserId) -> Result<Track, PlaybackError> {
        let reference = TrackReference::parse(raw)?;
        let key = reference.canonical_key();
        let source = Arc::clone(&self.source);
        debug!("🔍 Buscando {} en {}", key, source.source_name());

        let metadata = self
            .cache
            .get_or_fetch(&key, self.ttl, move || async move {
                source.lookup(&reference).await
            })
            .await?;

        info!("🎵 Resuelto: {} ({})", metadata.title, metadata.duration_label);
        Ok(Track::from_metadata(metadata, requested_by))
    }
}
