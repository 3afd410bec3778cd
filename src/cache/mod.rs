//! # Cache Module
//!
//! Metadata cache for track lookups.
//!
//! Looking up a title through `yt-dlp` costs one external process and a
//! network round trip, so every lookup goes through a [`MetadataCache`]:
//!
//! - **TTL**: resolved entries expire after `METADATA_TTL` and are reclaimed
//!   lazily on read (plus an hourly [`MetadataCache::cleanup_old_entries`]).
//! - **Dedup**: concurrent lookups for the same canonical reference share a
//!   single in-flight future instead of spawning duplicate processes.
//! - **No negative caching**: a failed lookup removes its entry so the next
//!   request retries immediately.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use open_jukebox::cache::{MetadataCache, TrackMetadata};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), open_jukebox::error::ResolutionError> {
//! let cache = MetadataCache::new();
//!
//! let meta = cache
//!     .get_or_fetch("https://www.youtube.com/watch?v=dQw4w9WgXcQ", Duration::from_secs(1800), || async {
//!         Ok(TrackMetadata {
//!             id: "dQw4w9WgXcQ".into(),
//!             title: "Example Song".into(),
//!             url: "https://www.youtube.com/watch?v=dQw4w9WgXcQ".into(),
//!             duration_label: "3:33".into(),
//!         })
//!     })
//!     .await?;
//! println!("{}", meta.title);
//! # Ok(())
//! # }
//! ```

pub mod ttl_cache;

pub use ttl_cache::{CacheLookup, SharedLookup, TtlCache};

use serde::{Deserialize, Serialize};
use tracing::info;

/// Cache de metadata indexado por referencia canónica.
pub type MetadataCache = TtlCache<TrackMetadata>;

/// Metadata resuelta de una referencia, tal como la imprime el extractor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackMetadata {
    /// Identificador en la fuente (video ID para YouTube)
    pub id: String,
    pub title: String,
    /// URL canónica de la página del track
    pub url: String,
    /// Duración legible ("3:33", "1:02:10", "LIVE")
    pub duration_label: String,
}

impl MetadataCache {
    /// Removes expired entries; meant to be called from a background task.
    pub fn cleanup_old_entries(&self) {
        let removed = self.purge_expired();
        if removed > 0 {
            info!("🧹 Cache cleanup: removed {} expired entries", removed);
        }
    }
}
