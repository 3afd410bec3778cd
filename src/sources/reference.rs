use regex::Regex;
use std::sync::LazyLock;
use url::Url;

use crate::error::PlaybackError;

static VIDEO_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]{11}$").expect("regex de video ID válida")
});

const YOUTUBE_HOSTS: &[&str] = &[
    "youtube.com",
    "www.youtube.com",
    "m.youtube.com",
    "music.youtube.com",
];

/// Lo que el usuario pidió, ya normalizado: una URL o una búsqueda de texto.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackReference {
    Url(Url),
    Search(String),
}

impl TrackReference {
    /// Interpreta la entrada cruda de un comando.
    ///
    /// Acepta URLs envueltas en `<...>` (como las deja Discord para evitar
    /// previews). Todo lo que no sea una URL http(s) se trata como búsqueda.
    pub fn parse(raw: &str) -> Result<Self, PlaybackError> {
        let trimmed = raw.trim();
        let trimmed = trimmed
            .strip_prefix('<')
            .and_then(|s| s.strip_suffix('>'))
            .unwrap_or(trimmed)
            .trim();

        if trimmed.is_empty() {
            return Err(PlaybackError::EmptyQuery);
        }

        match Url::parse(trimmed) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(Self::Url(canonicalize(url))),
            _ => Ok(Self::Search(
                trimmed.split_whitespace().collect::<Vec<_>>().join(" "),
            )),
        }
    }

    /// Clave de cache: formas equivalentes de la misma referencia comparten clave.
    pub fn canonical_key(&self) -> String {
        match self {
            Self::Url(url) => url.to_string(),
            Self::Search(query) => format!("ytsearch1:{}", query.to_lowercase()),
        }
    }

    /// Argumento que se le pasa al extractor.
    pub fn argument(&self) -> String {
        match self {
            Self::Url(url) => url.to_string(),
            Self::Search(query) => format!("ytsearch1:{}", query),
        }
    }

    pub fn is_search(&self) -> bool {
        matches!(self, Self::Search(_))
    }
}

/// URL de la página de un video de YouTube.
pub fn youtube_watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={}", video_id)
}

/// `true` si `id` tiene forma de video ID de YouTube.
pub fn is_youtube_id(id: &str) -> bool {
    VIDEO_ID.is_match(id)
}

fn canonicalize(mut url: Url) -> Url {
    if let Some(id) = youtube_video_id(&url) {
        if let Ok(canonical) = Url::parse(&youtube_watch_url(&id)) {
            return canonical;
        }
    }

    url.set_fragment(None);
    url
}

fn youtube_video_id(url: &Url) -> Option<String> {
    let host = url.host_str()?;

    let candidate = if host == "youtu.be" {
        url.path_segments()?.next().map(str::to_string)
    } else if YOUTUBE_HOSTS.contains(&host) {
        let mut segments = url.path_segments()?;
        match segments.next() {
            Some("watch") => url
                .query_pairs()
                .find(|(key, _)| key == "v")
                .map(|(_, value)| value.into_owned()),
            Some("shorts" | "embed" | "live") => segments.next().map(str::to_string),
            _ => None,
        }
    } else {
        None
    }?;

    is_youtube_id(&candidate).then_some(candidate)
}
