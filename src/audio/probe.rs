//! Container/codec sniffing for the zero-transcode path.
//!
//! Songbird decodes Opus itself, so a stream that is already Opus inside Ogg
//! or WebM can be handed over untouched. The probe reads only as much of the
//! head as it needs to decide, and hands those bytes back so nothing is lost.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::ProbeError;

/// Cantidad máxima de bytes inspeccionados antes de rendirse.
pub const PROBE_LIMIT: usize = 64 * 1024;

const OGG_MAGIC: &[u8] = b"OggS";
const EBML_MAGIC: &[u8] = &[0x1A, 0x45, 0xDF, 0xA3];
const OPUS_HEAD: &[u8] = b"OpusHead";
const MATROSKA_OPUS: &[u8] = b"A_OPUS";
/// La primera página Ogg (cabecera + tabla de segmentos + OpusHead) cabe aquí.
const OGG_FIRST_PAGE_WINDOW: usize = 27 + 255 + 8;

/// Contenedor/códec reconocido como reproducible sin transcodificar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCodec {
    OggOpus,
    WebmOpus,
}

impl StreamCodec {
    /// Extensión usada como pista para el demuxer.
    pub fn extension(&self) -> &'static str {
        match self {
            StreamCodec::OggOpus => "ogg",
            StreamCodec::WebmOpus => "webm",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            StreamCodec::OggOpus => "audio/ogg",
            StreamCodec::WebmOpus => "audio/webm",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Compatible(StreamCodec),
    Incompatible,
    NeedMore,
}

/// Cabeza del stream ya leída junto con el códec identificado.
#[derive(Debug)]
pub struct ProbedHead {
    pub codec: StreamCodec,
    pub head: Bytes,
}

/// Lee de `reader` hasta poder identificar el códec.
///
/// No impone tiempo límite; quien llama lo envuelve en `tokio::time::timeout`.
pub async fn probe<R>(reader: &mut R) -> Result<ProbedHead, ProbeError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        match identify(&buf) {
            Verdict::Compatible(codec) => {
                return Ok(ProbedHead {
                    codec,
                    head: buf.freeze(),
                })
            }
            Verdict::Incompatible => return Err(ProbeError::Incompatible),
            Verdict::NeedMore if buf.len() >= PROBE_LIMIT => return Err(ProbeError::Incompatible),
            Verdict::NeedMore => {}
        }

        let read = reader.read_buf(&mut buf).await?;
        if read == 0 {
            return Err(ProbeError::EndOfStream(buf.len()));
        }
    }
}

fn identify(buf: &[u8]) -> Verdict {
    if buf.len() < 4 {
        return if OGG_MAGIC.starts_with(buf) || EBML_MAGIC.starts_with(buf) {
            Verdict::NeedMore
        } else {
            Verdict::Incompatible
        };
    }

    if buf.starts_with(OGG_MAGIC) {
        if contains(buf, OPUS_HEAD) {
            return Verdict::Compatible(StreamCodec::OggOpus);
        }
        // Vorbis, FLAC u otro códec dentro de Ogg
        return if buf.len() >= OGG_FIRST_PAGE_WINDOW {
            Verdict::Incompatible
        } else {
            Verdict::NeedMore
        };
    }

    if buf.starts_with(EBML_MAGIC) {
        if contains(buf, MATROSKA_OPUS) {
            return Verdict::Compatible(StreamCodec::WebmOpus);
        }
        if contains(buf, b"A_VORBIS") || contains(buf, b"A_AAC") || contains(buf, b"A_MPEG") {
            return Verdict::Incompatible;
        }
        return Verdict::NeedMore;
    }

    Verdict::Incompatible
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}
