// pgvault/src/backup/compression.rs
//! Compression Stage: a streaming encoder between the exporter and the writer.

use async_stream::try_stream;
use bzip2::write::BzEncoder;
use flate2::write::GzEncoder;
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

use crate::errors::BackupError;
use crate::source::ByteStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionKind {
    None,
    #[default]
    Gzip,
    Bzip2,
}

impl CompressionKind {
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            CompressionKind::None => None,
            CompressionKind::Gzip => Some("gz"),
            CompressionKind::Bzip2 => Some("bz2"),
        }
    }
}

impl std::str::FromStr for CompressionKind {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(CompressionKind::None),
            "gzip" | "gz" => Ok(CompressionKind::Gzip),
            "bzip2" | "bz2" => Ok(CompressionKind::Bzip2),
            other => Err(BackupError::Config(format!("unknown compression '{}'", other))),
        }
    }
}

/// Incremental encoder writing into an in-memory buffer that is drained after
/// every input chunk, so only the encoder's own window is retained.
enum Encoder {
    Gzip(GzEncoder<Vec<u8>>),
    Bzip2(BzEncoder<Vec<u8>>),
}

impl Encoder {
    fn new(kind: CompressionKind, level: Option<u32>) -> Option<Self> {
        match kind {
            CompressionKind::None => None,
            CompressionKind::Gzip => {
                let level = level
                    .map(|l| flate2::Compression::new(l.min(9)))
                    .unwrap_or_default();
                Some(Encoder::Gzip(GzEncoder::new(Vec::new(), level)))
            }
            CompressionKind::Bzip2 => {
                let level = level
                    .map(|l| bzip2::Compression::new(l.clamp(1, 9)))
                    .unwrap_or_default();
                Some(Encoder::Bzip2(BzEncoder::new(Vec::new(), level)))
            }
        }
    }

    fn push(&mut self, chunk: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            Encoder::Gzip(enc) => {
                enc.write_all(chunk)?;
                Ok(std::mem::take(enc.get_mut()))
            }
            Encoder::Bzip2(enc) => {
                enc.write_all(chunk)?;
                Ok(std::mem::take(enc.get_mut()))
            }
        }
    }

    fn finish(self) -> io::Result<Vec<u8>> {
        match self {
            Encoder::Gzip(enc) => enc.finish(),
            Encoder::Bzip2(enc) => enc.finish(),
        }
    }
}

/// Wraps `upstream` in the requested compressor. `None` is the identity.
///
/// Upstream errors pass through untouched; encoder failures surface as
/// [`BackupError::Compression`] for `object`.
pub fn wrap(upstream: ByteStream, kind: CompressionKind, level: Option<u32>, object: &str) -> ByteStream {
    let Some(mut encoder) = Encoder::new(kind, level) else {
        return upstream;
    };
    let object = object.to_string();
    let compression_error = move |e: io::Error| BackupError::Compression {
        object: object.clone(),
        cause: e.to_string(),
    };

    let stream = try_stream! {
        let mut upstream = upstream;
        while let Some(chunk) = upstream.try_next().await? {
            let out = encoder.push(&chunk).map_err(&compression_error)?;
            if !out.is_empty() {
                yield out;
            }
        }
        let tail = encoder.finish().map_err(&compression_error)?;
        if !tail.is_empty() {
            yield tail;
        }
    };
    stream.boxed()
}

/// Reverses [`wrap`] for a complete buffer.
pub fn decompress(kind: CompressionKind, data: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    match kind {
        CompressionKind::None => out.extend_from_slice(data),
        CompressionKind::Gzip => {
            flate2::read::GzDecoder::new(data).read_to_end(&mut out)?;
        }
        CompressionKind::Bzip2 => {
            bzip2::read::BzDecoder::new(data).read_to_end(&mut out)?;
        }
    }
    Ok(out)
}
