//! Envelope-prefixed artifact files.
//!
//! Every file forge persists begins with a 16-byte envelope id identifying
//! the artifact kind and format generation, followed by a one-byte
//! compression marker and the payload. Loaders verify the id before trusting
//! content; a mismatched (or truncated) envelope means "not applicable" —
//! written by a different engine generation — and is reported as absence,
//! never as corruption. This keeps forward/backward-compatible deployments
//! from surfacing as build failures.

use std::path::Path;

use async_compression::tokio::bufread::{ZstdDecoder, ZstdEncoder};
use color_eyre::{Result, eyre::Context};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, BufReader};
use tracing::{debug, instrument};

use crate::fs;

/// The size of the envelope id prefix.
pub const ENVELOPE_ID_LEN: usize = 16;

/// The format generation. Bump when the payload encoding of any enveloped
/// artifact changes shape; old files then read as "not present" and are
/// rebuilt rather than misparsed.
const FORMAT_GENERATION: u32 = 1;

/// A 16-byte tag at the start of every serialized artifact identifying its
/// correlated cohort: artifact kind plus format generation.
///
/// Ids are derived, not random, so every engine of the same generation
/// computes the same expected id for a given artifact kind — including
/// workers loading artifacts they did not write.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
#[display("{}", hex::encode(self.0))]
pub struct FileEnvelopeId([u8; ENVELOPE_ID_LEN]);

impl FileEnvelopeId {
    /// The envelope id for an artifact kind under the current format
    /// generation.
    pub fn for_kind(kind: &str) -> Self {
        let digest = ferry::v1::Digest::from_fields([
            b"forge-envelope".as_slice(),
            &FORMAT_GENERATION.to_le_bytes(),
            kind.as_bytes(),
        ]);
        let mut id = [0u8; ENVELOPE_ID_LEN];
        id.copy_from_slice(&digest.as_bytes()[..ENVELOPE_ID_LEN]);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; ENVELOPE_ID_LEN] {
        &self.0
    }
}

/// How an enveloped payload is stored on disk. The choice is recorded in the
/// envelope so loaders auto-detect.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Serialize, Deserialize)]
pub enum Compression {
    None,
    Zstd,
}

impl Compression {
    fn marker(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Zstd => 1,
        }
    }

    fn from_marker(marker: u8) -> Option<Self> {
        match marker {
            0 => Some(Self::None),
            1 => Some(Self::Zstd),
            _ => None,
        }
    }
}

/// Encode a payload into envelope bytes: id, compression marker, payload.
#[instrument(skip(payload), fields(%id, ?compression, payload_len = payload.len()))]
pub async fn encode(
    id: FileEnvelopeId,
    compression: Compression,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(ENVELOPE_ID_LEN + 1 + payload.len());
    out.extend_from_slice(id.as_bytes());
    out.push(compression.marker());
    match compression {
        Compression::None => out.extend_from_slice(payload),
        Compression::Zstd => {
            let mut encoder = ZstdEncoder::new(BufReader::new(payload));
            encoder
                .read_to_end(&mut out)
                .await
                .context("compress payload")?;
        }
    }
    Ok(out)
}

/// Decode envelope bytes, verifying the id.
///
/// Returns `None` when the bytes are too short to carry an envelope, the id
/// does not match, or the compression marker is unknown — all of which mean
/// "written by something else", not corruption.
#[instrument(skip(bytes), fields(%expected))]
pub async fn decode(expected: FileEnvelopeId, bytes: &[u8]) -> Result<Option<Vec<u8>>> {
    if bytes.len() < ENVELOPE_ID_LEN + 1 {
        debug!(len = bytes.len(), "enveloped file too short; not applicable");
        return Ok(None);
    }
    if bytes[..ENVELOPE_ID_LEN] != expected.as_bytes()[..] {
        debug!("envelope id mismatch; not applicable");
        return Ok(None);
    }
    let Some(compression) = Compression::from_marker(bytes[ENVELOPE_ID_LEN]) else {
        debug!(
            marker = bytes[ENVELOPE_ID_LEN],
            "unknown compression marker; not applicable"
        );
        return Ok(None);
    };

    let payload = &bytes[ENVELOPE_ID_LEN + 1..];
    match compression {
        Compression::None => Ok(Some(payload.to_vec())),
        Compression::Zstd => {
            let mut decoder = ZstdDecoder::new(BufReader::new(payload));
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .await
                .context("decompress payload")?;
            Ok(Some(out))
        }
    }
}

/// Write an enveloped artifact file atomically.
#[instrument(skip(payload), fields(%id))]
pub async fn write_file(
    path: impl AsRef<Path> + std::fmt::Debug,
    id: FileEnvelopeId,
    compression: Compression,
    payload: &[u8],
) -> Result<()> {
    let bytes = encode(id, compression, payload).await?;
    fs::write_atomic(path, &bytes).await
}

/// Read an enveloped artifact file.
///
/// Returns `None` if the file is absent or its envelope does not match.
#[instrument(fields(%expected))]
pub async fn read_file(
    path: impl AsRef<Path> + std::fmt::Debug,
    expected: FileEnvelopeId,
) -> Result<Option<Vec<u8>>> {
    let Some(bytes) = fs::read_buffered(path).await? else {
        return Ok(None);
    };
    decode(expected, &bytes).await
}
