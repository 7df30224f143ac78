//! Ferry v1 API types and client.

use color_eyre::eyre::{Context, bail};
use derive_more::{Debug, Display};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{instrument, trace};

pub mod descriptor;
pub mod distrib;
pub mod store;

#[cfg(feature = "client")]
mod client;

#[cfg(feature = "client")]
pub use client::Client;

pub use descriptor::{GraphArtifact, GraphArtifactKind, GraphDescriptor};

/// A content digest: the BLAKE3 hash of a byte sequence.
///
/// Digests address blobs in the shared content store and identify graph
/// artifacts. Equality of digests implies byte-equality of the content they
/// were computed from.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
#[display("{}", self.to_hex())]
#[debug("{}", self.to_hex())]
pub struct Digest([u8; 32]);

impl Digest {
    /// View the digest as a hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Attempt to parse the digest from a hex string.
    #[instrument(fields(hex = hex.as_ref()))]
    pub fn from_hex(hex: impl AsRef<str>) -> color_eyre::Result<Self> {
        let bytes = hex::decode(hex.as_ref()).context("decode hex")?;
        let len = bytes.len();
        trace!(?len, "decoded hex");
        Self::from_bytes(bytes)
    }

    /// View the digest as bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Parse a digest from raw bytes (the inverse of `as_bytes`).
    ///
    /// This is used when deserializing digests from disk or other binary
    /// formats. The bytes must be exactly 32 bytes (a blake3 hash).
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> color_eyre::Result<Self> {
        let bytes = bytes.as_ref();
        let len = bytes.len();
        if len != 32 {
            bail!("invalid digest length: expected 32 bytes, got {len}");
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(bytes);
        Ok(Self(out))
    }

    /// Create a digest from a blake3 hash.
    pub fn from_blake3(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }

    /// Hash the contents of a buffer to create a digest.
    ///
    /// This computes the blake3 hash of the provided buffer. Use this when
    /// you have file contents or other data you want to content-address. This
    /// is NOT for parsing digests already in binary format: use `from_bytes`
    /// for that.
    pub fn from_buffer(buffer: impl AsRef<[u8]>) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(buffer.as_ref());
        Self::from_blake3(hasher.finalize())
    }

    /// Hash the contents of the iterator in order.
    ///
    /// Each field is prefixed with its length so that field boundaries can't
    /// alias (`["ab", "c"]` must not collide with `["a", "bc"]`).
    pub fn from_fields(fields: impl IntoIterator<Item = impl AsRef<[u8]>>) -> Self {
        let mut hasher = blake3::Hasher::new();
        for field in fields {
            let field = field.as_ref();
            hasher.update(&(field.len() as u64).to_le_bytes());
            hasher.update(field);
        }
        Self::from_blake3(hasher.finalize())
    }
}

impl From<&Digest> for Digest {
    fn from(digest: &Digest) -> Self {
        digest.clone()
    }
}

impl PartialEq<blake3::Hash> for Digest {
    fn eq(&self, other: &blake3::Hash) -> bool {
        &self.0 == other.as_bytes()
    }
}

impl PartialEq<blake3::Hash> for &Digest {
    fn eq(&self, other: &blake3::Hash) -> bool {
        &self.0 == other.as_bytes()
    }
}

impl Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let hex = String::deserialize(deserializer)?;
        Self::from_hex(&hex).map_err(serde::de::Error::custom)
    }
}
