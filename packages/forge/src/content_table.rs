//! The file content table: a persistent mapping from file identity to
//! content digest.
//!
//! Hashing is the expensive path of change detection. When the filesystem
//! can name a file *version* — device, inode, and a revision derived from
//! size and mtime — we remember the digest we computed for that version and
//! skip rehashing as long as the identity is unchanged. A digest recorded
//! for identity X is only ever reported while the file's observable identity
//! is still X; anything else is a miss that forces hashing.
//!
//! On filesystems that cannot report identities precisely the table degrades
//! to a stub: every lookup reports unknown and every record is dropped.
//!
//! The table persists to `FileContentTable.bin` in the engine-cache
//! directory. Entries carry a TTL measured in builds; an entry untouched for
//! that many builds is evicted on save.

use std::path::Path;

use color_eyre::{Result, eyre::Context};
use dashmap::DashMap;
use derive_more::Debug;
use ferry::v1::Digest;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace, warn};

use crate::envelope::{self, Compression, FileEnvelopeId};

/// The engine-cache file the table persists to.
pub const FILE_NAME: &str = "FileContentTable.bin";

/// Default entry TTL, in builds.
pub const DEFAULT_TTL: u16 = 32;

/// A file version on filesystems that support stable identities.
///
/// Two observations with equal identity refer to byte-identical content;
/// the revision changes whenever the file is rewritten.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub enum FileIdentity {
    Supported {
        volume: u64,
        file: u64,
        revision: FileRevision,
    },
    /// The filesystem cannot name file versions; hashing is always required.
    Unsupported,
}

/// The version component of a file identity.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct FileRevision {
    pub mtime_ns: i128,
    pub size: u64,
}

impl FileIdentity {
    /// Observe the identity of the file at `path`.
    ///
    /// Errors are IO errors (file missing, permission); an identity-less
    /// filesystem yields `Unsupported`, not an error.
    #[instrument]
    pub async fn of(path: impl AsRef<Path> + std::fmt::Debug) -> Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("stat {path:?}"))?;
        Ok(Self::from_metadata(&metadata))
    }

    #[cfg(unix)]
    fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        let mtime_ns = (metadata.mtime() as i128) * 1_000_000_000 + metadata.mtime_nsec() as i128;
        Self::Supported {
            volume: metadata.dev(),
            file: metadata.ino(),
            revision: FileRevision {
                mtime_ns,
                size: metadata.len(),
            },
        }
    }

    #[cfg(not(unix))]
    fn from_metadata(_metadata: &std::fs::Metadata) -> Self {
        Self::Unsupported
    }

    /// Whether this identity can be compared meaningfully.
    pub fn is_supported(&self) -> bool {
        matches!(self, Self::Supported { .. })
    }
}

/// The persistent volume+file key; the revision lives in the entry so that a
/// lookup under a newer revision invalidates the stale entry in place.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
struct FileKey {
    volume: u64,
    file: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Entry {
    revision: FileRevision,
    digest: Digest,
    ttl: u16,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    default_ttl: u16,
    entries: Vec<(FileKey, Entry)>,
}

/// Persistent `FileIdentity → Digest` mapping.
///
/// Concurrent readers and writers are allowed; persistence happens under
/// exclusive access at shutdown.
#[derive(Debug)]
pub struct FileContentTable {
    #[debug("{} entries", entries.len())]
    entries: DashMap<FileKey, Entry>,
    default_ttl: u16,
    stub: bool,
}

impl FileContentTable {
    fn envelope_id() -> FileEnvelopeId {
        FileEnvelopeId::for_kind("FileContentTable")
    }

    /// Create an empty table.
    pub fn new(default_ttl: u16) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
            stub: false,
        }
    }

    /// Create a stub table: every call reports "unknown" and forces hashing.
    pub fn stub() -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl: 0,
            stub: true,
        }
    }

    pub fn is_stub(&self) -> bool {
        self.stub
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Load the table from the engine-cache directory, or start fresh when
    /// the file is absent or was written by a different engine generation.
    #[instrument]
    pub async fn load(engine_cache_dir: impl AsRef<Path> + std::fmt::Debug) -> Result<Self> {
        let path = engine_cache_dir.as_ref().join(FILE_NAME);
        let Some(payload) = envelope::read_file(&path, Self::envelope_id()).await? else {
            debug!("no usable file content table; starting fresh");
            return Ok(Self::new(DEFAULT_TTL));
        };
        let snapshot =
            serde_json::from_slice::<Snapshot>(&payload).context("parse file content table")?;
        let table = Self::new(snapshot.default_ttl);
        for (key, entry) in snapshot.entries {
            table.entries.insert(key, entry);
        }
        trace!(entries = table.entries.len(), "loaded file content table");
        Ok(table)
    }

    /// Save the table to the engine-cache directory.
    ///
    /// Aging happens here: every entry not touched since load has its TTL
    /// decremented, and entries reaching zero are evicted. Stub tables are
    /// never saved.
    #[instrument(skip(self))]
    pub async fn save(&self, engine_cache_dir: impl AsRef<Path> + std::fmt::Debug) -> Result<()> {
        if self.stub {
            debug!("stub file content table; not saving");
            return Ok(());
        }

        self.entries.retain(|_, entry| {
            entry.ttl = entry.ttl.saturating_sub(1);
            entry.ttl > 0
        });

        let mut entries = self
            .entries
            .iter()
            .map(|item| (*item.key(), item.value().clone()))
            .collect::<Vec<_>>();
        entries.sort_by_key(|(key, _)| *key);

        let snapshot = Snapshot {
            default_ttl: self.default_ttl,
            entries,
        };
        let payload = serde_json::to_vec(&snapshot).context("serialize file content table")?;
        let path = engine_cache_dir.as_ref().join(FILE_NAME);
        envelope::write_file(&path, Self::envelope_id(), Compression::Zstd, &payload).await
    }

    /// Report the known digest for the file at `path`, if its current
    /// identity matches a recorded one.
    ///
    /// A revision mismatch invalidates the stale entry. Returns the observed
    /// identity alongside the digest so callers can record it.
    #[instrument(skip(self))]
    pub async fn try_get_known_hash(
        &self,
        path: impl AsRef<Path> + std::fmt::Debug,
    ) -> Result<Option<(FileIdentity, Digest)>> {
        if self.stub {
            return Ok(None);
        }
        let identity = FileIdentity::of(path).await?;
        let FileIdentity::Supported {
            volume,
            file,
            revision,
        } = identity
        else {
            return Ok(None);
        };

        let key = FileKey { volume, file };
        let Some(mut entry) = self.entries.get_mut(&key) else {
            return Ok(None);
        };
        if entry.revision != revision {
            drop(entry);
            trace!(?key, "revision changed; invalidating stale entry");
            self.entries.remove(&key);
            return Ok(None);
        }
        entry.ttl = self.default_ttl;
        Ok(Some((identity, entry.digest.clone())))
    }

    /// Record the digest of the file at `path`.
    ///
    /// The identity is observed before and after the caller's read: if the
    /// file changed underneath the read, the record is dropped, upholding
    /// the invariant that a stored digest was true for the stored identity.
    #[instrument(skip(self, digest))]
    pub async fn record_content_hash(
        &self,
        path: impl AsRef<Path> + std::fmt::Debug,
        observed_before: FileIdentity,
        digest: Digest,
    ) -> Result<(FileIdentity, Digest)> {
        let identity = FileIdentity::of(&path).await?;
        if self.stub {
            return Ok((identity, digest));
        }
        let FileIdentity::Supported {
            volume,
            file,
            revision,
        } = identity
        else {
            return Ok((identity, digest));
        };
        if identity != observed_before {
            warn!(?path, "file changed while hashing; not recording");
            return Ok((identity, digest));
        }

        self.entries.insert(
            FileKey { volume, file },
            Entry {
                revision,
                digest: digest.clone(),
                ttl: self.default_ttl,
            },
        );
        Ok((identity, digest))
    }

    /// Observe, hash, and record in one step: the common slow path.
    #[instrument(skip(self))]
    pub async fn hash_and_record(
        &self,
        path: impl AsRef<Path> + std::fmt::Debug,
    ) -> Result<(FileIdentity, Digest)> {
        let before = FileIdentity::of(&path).await?;
        let digest = crate::fs::digest_file(&path).await?;
        self.record_content_hash(&path, before, digest).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    #[tokio::test]
    async fn known_hash_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");
        fs::write(&path, b"content").await.unwrap();

        let table = FileContentTable::new(DEFAULT_TTL);
        assert!(table.try_get_known_hash(&path).await.unwrap().is_none());

        let (_, digest) = table.hash_and_record(&path).await.unwrap();
        let (_, known) = table.try_get_known_hash(&path).await.unwrap().unwrap();
        pretty_assert_eq!(known, digest);
    }

    #[tokio::test]
    async fn rewrite_invalidates_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");
        fs::write(&path, b"first").await.unwrap();

        let table = FileContentTable::new(DEFAULT_TTL);
        table.hash_and_record(&path).await.unwrap();

        // Rewrite with different size so the revision must differ even on
        // filesystems with coarse mtime granularity.
        fs::write(&path, b"second, longer").await.unwrap();
        assert!(table.try_get_known_hash(&path).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stub_reports_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");
        fs::write(&path, b"content").await.unwrap();

        let table = FileContentTable::stub();
        table.hash_and_record(&path).await.unwrap();
        assert!(table.try_get_known_hash(&path).await.unwrap().is_none());
        pretty_assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");
        fs::write(&path, b"content").await.unwrap();

        let table = FileContentTable::new(DEFAULT_TTL);
        let (_, digest) = table.hash_and_record(&path).await.unwrap();
        table.save(dir.path()).await.unwrap();

        let reloaded = FileContentTable::load(dir.path()).await.unwrap();
        let (_, known) = reloaded.try_get_known_hash(&path).await.unwrap().unwrap();
        pretty_assert_eq!(known, digest);
    }

    #[tokio::test]
    async fn ttl_evicts_untouched_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");
        fs::write(&path, b"content").await.unwrap();

        let table = FileContentTable::new(1);
        table.hash_and_record(&path).await.unwrap();
        pretty_assert_eq!(table.len(), 1);

        // One save ages the entry from 1 to 0 and evicts it.
        table.save(dir.path()).await.unwrap();
        pretty_assert_eq!(table.len(), 0);

        let reloaded = FileContentTable::load(dir.path()).await.unwrap();
        assert!(reloaded.is_empty());
    }

    #[tokio::test]
    async fn missing_table_loads_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let table = FileContentTable::load(dir.path()).await.unwrap();
        assert!(table.is_empty());
        assert!(!table.is_stub());
    }
}
