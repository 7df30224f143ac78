//! Shared content store backends.
//!
//! The store holds blobs keyed by digest and graph descriptors keyed by
//! fingerprint. [`StoreBackend`] abstracts over the two deployments: a
//! plain-filesystem store (a shared directory, or a purely local build) and
//! a remote store reached through ferry's HTTP client. The engine and
//! workers only ever talk to the trait.

use std::path::PathBuf;

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use derive_more::{Debug, Display};
use ferry::v1::{
    Digest, GraphDescriptor,
    store::ProbeKind,
};
use tracing::{instrument, trace, warn};
use uuid::Uuid;

use crate::fs;

/// Trait for shared content store implementations.
pub trait StoreBackend: Clone + Send + Sync + 'static {
    /// Register a graph descriptor under its fingerprints. Registration is
    /// durable when the future resolves.
    fn register_graph(
        &self,
        descriptor: &GraphDescriptor,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Probe for descriptors by fingerprint.
    fn probe_graph(
        &self,
        fingerprint: &Digest,
        kind: ProbeKind,
    ) -> impl Future<Output = Result<Vec<GraphDescriptor>>> + Send;

    /// Store a blob. Returns `true` if newly written, `false` if present.
    fn blob_store(
        &self,
        digest: &Digest,
        content: &[u8],
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Read a blob, or `None` if the store doesn't have it.
    fn blob_read(&self, digest: &Digest) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;

    /// Check whether a blob exists.
    fn blob_exists(&self, digest: &Digest) -> impl Future<Output = Result<bool>> + Send;

    /// Materialize a blob at `dst`. Returns `false` when the store doesn't
    /// have the blob.
    ///
    /// The default reads and rewrites; stores that share a filesystem with
    /// the destination override this with hardlink-or-copy semantics.
    fn blob_materialize(
        &self,
        digest: &Digest,
        dst: &std::path::Path,
    ) -> impl Future<Output = Result<bool>> + Send {
        async move {
            match self.blob_read(digest).await? {
                Some(content) => {
                    if let Some(parent) = dst.parent() {
                        fs::create_dir_all(parent).await?;
                    }
                    fs::write_atomic(dst, &content).await?;
                    Ok(true)
                }
                None => Ok(false),
            }
        }
    }
}

/// A content store on a filesystem.
///
/// ## File structure
///
/// Blobs live in a two-level directory structure where each file is named by
/// the hex digest of its content: `{root}/blobs/{hex[0..2]}/{hex[2..4]}/{hex}`.
/// Descriptors live under `{root}/graphs/exact/{hex}.json`, with one
/// additional entry per compatible fingerprint under
/// `{root}/graphs/compatible/{hex}/{exact-hex}.json`.
///
/// ## Atomic writes
///
/// Writes use a temp-file-then-rename pattern, and blob content is verified
/// against its digest before the rename.
#[derive(Clone, Eq, PartialEq, Debug, Display)]
#[debug("FsStore(root = {})", self.root.display())]
#[display("{}", root.display())]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Create a new instance with the given root directory.
    ///
    /// The directory is created when the first entry is written.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        let hex = digest.to_hex();
        self.root
            .join("blobs")
            .join(&hex[0..2])
            .join(&hex[2..4])
            .join(&hex)
    }

    fn exact_path(&self, fingerprint: &Digest) -> PathBuf {
        self.root
            .join("graphs")
            .join("exact")
            .join(format!("{}.json", fingerprint.to_hex()))
    }

    fn compatible_dir(&self, fingerprint: &Digest) -> PathBuf {
        self.root
            .join("graphs")
            .join("compatible")
            .join(fingerprint.to_hex())
    }
}

impl StoreBackend for FsStore {
    #[instrument(name = "FsStore::register_graph", skip_all, fields(fingerprint = %descriptor.exact_fingerprint))]
    async fn register_graph(&self, descriptor: &GraphDescriptor) -> Result<()> {
        let payload = serde_json::to_vec(descriptor).context("serialize descriptor")?;

        let exact = self.exact_path(&descriptor.exact_fingerprint);
        if let Some(parent) = exact.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write_atomic(&exact, &payload).await?;

        let compatible_dir = self.compatible_dir(&descriptor.compatible_fingerprint);
        fs::create_dir_all(&compatible_dir).await?;
        let compatible =
            compatible_dir.join(format!("{}.json", descriptor.exact_fingerprint.to_hex()));
        fs::write_atomic(&compatible, &payload).await?;

        trace!("registered graph descriptor");
        Ok(())
    }

    #[instrument(name = "FsStore::probe_graph", skip(self))]
    async fn probe_graph(
        &self,
        fingerprint: &Digest,
        kind: ProbeKind,
    ) -> Result<Vec<GraphDescriptor>> {
        match kind {
            ProbeKind::Exact => {
                let path = self.exact_path(fingerprint);
                match fs::read_buffered(&path).await? {
                    Some(payload) => {
                        let descriptor = serde_json::from_slice(&payload)
                            .context("parse descriptor")?;
                        Ok(vec![descriptor])
                    }
                    None => Ok(Vec::new()),
                }
            }
            ProbeKind::Compatible => {
                let dir = self.compatible_dir(fingerprint);
                let mut entries = match tokio::fs::read_dir(&dir).await {
                    Ok(entries) => entries,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                        return Ok(Vec::new());
                    }
                    Err(err) => return Err(err).context(format!("enumerate {dir:?}")),
                };
                let mut candidates = Vec::new();
                while let Some(entry) = entries
                    .next_entry()
                    .await
                    .with_context(|| format!("enumerate {dir:?}"))?
                {
                    let payload = fs::must_read_buffered(entry.path()).await?;
                    match serde_json::from_slice(&payload) {
                        Ok(descriptor) => candidates.push(descriptor),
                        Err(err) => {
                            warn!(path = ?entry.path(), ?err, "skipping unparseable descriptor");
                        }
                    }
                }
                Ok(candidates)
            }
        }
    }

    #[instrument(name = "FsStore::blob_store", skip(content))]
    async fn blob_store(&self, digest: &Digest, content: &[u8]) -> Result<bool> {
        let path = self.blob_path(digest);
        if fs::exists(&path).await {
            return Ok(false);
        }
        if Digest::from_buffer(content) != *digest {
            bail!("blob content does not hash to {digest}");
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write to a temp sibling and rename; concurrent writers of the same
        // digest converge on identical content.
        let temp = {
            let mut temp = path.as_os_str().to_owned();
            temp.push(".tmp.");
            temp.push(Uuid::new_v4().to_string());
            PathBuf::from(temp)
        };
        fs::write(&temp, content).await?;
        match tokio::fs::rename(&temp, &path).await {
            Ok(()) => Ok(true),
            Err(err) => {
                if let Err(err) = tokio::fs::remove_file(&temp).await {
                    warn!("failed to remove temp file {temp:?}: {err}");
                }
                if err.kind() == std::io::ErrorKind::AlreadyExists {
                    Ok(false)
                } else {
                    Err(err).context(format!("rename {temp:?} to {path:?}"))
                }
            }
        }
    }

    #[instrument(name = "FsStore::blob_read", skip(self))]
    async fn blob_read(&self, digest: &Digest) -> Result<Option<Vec<u8>>> {
        fs::read_buffered(self.blob_path(digest)).await
    }

    #[instrument(name = "FsStore::blob_exists", skip(self))]
    async fn blob_exists(&self, digest: &Digest) -> Result<bool> {
        Ok(fs::exists(self.blob_path(digest)).await)
    }

    #[instrument(name = "FsStore::blob_materialize", skip(self))]
    async fn blob_materialize(&self, digest: &Digest, dst: &std::path::Path) -> Result<bool> {
        let src = self.blob_path(digest);
        if !fs::exists(&src).await {
            return Ok(false);
        }
        fs::hardlink_or_copy(&src, dst).await?;
        Ok(true)
    }
}

/// A content store reached through ferry's HTTP client.
#[derive(Clone, Debug, Display)]
#[display("{client}")]
pub struct RemoteStore {
    client: ferry::Ferry,
}

impl RemoteStore {
    pub fn new(client: ferry::Ferry) -> Self {
        Self { client }
    }
}

impl StoreBackend for RemoteStore {
    #[instrument(name = "RemoteStore::register_graph", skip_all)]
    async fn register_graph(&self, descriptor: &GraphDescriptor) -> Result<()> {
        self.client.register_graph(descriptor).await
    }

    #[instrument(name = "RemoteStore::probe_graph", skip(self))]
    async fn probe_graph(
        &self,
        fingerprint: &Digest,
        kind: ProbeKind,
    ) -> Result<Vec<GraphDescriptor>> {
        self.client.probe_graph(fingerprint, kind).await
    }

    #[instrument(name = "RemoteStore::blob_store", skip(content))]
    async fn blob_store(&self, digest: &Digest, content: &[u8]) -> Result<bool> {
        self.client.blob_write(digest, content).await
    }

    #[instrument(name = "RemoteStore::blob_read", skip(self))]
    async fn blob_read(&self, digest: &Digest) -> Result<Option<Vec<u8>>> {
        self.client.blob_read(digest).await
    }

    #[instrument(name = "RemoteStore::blob_exists", skip(self))]
    async fn blob_exists(&self, digest: &Digest) -> Result<bool> {
        self.client.blob_exists(digest).await
    }
}
