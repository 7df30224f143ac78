//! The graph cache: serialize and restore pip graphs, locally and through
//! the shared content store.
//!
//! Two levels:
//! - the *engine cache* directory holds the last successful run's serialized
//!   artifacts plus the `PreviousInputs` record that correlates them;
//! - the *shared content store* holds the same artifacts as blobs, keyed by
//!   digest, with a [`GraphDescriptor`] registered under the graph's
//!   fingerprints so other machines can find them.
//!
//! ## Atomicity
//!
//! The `PreviousInputs` file is the commit point of a save: it is deleted
//! before any artifact is serialized, staged as `PreviousInputs.tmp` once
//! every artifact is durable and the descriptor is registered, and renamed
//! into place by [`GraphCache::finalize_previous_inputs`]. A crash at any
//! instant leaves either a complete previous-run state or none.

pub mod store;

use std::{path::PathBuf, sync::Arc};

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use ferry::v1::{
    Digest, GraphDescriptor,
    descriptor::{GraphArtifact, GraphArtifactKind},
    store::ProbeKind,
};
use futures::{StreamExt, TryStreamExt, stream};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace, warn};

use crate::{
    envelope::{self, Compression, FileEnvelopeId},
    fingerprint::GraphFingerprint,
    fs,
    graph::PipGraph,
    intern::{InternPools, InternTable},
    track::TrackerSnapshot,
};

pub use store::{FsStore, RemoteStore, StoreBackend};

/// The canonical previous-inputs file name.
pub const PREVIOUS_INPUTS_FILE: &str = "PreviousInputs";

/// The staging name used during save; renamed to [`PREVIOUS_INPUTS_FILE`]
/// only on full success.
pub const PREVIOUS_INPUTS_STAGING_FILE: &str = "PreviousInputs.tmp";

/// Directory of per-build fingerprint history records.
pub const FINGERPRINT_STORE_DIR: &str = "FingerprintStore";

/// The payload of the `PreviousInputs` file: everything run N+1 needs to
/// decide whether run N's graph is reusable and to load it if so.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PreviousRunRecord {
    pub fingerprint: GraphFingerprint,
    pub snapshot: TrackerSnapshot,
    /// The artifact cohort the snapshot correlates with; loading verifies
    /// each artifact file against its recorded digest.
    pub artifacts: Vec<GraphArtifact>,
}

impl PreviousRunRecord {
    fn envelope_id() -> FileEnvelopeId {
        FileEnvelopeId::for_kind("PreviousInputs")
    }
}

/// A deserialized graph together with the intern pools it references and
/// the input-tracker snapshot recorded while it was constructed.
#[derive(Debug)]
pub struct LoadedGraph {
    pub graph: PipGraph,
    pub pools: Arc<InternPools>,
    pub snapshot: TrackerSnapshot,
}

/// One fingerprint-history record, appended per build for diagnosing
/// unexpected cache misses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub at: jiff::Timestamp,
    pub fingerprint: GraphFingerprint,
    pub decision: String,
}

/// The two-level graph cache.
#[derive(Clone, Debug)]
pub struct GraphCache<S> {
    engine_cache_dir: PathBuf,
    store: S,
    compression: Compression,
    materialize_concurrency: usize,
}

impl<S: StoreBackend> GraphCache<S> {
    pub fn new(engine_cache_dir: impl Into<PathBuf>, store: S) -> Self {
        Self {
            engine_cache_dir: engine_cache_dir.into(),
            store,
            compression: Compression::Zstd,
            materialize_concurrency: num_cpus::get(),
        }
    }

    pub fn engine_cache_dir(&self) -> &PathBuf {
        &self.engine_cache_dir
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn previous_inputs_path(&self) -> PathBuf {
        self.engine_cache_dir.join(PREVIOUS_INPUTS_FILE)
    }

    fn staging_path(&self) -> PathBuf {
        self.engine_cache_dir.join(PREVIOUS_INPUTS_STAGING_FILE)
    }

    fn artifact_path(&self, kind: GraphArtifactKind) -> PathBuf {
        self.engine_cache_dir.join(kind.file_name())
    }

    /// Read the previous run's record, if a usable one exists.
    #[instrument(skip(self))]
    pub async fn read_previous_record(&self) -> Result<Option<PreviousRunRecord>> {
        let Some(payload) =
            envelope::read_file(self.previous_inputs_path(), PreviousRunRecord::envelope_id())
                .await?
        else {
            return Ok(None);
        };
        serde_json::from_slice(&payload)
            .context("parse previous-run record")
            .map(Some)
    }

    /// Serialize the graph and its pools into the engine cache, publish the
    /// artifacts to the shared store, and stage the previous-inputs record.
    ///
    /// On return every artifact is durable locally and in the store and the
    /// descriptor is registered; the record is staged but **not yet
    /// canonical** — call [`Self::finalize_previous_inputs`] once the build
    /// is ready to commit.
    #[instrument(skip_all, fields(fingerprint = %fingerprint.exact))]
    pub async fn save(
        &self,
        graph: &PipGraph,
        pools: &InternPools,
        fingerprint: &GraphFingerprint,
        snapshot: &TrackerSnapshot,
    ) -> Result<GraphDescriptor> {
        fs::create_dir_all(&self.engine_cache_dir).await?;

        // Invalidate the previous run before any artifact is touched: a
        // crash mid-save must not leave a record pointing at mixed cohorts.
        fs::remove_file_if_exists(self.previous_inputs_path()).await?;
        fs::remove_file_if_exists(self.staging_path()).await?;

        let mut artifacts = Vec::new();
        let mut uploads = Vec::new();
        for kind in [
            GraphArtifactKind::InputTracker,
            GraphArtifactKind::StringTable,
            GraphArtifactKind::PathTable,
            GraphArtifactKind::SymbolTable,
            GraphArtifactKind::TokenTextTable,
            GraphArtifactKind::PipGraph,
        ] {
            let bytes = match kind {
                GraphArtifactKind::InputTracker => snapshot.to_envelope_bytes().await?,
                kind => {
                    let payload = self.artifact_payload(kind, graph, pools)?;
                    envelope::encode(
                        FileEnvelopeId::for_kind(kind.file_name()),
                        self.compression,
                        &payload,
                    )
                    .await?
                }
            };

            let digest = Digest::from_buffer(&bytes);
            fs::write_atomic(self.artifact_path(kind), &bytes).await?;
            artifacts.push(
                GraphArtifact::builder()
                    .kind(kind)
                    .digest(digest.clone())
                    .bytes(bytes.len() as u64)
                    .build(),
            );
            uploads.push((digest, bytes));
        }

        // Publish the blobs with bounded parallelism, then the descriptor.
        let store = self.store.clone();
        stream::iter(uploads)
            .map(|(digest, bytes)| {
                let store = store.clone();
                async move { store.blob_store(&digest, &bytes).await.map(|_| ()) }
            })
            .buffer_unordered(self.materialize_concurrency)
            .try_collect::<Vec<()>>()
            .await
            .context("publish graph artifacts")?;

        let descriptor = GraphDescriptor::builder()
            .exact_fingerprint(fingerprint.exact.clone())
            .compatible_fingerprint(fingerprint.compatible.clone())
            .artifacts(artifacts.clone())
            .env_vars(snapshot.env_vars.iter().cloned().collect())
            .mounts(
                snapshot
                    .mounts
                    .iter()
                    .map(|(name, path)| {
                        (
                            name.clone(),
                            path.as_ref().map(|p| p.to_string_lossy().into_owned()),
                        )
                    })
                    .collect(),
            )
            .build();
        self.store
            .register_graph(&descriptor)
            .await
            .context("register graph descriptor")?;

        let record = PreviousRunRecord {
            fingerprint: fingerprint.clone(),
            snapshot: snapshot.clone(),
            artifacts,
        };
        let payload = serde_json::to_vec(&record).context("serialize previous-run record")?;
        envelope::write_file(
            self.staging_path(),
            PreviousRunRecord::envelope_id(),
            self.compression,
            &payload,
        )
        .await?;

        debug!(bytes = descriptor.total_bytes(), "graph saved and staged");
        Ok(descriptor)
    }

    /// Atomically promote the staged previous-inputs record to canonical.
    #[instrument(skip(self))]
    pub async fn finalize_previous_inputs(&self) -> Result<()> {
        let staging = self.staging_path();
        if !fs::exists(&staging).await {
            bail!("no staged previous-inputs record to finalize");
        }
        fs::rename(&staging, self.previous_inputs_path()).await
    }

    /// Load the previous run's graph from the engine cache, verifying the
    /// requested exact fingerprint and the artifact cohort.
    ///
    /// `None` means "not usable" — absent record, fingerprint mismatch, or
    /// an artifact that fails cohort verification. Only a record that
    /// matches but whose artifacts are unreadable is an error.
    #[instrument(skip(self))]
    pub async fn try_load_local(&self, exact_fingerprint: &Digest) -> Result<Option<LoadedGraph>> {
        let Some(record) = self.read_previous_record().await? else {
            return Ok(None);
        };
        if record.fingerprint.exact != *exact_fingerprint {
            debug!("previous-run fingerprint differs; local graph not applicable");
            return Ok(None);
        }
        self.load_artifacts(&record.artifacts).await
    }

    /// Fetch a graph from the shared store by exact fingerprint and
    /// materialize it into the engine cache.
    #[instrument(skip(self))]
    pub async fn try_fetch_remote(
        &self,
        exact_fingerprint: &Digest,
    ) -> Result<Option<(GraphDescriptor, LoadedGraph)>> {
        let candidates = self
            .store
            .probe_graph(exact_fingerprint, ProbeKind::Exact)
            .await?;
        let Some(descriptor) = candidates.into_iter().next() else {
            return Ok(None);
        };
        match self.materialize_and_load(&descriptor).await? {
            Some(loaded) => Ok(Some((descriptor, loaded))),
            None => Ok(None),
        }
    }

    /// Materialize a descriptor's artifacts into the engine cache and load
    /// them. Used for remote hits and by workers fetching a published graph.
    #[instrument(skip_all, fields(fingerprint = %descriptor.exact_fingerprint))]
    pub async fn materialize_and_load(
        &self,
        descriptor: &GraphDescriptor,
    ) -> Result<Option<LoadedGraph>> {
        fs::create_dir_all(&self.engine_cache_dir).await?;

        let store = self.store.clone();
        let materialized = stream::iter(descriptor.artifacts.clone())
            .map(|artifact| {
                let store = store.clone();
                let dst = self.artifact_path(artifact.kind);
                async move {
                    let present = store.blob_materialize(&artifact.digest, &dst).await?;
                    if !present {
                        return Ok::<_, color_eyre::Report>(Some(artifact.digest.clone()));
                    }
                    let written = fs::must_read_buffered(&dst).await?;
                    if Digest::from_buffer(&written) != artifact.digest {
                        bail!("materialized artifact {:?} failed digest verification", artifact.kind);
                    }
                    Ok(None)
                }
            })
            .buffer_unordered(self.materialize_concurrency)
            .try_collect::<Vec<_>>()
            .await?;

        if let Some(missing) = materialized.into_iter().flatten().next() {
            warn!(%missing, "store is missing a referenced blob; graph not usable");
            return Ok(None);
        }

        self.load_artifacts(&descriptor.artifacts).await
    }

    /// Load an artifact cohort from the engine cache.
    async fn load_artifacts(&self, artifacts: &[GraphArtifact]) -> Result<Option<LoadedGraph>> {
        let mut snapshot = None;
        let mut string_table = None;
        let mut path_table = None;
        let mut symbol_table = None;
        let mut token_text_table = None;
        let mut graph = None;

        for artifact in artifacts {
            let path = self.artifact_path(artifact.kind);
            let Some(bytes) = fs::read_buffered(&path).await? else {
                debug!(kind = ?artifact.kind, "artifact file absent; graph not loadable");
                return Ok(None);
            };
            if Digest::from_buffer(&bytes) != artifact.digest {
                debug!(kind = ?artifact.kind, "artifact digest mismatch; graph not loadable");
                return Ok(None);
            }

            if artifact.kind == GraphArtifactKind::InputTracker {
                let Some(parsed) = TrackerSnapshot::from_envelope_bytes(&bytes).await? else {
                    debug!("input-tracker envelope mismatch; graph not loadable");
                    return Ok(None);
                };
                snapshot = Some(parsed);
                continue;
            }

            let Some(payload) = envelope::decode(
                FileEnvelopeId::for_kind(artifact.kind.file_name()),
                &bytes,
            )
            .await?
            else {
                debug!(kind = ?artifact.kind, "artifact envelope mismatch; graph not loadable");
                return Ok(None);
            };

            match artifact.kind {
                GraphArtifactKind::InputTracker => unreachable!("handled above"),
                GraphArtifactKind::StringTable => {
                    string_table = Some(parse_table(&payload)?);
                }
                GraphArtifactKind::PathTable => {
                    path_table = Some(parse_table(&payload)?);
                }
                GraphArtifactKind::SymbolTable => {
                    symbol_table = Some(parse_table(&payload)?);
                }
                GraphArtifactKind::TokenTextTable => {
                    token_text_table = Some(parse_table(&payload)?);
                }
                GraphArtifactKind::PipGraph => {
                    graph = Some(
                        serde_json::from_slice::<PipGraph>(&payload).context("parse pip graph")?,
                    );
                }
            }
        }

        let (Some(snapshot), Some(strings), Some(paths), Some(symbols), Some(token_texts), Some(graph)) = (
            snapshot,
            string_table,
            path_table,
            symbol_table,
            token_text_table,
            graph,
        ) else {
            debug!("artifact cohort incomplete; graph not loadable");
            return Ok(None);
        };

        trace!(pips = graph.pip_count(), "loaded graph from engine cache");
        Ok(Some(LoadedGraph {
            graph,
            pools: Arc::new(InternPools {
                strings,
                paths,
                symbols,
                token_texts,
            }),
            snapshot,
        }))
    }

    fn artifact_payload(
        &self,
        kind: GraphArtifactKind,
        graph: &PipGraph,
        pools: &InternPools,
    ) -> Result<Vec<u8>> {
        let payload = match kind {
            GraphArtifactKind::InputTracker => {
                unreachable!("input tracker artifact is enveloped by the snapshot itself")
            }
            GraphArtifactKind::StringTable => serde_json::to_vec(&pools.strings.snapshot()),
            GraphArtifactKind::PathTable => serde_json::to_vec(&pools.paths.snapshot()),
            GraphArtifactKind::SymbolTable => serde_json::to_vec(&pools.symbols.snapshot()),
            GraphArtifactKind::TokenTextTable => serde_json::to_vec(&pools.token_texts.snapshot()),
            GraphArtifactKind::PipGraph => serde_json::to_vec(graph),
        };
        payload.with_context(|| format!("serialize {kind}"))
    }

    /// Stage and finalize a previous-run record adopted from a fetched
    /// descriptor, so the next build's up-to-date check starts from the
    /// fetched graph.
    #[instrument(skip_all, fields(fingerprint = %record.fingerprint.exact))]
    pub async fn adopt_previous_record(&self, record: &PreviousRunRecord) -> Result<()> {
        let payload = serde_json::to_vec(record).context("serialize previous-run record")?;
        envelope::write_file(
            self.staging_path(),
            PreviousRunRecord::envelope_id(),
            self.compression,
            &payload,
        )
        .await?;
        self.finalize_previous_inputs().await
    }

    /// Append a fingerprint-history record for this build.
    #[instrument(skip(self, fingerprint))]
    pub async fn record_fingerprint(
        &self,
        fingerprint: &GraphFingerprint,
        decision: impl Into<String> + std::fmt::Debug,
    ) -> Result<()> {
        let dir = self.engine_cache_dir.join(FINGERPRINT_STORE_DIR);
        fs::create_dir_all(&dir).await?;
        let record = FingerprintRecord {
            at: jiff::Timestamp::now(),
            fingerprint: fingerprint.clone(),
            decision: decision.into(),
        };
        let name = format!(
            "{}-{}.json",
            record.at.as_millisecond(),
            uuid::Uuid::new_v4(),
        );
        let payload = serde_json::to_vec(&record).context("serialize fingerprint record")?;
        fs::write_atomic(dir.join(name), &payload).await
    }
}

fn parse_table<K>(payload: &[u8]) -> Result<InternTable<K>> {
    let entries = serde_json::from_slice::<Vec<String>>(payload).context("parse intern table")?;
    Ok(InternTable::from_snapshot(entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fingerprint::{EvaluationFilter, FingerprintInputs, GraphFingerprinter},
        graph::{Mount, PipGraphBuilder, PipKind},
    };
    use pretty_assertions::assert_eq as pretty_assert_eq;
    use std::collections::BTreeMap;

    fn fingerprint(tag: &[u8]) -> GraphFingerprint {
        let inputs = FingerprintInputs {
            engine_version: Digest::from_buffer(tag),
            filter: EvaluationFilter::full(),
            ..Default::default()
        };
        GraphFingerprinter::new().compute(&inputs)
    }

    fn build_graph(pools: &InternPools) -> PipGraph {
        let mut builder = PipGraphBuilder::new();
        builder
            .add_mount(Mount {
                name: "Out".to_string(),
                root: PathBuf::from("/ws/out"),
                readable: true,
                writable: true,
                scrubbable: false,
            })
            .unwrap();
        builder
            .add_pip(
                pools.symbols.intern("copy"),
                PipKind::CopyFile {
                    source: pools.paths.intern("in.txt"),
                    destination: pools.paths.intern("out.txt"),
                },
                vec![pools.paths.intern("in.txt")],
                vec![pools.paths.intern("out.txt")],
                BTreeMap::new(),
                vec![],
            )
            .unwrap();
        builder.build()
    }

    fn cache(dir: &std::path::Path) -> GraphCache<FsStore> {
        GraphCache::new(dir.join("engine-cache"), FsStore::new(dir.join("store")))
    }

    #[tokio::test]
    async fn save_finalize_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let pools = InternPools::new();
        let graph = build_graph(&pools);
        let fingerprint = fingerprint(b"v1");

        cache
            .save(&graph, &pools, &fingerprint, &TrackerSnapshot::default())
            .await
            .unwrap();

        // Not yet finalized: no previous record, no local load.
        pretty_assert_eq!(cache.read_previous_record().await.unwrap(), None);
        assert!(cache.try_load_local(&fingerprint.exact).await.unwrap().is_none());

        cache.finalize_previous_inputs().await.unwrap();

        let record = cache.read_previous_record().await.unwrap().unwrap();
        pretty_assert_eq!(record.fingerprint, fingerprint);

        let loaded = cache.try_load_local(&fingerprint.exact).await.unwrap().unwrap();
        pretty_assert_eq!(loaded.graph, graph);
        pretty_assert_eq!(*loaded.pools, *pools);
    }

    #[tokio::test]
    async fn fingerprint_mismatch_is_not_applicable() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let pools = InternPools::new();
        let graph = build_graph(&pools);

        cache
            .save(&graph, &pools, &fingerprint(b"v1"), &TrackerSnapshot::default())
            .await
            .unwrap();
        cache.finalize_previous_inputs().await.unwrap();

        assert!(
            cache
                .try_load_local(&fingerprint(b"v2").exact)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn remote_fetch_materializes_and_loads() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path().join("store"));
        let pools = InternPools::new();
        let graph = build_graph(&pools);
        let fingerprint = fingerprint(b"v1");

        // Publisher machine.
        let publisher = GraphCache::new(dir.path().join("publisher"), store.clone());
        publisher
            .save(&graph, &pools, &fingerprint, &TrackerSnapshot::default())
            .await
            .unwrap();

        // Fresh machine: nothing local, remote hit.
        let fresh = GraphCache::new(dir.path().join("fresh"), store);
        assert!(fresh.try_load_local(&fingerprint.exact).await.unwrap().is_none());

        let (descriptor, loaded) = fresh
            .try_fetch_remote(&fingerprint.exact)
            .await
            .unwrap()
            .unwrap();
        pretty_assert_eq!(descriptor.exact_fingerprint, fingerprint.exact);
        pretty_assert_eq!(loaded.graph, graph);
    }

    #[tokio::test]
    async fn remote_miss_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        assert!(
            cache
                .try_fetch_remote(&fingerprint(b"unknown").exact)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn save_invalidates_prior_record_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let pools = InternPools::new();
        let graph = build_graph(&pools);

        cache
            .save(&graph, &pools, &fingerprint(b"v1"), &TrackerSnapshot::default())
            .await
            .unwrap();
        cache.finalize_previous_inputs().await.unwrap();
        assert!(cache.read_previous_record().await.unwrap().is_some());

        // A new save immediately invalidates the previous record, before
        // finalization.
        cache
            .save(&graph, &pools, &fingerprint(b"v2"), &TrackerSnapshot::default())
            .await
            .unwrap();
        pretty_assert_eq!(cache.read_previous_record().await.unwrap(), None);
    }

    #[tokio::test]
    async fn finalize_without_staging_errors() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        assert!(cache.finalize_previous_inputs().await.is_err());
    }

    #[tokio::test]
    async fn corrupt_artifact_is_not_loadable() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());
        let pools = InternPools::new();
        let graph = build_graph(&pools);
        let fingerprint = fingerprint(b"v1");

        cache
            .save(&graph, &pools, &fingerprint, &TrackerSnapshot::default())
            .await
            .unwrap();
        cache.finalize_previous_inputs().await.unwrap();

        // Overwrite an artifact with bytes from a different cohort.
        fs::write(
            cache.engine_cache_dir().join("PipGraph"),
            b"not a graph at all",
        )
        .await
        .unwrap();

        assert!(cache.try_load_local(&fingerprint.exact).await.unwrap().is_none());
    }
}
