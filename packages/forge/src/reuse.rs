//! The graph-reuse decision.
//!
//! Given the current fingerprint, the local engine cache, and the shared
//! content store, decide whether a previously built graph can be reused:
//! fully (nothing relevant changed), partially (only non-structural values
//! changed, the frontend re-evaluates against the same schema), or not at
//! all.
//!
//! The decision never trusts a candidate graph on fingerprint equality
//! alone when tracked inputs are available: the input tracker re-verifies
//! every recorded observation first, so a reused graph is sound, not merely
//! plausible.

use std::time::Duration;

use color_eyre::Result;
use derive_more::Display;
use ferry::v1::{Digest, GraphDescriptor};
use tracing::{debug, info, instrument, warn};

use crate::{
    cache::{GraphCache, LoadedGraph, StoreBackend},
    content_table::FileContentTable,
    fingerprint::GraphFingerprint,
    graph::MissReason,
    track::{
        ChangedInput, CurrentEnvironment, InputTracker, MatchOutcome, MismatchReason,
        journal::{ChangeJournal, JournalCheckpoint},
    },
};

/// Where a reused graph came from.
#[derive(Debug, Display)]
pub enum ReuseSource {
    #[display("engine cache")]
    LocalCache,
    #[display("shared store")]
    SharedStore { descriptor: GraphDescriptor },
}

/// The outcome of the reuse decision.
#[derive(Debug)]
pub enum ReuseDecision {
    /// The prior graph is loadable and every tracked input is unchanged.
    FullReuse {
        loaded: LoadedGraph,
        source: ReuseSource,
    },
    /// A prior graph with the same schema is loadable; only the listed
    /// non-structural inputs changed. The frontend decides what to
    /// re-evaluate against it.
    PartialReuse {
        loaded: LoadedGraph,
        changed: Vec<ChangedInput>,
    },
    /// Rebuild from scratch.
    Miss(MissReason),
}

impl ReuseDecision {
    /// A short label for logs and the fingerprint history.
    pub fn label(&self) -> String {
        match self {
            Self::FullReuse { source, .. } => format!("full-reuse ({source})"),
            Self::PartialReuse { changed, .. } => {
                format!("partial-reuse ({} changed inputs)", changed.len())
            }
            Self::Miss(reason) => format!("miss ({reason})"),
        }
    }
}

/// Knobs of the reuse decision.
#[derive(Debug, Clone)]
pub struct ReuseOptions {
    /// Whether a schema-compatible graph may be reused when only env-var or
    /// mount values changed.
    pub enable_partial_reuse: bool,
    /// Whether to probe the shared store by compatible fingerprint after an
    /// exact miss.
    pub probe_compatible: bool,
    /// When set, skip the decision entirely and load exactly this graph.
    pub explicit_graph: Option<Digest>,
    /// Bound on the journal scan during input verification.
    pub journal_timeout: Duration,
}

impl Default for ReuseOptions {
    fn default() -> Self {
        Self {
            enable_partial_reuse: true,
            probe_compatible: true,
            explicit_graph: None,
            journal_timeout: Duration::from_secs(30),
        }
    }
}

/// Decide whether a prior graph can be reused for this build.
#[instrument(skip_all, fields(fingerprint = %fingerprint.exact))]
pub async fn decide<S: StoreBackend, J: ChangeJournal>(
    cache: &GraphCache<S>,
    fingerprint: &GraphFingerprint,
    journal: &J,
    checkpoint: Option<JournalCheckpoint>,
    environment: &CurrentEnvironment,
    content_table: &FileContentTable,
    options: &ReuseOptions,
) -> Result<ReuseDecision> {
    // An explicitly requested graph bypasses fingerprinting entirely.
    if let Some(requested) = &options.explicit_graph {
        debug!(%requested, "explicit graph requested; skipping reuse decision");
        if let Some(loaded) = cache.try_load_local(requested).await? {
            return Ok(ReuseDecision::FullReuse {
                loaded,
                source: ReuseSource::LocalCache,
            });
        }
        return match cache.try_fetch_remote(requested).await? {
            Some((descriptor, loaded)) => Ok(ReuseDecision::FullReuse {
                loaded,
                source: ReuseSource::SharedStore { descriptor },
            }),
            None => Ok(ReuseDecision::Miss(MissReason::NotInStore)),
        };
    }

    let mut miss_reason = MissReason::NoPreviousInputs;

    // Local path: verify the previous run's observations.
    if let Some(record) = cache.read_previous_record().await? {
        let outcome = InputTracker::check_match(
            &record.snapshot,
            journal,
            checkpoint,
            environment,
            content_table,
            options.journal_timeout,
        )
        .await?;

        let exact_matches = record.fingerprint.exact == fingerprint.exact;
        let compatible_matches = record.fingerprint.compatible == fingerprint.compatible;

        match outcome {
            MatchOutcome::Match if exact_matches => {
                match cache.try_load_local(&fingerprint.exact).await? {
                    Some(loaded) => {
                        info!("previous inputs match; reusing local graph");
                        return Ok(ReuseDecision::FullReuse {
                            loaded,
                            source: ReuseSource::LocalCache,
                        });
                    }
                    None => {
                        warn!("previous inputs match but local graph failed to load");
                        miss_reason =
                            MissReason::LoadFailed("local artifact cohort unusable".to_string());
                    }
                }
            }
            MatchOutcome::Match => {
                // Tracked inputs are unchanged but the fingerprint moved:
                // something outside the tracker (engine version, filter,
                // commit id) differs. The schema may still be reusable.
                if options.enable_partial_reuse && compatible_matches {
                    if let Some(loaded) =
                        cache.try_load_local(&record.fingerprint.exact).await?
                    {
                        info!("schema-compatible local graph; partial reuse");
                        return Ok(ReuseDecision::PartialReuse {
                            loaded,
                            changed: Vec::new(),
                        });
                    }
                }
                miss_reason = MissReason::InputsChanged(
                    "graph identity changed outside tracked inputs".to_string(),
                );
            }
            MatchOutcome::PartialMatch(changed) => {
                if options.enable_partial_reuse && (exact_matches || compatible_matches) {
                    if let Some(loaded) =
                        cache.try_load_local(&record.fingerprint.exact).await?
                    {
                        info!(
                            changed = changed.len(),
                            "non-structural inputs changed; partial reuse",
                        );
                        return Ok(ReuseDecision::PartialReuse { loaded, changed });
                    }
                    miss_reason =
                        MissReason::LoadFailed("local artifact cohort unusable".to_string());
                } else {
                    miss_reason = MissReason::InputsChanged(
                        changed
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join(", "),
                    );
                }
            }
            MatchOutcome::Mismatch(MismatchReason::InputsChanged(what)) => {
                debug!(%what, "previous inputs changed");
                miss_reason = MissReason::InputsChanged(what);
            }
            MatchOutcome::Mismatch(MismatchReason::UnableToDetect(what)) => {
                // Detection failure downgrades the decision; it is not a
                // build failure.
                warn!(%what, "input change detection failed; downgrading to miss");
                miss_reason = MissReason::UnableToDetect(what);
            }
        }
    }

    // Shared-store path: exact fingerprint.
    if let Some((descriptor, loaded)) = cache.try_fetch_remote(&fingerprint.exact).await? {
        info!("exact fingerprint hit in shared store");
        return Ok(ReuseDecision::FullReuse {
            loaded,
            source: ReuseSource::SharedStore { descriptor },
        });
    }

    // Shared-store path: compatible candidates, each of which must still
    // pass full input verification before being trusted.
    if options.probe_compatible && options.enable_partial_reuse {
        let candidates = cache
            .store()
            .probe_graph(&fingerprint.compatible, ferry::v1::store::ProbeKind::Compatible)
            .await?;
        for descriptor in candidates {
            if descriptor.exact_fingerprint == fingerprint.exact {
                continue; // already probed above
            }
            let Some(loaded) = cache.materialize_and_load(&descriptor).await? else {
                continue;
            };
            let outcome = InputTracker::check_match(
                &loaded.snapshot,
                journal,
                None,
                environment,
                content_table,
                options.journal_timeout,
            )
            .await?;
            match outcome {
                MatchOutcome::Match => {
                    info!("compatible candidate passed full input verification");
                    return Ok(ReuseDecision::FullReuse {
                        loaded,
                        source: ReuseSource::SharedStore { descriptor },
                    });
                }
                MatchOutcome::PartialMatch(changed) => {
                    info!(
                        changed = changed.len(),
                        "compatible candidate reusable with changed values",
                    );
                    return Ok(ReuseDecision::PartialReuse { loaded, changed });
                }
                MatchOutcome::Mismatch(reason) => {
                    debug!(%reason, "compatible candidate rejected");
                }
            }
        }
    }

    Ok(ReuseDecision::Miss(miss_reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::FsStore,
        content_table::{DEFAULT_TTL, FileContentTable},
        fingerprint::{FingerprintInputs, GraphFingerprinter},
        fs,
        graph::{PipGraph, PipGraphBuilder, PipKind},
        intern::InternPools,
        track::journal::NullJournal,
    };
    use pretty_assertions::assert_eq as pretty_assert_eq;
    use std::{collections::BTreeMap, path::Path, sync::Arc};

    struct Harness {
        cache: GraphCache<FsStore>,
        content_table: FileContentTable,
        environment: CurrentEnvironment,
    }

    fn graph(pools: &InternPools) -> PipGraph {
        let mut builder = PipGraphBuilder::new();
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

    fn fingerprint_for(config: &[u8], env: &[(&str, &str)]) -> GraphFingerprint {
        let inputs = FingerprintInputs {
            config_files: [(
                std::path::PathBuf::from("config.toml"),
                Digest::from_buffer(config),
            )]
            .into(),
            env_vars: env
                .iter()
                .map(|(name, value)| (name.to_string(), Some(value.to_string())))
                .collect(),
            engine_version: Digest::from_buffer(b"forge-test"),
            ..Default::default()
        };
        GraphFingerprinter::new().compute(&inputs)
    }

    fn harness(dir: &Path, env: &[(&str, &str)]) -> Harness {
        Harness {
            cache: GraphCache::new(dir.join("engine-cache"), FsStore::new(dir.join("store"))),
            content_table: FileContentTable::new(DEFAULT_TTL),
            environment: CurrentEnvironment::with_env(
                env.iter()
                    .map(|(name, value)| (name.to_string(), value.to_string()))
                    .collect(),
                BTreeMap::new(),
            ),
        }
    }

    async fn decide_with(harness: &Harness, fingerprint: &GraphFingerprint) -> ReuseDecision {
        decide(
            &harness.cache,
            fingerprint,
            &NullJournal,
            None,
            &harness.environment,
            &harness.content_table,
            &ReuseOptions::default(),
        )
        .await
        .unwrap()
    }

    /// Save a graph whose tracker observed `env` and commit it.
    async fn seed(
        harness: &Harness,
        fingerprint: &GraphFingerprint,
        env: &[(&str, &str)],
    ) -> PipGraph {
        let pools = InternPools::new();
        let graph = graph(&pools);
        let tracker = InputTracker::new(
            Arc::new(FileContentTable::new(DEFAULT_TTL)),
            Default::default(),
            None,
        );
        for (name, value) in env {
            tracker.record_env_var(*name, Some(value.to_string()));
        }
        harness
            .cache
            .save(&graph, &pools, fingerprint, &tracker.snapshot())
            .await
            .unwrap();
        harness.cache.finalize_previous_inputs().await.unwrap();
        graph
    }

    #[tokio::test]
    async fn fresh_workspace_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let harness = harness(dir.path(), &[]);
        let decision = decide_with(&harness, &fingerprint_for(b"config", &[])).await;
        assert!(matches!(
            decision,
            ReuseDecision::Miss(MissReason::NoPreviousInputs),
        ));
    }

    #[tokio::test]
    async fn unchanged_build_reuses_local_graph() {
        let dir = tempfile::tempdir().unwrap();
        let env = [("CC", "gcc")];
        let harness = harness(dir.path(), &env);
        let fingerprint = fingerprint_for(b"config", &env);
        let saved = seed(&harness, &fingerprint, &env).await;

        match decide_with(&harness, &fingerprint).await {
            ReuseDecision::FullReuse { loaded, source } => {
                pretty_assert_eq!(loaded.graph, saved);
                assert!(matches!(source, ReuseSource::LocalCache));
            }
            other => panic!("expected full reuse, got {}", other.label()),
        }
    }

    #[tokio::test]
    async fn changed_tracked_file_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let harness = harness(dir.path(), &[]);

        // Seed with a tracker that observed a real config file; the
        // fingerprint is derived from the file content, as the driver
        // derives it.
        let input = dir.path().join("in.txt");
        fs::write(&input, b"first").await.unwrap();
        let recorded_fingerprint = fingerprint_for(b"first", &[]);
        let pools = InternPools::new();
        let built = graph(&pools);
        let tracker = InputTracker::new(
            Arc::new(FileContentTable::new(DEFAULT_TTL)),
            Default::default(),
            None,
        );
        tracker.register_file_access(&input).await.unwrap();
        tracker.ensure_all_hashed().await.unwrap();
        harness
            .cache
            .save(&built, &pools, &recorded_fingerprint, &tracker.snapshot())
            .await
            .unwrap();
        harness.cache.finalize_previous_inputs().await.unwrap();

        fs::write(&input, b"changed content").await.unwrap();
        let decision = decide_with(&harness, &fingerprint_for(b"changed content", &[])).await;
        assert!(matches!(
            decision,
            ReuseDecision::Miss(MissReason::InputsChanged(_)),
        ));
    }

    #[tokio::test]
    async fn env_value_change_partially_reuses() {
        let dir = tempfile::tempdir().unwrap();
        let harness = harness(dir.path(), &[("CC", "clang")]);
        let recorded_fingerprint = fingerprint_for(b"config", &[("CC", "gcc")]);
        seed(&harness, &recorded_fingerprint, &[("CC", "gcc")]).await;

        let current_fingerprint = fingerprint_for(b"config", &[("CC", "clang")]);
        match decide_with(&harness, &current_fingerprint).await {
            ReuseDecision::PartialReuse { changed, .. } => {
                pretty_assert_eq!(changed.len(), 1);
            }
            other => panic!("expected partial reuse, got {}", other.label()),
        }
    }

    #[tokio::test]
    async fn partial_reuse_can_be_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let harness = harness(dir.path(), &[("CC", "clang")]);
        let recorded_fingerprint = fingerprint_for(b"config", &[("CC", "gcc")]);
        seed(&harness, &recorded_fingerprint, &[("CC", "gcc")]).await;

        let options = ReuseOptions {
            enable_partial_reuse: false,
            probe_compatible: false,
            ..Default::default()
        };
        let decision = decide(
            &harness.cache,
            &fingerprint_for(b"config", &[("CC", "clang")]),
            &NullJournal,
            None,
            &harness.environment,
            &harness.content_table,
            &options,
        )
        .await
        .unwrap();
        assert!(matches!(decision, ReuseDecision::Miss(_)));
    }

    #[tokio::test]
    async fn fresh_machine_hits_shared_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path().join("store"));
        let fingerprint = fingerprint_for(b"config", &[]);

        // Publisher machine saves and publishes.
        let publisher = GraphCache::new(dir.path().join("publisher"), store.clone());
        let pools = InternPools::new();
        let built = graph(&pools);
        publisher
            .save(&built, &pools, &fingerprint, &Default::default())
            .await
            .unwrap();

        // Fresh machine: local miss, remote hit.
        let harness = Harness {
            cache: GraphCache::new(dir.path().join("fresh"), store),
            content_table: FileContentTable::new(DEFAULT_TTL),
            environment: CurrentEnvironment::default(),
        };
        match decide_with(&harness, &fingerprint).await {
            ReuseDecision::FullReuse { loaded, source } => {
                pretty_assert_eq!(loaded.graph, built);
                assert!(matches!(source, ReuseSource::SharedStore { .. }));
            }
            other => panic!("expected full reuse, got {}", other.label()),
        }
    }

    #[tokio::test]
    async fn explicit_graph_skips_decision() {
        let dir = tempfile::tempdir().unwrap();
        let env = [("CC", "gcc")];
        let harness = harness(dir.path(), &env);
        let fingerprint = fingerprint_for(b"config", &env);
        seed(&harness, &fingerprint, &env).await;

        let options = ReuseOptions {
            explicit_graph: Some(fingerprint.exact.clone()),
            ..Default::default()
        };
        // A deliberately different current fingerprint: the explicit request
        // wins regardless.
        let decision = decide(
            &harness.cache,
            &fingerprint_for(b"other config", &[]),
            &NullJournal,
            None,
            &harness.environment,
            &harness.content_table,
            &options,
        )
        .await
        .unwrap();
        assert!(matches!(decision, ReuseDecision::FullReuse { .. }));
    }

    #[tokio::test]
    async fn compatible_candidate_verified_before_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path().join("store"));

        // Publisher's build observed CC=gcc.
        let publisher = GraphCache::new(dir.path().join("publisher"), store.clone());
        let pools = InternPools::new();
        let built = graph(&pools);
        let recorded_fingerprint = fingerprint_for(b"config", &[("CC", "gcc")]);
        let tracker = InputTracker::new(
            Arc::new(FileContentTable::new(DEFAULT_TTL)),
            Default::default(),
            None,
        );
        tracker.record_env_var("CC", Some("gcc".to_string()));
        publisher
            .save(&built, &pools, &recorded_fingerprint, &tracker.snapshot())
            .await
            .unwrap();

        // Fresh machine with CC=clang: exact miss, compatible candidate
        // passes verification with one changed value.
        let harness = Harness {
            cache: GraphCache::new(dir.path().join("fresh"), store),
            content_table: FileContentTable::new(DEFAULT_TTL),
            environment: CurrentEnvironment::with_env(
                [("CC".to_string(), "clang".to_string())].into(),
                BTreeMap::new(),
            ),
        };
        let current_fingerprint = fingerprint_for(b"config", &[("CC", "clang")]);
        match decide_with(&harness, &current_fingerprint).await {
            ReuseDecision::PartialReuse { changed, .. } => {
                pretty_assert_eq!(changed.len(), 1);
            }
            other => panic!("expected partial reuse, got {}", other.label()),
        }
    }
}
