//! End-to-end single-machine scenarios, driven through the engine driver
//! with the manifest frontend and a filesystem content store.

use color_eyre::Result;
use ferry::v1::{Digest, GraphDescriptor, store::ProbeKind};
use forge::{
    cache::{FsStore, GraphCache, PREVIOUS_INPUTS_FILE, PREVIOUS_INPUTS_STAGING_FILE, StoreBackend},
    config::StopAfter,
    driver::{BuildOutcome, EngineDriver, FailureKind},
    fs,
    intern::InternPools,
    track::TrackerSnapshot,
};
use pretty_assertions::assert_eq as pretty_assert_eq;
use tokio_util::sync::CancellationToken;

use crate::{COPY_MANIFEST, TestWorkspace, workspace, workspace_sharing_store, write_input};

async fn run_build(ws: &TestWorkspace) -> BuildOutcome {
    EngineDriver::local(ws.config(), ws.store.clone(), ws.frontend())
        .run()
        .await
        .expect("driver run")
}

#[test_log::test(tokio::test)]
async fn clean_build_then_full_reuse() {
    let ws = workspace(COPY_MANIFEST).await;
    write_input(&ws.root, "input content").await;

    // First run: miss, graph constructed, pip executed, output exists,
    // previous inputs written.
    let first = run_build(&ws).await;
    assert!(first.success, "failures: {:?}", first.failures);
    assert!(first.decision.as_deref().unwrap().starts_with("miss"));
    pretty_assert_eq!(first.execution.unwrap().executed, 1);
    pretty_assert_eq!(
        fs::must_read_buffered(ws.root.join("out.txt")).await.unwrap(),
        b"input content",
    );
    assert!(fs::exists(ws.engine_cache().join(PREVIOUS_INPUTS_FILE)).await);

    // Second run with no changes: full reuse, no construction, no
    // execution.
    let second = run_build(&ws).await;
    assert!(second.success);
    assert!(
        second.decision.as_deref().unwrap().starts_with("full-reuse"),
        "decision was {:?}",
        second.decision,
    );
    pretty_assert_eq!(second.execution.unwrap().executed, 0);
}

#[tokio::test]
async fn changed_input_reuses_graph_but_reruns_pip() {
    let ws = workspace(COPY_MANIFEST).await;
    write_input(&ws.root, "first").await;
    run_build(&ws).await;

    // The pip input changes, but nothing the graph's construction read
    // did: the graph is fully reused and exactly the affected pip re-runs.
    write_input(&ws.root, "second, longer content").await;
    let second = run_build(&ws).await;
    assert!(second.success);
    assert!(second.decision.as_deref().unwrap().starts_with("full-reuse"));
    pretty_assert_eq!(second.execution.unwrap().executed, 1);
    pretty_assert_eq!(
        fs::must_read_buffered(ws.root.join("out.txt")).await.unwrap(),
        b"second, longer content",
    );
}

#[tokio::test]
async fn changed_configuration_env_var_misses() {
    let ws = workspace(COPY_MANIFEST).await;
    write_input(&ws.root, "input content").await;

    let var = "FORGE_IT_SCENARIO_S3_VAR";
    // SAFETY: the variable is unique to this test.
    unsafe { std::env::set_var(var, "first") };

    let mut config = ws.config();
    config.referenced_env_vars = vec![var.to_string()];
    // S3 wants a rebuild on configuration change, so schema-level reuse is
    // off for this build.
    config.enable_partial_reuse = false;
    config.probe_compatible = false;

    let first = EngineDriver::local(config.clone(), ws.store.clone(), ws.frontend())
        .run()
        .await
        .unwrap();
    assert!(first.success);

    unsafe { std::env::set_var(var, "second") };
    let second = EngineDriver::local(config, ws.store.clone(), ws.frontend())
        .run()
        .await
        .unwrap();
    assert!(second.success);
    assert!(
        second.decision.as_deref().unwrap().starts_with("miss"),
        "decision was {:?}",
        second.decision,
    );
}

#[tokio::test]
async fn fresh_machine_hits_shared_store() {
    let publisher = workspace(COPY_MANIFEST).await;
    write_input(&publisher.root, "input content").await;
    let first = run_build(&publisher).await;
    assert!(first.success);

    // A fresh machine with the same manifest and the same shared store:
    // local miss, shared-store hit, no frontend work.
    let fresh = workspace_sharing_store(COPY_MANIFEST, &publisher.store).await;
    write_input(&fresh.root, "input content").await;
    let outcome = run_build(&fresh).await;
    assert!(outcome.success, "failures: {:?}", outcome.failures);
    assert!(
        outcome
            .decision
            .as_deref()
            .unwrap()
            .contains("shared store"),
        "decision was {:?}",
        outcome.decision,
    );
    // The fetched graph becomes this machine's previous run.
    assert!(fs::exists(fresh.engine_cache().join(PREVIOUS_INPUTS_FILE)).await);
}

#[tokio::test]
async fn interrupted_save_leaves_no_previous_inputs() {
    let ws = workspace(COPY_MANIFEST).await;
    write_input(&ws.root, "input content").await;

    // Simulate a crash after the graph files are written but before the
    // previous-inputs rename: a save that is never finalized.
    let cache = GraphCache::new(ws.engine_cache(), ws.store.clone());
    let pools = InternPools::new();
    let graph = {
        let mut builder = forge::graph::PipGraphBuilder::new();
        builder
            .add_pip(
                pools.symbols.intern("noop"),
                forge::graph::PipKind::SealDirectory {
                    root: pools.paths.intern("."),
                    members: vec![],
                },
                vec![],
                vec![],
                Default::default(),
                vec![],
            )
            .unwrap();
        builder.build()
    };
    let fingerprint = forge::fingerprint::GraphFingerprinter::new()
        .compute(&forge::fingerprint::FingerprintInputs::default());
    cache
        .save(&graph, &pools, &fingerprint, &TrackerSnapshot::default())
        .await
        .unwrap();

    assert!(fs::exists(ws.engine_cache().join(PREVIOUS_INPUTS_STAGING_FILE)).await);
    assert!(!fs::exists(ws.engine_cache().join(PREVIOUS_INPUTS_FILE)).await);

    // The next build sees no previous inputs and rebuilds cleanly.
    let outcome = run_build(&ws).await;
    assert!(outcome.success);
    assert!(outcome.decision.as_deref().unwrap().starts_with("miss"));
}

#[tokio::test]
async fn clean_only_stops_after_schedule() {
    let ws = workspace(COPY_MANIFEST).await;
    write_input(&ws.root, "input content").await;

    let mut config = ws.config();
    config.stop_after = StopAfter::Schedule;
    let outcome = EngineDriver::local(config, ws.store.clone(), ws.frontend())
        .run()
        .await
        .unwrap();

    assert!(outcome.success);
    // The graph was serialized and promoted, but nothing executed.
    assert!(outcome.execution.is_none());
    assert!(!fs::exists(ws.root.join("out.txt")).await);
    assert!(fs::exists(ws.engine_cache().join(PREVIOUS_INPUTS_FILE)).await);
}

/// Delegates to a real store but fires the build's cancellation token the
/// moment artifact publication starts, so the signal lands while the
/// Schedule-phase save is in flight.
#[derive(Clone)]
struct CancellingStore {
    inner: FsStore,
    cancel: CancellationToken,
}

impl StoreBackend for CancellingStore {
    async fn register_graph(&self, descriptor: &GraphDescriptor) -> Result<()> {
        self.inner.register_graph(descriptor).await
    }

    async fn probe_graph(
        &self,
        fingerprint: &Digest,
        kind: ProbeKind,
    ) -> Result<Vec<GraphDescriptor>> {
        self.inner.probe_graph(fingerprint, kind).await
    }

    async fn blob_store(&self, digest: &Digest, content: &[u8]) -> Result<bool> {
        self.cancel.cancel();
        self.inner.blob_store(digest, content).await
    }

    async fn blob_read(&self, digest: &Digest) -> Result<Option<Vec<u8>>> {
        self.inner.blob_read(digest).await
    }

    async fn blob_exists(&self, digest: &Digest) -> Result<bool> {
        self.inner.blob_exists(digest).await
    }
}

#[tokio::test]
async fn cancellation_mid_save_is_not_promoted() {
    let ws = workspace(COPY_MANIFEST).await;
    write_input(&ws.root, "input content").await;

    let cancel = CancellationToken::new();
    let store = CancellingStore {
        inner: ws.store.clone(),
        cancel: cancel.clone(),
    };
    let outcome = EngineDriver::local(ws.config(), store, ws.frontend())
        .with_cancellation(cancel)
        .run()
        .await
        .unwrap();

    assert!(!outcome.success);
    assert!(outcome.cancelled);
    // The graph was serialized and staged, but the cancellation that
    // arrived mid-save blocked promotion.
    assert!(fs::exists(ws.engine_cache().join(PREVIOUS_INPUTS_STAGING_FILE)).await);
    assert!(!fs::exists(ws.engine_cache().join(PREVIOUS_INPUTS_FILE)).await);

    // The next build finds no previous inputs and recovers cleanly (the
    // published artifacts make it a shared-store hit rather than a full
    // rebuild).
    let retry = run_build(&ws).await;
    assert!(retry.success, "failures: {:?}", retry.failures);
    pretty_assert_eq!(
        fs::must_read_buffered(ws.root.join("out.txt")).await.unwrap(),
        b"input content",
    );
    assert!(fs::exists(ws.engine_cache().join(PREVIOUS_INPUTS_FILE)).await);
}

#[tokio::test]
async fn cancellation_is_clean() {
    let ws = workspace(COPY_MANIFEST).await;
    write_input(&ws.root, "input content").await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let outcome = EngineDriver::local(ws.config(), ws.store.clone(), ws.frontend())
        .with_cancellation(cancel)
        .run()
        .await
        .unwrap();

    assert!(!outcome.success);
    assert!(outcome.cancelled);
    assert!(
        outcome
            .failures
            .iter()
            .any(|failure| failure.kind == FailureKind::Cancelled),
    );
    // No finalized previous inputs, and the locks are free for the next
    // build, which succeeds.
    assert!(!fs::exists(ws.engine_cache().join(PREVIOUS_INPUTS_FILE)).await);
    let retry = run_build(&ws).await;
    assert!(retry.success);
}

#[tokio::test]
async fn missing_configuration_fails_before_any_work() {
    let ws = workspace(COPY_MANIFEST).await;
    let mut config = ws.config();
    config.config_files = vec![];

    let outcome = EngineDriver::local(config, ws.store.clone(), ws.frontend())
        .run()
        .await
        .unwrap();
    assert!(!outcome.success);
    pretty_assert_eq!(outcome.exit_code(), 1);
    assert!(
        outcome
            .failures
            .iter()
            .any(|failure| failure.kind == FailureKind::ConfigurationInvalid),
    );
}
