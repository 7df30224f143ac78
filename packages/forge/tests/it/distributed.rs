//! Distributed scenarios: a real orchestrator HTTP service, a real worker
//! agent, and a shared filesystem content store.

use std::time::Duration;

use ferry::v1::Digest;
use forge::{
    cache::{GraphCache, PREVIOUS_INPUTS_FILE},
    distrib::{DistributionRole, Orchestrator, OrchestratorConfig, WorkerConfig, WorkerState},
    driver::{EngineDriver, FailureKind, run_worker},
    exec::LocalExecutor,
    fs,
};
use pretty_assertions::assert_eq as pretty_assert_eq;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{COPY_MANIFEST, workspace, workspace_sharing_store, write_input};

async fn serve(
    orchestrator: &Orchestrator,
    listener: tokio::net::TcpListener,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let router = orchestrator.router();
    tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .expect("serve orchestrator");
    })
}

#[test_log::test(tokio::test)]
async fn orchestrator_dispatches_to_worker() {
    let ws = workspace(COPY_MANIFEST).await;
    write_input(&ws.root, "distributed content").await;
    let manifest_content = fs::must_read_buffered(ws.manifest_path()).await.unwrap();
    let config_digest = Digest::from_buffer(&manifest_content);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = Url::parse(&format!("http://{addr}/")).unwrap();

    let orchestrator = Orchestrator::new(OrchestratorConfig {
        url: url.clone(),
        config_digest: config_digest.clone(),
        required_workers: 1,
        low_workers_warning_threshold: 1,
        attach_timeout: Duration::from_secs(20),
        heartbeat_timeout: Duration::from_secs(10),
    });
    let shutdown = CancellationToken::new();
    let server = serve(&orchestrator, listener, shutdown.clone()).await;

    // The worker has its own checkout of the sources and shares the store.
    let worker_ws = workspace_sharing_store(COPY_MANIFEST, &ws.store).await;
    write_input(&worker_ws.root, "distributed content").await;
    let worker = {
        let config = WorkerConfig {
            orchestrator_url: url,
            config_digest,
            attach_timeout: Duration::from_secs(20),
            poll_interval: Duration::from_millis(25),
            ..Default::default()
        };
        let store = worker_ws.store.clone();
        let executor = LocalExecutor::new(&worker_ws.root);
        let engine_cache = worker_ws.engine_cache();
        let root = worker_ws.root.clone();
        tokio::spawn(run_worker(
            config,
            engine_cache,
            store,
            executor,
            root,
            CancellationToken::new(),
        ))
    };

    let mut config = ws.config();
    config.role = DistributionRole::Orchestrator;
    let outcome = EngineDriver::local(config, ws.store.clone(), ws.frontend())
        .with_orchestrator(orchestrator)
        .run()
        .await
        .expect("driver run");

    assert!(outcome.success, "failures: {:?}", outcome.failures);
    pretty_assert_eq!(outcome.execution.unwrap().executed, 1);

    // The worker produced the output in its workspace and the orchestrator
    // materialized it from the store into its own.
    pretty_assert_eq!(
        fs::must_read_buffered(worker_ws.root.join("out.txt")).await.unwrap(),
        b"distributed content",
    );
    pretty_assert_eq!(
        fs::must_read_buffered(ws.root.join("out.txt")).await.unwrap(),
        b"distributed content",
    );

    // The worker drains to a clean exit once released.
    let state = tokio::time::timeout(Duration::from_secs(30), worker)
        .await
        .expect("worker finished")
        .expect("worker task")
        .expect("worker run");
    pretty_assert_eq!(state, WorkerState::Exited);

    shutdown.cancel();
    let _ = server.await;
}

#[tokio::test]
async fn attach_timeout_fails_the_orchestrator_build() {
    let ws = workspace(COPY_MANIFEST).await;
    write_input(&ws.root, "input content").await;

    // No worker ever attaches, and the attach window is short.
    let orchestrator = Orchestrator::new(OrchestratorConfig {
        config_digest: Digest::from_buffer(b"irrelevant"),
        required_workers: 1,
        low_workers_warning_threshold: 1,
        attach_timeout: Duration::from_millis(200),
        ..Default::default()
    });

    let mut config = ws.config();
    config.role = DistributionRole::Orchestrator;
    let outcome = EngineDriver::local(config, ws.store.clone(), ws.frontend())
        .with_orchestrator(orchestrator)
        .run()
        .await
        .expect("driver run");

    assert!(!outcome.success);
    assert!(
        outcome
            .failures
            .iter()
            .any(|failure| failure.kind == FailureKind::DistributionFatal),
        "failures: {:?}",
        outcome.failures,
    );

    // The build failed before promotion: the graph was serialized and
    // staged, but previous inputs were never made canonical.
    assert!(!fs::exists(ws.engine_cache().join(PREVIOUS_INPUTS_FILE)).await);
    let cache = GraphCache::new(ws.engine_cache(), ws.store.clone());
    assert!(cache.read_previous_record().await.unwrap().is_none());
}

#[tokio::test]
async fn worker_without_orchestrator_fails_before_ready() {
    // Nothing is listening here; the worker should warn and exit as
    // FailedBeforeReady within its attach budget.
    let worker_ws = workspace(COPY_MANIFEST).await;
    let config = WorkerConfig {
        orchestrator_url: Url::parse("http://127.0.0.1:9/").unwrap(),
        attach_timeout: Duration::from_millis(500),
        poll_interval: Duration::from_millis(25),
        retry: forge::distrib::RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(20),
        },
        ..Default::default()
    };
    let state = run_worker(
        config,
        worker_ws.engine_cache(),
        worker_ws.store.clone(),
        LocalExecutor::new(&worker_ws.root),
        worker_ws.root.clone(),
        CancellationToken::new(),
    )
    .await
    .expect("worker run");
    pretty_assert_eq!(state, WorkerState::FailedBeforeReady);
}
