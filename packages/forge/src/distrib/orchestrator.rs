//! The orchestrator side of a distributed build.
//!
//! The orchestrator owns the pip graph and dispatches pips; workers attach
//! over HTTP and initiate every exchange (attach, work poll, result,
//! heartbeat, bye). Dispatch hands each pip a per-worker monotone sequence
//! number; a result whose sequence number is not outstanding is answered
//! with a conflict and dropped, which is what makes retried dispatches and
//! late replies safe.
//!
//! Graph publication is the caller's two-step: make the descriptor durable
//! in the shared store, then [`Orchestrator::publish_graph`]. Dispatch
//! refuses to run until a graph is published.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use color_eyre::{
    Result,
    eyre::{bail, eyre},
};
use dashmap::DashMap;
use derive_more::Debug;
use ferry::v1::{
    Digest, GraphDescriptor,
    distrib::{
        AttachRequest, AttachResponse, Bye, ExecutePip, Heartbeat, MaterializeInput,
        OrchestratorInfo, PipId, PipResult, PipRunStatus, SequenceNumber, WorkPollResponse,
        WorkerId,
    },
};
use tracing::{debug, info, instrument, warn};
use url::Url;
use uuid::Uuid;

/// How a worker failure should be handled.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum WorkerFailureKind {
    /// Probably a blip; keep the worker and retry.
    NetworkTransient,
    /// The worker is gone; reassign its pips and continue.
    WorkerExit,
    /// The build cannot continue.
    Fatal,
}

/// Orchestrator-side configuration.
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Base URL workers should use for all calls after attach.
    pub url: Url,
    /// Digest of the build configuration; attaching workers must match.
    pub config_digest: Digest,
    /// Workers the build wants before dispatching.
    pub required_workers: usize,
    /// Below this attached-worker count the build proceeds degraded with a
    /// warning rather than failing.
    pub low_workers_warning_threshold: usize,
    /// How long to wait for workers to attach.
    pub attach_timeout: Duration,
    /// A worker silent for longer than this is considered failed.
    pub heartbeat_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            url: Url::parse("http://127.0.0.1:0/").expect("static url"),
            config_digest: Digest::from_buffer(b""),
            required_workers: 1,
            low_workers_warning_threshold: 1,
            attach_timeout: Duration::from_secs(60),
            heartbeat_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct WorkerEntry {
    capacity: u32,
    next_seq: SequenceNumber,
    /// Dispatched but not yet handed to the worker.
    queue: VecDeque<ExecutePip>,
    /// Handed to the worker, awaiting a result, keyed by sequence number.
    inflight: HashMap<SequenceNumber, PipId>,
    last_seen: Instant,
    reported_load: f64,
}

impl WorkerEntry {
    fn outstanding(&self) -> usize {
        self.queue.len() + self.inflight.len()
    }
}

#[derive(Debug)]
struct Inner {
    config: OrchestratorConfig,
    session_id: Uuid,
    #[debug(skip)]
    graph: RwLock<Option<GraphDescriptor>>,
    workers: DashMap<WorkerId, WorkerEntry>,
    #[debug(skip)]
    results_tx: flume::Sender<(WorkerId, PipResult)>,
    #[debug(skip)]
    results_rx: flume::Receiver<(WorkerId, PipResult)>,
    draining: AtomicBool,
}

/// The orchestrator's shared state and HTTP surface.
#[derive(Clone, Debug)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        let (results_tx, results_rx) = flume::unbounded();
        Self {
            inner: Arc::new(Inner {
                config,
                session_id: Uuid::new_v4(),
                graph: RwLock::new(None),
                workers: DashMap::new(),
                results_tx,
                results_rx,
                draining: AtomicBool::new(false),
            }),
        }
    }

    /// The HTTP router serving the worker-facing API.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/v1/health", get(health))
            .route("/api/v1/attach", post(attach))
            .route("/api/v1/work/{worker_id}", get(poll_work))
            .route("/api/v1/result/{worker_id}", post(post_result))
            .route("/api/v1/heartbeat/{worker_id}", post(heartbeat))
            .route("/api/v1/bye/{worker_id}", post(bye))
            .layer(tower_http::trace::TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    fn info(&self) -> OrchestratorInfo {
        OrchestratorInfo::builder()
            .url(self.inner.config.url.clone())
            .session_id(self.inner.session_id)
            .build()
    }

    pub fn worker_count(&self) -> usize {
        self.inner.workers.len()
    }

    /// Block until the required worker count attaches, or the attach
    /// timeout elapses.
    ///
    /// Zero attached workers after the timeout is fatal; a count below the
    /// warning threshold degrades with a warning.
    #[instrument(skip(self))]
    pub async fn wait_for_workers_or_timeout(&self) -> Result<usize> {
        let deadline = Instant::now() + self.inner.config.attach_timeout;
        loop {
            let attached = self.worker_count();
            if attached >= self.inner.config.required_workers {
                info!(attached, "required workers attached");
                return Ok(attached);
            }
            if Instant::now() >= deadline {
                if attached == 0 {
                    bail!(
                        "no workers attached within {:?}",
                        self.inner.config.attach_timeout,
                    );
                }
                if attached < self.inner.config.low_workers_warning_threshold {
                    warn!(
                        attached,
                        required = self.inner.config.required_workers,
                        "fewer workers than required; continuing degraded",
                    );
                }
                return Ok(attached);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Announce the graph to workers.
    ///
    /// The descriptor must already be durable in the shared store: workers
    /// fetch the artifacts from there, and a dispatch racing an incomplete
    /// publication would strand them.
    #[instrument(skip_all, fields(fingerprint = %descriptor.exact_fingerprint))]
    pub fn publish_graph(&self, descriptor: GraphDescriptor) {
        let mut graph = self
            .inner
            .graph
            .write()
            .unwrap_or_else(|err| err.into_inner());
        *graph = Some(descriptor);
        info!("graph published to workers");
    }

    fn published_graph(&self) -> Option<GraphDescriptor> {
        self.inner
            .graph
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }

    /// Dispatch a pip to the least-loaded attached worker.
    ///
    /// Returns the chosen worker and the dispatch sequence number, which the
    /// worker's result will echo.
    #[instrument(skip(self, inputs))]
    pub fn dispatch(
        &self,
        pip_id: PipId,
        inputs: Vec<MaterializeInput>,
    ) -> Result<(WorkerId, SequenceNumber)> {
        if self.published_graph().is_none() {
            bail!("dispatch before graph publication");
        }
        // Least-loaded first: outstanding work normalized by capacity, with
        // the reported host load as tiebreak.
        let chosen = self
            .inner
            .workers
            .iter()
            .min_by(|a, b| {
                let load = |entry: &WorkerEntry| {
                    (entry.outstanding() as f64 / entry.capacity as f64, entry.reported_load)
                };
                load(a.value())
                    .partial_cmp(&load(b.value()))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|entry| *entry.key())
            .ok_or_else(|| eyre!("no attached workers"))?;

        let mut entry = self
            .inner
            .workers
            .get_mut(&chosen)
            .ok_or_else(|| eyre!("worker {chosen} detached during dispatch"))?;
        let seq = entry.next_seq;
        entry.next_seq = seq.next();
        entry.queue.push_back(
            ExecutePip::builder()
                .seq(seq)
                .pip_id(pip_id)
                .inputs(inputs)
                .build(),
        );
        debug!(worker = %chosen, %seq, %pip_id, "dispatched pip");
        Ok((chosen, seq))
    }

    /// Await the next worker result.
    pub async fn next_result(&self, timeout: Duration) -> Result<Option<(WorkerId, PipResult)>> {
        match tokio::time::timeout(timeout, self.inner.results_rx.recv_async()).await {
            Ok(Ok(result)) => Ok(Some(result)),
            Ok(Err(_)) => bail!("result channel closed"),
            Err(_) => Ok(None),
        }
    }

    /// Handle a worker failure, returning the pips that must be reassigned.
    #[instrument(skip(self))]
    pub fn on_worker_failure(
        &self,
        worker_id: WorkerId,
        kind: WorkerFailureKind,
    ) -> Result<Vec<PipId>> {
        match kind {
            WorkerFailureKind::NetworkTransient => {
                debug!(worker = %worker_id, "transient worker failure; keeping attachment");
                Ok(Vec::new())
            }
            WorkerFailureKind::WorkerExit => {
                let Some((_, entry)) = self.inner.workers.remove(&worker_id) else {
                    return Ok(Vec::new());
                };
                let orphaned = entry
                    .queue
                    .iter()
                    .map(|pip| pip.pip_id)
                    .chain(entry.inflight.values().copied())
                    .collect::<Vec<_>>();
                warn!(
                    worker = %worker_id,
                    orphaned = orphaned.len(),
                    "worker exited; reassigning its pips",
                );
                Ok(orphaned)
            }
            WorkerFailureKind::Fatal => {
                bail!("fatal worker failure on {worker_id}");
            }
        }
    }

    /// Workers whose last contact is older than the heartbeat timeout.
    pub fn stale_workers(&self) -> Vec<WorkerId> {
        let timeout = self.inner.config.heartbeat_timeout;
        self.inner
            .workers
            .iter()
            .filter(|entry| entry.value().last_seen.elapsed() > timeout)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Tell workers to drain and exit once their queues are empty.
    pub fn release_workers(&self) {
        self.inner.draining.store(true, Ordering::SeqCst);
        info!("workers released; drain on next poll");
    }
}

async fn health() -> StatusCode {
    StatusCode::OK
}

#[axum::debug_handler]
async fn attach(
    State(orchestrator): State<Orchestrator>,
    Json(request): Json<AttachRequest>,
) -> Response {
    if request.config_digest != orchestrator.inner.config.config_digest {
        warn!(worker = %request.worker_id, "worker config digest mismatch; rejecting attach");
        return (
            StatusCode::CONFLICT,
            "configuration digest does not match this build",
        )
            .into_response();
    }

    // Re-attach must not reset dispatch state: a worker polling for the
    // graph announcement attaches repeatedly, and wiping its queue or
    // sequence counter would orphan dispatched pips.
    match orchestrator.inner.workers.get_mut(&request.worker_id) {
        Some(mut entry) => {
            entry.last_seen = Instant::now();
            entry.capacity = request.capacity.max(1);
        }
        None => {
            orchestrator.inner.workers.insert(
                request.worker_id,
                WorkerEntry {
                    capacity: request.capacity.max(1),
                    next_seq: SequenceNumber::ZERO.next(),
                    queue: VecDeque::new(),
                    inflight: HashMap::new(),
                    last_seen: Instant::now(),
                    reported_load: 0.0,
                },
            );
            info!(worker = %request.worker_id, "worker attached");
        }
    }

    let response = AttachResponse::builder()
        .orchestrator_info(orchestrator.info())
        .maybe_graph_descriptor(orchestrator.published_graph())
        .build();
    Json(response).into_response()
}

#[axum::debug_handler]
async fn poll_work(
    State(orchestrator): State<Orchestrator>,
    Path(worker_id): Path<WorkerId>,
) -> Response {
    let Some(mut entry) = orchestrator.inner.workers.get_mut(&worker_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    entry.last_seen = Instant::now();

    if let Some(pip) = entry.queue.pop_front() {
        entry.inflight.insert(pip.seq, pip.pip_id);
        return Json(WorkPollResponse::Execute(pip)).into_response();
    }
    if orchestrator.inner.draining.load(Ordering::SeqCst) && entry.inflight.is_empty() {
        return Json(WorkPollResponse::Drain).into_response();
    }
    Json(WorkPollResponse::Idle).into_response()
}

#[axum::debug_handler]
async fn post_result(
    State(orchestrator): State<Orchestrator>,
    Path(worker_id): Path<WorkerId>,
    Json(result): Json<PipResult>,
) -> Response {
    let Some(mut entry) = orchestrator.inner.workers.get_mut(&worker_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    entry.last_seen = Instant::now();

    // A result must reference an outstanding dispatch; anything else is a
    // late reply from a previously-failed attempt and is dropped.
    match entry.inflight.remove(&result.seq) {
        Some(pip_id) if pip_id == result.pip_id => {}
        _ => {
            debug!(worker = %worker_id, seq = %result.seq, "dropping stale result");
            return StatusCode::CONFLICT.into_response();
        }
    }
    drop(entry);

    if orchestrator
        .inner
        .results_tx
        .send((worker_id, result))
        .is_err()
    {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    StatusCode::OK.into_response()
}

#[axum::debug_handler]
async fn heartbeat(
    State(orchestrator): State<Orchestrator>,
    Path(worker_id): Path<WorkerId>,
    Json(heartbeat): Json<Heartbeat>,
) -> Response {
    let Some(mut entry) = orchestrator.inner.workers.get_mut(&worker_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    entry.last_seen = Instant::now();
    entry.reported_load = heartbeat.worker_load;
    StatusCode::OK.into_response()
}

#[axum::debug_handler]
async fn bye(
    State(orchestrator): State<Orchestrator>,
    Path(worker_id): Path<WorkerId>,
    Json(bye): Json<Bye>,
) -> Response {
    info!(worker = %worker_id, reason = ?bye.reason, "worker said bye");
    let Some((_, entry)) = orchestrator.inner.workers.remove(&worker_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    // Anything the worker still held is reported back as not-run so the
    // driver reassigns it.
    for (seq, pip_id) in entry
        .inflight
        .iter()
        .map(|(seq, pip_id)| (*seq, *pip_id))
        .chain(entry.queue.iter().map(|pip| (pip.seq, pip.pip_id)))
    {
        let not_run = PipResult::builder()
            .seq(seq)
            .pip_id(pip_id)
            .status(PipRunStatus::NotRun)
            .build();
        let _ = orchestrator.inner.results_tx.send((worker_id, not_run));
    }
    StatusCode::OK.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum_test::TestServer;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(OrchestratorConfig {
            config_digest: Digest::from_buffer(b"config"),
            required_workers: 1,
            attach_timeout: Duration::from_millis(200),
            ..Default::default()
        })
    }

    fn descriptor() -> GraphDescriptor {
        GraphDescriptor::builder()
            .exact_fingerprint(Digest::from_buffer(b"exact"))
            .compatible_fingerprint(Digest::from_buffer(b"compatible"))
            .artifacts(vec![])
            .build()
    }

    async fn attach_worker(server: &TestServer, worker_id: WorkerId) -> AttachResponse {
        let request = AttachRequest::builder()
            .worker_id(worker_id)
            .config_digest(Digest::from_buffer(b"config"))
            .capacity(2)
            .build();
        let response = server.post("/api/v1/attach").json(&request).await;
        response.assert_status_ok();
        response.json::<AttachResponse>()
    }

    #[tokio::test]
    async fn attach_and_poll_workflow() {
        let orchestrator = orchestrator();
        let server = TestServer::new(orchestrator.router()).unwrap();
        let worker_id = WorkerId::random();

        let attach = attach_worker(&server, worker_id).await;
        pretty_assert_eq!(attach.graph_descriptor, None);
        pretty_assert_eq!(orchestrator.worker_count(), 1);

        // Nothing dispatched yet.
        let poll = server.get(&format!("/api/v1/work/{worker_id}")).await;
        poll.assert_status_ok();
        pretty_assert_eq!(poll.json::<WorkPollResponse>(), WorkPollResponse::Idle);

        // Publish and dispatch.
        orchestrator.publish_graph(descriptor());
        let (chosen, seq) = orchestrator.dispatch(PipId::new(0), vec![]).unwrap();
        pretty_assert_eq!(chosen, worker_id);

        let poll = server.get(&format!("/api/v1/work/{worker_id}")).await;
        match poll.json::<WorkPollResponse>() {
            WorkPollResponse::Execute(pip) => {
                pretty_assert_eq!(pip.seq, seq);
                pretty_assert_eq!(pip.pip_id, PipId::new(0));
            }
            other => panic!("expected execute, got {other:?}"),
        }

        // Result with the right sequence number is accepted and surfaced.
        let result = PipResult::builder()
            .seq(seq)
            .pip_id(PipId::new(0))
            .status(PipRunStatus::Succeeded)
            .build();
        let response = server
            .post(&format!("/api/v1/result/{worker_id}"))
            .json(&result)
            .await;
        response.assert_status_ok();

        let (from, received) = orchestrator
            .next_result(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        pretty_assert_eq!(from, worker_id);
        pretty_assert_eq!(received.pip_id, PipId::new(0));
    }

    #[tokio::test]
    async fn stale_results_are_dropped() {
        let orchestrator = orchestrator();
        let server = TestServer::new(orchestrator.router()).unwrap();
        let worker_id = WorkerId::random();
        attach_worker(&server, worker_id).await;

        orchestrator.publish_graph(descriptor());
        let (_, seq) = orchestrator.dispatch(PipId::new(0), vec![]).unwrap();
        let _ = server.get(&format!("/api/v1/work/{worker_id}")).await;

        // A result with an unknown sequence number is dropped.
        let stale = PipResult::builder()
            .seq(seq.next())
            .pip_id(PipId::new(0))
            .status(PipRunStatus::Succeeded)
            .build();
        let response = server
            .post(&format!("/api/v1/result/{worker_id}"))
            .json(&stale)
            .await;
        response.assert_status(StatusCode::CONFLICT);

        // The genuine result is still accepted afterwards.
        let genuine = PipResult::builder()
            .seq(seq)
            .pip_id(PipId::new(0))
            .status(PipRunStatus::Succeeded)
            .build();
        let response = server
            .post(&format!("/api/v1/result/{worker_id}"))
            .json(&genuine)
            .await;
        response.assert_status_ok();
    }

    #[tokio::test]
    async fn config_digest_mismatch_rejected() {
        let orchestrator = orchestrator();
        let server = TestServer::new(orchestrator.router()).unwrap();

        let request = AttachRequest::builder()
            .worker_id(WorkerId::random())
            .config_digest(Digest::from_buffer(b"other config"))
            .capacity(1)
            .build();
        let response = server.post("/api/v1/attach").json(&request).await;
        response.assert_status(StatusCode::CONFLICT);
        pretty_assert_eq!(orchestrator.worker_count(), 0);
    }

    #[tokio::test]
    async fn dispatch_requires_publication() {
        let orchestrator = orchestrator();
        let server = TestServer::new(orchestrator.router()).unwrap();
        attach_worker(&server, WorkerId::random()).await;

        assert!(orchestrator.dispatch(PipId::new(0), vec![]).is_err());
    }

    #[tokio::test]
    async fn no_workers_within_timeout_is_fatal() {
        let orchestrator = orchestrator();
        assert!(orchestrator.wait_for_workers_or_timeout().await.is_err());
    }

    #[tokio::test]
    async fn bye_reports_outstanding_pips_as_not_run() {
        let orchestrator = orchestrator();
        let server = TestServer::new(orchestrator.router()).unwrap();
        let worker_id = WorkerId::random();
        attach_worker(&server, worker_id).await;

        orchestrator.publish_graph(descriptor());
        orchestrator.dispatch(PipId::new(0), vec![]).unwrap();

        let response = server
            .post(&format!("/api/v1/bye/{worker_id}"))
            .json(&Bye::builder().reason(ferry::v1::distrib::ByeReason::Drained).build())
            .await;
        response.assert_status_ok();

        let (_, result) = orchestrator
            .next_result(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        pretty_assert_eq!(result.status, PipRunStatus::NotRun);
        pretty_assert_eq!(orchestrator.worker_count(), 0);
    }

    #[tokio::test]
    async fn worker_exit_reassigns_queued_pips() {
        let orchestrator = orchestrator();
        let server = TestServer::new(orchestrator.router()).unwrap();
        let worker_id = WorkerId::random();
        attach_worker(&server, worker_id).await;

        orchestrator.publish_graph(descriptor());
        orchestrator.dispatch(PipId::new(3), vec![]).unwrap();

        let orphaned = orchestrator
            .on_worker_failure(worker_id, WorkerFailureKind::WorkerExit)
            .unwrap();
        pretty_assert_eq!(orphaned, vec![PipId::new(3)]);
        assert!(
            orchestrator
                .on_worker_failure(worker_id, WorkerFailureKind::Fatal)
                .is_err()
        );
    }
}
