//! The worker side of a distributed build.
//!
//! A worker is a state machine:
//!
//! ```text
//! Starting → SayingHello → WaitingForAttach → GraphLoading → Ready
//!     → Executing ⇄ Ready → Draining → Exited
//! ```
//!
//! Terminal states are `Exited` and `FailedBeforeReady`. A worker that
//! cannot attach within its timeout warns and exits — a missing worker is
//! the orchestrator's problem to classify, not the worker's to escalate.
//!
//! Workers initiate every exchange: attach (repeated until the graph is
//! announced), work polls, results, heartbeats, and the final bye. All
//! network calls go through the retry policy; a fatal classification tears
//! the worker down with a `Crashed` bye.

use std::{path::PathBuf, time::Duration};

use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use derive_more::Display;
use ferry::{Token, v1::{
    Digest, GraphDescriptor,
    distrib::{
        AttachRequest, AttachResponse, Bye, ByeReason, ExecutePip, Heartbeat, PipOutput,
        PipResult, PipRunStatus, WorkPollResponse, WorkerId,
    },
}};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::{
    cache::{GraphCache, LoadedGraph, StoreBackend},
    distrib::retry::{FailureClass, RetryPolicy},
    exec::PipExecutor,
    fs,
};

/// The worker lifecycle states.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
pub enum WorkerState {
    Starting,
    SayingHello,
    WaitingForAttach,
    GraphLoading,
    Ready,
    Executing,
    Draining,
    Exited,
    FailedBeforeReady,
}

/// Worker-side configuration.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub orchestrator_url: Url,
    pub token: Token,
    /// Must match the orchestrator's configuration digest.
    pub config_digest: Digest,
    /// Pips the worker runs concurrently (currently sequential; reported to
    /// the orchestrator for scheduling).
    pub capacity: u32,
    /// How long to wait for attach plus graph announcement.
    pub attach_timeout: Duration,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            orchestrator_url: Url::parse("http://127.0.0.1:0/").expect("static url"),
            token: Token::from("anonymous"),
            config_digest: Digest::from_buffer(b""),
            capacity: 1,
            attach_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

/// A worker agent: attaches to the orchestrator, fetches the published
/// graph, and executes dispatched pips until drained.
pub struct WorkerAgent<S, E> {
    config: WorkerConfig,
    client: ferry::Ferry,
    worker_id: WorkerId,
    cache: GraphCache<S>,
    executor: E,
    workspace_root: PathBuf,
    state: WorkerState,
}

impl<S: StoreBackend, E: PipExecutor> WorkerAgent<S, E> {
    pub fn new(
        config: WorkerConfig,
        cache: GraphCache<S>,
        executor: E,
        workspace_root: impl Into<PathBuf>,
    ) -> Result<Self> {
        let client = ferry::Ferry::new(config.orchestrator_url.clone(), config.token.clone())?;
        Ok(Self {
            config,
            client,
            worker_id: WorkerId::random(),
            cache,
            executor,
            workspace_root: workspace_root.into(),
            state: WorkerState::Starting,
        })
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    fn transition(&mut self, next: WorkerState) {
        debug!(from = %self.state, to = %next, "worker state transition");
        self.state = next;
    }

    /// Run the worker to a terminal state.
    #[instrument(skip_all, fields(worker_id = %self.worker_id))]
    pub async fn run(mut self, cancel: CancellationToken) -> Result<WorkerState> {
        // Attach, then wait for the graph announcement, all within the
        // attach timeout.
        self.transition(WorkerState::SayingHello);
        let descriptor = match self.say_hello_and_wait().await {
            Ok(descriptor) => descriptor,
            Err(err) => {
                warn!(?err, "failed to attach within timeout; exiting");
                self.transition(WorkerState::FailedBeforeReady);
                self.send_bye(ByeReason::FailedBeforeReady {
                    message: format!("{err}"),
                })
                .await;
                return Ok(WorkerState::FailedBeforeReady);
            }
        };

        // Fetch and load the graph before reporting ready.
        self.transition(WorkerState::GraphLoading);
        let loaded = match self.fetch_graph(&descriptor).await {
            Ok(loaded) => loaded,
            Err(err) => {
                warn!(?err, "failed to load published graph; exiting");
                self.transition(WorkerState::FailedBeforeReady);
                self.send_bye(ByeReason::FailedBeforeReady {
                    message: format!("{err}"),
                })
                .await;
                return Ok(WorkerState::FailedBeforeReady);
            }
        };
        info!(pips = loaded.graph.pip_count(), "graph loaded; worker ready");
        self.transition(WorkerState::Ready);

        let mut last_heartbeat = tokio::time::Instant::now();
        let mut queue_depth = 0u32;

        loop {
            if last_heartbeat.elapsed() >= self.config.heartbeat_interval {
                self.send_heartbeat(queue_depth).await;
                last_heartbeat = tokio::time::Instant::now();
            }

            // The select arms only produce values; all state transitions
            // happen below, outside any borrow of the polled future.
            let poll = tokio::select! {
                _ = cancel.cancelled() => None,
                poll = self.poll_once() => Some(poll),
            };

            let Some(poll) = poll else {
                info!("cancellation requested; draining");
                self.transition(WorkerState::Draining);
                self.send_bye(ByeReason::Drained).await;
                self.transition(WorkerState::Exited);
                return Ok(WorkerState::Exited);
            };

            match poll {
                Ok(WorkPollResponse::Execute(pip)) => {
                    queue_depth = 1;
                    self.transition(WorkerState::Executing);
                    let result = self.execute_pip(&loaded, &pip).await;
                    self.post_result(result).await?;
                    queue_depth = 0;
                    self.transition(WorkerState::Ready);
                }
                Ok(WorkPollResponse::Idle) => {
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                Ok(WorkPollResponse::Drain) => {
                    self.transition(WorkerState::Draining);
                    self.send_bye(ByeReason::Drained).await;
                    self.transition(WorkerState::Exited);
                    return Ok(WorkerState::Exited);
                }
                Err(err) => {
                    warn!(?err, "work polling failed fatally; exiting");
                    self.send_bye(ByeReason::Crashed {
                        message: format!("{err}"),
                    })
                    .await;
                    self.transition(WorkerState::Exited);
                    return Err(err);
                }
            }
        }
    }

    /// Attach and wait for the graph announcement.
    async fn say_hello_and_wait(&mut self) -> Result<GraphDescriptor> {
        let request = AttachRequest::builder()
            .worker_id(self.worker_id)
            .config_digest(self.config.config_digest.clone())
            .capacity(self.config.capacity)
            .build();

        let deadline = tokio::time::Instant::now() + self.config.attach_timeout;
        let mut attached = false;
        loop {
            let response: AttachResponse = self
                .config
                .retry
                .run("attach", || self.client.attach(&request))
                .await
                .map_err(|failure| eyre!("{failure}"))?;
            if !attached {
                attached = true;
                self.transition(WorkerState::WaitingForAttach);
            }
            if let Some(descriptor) = response.graph_descriptor {
                return Ok(descriptor);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(eyre!(
                    "no graph announced within {:?}",
                    self.config.attach_timeout,
                ));
            }
            debug!("attached; waiting for graph announcement");
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Materialize the published graph's artifacts and load it.
    async fn fetch_graph(&self, descriptor: &GraphDescriptor) -> Result<LoadedGraph> {
        self.cache
            .materialize_and_load(descriptor)
            .await?
            .ok_or_else(|| {
                eyre!(
                    "published graph {} could not be materialized",
                    descriptor.exact_fingerprint,
                )
            })
    }

    async fn poll_once(&self) -> Result<WorkPollResponse> {
        self.config
            .retry
            .run("poll work", || self.client.poll_work(&self.worker_id))
            .await
            .map_err(|failure| match failure.class {
                FailureClass::NetworkTransient => {
                    failure.report.wrap_err("orchestrator unreachable")
                }
                FailureClass::Fatal => failure.report,
            })
    }

    /// Execute one dispatched pip: materialize inputs, run, upload outputs.
    #[instrument(skip_all, fields(pip = %dispatch.pip_id, seq = %dispatch.seq))]
    async fn execute_pip(&self, loaded: &LoadedGraph, dispatch: &ExecutePip) -> PipResult {
        match self.try_execute_pip(loaded, dispatch).await {
            Ok(outputs) => PipResult::builder()
                .seq(dispatch.seq)
                .pip_id(dispatch.pip_id)
                .status(PipRunStatus::Succeeded)
                .outputs(outputs)
                .build(),
            Err(err) => {
                warn!(?err, "pip execution failed");
                PipResult::builder()
                    .seq(dispatch.seq)
                    .pip_id(dispatch.pip_id)
                    .status(PipRunStatus::Failed {
                        message: format!("{err:#}"),
                    })
                    .build()
            }
        }
    }

    async fn try_execute_pip(
        &self,
        loaded: &LoadedGraph,
        dispatch: &ExecutePip,
    ) -> Result<Vec<PipOutput>> {
        // Materialize declared inputs from the content store.
        for input in &dispatch.inputs {
            let dst = self.workspace_root.join(&input.path);
            let present = self
                .cache
                .store()
                .blob_materialize(&input.digest, &dst)
                .await?;
            if !present {
                return Err(eyre!("input blob {} not in store", input.digest));
            }
        }

        let pip = loaded.graph.pip(dispatch.pip_id)?;
        self.executor.execute(pip, &loaded.pools).await?;

        // Upload produced outputs so the orchestrator and other workers can
        // materialize them.
        let mut outputs = Vec::new();
        for output in &pip.outputs {
            let path = loaded.pools.paths.resolve(*output)?;
            let resolved = if std::path::Path::new(&*path).is_absolute() {
                PathBuf::from(&*path)
            } else {
                self.workspace_root.join(&*path)
            };
            let content = fs::must_read_buffered(&resolved)
                .await
                .context("read pip output")?;
            let digest = Digest::from_buffer(&content);
            self.cache.store().blob_store(&digest, &content).await?;
            outputs.push(
                PipOutput::builder()
                    .path(path.to_string())
                    .digest(digest)
                    .executable(false)
                    .build(),
            );
        }
        Ok(outputs)
    }

    async fn post_result(&self, result: PipResult) -> Result<()> {
        let accepted = self
            .config
            .retry
            .run("post result", || {
                self.client.post_result(&self.worker_id, &result)
            })
            .await
            .map_err(|failure| failure.report)?;
        if !accepted {
            // The orchestrator saw this sequence number already (a retried
            // dispatch); nothing to do.
            debug!(seq = %result.seq, "result dropped as stale by orchestrator");
        }
        Ok(())
    }

    async fn send_heartbeat(&self, queue_depth: u32) {
        let heartbeat = Heartbeat::builder()
            .worker_load(normalized_load())
            .queue_depth(queue_depth)
            .build();
        if let Err(err) = self.client.heartbeat(&self.worker_id, &heartbeat).await {
            debug!(?err, "heartbeat failed");
        }
    }

    async fn send_bye(&self, reason: ByeReason) {
        let bye = Bye::builder().reason(reason).build();
        if let Err(err) = self.client.bye(&self.worker_id, &bye).await {
            debug!(?err, "bye failed");
        }
    }
}

/// Host load normalized to logical processors: 1.0 means fully busy.
fn normalized_load() -> f64 {
    let load = sysinfo::System::load_average();
    load.one / num_cpus::get() as f64
}
