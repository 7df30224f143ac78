//! The engine driver: phase sequencer for one build.
//!
//! `LoadConfig → Parse → Evaluate → Schedule → Execute`, with exclusive
//! directory locks around everything mutating, asynchronous store
//! initialization overlapped with the reuse check, and a failure log whose
//! agreement with the success flag is verified after every phase.
//!
//! The driver guarantees that every background task it launches is awaited
//! before it returns on every path — an unawaited task could race a
//! subsequent build — and that cancellation leaves no finalized
//! previous-inputs record, released locks, and joined tasks within the
//! grace period.

pub mod failure;
pub mod phase;

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::PathBuf,
    sync::Arc,
};

use color_eyre::{
    Result,
    eyre::{Context, bail, eyre},
};
use ferry::v1::{
    Digest, GraphDescriptor,
    distrib::{MaterializeInput, PipRunStatus},
};
use git_version::git_version;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    cache::{GraphCache, LoadedGraph, PreviousRunRecord, StoreBackend},
    config::EngineConfig,
    content_table::FileContentTable,
    distrib::{DistributionRole, Orchestrator, WorkerFailureKind},
    exec::{ExecutionSummary, IncrementalState, LocalExecutor, PipExecutor, run_graph},
    fingerprint::{FingerprintInputs, GraphFingerprint, GraphFingerprinter},
    frontend::{BuildParameters, Frontend, FrontendContext, MountTable},
    fs::{DirLock, Locked},
    graph::PipGraph,
    intern::InternPools,
    reuse::{self, ReuseDecision, ReuseOptions, ReuseSource},
    track::{CurrentEnvironment, InputTracker, TrackerSnapshot, journal::{self, ChangeJournal, NullJournal}},
};

pub use failure::{FailureKind, FailureLog, LoggedFailure};
pub use phase::{Phase, PhaseTracker};

/// Digest of the engine version manifest: crate version plus the commit the
/// binary was built from. Folded into every graph fingerprint so an engine
/// upgrade invalidates serialized graphs.
pub fn engine_version_digest() -> Digest {
    Digest::from_fields([
        env!("CARGO_PKG_VERSION"),
        git_version!(args = ["--always"], fallback = "unknown"),
    ])
}

/// What one build produced.
#[derive(Debug)]
pub struct BuildOutcome {
    pub success: bool,
    pub cancelled: bool,
    /// The reuse decision label, when the build got far enough to decide.
    pub decision: Option<String>,
    pub execution: Option<ExecutionSummary>,
    pub failures: Vec<LoggedFailure>,
}

impl BuildOutcome {
    pub fn exit_code(&self) -> i32 {
        if self.success { 0 } else { 1 }
    }
}

/// The engine driver. Generic over the store backend, the frontend that
/// constructs graphs, and the executor that runs pips.
pub struct EngineDriver<S, F, E> {
    config: EngineConfig,
    store: S,
    frontend: F,
    executor: E,
    orchestrator: Option<Orchestrator>,
    cancel: CancellationToken,
}

/// Everything that must be cleaned up on every exit path.
struct Held {
    object_lock: Option<DirLock<Locked>>,
    engine_cache_lock: Option<DirLock<Locked>>,
    store_init: Option<JoinHandle<Result<()>>>,
    created_dirs: Vec<PathBuf>,
}

impl<S: StoreBackend, F: Frontend, E: PipExecutor> EngineDriver<S, F, E> {
    pub fn new(config: EngineConfig, store: S, frontend: F, executor: E) -> Self {
        Self {
            config,
            store,
            frontend,
            executor,
            orchestrator: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Attach a pre-initialized orchestrator. Required when the role is
    /// `Orchestrator`; the coordinator must exist before fingerprints are
    /// computed so workers can attach concurrently.
    pub fn with_orchestrator(mut self, orchestrator: Orchestrator) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the build to completion.
    #[instrument(skip_all, fields(workspace = ?self.config.workspace_root))]
    pub async fn run(self) -> Result<BuildOutcome> {
        let mut phases = PhaseTracker::new();
        let mut log = FailureLog::new();
        let mut held = Held {
            object_lock: None,
            engine_cache_lock: None,
            store_init: None,
            created_dirs: Vec::new(),
        };

        let outcome = self
            .run_phases(&mut phases, &mut log, &mut held)
            .await;

        // Cleanup runs on every path: background tasks joined, locks
        // released. Each suspension point is bounded by the cancellation
        // grace period so a hung task cannot wedge the driver.
        let grace = self.config.cancellation_grace();
        if let Some(mut init) = held.store_init.take() {
            if !init.is_finished() {
                debug!("awaiting store initialization before exit");
            }
            match tokio::time::timeout(grace, &mut init).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(err))) => debug!(?err, "store initialization failed during cleanup"),
                Ok(Err(err)) => warn!(?err, "store initialization task panicked"),
                Err(_) => {
                    warn!(?grace, "store initialization exceeded the grace period; aborting");
                    init.abort();
                }
            }
        }
        if let Some(lock) = held.engine_cache_lock.take() {
            match tokio::time::timeout(grace, lock.release()).await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => warn!(?err, "failed to release engine-cache lock"),
                Err(_) => warn!(?grace, "engine-cache lock release exceeded the grace period"),
            }
        }
        if let Some(lock) = held.object_lock.take() {
            match tokio::time::timeout(grace, lock.release()).await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => warn!(?err, "failed to release object-directory lock"),
                Err(_) => warn!(?grace, "object-directory lock release exceeded the grace period"),
            }
        }

        let (decision, execution) = match outcome {
            Ok(parts) => parts,
            Err(err) => {
                // Failures should already be in the log; anything arriving
                // here is a driver bug surfaced as a recoverable failure.
                if log.success() {
                    log.record(FailureKind::RecoverableIo, err);
                }
                (None, None)
            }
        };

        log.verify_consistency(log.success())
            .context("post-build consistency check")?;

        let success = log.success();
        let cancelled = log.cancelled();
        if !success {
            info!("build failed:\n{}", log.summary());
        }
        Ok(BuildOutcome {
            success,
            cancelled,
            decision,
            execution,
            failures: log.into_failures(),
        })
    }

    async fn run_phases(
        &self,
        phases: &mut PhaseTracker,
        log: &mut FailureLog,
        held: &mut Held,
    ) -> Result<(Option<String>, Option<ExecutionSummary>)> {
        // ---------------- Config ----------------
        phases.start(Phase::Config);

        if self.config.role == DistributionRole::Worker {
            log.record(
                FailureKind::ConfigurationInvalid,
                eyre!("worker role runs through the worker agent, not the driver"),
            );
        }
        if self.config.role == DistributionRole::Orchestrator && self.orchestrator.is_none() {
            log.record(
                FailureKind::ConfigurationInvalid,
                eyre!("orchestrator role requires an initialized distribution coordinator"),
            );
        }
        if self.config.config_files.is_empty() {
            log.record(
                FailureKind::ConfigurationInvalid,
                eyre!("no configuration files given"),
            );
        }
        if !log.success() {
            phases.end(false);
            return Ok((None, None));
        }

        // Exclusive folder locks before anything mutating.
        match self.acquire_locks().await {
            Ok((object_lock, engine_cache_lock)) => {
                held.object_lock = Some(object_lock);
                held.engine_cache_lock = Some(engine_cache_lock);
            }
            Err(err) => {
                log.record(FailureKind::LockUnavailable, err);
                phases.end(false);
                return Ok((None, None));
            }
        }

        // Output directories, with undo on failure.
        if let Err(err) = self.create_output_dirs(&mut held.created_dirs).await {
            self.undo_created_dirs(&held.created_dirs).await;
            held.created_dirs.clear();
            log.record(FailureKind::RecoverableIo, err);
            phases.end(false);
            return Ok((None, None));
        }

        // Initialize the content store asynchronously; awaited before
        // Execute (and on every exit path).
        held.store_init = Some(tokio::spawn(probe_store(self.store.clone())));

        let content_table = Arc::new(
            match FileContentTable::load(&self.config.engine_cache_dir).await {
                Ok(table) => table,
                Err(err) => {
                    warn!(?err, "file content table unusable; degrading to stub");
                    FileContentTable::stub()
                }
            },
        );

        let journal = NullJournal;
        let checkpoint = journal::load_checkpoint(&self.config.engine_cache_dir)
            .await
            .unwrap_or_default();
        if self.config.incremental_scheduling_required && !journal.is_healthy() {
            log.record(
                FailureKind::FilesystemCapabilityMissing,
                eyre!("incremental scheduling requires a change journal, which this platform lacks"),
            );
            phases.end(false);
            return Ok((None, None));
        }

        let cache = GraphCache::new(&self.config.engine_cache_dir, self.store.clone());
        phases.end(log.success());
        log.verify_consistency(log.success())?;
        if self.check_cancelled(log) {
            return Ok((None, None));
        }

        // ---------------- Parse ----------------
        phases.start(Phase::Parse);

        let prior = cache
            .read_previous_record()
            .await?
            .map(|record| Arc::new(record.snapshot));
        let tracker = InputTracker::new(
            Arc::clone(&content_table),
            self.config.membership_rules.clone(),
            prior,
        );
        let parameters = BuildParameters::from_env(self.config.restricted_env_vars.as_deref());
        let mount_table = MountTable::new(self.config.mounts.clone());

        let fingerprint = match self
            .compute_fingerprint(&tracker, &parameters, &content_table)
            .await
        {
            Ok(fingerprint) => fingerprint,
            Err(err) => {
                log.record(FailureKind::ConfigurationInvalid, err);
                phases.end(false);
                return Ok((None, None));
            }
        };

        let environment = CurrentEnvironment::with_env(
            std::env::vars().collect(),
            self.config.mounts.clone(),
        );
        let options = ReuseOptions {
            enable_partial_reuse: self.config.enable_partial_reuse,
            probe_compatible: self.config.probe_compatible,
            explicit_graph: match &self.config.explicit_graph {
                Some(hex) => Some(Digest::from_hex(hex).context("parse explicit graph id")?),
                None => None,
            },
            journal_timeout: self.config.journal_timeout(),
        };
        let decision = reuse::decide(
            &cache,
            &fingerprint,
            &journal,
            checkpoint,
            &environment,
            &content_table,
            &options,
        )
        .await?;
        let decision_label = decision.label();
        info!(decision = %decision_label, "graph reuse decision");
        if let Err(err) = cache.record_fingerprint(&fingerprint, &decision_label).await {
            debug!(?err, "failed to append fingerprint history");
        }

        phases.end(log.success());
        log.verify_consistency(log.success())?;
        if self.check_cancelled(log) {
            return Ok((Some(decision_label), None));
        }

        // ---------------- Evaluate ----------------
        phases.start(Phase::Evaluate);

        let (graph, pools, snapshot, needs_save, adopted) =
            match self.evaluate(decision, &tracker, &parameters, &mount_table).await {
                Ok(parts) => parts,
                Err(err) => {
                    log.record(FailureKind::ConfigurationInvalid, err);
                    phases.end(false);
                    return Ok((Some(decision_label), None));
                }
            };

        // From here on, no env-var read counts as used by configuration.
        parameters.finish_tracking();

        phases.end(log.success());
        log.verify_consistency(log.success())?;
        if self.check_cancelled(log) {
            return Ok((Some(decision_label), None));
        }

        // ---------------- Schedule ----------------
        let mut descriptor: Option<GraphDescriptor> = adopted;
        if Phase::Schedule.enabled(self.config.stop_after) {
            phases.start(Phase::Schedule);

            if needs_save {
                match cache.save(&graph, &pools, &fingerprint, &snapshot).await {
                    Ok(saved) => {
                        descriptor = Some(saved);
                        // A cancellation that landed while the save was in
                        // flight must not promote: the record stays staged
                        // and the next build rebuilds.
                        if self.check_cancelled(log) {
                            phases.end(log.success());
                            return Ok((Some(decision_label), None));
                        }
                        // In single-machine mode promotion happens as soon
                        // as construction is durable; an orchestrator
                        // promotes only after publication succeeds.
                        if self.config.role == DistributionRole::None {
                            cache.finalize_previous_inputs().await?;
                        }
                    }
                    Err(err) => {
                        // A failed serialization costs the next build a
                        // rebuild; it only dooms this one when the graph
                        // must be published to workers.
                        if self.config.role == DistributionRole::Orchestrator {
                            log.record(FailureKind::GraphSerializationFailed, err);
                            phases.end(false);
                            return Ok((Some(decision_label), None));
                        }
                        warn!(?err, "graph serialization failed; next build will rebuild");
                    }
                }
            }

            if let Ok(position) = journal.checkpoint() {
                if let Err(err) =
                    journal::save_checkpoint(&self.config.engine_cache_dir, position).await
                {
                    debug!(?err, "failed to persist journal checkpoint");
                }
            }

            phases.end(log.success());
            log.verify_consistency(log.success())?;
        }
        if self.check_cancelled(log) {
            return Ok((Some(decision_label), None));
        }

        // ---------------- Execute ----------------
        let mut execution = None;
        if Phase::Execute.enabled(self.config.stop_after) {
            phases.start(Phase::Execute);

            // The store must be initialized before the first pip runs (or
            // is dispatched).
            if let Some(init) = held.store_init.take() {
                match init.await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let fatal = self.config.role.is_distributed();
                        log.record(FailureKind::CacheInitializationFailed, err);
                        if fatal {
                            phases.end(false);
                            return Ok((Some(decision_label), None));
                        }
                    }
                    Err(err) => {
                        log.record(
                            FailureKind::CacheInitializationFailed,
                            eyre!("store initialization task panicked: {err}"),
                        );
                        phases.end(false);
                        return Ok((Some(decision_label), None));
                    }
                }
            }

            let result = match self.config.role {
                DistributionRole::None => self
                    .execute_local(&cache, &graph, &pools, &content_table)
                    .await
                    .map_err(|err| (FailureKind::ExecutionFailed, err)),
                DistributionRole::Orchestrator => {
                    self.execute_distributed(&cache, &graph, &pools, descriptor.clone())
                        .await
                        .map_err(|err| (FailureKind::DistributionFatal, err))
                }
                DistributionRole::Worker => unreachable!("rejected during Config"),
            };

            match result {
                Ok(summary) => execution = Some(summary),
                Err((kind, err)) => {
                    log.record(kind, err);
                    phases.end(false);
                    return Ok((Some(decision_label), None));
                }
            }

            phases.end(log.success());
            log.verify_consistency(log.success())?;
        }

        // Shutdown state: the content table persists even on failure
        // (unless stubbed).
        if let Err(err) = content_table.save(&self.config.engine_cache_dir).await {
            warn!(?err, "failed to persist file content table");
        }

        phases.start(Phase::Done);
        phases.end(log.success());
        Ok((Some(decision_label), execution))
    }

    /// Record cancellation once and report whether the build should stop.
    fn check_cancelled(&self, log: &mut FailureLog) -> bool {
        if self.cancel.is_cancelled() {
            if !log.cancelled() {
                log.record_cancellation();
            }
            return true;
        }
        false
    }

    async fn acquire_locks(&self) -> Result<(DirLock<Locked>, DirLock<Locked>)> {
        let poll = self.config.lock_poll_interval();
        let timeout = self.config.lock_timeout();
        let object = DirLock::open(&self.config.object_dir)
            .await?
            .acquire(poll, timeout)
            .await
            .context("lock object directory")?;
        let engine_cache = match DirLock::open(&self.config.engine_cache_dir).await {
            Ok(lock) => match lock.acquire(poll, timeout).await {
                Ok(lock) => lock,
                Err(err) => {
                    // Release the first lock before surfacing the failure.
                    if let Err(release_err) = object.release().await {
                        warn!(?release_err, "failed to release object lock during unwind");
                    }
                    return Err(err).context("lock engine-cache directory");
                }
            },
            Err(err) => {
                if let Err(release_err) = object.release().await {
                    warn!(?release_err, "failed to release object lock during unwind");
                }
                return Err(err);
            }
        };
        Ok((object, engine_cache))
    }

    async fn create_output_dirs(&self, created: &mut Vec<PathBuf>) -> Result<()> {
        for dir in [
            &self.config.object_dir,
            &self.config.engine_cache_dir,
            &self.config.logs_dir,
        ] {
            if !crate::fs::exists(dir).await {
                crate::fs::create_dir_all(dir).await?;
                created.push(dir.clone());
            }
        }
        Ok(())
    }

    async fn undo_created_dirs(&self, created: &[PathBuf]) {
        for dir in created.iter().rev() {
            if let Err(err) = tokio::fs::remove_dir_all(dir).await {
                warn!(?err, ?dir, "failed to undo created directory");
            }
        }
    }

    /// Assemble fingerprint inputs: config file digests, referenced env
    /// vars, mounts, engine version, commit id, filter. Every read is
    /// recorded with the tracker.
    async fn compute_fingerprint(
        &self,
        tracker: &InputTracker,
        parameters: &BuildParameters,
        content_table: &FileContentTable,
    ) -> Result<GraphFingerprint> {
        let mut config_files = BTreeMap::new();
        for path in &self.config.config_files {
            tracker.register_file_access(path).await?;
            let (_, digest) = content_table
                .hash_and_record(path)
                .await
                .with_context(|| format!("hash configuration file {path:?}"))?;
            // Fingerprints must agree across machines, so config files are
            // keyed by their workspace-relative path.
            let key = path
                .strip_prefix(&self.config.workspace_root)
                .unwrap_or(path)
                .to_path_buf();
            config_files.insert(key, digest);
        }

        let mut env_vars = BTreeMap::new();
        for name in &self.config.referenced_env_vars {
            let value = parameters.lookup(name);
            tracker.record_env_var(name, value.clone());
            env_vars.insert(name.clone(), value);
        }

        let mounts = self
            .config
            .mounts
            .iter()
            .map(|(name, root)| (name.clone(), Some(root.clone())))
            .collect();

        let inputs = FingerprintInputs {
            config_files,
            env_vars,
            mounts,
            engine_version: engine_version_digest(),
            commit_id: self.config.commit_id.clone(),
            filter: self.config.filter.clone(),
        };
        Ok(GraphFingerprinter::new().compute(&inputs))
    }

    /// Turn the reuse decision into a graph: either adopt a loaded one or
    /// run the frontend under the tracking context.
    ///
    /// Returns the graph, its pools, the tracker snapshot to persist,
    /// whether the cohort must be (re)saved, and a descriptor when one was
    /// adopted from the shared store.
    async fn evaluate(
        &self,
        decision: ReuseDecision,
        tracker: &InputTracker,
        parameters: &BuildParameters,
        mount_table: &MountTable,
    ) -> Result<(
        PipGraph,
        Arc<InternPools>,
        TrackerSnapshot,
        bool,
        Option<GraphDescriptor>,
    )> {
        match decision {
            ReuseDecision::FullReuse { loaded, source } => {
                let LoadedGraph {
                    graph,
                    pools,
                    snapshot,
                } = loaded;
                let adopted = match source {
                    ReuseSource::LocalCache => None,
                    ReuseSource::SharedStore { descriptor } => {
                        // Make the fetched graph this workspace's previous
                        // run so the next build short-circuits locally.
                        let record = PreviousRunRecord {
                            fingerprint: GraphFingerprint {
                                exact: descriptor.exact_fingerprint.clone(),
                                compatible: descriptor.compatible_fingerprint.clone(),
                            },
                            snapshot: snapshot.clone(),
                            artifacts: descriptor.artifacts.clone(),
                        };
                        let cache =
                            GraphCache::new(&self.config.engine_cache_dir, self.store.clone());
                        cache.adopt_previous_record(&record).await?;
                        Some(descriptor)
                    }
                };
                Ok((graph, pools, snapshot, false, adopted))
            }
            ReuseDecision::PartialReuse { loaded, changed } => {
                // The schema is reusable; the recorded observations are
                // refreshed with the current values and the cohort is
                // re-saved under the current fingerprint.
                info!(changed = changed.len(), "reusing graph schema with refreshed values");
                let LoadedGraph {
                    graph,
                    pools,
                    mut snapshot,
                } = loaded;
                for change in &changed {
                    match change {
                        crate::track::ChangedInput::EnvVar { name, current, .. } => {
                            if let Some(slot) =
                                snapshot.env_vars.iter_mut().find(|(n, _)| n == name)
                            {
                                slot.1 = current.clone();
                            }
                            tracker.record_env_var(name, current.clone());
                        }
                        crate::track::ChangedInput::Mount { name, current, .. } => {
                            if let Some(slot) =
                                snapshot.mounts.iter_mut().find(|(n, _)| n == name)
                            {
                                slot.1 = current.clone();
                            }
                            tracker.record_mount(name, current.clone());
                        }
                    }
                }
                Ok((graph, pools, snapshot, true, None))
            }
            ReuseDecision::Miss(reason) => {
                info!(%reason, "constructing graph");
                let pools = InternPools::new();
                let context = FrontendContext::new(tracker, &pools, parameters, mount_table);
                let graph = self
                    .frontend
                    .evaluate(&context)
                    .await
                    .context("frontend evaluation")?;

                // Registrations happen-before the snapshot that the saved
                // fingerprint will correlate with.
                tracker.ensure_all_hashed().await?;
                let snapshot = tracker.snapshot();
                Ok((graph, pools, snapshot, true, None))
            }
        }
    }

    async fn execute_local(
        &self,
        cache: &GraphCache<S>,
        graph: &PipGraph,
        pools: &InternPools,
        content_table: &FileContentTable,
    ) -> Result<ExecutionSummary> {
        let mut state = IncrementalState::load(&self.config.engine_cache_dir).await?;
        let summary = run_graph(
            graph,
            pools,
            &self.executor,
            &mut state,
            &self.config.workspace_root,
            content_table,
        )
        .await?;
        state.save(cache.engine_cache_dir()).await?;
        Ok(summary)
    }

    /// Orchestrator-mode execution: publish, wait for workers, promote the
    /// previous-inputs record, then dispatch until every pip completes.
    async fn execute_distributed(
        &self,
        cache: &GraphCache<S>,
        graph: &PipGraph,
        pools: &InternPools,
        descriptor: Option<GraphDescriptor>,
    ) -> Result<ExecutionSummary> {
        let orchestrator = self
            .orchestrator
            .as_ref()
            .ok_or_else(|| eyre!("orchestrator missing"))?;

        // A locally reused graph has no freshly saved descriptor; rebuild
        // one from the previous-run record (its artifacts were published to
        // the store when the graph was saved).
        let descriptor = match descriptor {
            Some(descriptor) => descriptor,
            None => {
                let record = cache
                    .read_previous_record()
                    .await?
                    .ok_or_else(|| eyre!("no graph descriptor available to publish"))?;
                GraphDescriptor::builder()
                    .exact_fingerprint(record.fingerprint.exact.clone())
                    .compatible_fingerprint(record.fingerprint.compatible.clone())
                    .artifacts(record.artifacts.clone())
                    .env_vars(record.snapshot.env_vars.iter().cloned().collect())
                    .mounts(
                        record
                            .snapshot
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
                    .build()
            }
        };

        // Publication must be durable (the save already registered the
        // descriptor in the store) before any dispatch.
        orchestrator.publish_graph(descriptor);
        orchestrator
            .wait_for_workers_or_timeout()
            .await
            .context("waiting for workers")?;

        // A cancellation that landed while workers were attaching must not
        // promote or dispatch.
        if self.cancel.is_cancelled() {
            bail!("build cancelled before pip dispatch");
        }

        // Only now is the build committed enough to promote.
        if crate::fs::exists(
            cache
                .engine_cache_dir()
                .join(crate::cache::PREVIOUS_INPUTS_STAGING_FILE),
        )
        .await
        {
            cache.finalize_previous_inputs().await?;
        }

        let mut completed = HashSet::new();
        let mut dispatched = HashSet::new();
        let mut produced: HashMap<String, Digest> = HashMap::new();
        let mut executed = 0usize;

        while completed.len() < graph.pip_count() {
            // Dispatch every pip whose dependencies are complete.
            for pip in graph.execution_order() {
                if completed.contains(&pip.id) || dispatched.contains(&pip.id) {
                    continue;
                }
                if !pip.dependencies.iter().all(|dep| completed.contains(dep)) {
                    continue;
                }
                let inputs = self.materialization_plan(pip, pools, &produced)?;
                orchestrator.dispatch(pip.id, inputs)?;
                dispatched.insert(pip.id);
            }

            match orchestrator
                .next_result(self.config.journal_timeout())
                .await?
            {
                Some((worker, result)) => match result.status {
                    PipRunStatus::Succeeded => {
                        dispatched.remove(&result.pip_id);
                        completed.insert(result.pip_id);
                        executed += 1;
                        for output in &result.outputs {
                            produced.insert(output.path.clone(), output.digest.clone());
                            let dst = self.config.workspace_root.join(&output.path);
                            self.store.blob_materialize(&output.digest, &dst).await?;
                        }
                    }
                    PipRunStatus::Failed { message } => {
                        bail!("pip {} failed on {worker}: {message}", result.pip_id);
                    }
                    PipRunStatus::NotRun => {
                        debug!(pip = %result.pip_id, "pip returned unrun; redispatching");
                        dispatched.remove(&result.pip_id);
                    }
                },
                None => {
                    // No result within the window: sweep for dead workers.
                    for stale in orchestrator.stale_workers() {
                        let orphaned = orchestrator
                            .on_worker_failure(stale, WorkerFailureKind::WorkerExit)?;
                        for pip in orphaned {
                            dispatched.remove(&pip);
                        }
                    }
                    if orchestrator.worker_count() == 0 {
                        bail!("all workers lost before the graph completed");
                    }
                }
            }
        }

        orchestrator.release_workers();
        Ok(ExecutionSummary {
            executed,
            up_to_date: graph.pip_count() - executed,
        })
    }

    /// Inputs the worker must materialize: those produced by upstream pips
    /// during this build. Source files are expected in the worker's own
    /// checkout.
    fn materialization_plan(
        &self,
        pip: &crate::graph::Pip,
        pools: &InternPools,
        produced: &HashMap<String, Digest>,
    ) -> Result<Vec<MaterializeInput>> {
        let mut plan = Vec::new();
        for input in &pip.inputs {
            let path = pools.paths.resolve(*input)?;
            if let Some(digest) = produced.get(&*path) {
                plan.push(
                    MaterializeInput::builder()
                        .path(path.to_string())
                        .digest(digest.clone())
                        .executable(false)
                        .build(),
                );
            }
        }
        Ok(plan)
    }
}

impl<S: StoreBackend, F: Frontend> EngineDriver<S, F, LocalExecutor> {
    /// A driver wired with the in-process executor rooted at the workspace.
    pub fn local(config: EngineConfig, store: S, frontend: F) -> Self {
        let executor = LocalExecutor::new(&config.workspace_root);
        Self::new(config, store, frontend, executor)
    }
}

/// Verify the store is reachable. Cheap by design: the store gets one
/// existence probe, enough to surface configuration and connectivity
/// failures before Execute needs the store for real.
async fn probe_store<S: StoreBackend>(store: S) -> Result<()> {
    let probe = Digest::from_buffer(b"forge-store-probe");
    store
        .blob_exists(&probe)
        .await
        .map(|_| ())
        .context("content store unreachable")
}

/// Run the engine as a worker: attach to the orchestrator, fetch the
/// published graph, execute dispatched pips until drained.
#[instrument(skip_all)]
pub async fn run_worker<S: StoreBackend, E: PipExecutor>(
    config: crate::distrib::WorkerConfig,
    engine_cache_dir: impl Into<PathBuf>,
    store: S,
    executor: E,
    workspace_root: impl Into<PathBuf>,
    cancel: CancellationToken,
) -> Result<crate::distrib::WorkerState> {
    let cache = GraphCache::new(engine_cache_dir.into(), store);
    let agent = crate::distrib::WorkerAgent::new(config, cache, executor, workspace_root)?;
    agent.run(cancel).await
}

