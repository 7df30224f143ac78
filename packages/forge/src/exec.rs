//! Pip execution.
//!
//! Actually running a pip (sandboxing, file-access monitoring) is the
//! scheduler/executor's business, an external collaborator of the engine.
//! The engine's Execute phase needs only the contract: [`PipExecutor`].
//! [`LocalExecutor`] is the in-process implementation used for
//! single-machine builds and tests.
//!
//! The phase is incremental at the pip level: each pip's inputs are hashed
//! and compared against the `IncrementalSchedulingState` of the previous
//! run, and a pip whose inputs are unchanged and whose outputs exist is
//! skipped. This is what makes a fully reused graph cheap to "execute" and
//! what re-runs exactly the affected pips when one input file changes.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use ferry::v1::Digest;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, trace};

use crate::{
    content_table::FileContentTable,
    envelope::{self, Compression, FileEnvelopeId},
    fs,
    graph::{Pip, PipGraph, PipKind},
    intern::InternPools,
};

/// The engine-cache file incremental state persists to.
pub const INCREMENTAL_STATE_FILE: &str = "IncrementalSchedulingState";

/// Executes individual pips.
pub trait PipExecutor: Send + Sync {
    fn execute(
        &self,
        pip: &Pip,
        pools: &InternPools,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Runs pips in-process against a workspace directory.
#[derive(Clone, Debug)]
pub struct LocalExecutor {
    workspace_root: PathBuf,
}

impl LocalExecutor {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }
}

impl PipExecutor for LocalExecutor {
    #[instrument(skip_all, fields(pip = %pip.id))]
    async fn execute(&self, pip: &Pip, pools: &InternPools) -> Result<()> {
        match &pip.kind {
            PipKind::Process {
                executable,
                arguments,
                working_dir,
            } => {
                let executable = self.resolve(&pools.paths.resolve(*executable)?);
                let working_dir = self.resolve(&pools.paths.resolve(*working_dir)?);
                let mut command = tokio::process::Command::new(&executable);
                for argument in arguments {
                    command.arg(&*pools.strings.resolve(*argument)?);
                }
                for (name, value) in &pip.env {
                    command.env(
                        &*pools.strings.resolve(*name)?,
                        &*pools.strings.resolve(*value)?,
                    );
                }
                command.current_dir(&working_dir);

                let status = command
                    .status()
                    .await
                    .with_context(|| format!("spawn {executable:?}"))?;
                if !status.success() {
                    bail!("process pip {} exited with {status}", pip.id);
                }
                Ok(())
            }
            PipKind::CopyFile {
                source,
                destination,
            } => {
                let source = self.resolve(&pools.paths.resolve(*source)?);
                let destination = self.resolve(&pools.paths.resolve(*destination)?);
                if let Some(parent) = destination.parent() {
                    fs::create_dir_all(parent).await?;
                }
                tokio::fs::copy(&source, &destination)
                    .await
                    .with_context(|| format!("copy {source:?} to {destination:?}"))?;
                Ok(())
            }
            PipKind::WriteFile {
                destination,
                contents,
            } => {
                let destination = self.resolve(&pools.paths.resolve(*destination)?);
                if let Some(parent) = destination.parent() {
                    fs::create_dir_all(parent).await?;
                }
                fs::write_atomic(&destination, pools.strings.resolve(*contents)?.as_bytes()).await
            }
            PipKind::SealDirectory { root, members } => {
                // Sealing fixes membership at graph-construction time; at
                // execution time we only verify the members exist.
                let root = self.resolve(&pools.paths.resolve(*root)?);
                for member in members {
                    let member = root.join(&*pools.paths.resolve(*member)?);
                    if !fs::exists(&member).await {
                        bail!("sealed directory member {member:?} is missing");
                    }
                }
                Ok(())
            }
        }
    }
}

/// Per-pip input digests from the previous run.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct IncrementalState {
    pips: BTreeMap<u32, Digest>,
}

impl IncrementalState {
    fn envelope_id() -> FileEnvelopeId {
        FileEnvelopeId::for_kind("IncrementalSchedulingState")
    }

    /// Load from the engine cache, or start empty when absent or written by
    /// a different engine generation.
    #[instrument]
    pub async fn load(engine_cache_dir: impl AsRef<Path> + std::fmt::Debug) -> Result<Self> {
        let path = engine_cache_dir.as_ref().join(INCREMENTAL_STATE_FILE);
        let Some(payload) = envelope::read_file(&path, Self::envelope_id()).await? else {
            return Ok(Self::default());
        };
        serde_json::from_slice(&payload).context("parse incremental scheduling state")
    }

    #[instrument(skip(self))]
    pub async fn save(&self, engine_cache_dir: impl AsRef<Path> + std::fmt::Debug) -> Result<()> {
        let path = engine_cache_dir.as_ref().join(INCREMENTAL_STATE_FILE);
        let payload = serde_json::to_vec(self).context("serialize incremental scheduling state")?;
        envelope::write_file(&path, Self::envelope_id(), Compression::Zstd, &payload).await
    }
}

/// Counts from one Execute phase.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ExecutionSummary {
    pub executed: usize,
    pub up_to_date: usize,
}

/// Run every pip of the graph in dependency order, skipping pips whose
/// inputs are unchanged and whose outputs exist.
#[instrument(skip_all, fields(pips = graph.pip_count()))]
pub async fn run_graph<E: PipExecutor>(
    graph: &PipGraph,
    pools: &InternPools,
    executor: &E,
    state: &mut IncrementalState,
    workspace_root: &Path,
    content_table: &FileContentTable,
) -> Result<ExecutionSummary> {
    let mut summary = ExecutionSummary::default();

    for pip in graph.execution_order() {
        let fingerprint = pip_input_fingerprint(pip, pools, workspace_root, content_table).await?;
        let outputs_present = outputs_exist(pip, pools, workspace_root).await?;

        if outputs_present && state.pips.get(&pip.id.raw()) == Some(&fingerprint) {
            trace!(pip = %pip.id, "inputs unchanged and outputs present; skipping");
            summary.up_to_date += 1;
            continue;
        }

        debug!(pip = %pip.id, name = %pools.symbols.resolve(pip.name)?, "executing pip");
        executor.execute(pip, pools).await?;

        // Re-fingerprint after execution: inputs produced by dependencies
        // were hashed above, but the pip may also have been re-run because
        // its outputs were missing.
        let fingerprint = pip_input_fingerprint(pip, pools, workspace_root, content_table).await?;
        state.pips.insert(pip.id.raw(), fingerprint);
        summary.executed += 1;
    }

    info!(
        executed = summary.executed,
        up_to_date = summary.up_to_date,
        "execute phase complete",
    );
    Ok(summary)
}

/// Digest over the pip definition and the current content of its inputs.
async fn pip_input_fingerprint(
    pip: &Pip,
    pools: &InternPools,
    workspace_root: &Path,
    content_table: &FileContentTable,
) -> Result<Digest> {
    let mut fields: Vec<Vec<u8>> = Vec::new();
    fields.push(serde_json::to_vec(pip).context("serialize pip")?);
    for input in &pip.inputs {
        let resolved = resolve(workspace_root, &pools.paths.resolve(*input)?);
        fields.push(resolved.to_string_lossy().into_owned().into_bytes());
        if fs::exists(&resolved).await {
            let digest = match content_table.try_get_known_hash(&resolved).await? {
                Some((_, digest)) => digest,
                None => content_table.hash_and_record(&resolved).await?.1,
            };
            fields.push(digest.as_bytes().to_vec());
        } else {
            fields.push(b"absent".to_vec());
        }
    }
    Ok(Digest::from_fields(fields))
}

async fn outputs_exist(pip: &Pip, pools: &InternPools, workspace_root: &Path) -> Result<bool> {
    for output in &pip.outputs {
        let resolved = resolve(workspace_root, &pools.paths.resolve(*output)?);
        if !fs::exists(&resolved).await {
            return Ok(false);
        }
    }
    Ok(true)
}

fn resolve(workspace_root: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace_root.join(path)
    }
}
