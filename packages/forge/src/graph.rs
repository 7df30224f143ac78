//! The pip graph: an immutable DAG of build actions.
//!
//! A pip is an immutable description of one unit of work — a process
//! invocation, a file copy, a file write, or a sealed directory — with its
//! inputs, outputs, and environment. The graph is constructed once through
//! [`PipGraphBuilder`] and never mutated afterwards: no pip is ever added or
//! removed from a built graph.
//!
//! Pips reference names through the intern pools ([`crate::intern`]); the
//! serialized graph therefore only round-trips together with its pools,
//! which the cache layer guarantees by storing them in one artifact cohort.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use color_eyre::{
    Result,
    eyre::{bail, eyre},
};
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::intern::{PathId, StringId, SymbolId};
pub use ferry::v1::distrib::PipId;

/// What one pip does.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum PipKind {
    /// Run a process with the given executable, arguments, and working
    /// directory.
    Process {
        executable: PathId,
        arguments: Vec<StringId>,
        working_dir: PathId,
    },
    /// Copy one file to another location.
    CopyFile { source: PathId, destination: PathId },
    /// Write literal contents to a file.
    WriteFile {
        destination: PathId,
        contents: StringId,
    },
    /// Seal a directory: fix its membership at graph-construction time so
    /// consumers may depend on the directory as a whole.
    SealDirectory { root: PathId, members: Vec<PathId> },
}

/// An immutable description of a unit of work.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Pip {
    pub id: PipId,
    /// Human-meaningful name, e.g. the target the pip belongs to.
    pub name: SymbolId,
    pub kind: PipKind,
    /// Paths the pip reads.
    pub inputs: Vec<PathId>,
    /// Paths the pip produces.
    pub outputs: Vec<PathId>,
    /// Environment the pip runs with.
    pub env: BTreeMap<StringId, StringId>,
    /// Pips that must complete before this one may run.
    pub dependencies: Vec<PipId>,
}

/// A named alias for a root directory with access policies.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Mount {
    pub name: String,
    pub root: PathBuf,
    pub readable: bool,
    pub writable: bool,
    /// Whether stale outputs under this mount may be scrubbed.
    pub scrubbable: bool,
}

/// A directed acyclic graph of pips with mount metadata.
///
/// Immutable once constructed; obtain one through [`PipGraphBuilder`] or by
/// deserializing a previously serialized graph.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct PipGraph {
    pips: Vec<Pip>,
    mounts: BTreeMap<String, Mount>,
}

impl PipGraph {
    /// Look up a pip by id.
    pub fn pip(&self, id: PipId) -> Result<&Pip> {
        self.pips
            .get(id.raw() as usize)
            .ok_or_else(|| eyre!("graph has no pip {id}"))
    }

    /// All pips, in id order.
    pub fn pips(&self) -> &[Pip] {
        &self.pips
    }

    pub fn pip_count(&self) -> usize {
        self.pips.len()
    }

    /// The graph's mounts, keyed by name.
    pub fn mounts(&self) -> &BTreeMap<String, Mount> {
        &self.mounts
    }

    /// Pips in a valid execution order (dependencies before dependents).
    ///
    /// Construction guarantees dependencies have smaller ids, so id order is
    /// already topological.
    pub fn execution_order(&self) -> impl Iterator<Item = &Pip> {
        self.pips.iter()
    }

    /// Ids of pips that directly depend on `id`.
    pub fn dependents(&self, id: PipId) -> Vec<PipId> {
        self.pips
            .iter()
            .filter(|pip| pip.dependencies.contains(&id))
            .map(|pip| pip.id)
            .collect()
    }
}

/// Builds a [`PipGraph`].
///
/// Dependencies may only reference pips already added, which makes cycles
/// unrepresentable and keeps id order topological.
#[derive(Debug, Default)]
pub struct PipGraphBuilder {
    pips: Vec<Pip>,
    mounts: BTreeMap<String, Mount>,
    output_paths: HashSet<PathId>,
}

impl PipGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mount. Mount names are unique.
    pub fn add_mount(&mut self, mount: Mount) -> Result<()> {
        if self.mounts.contains_key(&mount.name) {
            bail!("duplicate mount {:?}", mount.name);
        }
        self.mounts.insert(mount.name.clone(), mount);
        Ok(())
    }

    /// Add a pip, assigning it the next id.
    ///
    /// `dependencies` must all reference pips already added, and no two pips
    /// may declare the same output path.
    pub fn add_pip(
        &mut self,
        name: SymbolId,
        kind: PipKind,
        inputs: Vec<PathId>,
        outputs: Vec<PathId>,
        env: BTreeMap<StringId, StringId>,
        dependencies: Vec<PipId>,
    ) -> Result<PipId> {
        let id = PipId::new(self.pips.len() as u32);
        for dep in &dependencies {
            if dep.raw() as usize >= self.pips.len() {
                bail!("pip dependency {dep} does not exist yet");
            }
        }
        for output in &outputs {
            if !self.output_paths.insert(*output) {
                bail!("output path {output:?} already produced by another pip");
            }
        }
        self.pips.push(Pip {
            id,
            name,
            kind,
            inputs,
            outputs,
            env,
            dependencies,
        });
        Ok(id)
    }

    /// Finish construction. The graph is immutable from here on.
    pub fn build(self) -> PipGraph {
        PipGraph {
            pips: self.pips,
            mounts: self.mounts,
        }
    }
}

/// The reason a graph could not be reused, carried on reuse decisions and
/// logged with the decision.
#[derive(Debug, Clone, Eq, PartialEq, Display, Serialize, Deserialize)]
pub enum MissReason {
    #[display("no previous inputs recorded")]
    NoPreviousInputs,
    #[display("tracked inputs changed: {_0}")]
    InputsChanged(String),
    #[display("input change detection was unable to decide: {_0}")]
    UnableToDetect(String),
    #[display("no graph registered under the fingerprint")]
    NotInStore,
    #[display("serialized graph failed to load: {_0}")]
    LoadFailed(String),
}
