//! The engine↔frontend boundary.
//!
//! The frontend evaluates build specifications into a pip graph; the engine
//! owns input tracking, mounts, and environment access. The two meet in a
//! capability set: during the Evaluate phase the engine hands the frontend a
//! [`FrontendContext`] exposing exactly `read_file`, `track_directory`,
//! `probe_existence`, `lookup_env`, and `lookup_mount`. The frontend holds
//! no other reference to the engine, and the context does not outlive the
//! phase.
//!
//! Every read through the context is recorded by the input tracker, which
//! is what makes the next build's reuse decision sound.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use color_eyre::Result;
use dashmap::DashMap;
use derive_more::Debug;
use ferry::v1::Digest;
use tracing::{error, instrument, trace};

use crate::{
    fs,
    graph::PipGraph,
    intern::InternPools,
    track::{Existence, InputTracker, dir_fingerprint::DirectoryMember},
};

/// A frontend: evaluates specifications into a pip graph.
///
/// Implementations live outside the engine; the engine only requires that
/// every filesystem and environment read goes through the provided context.
pub trait Frontend: Send + Sync {
    fn evaluate(
        &self,
        context: &FrontendContext<'_>,
    ) -> impl Future<Output = Result<PipGraph>> + Send;
}

#[derive(Debug)]
struct ParameterSlot {
    value: Option<String>,
    used: AtomicBool,
}

/// The build parameters (environment variables) the frontend may read.
///
/// The set is fixed before graph construction begins; reads mark parameters
/// used with an atomic flag so concurrent readers observe a monotonically
/// non-decreasing use-state without locks. Once
/// [`BuildParameters::finish_tracking`] is called the set is frozen: later
/// reads are answered but recorded separately and flagged as a programming
/// error, never silently mixed into the current fingerprint.
#[derive(Debug, Default)]
pub struct BuildParameters {
    #[debug("{} parameters", entries.len())]
    entries: DashMap<String, ParameterSlot>,
    frozen: AtomicBool,
    #[debug(skip)]
    late_reads: DashMap<String, Option<String>>,
}

impl BuildParameters {
    /// Capture parameters from the process environment, bounded by the
    /// restricted set when one is configured.
    pub fn from_env(restricted: Option<&[String]>) -> Self {
        let entries = DashMap::new();
        for (name, value) in std::env::vars() {
            if restricted.is_none_or(|allowed| allowed.contains(&name)) {
                entries.insert(
                    name,
                    ParameterSlot {
                        value: Some(value),
                        used: AtomicBool::new(false),
                    },
                );
            }
        }
        Self {
            entries,
            frozen: AtomicBool::new(false),
            late_reads: DashMap::new(),
        }
    }

    /// Build a parameter set from explicit values.
    pub fn from_values(values: BTreeMap<String, String>) -> Self {
        let entries = DashMap::new();
        for (name, value) in values {
            entries.insert(
                name,
                ParameterSlot {
                    value: Some(value),
                    used: AtomicBool::new(false),
                },
            );
        }
        Self {
            entries,
            frozen: AtomicBool::new(false),
            late_reads: DashMap::new(),
        }
    }

    /// Look up a parameter, marking it used.
    ///
    /// After `finish_tracking`, reads still answer (the caller needs a
    /// value) but are recorded in the late-read set and reported as a
    /// programming error.
    pub fn lookup(&self, name: &str) -> Option<String> {
        let value = self
            .entries
            .get(name)
            .and_then(|slot| slot.value.clone());

        if self.frozen.load(Ordering::Acquire) {
            error!(
                name,
                "build parameter read after finish_tracking_build_parameters; \
                 excluded from the current fingerprint",
            );
            self.late_reads.insert(name.to_string(), value.clone());
            debug_assert!(false, "build parameter {name:?} read after tracking finished");
            return value;
        }

        if let Some(slot) = self.entries.get(name) {
            slot.used.store(true, Ordering::Release);
        } else {
            // Record the absence so a later definition of the variable is a
            // visible change.
            self.entries.insert(
                name.to_string(),
                ParameterSlot {
                    value: None,
                    used: AtomicBool::new(true),
                },
            );
        }
        value
    }

    /// Freeze the parameter set. Reads from here on are late reads.
    pub fn finish_tracking(&self) {
        self.frozen.store(true, Ordering::Release);
        trace!("build parameter tracking finished");
    }

    /// The parameters read so far, name to value-or-absence, sorted.
    pub fn used(&self) -> BTreeMap<String, Option<String>> {
        self.entries
            .iter()
            .filter(|entry| entry.value().used.load(Ordering::Acquire))
            .map(|entry| (entry.key().clone(), entry.value().value.clone()))
            .collect()
    }

    /// Reads that happened after the freeze, for diagnostics.
    pub fn late_reads(&self) -> BTreeMap<String, Option<String>> {
        self.late_reads
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

#[derive(Debug)]
struct MountSlot {
    root: PathBuf,
    used: AtomicBool,
}

/// The named mounts a build may reference.
///
/// Like build parameters, lookups mark mounts used through an atomic flag.
#[derive(Debug, Default)]
pub struct MountTable {
    #[debug("{} mounts", mounts.len())]
    mounts: DashMap<String, MountSlot>,
}

impl MountTable {
    pub fn new(mounts: BTreeMap<String, PathBuf>) -> Self {
        let table = DashMap::new();
        for (name, root) in mounts {
            table.insert(
                name,
                MountSlot {
                    root,
                    used: AtomicBool::new(false),
                },
            );
        }
        Self { mounts: table }
    }

    /// Resolve a mount by name, marking it used.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        self.mounts.get(name).map(|slot| {
            slot.used.store(true, Ordering::Release);
            slot.root.clone()
        })
    }

    /// All mounts, name to root, sorted.
    pub fn all(&self) -> BTreeMap<String, PathBuf> {
        self.mounts
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().root.clone()))
            .collect()
    }

    /// The mounts resolved so far.
    pub fn used(&self) -> BTreeMap<String, PathBuf> {
        self.mounts
            .iter()
            .filter(|entry| entry.value().used.load(Ordering::Acquire))
            .map(|entry| (entry.key().clone(), entry.value().root.clone()))
            .collect()
    }
}

/// The capability set the engine hands the frontend for one Evaluate phase.
#[derive(Debug)]
pub struct FrontendContext<'a> {
    tracker: &'a InputTracker,
    pools: &'a InternPools,
    parameters: &'a BuildParameters,
    mounts: &'a MountTable,
}

impl<'a> FrontendContext<'a> {
    pub fn new(
        tracker: &'a InputTracker,
        pools: &'a InternPools,
        parameters: &'a BuildParameters,
        mounts: &'a MountTable,
    ) -> Self {
        Self {
            tracker,
            pools,
            parameters,
            mounts,
        }
    }

    /// The intern pools graph construction should allocate from.
    pub fn pools(&self) -> &InternPools {
        self.pools
    }

    /// Read a file, recording the access.
    #[instrument(skip(self))]
    pub async fn read_file(&self, path: impl AsRef<Path> + std::fmt::Debug) -> Result<Vec<u8>> {
        let path = path.as_ref();
        self.tracker.register_file_access(path).await?;
        fs::must_read_buffered(path).await
    }

    /// Record a directory enumeration, returning its membership fingerprint.
    #[instrument(skip(self, members))]
    pub async fn track_directory(
        &self,
        path: impl AsRef<Path> + std::fmt::Debug,
        members: Option<Vec<DirectoryMember>>,
    ) -> Result<Digest> {
        self.tracker.track_directory(path, members).await
    }

    /// Probe whether a path exists, recording an anti-dependency for
    /// absence.
    #[instrument(skip(self))]
    pub async fn probe_existence(
        &self,
        path: impl AsRef<Path> + std::fmt::Debug,
    ) -> Result<Existence> {
        self.tracker.probe_existence(path).await
    }

    /// Look up an environment variable, recording the read.
    pub fn lookup_env(&self, name: &str) -> Option<String> {
        let value = self.parameters.lookup(name);
        self.tracker.record_env_var(name, value.clone());
        value
    }

    /// Look up a mount, recording the read.
    pub fn lookup_mount(&self, name: &str) -> Option<PathBuf> {
        let resolved = self.mounts.resolve(name);
        self.tracker.record_mount(name, resolved.clone());
        resolved
    }
}
