//! Engine configuration.
//!
//! The wrapping CLI owns argument parsing and defaulting; the engine
//! consumes a fully formed [`EngineConfig`]. The struct deserializes from
//! TOML so deployments can keep a config file next to the workspace.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use color_eyre::{Result, eyre::Context};
use serde::{Deserialize, Serialize};

use crate::{
    distrib::DistributionRole,
    fingerprint::EvaluationFilter,
    track::dir_fingerprint::MembershipRules,
};

/// The phase the build stops after.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize, Deserialize,
)]
pub enum StopAfter {
    /// Evaluate only: stop once the graph is constructed or reused.
    Evaluate,
    /// `CleanOnly`: construct and serialize the graph, run nothing.
    Schedule,
    /// A full build.
    #[default]
    Execute,
}

/// Everything the engine needs to run one build.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root of the workspace being built.
    pub workspace_root: PathBuf,
    /// Where pip outputs land. Exclusive-locked for the build.
    pub object_dir: PathBuf,
    /// The per-workspace engine cache. Exclusive-locked for the build.
    pub engine_cache_dir: PathBuf,
    pub logs_dir: PathBuf,

    /// The configuration files whose content defines the build. Tracked and
    /// folded into the graph fingerprint.
    pub config_files: Vec<PathBuf>,
    /// Environment variables the configuration references. Their values are
    /// folded into the exact fingerprint.
    #[serde(default)]
    pub referenced_env_vars: Vec<String>,
    /// When set, bounds what the frontend may read from the environment.
    /// Fixed before graph construction begins.
    #[serde(default)]
    pub restricted_env_vars: Option<Vec<String>>,

    /// Named mounts, name to root directory.
    #[serde(default)]
    pub mounts: BTreeMap<String, PathBuf>,
    /// Directory-membership fingerprinter rules.
    #[serde(default)]
    pub membership_rules: MembershipRules,

    #[serde(default)]
    pub filter: EvaluationFilter,
    /// Source-control commit id, when known.
    #[serde(default)]
    pub commit_id: Option<String>,

    #[serde(default)]
    pub stop_after: StopAfter,
    #[serde(default)]
    pub role: DistributionRole,

    /// Whether incremental scheduling is requested. When it is, a missing
    /// change journal is fatal rather than a degradation.
    #[serde(default)]
    pub incremental_scheduling_required: bool,

    /// Enable reusing a schema-compatible graph when only values changed.
    #[serde(default = "default_true")]
    pub enable_partial_reuse: bool,
    /// Probe the shared store by compatible fingerprint after an exact miss.
    #[serde(default = "default_true")]
    pub probe_compatible: bool,
    /// Load exactly this graph (hex exact fingerprint), skipping the reuse
    /// decision.
    #[serde(default)]
    pub explicit_graph: Option<String>,

    #[serde(default = "default_lock_poll_ms")]
    pub lock_poll_interval_ms: u64,
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
    #[serde(default = "default_journal_timeout_secs")]
    pub journal_timeout_secs: u64,
    /// Bounded grace period for suspension points after cancellation.
    #[serde(default = "default_cancellation_grace_secs")]
    pub cancellation_grace_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_lock_poll_ms() -> u64 {
    250
}

fn default_lock_timeout_secs() -> u64 {
    60
}

fn default_journal_timeout_secs() -> u64 {
    30
}

fn default_cancellation_grace_secs() -> u64 {
    15
}

impl EngineConfig {
    /// A minimal configuration rooted at `workspace_root`, with the standard
    /// output layout underneath it.
    pub fn for_workspace(workspace_root: impl Into<PathBuf>) -> Self {
        let workspace_root = workspace_root.into();
        let out = workspace_root.join("out");
        Self {
            object_dir: out.join("objects"),
            engine_cache_dir: out.join("engine-cache"),
            logs_dir: out.join("logs"),
            workspace_root,
            config_files: Vec::new(),
            referenced_env_vars: Vec::new(),
            restricted_env_vars: None,
            mounts: BTreeMap::new(),
            membership_rules: MembershipRules::default(),
            filter: EvaluationFilter::default(),
            commit_id: None,
            stop_after: StopAfter::default(),
            role: DistributionRole::default(),
            incremental_scheduling_required: false,
            enable_partial_reuse: true,
            probe_compatible: true,
            explicit_graph: None,
            lock_poll_interval_ms: default_lock_poll_ms(),
            lock_timeout_secs: default_lock_timeout_secs(),
            journal_timeout_secs: default_journal_timeout_secs(),
            cancellation_grace_secs: default_cancellation_grace_secs(),
        }
    }

    /// Parse a configuration from a TOML file.
    pub async fn from_file(path: impl AsRef<Path> + std::fmt::Debug) -> Result<Self> {
        let content = crate::fs::must_read_buffered(&path).await?;
        let content = String::from_utf8(content).context("configuration is not UTF-8")?;
        toml::from_str(&content).with_context(|| format!("parse configuration {path:?}"))
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn journal_timeout(&self) -> Duration {
        Duration::from_secs(self.journal_timeout_secs)
    }

    pub fn cancellation_grace(&self) -> Duration {
        Duration::from_secs(self.cancellation_grace_secs)
    }
}
