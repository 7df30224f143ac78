//! Distributed build coordination.
//!
//! Only present when the engine runs as an orchestrator or a worker; a
//! single-machine build never touches this module. The orchestrator serves
//! the worker-facing HTTP API and owns dispatch; workers attach, fetch the
//! published graph from the shared store, and execute pips. The wire types
//! live in `ferry::v1::distrib`.

pub mod orchestrator;
pub mod retry;
pub mod worker;

use derive_more::Display;
use serde::{Deserialize, Serialize};

pub use orchestrator::{Orchestrator, OrchestratorConfig, WorkerFailureKind};
pub use retry::{ClassifiedFailure, FailureClass, RetryPolicy, classify};
pub use worker::{WorkerAgent, WorkerConfig, WorkerState};

/// Which role this engine process plays in a distributed build.
#[derive(
    Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Default, Serialize, Deserialize,
)]
pub enum DistributionRole {
    /// Single-machine build; no coordinator exists.
    #[default]
    None,
    /// Owns the graph and dispatches pips.
    Orchestrator,
    /// Executes pips dispatched by an orchestrator.
    Worker,
}

impl DistributionRole {
    pub fn is_distributed(&self) -> bool {
        !matches!(self, Self::None)
    }
}
