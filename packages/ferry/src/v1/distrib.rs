//! The orchestrator/worker wire protocol.
//!
//! A distributed build has one orchestrator that owns the pip graph and any
//! number of workers that execute pips. Workers initiate every exchange: they
//! attach, poll for dispatched work, post results, heartbeat, and say bye.
//! The orchestrator never opens a connection to a worker.
//!
//! ## Sequence numbers
//!
//! Every dispatch carries a sequence number that is monotonically increasing
//! per (orchestrator, worker) pair. Worker replies reference that number, so
//! a late reply from a previously-failed dispatch attempt can be recognized
//! and dropped instead of being mistaken for the current attempt.

use bon::Builder;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use super::{Digest, GraphDescriptor};

/// Identifies one attached worker for the lifetime of its attachment.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize,
)]
#[display("{_0}")]
pub struct WorkerId(Uuid);

impl WorkerId {
    /// Mint a fresh worker id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

/// A dispatch sequence number, monotone per (orchestrator, worker).
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize,
)]
#[display("{_0}")]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    pub const ZERO: SequenceNumber = SequenceNumber(0);

    /// The next sequence number after this one.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// A stable identifier for a pip within one pip graph.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize,
)]
#[display("Pip{_0}")]
pub struct PipId(u32);

impl PipId {
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

/// What the orchestrator tells workers about itself at attach time.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize, Builder)]
#[non_exhaustive]
pub struct OrchestratorInfo {
    /// Base URL workers should use for all subsequent calls.
    pub url: Url,
    /// Identifies the build session; a worker attached to a stale session is
    /// told to go away rather than being handed pips from a different build.
    pub session_id: Uuid,
}

/// Worker → orchestrator: request to join the build.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize, Builder)]
#[non_exhaustive]
pub struct AttachRequest {
    /// The worker's self-minted id.
    pub worker_id: WorkerId,
    /// Digest of the worker's effective configuration. The orchestrator
    /// rejects workers whose configuration diverges from the build's.
    pub config_digest: Digest,
    /// Number of pips the worker is willing to run concurrently.
    pub capacity: u32,
}

/// Orchestrator → worker: attach outcome.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize, Builder)]
#[non_exhaustive]
pub struct AttachResponse {
    pub orchestrator_info: OrchestratorInfo,
    /// The graph to fetch and load before reporting ready. `None` until the
    /// orchestrator has published a graph; workers re-poll until it appears.
    pub graph_descriptor: Option<GraphDescriptor>,
}

/// Orchestrator → worker (via work poll): run this pip.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize, Builder)]
#[non_exhaustive]
pub struct ExecutePip {
    pub seq: SequenceNumber,
    pub pip_id: PipId,
    /// Input blobs the worker must materialize before running the pip.
    #[builder(default)]
    pub inputs: Vec<MaterializeInput>,
}

/// One input blob a worker materializes before executing a pip.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize, Builder)]
#[non_exhaustive]
pub struct MaterializeInput {
    /// Workspace-relative destination path, serialized platform-independent.
    pub path: String,
    /// Digest of the blob in the shared content store.
    pub digest: Digest,
    pub executable: bool,
}

/// Worker → orchestrator: outcome of one dispatched pip.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize, Builder)]
#[non_exhaustive]
pub struct PipResult {
    /// Echoes the dispatch sequence number. Results with a sequence number
    /// the orchestrator doesn't recognize as current are dropped.
    pub seq: SequenceNumber,
    pub pip_id: PipId,
    pub status: PipRunStatus,
    /// Output blobs produced by the pip, already stored to the content store.
    #[builder(default)]
    pub outputs: Vec<PipOutput>,
}

/// One output blob a pip produced.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize, Builder)]
#[non_exhaustive]
pub struct PipOutput {
    /// Workspace-relative path, serialized platform-independent.
    pub path: String,
    pub digest: Digest,
    pub executable: bool,
}

/// Terminal status of one pip execution.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum PipRunStatus {
    Succeeded,
    Failed { message: String },
    /// The worker is going away and never ran the pip; the orchestrator
    /// should reassign it.
    NotRun,
}

/// Worker → orchestrator: periodic liveness and load report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[non_exhaustive]
pub struct Heartbeat {
    /// Normalized load of the worker host (1.0 = all logical processors busy).
    pub worker_load: f64,
    /// Pips dispatched to the worker but not yet completed.
    pub queue_depth: u32,
}

/// Worker → orchestrator: the worker is leaving the build.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize, Builder)]
#[non_exhaustive]
pub struct Bye {
    pub reason: ByeReason,
}

/// Why a worker left.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum ByeReason {
    /// All dispatched work drained; normal exit.
    Drained,
    /// The worker never became ready (attach or graph load failed).
    FailedBeforeReady { message: String },
    /// The worker hit an unrecoverable error while executing.
    Crashed { message: String },
}

/// Orchestrator → worker: response to a work poll.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum WorkPollResponse {
    /// Run this pip.
    Execute(ExecutePip),
    /// Nothing dispatched right now; poll again.
    Idle,
    /// The build is complete or the worker is released; drain and exit.
    Drain,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    #[test]
    fn sequence_numbers_are_monotone() {
        let s0 = SequenceNumber::ZERO;
        let s1 = s0.next();
        let s2 = s1.next();
        assert!(s0 < s1 && s1 < s2);
    }

    #[test]
    fn execute_pip_round_trip() {
        let message = ExecutePip::builder()
            .seq(SequenceNumber::ZERO.next())
            .pip_id(PipId::new(7))
            .inputs(vec![
                MaterializeInput::builder()
                    .path("src/in.txt".to_string())
                    .digest(Digest::from_buffer(b"input"))
                    .executable(false)
                    .build(),
            ])
            .build();
        let json = serde_json::to_string(&message).unwrap();
        let back = serde_json::from_str::<ExecutePip>(&json).unwrap();
        pretty_assert_eq!(message, back);
    }

    #[test]
    fn work_poll_variants_round_trip() {
        for message in [
            WorkPollResponse::Idle,
            WorkPollResponse::Drain,
            WorkPollResponse::Execute(
                ExecutePip::builder()
                    .seq(SequenceNumber::ZERO)
                    .pip_id(PipId::new(0))
                    .build(),
            ),
        ] {
            let json = serde_json::to_string(&message).unwrap();
            let back = serde_json::from_str::<WorkPollResponse>(&json).unwrap();
            pretty_assert_eq!(message, back);
        }
    }
}
