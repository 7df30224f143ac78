//! Build phases.
//!
//! The driver sequences a build as a state machine over phases; every phase
//! emits a start and an end marker to the telemetry sink, and phase ends
//! carry whether the phase succeeded. Phases only ever advance.

use derive_more::Display;
use strum::EnumIter;
use tracing::info;

use crate::config::StopAfter;

/// The build phases, in order.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, EnumIter)]
pub enum Phase {
    None,
    Config,
    Parse,
    Evaluate,
    Schedule,
    Execute,
    Done,
}

impl Phase {
    /// The phase after this one.
    pub fn next(self) -> Phase {
        match self {
            Self::None => Self::Config,
            Self::Config => Self::Parse,
            Self::Parse => Self::Evaluate,
            Self::Evaluate => Self::Schedule,
            Self::Schedule => Self::Execute,
            Self::Execute | Self::Done => Self::Done,
        }
    }

    /// Whether this phase runs under the given stop-after selection.
    pub fn enabled(self, stop_after: StopAfter) -> bool {
        match self {
            Self::None | Self::Done => true,
            Self::Config | Self::Parse | Self::Evaluate => true,
            Self::Schedule => stop_after >= StopAfter::Schedule,
            Self::Execute => stop_after >= StopAfter::Execute,
        }
    }
}

/// Tracks the current phase and emits start/end markers.
#[derive(Debug)]
pub struct PhaseTracker {
    current: Phase,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self {
            current: Phase::None,
        }
    }

    pub fn current(&self) -> Phase {
        self.current
    }

    /// Enter a phase, emitting the start marker.
    ///
    /// Phases only move forward; entering an earlier phase is a programming
    /// error caught in debug builds.
    pub fn start(&mut self, phase: Phase) {
        debug_assert!(
            phase >= self.current,
            "phase {phase} started after {}",
            self.current,
        );
        self.current = phase;
        info!(phase = %phase, marker = "start", "phase start");
    }

    /// Emit the end marker for the current phase.
    pub fn end(&mut self, succeeded: bool) {
        info!(phase = %self.current, marker = "end", succeeded, "phase end");
    }
}
