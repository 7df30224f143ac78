//! Build failure accounting.
//!
//! Failures are values, not exceptions: operations return results, the
//! driver records each failure once with a stable event id, and decides
//! locally whether it is fatal given the current phase and configuration.
//!
//! The driver's success flag and the failure log must agree — no error
//! logged means success, an error logged means failure — and that agreement
//! is verified after every phase. Cancellation suspends the invariant: a
//! cancelled build logs a cancellation error but the log is treated as
//! non-diagnostic.

use color_eyre::{Report, Result, eyre::bail};
use derive_more::Display;
use tracing::error;

/// The failure taxonomy. Event ids are stable so users can search logs for
/// a kind across engine versions.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
pub enum FailureKind {
    /// User-visible configuration problem; fatal before any work.
    ConfigurationInvalid,
    /// Another process holds a directory lock.
    LockUnavailable,
    /// The content-addressed store could not be initialized.
    CacheInitializationFailed,
    /// The graph could not be serialized. The next build rebuilds.
    GraphSerializationFailed,
    /// Input change detection could not decide; downgrades reuse to a miss.
    InputTrackerUnableToDetect,
    /// A retriable distribution failure.
    DistributionTransient,
    /// A distribution failure that aborts the build.
    DistributionFatal,
    /// A change journal is required but the filesystem cannot provide one.
    FilesystemCapabilityMissing,
    /// An IO failure converted to a result instead of propagating.
    RecoverableIo,
    /// A pip failed during execution.
    ExecutionFailed,
    /// The build was cancelled.
    Cancelled,
}

impl FailureKind {
    /// The stable event id users search logs by.
    pub fn event_id(self) -> u16 {
        match self {
            Self::ConfigurationInvalid => 1001,
            Self::LockUnavailable => 1002,
            Self::CacheInitializationFailed => 1003,
            Self::GraphSerializationFailed => 1004,
            Self::InputTrackerUnableToDetect => 1005,
            Self::DistributionTransient => 1006,
            Self::DistributionFatal => 1007,
            Self::FilesystemCapabilityMissing => 1008,
            Self::RecoverableIo => 1009,
            Self::ExecutionFailed => 1010,
            Self::Cancelled => 1011,
        }
    }
}

/// One recorded failure.
#[derive(Debug, Display)]
#[display("[DX{event_id:04}] {kind}: {message}")]
pub struct LoggedFailure {
    pub kind: FailureKind,
    pub event_id: u16,
    pub message: String,
}

/// The driver's failure log plus the monotonic success flag.
#[derive(Debug, Default)]
pub struct FailureLog {
    failures: Vec<LoggedFailure>,
    cancelled: bool,
}

impl FailureLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure, logging exactly one diagnostic for it.
    pub fn record(&mut self, kind: FailureKind, report: Report) {
        let failure = LoggedFailure {
            kind,
            event_id: kind.event_id(),
            message: format!("{report:#}"),
        };
        error!(event_id = failure.event_id, kind = %kind, "{}", failure.message);
        self.failures.push(failure);
    }

    /// Record cancellation. The success/error-log agreement is suspended
    /// from here on.
    pub fn record_cancellation(&mut self) {
        self.cancelled = true;
        self.record(
            FailureKind::Cancelled,
            color_eyre::eyre::eyre!("build cancelled"),
        );
    }

    /// The monotonic success flag: true until the first failure.
    pub fn success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn failures(&self) -> &[LoggedFailure] {
        &self.failures
    }

    pub fn into_failures(self) -> Vec<LoggedFailure> {
        self.failures
    }

    /// Verify the success flag and the error log agree. Called after every
    /// phase; suspended under cancellation.
    pub fn verify_consistency(&self, success: bool) -> Result<()> {
        if self.cancelled {
            return Ok(());
        }
        if success != self.failures.is_empty() {
            bail!(
                "success flag ({success}) disagrees with failure log ({} failures)",
                self.failures.len(),
            );
        }
        Ok(())
    }

    /// The aggregated end-of-build summary, one line per failure.
    pub fn summary(&self) -> String {
        self.failures
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }
}
