//! Retry policy for distribution network calls.
//!
//! Network operations between orchestrator and workers are idempotent (the
//! sequence-number scheme makes replays safe), so transient failures are
//! retried with exponential backoff and jitter. After the attempt budget is
//! exhausted the failure is classified so the caller can decide between
//! degrading and aborting.

use std::time::Duration;

use color_eyre::{Report, Result};
use rand::Rng;
use tracing::{debug, warn};

/// How a failed network operation should be treated.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum FailureClass {
    /// Worth retrying; the peer is probably still there.
    NetworkTransient,
    /// Retrying won't help.
    Fatal,
}

/// Classify a failure by its error taxonomy.
///
/// Connection-level problems (refused, reset, timed out) and server-side
/// errors are transient; everything else (bad request, protocol mismatch,
/// local logic errors) is fatal.
pub fn classify(report: &Report) -> FailureClass {
    for cause in report.chain() {
        if let Some(err) = cause.downcast_ref::<reqwest::Error>() {
            if err.is_timeout() || err.is_connect() || err.is_request() {
                return FailureClass::NetworkTransient;
            }
            if let Some(status) = err.status() {
                if status.is_server_error() {
                    return FailureClass::NetworkTransient;
                }
            }
        }
        if let Some(err) = cause.downcast_ref::<std::io::Error>() {
            match err.kind() {
                std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::BrokenPipe => return FailureClass::NetworkTransient,
                _ => {}
            }
        }
    }
    FailureClass::Fatal
}

/// Backoff parameters for retried network calls.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// The backoff before attempt `attempt` (1-based), with jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let exponential = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(self.max_backoff);
        // Full jitter: a uniformly random slice of the exponential window.
        let jittered = rand::thread_rng().gen_range(0..=exponential.as_millis() as u64);
        Duration::from_millis(jittered)
    }

    /// Run `operation`, retrying transient failures up to the attempt
    /// budget. The final failure is returned annotated with its class.
    pub async fn run<T, F, Fut>(&self, name: &str, mut operation: F) -> Result<T, ClassifiedFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(report) => {
                    let class = classify(&report);
                    if class == FailureClass::Fatal || attempt >= self.max_attempts {
                        warn!(name, attempt, ?class, "network operation failed");
                        return Err(ClassifiedFailure { class, report });
                    }
                    let backoff = self.backoff(attempt);
                    debug!(name, attempt, ?backoff, "transient failure; backing off");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

/// A failure that exhausted its retries, tagged with its class.
#[derive(Debug)]
pub struct ClassifiedFailure {
    pub class: FailureClass,
    pub report: Report,
}

impl std::fmt::Display for ClassifiedFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.class, self.report)
    }
}

impl std::error::Error for ClassifiedFailure {}
