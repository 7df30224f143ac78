//! Filesystem change journals.
//!
//! A change journal answers one question cheaply: which paths may have
//! changed since a checkpoint? When the answer is "none", the up-to-date
//! check skips per-path comparison entirely. Journals are best-effort by
//! contract — an unavailable or timed-out journal degrades the check to
//! per-path comparison, it never fails the build.
//!
//! The engine persists the last checkpoint to the `FileChangeTracker` file
//! in the engine-cache directory so the next build can scan from it.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    time::Duration,
};

use color_eyre::{Result, eyre::Context};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::envelope::{self, Compression, FileEnvelopeId};

/// The engine-cache file the checkpoint persists to.
pub const CHECKPOINT_FILE_NAME: &str = "FileChangeTracker";

/// An opaque cursor into a change journal.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct JournalCheckpoint(pub u64);

/// The outcome of scanning a journal between a checkpoint and now.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum JournalScan {
    /// Nothing relevant changed since the checkpoint.
    Clean,
    /// These paths possibly changed; everything else is unchanged.
    Changed(BTreeSet<PathBuf>),
    /// The journal cannot answer (unsupported volume, timeout, record range
    /// overwritten). Callers degrade to per-path comparison.
    Unavailable { reason: String },
}

/// A source of filesystem change records.
pub trait ChangeJournal: Send + Sync {
    /// Whether the journal is enabled and healthy for the volumes it covers.
    fn is_healthy(&self) -> bool;

    /// The current journal position, to be persisted as the next build's
    /// starting checkpoint.
    fn checkpoint(&self) -> Result<JournalCheckpoint>;

    /// Scan for changes between `since` and now, bounded by `timeout`.
    fn scan_since(
        &self,
        since: JournalCheckpoint,
        timeout: Duration,
    ) -> impl Future<Output = Result<JournalScan>> + Send;
}

/// The journal used when the platform offers no change-record stream: every
/// scan reports unavailable, degrading the up-to-date check to per-path
/// comparison.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullJournal;

impl ChangeJournal for NullJournal {
    fn is_healthy(&self) -> bool {
        false
    }

    fn checkpoint(&self) -> Result<JournalCheckpoint> {
        Ok(JournalCheckpoint(0))
    }

    async fn scan_since(
        &self,
        _since: JournalCheckpoint,
        _timeout: Duration,
    ) -> Result<JournalScan> {
        Ok(JournalScan::Unavailable {
            reason: "no change journal on this platform".to_string(),
        })
    }
}

/// A journal driven by explicit change notifications.
///
/// Platforms with a native change-record stream adapt it to this type by
/// feeding records in; tests feed it directly.
#[derive(Debug, Default)]
pub struct RecordedJournal {
    records: std::sync::Mutex<Vec<(JournalCheckpoint, PathBuf)>>,
    cursor: std::sync::atomic::AtomicU64,
    healthy: std::sync::atomic::AtomicBool,
}

impl RecordedJournal {
    pub fn new() -> Self {
        Self {
            records: std::sync::Mutex::new(Vec::new()),
            cursor: std::sync::atomic::AtomicU64::new(1),
            healthy: std::sync::atomic::AtomicBool::new(true),
        }
    }

    /// Append a change record for `path`.
    pub fn record_change(&self, path: impl Into<PathBuf>) {
        let position = self
            .cursor
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.records
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .push((JournalCheckpoint(position), path.into()));
    }

    /// Mark the journal unhealthy; subsequent scans report unavailable.
    pub fn mark_unhealthy(&self) {
        self.healthy
            .store(false, std::sync::atomic::Ordering::SeqCst);
    }
}

impl ChangeJournal for RecordedJournal {
    fn is_healthy(&self) -> bool {
        self.healthy.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn checkpoint(&self) -> Result<JournalCheckpoint> {
        Ok(JournalCheckpoint(
            self.cursor.load(std::sync::atomic::Ordering::SeqCst),
        ))
    }

    async fn scan_since(
        &self,
        since: JournalCheckpoint,
        _timeout: Duration,
    ) -> Result<JournalScan> {
        if !self.is_healthy() {
            return Ok(JournalScan::Unavailable {
                reason: "journal marked unhealthy".to_string(),
            });
        }
        let records = self.records.lock().unwrap_or_else(|err| err.into_inner());
        let changed = records
            .iter()
            .filter(|(position, _)| *position >= since)
            .map(|(_, path)| path.clone())
            .collect::<BTreeSet<_>>();
        if changed.is_empty() {
            Ok(JournalScan::Clean)
        } else {
            Ok(JournalScan::Changed(changed))
        }
    }
}

/// Load the persisted checkpoint, if a usable one exists.
#[instrument]
pub async fn load_checkpoint(
    engine_cache_dir: impl AsRef<Path> + std::fmt::Debug,
) -> Result<Option<JournalCheckpoint>> {
    let path = engine_cache_dir.as_ref().join(CHECKPOINT_FILE_NAME);
    let Some(payload) = envelope::read_file(&path, checkpoint_envelope_id()).await? else {
        debug!("no usable journal checkpoint");
        return Ok(None);
    };
    serde_json::from_slice(&payload)
        .context("parse journal checkpoint")
        .map(Some)
}

/// Persist the checkpoint for the next build.
#[instrument]
pub async fn save_checkpoint(
    engine_cache_dir: impl AsRef<Path> + std::fmt::Debug,
    checkpoint: JournalCheckpoint,
) -> Result<()> {
    let path = engine_cache_dir.as_ref().join(CHECKPOINT_FILE_NAME);
    let payload = serde_json::to_vec(&checkpoint).context("serialize journal checkpoint")?;
    envelope::write_file(&path, checkpoint_envelope_id(), Compression::None, &payload).await
}

fn checkpoint_envelope_id() -> FileEnvelopeId {
    FileEnvelopeId::for_kind("FileChangeTracker")
}
