//! Input tracking: observe every filesystem and environment read performed
//! by graph construction, and decide later whether any observation would
//! yield a different value now.
//!
//! The tracker is the foundation of the graph-reuse decision: a prior graph
//! is only reusable if every input recorded while constructing it is
//! unchanged. Observations are cheap to record (identity, not content, where
//! the [`FileContentTable`] allows) and cheap to re-verify (journal fast
//! path, identity comparison, hashing only as a last resort).

pub mod dir_fingerprint;
pub mod journal;

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use color_eyre::{Result, eyre::Context};
use dashmap::DashMap;
use derive_more::{Debug, Display};
use ferry::v1::Digest;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace, warn};

use crate::{
    content_table::{FileContentTable, FileIdentity},
    envelope::{self, Compression, FileEnvelopeId},
    fs,
};

use self::dir_fingerprint::{
    DirectoryMember, MembershipRule, MembershipRules, membership_fingerprint,
};
use self::journal::{ChangeJournal, JournalCheckpoint, JournalScan};

/// What a path existence probe found.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Serialize, Deserialize)]
pub enum Existence {
    File,
    Directory,
    Absent,
}

/// One recorded file read.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TrackedFile {
    pub path: PathBuf,
    pub identity: FileIdentity,
    /// The content digest. Populated lazily: registration records identity
    /// only, and [`InputTracker::ensure_all_hashed`] fills digests in before
    /// the snapshot is taken.
    pub digest: Option<Digest>,
}

/// One recorded directory enumeration.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TrackedDirectory {
    pub path: PathBuf,
    pub fingerprint: Digest,
    /// The rule the fingerprint was computed under, so re-verification
    /// filters membership the same way.
    pub rule: Option<MembershipRule>,
}

/// A serializable record of every observation one graph construction made.
///
/// This is the payload of the `PreviousInputs` engine-cache file. Entries
/// are sorted so equal observation sets serialize to equal bytes.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct TrackerSnapshot {
    pub files: Vec<TrackedFile>,
    pub directories: Vec<TrackedDirectory>,
    pub absences: Vec<PathBuf>,
    pub env_vars: Vec<(String, Option<String>)>,
    pub mounts: Vec<(String, Option<PathBuf>)>,
}

impl TrackerSnapshot {
    fn envelope_id() -> FileEnvelopeId {
        FileEnvelopeId::for_kind("InputTracker")
    }

    /// Serialize into envelope bytes.
    pub async fn to_envelope_bytes(&self) -> Result<Vec<u8>> {
        let payload = serde_json::to_vec(self).context("serialize tracker snapshot")?;
        envelope::encode(Self::envelope_id(), Compression::Zstd, &payload).await
    }

    /// Deserialize from envelope bytes. `None` when the envelope does not
    /// match this engine generation.
    pub async fn from_envelope_bytes(bytes: &[u8]) -> Result<Option<Self>> {
        let Some(payload) = envelope::decode(Self::envelope_id(), bytes).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&payload)
            .context("parse tracker snapshot")
            .map(Some)
    }

    /// Serialize to a sink file.
    #[instrument(skip(self))]
    pub async fn write_to(&self, path: impl AsRef<Path> + std::fmt::Debug) -> Result<()> {
        let bytes = self.to_envelope_bytes().await?;
        fs::write_atomic(path, &bytes).await
    }

    /// Deserialize from a source file. `None` when the file is absent or not
    /// applicable.
    #[instrument]
    pub async fn read_from(path: impl AsRef<Path> + std::fmt::Debug) -> Result<Option<Self>> {
        let Some(bytes) = fs::read_buffered(path).await? else {
            return Ok(None);
        };
        Self::from_envelope_bytes(&bytes).await
    }

}

/// An env-var or mount whose value changed between runs. These are the
/// non-structural changes that permit partial reuse.
#[derive(Clone, Debug, Eq, PartialEq, Display, Serialize, Deserialize)]
pub enum ChangedInput {
    #[display("env var {name}")]
    EnvVar {
        name: String,
        recorded: Option<String>,
        current: Option<String>,
    },
    #[display("mount {name}")]
    Mount {
        name: String,
        recorded: Option<PathBuf>,
        current: Option<PathBuf>,
    },
}

/// Why a prior run's observations no longer hold.
#[derive(Clone, Debug, Eq, PartialEq, Display)]
pub enum MismatchReason {
    #[display("inputs changed: {_0}")]
    InputsChanged(String),
    #[display("unable to detect changes: {_0}")]
    UnableToDetect(String),
}

/// The outcome of re-verifying a prior run's observations.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MatchOutcome {
    /// Every observation is unchanged.
    Match,
    /// Only non-structural inputs (env-var and mount values) changed.
    PartialMatch(Vec<ChangedInput>),
    /// Structural inputs changed, or change detection could not decide.
    Mismatch(MismatchReason),
}

/// The current environment against which recorded env-vars and mounts are
/// compared.
#[derive(Clone, Debug, Default)]
pub struct CurrentEnvironment {
    env_vars: std::collections::BTreeMap<String, String>,
    mounts: std::collections::BTreeMap<String, PathBuf>,
}

impl CurrentEnvironment {
    /// Capture the process environment plus the configured mount table.
    pub fn capture(mounts: std::collections::BTreeMap<String, PathBuf>) -> Self {
        Self {
            env_vars: std::env::vars().collect(),
            mounts,
        }
    }

    pub fn with_env(
        env_vars: std::collections::BTreeMap<String, String>,
        mounts: std::collections::BTreeMap<String, PathBuf>,
    ) -> Self {
        Self { env_vars, mounts }
    }

    pub fn env_var(&self, name: &str) -> Option<String> {
        self.env_vars.get(name).cloned()
    }

    pub fn mount(&self, name: &str) -> Option<PathBuf> {
        self.mounts.get(name).cloned()
    }
}

#[derive(Clone, Debug)]
struct FileObservation {
    identity: FileIdentity,
    digest: Option<Digest>,
}

/// Records every path, directory enumeration, environment variable, and
/// mount read during graph construction.
///
/// Registrations are concurrent; the snapshot is taken once construction is
/// complete (after which the driver serializes it as `PreviousInputs`).
#[derive(Debug)]
pub struct InputTracker {
    #[debug("{} files", files.len())]
    files: DashMap<PathBuf, FileObservation>,
    #[debug(skip)]
    directories: DashMap<PathBuf, TrackedDirectory>,
    #[debug(skip)]
    absences: DashMap<PathBuf, ()>,
    #[debug(skip)]
    env_vars: DashMap<String, Option<String>>,
    #[debug(skip)]
    mounts: DashMap<String, Option<PathBuf>>,
    #[debug(skip)]
    rules: MembershipRules,
    #[debug(skip)]
    content_table: Arc<FileContentTable>,
    /// The prior run's snapshot, for `try_get_hash_for_unchanged_file`.
    #[debug(skip)]
    prior: Option<Arc<TrackerSnapshot>>,
}

impl InputTracker {
    pub fn new(
        content_table: Arc<FileContentTable>,
        rules: MembershipRules,
        prior: Option<Arc<TrackerSnapshot>>,
    ) -> Self {
        Self {
            files: DashMap::new(),
            directories: DashMap::new(),
            absences: DashMap::new(),
            env_vars: DashMap::new(),
            mounts: DashMap::new(),
            rules,
            content_table,
            prior,
        }
    }

    /// Record a file read. If the content table knows an unchanged identity
    /// for the path, its digest is recorded immediately; otherwise hashing
    /// is deferred to [`Self::ensure_all_hashed`].
    #[instrument(skip(self))]
    pub async fn register_file_access(
        &self,
        path: impl AsRef<Path> + std::fmt::Debug,
    ) -> Result<()> {
        let path = path.as_ref();
        if self.files.contains_key(path) {
            return Ok(());
        }
        if !fs::exists(path).await {
            trace!(?path, "registered access to absent file");
            self.absences.insert(path.to_path_buf(), ());
            return Ok(());
        }
        let observation = match self.content_table.try_get_known_hash(path).await? {
            Some((identity, digest)) => FileObservation {
                identity,
                digest: Some(digest),
            },
            None => FileObservation {
                identity: FileIdentity::of(path).await?,
                digest: None,
            },
        };
        self.files.insert(path.to_path_buf(), observation);
        Ok(())
    }

    /// Record a directory enumeration.
    ///
    /// If `members` is supplied, exactly that list is fingerprinted;
    /// otherwise the directory is enumerated now. The membership rule for
    /// the path decides filtering, and a rule disabling filesystem
    /// enumeration short-circuits to a constant fingerprint.
    #[instrument(skip(self, members))]
    pub async fn track_directory(
        &self,
        path: impl AsRef<Path> + std::fmt::Debug,
        members: Option<Vec<DirectoryMember>>,
    ) -> Result<Digest> {
        let path = path.as_ref();
        let rule = self.rules.rule_for(path).map(|scoped| scoped.rule.clone());

        let fingerprint = match (&rule, members) {
            (Some(MembershipRule::DisableFilesystemEnumeration), _) => {
                membership_fingerprint(&[], rule.as_ref())
            }
            (_, Some(members)) => membership_fingerprint(&members, rule.as_ref()),
            (_, None) => {
                let members = dir_fingerprint::enumerate(path).await?;
                membership_fingerprint(&members, rule.as_ref())
            }
        };

        self.directories.insert(
            path.to_path_buf(),
            TrackedDirectory {
                path: path.to_path_buf(),
                fingerprint: fingerprint.clone(),
                rule,
            },
        );
        Ok(fingerprint)
    }

    /// Probe whether a path exists, recording an anti-dependency when it
    /// doesn't.
    #[instrument(skip(self))]
    pub async fn probe_existence(
        &self,
        path: impl AsRef<Path> + std::fmt::Debug,
    ) -> Result<Existence> {
        let path = path.as_ref();
        match tokio::fs::metadata(path).await {
            Ok(metadata) if metadata.is_dir() => Ok(Existence::Directory),
            Ok(_) => Ok(Existence::File),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.absences.insert(path.to_path_buf(), ());
                Ok(Existence::Absent)
            }
            Err(err) => Err(err).context(format!("probe {path:?}")),
        }
    }

    /// Fast lookup: the digest the prior run recorded for this path, valid
    /// only if the file's identity is unchanged since then.
    #[instrument(skip(self))]
    pub async fn try_get_hash_for_unchanged_file(
        &self,
        path: impl AsRef<Path> + std::fmt::Debug,
    ) -> Result<Option<Digest>> {
        let Some(prior) = &self.prior else {
            return Ok(None);
        };
        let path = path.as_ref();
        let Some(recorded) = prior.files.iter().find(|file| file.path == path) else {
            return Ok(None);
        };
        if !recorded.identity.is_supported() {
            return Ok(None);
        }
        if !fs::exists(path).await {
            return Ok(None);
        }
        let current = FileIdentity::of(path).await?;
        if current == recorded.identity {
            Ok(recorded.digest.clone())
        } else {
            Ok(None)
        }
    }

    /// Record an environment variable read with its value or absence.
    pub fn record_env_var(&self, name: impl Into<String>, value: Option<String>) {
        self.env_vars.insert(name.into(), value);
    }

    /// Record a mount lookup with its resolved path or absence.
    pub fn record_mount(&self, name: impl Into<String>, resolved: Option<PathBuf>) {
        self.mounts.insert(name.into(), resolved);
    }

    /// Fill in digests for files whose hashing was deferred at registration.
    ///
    /// A hashing failure here means the observation can never be verified;
    /// it is surfaced as an error and the build falls back to a miss.
    #[instrument(skip(self))]
    pub async fn ensure_all_hashed(&self) -> Result<()> {
        let pending = self
            .files
            .iter()
            .filter(|entry| entry.value().digest.is_none())
            .map(|entry| entry.key().clone())
            .collect::<Vec<_>>();
        for path in pending {
            let (identity, digest) = self.content_table.hash_and_record(&path).await?;
            if let Some(mut observation) = self.files.get_mut(&path) {
                observation.identity = identity;
                observation.digest = Some(digest);
            }
        }
        Ok(())
    }

    /// Take a deterministic snapshot of every observation.
    pub fn snapshot(&self) -> TrackerSnapshot {
        let mut files = self
            .files
            .iter()
            .map(|entry| TrackedFile {
                path: entry.key().clone(),
                identity: entry.value().identity,
                digest: entry.value().digest.clone(),
            })
            .collect::<Vec<_>>();
        files.sort_by(|a, b| a.path.cmp(&b.path));

        let mut directories = self
            .directories
            .iter()
            .map(|entry| entry.value().clone())
            .collect::<Vec<_>>();
        directories.sort_by(|a, b| a.path.cmp(&b.path));

        let mut absences = self
            .absences
            .iter()
            .map(|entry| entry.key().clone())
            .collect::<Vec<_>>();
        absences.sort();

        let mut env_vars = self
            .env_vars
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect::<Vec<_>>();
        env_vars.sort();

        let mut mounts = self
            .mounts
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect::<Vec<_>>();
        mounts.sort();

        TrackerSnapshot {
            files,
            directories,
            absences,
            env_vars,
            mounts,
        }
    }

    /// Re-verify a prior run's observations against the current filesystem
    /// and environment.
    ///
    /// The journal fast path: when the journal is healthy and reports no
    /// changes touching any tracked path since the checkpoint, per-path
    /// comparison is skipped entirely. A journal that reports a change set
    /// narrows per-path comparison to that set; an unavailable journal
    /// degrades the check to every tracked path — logged, never fatal.
    #[instrument(skip_all)]
    pub async fn check_match<J: ChangeJournal>(
        prior: &TrackerSnapshot,
        journal: &J,
        since: Option<JournalCheckpoint>,
        environment: &CurrentEnvironment,
        content_table: &FileContentTable,
        journal_timeout: Duration,
    ) -> Result<MatchOutcome> {
        // Non-structural comparisons are cheap; do them first so even the
        // journal fast path reflects env-var and mount changes.
        let mut changed_values = Vec::new();
        for (name, recorded) in &prior.env_vars {
            let current = environment.env_var(name);
            if current != *recorded {
                changed_values.push(ChangedInput::EnvVar {
                    name: name.clone(),
                    recorded: recorded.clone(),
                    current,
                });
            }
        }
        for (name, recorded) in &prior.mounts {
            let current = environment.mount(name);
            if current != *recorded {
                changed_values.push(ChangedInput::Mount {
                    name: name.clone(),
                    recorded: recorded.clone(),
                    current,
                });
            }
        }

        // Journal fast path for the filesystem observations.
        let scope = match since {
            Some(since) if journal.is_healthy() => {
                match journal.scan_since(since, journal_timeout).await {
                    Ok(JournalScan::Clean) => {
                        trace!("journal reports no changes since checkpoint");
                        Some(BTreeSet::new())
                    }
                    Ok(JournalScan::Changed(paths)) => Some(paths),
                    Ok(JournalScan::Unavailable { reason }) => {
                        debug!(%reason, "journal unavailable; degrading to per-path comparison");
                        None
                    }
                    Err(err) => {
                        warn!(?err, "journal scan failed; degrading to per-path comparison");
                        None
                    }
                }
            }
            _ => None,
        };

        let in_scope = |path: &Path| match &scope {
            Some(changed) => changed.iter().any(|touched| path.starts_with(touched) || touched.starts_with(path)),
            None => true,
        };

        let mut structural = Vec::new();

        for recorded in &prior.files {
            if !in_scope(&recorded.path) {
                continue;
            }
            if !fs::exists(&recorded.path).await {
                structural.push(format!("file {:?} no longer exists", recorded.path));
                continue;
            }
            let current = FileIdentity::of(&recorded.path).await?;
            if current.is_supported() && current == recorded.identity {
                continue;
            }
            // Identity mismatch (or unsupported identity): fall back to
            // content comparison.
            let Some(recorded_digest) = &recorded.digest else {
                return Ok(MatchOutcome::Mismatch(MismatchReason::UnableToDetect(
                    format!("no digest recorded for {:?}", recorded.path),
                )));
            };
            match content_table.hash_and_record(&recorded.path).await {
                Ok((_, digest)) if digest == *recorded_digest => {}
                Ok(_) => {
                    structural.push(format!("file {:?} content changed", recorded.path));
                }
                Err(err) => {
                    return Ok(MatchOutcome::Mismatch(MismatchReason::UnableToDetect(
                        format!("hashing {:?} failed: {err}", recorded.path),
                    )));
                }
            }
        }

        for recorded in &prior.directories {
            if !in_scope(&recorded.path) {
                continue;
            }
            let current = match &recorded.rule {
                Some(MembershipRule::DisableFilesystemEnumeration) => {
                    membership_fingerprint(&[], recorded.rule.as_ref())
                }
                rule => match dir_fingerprint::enumerate(&recorded.path).await {
                    Ok(members) => membership_fingerprint(&members, rule.as_ref()),
                    Err(_) => {
                        structural
                            .push(format!("directory {:?} no longer enumerable", recorded.path));
                        continue;
                    }
                },
            };
            if current != recorded.fingerprint {
                structural.push(format!("directory {:?} membership changed", recorded.path));
            }
        }

        for path in &prior.absences {
            if !in_scope(path) {
                continue;
            }
            if fs::exists(path).await {
                structural.push(format!("path {path:?} now exists"));
            }
        }

        if !structural.is_empty() {
            return Ok(MatchOutcome::Mismatch(MismatchReason::InputsChanged(
                structural.join("; "),
            )));
        }
        if !changed_values.is_empty() {
            return Ok(MatchOutcome::PartialMatch(changed_values));
        }
        Ok(MatchOutcome::Match)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_table::DEFAULT_TTL;
    use journal::{NullJournal, RecordedJournal};
    use pretty_assertions::assert_eq as pretty_assert_eq;
    use std::collections::BTreeMap;

    fn content_table() -> Arc<FileContentTable> {
        Arc::new(FileContentTable::new(DEFAULT_TTL))
    }

    fn tracker(content_table: &Arc<FileContentTable>) -> InputTracker {
        InputTracker::new(
            Arc::clone(content_table),
            MembershipRules::default(),
            None,
        )
    }

    async fn checked(
        prior: &TrackerSnapshot,
        environment: &CurrentEnvironment,
        content_table: &FileContentTable,
    ) -> MatchOutcome {
        InputTracker::check_match(
            prior,
            &NullJournal,
            None,
            environment,
            content_table,
            Duration::from_secs(1),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn unchanged_inputs_match() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.txt");
        fs::write(&input, b"content").await.unwrap();

        let table = content_table();
        let tracker = tracker(&table);
        tracker.register_file_access(&input).await.unwrap();
        tracker.track_directory(dir.path(), None).await.unwrap();
        tracker.record_env_var("CC", Some("gcc".to_string()));
        tracker.ensure_all_hashed().await.unwrap();
        let snapshot = tracker.snapshot();

        let environment = CurrentEnvironment::with_env(
            [("CC".to_string(), "gcc".to_string())].into(),
            BTreeMap::new(),
        );
        pretty_assert_eq!(
            checked(&snapshot, &environment, &table).await,
            MatchOutcome::Match,
        );
    }

    #[tokio::test]
    async fn file_content_change_mismatches() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.txt");
        fs::write(&input, b"first").await.unwrap();

        let table = content_table();
        let tracker = tracker(&table);
        tracker.register_file_access(&input).await.unwrap();
        tracker.ensure_all_hashed().await.unwrap();
        let snapshot = tracker.snapshot();

        fs::write(&input, b"second, longer").await.unwrap();
        let outcome = checked(&snapshot, &CurrentEnvironment::default(), &table).await;
        assert!(matches!(
            outcome,
            MatchOutcome::Mismatch(MismatchReason::InputsChanged(_)),
        ));
    }

    #[tokio::test]
    async fn touched_but_identical_file_still_matches() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.txt");
        fs::write(&input, b"content").await.unwrap();

        let table = content_table();
        let tracker = tracker(&table);
        tracker.register_file_access(&input).await.unwrap();
        tracker.ensure_all_hashed().await.unwrap();
        let snapshot = tracker.snapshot();

        // Rewrite the same bytes: identity changes, content does not.
        tokio::time::sleep(Duration::from_millis(20)).await;
        fs::write(&input, b"content").await.unwrap();
        pretty_assert_eq!(
            checked(&snapshot, &CurrentEnvironment::default(), &table).await,
            MatchOutcome::Match,
        );
    }

    #[tokio::test]
    async fn env_var_change_is_partial() {
        let table = content_table();
        let tracker = tracker(&table);
        tracker.record_env_var("CC", Some("gcc".to_string()));
        let snapshot = tracker.snapshot();

        let environment = CurrentEnvironment::with_env(
            [("CC".to_string(), "clang".to_string())].into(),
            BTreeMap::new(),
        );
        let outcome = checked(&snapshot, &environment, &table).await;
        match outcome {
            MatchOutcome::PartialMatch(changed) => {
                pretty_assert_eq!(changed.len(), 1);
                assert!(matches!(&changed[0], ChangedInput::EnvVar { name, .. } if name == "CC"));
            }
            other => panic!("expected partial match, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn absence_violation_mismatches() {
        let dir = tempfile::tempdir().unwrap();
        let probed = dir.path().join("maybe.txt");

        let table = content_table();
        let tracker = tracker(&table);
        pretty_assert_eq!(
            tracker.probe_existence(&probed).await.unwrap(),
            Existence::Absent,
        );
        let snapshot = tracker.snapshot();

        fs::write(&probed, b"now it exists").await.unwrap();
        let outcome = checked(&snapshot, &CurrentEnvironment::default(), &table).await;
        assert!(matches!(
            outcome,
            MatchOutcome::Mismatch(MismatchReason::InputsChanged(_)),
        ));
    }

    #[tokio::test]
    async fn directory_membership_change_mismatches() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), b"x").await.unwrap();

        let table = content_table();
        let tracker = tracker(&table);
        tracker.track_directory(dir.path(), None).await.unwrap();
        let snapshot = tracker.snapshot();

        fs::write(dir.path().join("b"), b"y").await.unwrap();
        let outcome = checked(&snapshot, &CurrentEnvironment::default(), &table).await;
        assert!(matches!(
            outcome,
            MatchOutcome::Mismatch(MismatchReason::InputsChanged(_)),
        ));
    }

    #[tokio::test]
    async fn clean_journal_skips_file_checks() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.txt");
        fs::write(&input, b"content").await.unwrap();

        let table = content_table();
        let tracker = tracker(&table);
        tracker.register_file_access(&input).await.unwrap();
        tracker.ensure_all_hashed().await.unwrap();
        let snapshot = tracker.snapshot();

        let journal = RecordedJournal::new();
        let checkpoint = journal.checkpoint().unwrap();

        // Delete the file behind the journal's back: a clean journal means
        // the per-path check is skipped and the match stands.
        fs::remove_file_if_exists(&input).await.unwrap();
        let outcome = InputTracker::check_match(
            &snapshot,
            &journal,
            Some(checkpoint),
            &CurrentEnvironment::default(),
            &table,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        pretty_assert_eq!(outcome, MatchOutcome::Match);
    }

    #[tokio::test]
    async fn journal_narrows_checks_to_changed_paths() {
        let dir = tempfile::tempdir().unwrap();
        let changed = dir.path().join("changed.txt");
        let untouched = dir.path().join("untouched.txt");
        fs::write(&changed, b"first").await.unwrap();
        fs::write(&untouched, b"same").await.unwrap();

        let table = content_table();
        let tracker = tracker(&table);
        tracker.register_file_access(&changed).await.unwrap();
        tracker.register_file_access(&untouched).await.unwrap();
        tracker.ensure_all_hashed().await.unwrap();
        let snapshot = tracker.snapshot();

        let journal = RecordedJournal::new();
        let checkpoint = journal.checkpoint().unwrap();
        fs::write(&changed, b"second, longer").await.unwrap();
        journal.record_change(&changed);

        let outcome = InputTracker::check_match(
            &snapshot,
            &journal,
            Some(checkpoint),
            &CurrentEnvironment::default(),
            &table,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert!(matches!(
            outcome,
            MatchOutcome::Mismatch(MismatchReason::InputsChanged(_)),
        ));
    }

    #[tokio::test]
    async fn prior_hash_fast_path() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.txt");
        fs::write(&input, b"content").await.unwrap();

        let table = content_table();
        let first = tracker(&table);
        first.register_file_access(&input).await.unwrap();
        first.ensure_all_hashed().await.unwrap();
        let snapshot = Arc::new(first.snapshot());
        let expected = snapshot.files[0].digest.clone().unwrap();

        let second = InputTracker::new(
            Arc::clone(&table),
            MembershipRules::default(),
            Some(Arc::clone(&snapshot)),
        );
        pretty_assert_eq!(
            second
                .try_get_hash_for_unchanged_file(&input)
                .await
                .unwrap(),
            Some(expected),
        );

        fs::write(&input, b"changed content!").await.unwrap();
        pretty_assert_eq!(
            second
                .try_get_hash_for_unchanged_file(&input)
                .await
                .unwrap(),
            None,
        );
    }

    #[tokio::test]
    async fn snapshot_envelope_round_trip() {
        let table = content_table();
        let tracker = tracker(&table);
        tracker.record_env_var("PATH", Some("/usr/bin".to_string()));
        tracker.record_mount("Out", Some(PathBuf::from("/workspace/out")));
        let snapshot = tracker.snapshot();

        let bytes = snapshot.to_envelope_bytes().await.unwrap();
        let back = TrackerSnapshot::from_envelope_bytes(&bytes)
            .await
            .unwrap()
            .unwrap();
        pretty_assert_eq!(snapshot, back);
    }
}
