//! Filesystem operations tailored to `forge`.
//!
//! Inside this module, we refer to `std::fs` or `tokio::fs` by its fully
//! qualified path to make it maximally clear what we are using.
//!
//! Everything that mutates the engine-cache or object directories goes
//! through here so that atomicity (temp-file-then-rename) and lock handling
//! stay in one place.

use std::{
    marker::PhantomData,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use derive_more::{Debug, Display};
use ferry::v1::Digest;
use fslock::LockFile as FsLockFile;
use tap::TapFallible;
use tokio::{io::AsyncReadExt, sync::Mutex, task::spawn_blocking};
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;

/// The file name used for directory locks.
const LOCK_FILE_NAME: &str = ".forge-lock";

/// An exclusive cross-process lock over a directory.
///
/// The lock is implemented as an advisory lock on a well-known file inside
/// the directory. Acquisition polls at a configured interval up to a
/// configured timeout; a timeout is surfaced as an error so the caller can
/// report that another process holds the directory.
///
/// Release the lock with [`DirLock::release`], or by dropping the locked
/// instance.
#[derive(Debug, Clone, Display)]
#[display("{}", dir.display())]
pub struct DirLock<State> {
    state: PhantomData<State>,
    dir: PathBuf,
    inner: Arc<Mutex<FsLockFile>>,
}

/// The associated type's state is unlocked.
/// Used for the typestate pattern.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Default)]
pub struct Unlocked;

/// The associated type's state is locked.
/// Used for the typestate pattern.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Default)]
pub struct Locked;

impl DirLock<Unlocked> {
    /// Open a lock handle for the provided directory, creating the directory
    /// if needed. The lock is not yet held.
    #[instrument(name = "DirLock::open")]
    pub async fn open(dir: impl AsRef<Path> + std::fmt::Debug) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        create_dir_all(&dir).await?;
        let lock_path = dir.join(LOCK_FILE_NAME);
        let file = spawn_blocking(move || FsLockFile::open(lock_path.as_path()))
            .await
            .context("join task")?
            .context("open lock file")?;
        Ok(Self {
            state: PhantomData,
            dir,
            inner: Arc::new(Mutex::new(file)),
        })
    }

    /// Acquire the lock, polling until it is available or until `timeout`
    /// elapses.
    ///
    /// Polling rather than blocking lets us honor an overall timeout and keeps
    /// the runtime's blocking pool free between attempts.
    #[instrument(skip_all, fields(%self, ?poll_interval, ?timeout))]
    pub async fn acquire(
        self,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<DirLock<Locked>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let acquired = {
                let inner = Arc::clone(&self.inner);
                spawn_blocking(move || {
                    let mut inner = inner.blocking_lock();
                    inner.try_lock().context("try lock")
                })
                .await
                .context("join task")??
            };

            if acquired {
                trace!(dir = ?self.dir, "locked directory");
                return Ok(DirLock {
                    state: PhantomData,
                    dir: self.dir,
                    inner: self.inner,
                });
            }

            if tokio::time::Instant::now() >= deadline {
                bail!(
                    "timed out acquiring directory lock on {:?} after {timeout:?}; \
                     another process is likely holding it",
                    self.dir
                );
            }

            debug!(dir = ?self.dir, "directory locked by another process; polling");
            tokio::time::sleep(poll_interval).await;
        }
    }
}

impl DirLock<Locked> {
    /// Release the lock.
    #[instrument(skip_all, fields(%self))]
    pub async fn release(self) -> Result<DirLock<Unlocked>> {
        let inner = Arc::clone(&self.inner);
        spawn_blocking(move || -> Result<()> {
            let mut inner = inner.blocking_lock();
            inner.unlock().context("unlock file")
        })
        .await
        .context("join task")??;

        trace!(dir = ?self.dir, "unlocked directory");
        Ok(DirLock {
            state: PhantomData,
            dir: self.dir,
            inner: self.inner,
        })
    }

    /// The directory this lock guards.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Create a directory and all of its parents.
#[instrument]
pub async fn create_dir_all(dir: impl AsRef<Path> + std::fmt::Debug) -> Result<()> {
    let dir = dir.as_ref();
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("create directory {dir:?}"))
}

/// Write the content to the path, replacing any prior content.
#[instrument(skip(content))]
pub async fn write(path: impl AsRef<Path> + std::fmt::Debug, content: &[u8]) -> Result<()> {
    let path = path.as_ref();
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("write {path:?}"))
}

/// Write the content to the path atomically: the content lands under a
/// temporary name in the same directory and is renamed into place, so readers
/// see either the old content or the new content, never a torn write.
#[instrument(skip(content))]
pub async fn write_atomic(path: impl AsRef<Path> + std::fmt::Debug, content: &[u8]) -> Result<()> {
    let path = path.as_ref();
    let temp = temp_sibling(path);
    tokio::fs::write(&temp, content)
        .await
        .with_context(|| format!("write staging file {temp:?}"))?;
    match tokio::fs::rename(&temp, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            if let Err(err) = tokio::fs::remove_file(&temp).await {
                warn!("failed to remove staging file {temp:?}: {err}");
            }
            Err(err).context(format!("rename {temp:?} to {path:?}"))
        }
    }
}

/// Read the full content of the file, or `None` if it does not exist.
#[instrument]
pub async fn read_buffered(path: impl AsRef<Path> + std::fmt::Debug) -> Result<Option<Vec<u8>>> {
    let path = path.as_ref();
    match tokio::fs::read(path).await {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(format!("read {path:?}")),
    }
}

/// Read the full content of the file, erroring if it does not exist.
#[instrument]
pub async fn must_read_buffered(path: impl AsRef<Path> + std::fmt::Debug) -> Result<Vec<u8>> {
    let path = path.as_ref();
    tokio::fs::read(path)
        .await
        .with_context(|| format!("read {path:?}"))
}

/// Remove the file if it exists; absence is not an error.
#[instrument]
pub async fn remove_file_if_exists(path: impl AsRef<Path> + std::fmt::Debug) -> Result<()> {
    let path = path.as_ref();
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).context(format!("remove {path:?}")),
    }
}

/// Rename `from` to `to`.
#[instrument]
pub async fn rename(
    from: impl AsRef<Path> + std::fmt::Debug,
    to: impl AsRef<Path> + std::fmt::Debug,
) -> Result<()> {
    let from = from.as_ref();
    let to = to.as_ref();
    tokio::fs::rename(from, to)
        .await
        .with_context(|| format!("rename {from:?} to {to:?}"))
}

/// Report whether the path names an existing file or directory.
pub async fn exists(path: impl AsRef<Path>) -> bool {
    tokio::fs::metadata(path.as_ref()).await.is_ok()
}

/// Materialize `src` at `dst` with hardlink-or-copy semantics: try a
/// hardlink first (free on the same volume), fall back to a copy when the
/// link fails (cross-volume, or a filesystem without hardlinks).
#[instrument]
pub async fn hardlink_or_copy(
    src: impl AsRef<Path> + std::fmt::Debug,
    dst: impl AsRef<Path> + std::fmt::Debug,
) -> Result<()> {
    let src = src.as_ref();
    let dst = dst.as_ref();
    if let Some(parent) = dst.parent() {
        create_dir_all(parent).await?;
    }
    remove_file_if_exists(dst).await?;
    match tokio::fs::hard_link(src, dst).await {
        Ok(()) => Ok(()),
        Err(err) => {
            trace!(?src, ?dst, ?err, "hardlink failed; copying");
            tokio::fs::copy(src, dst)
                .await
                .map(|_| ())
                .with_context(|| format!("copy {src:?} to {dst:?}"))
        }
    }
}

/// Compute the content digest of a file by streaming its bytes.
#[instrument]
pub async fn digest_file(path: impl AsRef<Path> + std::fmt::Debug) -> Result<Digest> {
    let path = path.as_ref();
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("open {path:?}"))
        .tap_err(|err| trace!(?err, "hashing failed to open file"))?;

    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; ferry::LOCAL_BUFFER_SIZE];
    loop {
        let n = file
            .read(&mut buffer)
            .await
            .with_context(|| format!("read {path:?}"))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(Digest::from_blake3(hasher.finalize()))
}

/// Generate a temporary sibling path for atomic writes.
fn temp_sibling(target: &Path) -> PathBuf {
    let mut temp = target.as_os_str().to_owned();
    temp.push(".tmp.");
    temp.push(Uuid::new_v4().to_string());
    PathBuf::from(temp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    #[tokio::test]
    async fn write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");

        write_atomic(&path, b"first").await.unwrap();
        pretty_assert_eq!(must_read_buffered(&path).await.unwrap(), b"first");

        write_atomic(&path, b"second").await.unwrap();
        pretty_assert_eq!(must_read_buffered(&path).await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn read_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing");
        pretty_assert_eq!(read_buffered(&path).await.unwrap(), None);
    }

    #[tokio::test]
    async fn dir_lock_excludes_second_acquire() {
        let dir = tempfile::tempdir().unwrap();
        let poll = Duration::from_millis(5);
        let timeout = Duration::from_millis(50);

        let held = DirLock::open(dir.path())
            .await
            .unwrap()
            .acquire(poll, timeout)
            .await
            .unwrap();

        let second = DirLock::open(dir.path())
            .await
            .unwrap()
            .acquire(poll, timeout)
            .await;
        assert!(second.is_err(), "second acquire should time out");

        let released = held.release().await.unwrap();
        released
            .acquire(poll, timeout)
            .await
            .expect("acquire after release");
    }

    #[tokio::test]
    async fn digest_file_matches_buffer_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");
        write(&path, b"some content").await.unwrap();

        let from_file = digest_file(&path).await.unwrap();
        pretty_assert_eq!(from_file, Digest::from_buffer(b"some content"));
    }

    #[tokio::test]
    async fn hardlink_or_copy_materializes() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("nested/dst");
        write(&src, b"payload").await.unwrap();

        hardlink_or_copy(&src, &dst).await.unwrap();
        pretty_assert_eq!(must_read_buffered(&dst).await.unwrap(), b"payload");
    }
}
