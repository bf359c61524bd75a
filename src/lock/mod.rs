//! Exclusive single-writer lock over a data directory.
//!
//! The lock is a file next to the data directory holding a [`LockRecord`].
//! Presence of the file is the exclusion signal; its contents only serve
//! stale-lock detection after a crash.

pub mod guard;
pub mod probe;
pub mod record;

pub use probe::{ProcessProbe, SystemProcessProbe};
pub use record::{LockRecord, SAME_PID_GRACE_MS, Staleness};

use crate::core::{LifecycleError, Result};
use guard::DeletionGuard;
use std::ffi::OsStr;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::fs;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

pub const LOCK_FILE_NAME: &str = ".tandem.lock";
pub const DEFAULT_LOCK_WAIT_MS: u64 = 20_000;
pub const DEFAULT_LOCK_RETRY_DELAY_MS: u64 = 500;

static PUBLISH_SEQ: AtomicU64 = AtomicU64::new(0);

/// Lock file location for `data_dir`: beside it in the parent directory, so the
/// storage engine's own directory scan never sees it. A filesystem root has no
/// parent, in which case the lock lives inside the directory.
pub fn lock_path_for(data_dir: &Path) -> Result<PathBuf> {
    let absolute =
        std::path::absolute(data_dir).map_err(|err| LifecycleError::lock_io(data_dir, err))?;
    Ok(match absolute.parent() {
        Some(parent) => parent.join(LOCK_FILE_NAME),
        None => absolute.join(LOCK_FILE_NAME),
    })
}

/// Whether `name` is the lock file or one of its guard and staging siblings.
pub fn is_lock_artifact(name: &OsStr) -> bool {
    name.to_string_lossy().starts_with(LOCK_FILE_NAME)
}

/// Acquires and reclaims data directory locks.
#[derive(Clone)]
pub struct LockManager {
    probe: Arc<dyn ProcessProbe>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(Arc::new(SystemProcessProbe::new()))
    }
}

impl LockManager {
    pub fn new(probe: Arc<dyn ProcessProbe>) -> Self {
        Self { probe }
    }

    /// Acquires the exclusive lock for `data_dir`, polling every `retry_delay`
    /// while a live process holds it, for at most `wait`.
    pub async fn acquire(
        &self,
        data_dir: &Path,
        wait: Duration,
        retry_delay: Duration,
    ) -> Result<LockHandle> {
        let lock_path = lock_path_for(data_dir)?;
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| LifecycleError::lock_io(parent, err))?;
        }
        self.sweep_staging(&lock_path).await;

        let started = Instant::now();
        let deadline = started + wait;
        let mut attempt: u32 = 0;

        loop {
            attempt = attempt.saturating_add(1);
            let record = LockRecord::for_current_process(self.probe.as_ref());
            if self.try_publish(&lock_path, &record).await? {
                info!(
                    path = %lock_path.display(),
                    pid = record.owner_pid,
                    attempt,
                    "acquired data directory lock"
                );
                return Ok(LockHandle::new(lock_path, record));
            }

            let holder = match read_record(&lock_path).await? {
                RecordRead::Missing => {
                    debug!(path = %lock_path.display(), "lock file vanished before it could be read, retrying");
                    continue;
                }
                RecordRead::Corrupt(reason) => {
                    warn!(path = %lock_path.display(), reason = %reason, "reclaiming unreadable lock file");
                    reclaim(&lock_path, None).await?;
                    continue;
                }
                RecordRead::Record(holder) => holder,
            };

            let staleness = holder.staleness(self.probe.as_ref());
            if staleness.is_stale() {
                info!(
                    path = %lock_path.display(),
                    holder_pid = holder.owner_pid,
                    acquired_at = %holder.acquired_at,
                    reason = ?staleness,
                    "reclaiming stale lock"
                );
                if !reclaim(&lock_path, Some(holder)).await? {
                    debug!(path = %lock_path.display(), "lock changed hands during reclaim, retrying");
                }
                continue;
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(LifecycleError::LockTimeout {
                    lock_path,
                    holder_pid: holder.owner_pid,
                    acquired_at: holder.acquired_at.to_rfc3339(),
                    waited_ms: now.duration_since(started).as_millis() as u64,
                });
            }

            debug!(
                path = %lock_path.display(),
                holder_pid = holder.owner_pid,
                attempt,
                "lock held by live process, waiting"
            );
            sleep(retry_delay.min(deadline - now)).await;
        }
    }

    /// Publishes `record` at `lock_path` unless a lock file already exists.
    ///
    /// The record is written to a private sibling file and hard-linked into
    /// place. Link creation fails with `AlreadyExists` just like an exclusive
    /// create, and readers never see a partially written record.
    async fn try_publish(&self, lock_path: &Path, record: &LockRecord) -> Result<bool> {
        let staging = staging_path(lock_path, record.owner_pid);
        let bytes = record.to_json().map_err(|err| {
            LifecycleError::lock_io(lock_path, std::io::Error::new(ErrorKind::InvalidData, err))
        })?;

        fs::write(&staging, &bytes)
            .await
            .map_err(|err| LifecycleError::lock_io(&staging, err))?;

        let linked = fs::hard_link(&staging, lock_path).await;
        let cleanup = fs::remove_file(&staging).await;

        match linked {
            Ok(()) => {
                // the lock is ours now; a stray staging file is swept later
                if let Err(err) = cleanup {
                    warn!(path = %staging.display(), error = %err, "failed to remove lock staging file");
                }
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => match cleanup {
                Ok(()) => Ok(false),
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
                Err(err) => Err(LifecycleError::lock_io(&staging, err)),
            },
            Err(err) => Err(LifecycleError::lock_io(lock_path, err)),
        }
    }

    /// Deletes staging files left behind by processes that died mid-publish.
    async fn sweep_staging(&self, lock_path: &Path) {
        let Some(dir) = lock_path.parent() else {
            return;
        };
        let Ok(mut entries) = fs::read_dir(dir).await else {
            return;
        };

        let current = self.probe.current_pid();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Some(pid) = staging_owner(&entry.file_name()) else {
                continue;
            };
            if pid == current || self.probe.is_alive(pid) {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => debug!(path = %entry.path().display(), pid, "removed leftover lock staging file"),
                Err(err) => debug!(path = %entry.path().display(), error = %err, "could not remove leftover lock staging file"),
            }
        }
    }

    /// Reads the current lock record for `data_dir`, if any.
    pub async fn inspect(&self, data_dir: &Path) -> Result<Option<(LockRecord, Staleness)>> {
        let lock_path = lock_path_for(data_dir)?;
        match read_record(&lock_path).await? {
            RecordRead::Record(record) => {
                let staleness = record.staleness(self.probe.as_ref());
                Ok(Some((record, staleness)))
            }
            RecordRead::Missing => Ok(None),
            RecordRead::Corrupt(reason) => Err(LifecycleError::lock_io(
                lock_path,
                std::io::Error::new(ErrorKind::InvalidData, reason),
            )),
        }
    }
}

fn staging_path(lock_path: &Path, pid: u32) -> PathBuf {
    let seq = PUBLISH_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut name = lock_path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.{}.tmp", pid, seq));
    lock_path.with_file_name(name)
}

/// Owner pid encoded in a staging file name (`.tandem.lock.<pid>.<seq>.tmp`).
fn staging_owner(name: &OsStr) -> Option<u32> {
    let name = name.to_str()?;
    let rest = name
        .strip_prefix(LOCK_FILE_NAME)?
        .strip_prefix('.')?
        .strip_suffix(".tmp")?;
    let (pid, seq) = rest.split_once('.')?;
    seq.parse::<u64>().ok()?;
    pid.parse().ok()
}

enum RecordRead {
    Missing,
    Corrupt(String),
    Record(LockRecord),
}

impl RecordRead {
    fn parse(bytes: &[u8]) -> Self {
        match LockRecord::from_json(bytes) {
            Ok(record) => Self::Record(record),
            Err(err) => Self::Corrupt(err.to_string()),
        }
    }
}

async fn read_record(lock_path: &Path) -> Result<RecordRead> {
    match fs::read(lock_path).await {
        Ok(bytes) => Ok(RecordRead::parse(&bytes)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(RecordRead::Missing),
        Err(err) => Err(LifecycleError::lock_io(lock_path, err)),
    }
}

fn read_record_blocking(lock_path: &Path) -> Result<RecordRead> {
    match std::fs::read(lock_path) {
        Ok(bytes) => Ok(RecordRead::parse(&bytes)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(RecordRead::Missing),
        Err(err) => Err(LifecycleError::lock_io(lock_path, err)),
    }
}

fn remove_blocking(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(LifecycleError::lock_io(path, err)),
    }
}

/// Deletes the lock file if it still holds `judged` (`None` for an unreadable
/// record). Returns whether it was deleted.
async fn reclaim(lock_path: &Path, judged: Option<LockRecord>) -> Result<bool> {
    let path = lock_path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<bool> {
        let _guard = DeletionGuard::lock(&path)?;
        let unchanged = match read_record_blocking(&path)? {
            RecordRead::Missing => false,
            RecordRead::Corrupt(_) => judged.is_none(),
            RecordRead::Record(current) => judged.as_ref() == Some(&current),
        };
        if unchanged {
            remove_blocking(&path)?;
        }
        Ok(unchanged)
    })
    .await
    .map_err(|err| LifecycleError::lock_io(lock_path, std::io::Error::other(err)))?
}

struct LockHandleInner {
    lock_path: PathBuf,
    record: LockRecord,
    released: AtomicBool,
}

impl LockHandleInner {
    fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let _guard = match DeletionGuard::lock(&self.lock_path) {
            Ok(guard) => guard,
            // the whole lock directory is gone, and the lock with it
            Err(LifecycleError::LockIo { source, .. }) if source.kind() == ErrorKind::NotFound => {
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        match read_record_blocking(&self.lock_path)? {
            RecordRead::Record(current) if current == self.record => {
                remove_blocking(&self.lock_path)?;
                info!(path = %self.lock_path.display(), "released data directory lock");
            }
            RecordRead::Missing => {}
            _ => {
                warn!(
                    path = %self.lock_path.display(),
                    "lock file no longer holds our record, leaving it in place"
                );
            }
        }
        Ok(())
    }
}

impl Drop for LockHandleInner {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!(error = %err, "failed to release lock on drop");
        }
    }
}

/// Release handle for an acquired lock.
///
/// Clones share one release: the first `release()` deletes the lock file if
/// it still holds this process's record, and every later call is a no-op.
/// Dropping the last clone releases as well.
#[derive(Clone)]
pub struct LockHandle {
    inner: Arc<LockHandleInner>,
}

impl LockHandle {
    fn new(lock_path: PathBuf, record: LockRecord) -> Self {
        Self {
            inner: Arc::new(LockHandleInner {
                lock_path,
                record,
                released: AtomicBool::new(false),
            }),
        }
    }

    pub fn lock_path(&self) -> &Path {
        &self.inner.lock_path
    }

    /// The record this handle published.
    pub fn record(&self) -> &LockRecord {
        &self.inner.record
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    pub fn release(&self) -> Result<()> {
        self.inner.release()
    }
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("lock_path", &self.inner.lock_path)
            .field("owner_pid", &self.inner.record.owner_pid)
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_path_sits_beside_data_dir() {
        let temp_dir = TempDir::new().unwrap();
        let data_dir = temp_dir.path().join("pgdata");
        let lock_path = lock_path_for(&data_dir).unwrap();
        assert_eq!(lock_path, temp_dir.path().join(LOCK_FILE_NAME));
    }

    #[cfg(unix)]
    #[test]
    fn test_lock_path_inside_root() {
        let lock_path = lock_path_for(Path::new("/")).unwrap();
        assert_eq!(lock_path, PathBuf::from("/").join(LOCK_FILE_NAME));
    }

    #[test]
    fn test_staging_paths_are_unique() {
        let lock_path = PathBuf::from("/srv/.tandem.lock");
        let a = staging_path(&lock_path, 12);
        let b = staging_path(&lock_path, 12);
        assert_ne!(a, b);
        assert_eq!(a.parent(), lock_path.parent());
    }

    #[tokio::test]
    async fn test_acquire_writes_record_for_current_process() {
        let temp_dir = TempDir::new().unwrap();
        let data_dir = temp_dir.path().join("pgdata");
        let manager = LockManager::default();

        let handle = manager
            .acquire(&data_dir, Duration::from_millis(100), Duration::from_millis(10))
            .await
            .unwrap();

        let (record, staleness) = manager.inspect(&data_dir).await.unwrap().unwrap();
        assert_eq!(record.owner_pid, std::process::id());
        assert_eq!(staleness, Staleness::Live);

        handle.release().unwrap();
        assert!(manager.inspect(&data_dir).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_no_staging_files_left_behind() {
        let temp_dir = TempDir::new().unwrap();
        let data_dir = temp_dir.path().join("pgdata");
        let manager = LockManager::default();

        let handle = manager
            .acquire(&data_dir, Duration::from_millis(100), Duration::from_millis(10))
            .await
            .unwrap();

        let names: Vec<String> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![LOCK_FILE_NAME.to_string()]);
        drop(handle);
    }

    #[test]
    fn test_staging_owner_parses_only_staging_names() {
        assert_eq!(staging_owner(OsStr::new(".tandem.lock.4242.7.tmp")), Some(4242));
        assert_eq!(staging_owner(OsStr::new(".tandem.lock")), None);
        assert_eq!(staging_owner(OsStr::new(".tandem.lock.guard")), None);
        assert_eq!(staging_owner(OsStr::new(".tandem.lock.x.7.tmp")), None);
        assert_eq!(staging_owner(OsStr::new("tandem-db.tar.tmp")), None);
    }

    #[test]
    fn test_lock_artifacts() {
        assert!(is_lock_artifact(OsStr::new(LOCK_FILE_NAME)));
        assert!(is_lock_artifact(OsStr::new(".tandem.lock.guard")));
        assert!(is_lock_artifact(OsStr::new(".tandem.lock.12.0.tmp")));
        assert!(!is_lock_artifact(OsStr::new("records")));
    }

    #[tokio::test]
    async fn test_release_leaves_a_lock_it_no_longer_owns() {
        let temp_dir = TempDir::new().unwrap();
        let data_dir = temp_dir.path().join("pgdata");
        let manager = LockManager::default();

        let handle = manager
            .acquire(&data_dir, Duration::from_millis(100), Duration::from_millis(10))
            .await
            .unwrap();
        let mut foreign = handle.record().clone();
        foreign.owner_pid = foreign.owner_pid.wrapping_add(1);
        std::fs::write(handle.lock_path(), foreign.to_json().unwrap()).unwrap();

        handle.release().unwrap();
        let on_disk = LockRecord::from_json(&std::fs::read(handle.lock_path()).unwrap()).unwrap();
        assert_eq!(on_disk, foreign);
    }

    #[tokio::test]
    async fn test_drop_releases() {
        let temp_dir = TempDir::new().unwrap();
        let data_dir = temp_dir.path().join("pgdata");
        let manager = LockManager::default();

        let handle = manager
            .acquire(&data_dir, Duration::from_millis(100), Duration::from_millis(10))
            .await
            .unwrap();
        let lock_path = handle.lock_path().to_path_buf();
        assert!(lock_path.exists());

        drop(handle);
        assert!(!lock_path.exists());
    }
}
