//! Periodic, crash-consistent snapshots of the live database.
//!
//! A snapshot is written to `<archive>.tmp` and synced, the current archive is
//! hard-linked to a timestamped backup, and the temp file is renamed over the
//! archive path. Old backups are pruned last. The rename is the only step that
//! changes what the archive path holds, so it always names a complete archive
//! once the first snapshot exists. This relies on same-filesystem rename
//! atomicity; a snapshot path on a network filesystem is outside that
//! guarantee.

pub mod rotation;
pub mod status;
pub mod worker;

pub use status::{SnapshotStatus, StatusReporter};
pub use worker::SnapshotSchedule;

use crate::core::{LifecycleError, Result};
use crate::storage::StorageEngine;
use chrono::Utc;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

pub const SNAPSHOT_FILE_NAME: &str = "tandem-db.tar";
pub const DEFAULT_SNAPSHOT_INTERVAL_MS: u64 = 60 * 60 * 1000;
pub const DEFAULT_MAX_BACKUPS: usize = 3;
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 5_000;

/// Retention and retry settings for the snapshot writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotPolicy {
    /// Copies kept in total, counting the live archive: after a rotation at
    /// most `max_backups - 1` backup files remain.
    pub max_backups: usize,
    /// Retries after the first failed attempt of one run.
    pub max_retry_attempts: u32,
    /// Delay before the first retry; doubles for each further retry.
    pub retry_delay: Duration,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            max_backups: DEFAULT_MAX_BACKUPS,
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        }
    }
}

impl SnapshotPolicy {
    /// Backoff before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.retry_delay.saturating_mul(factor)
    }

    fn backups_to_keep(&self) -> usize {
        self.max_backups.saturating_sub(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    Written { attempts: u32 },
    /// Another run was already in progress.
    Skipped,
    Failed { attempts: u32 },
}

struct RunningFlag<'a>(&'a AtomicBool);

impl<'a> RunningFlag<'a> {
    fn try_set(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Serializes a storage engine to a single archive file with backup rotation.
pub struct SnapshotWriter<E: StorageEngine> {
    storage: Arc<E>,
    snapshot_path: PathBuf,
    policy: SnapshotPolicy,
    status: StatusReporter,
    running: AtomicBool,
}

impl<E: StorageEngine> SnapshotWriter<E> {
    pub fn new(storage: Arc<E>, snapshot_path: impl Into<PathBuf>, policy: SnapshotPolicy) -> Self {
        Self {
            storage,
            snapshot_path: snapshot_path.into(),
            policy,
            status: StatusReporter::new(),
            running: AtomicBool::new(false),
        }
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    pub fn reporter(&self) -> StatusReporter {
        self.status.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Runs one snapshot, retrying with exponential backoff. Never fails: the
    /// outcome lands in the status reporter.
    pub async fn attempt_snapshot(&self) -> SnapshotOutcome {
        let Some(_running) = RunningFlag::try_set(&self.running) else {
            debug!(path = %self.snapshot_path.display(), "snapshot already running, skipping");
            return SnapshotOutcome::Skipped;
        };

        self.status.record_attempt(Utc::now());
        let mut attempts: u32 = 0;
        loop {
            attempts = attempts.saturating_add(1);
            match self.write_snapshot().await {
                Ok(bytes) => {
                    self.status.record_success(Utc::now());
                    info!(
                        path = %self.snapshot_path.display(),
                        bytes,
                        attempts,
                        "snapshot written"
                    );
                    return SnapshotOutcome::Written { attempts };
                }
                Err(err) if attempts > self.policy.max_retry_attempts => {
                    error!(
                        path = %self.snapshot_path.display(),
                        attempts,
                        error = %err,
                        "snapshot failed, giving up until next run"
                    );
                    self.status.record_failure(err.to_string());
                    return SnapshotOutcome::Failed { attempts };
                }
                Err(err) => {
                    let delay = self.policy.backoff(attempts);
                    warn!(
                        path = %self.snapshot_path.display(),
                        attempt = attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %err,
                        "snapshot attempt failed"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn write_snapshot(&self) -> Result<u64> {
        let path = self.snapshot_path.as_path();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| LifecycleError::snapshot_io(parent, err))?;
        }

        let archive = self
            .storage
            .dump()
            .await
            .map_err(|err| LifecycleError::snapshot_io(path, err))?;

        let tmp_path = rotation::temp_path(path);
        if let Err(err) = self.publish(&tmp_path, &archive).await {
            if let Err(cleanup) = fs::remove_file(&tmp_path).await {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    debug!(path = %tmp_path.display(), error = %cleanup, "could not remove snapshot temp file");
                }
            }
            return Err(err);
        }

        // the new archive is live; a failed prune only leaves extra backups
        match rotation::prune_backups(path, self.policy.backups_to_keep()).await {
            Ok(removed) => {
                for backup in removed {
                    debug!(backup = %backup.display(), "old snapshot backup deleted");
                }
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to prune snapshot backups");
            }
        }

        Ok(archive.len() as u64)
    }

    /// Writes `archive` to `tmp_path`, preserves the current archive as a
    /// backup, and swaps the temp file in.
    async fn publish(&self, tmp_path: &Path, archive: &[u8]) -> Result<()> {
        let path = self.snapshot_path.as_path();

        let mut tmp = fs::File::create(tmp_path)
            .await
            .map_err(|err| LifecycleError::snapshot_io(tmp_path, err))?;
        tmp.write_all(archive)
            .await
            .map_err(|err| LifecycleError::snapshot_io(tmp_path, err))?;
        tmp.sync_all()
            .await
            .map_err(|err| LifecycleError::snapshot_io(tmp_path, err))?;
        drop(tmp);

        if let Some(backup) = rotation::backup_current(path, Utc::now()).await? {
            debug!(backup = %backup.display(), "previous snapshot kept as backup");
        }

        fs::rename(tmp_path, path)
            .await
            .map_err(|err| LifecycleError::snapshot_io(path, err))
    }
}

/// Whether `name` is a snapshot archive, its temp file, or one of its backups.
pub fn is_snapshot_artifact(name: &OsStr) -> bool {
    name.to_string_lossy().starts_with(SNAPSHOT_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let policy = SnapshotPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(5));
        assert_eq!(policy.backoff(2), Duration::from_secs(10));
        assert_eq!(policy.backoff(3), Duration::from_secs(20));
    }

    #[test]
    fn test_backups_to_keep_never_underflows() {
        let policy = SnapshotPolicy {
            max_backups: 0,
            ..SnapshotPolicy::default()
        };
        assert_eq!(policy.backups_to_keep(), 0);
        assert_eq!(SnapshotPolicy::default().backups_to_keep(), 2);
    }

    #[test]
    fn test_running_flag_is_exclusive() {
        let flag = AtomicBool::new(false);
        let first = RunningFlag::try_set(&flag);
        assert!(first.is_some());
        assert!(RunningFlag::try_set(&flag).is_none());
        drop(first);
        assert!(RunningFlag::try_set(&flag).is_some());
    }
}
