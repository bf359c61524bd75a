//! Advisory guard around lock file deletion.
//!
//! Publishing a lock is exclusive on its own (hard-link creation fails when the
//! file exists), but deleting one is not: a reader that judged a record stale
//! could otherwise unlink a fresh lock published after its read. Every
//! read-compare-delete of the lock file therefore runs while holding an
//! exclusive `flock` on a sibling guard file.

use crate::core::{LifecycleError, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

pub const GUARD_SUFFIX: &str = ".guard";

pub(crate) fn guard_path(lock_path: &Path) -> PathBuf {
    let mut name = lock_path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(GUARD_SUFFIX);
    lock_path.with_file_name(name)
}

/// Held exclusive lock on the guard file. Closing the file releases it.
///
/// The guard file is never deleted: waiters blocked on the old inode would
/// otherwise race holders of a new one.
pub(crate) struct DeletionGuard {
    _file: File,
}

impl DeletionGuard {
    /// Blocks until the guard for `lock_path` is held.
    pub(crate) fn lock(lock_path: &Path) -> Result<Self> {
        let path = guard_path(lock_path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|err| LifecycleError::lock_io(&path, err))?;
        file.lock_exclusive()
            .map_err(|err| LifecycleError::lock_io(&path, err))?;
        Ok(Self { _file: file })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[test]
    fn test_guard_path_is_sibling() {
        let path = guard_path(Path::new("/srv/.tandem.lock"));
        assert_eq!(path, PathBuf::from("/srv/.tandem.lock.guard"));
    }

    #[test]
    fn test_guard_is_exclusive_across_handles() {
        let temp_dir = TempDir::new().unwrap();
        let lock_path = temp_dir.path().join(".tandem.lock");
        let inside = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let lock_path = lock_path.clone();
                let inside = inside.clone();
                let overlaps = overlaps.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        let _guard = DeletionGuard::lock(&lock_path).unwrap();
                        if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        std::thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert!(guard_path(&lock_path).exists());
    }
}
