//! Startup decision between resuming local data, restoring the latest
//! snapshot, and initializing an empty schema.

pub mod shutdown;

pub use shutdown::ShutdownHooks;

use crate::config::LocalStoreConfig;
use crate::core::{LifecycleError, Result};
use crate::lock::{LockHandle, LockManager};
use crate::storage::{BASELINE_SCHEMA, StorageBackend, is_lifecycle_artifact};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirState {
    Empty,
    HasLocalData,
}

/// An opened local database and everything needed to shut it down.
pub struct BootstrapOutcome<E> {
    pub storage: Arc<E>,
    pub was_restored: bool,
    /// What the data directory looked like before opening.
    pub state: DataDirState,
    pub lock: LockHandle,
    pub hooks: ShutdownHooks,
    pub snapshot_path: PathBuf,
}

impl<E> std::fmt::Debug for BootstrapOutcome<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapOutcome")
            .field("was_restored", &self.was_restored)
            .field("state", &self.state)
            .field("lock", &self.lock)
            .field("snapshot_path", &self.snapshot_path)
            .finish()
    }
}

pub struct Bootstrap<B: StorageBackend> {
    backend: B,
    locks: LockManager,
    schema: String,
}

impl<B: StorageBackend> Bootstrap<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            locks: LockManager::default(),
            schema: BASELINE_SCHEMA.to_string(),
        }
    }

    pub fn with_lock_manager(mut self, locks: LockManager) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Takes exclusive ownership of the data directory and opens the database.
    ///
    /// Lock and schema failures are fatal. A snapshot that cannot be loaded
    /// degrades to empty initialization.
    pub async fn open(&self, config: &LocalStoreConfig) -> Result<BootstrapOutcome<B::Engine>> {
        let data_dir = config.data_dir.as_path();
        let snapshot_path = config.resolved_snapshot_path()?;

        fs::create_dir_all(data_dir).await.map_err(|err| {
            LifecycleError::Storage(format!(
                "create data directory '{}': {}",
                data_dir.display(),
                err
            ))
        })?;

        let lock = self
            .locks
            .acquire(data_dir, config.lock_wait, config.lock_retry_delay)
            .await?;

        // inspected under the lock so nobody can populate it in between
        let state = inspect_data_dir(data_dir).await?;
        info!(data_dir = %data_dir.display(), state = ?state, "opening local database");

        let (engine, was_restored) = match state {
            DataDirState::HasLocalData => (self.backend.open_existing(data_dir).await?, false),
            DataDirState::Empty => self.open_empty_dir(data_dir, &snapshot_path).await?,
        };

        let hooks = ShutdownHooks::new();
        let release = lock.clone();
        hooks.register_shutdown_hook("release data directory lock", move || {
            if let Err(err) = release.release() {
                warn!(error = %err, "failed to release data directory lock");
            }
        });

        info!(
            data_dir = %data_dir.display(),
            was_restored,
            "local database opened"
        );

        Ok(BootstrapOutcome {
            storage: Arc::new(engine),
            was_restored,
            state,
            lock,
            hooks,
            snapshot_path,
        })
    }

    async fn open_empty_dir(
        &self,
        data_dir: &Path,
        snapshot_path: &Path,
    ) -> Result<(B::Engine, bool)> {
        match self.restore_snapshot(data_dir, snapshot_path).await {
            Ok(Some(engine)) => {
                info!(snapshot = %snapshot_path.display(), "restored database from snapshot");
                return Ok((engine, true));
            }
            Ok(None) => {
                info!(snapshot = %snapshot_path.display(), "no snapshot found, initializing schema");
            }
            Err(err) => {
                warn!(
                    snapshot = %snapshot_path.display(),
                    error = %err,
                    "snapshot could not be loaded, initializing empty schema"
                );
                clear_dir_contents(data_dir).await?;
            }
        }

        let engine = self.backend.open_empty(data_dir).await?;
        self.backend
            .apply_schema(&engine, &self.schema)
            .await
            .map_err(|err| match err {
                schema @ LifecycleError::SchemaInit(_) => schema,
                other => LifecycleError::SchemaInit(other.to_string()),
            })?;
        Ok((engine, false))
    }

    async fn restore_snapshot(
        &self,
        data_dir: &Path,
        snapshot_path: &Path,
    ) -> Result<Option<B::Engine>> {
        let archive = match fs::read(snapshot_path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(LifecycleError::SnapshotLoad {
                    path: snapshot_path.to_path_buf(),
                    reason: err.to_string(),
                });
            }
        };

        self.backend
            .open_from_snapshot(data_dir, archive)
            .await
            .map(Some)
            .map_err(|err| LifecycleError::SnapshotLoad {
                path: snapshot_path.to_path_buf(),
                reason: err.to_string(),
            })
    }
}

pub async fn inspect_data_dir(data_dir: &Path) -> Result<DataDirState> {
    let storage_err = |err: std::io::Error| {
        LifecycleError::Storage(format!(
            "inspect data directory '{}': {}",
            data_dir.display(),
            err
        ))
    };

    let mut entries = fs::read_dir(data_dir).await.map_err(storage_err)?;
    while let Some(entry) = entries.next_entry().await.map_err(storage_err)? {
        if !is_lifecycle_artifact(&entry.file_name()) {
            return Ok(DataDirState::HasLocalData);
        }
    }
    Ok(DataDirState::Empty)
}

/// Removes whatever a failed restore left behind, sparing lock and snapshot
/// files that live inside the directory.
async fn clear_dir_contents(data_dir: &Path) -> Result<()> {
    let storage_err = |err: std::io::Error| {
        LifecycleError::Storage(format!(
            "clear data directory '{}': {}",
            data_dir.display(),
            err
        ))
    };

    let mut entries = fs::read_dir(data_dir).await.map_err(storage_err)?;
    while let Some(entry) = entries.next_entry().await.map_err(storage_err)? {
        if is_lifecycle_artifact(&entry.file_name()) {
            continue;
        }
        let path = entry.path();
        let file_type = entry.file_type().await.map_err(storage_err)?;
        let removed = if file_type.is_dir() {
            fs::remove_dir_all(&path).await
        } else {
            fs::remove_file(&path).await
        };
        match removed {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(storage_err(err)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LOCK_FILE_NAME;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_inspect_data_dir() {
        let temp_dir = TempDir::new().unwrap();
        assert_eq!(inspect_data_dir(temp_dir.path()).await.unwrap(), DataDirState::Empty);

        std::fs::write(temp_dir.path().join(LOCK_FILE_NAME), b"{}").unwrap();
        assert_eq!(inspect_data_dir(temp_dir.path()).await.unwrap(), DataDirState::Empty);

        for name in [".tandem.lock.guard", ".tandem.lock.31.2.tmp", "tandem-db.tar", "tandem-db.tar.tmp"] {
            std::fs::write(temp_dir.path().join(name), b"{}").unwrap();
        }
        assert_eq!(inspect_data_dir(temp_dir.path()).await.unwrap(), DataDirState::Empty);

        std::fs::write(temp_dir.path().join("PG_VERSION"), b"16").unwrap();
        assert_eq!(
            inspect_data_dir(temp_dir.path()).await.unwrap(),
            DataDirState::HasLocalData
        );
    }

    #[tokio::test]
    async fn test_clear_keeps_lock_and_snapshot_files() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join(LOCK_FILE_NAME), b"{}").unwrap();
        std::fs::write(temp_dir.path().join("tandem-db.tar"), b"archive").unwrap();
        std::fs::create_dir_all(temp_dir.path().join("base/1")).unwrap();
        std::fs::write(temp_dir.path().join("base/1/page"), b"x").unwrap();
        std::fs::write(temp_dir.path().join("VERSION"), b"1").unwrap();

        clear_dir_contents(temp_dir.path()).await.unwrap();

        let mut names: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                std::ffi::OsString::from(LOCK_FILE_NAME),
                std::ffi::OsString::from("tandem-db.tar"),
            ]
        );
    }
}
