use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error(
        "Lock timeout: '{lock_path}' held by pid {holder_pid} since {acquired_at} (waited {waited_ms}ms)"
    )]
    LockTimeout {
        lock_path: PathBuf,
        holder_pid: u32,
        acquired_at: String,
        waited_ms: u64,
    },

    #[error("Lock I/O error on '{path}': {source}")]
    LockIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Snapshot I/O error on '{path}': {reason}")]
    SnapshotIo { path: PathBuf, reason: String },

    #[error("Snapshot load error for '{path}': {reason}")]
    SnapshotLoad { path: PathBuf, reason: String },

    #[error("Schema initialization failed: {0}")]
    SchemaInit(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, LifecycleError>;

impl LifecycleError {
    pub(crate) fn lock_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::LockIo {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn snapshot_io(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::SnapshotIo {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the error must abort process startup.
    ///
    /// Snapshot failures only degrade durability; everything that touches
    /// exclusive ownership, schema, or configuration does not.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::SnapshotIo { .. } | Self::SnapshotLoad { .. }
        )
    }
}
