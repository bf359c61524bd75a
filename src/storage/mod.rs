//! Storage engine seam.
//!
//! The lifecycle manager never looks inside the database. It needs an engine
//! that can dump itself to a portable archive, and a backend that can open an
//! engine in the three bootstrap modes.

pub mod directory;

pub use directory::{DirectoryBackend, DirectoryStore};

use crate::core::Result;
use crate::{lock, snapshot};
use async_trait::async_trait;
use std::ffi::OsStr;
use std::path::Path;

/// Baseline schema of the expense tracker, applied to empty databases.
pub const BASELINE_SCHEMA: &str = include_str!("../../schema/baseline.sql");

/// Whether `name` belongs to the lifecycle manager rather than the database.
///
/// A data directory at the filesystem root holds its own lock and snapshot
/// files, so these names are neither data nor dump content.
pub fn is_lifecycle_artifact(name: &OsStr) -> bool {
    lock::is_lock_artifact(name) || snapshot::is_snapshot_artifact(name)
}

/// A live database that can be serialized for snapshotting.
#[async_trait]
pub trait StorageEngine: Send + Sync + 'static {
    /// Serializes the whole database into a portable archive.
    ///
    /// Must be crash consistent: the archive reflects one point in time even
    /// while writers are active.
    async fn dump(&self) -> Result<Vec<u8>>;
}

/// Opens [`StorageEngine`]s over a data directory.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    type Engine: StorageEngine;

    /// Opens a directory that already holds a database.
    async fn open_existing(&self, data_dir: &Path) -> Result<Self::Engine>;

    /// Seeds an empty directory from a snapshot archive and opens it.
    async fn open_from_snapshot(&self, data_dir: &Path, archive: Vec<u8>) -> Result<Self::Engine>;

    /// Opens a fresh, schema-less database in an empty directory.
    async fn open_empty(&self, data_dir: &Path) -> Result<Self::Engine>;

    async fn apply_schema(&self, engine: &Self::Engine, schema: &str) -> Result<()>;
}
