// ============================================================================
// Tandem Store Library
// ============================================================================

//! Lifecycle manager for the embedded local database of the Tandem
//! shared-expense tracker.
//!
//! Covers exclusive single-writer locking of the data directory, periodic
//! crash-consistent snapshots with backup rotation, and startup bootstrap
//! that resumes, restores, or initializes the database.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use tandem_store::{Bootstrap, DirectoryBackend, LocalStoreConfig, SnapshotWriter};
//!
//! # async fn run() -> tandem_store::Result<()> {
//! let config = LocalStoreConfig::new("/var/lib/tandem/pgdata");
//! let opened = Bootstrap::new(DirectoryBackend).open(&config).await?;
//!
//! let writer = Arc::new(SnapshotWriter::new(
//!     opened.storage.clone(),
//!     opened.snapshot_path.clone(),
//!     config.snapshot_policy.clone(),
//! ));
//! let mut schedule = writer.schedule(config.snapshot_interval);
//!
//! // ... serve requests ...
//!
//! schedule.cancel();
//! opened.hooks.run();
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod config;
pub mod core;
pub mod lock;
pub mod snapshot;
pub mod storage;
pub mod web;

pub use bootstrap::{Bootstrap, BootstrapOutcome, DataDirState, ShutdownHooks};
pub use config::{AppConfig, LocalStoreConfig};
pub use core::{LifecycleError, Result};
pub use lock::{LockHandle, LockManager, LockRecord, ProcessProbe, Staleness, SystemProcessProbe};
pub use snapshot::{
    SnapshotOutcome, SnapshotPolicy, SnapshotSchedule, SnapshotStatus, SnapshotWriter,
    StatusReporter,
};
pub use storage::{DirectoryBackend, DirectoryStore, StorageBackend, StorageEngine};
