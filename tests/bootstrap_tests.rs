use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tandem_store::lock::LOCK_FILE_NAME;
use tandem_store::storage::BASELINE_SCHEMA;
use tandem_store::{
    Bootstrap, DataDirState, DirectoryBackend, DirectoryStore, LifecycleError, LocalStoreConfig,
    Result, SnapshotOutcome, SnapshotPolicy, SnapshotWriter, StorageBackend, StorageEngine,
};
use tempfile::{TempDir, tempdir};

/// Directory backend that counts which opening mode bootstrap picked.
#[derive(Default)]
struct RecordingBackend {
    inner: DirectoryBackend,
    existing: AtomicU32,
    restored: AtomicU32,
    empty: AtomicU32,
}

#[async_trait]
impl StorageBackend for RecordingBackend {
    type Engine = DirectoryStore;

    async fn open_existing(&self, data_dir: &Path) -> Result<DirectoryStore> {
        self.existing.fetch_add(1, Ordering::SeqCst);
        self.inner.open_existing(data_dir).await
    }

    async fn open_from_snapshot(&self, data_dir: &Path, archive: Vec<u8>) -> Result<DirectoryStore> {
        self.restored.fetch_add(1, Ordering::SeqCst);
        self.inner.open_from_snapshot(data_dir, archive).await
    }

    async fn open_empty(&self, data_dir: &Path) -> Result<DirectoryStore> {
        self.empty.fetch_add(1, Ordering::SeqCst);
        self.inner.open_empty(data_dir).await
    }

    async fn apply_schema(&self, engine: &DirectoryStore, schema: &str) -> Result<()> {
        self.inner.apply_schema(engine, schema).await
    }
}

struct Layout {
    root: TempDir,
}

impl Layout {
    fn new() -> Self {
        Self {
            root: tempdir().unwrap(),
        }
    }

    fn data_dir(&self) -> PathBuf {
        self.root.path().join("pgdata")
    }

    fn snapshot_path(&self) -> PathBuf {
        self.root.path().join("tandem-db.tar")
    }

    fn lock_path(&self) -> PathBuf {
        self.root.path().join(LOCK_FILE_NAME)
    }

    fn config(&self) -> LocalStoreConfig {
        LocalStoreConfig::new(self.data_dir())
            .lock_timing(Duration::from_millis(300), Duration::from_millis(20))
    }
}

/// Builds a snapshot archive of a database holding one transaction.
async fn seeded_archive() -> Vec<u8> {
    let source = tempdir().unwrap();
    let backend = DirectoryBackend;
    let store = backend.open_empty(source.path()).await.unwrap();
    backend.apply_schema(&store, BASELINE_SCHEMA).await.unwrap();
    store.put("txn-1", b"{\"amount_cents\":4200}").await.unwrap();
    store.dump().await.unwrap()
}

#[tokio::test]
async fn empty_dir_without_snapshot_gets_baseline_schema() {
    let layout = Layout::new();
    let bootstrap = Bootstrap::new(RecordingBackend::default());

    let opened = bootstrap.open(&layout.config()).await.unwrap();

    assert!(!opened.was_restored);
    assert_eq!(opened.state, DataDirState::Empty);
    assert_eq!(opened.snapshot_path, layout.snapshot_path());
    assert_eq!(
        opened.storage.schema().await.unwrap().as_deref(),
        Some(BASELINE_SCHEMA)
    );
    assert_eq!(bootstrap.backend().empty.load(Ordering::SeqCst), 1);
    assert_eq!(bootstrap.backend().restored.load(Ordering::SeqCst), 0);
    assert!(layout.lock_path().exists());
}

#[tokio::test]
async fn empty_dir_with_snapshot_is_restored() {
    let layout = Layout::new();
    std::fs::write(layout.snapshot_path(), seeded_archive().await).unwrap();

    let opened = Bootstrap::new(DirectoryBackend)
        .open(&layout.config())
        .await
        .unwrap();

    assert!(opened.was_restored);
    assert_eq!(opened.state, DataDirState::Empty);
    assert_eq!(
        opened.storage.get("txn-1").await.unwrap().unwrap(),
        b"{\"amount_cents\":4200}"
    );
}

#[tokio::test]
async fn existing_data_is_opened_and_snapshot_ignored() {
    let layout = Layout::new();
    std::fs::create_dir_all(layout.data_dir().join("records")).unwrap();
    std::fs::write(layout.data_dir().join("VERSION"), b"1\n").unwrap();
    std::fs::write(layout.snapshot_path(), seeded_archive().await).unwrap();

    let bootstrap = Bootstrap::new(RecordingBackend::default());
    let opened = bootstrap.open(&layout.config()).await.unwrap();

    assert!(!opened.was_restored);
    assert_eq!(opened.state, DataDirState::HasLocalData);
    assert_eq!(bootstrap.backend().existing.load(Ordering::SeqCst), 1);
    assert_eq!(bootstrap.backend().restored.load(Ordering::SeqCst), 0);
    assert_eq!(bootstrap.backend().empty.load(Ordering::SeqCst), 0);
    assert!(opened.storage.get("txn-1").await.unwrap().is_none());
}

#[tokio::test]
async fn unreadable_snapshot_degrades_to_empty_schema() {
    let layout = Layout::new();
    std::fs::write(layout.snapshot_path(), b"definitely not a tar archive").unwrap();

    let opened = Bootstrap::new(DirectoryBackend)
        .open(&layout.config())
        .await
        .unwrap();

    assert!(!opened.was_restored);
    assert_eq!(
        opened.storage.schema().await.unwrap().as_deref(),
        Some(BASELINE_SCHEMA)
    );
    assert!(opened.storage.keys().await.unwrap().is_empty());
    // the bad archive stays in place for inspection
    assert!(layout.snapshot_path().exists());
}

#[tokio::test]
async fn snapshot_path_override_is_honored() {
    let layout = Layout::new();
    let custom = layout.root.path().join("elsewhere").join("custom.tar");
    std::fs::create_dir_all(custom.parent().unwrap()).unwrap();
    std::fs::write(&custom, seeded_archive().await).unwrap();

    let opened = Bootstrap::new(DirectoryBackend)
        .open(&layout.config().snapshot_path(&custom))
        .await
        .unwrap();

    assert!(opened.was_restored);
    assert_eq!(opened.snapshot_path, custom);
}

#[tokio::test]
async fn schema_failure_is_fatal_and_releases_the_lock() {
    let layout = Layout::new();

    let err = Bootstrap::new(DirectoryBackend)
        .with_schema("   ")
        .open(&layout.config())
        .await
        .unwrap_err();

    assert!(matches!(err, LifecycleError::SchemaInit(_)));
    assert!(err.is_fatal());
    assert!(!layout.lock_path().exists());
}

#[tokio::test]
async fn second_open_times_out_while_first_holds_the_lock() {
    let layout = Layout::new();
    let first = Bootstrap::new(DirectoryBackend)
        .open(&layout.config())
        .await
        .unwrap();

    let err = Bootstrap::new(DirectoryBackend)
        .open(&layout.config())
        .await
        .unwrap_err();
    match err {
        LifecycleError::LockTimeout { holder_pid, .. } => {
            assert_eq!(holder_pid, std::process::id());
        }
        other => panic!("expected LockTimeout, got {:?}", other),
    }

    first.hooks.run();
    let reopened = Bootstrap::new(DirectoryBackend)
        .open(&layout.config())
        .await
        .unwrap();
    assert_eq!(reopened.state, DataDirState::HasLocalData);
}

#[tokio::test]
async fn shutdown_hooks_release_the_lock_once() {
    let layout = Layout::new();
    let opened = Bootstrap::new(DirectoryBackend)
        .open(&layout.config())
        .await
        .unwrap();
    assert_eq!(opened.hooks.len(), 1);

    assert_eq!(opened.hooks.run(), 1);
    assert!(opened.lock.is_released());
    assert!(!layout.lock_path().exists());

    assert_eq!(opened.hooks.run(), 0);
    opened.lock.release().unwrap();
}

#[tokio::test]
async fn snapshot_survives_loss_of_the_data_dir() {
    let layout = Layout::new();
    let config = layout.config();

    let opened = Bootstrap::new(DirectoryBackend).open(&config).await.unwrap();
    opened
        .storage
        .put("txn-7", b"{\"amount_cents\":1999}")
        .await
        .unwrap();

    let writer = SnapshotWriter::new(
        opened.storage.clone(),
        opened.snapshot_path.clone(),
        SnapshotPolicy::default(),
    );
    assert_eq!(
        writer.attempt_snapshot().await,
        SnapshotOutcome::Written { attempts: 1 }
    );
    opened.hooks.run();
    drop(opened);

    std::fs::remove_dir_all(layout.data_dir()).unwrap();

    let restored = Bootstrap::new(DirectoryBackend).open(&config).await.unwrap();
    assert!(restored.was_restored);
    assert_eq!(
        restored.storage.get("txn-7").await.unwrap().unwrap(),
        b"{\"amount_cents\":1999}"
    );
    assert_eq!(
        restored.storage.schema().await.unwrap().as_deref(),
        Some(BASELINE_SCHEMA)
    );
}
