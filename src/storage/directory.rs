//! Directory-backed storage engine.
//!
//! Records live as one file per key under `records/`; `VERSION` and
//! `schema.sql` mark an initialized database. Dumps are tar archives of the
//! data directory, minus lock and snapshot files that may share it.

use super::{StorageBackend, StorageEngine, is_lifecycle_artifact};
use crate::core::{LifecycleError, Result};
use async_trait::async_trait;
use std::io::{Cursor, ErrorKind};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;

pub const VERSION_FILE: &str = "VERSION";
pub const SCHEMA_FILE: &str = "schema.sql";
pub const RECORDS_DIR: &str = "records";
pub const FORMAT_VERSION: u32 = 1;

fn storage_err(context: &str, err: impl std::fmt::Display) -> LifecycleError {
    LifecycleError::Storage(format!("{}: {}", context, err))
}

fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(LifecycleError::Storage(format!("invalid record key '{}'", key)))
    }
}

/// A database stored as plain files in its data directory.
#[derive(Debug)]
pub struct DirectoryStore {
    data_dir: PathBuf,
    // writers take it exclusively, dumps share it
    gate: RwLock<()>,
}

impl DirectoryStore {
    fn new(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            gate: RwLock::new(()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.data_dir.join(RECORDS_DIR).join(key)
    }

    pub async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        validate_key(key)?;
        let _writer = self.gate.write().await;

        let records = self.data_dir.join(RECORDS_DIR);
        fs::create_dir_all(&records)
            .await
            .map_err(|err| storage_err("create records directory", err))?;

        let path = self.record_path(key);
        let tmp_path = records.join(format!(".{}.tmp", key));
        fs::write(&tmp_path, value)
            .await
            .map_err(|err| storage_err("write record", err))?;
        fs::rename(&tmp_path, &path)
            .await
            .map_err(|err| storage_err("publish record", err))?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        let _reader = self.gate.read().await;
        match fs::read(self.record_path(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(storage_err("read record", err)),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let _writer = self.gate.write().await;
        match fs::remove_file(self.record_path(key)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(storage_err("delete record", err)),
        }
    }

    pub async fn keys(&self) -> Result<Vec<String>> {
        let _reader = self.gate.read().await;
        let mut entries = match fs::read_dir(self.data_dir.join(RECORDS_DIR)).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(storage_err("list records", err)),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| storage_err("list records", err))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') {
                keys.push(name);
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// The schema this database was initialized with.
    pub async fn schema(&self) -> Result<Option<String>> {
        match fs::read_to_string(self.data_dir.join(SCHEMA_FILE)).await {
            Ok(schema) => Ok(Some(schema)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(storage_err("read schema", err)),
        }
    }
}

#[async_trait]
impl StorageEngine for DirectoryStore {
    async fn dump(&self) -> Result<Vec<u8>> {
        let _reader = self.gate.read().await;
        let data_dir = self.data_dir.clone();
        tokio::task::spawn_blocking(move || archive_dir(&data_dir))
            .await
            .map_err(|err| storage_err("dump task", err))?
            .map_err(|err| storage_err("archive data directory", err))
    }
}

fn archive_dir(data_dir: &Path) -> std::io::Result<Vec<u8>> {
    let mut entries = std::fs::read_dir(data_dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| !is_lifecycle_artifact(&entry.file_name()))
        .collect::<Vec<_>>();
    entries.sort_by_key(|entry| entry.file_name());

    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    for entry in entries {
        let name = entry.file_name();
        if entry.file_type()?.is_dir() {
            builder.append_dir_all(&name, entry.path())?;
        } else {
            builder.append_path_with_name(entry.path(), &name)?;
        }
    }
    builder.into_inner()
}


fn unpack_archive(archive: &[u8], data_dir: &Path) -> std::io::Result<()> {
    let mut archive = tar::Archive::new(Cursor::new(archive));
    archive.unpack(data_dir)
}

/// Opens [`DirectoryStore`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectoryBackend;

#[async_trait]
impl StorageBackend for DirectoryBackend {
    type Engine = DirectoryStore;

    async fn open_existing(&self, data_dir: &Path) -> Result<DirectoryStore> {
        let metadata = fs::metadata(data_dir)
            .await
            .map_err(|err| storage_err("open data directory", err))?;
        if !metadata.is_dir() {
            return Err(LifecycleError::Storage(format!(
                "'{}' is not a directory",
                data_dir.display()
            )));
        }
        Ok(DirectoryStore::new(data_dir))
    }

    async fn open_from_snapshot(&self, data_dir: &Path, archive: Vec<u8>) -> Result<DirectoryStore> {
        let target = data_dir.to_path_buf();
        let unpacked = tokio::task::spawn_blocking(move || unpack_archive(&archive, &target))
            .await
            .map_err(|err| storage_err("restore task", err))?;

        let load_err = |reason: String| LifecycleError::SnapshotLoad {
            path: data_dir.to_path_buf(),
            reason,
        };
        unpacked.map_err(|err| load_err(format!("unpack archive: {}", err)))?;

        let version = fs::read_to_string(data_dir.join(VERSION_FILE))
            .await
            .map_err(|err| load_err(format!("archive has no {}: {}", VERSION_FILE, err)))?;
        let version: u32 = version
            .trim()
            .parse()
            .map_err(|err| load_err(format!("bad {}: {}", VERSION_FILE, err)))?;
        if version != FORMAT_VERSION {
            return Err(load_err(format!("unsupported format version {}", version)));
        }

        Ok(DirectoryStore::new(data_dir))
    }

    async fn open_empty(&self, data_dir: &Path) -> Result<DirectoryStore> {
        fs::create_dir_all(data_dir.join(RECORDS_DIR))
            .await
            .map_err(|err| storage_err("create data directory", err))?;
        Ok(DirectoryStore::new(data_dir))
    }

    async fn apply_schema(&self, engine: &DirectoryStore, schema: &str) -> Result<()> {
        if schema.trim().is_empty() {
            return Err(LifecycleError::SchemaInit("schema is empty".to_string()));
        }

        let _writer = engine.gate.write().await;
        fs::write(engine.data_dir.join(SCHEMA_FILE), schema)
            .await
            .map_err(|err| LifecycleError::SchemaInit(format!("write schema: {}", err)))?;
        fs::write(
            engine.data_dir.join(VERSION_FILE),
            format!("{}\n", FORMAT_VERSION),
        )
        .await
        .map_err(|err| LifecycleError::SchemaInit(format!("write version marker: {}", err)))?;
        Ok(())
    }
}
