//! Naming and rotation of snapshot backup files.
//!
//! Backups sit next to the live archive as
//! `<archive>.backup.<timestamp>`, where the RFC 3339 timestamp has its
//! colons and periods replaced by hyphens.

use crate::core::{LifecycleError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Where a snapshot is written before it is swapped in.
pub fn temp_path(snapshot_path: &Path) -> PathBuf {
    with_suffix(snapshot_path, ".tmp")
}

pub fn backup_stamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-")
}

pub fn backup_path(snapshot_path: &Path, at: DateTime<Utc>) -> PathBuf {
    with_suffix(snapshot_path, &format!(".backup.{}", backup_stamp(at)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupFile {
    pub path: PathBuf,
    pub modified: SystemTime,
}

/// Lists backups of `snapshot_path`, newest first.
pub async fn list_backups(snapshot_path: &Path) -> Result<Vec<BackupFile>> {
    let dir = match snapshot_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let prefix = match snapshot_path.file_name() {
        Some(name) => format!("{}.backup.", name.to_string_lossy()),
        None => return Ok(Vec::new()),
    };

    let mut entries = match fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(LifecycleError::snapshot_io(&dir, err)),
    };

    let mut backups = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| LifecycleError::snapshot_io(&dir, err))?
    {
        if !entry.file_name().to_string_lossy().starts_with(&prefix) {
            continue;
        }
        let path = entry.path();
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            // deleted by someone else between listing and stat
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => return Err(LifecycleError::snapshot_io(&path, err)),
        };
        if !metadata.is_file() {
            continue;
        }
        let modified = metadata
            .modified()
            .map_err(|err| LifecycleError::snapshot_io(&path, err))?;
        backups.push(BackupFile { path, modified });
    }

    // names embed the timestamp, so they break mtime ties
    backups.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.path.cmp(&a.path)));
    Ok(backups)
}

/// Deletes all but the newest `keep` backups. Returns the deleted paths.
pub async fn prune_backups(snapshot_path: &Path, keep: usize) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for backup in list_backups(snapshot_path).await?.into_iter().skip(keep) {
        match fs::remove_file(&backup.path).await {
            Ok(()) => removed.push(backup.path),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(LifecycleError::snapshot_io(&backup.path, err)),
        }
    }
    Ok(removed)
}

/// Preserves the current archive as a timestamped backup. The backup is a
/// hard link (a copy where links are unsupported), so the archive itself never
/// leaves its path. Returns `None` when there is no archive yet.
pub async fn backup_current(snapshot_path: &Path, at: DateTime<Utc>) -> Result<Option<PathBuf>> {
    let base = backup_path(snapshot_path, at);
    let mut target = base.clone();
    let mut collision = 0u32;
    loop {
        match fs::hard_link(snapshot_path, &target).await {
            Ok(()) => return Ok(Some(target)),
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                collision += 1;
                target = with_suffix(&base, &format!("-{}", collision));
            }
            Err(_) => break,
        }
    }

    match fs::copy(snapshot_path, &target).await {
        Ok(_) => Ok(Some(target)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(LifecycleError::snapshot_io(&target, err)),
    }
}
