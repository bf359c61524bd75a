use crate::core::{LifecycleError, Result};
use crate::lock::{DEFAULT_LOCK_RETRY_DELAY_MS, DEFAULT_LOCK_WAIT_MS};
use crate::snapshot::{DEFAULT_SNAPSHOT_INTERVAL_MS, SNAPSHOT_FILE_NAME, SnapshotPolicy};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_DATA_DIR: &str = "PGLITE_DATA_DIR";
pub const ENV_SNAPSHOT_PATH: &str = "PGLITE_SNAPSHOT_PATH";
pub const ENV_SNAPSHOT_INTERVAL_MS: &str = "PGLITE_SNAPSHOT_INTERVAL_MS";
pub const ENV_LOCK_WAIT_MS: &str = "PGLITE_LOCK_WAIT_MS";
pub const ENV_LOCK_RETRY_DELAY_MS: &str = "PGLITE_LOCK_RETRY_DELAY_MS";
pub const ENV_SNAPSHOT_MAX_BACKUPS: &str = "PGLITE_SNAPSHOT_MAX_BACKUPS";
pub const ENV_SNAPSHOT_RETRY_ATTEMPTS: &str = "PGLITE_SNAPSHOT_RETRY_ATTEMPTS";
pub const ENV_SNAPSHOT_RETRY_DELAY_MS: &str = "PGLITE_SNAPSHOT_RETRY_DELAY_MS";

/// Settings for the local embedded database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalStoreConfig {
    /// Directory holding the database files
    pub data_dir: PathBuf,

    /// Explicit snapshot archive location; derived from `data_dir` when unset
    pub snapshot_path: Option<PathBuf>,

    /// Time between scheduled snapshots
    pub snapshot_interval: Duration,

    /// Upper bound on waiting for the data directory lock
    pub lock_wait: Duration,

    /// Polling interval while the lock is held elsewhere
    pub lock_retry_delay: Duration,

    pub snapshot_policy: SnapshotPolicy,
}

impl LocalStoreConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            snapshot_path: None,
            snapshot_interval: Duration::from_millis(DEFAULT_SNAPSHOT_INTERVAL_MS),
            lock_wait: Duration::from_millis(DEFAULT_LOCK_WAIT_MS),
            lock_retry_delay: Duration::from_millis(DEFAULT_LOCK_RETRY_DELAY_MS),
            snapshot_policy: SnapshotPolicy::default(),
        }
    }

    /// Set the snapshot archive location
    pub fn snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }

    /// Set the snapshot interval
    pub fn snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = interval;
        self
    }

    /// Set lock wait and polling interval
    pub fn lock_timing(mut self, wait: Duration, retry_delay: Duration) -> Self {
        self.lock_wait = wait;
        self.lock_retry_delay = retry_delay;
        self
    }

    /// Set retention and retry policy
    pub fn snapshot_policy(mut self, policy: SnapshotPolicy) -> Self {
        self.snapshot_policy = policy;
        self
    }

    /// Reads the `PGLITE_*` environment variables. `None` means local mode is
    /// not selected.
    pub fn from_env() -> Result<Option<Self>> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Option<Self>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let Some(data_dir) = get(ENV_DATA_DIR) else {
            return Ok(None);
        };

        let mut config = Self::new(data_dir.trim());
        if let Some(path) = get(ENV_SNAPSHOT_PATH) {
            config.snapshot_path = Some(PathBuf::from(path.trim()));
        }
        if let Some(raw) = get(ENV_SNAPSHOT_INTERVAL_MS) {
            let ms = parse_u64(ENV_SNAPSHOT_INTERVAL_MS, &raw)?;
            if ms == 0 {
                return Err(LifecycleError::Config(format!(
                    "{} must be greater than zero",
                    ENV_SNAPSHOT_INTERVAL_MS
                )));
            }
            config.snapshot_interval = Duration::from_millis(ms);
        }
        if let Some(raw) = get(ENV_LOCK_WAIT_MS) {
            config.lock_wait = Duration::from_millis(parse_u64(ENV_LOCK_WAIT_MS, &raw)?);
        }
        if let Some(raw) = get(ENV_LOCK_RETRY_DELAY_MS) {
            config.lock_retry_delay =
                Duration::from_millis(parse_u64(ENV_LOCK_RETRY_DELAY_MS, &raw)?);
        }
        if let Some(raw) = get(ENV_SNAPSHOT_MAX_BACKUPS) {
            config.snapshot_policy.max_backups =
                parse_u64(ENV_SNAPSHOT_MAX_BACKUPS, &raw)? as usize;
        }
        if let Some(raw) = get(ENV_SNAPSHOT_RETRY_ATTEMPTS) {
            config.snapshot_policy.max_retry_attempts =
                u32::try_from(parse_u64(ENV_SNAPSHOT_RETRY_ATTEMPTS, &raw)?).map_err(|_| {
                    LifecycleError::Config(format!("{} is too large", ENV_SNAPSHOT_RETRY_ATTEMPTS))
                })?;
        }
        if let Some(raw) = get(ENV_SNAPSHOT_RETRY_DELAY_MS) {
            config.snapshot_policy.retry_delay =
                Duration::from_millis(parse_u64(ENV_SNAPSHOT_RETRY_DELAY_MS, &raw)?);
        }

        Ok(Some(config))
    }

    /// The snapshot archive path: the override if set, otherwise
    /// `tandem-db.tar` beside the data directory (inside it for a root).
    ///
    /// An override may not point inside the data directory, where the dump
    /// would archive the previous snapshot.
    pub fn resolved_snapshot_path(&self) -> Result<PathBuf> {
        let Some(path) = &self.snapshot_path else {
            return default_snapshot_path(&self.data_dir);
        };
        let data_dir = absolute(&self.data_dir, "data directory")?;
        if absolute(path, "snapshot path")?.starts_with(&data_dir) {
            return Err(LifecycleError::Config(format!(
                "{} '{}' must not be inside the data directory '{}'",
                ENV_SNAPSHOT_PATH,
                path.display(),
                data_dir.display()
            )));
        }
        Ok(path.clone())
    }
}

fn absolute(path: &Path, what: &str) -> Result<PathBuf> {
    std::path::absolute(path).map_err(|err| {
        LifecycleError::Config(format!("cannot resolve {} '{}': {}", what, path.display(), err))
    })
}

pub fn default_snapshot_path(data_dir: &Path) -> Result<PathBuf> {
    let absolute = absolute(data_dir, "data directory")?;
    Ok(match absolute.parent() {
        Some(parent) => parent.join(SNAPSHOT_FILE_NAME),
        None => absolute.join(SNAPSHOT_FILE_NAME),
    })
}

fn parse_u64(key: &str, raw: &str) -> Result<u64> {
    raw.trim().parse::<u64>().map_err(|err| {
        LifecycleError::Config(format!("{} must be a non-negative integer ({}): {:?}", key, err, raw))
    })
}

/// Settings of the `tandem-store` service.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub local: Option<LocalStoreConfig>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("APP_HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = match lookup("APP_PORT") {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .map_err(|_| LifecycleError::Config("APP_PORT must be a valid u16".to_string()))?,
            None => 8080,
        };
        let local = LocalStoreConfig::from_lookup(&lookup)?;
        Ok(Self { host, port, local })
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
