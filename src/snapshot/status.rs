use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, RwLock};

/// Process-lifetime snapshot bookkeeping, surfaced by the health endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotStatus {
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

/// Shared view of [`SnapshotStatus`].
///
/// Only the snapshot writer mutates it; everybody else gets copies.
#[derive(Debug, Clone, Default)]
pub struct StatusReporter {
    inner: Arc<RwLock<SnapshotStatus>>,
}

impl StatusReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_status(&self) -> SnapshotStatus {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn update(&self, apply: impl FnOnce(&mut SnapshotStatus)) {
        match self.inner.write() {
            Ok(mut guard) => apply(&mut guard),
            Err(poisoned) => apply(&mut poisoned.into_inner()),
        }
    }

    pub(crate) fn record_attempt(&self, at: DateTime<Utc>) {
        self.update(|status| status.last_attempt = Some(at));
    }

    pub(crate) fn record_success(&self, at: DateTime<Utc>) {
        self.update(|status| {
            status.last_success = Some(at);
            status.last_error = None;
            status.consecutive_failures = 0;
        });
    }

    pub(crate) fn record_failure(&self, error: String) {
        self.update(|status| {
            status.last_error = Some(error);
            status.consecutive_failures = status.consecutive_failures.saturating_add(1);
        });
    }
}
