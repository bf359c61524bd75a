use super::SnapshotWriter;
use crate::storage::StorageEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Cancel handle for periodic snapshotting.
///
/// Cancelling stops the timer only. An attempt that is already running is
/// left to finish or exhaust its retries; the timer task exits once it has.
pub struct SnapshotSchedule {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl SnapshotSchedule {
    pub fn cancel(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.stop_tx.is_none()
    }

    /// Cancels and waits until the timer task and every in-flight attempt
    /// have finished.
    pub async fn stop(mut self) {
        self.cancel();
        if let Some(join_handle) = self.join_handle.take() {
            let _ = join_handle.await;
        }
    }
}

impl Drop for SnapshotSchedule {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl<E: StorageEngine> SnapshotWriter<E> {
    /// Fires an attempt immediately, then every `every`. A firing that finds
    /// the previous attempt still running is skipped, not queued.
    pub fn schedule(self: &Arc<Self>, every: Duration) -> SnapshotSchedule {
        let every = every.max(Duration::from_millis(1));
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let writer = Arc::clone(self);

        info!(
            path = %writer.snapshot_path().display(),
            interval_ms = every.as_millis() as u64,
            "snapshot schedule started"
        );

        let join_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut attempts = JoinSet::new();
            loop {
                tokio::select! {
                    _ = &mut stop_rx => {
                        debug!(in_flight = attempts.len(), "snapshot schedule cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        let writer = Arc::clone(&writer);
                        attempts.spawn(async move { writer.attempt_snapshot().await });
                    }
                    Some(_) = attempts.join_next(), if !attempts.is_empty() => {}
                }
            }
            while attempts.join_next().await.is_some() {}
        });

        SnapshotSchedule {
            stop_tx: Some(stop_tx),
            join_handle: Some(join_handle),
        }
    }
}
