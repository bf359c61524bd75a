use super::probe::ProcessProbe;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Owners whose record predates our own start by more than this are leftovers
/// from an earlier process that held the same PID. Heuristic only: it is
/// subject to clock skew between the recorded timestamp and the start time.
pub const SAME_PID_GRACE_MS: i64 = 1_000;

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    #[serde(rename = "pid")]
    pub owner_pid: u32,
    #[serde(rename = "timestamp")]
    pub acquired_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub start_time_ticks: Option<u64>,
}

/// Why a record was judged stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staleness {
    Live,
    /// Our own PID, but acquired before this process started.
    PreviousIncarnation,
    /// The PID now belongs to a different process instance.
    FingerprintMismatch,
    /// No process with that PID exists.
    OwnerGone,
}

impl Staleness {
    pub fn is_stale(self) -> bool {
        self != Self::Live
    }
}

impl LockRecord {
    /// Builds the record describing the calling process.
    pub fn for_current_process(probe: &dyn ProcessProbe) -> Self {
        let pid = probe.current_pid();
        Self {
            owner_pid: pid,
            acquired_at: Utc::now(),
            started_at: probe.process_started_at(),
            start_time_ticks: probe.start_fingerprint(pid),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// Decides whether the recorded owner is still the live process that
    /// created this record.
    pub fn staleness(&self, probe: &dyn ProcessProbe) -> Staleness {
        if self.owner_pid == probe.current_pid()
            && self.acquired_at < probe.process_started_at() - Duration::milliseconds(SAME_PID_GRACE_MS)
        {
            return Staleness::PreviousIncarnation;
        }

        if let Some(stored) = self.start_time_ticks {
            if let Some(current) = probe.start_fingerprint(self.owner_pid) {
                return if stored == current {
                    Staleness::Live
                } else {
                    Staleness::FingerprintMismatch
                };
            }
        }

        if probe.is_alive(self.owner_pid) {
            Staleness::Live
        } else {
            Staleness::OwnerGone
        }
    }
}
