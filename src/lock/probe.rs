//! Process identity and liveness probing.
//!
//! PID liveness is racy and platform dependent, so the lock manager only talks
//! to the [`ProcessProbe`] trait. Tests substitute a deterministic fake.

use chrono::{DateTime, Utc};

lazy_static::lazy_static! {
    static ref FIRST_OBSERVED_AT: DateTime<Utc> = Utc::now();
}

/// Capability for asking the host about processes.
pub trait ProcessProbe: Send + Sync {
    /// PID of the calling process.
    fn current_pid(&self) -> u32;

    /// Wall-clock start time of the calling process.
    fn process_started_at(&self) -> DateTime<Utc>;

    /// Opaque start fingerprint for `pid`, if the platform exposes one and the
    /// process currently exists.
    fn start_fingerprint(&self, pid: u32) -> Option<u64>;

    /// Best-effort existence check.
    fn is_alive(&self, pid: u32) -> bool;
}

/// Probe backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcessProbe;

impl SystemProcessProbe {
    pub fn new() -> Self {
        lazy_static::initialize(&FIRST_OBSERVED_AT);
        Self
    }
}

impl ProcessProbe for SystemProcessProbe {
    fn current_pid(&self) -> u32 {
        std::process::id()
    }

    fn process_started_at(&self) -> DateTime<Utc> {
        procfs::self_started_at().unwrap_or(*FIRST_OBSERVED_AT)
    }

    fn start_fingerprint(&self, pid: u32) -> Option<u64> {
        procfs::start_ticks(pid)
    }

    #[cfg(unix)]
    fn is_alive(&self, pid: u32) -> bool {
        // pid 0 and values that wrap negative would address process groups
        let Ok(raw) = libc::pid_t::try_from(pid) else {
            return false;
        };
        if raw <= 0 {
            return false;
        }

        // SAFETY: signal 0 performs the permission and existence checks only.
        let result = unsafe { libc::kill(raw, 0) };
        if result == 0 {
            return true;
        }
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    fn is_alive(&self, _pid: u32) -> bool {
        true
    }
}

#[cfg(target_os = "linux")]
mod procfs {
    use chrono::{DateTime, TimeZone, Utc};

    /// `starttime` (field 22 of `/proc/<pid>/stat`), in clock ticks since boot.
    pub(super) fn start_ticks(pid: u32) -> Option<u64> {
        let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
        parse_start_ticks(&stat)
    }

    pub(super) fn parse_start_ticks(stat: &str) -> Option<u64> {
        // comm may contain spaces and parentheses; fields resume after the last ')'
        let rest = &stat[stat.rfind(')')? + 1..];
        rest.split_whitespace().nth(19)?.parse().ok()
    }

    pub(super) fn self_started_at() -> Option<DateTime<Utc>> {
        let ticks = start_ticks(std::process::id())?;
        let boot = boot_time_secs()?;

        // SAFETY: sysconf has no preconditions.
        let ticks_per_sec = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if ticks_per_sec <= 0 {
            return None;
        }
        let ticks_per_sec = ticks_per_sec as u64;

        let millis = boot
            .checked_mul(1000)?
            .checked_add(ticks.checked_mul(1000)? / ticks_per_sec)?;
        Utc.timestamp_millis_opt(i64::try_from(millis).ok()?).single()
    }

    fn boot_time_secs() -> Option<u64> {
        let stat = std::fs::read_to_string("/proc/stat").ok()?;
        stat.lines()
            .find_map(|line| line.strip_prefix("btime "))
            .and_then(|value| value.trim().parse().ok())
    }

}

#[cfg(not(target_os = "linux"))]
mod procfs {
    use chrono::{DateTime, Utc};

    pub(super) fn start_ticks(_pid: u32) -> Option<u64> {
        None
    }

    pub(super) fn self_started_at() -> Option<DateTime<Utc>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        let probe = SystemProcessProbe::new();
        assert!(probe.is_alive(probe.current_pid()));
    }

    #[test]
    fn test_start_time_is_in_the_past() {
        let probe = SystemProcessProbe::new();
        assert!(probe.process_started_at() <= Utc::now());
    }

    #[cfg(unix)]
    #[test]
    fn test_out_of_range_pids_are_dead() {
        let probe = SystemProcessProbe::new();
        assert!(!probe.is_alive(0));
        assert!(!probe.is_alive(u32::MAX));
    }
}
