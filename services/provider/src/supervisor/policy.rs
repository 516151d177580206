//! Exit classification and the crash-loop guard.

use std::time::Duration;

use crate::process::WorkerExit;

/// Default minimum uptime before a dirty exit is considered transient.
pub const DEFAULT_MIN_UPTIME: Duration = Duration::from_secs(10);

/// What to do after a worker exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDisposition {
    /// Exit code 0.
    Clean,
    /// Exited while the supervisor was terminating it.
    Released,
    /// Died from SIGTERM before the supervisor asked it to stop.
    KilledDuringStartup,
    /// Dirty exit before reaching the minimum uptime; restart withheld.
    CrashLoop { uptime: Duration },
    /// Dirty exit after the minimum uptime; spawn a replacement.
    Restart { uptime: Duration },
}

impl ExitDisposition {
    pub fn restarts(&self) -> bool {
        matches!(self, Self::Restart { .. })
    }
}

/// Bounds restart frequency per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrashPolicy {
    /// A worker must stay up this long for a dirty exit to be restarted.
    pub min_uptime: Duration,
}

impl Default for CrashPolicy {
    fn default() -> Self {
        Self {
            min_uptime: DEFAULT_MIN_UPTIME,
        }
    }
}

impl CrashPolicy {
    /// Classify an exit. `releasing` is true when a termination was in flight.
    pub fn classify(&self, exit: WorkerExit, uptime: Duration, releasing: bool) -> ExitDisposition {
        if exit.is_clean() {
            ExitDisposition::Clean
        } else if releasing {
            ExitDisposition::Released
        } else if exit.is_graceful_kill() {
            ExitDisposition::KilledDuringStartup
        } else if uptime < self.min_uptime {
            ExitDisposition::CrashLoop { uptime }
        } else {
            ExitDisposition::Restart { uptime }
        }
    }
}
