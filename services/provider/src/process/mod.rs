//! Worker process handles and spawners.
//!
//! A worker is an opaque subprocess. The supervisor only sees it through a
//! [`ProcessHandle`]:
//! - `terminate()` asks the process to stop with a [`KillSignal`]
//! - an exit watch that resolves exactly once with a [`WorkerExit`]
//! - an error stream for process-level failures (signal delivery, wait errors)
//!
//! Spawners create the handle together with a [`ProcessNotifier`] and keep
//! the notifier on the process side to report what happens to it.

mod command;
mod mock;

use std::fmt;

use nix::sys::signal::Signal;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

pub use command::{CommandSpawner, WorkerCommand};
pub use mock::{MockBehavior, MockSpawner};

// =============================================================================
// Signals and Exit Status
// =============================================================================

/// Signal used to stop a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KillSignal {
    /// Cooperative stop (SIGTERM).
    Graceful,
    /// Unconditional stop (SIGKILL).
    Force,
}

impl KillSignal {
    pub fn signal(self) -> Signal {
        match self {
            Self::Graceful => Signal::SIGTERM,
            Self::Force => Signal::SIGKILL,
        }
    }

    /// Raw signal number.
    pub fn as_raw(self) -> i32 {
        self.signal() as i32
    }
}

impl fmt::Display for KillSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Graceful => f.write_str("SIGTERM"),
            Self::Force => f.write_str("SIGKILL"),
        }
    }
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal, if the process was killed.
    pub signal: Option<i32>,
}

impl WorkerExit {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signaled(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    /// Exit of a process whose status could not be collected.
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.code == Some(0)
    }

    /// True when the process died from the graceful-kill signal, either
    /// directly or by exiting with the shell convention `128 + SIGTERM`.
    pub fn is_graceful_kill(&self) -> bool {
        let sigterm = Signal::SIGTERM as i32;
        self.signal == Some(sigterm) || self.code == Some(128 + sigterm)
    }
}

impl From<std::process::ExitStatus> for WorkerExit {
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => f.write_str("unknown status"),
        }
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Supervisor side of a worker process.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    control: ProcessControl,
    errors: Option<mpsc::UnboundedReceiver<String>>,
}

/// Clonable part of a handle used to signal a process and await its exit.
#[derive(Debug, Clone)]
pub struct ProcessControl {
    signals: mpsc::UnboundedSender<KillSignal>,
    exit: watch::Receiver<Option<WorkerExit>>,
}

/// Process side of a worker: receives signals, reports errors and the exit.
#[derive(Debug)]
pub struct ProcessNotifier {
    signals: mpsc::UnboundedReceiver<KillSignal>,
    errors: mpsc::UnboundedSender<String>,
    exit: watch::Sender<Option<WorkerExit>>,
}

/// Create a connected handle/notifier pair.
pub fn channel(pid: Option<u32>) -> (ProcessHandle, ProcessNotifier) {
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let (error_tx, error_rx) = mpsc::unbounded_channel();
    let (exit_tx, exit_rx) = watch::channel(None);

    let handle = ProcessHandle {
        pid,
        control: ProcessControl {
            signals: signal_tx,
            exit: exit_rx,
        },
        errors: Some(error_rx),
    };
    let notifier = ProcessNotifier {
        signals: signal_rx,
        errors: error_tx,
        exit: exit_tx,
    };

    (handle, notifier)
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the process to stop. Returns false if it is already gone.
    pub fn terminate(&self, signal: KillSignal) -> bool {
        self.control.terminate(signal)
    }

    pub fn control(&self) -> ProcessControl {
        self.control.clone()
    }

    /// Take the error stream. Only the first caller gets it.
    pub fn take_errors(&mut self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.errors.take()
    }
}

impl ProcessControl {
    /// Ask the process to stop. Returns false if it is already gone.
    pub fn terminate(&self, signal: KillSignal) -> bool {
        self.signals.send(signal).is_ok()
    }

    /// Exit status, if the process has already exited.
    pub fn exit_status(&self) -> Option<WorkerExit> {
        *self.exit.borrow()
    }

    /// Wait until the process exits.
    ///
    /// A notifier dropped without reporting an exit means the process side is
    /// gone, which is reported as [`WorkerExit::unknown`].
    pub async fn exited(&mut self) -> WorkerExit {
        match self.exit.wait_for(Option::is_some).await {
            Ok(exit) => (*exit).unwrap_or_else(WorkerExit::unknown),
            Err(_) => WorkerExit::unknown(),
        }
    }
}

impl ProcessNotifier {
    /// Next signal requested by the supervisor.
    ///
    /// Returns `None` once every handle has been dropped.
    pub async fn next_signal(&mut self) -> Option<KillSignal> {
        self.signals.recv().await
    }

    /// Signal requested by the supervisor, without waiting.
    pub fn try_next_signal(&mut self) -> Option<KillSignal> {
        self.signals.try_recv().ok()
    }

    /// Report a process-level error.
    pub fn error(&self, message: impl Into<String>) {
        let _ = self.errors.send(message.into());
    }

    /// Report the exit. Consumes the notifier so it can fire only once.
    pub fn exited(self, exit: WorkerExit) {
        self.exit.send_replace(Some(exit));
    }
}

// =============================================================================
// Spawner
// =============================================================================

/// Errors creating a worker process.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The worker executable could not be started.
    #[error("failed to start {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The spawner refused the device.
    #[error("spawner rejected device {serial}: {reason}")]
    Rejected { serial: String, reason: String },
}

/// Creates worker processes.
pub trait WorkerSpawner: Send + Sync + 'static {
    /// Start a worker for the device.
    ///
    /// Called from within the tokio runtime; implementations may spawn tasks.
    fn spawn(&self, device: &crate::device::Device) -> Result<ProcessHandle, SpawnError>;
}
