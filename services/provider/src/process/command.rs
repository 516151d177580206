//! Spawner that runs the worker as an OS process.

use std::path::PathBuf;
use std::process::Stdio;

use nix::sys::signal::kill;
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::{channel, KillSignal, ProcessHandle, ProcessNotifier, SpawnError, WorkerExit, WorkerSpawner};
use crate::device::Device;

/// Placeholder replaced by the device serial in worker arguments.
const SERIAL_PLACEHOLDER: &str = "{serial}";

/// Placeholder replaced by the provider name in worker arguments.
const PROVIDER_PLACEHOLDER: &str = "{provider}";

/// Environment variable carrying the device serial to the worker.
pub const SERIAL_ENV: &str = "DEVFARM_SERIAL";

/// Command line used to start a worker.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    /// Worker executable.
    pub program: PathBuf,
    /// Arguments; `{serial}` and `{provider}` are substituted.
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Arguments for a specific device.
    pub fn args_for(&self, serial: &str, provider: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|a| {
                a.replace(SERIAL_PLACEHOLDER, serial)
                    .replace(PROVIDER_PLACEHOLDER, provider)
            })
            .collect()
    }
}

/// Spawns one OS process per device from a [`WorkerCommand`].
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    command: WorkerCommand,
    provider: String,
}

impl CommandSpawner {
    pub fn new(command: WorkerCommand, provider: impl Into<String>) -> Self {
        Self {
            command,
            provider: provider.into(),
        }
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, device: &Device) -> Result<ProcessHandle, SpawnError> {
        let args = self.command.args_for(&device.serial, &self.provider);

        let child = Command::new(&self.command.program)
            .args(&args)
            .env(SERIAL_ENV, &device.serial)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SpawnError::Io {
                program: self.command.program.display().to_string(),
                source,
            })?;

        let pid = child.id();
        let (handle, notifier) = channel(pid);

        debug!(serial = %device.serial, pid = ?pid, "Worker process started");

        tokio::spawn(watch_child(device.serial.clone(), child, notifier));

        Ok(handle)
    }
}

/// Own the child until it exits, delivering requested signals.
async fn watch_child(serial: String, mut child: Child, mut notifier: ProcessNotifier) {
    let mut signals_open = true;

    loop {
        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) => notifier.exited(WorkerExit::from(status)),
                    Err(e) => {
                        warn!(serial = %serial, error = %e, "Failed to wait for worker process");
                        notifier.error(format!("wait failed: {}", e));
                        notifier.exited(WorkerExit::unknown());
                    }
                }
                return;
            }
            signal = notifier.next_signal(), if signals_open => {
                match signal {
                    Some(signal) => {
                        if let Err(e) = deliver(&mut child, signal) {
                            notifier.error(format!("failed to send {}: {}", signal, e));
                        }
                    }
                    None => signals_open = false,
                }
            }
        }
    }
}

fn deliver(child: &mut Child, signal: KillSignal) -> std::io::Result<()> {
    match signal {
        KillSignal::Force => child.start_kill(),
        KillSignal::Graceful => {
            let Some(pid) = child.id() else {
                // Already reaped; the wait branch reports the exit.
                return Ok(());
            };
            kill(Pid::from_raw(pid as i32), signal.signal()).map_err(std::io::Error::from)
        }
    }
}
