//! In-memory spawner for testing and development.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use super::{channel, KillSignal, ProcessHandle, ProcessNotifier, SpawnError, WorkerExit, WorkerSpawner};
use crate::device::Device;

/// How mock workers react to kill signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MockBehavior {
    /// Exit as soon as any signal arrives.
    #[default]
    ExitOnGraceful,
    /// Ignore SIGTERM, exit on SIGKILL.
    ExitOnForce,
    /// Never exit on a signal.
    Hang,
}

/// Spawner whose workers are tasks driven by the test.
#[derive(Clone, Default)]
pub struct MockSpawner {
    state: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    behavior: MockBehavior,
    overrides: HashMap<String, MockBehavior>,
    failing: HashSet<String>,
    spawns: Vec<String>,
    signals: Vec<(String, KillSignal)>,
    live: HashMap<String, MockWorker>,
    pid_counter: u32,
}

struct MockWorker {
    exit: oneshot::Sender<WorkerExit>,
    errors: mpsc::UnboundedSender<String>,
}

impl MockSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mock spawner whose workers react to signals with `behavior`.
    pub fn with_behavior(behavior: MockBehavior) -> Self {
        let spawner = Self::default();
        spawner.lock().behavior = behavior;
        spawner
    }

    /// Override the behavior for one serial.
    pub fn set_behavior(&self, serial: &str, behavior: MockBehavior) {
        self.lock().overrides.insert(serial.to_string(), behavior);
    }

    /// Make every spawn for `serial` fail.
    pub fn fail_serial(&self, serial: &str) {
        self.lock().failing.insert(serial.to_string());
    }

    /// Number of successful spawns for `serial`.
    pub fn spawn_count(&self, serial: &str) -> usize {
        self.lock().spawns.iter().filter(|s| *s == serial).count()
    }

    /// Number of successful spawns across all devices.
    pub fn total_spawns(&self) -> usize {
        self.lock().spawns.len()
    }

    /// Signals delivered to workers of `serial`, oldest first.
    pub fn signals_for(&self, serial: &str) -> Vec<KillSignal> {
        self.lock()
            .signals
            .iter()
            .filter(|(s, _)| s == serial)
            .map(|(_, sig)| *sig)
            .collect()
    }

    /// Make the latest worker of `serial` exit. Returns false if none is live.
    pub fn exit(&self, serial: &str, exit: WorkerExit) -> bool {
        match self.lock().live.remove(serial) {
            Some(worker) => worker.exit.send(exit).is_ok(),
            None => false,
        }
    }

    /// Make the latest worker of `serial` report an error.
    pub fn error(&self, serial: &str, message: &str) -> bool {
        match self.lock().live.get(serial) {
            Some(worker) => worker.errors.send(message.to_string()).is_ok(),
            None => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl WorkerSpawner for MockSpawner {
    fn spawn(&self, device: &Device) -> Result<ProcessHandle, SpawnError> {
        let mut state = self.lock();

        if state.failing.contains(&device.serial) {
            return Err(SpawnError::Rejected {
                serial: device.serial.clone(),
                reason: "mock spawner configured to fail".to_string(),
            });
        }

        state.pid_counter += 1;
        let pid = 10_000 + state.pid_counter;
        let behavior = state
            .overrides
            .get(&device.serial)
            .copied()
            .unwrap_or(state.behavior);

        let (handle, notifier) = channel(Some(pid));
        let (exit_tx, exit_rx) = oneshot::channel();
        let (error_tx, error_rx) = mpsc::unbounded_channel();

        state.spawns.push(device.serial.clone());
        state.live.insert(
            device.serial.clone(),
            MockWorker {
                exit: exit_tx,
                errors: error_tx,
            },
        );
        drop(state);

        info!(serial = %device.serial, pid, "[MOCK] Spawning worker");

        tokio::spawn(run_mock_worker(
            device.serial.clone(),
            behavior,
            Arc::clone(&self.state),
            notifier,
            exit_rx,
            error_rx,
        ));

        Ok(handle)
    }
}

async fn run_mock_worker(
    serial: String,
    behavior: MockBehavior,
    state: Arc<Mutex<MockState>>,
    mut notifier: ProcessNotifier,
    mut exit: oneshot::Receiver<WorkerExit>,
    mut errors: mpsc::UnboundedReceiver<String>,
) {
    // The exit sender goes away when the test forgets the worker; it then
    // only reacts to signals.
    let mut exit_open = true;

    loop {
        tokio::select! {
            result = &mut exit, if exit_open => {
                match result {
                    Ok(status) => {
                        debug!(serial = %serial, %status, "[MOCK] Worker exited");
                        notifier.exited(status);
                        return;
                    }
                    Err(_) => exit_open = false,
                }
            }
            Some(message) = errors.recv() => notifier.error(message),
            signal = notifier.next_signal() => {
                let Some(signal) = signal else {
                    // Handle dropped: nothing can reach this worker any more.
                    return;
                };
                state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .signals
                    .push((serial.clone(), signal));

                let exits = match behavior {
                    MockBehavior::ExitOnGraceful => true,
                    MockBehavior::ExitOnForce => signal == KillSignal::Force,
                    MockBehavior::Hang => false,
                };
                if exits {
                    debug!(serial = %serial, %signal, "[MOCK] Worker killed");
                    notifier.exited(WorkerExit::signaled(signal.as_raw()));
                    return;
                }
            }
        }
    }
}
