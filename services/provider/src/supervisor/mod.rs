//! Worker supervisor - owns the registry of live workers.
//!
//! The supervisor is driven by a single task (see [`crate::provider`]), so
//! every registry check-and-mutate below is atomic with respect to other
//! device events and worker notifications. Nothing else touches the registry.
//!
//! ## Worker lifecycle
//!
//! ```text
//! attempt_connect ──spawn──▶ record(generation N)
//!        ▲                          │ exit(code, signal)
//!        │                          ▼
//!   respawn queue ◀── Restart ── remove record, classify
//! ```
//!
//! A record is removed before its exit is classified, so a restart always
//! creates a fresh record. Restarts are queued and processed after the
//! notification that caused them rather than called re-entrantly.

mod policy;
mod registry;

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::device::Device;
use crate::process::{KillSignal, ProcessHandle, WorkerExit, WorkerSpawner};
use crate::shutdown::{await_all, spawn_termination, DrainReport, TerminationPolicy};

pub use policy::{CrashPolicy, ExitDisposition, DEFAULT_MIN_UPTIME};
pub use registry::{Registry, WorkerRecord};

/// Notification forwarded from a worker's process handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerNotification {
    /// Process-level error. Logged only.
    Error {
        serial: String,
        generation: u64,
        message: String,
    },
    /// The process exited.
    Exited {
        serial: String,
        generation: u64,
        exit: WorkerExit,
    },
}

/// Supervises one worker process per connectable device.
pub struct Supervisor<S: WorkerSpawner> {
    spawner: Arc<S>,
    registry: Registry,
    crash_policy: CrashPolicy,
    termination: TerminationPolicy,
    notify_tx: mpsc::UnboundedSender<WorkerNotification>,
    notify_rx: mpsc::UnboundedReceiver<WorkerNotification>,
    respawns: VecDeque<Device>,
    next_generation: u64,
    draining: bool,
}

impl<S: WorkerSpawner> Supervisor<S> {
    /// Create a new supervisor.
    pub fn new(spawner: Arc<S>, crash_policy: CrashPolicy, termination: TerminationPolicy) -> Self {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();

        Self {
            spawner,
            registry: Registry::new(),
            crash_policy,
            termination,
            notify_tx,
            notify_rx,
            respawns: VecDeque::new(),
            next_generation: 0,
            draining: false,
        }
    }

    /// Spawn a worker if the device is connectable and has none.
    ///
    /// Returns true only if a worker was spawned.
    pub fn attempt_connect(&mut self, device: &Device) -> bool {
        if !device.is_connectable() || self.registry.contains(&device.serial) {
            return false;
        }
        if self.draining {
            debug!(serial = %device.serial, "Draining, not spawning worker");
            return false;
        }

        info!(serial = %device.serial, "Spawning worker for device");

        let mut handle = match self.spawner.spawn(device) {
            Ok(handle) => handle,
            Err(e) => {
                error!(serial = %device.serial, error = %e, "Failed to spawn device worker");
                return false;
            }
        };

        self.next_generation += 1;
        let generation = self.next_generation;
        self.observe(&device.serial, generation, &mut handle);

        debug!(
            serial = %device.serial,
            pid = ?handle.pid(),
            generation,
            "Worker registered"
        );

        let record = WorkerRecord {
            device: device.clone(),
            handle,
            started: Instant::now(),
            generation,
            termination: None,
        };

        if let Err(record) = self.registry.insert(record) {
            error!(serial = %device.serial, "Worker already registered, killing duplicate");
            record.handle.terminate(KillSignal::Force);
            return false;
        }

        true
    }

    /// Start releasing the device's worker, if it has one.
    ///
    /// Returns true if a worker exists, including one already being released.
    pub fn attempt_disconnect(&mut self, device: &Device) -> bool {
        let Some(record) = self.registry.get_mut(&device.serial) else {
            return false;
        };

        if record.is_releasing() {
            debug!(serial = %device.serial, "Worker already being released");
            return true;
        }

        info!(serial = %device.serial, "Releasing worker");
        record.termination = Some(spawn_termination(
            device.serial.clone(),
            record.handle.control(),
            self.termination,
        ));
        true
    }

    /// Wait for the next worker notification.
    pub async fn next_notification(&mut self) -> Option<WorkerNotification> {
        self.notify_rx.recv().await
    }

    /// Apply a worker notification, then any restarts it queued.
    pub fn handle_notification(&mut self, notification: WorkerNotification) {
        match notification {
            WorkerNotification::Error {
                serial,
                generation,
                message,
            } => {
                error!(
                    serial = %serial,
                    generation,
                    error = %message,
                    "Device worker had an error"
                );
            }
            WorkerNotification::Exited {
                serial,
                generation,
                exit,
            } => self.on_exit(&serial, generation, exit),
        }

        self.process_respawns();
    }

    fn on_exit(&mut self, serial: &str, generation: u64, exit: WorkerExit) {
        let Some(record) = self.registry.remove_generation(serial, generation) else {
            debug!(serial = %serial, generation, "Ignoring exit of stale worker");
            return;
        };

        let uptime = record.uptime();
        let uptime_ms = uptime.as_millis() as u64;

        match self.crash_policy.classify(exit, uptime, record.is_releasing()) {
            ExitDisposition::Clean => {
                info!(serial = %serial, uptime_ms, "Device worker stopped cleanly");
            }
            ExitDisposition::Released => {
                info!(serial = %serial, %exit, uptime_ms, "Device worker released");
            }
            ExitDisposition::KilledDuringStartup => {
                warn!(
                    serial = %serial,
                    %exit,
                    "Device worker was killed before becoming operational"
                );
            }
            ExitDisposition::CrashLoop { .. } => {
                error!(
                    serial = %serial,
                    %exit,
                    uptime_ms,
                    min_uptime_ms = self.crash_policy.min_uptime.as_millis() as u64,
                    "Device worker had a dirty exit soon after startup, will not attempt to restart"
                );
            }
            ExitDisposition::Restart { .. } => {
                error!(serial = %serial, %exit, uptime_ms, "Device worker had a dirty exit");
                info!(serial = %serial, "Restarting worker");
                self.respawns.push_back(record.device.clone());
            }
        }
    }

    fn process_respawns(&mut self) {
        while let Some(device) = self.respawns.pop_front() {
            self.attempt_connect(&device);
        }
    }

    /// Terminate every worker and wait until all are done.
    ///
    /// Workers already being released keep their termination; everyone else
    /// gets a fresh one. New spawns are refused from here on.
    pub async fn drain(&mut self) -> DrainReport {
        self.draining = true;
        self.respawns.clear();

        info!(workers = self.registry.len(), "Stopping all workers");

        let policy = self.termination;
        let mut watches = Vec::with_capacity(self.registry.len());
        for record in self.registry.records_mut() {
            if record.termination.is_none() {
                record.termination = Some(spawn_termination(
                    record.device.serial.clone(),
                    record.handle.control(),
                    policy,
                ));
            }
            if let Some(watch) = &record.termination {
                watches.push(watch.clone());
            }
        }

        let report = await_all(watches).await;

        info!(
            graceful = report.graceful,
            forced = report.forced,
            failed = report.failed,
            "All cleaned up"
        );
        report
    }

    /// Forward a handle's errors and exit to the notification channel.
    fn observe(&self, serial: &str, generation: u64, handle: &mut ProcessHandle) {
        let mut errors = handle.take_errors();
        let mut control = handle.control();
        let tx = self.notify_tx.clone();
        let serial = serial.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    Some(message) = next_error(&mut errors) => {
                        let _ = tx.send(WorkerNotification::Error {
                            serial: serial.clone(),
                            generation,
                            message,
                        });
                    }
                    exit = control.exited() => {
                        let _ = tx.send(WorkerNotification::Exited {
                            serial,
                            generation,
                            exit,
                        });
                        return;
                    }
                }
            }
        });
    }

    /// Number of live workers.
    pub fn worker_count(&self) -> usize {
        self.registry.len()
    }

    /// True if the device has a live worker.
    pub fn is_connected(&self, serial: &str) -> bool {
        self.registry.contains(serial)
    }

    /// True if the device's worker is being terminated.
    pub fn is_releasing(&self, serial: &str) -> bool {
        self.registry
            .get(serial)
            .is_some_and(WorkerRecord::is_releasing)
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }
}

async fn next_error(
    errors: &mut Option<mpsc::UnboundedReceiver<String>>,
) -> Option<String> {
    match errors {
        Some(rx) => rx.recv().await,
        None => None,
    }
}
