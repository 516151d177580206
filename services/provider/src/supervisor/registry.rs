//! Registry of live workers, keyed by device serial.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::device::Device;
use crate::process::ProcessHandle;
use crate::shutdown::TerminationWatch;

/// A worker believed to be live.
#[derive(Debug)]
pub struct WorkerRecord {
    /// Device the worker serves, as it was when spawned.
    pub device: Device,
    /// Handle to the process.
    pub handle: ProcessHandle,
    /// When the worker was spawned.
    pub started: Instant,
    /// Unique per spawn; tells a stale exit from the current worker's.
    pub generation: u64,
    /// Termination in flight, if the worker is being released.
    pub termination: Option<TerminationWatch>,
}

impl WorkerRecord {
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_releasing(&self) -> bool {
        self.termination.is_some()
    }
}

/// At most one record per serial.
#[derive(Debug, Default)]
pub struct Registry {
    workers: HashMap<String, WorkerRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, serial: &str) -> bool {
        self.workers.contains_key(serial)
    }

    pub fn get(&self, serial: &str) -> Option<&WorkerRecord> {
        self.workers.get(serial)
    }

    pub fn get_mut(&mut self, serial: &str) -> Option<&mut WorkerRecord> {
        self.workers.get_mut(serial)
    }

    /// Insert a record. Hands the record back if the serial is taken.
    pub fn insert(&mut self, record: WorkerRecord) -> Result<(), WorkerRecord> {
        match self.workers.entry(record.device.serial.clone()) {
            Entry::Occupied(_) => Err(record),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    /// Remove the record for `serial` only if it belongs to `generation`.
    pub fn remove_generation(&mut self, serial: &str, generation: u64) -> Option<WorkerRecord> {
        match self.workers.entry(serial.to_string()) {
            Entry::Occupied(entry) if entry.get().generation == generation => {
                Some(entry.remove())
            }
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn records_mut(&mut self) -> impl Iterator<Item = &mut WorkerRecord> {
        self.workers.values_mut()
    }
}
