//! Device status reporting to the message bus.
//!
//! Reports are fire-and-forget: a report that cannot be encoded or sent is
//! logged and dropped. Publishing never blocks the supervision loop.

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use devfarm_events::{DeviceStatusPayload, Envelope, Frames, ABSENT_STATUS};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Time a pending report may wait in the socket when the provider exits.
const LINGER_MS: i32 = 1_000;

/// Time a send may block when no peer accepts the message.
const SEND_TIMEOUT_MS: i32 = 5_000;

/// A single status report for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub serial: String,
    /// Device state string, or `absent` once removed.
    pub status: String,
    /// Name of the reporting provider.
    pub provider: String,
}

impl StatusReport {
    pub fn new(
        serial: impl Into<String>,
        status: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            serial: serial.into(),
            status: status.into(),
            provider: provider.into(),
        }
    }

    /// Report for a device that has left the host.
    pub fn absent(serial: impl Into<String>, provider: impl Into<String>) -> Self {
        Self::new(serial, ABSENT_STATUS, provider)
    }

    /// Encode as a `[global, json]` message.
    pub fn to_frames(&self) -> Result<Frames, devfarm_events::EventError> {
        Envelope::device_status(DeviceStatusPayload::new(
            self.serial.as_str(),
            self.status.as_str(),
            self.provider.as_str(),
        ))
        .encode_global()
    }
}

/// Sink for status reports.
pub trait StatusPublisher: Send + Sync {
    /// Queue a report for transmission. Never fails; problems are logged.
    fn publish(&self, report: StatusReport);
}

/// Errors setting up the status socket.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("no push endpoints configured")]
    NoEndpoints,

    #[error("failed to create push socket: {0}")]
    Socket(#[from] zmq::Error),

    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: zmq::Error,
    },

    #[error("failed to start status sender thread: {0}")]
    Thread(#[source] std::io::Error),
}

// =============================================================================
// ZeroMQ
// =============================================================================

/// Publishes reports on a ZeroMQ PUSH socket connected to every endpoint.
///
/// The socket lives on its own thread; `publish` only hands frames over a
/// channel.
pub struct ZmqPublisher {
    tx: std_mpsc::Sender<Frames>,
}

impl ZmqPublisher {
    /// Create the socket, connect it and start the sender thread.
    pub fn connect(endpoints: &[String]) -> Result<Self, PublishError> {
        if endpoints.is_empty() {
            return Err(PublishError::NoEndpoints);
        }

        let context = zmq::Context::new();
        let socket = context.socket(zmq::PUSH)?;
        socket.set_linger(LINGER_MS)?;
        socket.set_sndtimeo(SEND_TIMEOUT_MS)?;

        for endpoint in endpoints {
            info!(endpoint = %endpoint, "Sending output to");
            socket
                .connect(endpoint)
                .map_err(|source| PublishError::Connect {
                    endpoint: endpoint.clone(),
                    source,
                })?;
        }

        let (tx, rx) = std_mpsc::channel();
        thread::Builder::new()
            .name("status-push".to_string())
            .spawn(move || push_thread(context, socket, rx))
            .map_err(PublishError::Thread)?;

        Ok(Self { tx })
    }
}

impl StatusPublisher for ZmqPublisher {
    fn publish(&self, report: StatusReport) {
        let frames = match report.to_frames() {
            Ok(frames) => frames,
            Err(e) => {
                warn!(serial = %report.serial, error = %e, "Failed to encode device status");
                return;
            }
        };

        if self.tx.send(frames).is_err() {
            warn!(serial = %report.serial, "Status sender is gone, dropping report");
        }
    }
}

/// Owns the socket until every publisher handle is dropped.
fn push_thread(_context: zmq::Context, socket: zmq::Socket, rx: std_mpsc::Receiver<Frames>) {
    while let Ok(frames) = rx.recv() {
        let topic = frames.topic.clone();
        match socket.send_multipart(frames.into_parts(), 0) {
            Ok(()) => debug!(topic = %topic, "Status sent"),
            Err(e) => warn!(topic = %topic, error = %e, "Failed to send status"),
        }
    }
    debug!("Status sender stopped");
}

// =============================================================================
// In-memory
// =============================================================================

/// Publisher that records reports, for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryPublisher {
    reports: Arc<Mutex<Vec<StatusReport>>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every report published so far, oldest first.
    pub fn reports(&self) -> Vec<StatusReport> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn reports_for(&self, serial: &str) -> Vec<StatusReport> {
        self.reports()
            .into_iter()
            .filter(|r| r.serial == serial)
            .collect()
    }
}

impl StatusPublisher for MemoryPublisher {
    fn publish(&self, report: StatusReport) {
        debug!(serial = %report.serial, status = %report.status, "[MEMORY] Status");
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(report);
    }
}
