//! Device event sources.
//!
//! A tracker yields add/change/remove events in per-device causal order.
//! `Ok(None)` means the source is exhausted and will never yield again.

mod adb;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::device::DeviceEvent;

pub use adb::{diff_snapshot, parse_snapshot, AdbTracker, DEFAULT_ADB_HOST, DEFAULT_ADB_PORT};

/// Errors reading device events.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("failed to connect to adb server at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("adb server refused request: {0}")]
    Rejected(String),

    #[error("malformed adb response: {0}")]
    Protocol(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Source of device events.
#[async_trait]
pub trait DeviceTracker: Send {
    /// Next event, or `None` once the source has ended.
    async fn next_event(&mut self) -> Result<Option<DeviceEvent>, TrackerError>;
}

/// Tracker fed through a channel.
#[derive(Debug)]
pub struct ChannelTracker {
    rx: mpsc::UnboundedReceiver<DeviceEvent>,
}

impl ChannelTracker {
    /// Create a tracker and the sender that feeds it.
    ///
    /// The tracker ends once every sender is dropped.
    pub fn new() -> (mpsc::UnboundedSender<DeviceEvent>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }
}

#[async_trait]
impl DeviceTracker for ChannelTracker {
    async fn next_event(&mut self) -> Result<Option<DeviceEvent>, TrackerError> {
        Ok(self.rx.recv().await)
    }
}
