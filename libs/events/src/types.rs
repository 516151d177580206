//! Message type definitions.
//!
//! Each event type has a payload struct carrying the event-specific data.

use serde::{Deserialize, Serialize};

// =============================================================================
// Topics and Event Type Constants
// =============================================================================

/// Bus topics.
pub mod topics {
    /// Broadcast topic every control plane component listens on.
    pub const GLOBAL: &str = "global";
}

/// All event type names as constants.
pub mod event_types {
    pub const DEVICE_STATUS: &str = "device.status";
}

/// Status kind published when a device disappears from the host.
pub const ABSENT_STATUS: &str = "absent";

// =============================================================================
// Device Events
// =============================================================================

/// Payload for `device.status`.
///
/// `status` is the adb state string of the device (`device`, `offline`,
/// `unauthorized`, ...) or [`ABSENT_STATUS`] once it has been removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatusPayload {
    /// Device serial.
    pub serial: String,
    /// Status kind.
    pub status: String,
    /// Name of the provider that observed the device.
    pub provider: String,
}

impl DeviceStatusPayload {
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

    /// Returns true if this reports the device as gone.
    pub fn is_absent(&self) -> bool {
        self.status == ABSENT_STATUS
    }
}
