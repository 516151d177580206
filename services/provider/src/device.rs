//! Device model shared by the tracker, router and supervisor.

use std::collections::HashSet;
use std::fmt;

use devfarm_events::ABSENT_STATUS;

/// State of a device as reported by the adb server.
///
/// The serial of a device is stable for its physical session while the kind
/// changes as it boots, asks for authorization or drops off the bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    /// A physical device ready for use.
    Device,
    /// An emulator ready for use.
    Emulator,
    /// Present but not responding.
    Offline,
    /// Waiting for the user to accept the host key.
    Unauthorized,
    Bootloader,
    Recovery,
    /// Synthetic kind for a device that has been removed.
    Absent,
    /// Any other state string.
    Other(String),
}

impl DeviceKind {
    /// Parse an adb state string.
    pub fn parse(s: &str) -> Self {
        match s {
            "device" => Self::Device,
            "emulator" => Self::Emulator,
            "offline" => Self::Offline,
            "unauthorized" => Self::Unauthorized,
            "bootloader" => Self::Bootloader,
            "recovery" => Self::Recovery,
            ABSENT_STATUS => Self::Absent,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Device => "device",
            Self::Emulator => "emulator",
            Self::Offline => "offline",
            Self::Unauthorized => "unauthorized",
            Self::Bootloader => "bootloader",
            Self::Recovery => "recovery",
            Self::Absent => ABSENT_STATUS,
            Self::Other(s) => s,
        }
    }

    /// Only ready devices and emulators ever get a worker.
    pub fn is_connectable(&self) -> bool {
        matches!(self, Self::Device | Self::Emulator)
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A device attached to this host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Device {
    /// Device serial.
    pub serial: String,
    /// Current state.
    pub kind: DeviceKind,
}

impl Device {
    pub fn new(serial: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            serial: serial.into(),
            kind,
        }
    }

    pub fn is_connectable(&self) -> bool {
        self.kind.is_connectable()
    }
}

/// A change observed by a device tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Added(Device),
    Changed(Device),
    Removed(Device),
}

impl DeviceEvent {
    pub fn device(&self) -> &Device {
        match self {
            Self::Added(d) | Self::Changed(d) | Self::Removed(d) => d,
        }
    }

    /// Event name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Added(_) => "add",
            Self::Changed(_) => "change",
            Self::Removed(_) => "remove",
        }
    }
}

// =============================================================================
// Filters
// =============================================================================

/// Decides whether this provider manages a device at all.
pub trait DeviceFilter: Send + Sync {
    fn is_wanted(&self, device: &Device) -> bool;
}

impl<F> DeviceFilter for F
where
    F: Fn(&Device) -> bool + Send + Sync,
{
    fn is_wanted(&self, device: &Device) -> bool {
        self(device)
    }
}

/// Filter that accepts every device.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl DeviceFilter for AcceptAll {
    fn is_wanted(&self, _device: &Device) -> bool {
        true
    }
}

/// Allow/deny lists of serials.
///
/// An empty allow list accepts every serial not on the deny list.
#[derive(Debug, Clone, Default)]
pub struct SerialFilter {
    allow: HashSet<String>,
    deny: HashSet<String>,
}

impl SerialFilter {
    pub fn new(
        allow: impl IntoIterator<Item = String>,
        deny: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            allow: allow.into_iter().collect(),
            deny: deny.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }
}

impl DeviceFilter for SerialFilter {
    fn is_wanted(&self, device: &Device) -> bool {
        if self.deny.contains(&device.serial) {
            return false;
        }
        self.allow.is_empty() || self.allow.contains(&device.serial)
    }
}
