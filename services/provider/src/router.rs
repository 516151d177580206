//! Device event routing.
//!
//! Every event for a wanted device produces exactly one status report and at
//! most one supervisor effect. Unwanted devices produce neither.

use std::sync::Arc;

use tracing::{debug, info};

use crate::device::{DeviceEvent, DeviceFilter};
use crate::process::WorkerSpawner;
use crate::status::{StatusPublisher, StatusReport};
use crate::supervisor::Supervisor;

/// Supervisor effect requested by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAction {
    Connect,
    /// Connect, or disconnect if the connect is refused.
    ConnectOrDisconnect,
    Disconnect,
}

/// Status to report and the effect to apply for one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub status: String,
    pub action: RouteAction,
}

impl Route {
    /// Route an event for a wanted device.
    pub fn for_event(event: &DeviceEvent) -> Self {
        match event {
            DeviceEvent::Added(device) => Self {
                status: device.kind.to_string(),
                action: RouteAction::Connect,
            },
            DeviceEvent::Changed(device) => Self {
                status: device.kind.to_string(),
                action: RouteAction::ConnectOrDisconnect,
            },
            DeviceEvent::Removed(_) => Self {
                status: devfarm_events::ABSENT_STATUS.to_string(),
                action: RouteAction::Disconnect,
            },
        }
    }
}

/// What dispatching an event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Device is not managed by this provider.
    Ignored,
    /// A worker was spawned.
    Connected,
    /// A worker is being released.
    Disconnected,
    /// Status reported, supervisor unchanged.
    Reported,
}

/// Routes tracker events to the status publisher and the supervisor.
pub struct DeviceRouter {
    provider: String,
    filter: Arc<dyn DeviceFilter>,
    publisher: Arc<dyn StatusPublisher>,
}

impl DeviceRouter {
    pub fn new(
        provider: impl Into<String>,
        filter: Arc<dyn DeviceFilter>,
        publisher: Arc<dyn StatusPublisher>,
    ) -> Self {
        Self {
            provider: provider.into(),
            filter,
            publisher,
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Handle one tracker event.
    pub fn dispatch<S: WorkerSpawner>(
        &self,
        event: &DeviceEvent,
        supervisor: &mut Supervisor<S>,
    ) -> Dispatch {
        let device = event.device();

        if !self.filter.is_wanted(device) {
            match event {
                DeviceEvent::Added(_) => {
                    info!(serial = %device.serial, kind = %device.kind, "Ignoring device")
                }
                _ => {
                    debug!(
                        serial = %device.serial,
                        event = event.kind(),
                        "Ignoring event for unwanted device"
                    )
                }
            }
            return Dispatch::Ignored;
        }

        match event {
            DeviceEvent::Added(_) => {
                info!(serial = %device.serial, kind = %device.kind, "Found device")
            }
            DeviceEvent::Changed(_) => {
                info!(serial = %device.serial, kind = %device.kind, "Device state changed")
            }
            DeviceEvent::Removed(_) => {
                info!(serial = %device.serial, kind = %device.kind, "Lost device")
            }
        }

        let route = Route::for_event(event);
        self.publisher.publish(StatusReport::new(
            device.serial.as_str(),
            route.status,
            self.provider.as_str(),
        ));

        match route.action {
            RouteAction::Connect => {
                if supervisor.attempt_connect(device) {
                    Dispatch::Connected
                } else {
                    Dispatch::Reported
                }
            }
            RouteAction::ConnectOrDisconnect => {
                if supervisor.attempt_connect(device) {
                    Dispatch::Connected
                } else if supervisor.attempt_disconnect(device) {
                    Dispatch::Disconnected
                } else {
                    Dispatch::Reported
                }
            }
            RouteAction::Disconnect => {
                if supervisor.attempt_disconnect(device) {
                    Dispatch::Disconnected
                } else {
                    Dispatch::Reported
                }
            }
        }
    }
}
