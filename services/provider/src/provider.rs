//! The supervision loop.
//!
//! One task owns the router, the supervisor and the tracker. Device events,
//! worker notifications and the shutdown signal are multiplexed here, so each
//! one is handled to completion before the next is looked at.

use std::future::Future;

use tracing::{error, info, warn};

use crate::process::WorkerSpawner;
use crate::router::DeviceRouter;
use crate::shutdown::DrainReport;
use crate::supervisor::Supervisor;
use crate::tracker::DeviceTracker;

/// A running provider.
pub struct Provider<S: WorkerSpawner, T: DeviceTracker> {
    router: DeviceRouter,
    supervisor: Supervisor<S>,
    tracker: T,
}

impl<S: WorkerSpawner, T: DeviceTracker> Provider<S, T> {
    pub fn new(router: DeviceRouter, supervisor: Supervisor<S>, tracker: T) -> Self {
        Self {
            router,
            supervisor,
            tracker,
        }
    }

    pub fn supervisor(&self) -> &Supervisor<S> {
        &self.supervisor
    }

    /// Supervise until `shutdown` resolves, then drain every worker.
    ///
    /// Tracker errors are logged and tracking continues; a tracker that has
    /// ended is no longer polled but workers stay supervised.
    pub async fn run<F>(&mut self, shutdown: F) -> DrainReport
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut tracker_open = true;

        info!(provider = %self.router.provider(), "Provider started");

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => break,

                Some(notification) = self.supervisor.next_notification() => {
                    self.supervisor.handle_notification(notification);
                }

                event = self.tracker.next_event(), if tracker_open => match event {
                    Ok(Some(event)) => {
                        self.router.dispatch(&event, &mut self.supervisor);
                    }
                    Ok(None) => {
                        warn!("Device tracker ended, no new devices will be seen");
                        tracker_open = false;
                    }
                    Err(e) => {
                        error!(error = %e, "Device tracker failed");
                    }
                },
            }
        }

        self.supervisor.drain().await
    }
}
