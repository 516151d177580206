//! Worker termination and the all-workers drain.
//!
//! Termination is two-phase. The worker first gets SIGTERM and the graceful
//! budget to exit; if it does not, it gets SIGKILL and the force budget. Each
//! phase is its own wait on the exit watch, so a late exit from the first
//! phase can never complete the second one by accident.
//!
//! ```text
//! Running ──Begin──▶ GracefulKillSent ──Exited──▶ Exited
//!                          │
//!                       TimedOut (send SIGKILL)
//!                          ▼
//!                    ForceKillSent ──Exited──▶ Exited
//!                          │
//!                       TimedOut
//!                          ▼
//!                    TimeoutFailed
//! ```

use std::time::Duration;

use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::process::{KillSignal, ProcessControl, WorkerExit};

/// Default time a worker gets to exit after SIGTERM.
pub const DEFAULT_GRACEFUL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time a worker gets to exit after SIGKILL.
pub const DEFAULT_FORCE_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout budgets for the two termination phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationPolicy {
    pub graceful_timeout: Duration,
    pub force_timeout: Duration,
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self {
            graceful_timeout: DEFAULT_GRACEFUL_TIMEOUT,
            force_timeout: DEFAULT_FORCE_TIMEOUT,
        }
    }
}

/// Termination failures. Both are logged, neither is propagated.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TerminationError {
    /// Worker ignored SIGTERM; escalates to SIGKILL.
    #[error("worker {serial} did not exit within {after:?} of SIGTERM")]
    GracefulTimeout { serial: String, after: Duration },

    /// Worker survived SIGKILL; termination is abandoned.
    #[error("worker {serial} did not exit within {after:?} of SIGKILL")]
    ForceTimeout { serial: String, after: Duration },
}

// =============================================================================
// State Machine
// =============================================================================

/// Progress of a single worker termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationState {
    Running,
    GracefulKillSent,
    ForceKillSent,
    Exited,
    TimeoutFailed,
}

/// Inputs to the termination state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationEvent {
    Begin,
    Exited,
    TimedOut,
}

impl TerminationState {
    /// Transition table: next state and the signal to send on entering it.
    pub fn on(self, event: TerminationEvent) -> (Self, Option<KillSignal>) {
        use TerminationEvent as E;
        use TerminationState as S;

        match (self, event) {
            (S::Running, E::Begin) => (S::GracefulKillSent, Some(KillSignal::Graceful)),
            (S::Running, E::Exited) => (S::Exited, None),
            (S::GracefulKillSent, E::Exited) => (S::Exited, None),
            (S::GracefulKillSent, E::TimedOut) => (S::ForceKillSent, Some(KillSignal::Force)),
            (S::ForceKillSent, E::Exited) => (S::Exited, None),
            (S::ForceKillSent, E::TimedOut) => (S::TimeoutFailed, None),
            (state, _) => (state, None),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Exited | Self::TimeoutFailed)
    }

    /// Budget for the wait that follows entering this state.
    fn budget(self, policy: &TerminationPolicy) -> Option<Duration> {
        match self {
            Self::GracefulKillSent => Some(policy.graceful_timeout),
            Self::ForceKillSent => Some(policy.force_timeout),
            _ => None,
        }
    }
}

/// Terminal result of a termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// Exited after SIGTERM (or had already exited).
    Graceful(WorkerExit),
    /// Exited after SIGKILL.
    Forced(WorkerExit),
    /// Still running after SIGKILL and the force budget.
    Failed,
}

impl TerminationOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed)
    }
}

// =============================================================================
// Termination
// =============================================================================

/// Run the two-phase termination protocol against one worker.
pub async fn terminate_worker(
    serial: &str,
    mut control: ProcessControl,
    policy: TerminationPolicy,
) -> TerminationOutcome {
    let mut state = TerminationState::Running;
    let mut event = TerminationEvent::Begin;
    let mut last_exit = None;
    let mut forced = false;

    loop {
        let (next, signal) = state.on(event);
        state = next;

        if let Some(signal) = signal {
            if signal == KillSignal::Force {
                warn!(serial = %serial, "Force killing worker");
                forced = true;
            }
            if !control.terminate(signal) {
                info!(serial = %serial, %signal, "Worker already gone before signal");
            }
        }

        let Some(budget) = state.budget(&policy) else {
            break;
        };

        event = match tokio::time::timeout(budget, control.exited()).await {
            Ok(exit) => {
                last_exit = Some(exit);
                TerminationEvent::Exited
            }
            Err(_) => {
                let err = match state {
                    TerminationState::GracefulKillSent => TerminationError::GracefulTimeout {
                        serial: serial.to_string(),
                        after: budget,
                    },
                    _ => TerminationError::ForceTimeout {
                        serial: serial.to_string(),
                        after: budget,
                    },
                };
                error!(serial = %serial, error = %err, "Device worker did not stop in time");
                TerminationEvent::TimedOut
            }
        };
    }

    match state {
        TerminationState::Exited => {
            let exit = last_exit
                .or_else(|| control.exit_status())
                .unwrap_or_else(WorkerExit::unknown);
            if forced {
                TerminationOutcome::Forced(exit)
            } else {
                TerminationOutcome::Graceful(exit)
            }
        }
        _ => TerminationOutcome::Failed,
    }
}

/// Observer of a termination running in its own task.
#[derive(Debug, Clone)]
pub struct TerminationWatch {
    rx: watch::Receiver<Option<TerminationOutcome>>,
}

impl TerminationWatch {
    /// Wait for the terminal outcome.
    pub async fn outcome(mut self) -> TerminationOutcome {
        match self.rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).unwrap_or(TerminationOutcome::Failed),
            // The termination task died without reporting.
            Err(_) => TerminationOutcome::Failed,
        }
    }

    /// Outcome if the termination already finished.
    pub fn current(&self) -> Option<TerminationOutcome> {
        *self.rx.borrow()
    }
}

/// Start terminating a worker in the background.
pub fn spawn_termination(
    serial: String,
    control: ProcessControl,
    policy: TerminationPolicy,
) -> TerminationWatch {
    let (tx, rx) = watch::channel(None);

    tokio::spawn(async move {
        let outcome = terminate_worker(&serial, control, policy).await;
        match outcome {
            TerminationOutcome::Graceful(exit) => {
                info!(serial = %serial, %exit, "Worker stopped")
            }
            TerminationOutcome::Forced(exit) => {
                warn!(serial = %serial, %exit, "Worker stopped after force kill")
            }
            TerminationOutcome::Failed => {
                error!(serial = %serial, "Giving up on worker termination")
            }
        }
        tx.send_replace(Some(outcome));
    });

    TerminationWatch { rx }
}

// =============================================================================
// Drain
// =============================================================================

/// Summary of an all-workers drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub graceful: usize,
    pub forced: usize,
    pub failed: usize,
}

impl DrainReport {
    pub fn record(&mut self, outcome: TerminationOutcome) {
        match outcome {
            TerminationOutcome::Graceful(_) => self.graceful += 1,
            TerminationOutcome::Forced(_) => self.forced += 1,
            TerminationOutcome::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.graceful + self.forced + self.failed
    }
}

/// Wait for every termination to reach a terminal state.
///
/// Failures are counted, never short-circuit the wait.
pub async fn await_all(watches: Vec<TerminationWatch>) -> DrainReport {
    let outcomes = join_all(watches.into_iter().map(TerminationWatch::outcome)).await;

    let mut report = DrainReport::default();
    for outcome in outcomes {
        report.record(outcome);
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{channel, ProcessNotifier};
    use nix::sys::signal::Signal;
    use rstest::rstest;

    #[rstest]
    #[case(TerminationState::Running, TerminationEvent::Begin, TerminationState::GracefulKillSent, Some(KillSignal::Graceful))]
    #[case(TerminationState::GracefulKillSent, TerminationEvent::Exited, TerminationState::Exited, None)]
    #[case(TerminationState::GracefulKillSent, TerminationEvent::TimedOut, TerminationState::ForceKillSent, Some(KillSignal::Force))]
    #[case(TerminationState::ForceKillSent, TerminationEvent::Exited, TerminationState::Exited, None)]
    #[case(TerminationState::ForceKillSent, TerminationEvent::TimedOut, TerminationState::TimeoutFailed, None)]
    #[case(TerminationState::Exited, TerminationEvent::TimedOut, TerminationState::Exited, None)]
    #[case(TerminationState::TimeoutFailed, TerminationEvent::Exited, TerminationState::TimeoutFailed, None)]
    fn test_transition_table(
        #[case] from: TerminationState,
        #[case] event: TerminationEvent,
        #[case] to: TerminationState,
        #[case] signal: Option<KillSignal>,
    ) {
        assert_eq!(from.on(event), (to, signal));
    }

    /// Worker that records signals and exits on the given one.
    fn worker_exiting_on(
        mut notifier: ProcessNotifier,
        exit_on: Option<KillSignal>,
    ) -> tokio::task::JoinHandle<Vec<KillSignal>> {
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(signal) = notifier.next_signal().await {
                seen.push(signal);
                if Some(signal) == exit_on {
                    notifier.exited(WorkerExit::signaled(signal.as_raw()));
                    return seen;
                }
            }
            seen
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_exit() {
        let (handle, notifier) = channel(Some(1));
        let worker = worker_exiting_on(notifier, Some(KillSignal::Graceful));

        let outcome = terminate_worker("D1", handle.control(), TerminationPolicy::default()).await;

        assert_eq!(
            outcome,
            TerminationOutcome::Graceful(WorkerExit::signaled(Signal::SIGTERM as i32))
        );
        assert_eq!(worker.await.unwrap(), vec![KillSignal::Graceful]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_escalates_to_exactly_one_force_kill() {
        let (handle, notifier) = channel(Some(1));
        let worker = worker_exiting_on(notifier, Some(KillSignal::Force));

        let start = tokio::time::Instant::now();
        let outcome = terminate_worker("D1", handle.control(), TerminationPolicy::default()).await;

        assert_eq!(
            outcome,
            TerminationOutcome::Forced(WorkerExit::signaled(Signal::SIGKILL as i32))
        );
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert_eq!(
            worker.await.unwrap(),
            vec![KillSignal::Graceful, KillSignal::Force]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_after_both_budgets() {
        let (handle, notifier) = channel(Some(1));
        let worker = worker_exiting_on(notifier, None);

        let start = tokio::time::Instant::now();
        let outcome = terminate_worker("D1", handle.control(), TerminationPolicy::default()).await;

        assert_eq!(outcome, TerminationOutcome::Failed);
        assert!(start.elapsed() >= Duration::from_secs(20));

        drop(handle);
        assert_eq!(
            worker.await.unwrap(),
            vec![KillSignal::Graceful, KillSignal::Force]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_exited_worker() {
        let (handle, notifier) = channel(Some(1));
        notifier.exited(WorkerExit::code(0));

        let outcome = terminate_worker("D1", handle.control(), TerminationPolicy::default()).await;
        assert_eq!(outcome, TerminationOutcome::Graceful(WorkerExit::code(0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_for_every_worker() {
        let (ok_handle, ok_notifier) = channel(Some(1));
        let (stuck_handle, stuck_notifier) = channel(Some(2));
        let _ok = worker_exiting_on(ok_notifier, Some(KillSignal::Graceful));
        let _stuck = worker_exiting_on(stuck_notifier, None);

        let watches = vec![
            spawn_termination("ok".to_string(), ok_handle.control(), TerminationPolicy::default()),
            spawn_termination("stuck".to_string(), stuck_handle.control(), TerminationPolicy::default()),
        ];

        let report = await_all(watches).await;
        assert_eq!(
            report,
            DrainReport {
                graceful: 1,
                forced: 0,
                failed: 1
            }
        );
        assert_eq!(report.total(), 2);
    }
}
