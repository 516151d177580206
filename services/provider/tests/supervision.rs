//! Integration tests: the provider loop end to end.
//!
//! Devices are fed through a channel tracker, workers are mock processes and
//! status reports are recorded in memory. Time is paused, so uptimes and
//! termination budgets are driven by `tokio::time::advance` and auto-advance.

use std::sync::Arc;
use std::time::Duration;

use devfarm_provider::device::{AcceptAll, Device, DeviceEvent, DeviceFilter, DeviceKind, SerialFilter};
use devfarm_provider::process::{KillSignal, MockBehavior, MockSpawner, WorkerExit};
use devfarm_provider::provider::Provider;
use devfarm_provider::router::DeviceRouter;
use devfarm_provider::shutdown::{DrainReport, TerminationPolicy};
use devfarm_provider::status::{MemoryPublisher, StatusReport};
use devfarm_provider::supervisor::{CrashPolicy, Supervisor, WorkerNotification};
use devfarm_provider::tracker::ChannelTracker;
use nix::sys::signal::Signal;
use proptest::prelude::*;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const PROVIDER: &str = "rack-1";

struct Harness {
    events: Option<mpsc::UnboundedSender<DeviceEvent>>,
    spawner: MockSpawner,
    publisher: MemoryPublisher,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<DrainReport>,
}

impl Harness {
    fn start(spawner: MockSpawner) -> Self {
        Self::start_with_filter(spawner, Arc::new(AcceptAll))
    }

    fn start_with_filter(spawner: MockSpawner, filter: Arc<dyn DeviceFilter>) -> Self {
        let publisher = MemoryPublisher::new();
        let (events, tracker) = ChannelTracker::new();
        let (stop, stopped) = oneshot::channel::<()>();

        let router = DeviceRouter::new(PROVIDER, filter, Arc::new(publisher.clone()));
        let supervisor = Supervisor::new(
            Arc::new(spawner.clone()),
            CrashPolicy::default(),
            TerminationPolicy::default(),
        );
        let mut provider = Provider::new(router, supervisor, tracker);

        let task = tokio::spawn(async move {
            provider
                .run(async {
                    let _ = stopped.await;
                })
                .await
        });

        Self {
            events: Some(events),
            spawner,
            publisher,
            stop: Some(stop),
            task,
        }
    }

    fn send(&self, event: DeviceEvent) {
        if let Some(events) = &self.events {
            events.send(event).unwrap();
        }
    }

    fn add(&self, serial: &str, kind: DeviceKind) {
        self.send(DeviceEvent::Added(Device::new(serial, kind)));
    }

    fn change(&self, serial: &str, kind: DeviceKind) {
        self.send(DeviceEvent::Changed(Device::new(serial, kind)));
    }

    fn remove(&self, serial: &str, kind: DeviceKind) {
        self.send(DeviceEvent::Removed(Device::new(serial, kind)));
    }

    async fn shutdown(mut self) -> DrainReport {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.task.await.unwrap()
    }
}

/// Let every task run until the runtime is idle.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

fn report(serial: &str, status: &str) -> StatusReport {
    StatusReport::new(serial, status, PROVIDER)
}

#[tokio::test(start_paused = true)]
async fn test_device_arrives_then_goes_offline() {
    let h = Harness::start(MockSpawner::new());

    h.add("D1", DeviceKind::Device);
    settle().await;

    assert_eq!(h.publisher.reports(), vec![report("D1", "device")]);
    assert_eq!(h.spawner.spawn_count("D1"), 1);

    h.change("D1", DeviceKind::Offline);
    settle().await;

    assert_eq!(
        h.publisher.reports(),
        vec![report("D1", "device"), report("D1", "offline")]
    );
    assert_eq!(h.spawner.signals_for("D1"), vec![KillSignal::Graceful]);
    // Released workers are never restarted.
    assert_eq!(h.spawner.spawn_count("D1"), 1);

    let drained = h.shutdown().await;
    assert_eq!(drained.total(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_event_sequence_never_doubles_a_worker() {
    let h = Harness::start(MockSpawner::new());

    h.add("D1", DeviceKind::Device);
    h.add("D1", DeviceKind::Device);
    settle().await;
    assert_eq!(h.spawner.spawn_count("D1"), 1);

    h.change("D1", DeviceKind::Unauthorized);
    settle().await;
    assert_eq!(h.spawner.signals_for("D1"), vec![KillSignal::Graceful]);

    h.change("D1", DeviceKind::Device);
    settle().await;
    assert_eq!(h.spawner.spawn_count("D1"), 2);

    h.remove("D1", DeviceKind::Device);
    settle().await;

    assert_eq!(h.spawner.spawn_count("D1"), 2);
    assert_eq!(
        h.spawner.signals_for("D1"),
        vec![KillSignal::Graceful, KillSignal::Graceful]
    );
    assert_eq!(
        h.publisher.reports(),
        vec![
            report("D1", "device"),
            report("D1", "device"),
            report("D1", "unauthorized"),
            report("D1", "device"),
            report("D1", "absent"),
        ]
    );

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_removing_unknown_device_only_reports() {
    let h = Harness::start(MockSpawner::new());

    h.remove("D9", DeviceKind::Offline);
    settle().await;

    assert_eq!(h.publisher.reports(), vec![report("D9", "absent")]);
    assert!(h.spawner.signals_for("D9").is_empty());
    assert_eq!(h.spawner.total_spawns(), 0);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_clean_exit_is_not_restarted() {
    let h = Harness::start(MockSpawner::new());
    h.add("D1", DeviceKind::Device);
    settle().await;

    tokio::time::advance(Duration::from_secs(60)).await;
    assert!(h.spawner.exit("D1", WorkerExit::code(0)));
    settle().await;

    assert_eq!(h.spawner.spawn_count("D1"), 1);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_dirty_exit_after_min_uptime_spawns_one_replacement() {
    let h = Harness::start(MockSpawner::new());
    h.add("D1", DeviceKind::Device);
    settle().await;

    tokio::time::advance(Duration::from_secs(11)).await;
    assert!(h.spawner.exit("D1", WorkerExit::code(1)));
    settle().await;

    assert_eq!(h.spawner.spawn_count("D1"), 2);

    // The replacement is a fresh worker with its own uptime.
    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(h.spawner.exit("D1", WorkerExit::signaled(Signal::SIGSEGV as i32)));
    settle().await;

    assert_eq!(h.spawner.spawn_count("D1"), 2);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_dirty_exit_within_min_uptime_is_not_restarted() {
    let h = Harness::start(MockSpawner::new());
    h.add("D1", DeviceKind::Device);
    settle().await;

    tokio::time::advance(Duration::from_secs(3)).await;
    assert!(h.spawner.exit("D1", WorkerExit::code(1)));
    settle().await;
    assert_eq!(h.spawner.spawn_count("D1"), 1);

    // A later state change brings the device back.
    h.change("D1", DeviceKind::Device);
    settle().await;
    assert_eq!(h.spawner.spawn_count("D1"), 2);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_worker_killed_by_sigterm_is_not_restarted() {
    let h = Harness::start(MockSpawner::new());
    h.add("D1", DeviceKind::Device);
    settle().await;

    tokio::time::advance(Duration::from_secs(30)).await;
    assert!(h.spawner.exit("D1", WorkerExit::code(143)));
    settle().await;

    assert_eq!(h.spawner.spawn_count("D1"), 1);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_spawn_failure_keeps_provider_running() {
    let spawner = MockSpawner::new();
    spawner.fail_serial("D1");
    let h = Harness::start(spawner);

    h.add("D1", DeviceKind::Device);
    h.add("D2", DeviceKind::Device);
    settle().await;

    assert_eq!(h.spawner.spawn_count("D1"), 0);
    assert_eq!(h.spawner.spawn_count("D2"), 1);
    assert_eq!(h.publisher.reports().len(), 2);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_graceful_timeout_escalates_to_one_force_kill() {
    let spawner = MockSpawner::with_behavior(MockBehavior::ExitOnForce);
    let h = Harness::start(spawner);
    h.add("D1", DeviceKind::Device);
    settle().await;

    h.change("D1", DeviceKind::Offline);
    settle().await;
    assert_eq!(h.spawner.signals_for("D1"), vec![KillSignal::Graceful]);

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(
        h.spawner.signals_for("D1"),
        vec![KillSignal::Graceful, KillSignal::Force]
    );
    assert_eq!(h.spawner.spawn_count("D1"), 1);

    let drained = h.shutdown().await;
    assert_eq!(drained.total(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_termination_does_not_stop_supervision() {
    let spawner = MockSpawner::new();
    spawner.set_behavior("D1", MockBehavior::Hang);
    let h = Harness::start(spawner);
    h.add("D1", DeviceKind::Device);
    settle().await;

    h.remove("D1", DeviceKind::Device);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(
        h.spawner.signals_for("D1"),
        vec![KillSignal::Graceful, KillSignal::Force]
    );

    h.add("D2", DeviceKind::Emulator);
    settle().await;
    assert_eq!(h.spawner.spawn_count("D2"), 1);

    // The stuck worker keeps its finished termination; D2 gets a fresh one.
    let drained = h.shutdown().await;
    assert_eq!(
        drained,
        DrainReport {
            graceful: 1,
            forced: 0,
            failed: 1
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_terminates_workers_concurrently() {
    let spawner = MockSpawner::new();
    spawner.set_behavior("D2", MockBehavior::ExitOnForce);
    let h = Harness::start(spawner);
    h.add("D1", DeviceKind::Device);
    h.add("D2", DeviceKind::Emulator);
    settle().await;

    let start = Instant::now();
    let spawner = h.spawner.clone();
    let drained = h.shutdown().await;
    let elapsed = start.elapsed();

    assert_eq!(
        drained,
        DrainReport {
            graceful: 1,
            forced: 1,
            failed: 0
        }
    );
    // One graceful budget, not one per worker.
    assert!(elapsed >= Duration::from_secs(10));
    assert!(elapsed < Duration::from_secs(20));
    assert_eq!(spawner.signals_for("D1"), vec![KillSignal::Graceful]);
    assert_eq!(
        spawner.signals_for("D2"),
        vec![KillSignal::Graceful, KillSignal::Force]
    );
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_reuses_termination_in_flight() {
    let spawner = MockSpawner::with_behavior(MockBehavior::ExitOnForce);
    let h = Harness::start(spawner);
    h.add("D1", DeviceKind::Device);
    settle().await;

    h.change("D1", DeviceKind::Offline);
    settle().await;

    let spawner = h.spawner.clone();
    let drained = h.shutdown().await;

    assert_eq!(drained.forced, 1);
    assert_eq!(
        spawner.signals_for("D1"),
        vec![KillSignal::Graceful, KillSignal::Force]
    );
}

#[tokio::test(start_paused = true)]
async fn test_unwanted_devices_are_ignored() {
    let filter = SerialFilter::new(vec!["D1".to_string()], Vec::<String>::new());
    let h = Harness::start_with_filter(MockSpawner::new(), Arc::new(filter));

    h.add("D1", DeviceKind::Device);
    h.add("D2", DeviceKind::Device);
    h.remove("D2", DeviceKind::Device);
    settle().await;

    assert_eq!(h.publisher.reports(), vec![report("D1", "device")]);
    assert_eq!(h.spawner.spawn_count("D2"), 0);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_provider_outlives_its_tracker() {
    let mut h = Harness::start(MockSpawner::new());
    h.add("D1", DeviceKind::Device);
    settle().await;

    h.events = None;
    settle().await;

    tokio::time::advance(Duration::from_secs(11)).await;
    assert!(h.spawner.exit("D1", WorkerExit::code(1)));
    settle().await;
    assert_eq!(h.spawner.spawn_count("D1"), 2);

    let drained = h.shutdown().await;
    assert_eq!(drained.graceful, 1);
}

// =============================================================================
// Random event sequences
// =============================================================================

#[derive(Debug, Clone)]
enum Step {
    Add(DeviceKind),
    Change(DeviceKind),
    Remove,
    Exit(i32),
    Advance(u64),
}

fn kind_strategy() -> impl Strategy<Value = DeviceKind> {
    prop_oneof![
        Just(DeviceKind::Device),
        Just(DeviceKind::Emulator),
        Just(DeviceKind::Offline),
        Just(DeviceKind::Unauthorized),
    ]
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        kind_strategy().prop_map(Step::Add),
        kind_strategy().prop_map(Step::Change),
        Just(Step::Remove),
        prop_oneof![Just(0), Just(1), Just(143)].prop_map(Step::Exit),
        (1u64..15).prop_map(Step::Advance),
    ]
}

/// Handle worker notifications until none arrive. Returns the exits seen.
async fn pump(supervisor: &mut Supervisor<MockSpawner>) -> usize {
    let mut exits = 0;
    while let Ok(Some(notification)) =
        tokio::time::timeout(Duration::from_millis(1), supervisor.next_notification()).await
    {
        if matches!(notification, WorkerNotification::Exited { .. }) {
            exits += 1;
        }
        supervisor.handle_notification(notification);
    }
    exits
}

async fn run_sequence(steps: Vec<Step>) {
    let spawner = MockSpawner::new();
    let router = DeviceRouter::new(
        PROVIDER,
        Arc::new(AcceptAll),
        Arc::new(MemoryPublisher::new()),
    );
    let mut supervisor = Supervisor::new(
        Arc::new(spawner.clone()),
        CrashPolicy::default(),
        TerminationPolicy::default(),
    );

    let mut kind = DeviceKind::Device;
    let mut exits = 0;

    for step in steps {
        let event = match step {
            Step::Add(next) => {
                kind = next;
                Some(DeviceEvent::Added(Device::new("D1", kind.clone())))
            }
            Step::Change(next) => {
                kind = next;
                Some(DeviceEvent::Changed(Device::new("D1", kind.clone())))
            }
            Step::Remove => Some(DeviceEvent::Removed(Device::new("D1", kind.clone()))),
            Step::Exit(code) => {
                spawner.exit("D1", WorkerExit::code(code));
                None
            }
            Step::Advance(secs) => {
                tokio::time::advance(Duration::from_secs(secs)).await;
                None
            }
        };
        if let Some(event) = event {
            router.dispatch(&event, &mut supervisor);
        }

        exits += pump(&mut supervisor).await;

        assert!(supervisor.worker_count() <= 1);
        assert!(spawner.spawn_count("D1") <= exits + 1);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_event_sequences_keep_at_most_one_worker(
        steps in proptest::collection::vec(step_strategy(), 1..40)
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();
        runtime.block_on(run_sequence(steps));
    }
}
