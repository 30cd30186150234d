//! Scheduling loop tests: fairness, device exclusivity, looping and
//! invocation cleanup.

mod test_harness;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use fleet_lite::device::{
    DeviceAllocationState, DeviceHandle, DevicePool, DeviceRequirement, FreeDeviceState,
    LocalDevicePool,
};
use fleet_lite::error::{ExitCode, FleetError, InvocationError};
use fleet_lite::scheduler::{CommandScheduler, CommandState};
use fleet_lite::worker::{InvocationContext, InvocationHealthCheck};
use test_harness::{
    args, assert_eventually, test_config, test_scheduler, Behavior, FakeExecutor,
    RecordingListener,
};

async fn wait_idle(scheduler: &CommandScheduler) {
    assert_eventually(
        || async { scheduler.executing_command_count().await == 0 },
        Duration::from_secs(5),
        "Executing commands should finish",
    )
    .await;
}

// =============================================================================
// Fairness
// =============================================================================

#[tokio::test]
async fn test_least_executed_command_runs_first() {
    let executor = FakeExecutor::new();
    let (scheduler, _pool) = test_scheduler(&["d1"], executor.clone());

    scheduler
        .add_command_with_exec_time(&args(&["a"]), Duration::from_millis(300))
        .await
        .unwrap();
    scheduler
        .add_command_with_exec_time(&args(&["b"]), Duration::from_millis(100))
        .await
        .unwrap();
    scheduler
        .add_command_with_exec_time(&args(&["c"]), Duration::from_millis(200))
        .await
        .unwrap();

    for _ in 0..3 {
        assert_eq!(scheduler.run_scheduling_pass().await, 1);
        wait_idle(&scheduler).await;
    }

    assert_eq!(executor.started_names(), vec!["b", "c", "a"]);
}

#[tokio::test]
async fn test_equal_exec_time_breaks_ties_by_tracker_id() {
    let executor = FakeExecutor::new();
    let (scheduler, _pool) = test_scheduler(&["d1"], executor.clone());

    let first = scheduler.add_command(&args(&["first"])).await.unwrap();
    let second = scheduler.add_command(&args(&["second"])).await.unwrap();
    assert!(first < second);

    scheduler.run_scheduling_pass().await;
    wait_idle(&scheduler).await;
    scheduler.run_scheduling_pass().await;
    wait_idle(&scheduler).await;

    assert_eq!(executor.started_names(), vec!["first", "second"]);
}

// =============================================================================
// Device matching
// =============================================================================

#[tokio::test]
async fn test_no_devices_keeps_command_ready() {
    let executor = FakeExecutor::new();
    let (scheduler, _pool) = test_scheduler(&[], executor.clone());

    scheduler.add_command(&args(&["lonely"])).await.unwrap();
    for _ in 0..3 {
        assert_eq!(scheduler.run_scheduling_pass().await, 0);
    }

    assert_eq!(scheduler.ready_command_count().await, 1);
    assert_eq!(scheduler.executing_command_count().await, 0);
    assert!(executor.started().is_empty());
}

#[tokio::test]
async fn test_two_commands_share_one_device() {
    let executor = FakeExecutor::new();
    executor.set("one", Behavior::Run(Duration::from_millis(100)));
    executor.set("two", Behavior::Run(Duration::from_millis(100)));
    let (scheduler, _pool) = test_scheduler(&["d1"], executor.clone());

    scheduler.add_command(&args(&["one"])).await.unwrap();
    scheduler.add_command(&args(&["two"])).await.unwrap();
    scheduler.shutdown_on_empty().await;
    let handle = scheduler.start();

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("scheduler should exit once both commands ran")
        .unwrap();

    assert_eq!(executor.started_names(), vec!["one", "two"]);
    assert_eq!(executor.max_running(), 1);
}

#[tokio::test]
async fn test_devices_never_shared_between_invocations() {
    let executor = FakeExecutor::new();
    for name in ["c1", "c2", "c3", "c4", "c5"] {
        executor.set(name, Behavior::Run(Duration::from_secs(10)));
    }
    let (scheduler, _pool) = test_scheduler(&["d1", "d2", "d3"], executor.clone());

    for name in ["c1", "c2", "c3", "c4", "c5"] {
        scheduler.add_command(&args(&[name])).await.unwrap();
    }
    assert_eq!(scheduler.run_scheduling_pass().await, 3);

    let invocations = scheduler.invocations().await;
    assert_eq!(invocations.len(), 3);
    let mut serials = HashSet::new();
    for info in &invocations {
        for serial in &info.serials {
            assert!(serials.insert(serial.clone()), "{} allocated twice", serial);
        }
    }

    // Every command sits in exactly one set.
    let snapshots = scheduler.all_commands().await;
    let exec_ids: HashSet<u64> = snapshots.iter().map(|s| s.exec_id).collect();
    assert_eq!(exec_ids.len(), snapshots.len());
    assert_eq!(snapshots.len(), 5);
    let executing = snapshots
        .iter()
        .filter(|s| matches!(s.state, CommandState::Executing))
        .count();
    let ready = snapshots
        .iter()
        .filter(|s| matches!(s.state, CommandState::WaitingForDevice))
        .count();
    assert_eq!((executing, ready), (3, 2));

    scheduler.shutdown_hard().await;
}

#[tokio::test]
async fn test_multi_device_command_is_all_or_nothing() {
    let executor = FakeExecutor::new();
    executor.set("holder", Behavior::Run(Duration::from_secs(10)));
    let (scheduler, pool) = test_scheduler(&["d1", "d2"], executor.clone());

    scheduler
        .add_command(&args(&["holder", "-s", "d2"]))
        .await
        .unwrap();
    scheduler.run_scheduling_pass().await;

    scheduler
        .add_command(&args(&["pair", "--device", "main", "--device", "peer"]))
        .await
        .unwrap();
    assert_eq!(scheduler.run_scheduling_pass().await, 0);

    // The partial allocation of d1 was rolled back.
    assert_eq!(pool.state_of("d1"), Some(DeviceAllocationState::Available));
    assert_eq!(scheduler.ready_command_count().await, 1);

    scheduler.shutdown_hard().await;
}

#[tokio::test]
async fn test_multi_device_command_gets_every_slot() {
    let executor = FakeExecutor::new();
    let (scheduler, _pool) = test_scheduler(&["d1", "d2"], executor.clone());

    scheduler
        .add_command(&args(&["pair", "--device", "main", "--device", "peer"]))
        .await
        .unwrap();
    assert_eq!(scheduler.run_scheduling_pass().await, 1);
    wait_idle(&scheduler).await;

    let started = executor.started();
    assert_eq!(started.len(), 1);
    let mut serials = started[0].serials.clone();
    serials.sort();
    assert_eq!(serials, vec!["d1", "d2"]);
}

// =============================================================================
// Command Files
// =============================================================================

#[tokio::test]
async fn test_command_file_lines_all_start_in_one_pass() {
    for n in [0usize, 1, 5] {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("commands.txt");
        let body: String = (0..n).map(|i| format!("cmd{}\n", i)).collect();
        std::fs::write(&path, body).unwrap();

        let executor = FakeExecutor::new();
        for i in 0..n {
            executor.set(&format!("cmd{}", i), Behavior::Run(Duration::from_secs(10)));
        }
        let serials: Vec<String> = (0..5).map(|i| format!("d{}", i)).collect();
        let serial_refs: Vec<&str> = serials.iter().map(String::as_str).collect();
        let (scheduler, _pool) = test_scheduler(&serial_refs, executor.clone());

        let ids = scheduler.add_command_file(&path, &[]).await.unwrap();
        assert_eq!(ids.len(), n);
        assert_eq!(scheduler.run_scheduling_pass().await, n);
        assert_eq!(scheduler.executing_command_count().await, n);

        scheduler.shutdown_hard().await;
    }
}

#[tokio::test]
async fn test_command_file_extra_args_and_source() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("commands.txt");
    std::fs::write(&path, "alpha\nbeta --loop\n").unwrap();

    let executor = FakeExecutor::new();
    let (scheduler, _pool) = test_scheduler(&[], executor);

    scheduler
        .add_command_file(&path, &args(&["--invocation-timeout", "5000"]))
        .await
        .unwrap();

    let trackers = scheduler.command_trackers().await;
    assert_eq!(trackers.len(), 2);
    let canonical = std::fs::canonicalize(&path).unwrap();
    for tracker in &trackers {
        assert_eq!(tracker.source_file.as_deref(), Some(canonical.as_path()));
        assert!(tracker.args.ends_with(&args(&["--invocation-timeout", "5000"])));
    }
}

#[tokio::test]
async fn test_invalid_command_file_line_adds_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("commands.txt");
    std::fs::write(&path, "good\nbad --no-such-flag\n").unwrap();

    let (scheduler, _pool) = test_scheduler(&[], FakeExecutor::new());

    let result = scheduler.add_command_file(&path, &[]).await;
    assert!(matches!(result, Err(FleetError::CommandLine { .. })));
    assert_eq!(scheduler.ready_command_count().await, 0);
}

// =============================================================================
// Looping
// =============================================================================

#[tokio::test]
async fn test_loop_command_leaves_one_sleeping_successor() {
    let executor = FakeExecutor::new();
    let (scheduler, _pool) = test_scheduler(&["d1"], executor.clone());

    let id = scheduler
        .add_command(&args(&["looper", "--loop", "--min-loop-time", "60000"]))
        .await
        .unwrap();
    assert_eq!(scheduler.run_scheduling_pass().await, 1);

    assert_eq!(scheduler.executing_command_count().await, 1);
    assert_eq!(scheduler.sleeping_command_count().await, 1);
    assert_eq!(scheduler.ready_command_count().await, 0);

    wait_idle(&scheduler).await;
    assert_eq!(scheduler.sleeping_command_count().await, 1);

    let sleeping: Vec<_> = scheduler
        .all_commands()
        .await
        .into_iter()
        .filter(|s| matches!(s.state, CommandState::Sleeping))
        .collect();
    assert_eq!(sleeping.len(), 1);
    assert_eq!(sleeping[0].tracker_id, id);
    assert!(sleeping[0].sleep_until.is_some());
}

#[tokio::test]
async fn test_loop_without_delay_goes_straight_to_ready() {
    let executor = FakeExecutor::new();
    executor.set("spinner", Behavior::Run(Duration::from_secs(10)));
    let (scheduler, _pool) = test_scheduler(&["d1"], executor);

    scheduler
        .add_command(&args(&["spinner", "--loop"]))
        .await
        .unwrap();
    scheduler.run_scheduling_pass().await;

    assert_eq!(scheduler.executing_command_count().await, 1);
    assert_eq!(scheduler.ready_command_count().await, 1);
    assert_eq!(scheduler.sleeping_command_count().await, 0);

    scheduler.shutdown_hard().await;
}

#[tokio::test]
async fn test_sleeping_command_wakes_after_delay() {
    let executor = FakeExecutor::new();
    let (scheduler, _pool) = test_scheduler(&["d1"], executor.clone());

    scheduler
        .add_command(&args(&["looper", "--loop", "--min-loop-time", "100"]))
        .await
        .unwrap();
    let _handle = scheduler.start();

    assert_eventually(
        || async { executor.start_count("looper") >= 3 },
        Duration::from_secs(5),
        "Looping command should run repeatedly",
    )
    .await;

    scheduler.shutdown().await;
    scheduler.await_termination().await;
}

#[tokio::test]
async fn test_shutdown_on_empty_waits_for_loop_to_be_disabled() {
    let executor = FakeExecutor::new();
    let (scheduler, _pool) = test_scheduler(&["d1"], executor.clone());

    let id = scheduler
        .add_command(&args(&["looper", "--loop", "--min-loop-time", "50"]))
        .await
        .unwrap();
    scheduler.shutdown_on_empty().await;
    let _handle = scheduler.start();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!scheduler.is_terminated());
    assert!(executor.start_count("looper") >= 2);

    assert!(scheduler.set_loop_mode_disabled(id).await);
    assert_eventually(
        || async { scheduler.is_terminated() },
        Duration::from_secs(5),
        "Scheduler should terminate once the loop is disabled",
    )
    .await;
}

#[tokio::test]
async fn test_set_loop_mode_disabled_unknown_tracker() {
    let (scheduler, _pool) = test_scheduler(&[], FakeExecutor::new());
    assert!(!scheduler.set_loop_mode_disabled(42).await);
}

// =============================================================================
// Queue management
// =============================================================================

#[tokio::test]
async fn test_remove_all_commands_is_idempotent() {
    let (scheduler, _pool) = test_scheduler(&[], FakeExecutor::new());

    scheduler.add_command(&args(&["a"])).await.unwrap();
    scheduler
        .add_command(&args(&["b", "--loop", "--min-loop-time", "60000"]))
        .await
        .unwrap();

    scheduler.remove_all_commands().await;
    assert!(scheduler.all_commands().await.is_empty());
    scheduler.remove_all_commands().await;
    assert!(scheduler.all_commands().await.is_empty());
    assert!(scheduler.watched_command_files().is_empty());
}

#[tokio::test]
async fn test_invalid_command_mutates_nothing() {
    let (scheduler, _pool) = test_scheduler(&[], FakeExecutor::new());

    let missing = scheduler.add_command(&[]).await;
    assert!(matches!(missing, Err(FleetError::Configuration(_))));
    let bad = scheduler
        .add_command(&args(&["cmd", "--bogus"]))
        .await;
    assert!(matches!(bad, Err(FleetError::Configuration(_))));

    assert!(scheduler.all_commands().await.is_empty());
}

#[tokio::test]
async fn test_add_after_shutdown_is_rejected() {
    let (scheduler, _pool) = test_scheduler(&[], FakeExecutor::new());
    scheduler.add_command(&args(&["pending"])).await.unwrap();

    scheduler.shutdown().await;

    assert!(scheduler.is_shutting_down().await);
    assert_eq!(scheduler.ready_command_count().await, 0);
    let result = scheduler.add_command(&args(&["late"])).await;
    assert!(matches!(result, Err(FleetError::ShutDown)));
}

// =============================================================================
// Invocation cleanup
// =============================================================================

#[tokio::test]
async fn test_completion_frees_device_and_notifies_listener() {
    let executor = FakeExecutor::new();
    let listener = RecordingListener::new();
    let pool = Arc::new(LocalDevicePool::with_devices(&["d1"]));
    let scheduler = CommandScheduler::builder(test_config(), pool.clone(), executor.clone())
        .with_listener(listener.clone())
        .build();

    let id = scheduler.add_command(&args(&["quick"])).await.unwrap();
    scheduler.run_scheduling_pass().await;
    assert_eq!(pool.state_of("d1"), Some(DeviceAllocationState::Allocated));
    wait_idle(&scheduler).await;

    assert_eq!(pool.state_of("d1"), Some(DeviceAllocationState::Available));
    assert_eq!(listener.initiated().len(), 1);
    let completed = listener.completed();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].1.get("d1"), Some(&FreeDeviceState::Available));
    assert_eq!(scheduler.last_invocation_exit_code(), ExitCode::NoError);
    assert_eq!(executor.started()[0].command_id, id);
}

#[tokio::test]
async fn test_device_failure_releases_device_unavailable() {
    let executor = FakeExecutor::new();
    executor.set(
        "broken",
        Behavior::Fail(InvocationError::DeviceUnavailable {
            serial: "d1".to_string(),
            reason: "went offline".to_string(),
        }),
    );
    let listener = RecordingListener::new();
    let pool = Arc::new(LocalDevicePool::with_devices(&["d1"]));
    let scheduler = CommandScheduler::builder(test_config(), pool.clone(), executor)
        .with_listener(listener.clone())
        .build();

    scheduler.add_command(&args(&["broken"])).await.unwrap();
    scheduler.run_scheduling_pass().await;
    wait_idle(&scheduler).await;

    assert_eq!(pool.state_of("d1"), Some(DeviceAllocationState::Unavailable));
    assert_eq!(
        listener.completed()[0].1.get("d1"),
        Some(&FreeDeviceState::Unavailable)
    );
    assert_eq!(
        scheduler.last_invocation_exit_code(),
        ExitCode::DeviceUnavailable
    );
}

#[tokio::test]
async fn test_offline_device_released_unavailable_after_success() {
    let executor = FakeExecutor::new();
    executor.set("quick", Behavior::Run(Duration::from_millis(50)));
    let (scheduler, pool) = test_scheduler(&["d1"], executor);

    scheduler.add_command(&args(&["quick"])).await.unwrap();
    scheduler.run_scheduling_pass().await;
    pool.set_online("d1", false);
    wait_idle(&scheduler).await;

    assert_eq!(pool.state_of("d1"), Some(DeviceAllocationState::Unavailable));
    assert_eq!(pool.last_free_state("d1"), Some(FreeDeviceState::Unavailable));
}

#[tokio::test]
async fn test_panicking_invocation_still_cleans_up() {
    let executor = FakeExecutor::new();
    executor.set("boom", Behavior::Panic);
    let (scheduler, pool) = test_scheduler(&["d1"], executor);

    scheduler.add_command(&args(&["boom"])).await.unwrap();
    scheduler.run_scheduling_pass().await;
    wait_idle(&scheduler).await;

    assert_eq!(pool.state_of("d1"), Some(DeviceAllocationState::Available));
    assert_eq!(
        scheduler.last_invocation_exit_code(),
        ExitCode::ThrowableException
    );
}

#[tokio::test]
async fn test_fatal_host_error_shuts_scheduler_down() {
    let executor = FakeExecutor::new();
    executor.set(
        "fatal",
        Behavior::Fail(InvocationError::FatalHost("disk gone".to_string())),
    );
    let (scheduler, _pool) = test_scheduler(&["d1"], executor);

    scheduler.add_command(&args(&["fatal"])).await.unwrap();
    scheduler.add_command(&args(&["next"])).await.unwrap();
    let _handle = scheduler.start();

    assert_eventually(
        || async { scheduler.is_terminated() },
        Duration::from_secs(5),
        "Fatal host error should stop the scheduler",
    )
    .await;
    assert_eq!(scheduler.last_invocation_exit_code(), ExitCode::FatalHostError);
}

#[tokio::test]
async fn test_exec_time_accumulates_on_tracker() {
    let executor = FakeExecutor::new();
    executor.set("looper", Behavior::Run(Duration::from_millis(60)));
    let (scheduler, _pool) = test_scheduler(&["d1"], executor);

    let id = scheduler
        .add_command(&args(&["looper", "--loop", "--min-loop-time", "60000"]))
        .await
        .unwrap();
    scheduler.run_scheduling_pass().await;
    wait_idle(&scheduler).await;

    let trackers = scheduler.command_trackers().await;
    let tracker = trackers.iter().find(|t| t.id == id).unwrap();
    assert!(tracker.total_exec_time_ms >= 50);
}

#[tokio::test]
async fn test_invocation_timeout_interrupts_stuck_invocation() {
    let executor = FakeExecutor::new();
    executor.set("stuck", Behavior::IgnoreStop(Duration::from_secs(30)));
    let (scheduler, pool) = test_scheduler(&["d1"], executor);

    scheduler
        .add_command(&args(&["stuck", "--invocation-timeout", "100"]))
        .await
        .unwrap();
    scheduler.run_scheduling_pass().await;
    wait_idle(&scheduler).await;

    assert_eq!(pool.state_of("d1"), Some(DeviceAllocationState::Available));
    assert_ne!(scheduler.last_invocation_exit_code(), ExitCode::NoError);
}

#[tokio::test]
async fn test_stop_invocation() {
    let executor = FakeExecutor::new();
    executor.set("long", Behavior::Run(Duration::from_secs(30)));
    let (scheduler, _pool) = test_scheduler(&["d1"], executor.clone());

    scheduler.add_command(&args(&["long"])).await.unwrap();
    scheduler.run_scheduling_pass().await;
    let invocation_id = scheduler.invocations().await[0].invocation_id;
    assert!(scheduler.invocation_info(invocation_id).await.is_some());

    scheduler.stop_invocation(invocation_id).await.unwrap();
    wait_idle(&scheduler).await;

    assert!(matches!(
        scheduler.stop_invocation(invocation_id).await,
        Err(FleetError::InvocationNotFound(_))
    ));
}

#[tokio::test]
async fn test_stray_helper_does_not_block_completion() {
    let executor = FakeExecutor::new();
    executor.set("leaky", Behavior::SpawnStray);
    let (scheduler, pool) = test_scheduler(&["d1"], executor);

    scheduler.add_command(&args(&["leaky"])).await.unwrap();
    scheduler.run_scheduling_pass().await;
    wait_idle(&scheduler).await;

    assert_eq!(pool.state_of("d1"), Some(DeviceAllocationState::Available));
}

#[tokio::test]
async fn test_stop_right_after_dispatch_escalates() {
    let executor = FakeExecutor::new();
    executor.set("stuck", Behavior::IgnoreStop(Duration::from_secs(30)));
    let pool = Arc::new(LocalDevicePool::with_devices(&["d1"]));
    let scheduler =
        CommandScheduler::new(test_config().with_stop_escalation(100), pool.clone(), executor.clone());

    scheduler.add_command(&args(&["stuck"])).await.unwrap();
    assert_eq!(scheduler.run_scheduling_pass().await, 1);
    // The invocation task has not been polled yet.
    let invocation_id = scheduler.invocations().await[0].invocation_id;
    scheduler.stop_invocation(invocation_id).await.unwrap();

    wait_idle(&scheduler).await;
    assert_eq!(executor.running(), 0);
    assert_eq!(
        scheduler.last_invocation_exit_code(),
        ExitCode::ThrowableException
    );
    assert_eq!(pool.state_of("d1"), Some(DeviceAllocationState::Available));
}

struct FailEverything;

impl InvocationHealthCheck for FailEverything {
    fn check(&self, _context: &InvocationContext) -> Option<String> {
        Some("device overheated".to_string())
    }
}

#[tokio::test]
async fn test_failed_health_check_stops_invocation() {
    let executor = FakeExecutor::new();
    executor.set("long", Behavior::Run(Duration::from_secs(30)));
    let pool = Arc::new(LocalDevicePool::with_devices(&["d1"]));
    let scheduler = CommandScheduler::builder(test_config(), pool, executor.clone())
        .with_health_check(Arc::new(FailEverything))
        .build();

    scheduler.add_command(&args(&["long"])).await.unwrap();
    let _handle = scheduler.start();

    assert_eventually(
        || async { executor.start_count("long") == 1 && executor.running() == 0 },
        Duration::from_secs(5),
        "Health check should stop the invocation",
    )
    .await;

    scheduler.shutdown().await;
    scheduler.await_termination().await;
}

// =============================================================================
// Rescheduling
// =============================================================================

#[tokio::test]
async fn test_schedule_config_runs_handed_off_work() {
    let executor = FakeExecutor::new();
    executor.set("splitter", Behavior::ScheduleConfig);
    let (scheduler, _pool) = test_scheduler(&["d1"], executor.clone());

    scheduler.add_command(&args(&["splitter"])).await.unwrap();
    scheduler.shutdown_on_empty().await;
    let handle = scheduler.start();

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("scheduler should exit")
        .unwrap();

    let started = executor.started();
    assert_eq!(started.len(), 2);
    assert_eq!(started[0].command_id, started[1].command_id);
}

#[tokio::test]
async fn test_reschedule_command_sleeps_for_min_loop_time() {
    let executor = FakeExecutor::new();
    executor.set("flaky", Behavior::Reschedule);
    let (scheduler, _pool) = test_scheduler(&["d1"], executor.clone());

    let id = scheduler
        .add_command(&args(&["flaky", "--min-loop-time", "300"]))
        .await
        .unwrap();
    let dispatched = std::time::Instant::now();
    assert_eq!(scheduler.run_scheduling_pass().await, 1);
    wait_idle(&scheduler).await;

    let commands = scheduler.all_commands().await;
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].state, CommandState::Sleeping);
    assert_eq!(commands[0].tracker_id, id);
    assert!(commands[0].rescheduled);
    assert!(commands[0].sleep_until.is_some());
    assert_eq!(scheduler.ready_command_count().await, 0);

    assert_eventually(
        || async {
            scheduler.run_scheduling_pass().await;
            executor.start_count("flaky") == 2
        },
        Duration::from_secs(5),
        "Rescheduled command should run once its delay passed",
    )
    .await;
    assert!(dispatched.elapsed() >= Duration::from_millis(300));
    wait_idle(&scheduler).await;

    // Not looping, and the second run did not reschedule again.
    assert!(scheduler.all_commands().await.is_empty());
    let started = executor.started();
    assert_eq!(started[0].command_id, started[1].command_id);
}

// =============================================================================
// Direct execution
// =============================================================================

#[tokio::test]
async fn test_exec_command_runs_immediately() {
    let executor = FakeExecutor::new();
    let (scheduler, pool) = test_scheduler(&["d1"], executor.clone());
    let listener = RecordingListener::new();

    let invocation_id = scheduler
        .exec_command(listener.clone(), &args(&["now"]))
        .await
        .unwrap();

    assert_eventually(
        || async { listener.completion_count() == 1 },
        Duration::from_secs(5),
        "Listener should see the completion",
    )
    .await;
    assert_eq!(listener.completed()[0].0, invocation_id);
    assert_eq!(pool.state_of("d1"), Some(DeviceAllocationState::Available));
}

#[tokio::test]
async fn test_exec_command_without_device_fails() {
    let (scheduler, _pool) = test_scheduler(&[], FakeExecutor::new());

    let result = scheduler
        .exec_command(RecordingListener::new(), &args(&["now"]))
        .await;

    assert!(matches!(result, Err(FleetError::NoDeviceAvailable(_))));
    assert!(scheduler.all_commands().await.is_empty());
}

#[tokio::test]
async fn test_exec_on_busy_device_fails_fast() {
    let executor = FakeExecutor::new();
    executor.set("long", Behavior::Run(Duration::from_secs(30)));
    let (scheduler, _pool) = test_scheduler(&["d1"], executor);

    scheduler.add_command(&args(&["long"])).await.unwrap();
    scheduler.run_scheduling_pass().await;

    let result = scheduler
        .exec_command_on_device(
            RecordingListener::new(),
            DeviceHandle::physical("d1"),
            &args(&["other"]),
        )
        .await;
    assert!(matches!(result, Err(FleetError::DeviceInUse(serial)) if serial == "d1"));
    assert_eq!(scheduler.executing_command_count().await, 1);

    scheduler.shutdown_hard().await;
}

#[tokio::test]
async fn test_exec_on_caller_owned_device_keeps_it_allocated() {
    let executor = FakeExecutor::new();
    let (scheduler, pool) = test_scheduler(&["d1"], executor);
    let listener = RecordingListener::new();

    let handle = pool.allocate(&DeviceRequirement::any()).unwrap();

    scheduler
        .exec_command_on_device(listener.clone(), handle, &args(&["mine"]))
        .await
        .unwrap();
    assert_eventually(
        || async { listener.completion_count() == 1 },
        Duration::from_secs(5),
        "Listener should see the completion",
    )
    .await;

    assert_eq!(pool.state_of("d1"), Some(DeviceAllocationState::Allocated));
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test]
async fn test_graceful_shutdown_waits_for_running_invocations() {
    let executor = FakeExecutor::new();
    executor.set("slow", Behavior::IgnoreStop(Duration::from_millis(300)));
    let (scheduler, pool) = test_scheduler(&["d1"], executor.clone());

    scheduler.add_command(&args(&["slow"])).await.unwrap();
    let _handle = scheduler.start();
    assert_eventually(
        || async { executor.running() == 1 },
        Duration::from_secs(5),
        "Invocation should start",
    )
    .await;

    scheduler.shutdown().await;
    assert!(!scheduler.is_terminated());
    scheduler.await_termination().await;

    assert_eq!(executor.running(), 0);
    assert!(pool.is_terminated());
}

#[tokio::test]
async fn test_hard_shutdown_interrupts_invocations() {
    let executor = FakeExecutor::new();
    executor.set("stuck", Behavior::IgnoreStop(Duration::from_secs(30)));
    let (scheduler, _pool) = test_scheduler(&["d1"], executor.clone());

    scheduler.add_command(&args(&["stuck"])).await.unwrap();
    let _handle = scheduler.start();
    assert_eventually(
        || async { executor.running() == 1 },
        Duration::from_secs(5),
        "Invocation should start",
    )
    .await;

    scheduler.shutdown_hard().await;
    tokio::time::timeout(Duration::from_secs(5), scheduler.await_termination())
        .await
        .expect("hard shutdown should not wait for the stuck invocation");
}

#[tokio::test]
async fn test_hard_shutdown_right_after_dispatch_interrupts_invocation() {
    let executor = FakeExecutor::new();
    executor.set("stuck", Behavior::IgnoreStop(Duration::from_secs(30)));
    let (scheduler, _pool) = test_scheduler(&["d1"], executor.clone());

    scheduler.add_command(&args(&["stuck"])).await.unwrap();
    assert_eq!(scheduler.run_scheduling_pass().await, 1);
    scheduler.shutdown_hard().await;

    wait_idle(&scheduler).await;
    assert_eq!(executor.running(), 0);
}
