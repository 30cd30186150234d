//! Test harness for scheduler integration tests.
//!
//! Provides a scriptable executor, a recording listener and polling helpers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use fleet_lite::config::SchedulerConfig;
use fleet_lite::configuration::Configuration;
use fleet_lite::device::{FreeDeviceState, LocalDevicePool};
use fleet_lite::error::InvocationError;
use fleet_lite::scheduler::CommandScheduler;
use fleet_lite::worker::{
    InvocationContext, InvocationExecutor, Rescheduler, ScheduledInvocationListener,
};

/// Build an owned argument vector.
pub fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Short poll interval so tests react quickly even without wake signals.
pub fn test_config() -> SchedulerConfig {
    SchedulerConfig::new(50)
}

/// What the fake executor does for a given configuration name.
#[derive(Clone)]
pub enum Behavior {
    /// Run for the given time, returning early when stopped.
    Run(Duration),
    /// Run for the given time, ignoring stop requests.
    IgnoreStop(Duration),
    /// Return the given error right away.
    Fail(InvocationError),
    /// Panic inside the invocation.
    Panic,
    /// Hand a copy of the configuration back to the scheduler once.
    ScheduleConfig,
    /// Ask the scheduler to run the command again, once.
    Reschedule,
    /// Spawn a helper that outlives the invocation.
    SpawnStray,
}

#[derive(Debug, Clone)]
pub struct StartedInvocation {
    pub name: String,
    pub invocation_id: u64,
    pub command_id: u64,
    pub serials: Vec<String>,
}

/// Executor whose behavior is scripted per configuration name.
///
/// Unscripted names run for 10ms.
#[derive(Default)]
pub struct FakeExecutor {
    behaviors: Mutex<HashMap<String, Behavior>>,
    started: Mutex<Vec<StartedInvocation>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl FakeExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, name: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(name.to_string(), behavior);
    }

    pub fn started(&self) -> Vec<StartedInvocation> {
        self.started.lock().unwrap().clone()
    }

    pub fn started_names(&self) -> Vec<String> {
        self.started().into_iter().map(|s| s.name).collect()
    }

    pub fn start_count(&self, name: &str) -> usize {
        self.started().iter().filter(|s| s.name == name).count()
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    fn behavior(&self, name: &str) -> Behavior {
        self.behaviors
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or(Behavior::Run(Duration::from_millis(10)))
    }
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl InvocationExecutor for FakeExecutor {
    async fn invoke(
        &self,
        context: Arc<InvocationContext>,
        config: Arc<Configuration>,
        rescheduler: Arc<dyn Rescheduler>,
        _listeners: Vec<Arc<dyn ScheduledInvocationListener>>,
    ) -> Result<(), InvocationError> {
        self.started.lock().unwrap().push(StartedInvocation {
            name: config.name.clone(),
            invocation_id: context.invocation_id(),
            command_id: context.command_id(),
            serials: context.serials(),
        });
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        let _guard = RunningGuard(&self.running);

        match self.behavior(&config.name) {
            Behavior::Run(duration) => {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => {}
                    _ = context.cancelled() => {}
                }
                Ok(())
            }
            Behavior::IgnoreStop(duration) => {
                tokio::time::sleep(duration).await;
                Ok(())
            }
            Behavior::Fail(e) => Err(e),
            Behavior::Panic => panic!("invocation blew up"),
            Behavior::ScheduleConfig => {
                if !config.args.iter().any(|a| a == "--handed-off") {
                    let mut next = (*config).clone();
                    next.args.push("--handed-off".to_string());
                    rescheduler.schedule_config(next).await;
                }
                Ok(())
            }
            Behavior::Reschedule => {
                if self.start_count(&config.name) == 1 {
                    rescheduler.reschedule_command().await;
                }
                Ok(())
            }
            Behavior::SpawnStray => {
                context.spawn_child("stray", async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                });
                Ok(())
            }
        }
    }
}

/// Listener recording every completion with its device health map.
#[derive(Default)]
pub struct RecordingListener {
    initiated: Mutex<Vec<u64>>,
    completed: Mutex<Vec<(u64, HashMap<String, FreeDeviceState>)>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn initiated(&self) -> Vec<u64> {
        self.initiated.lock().unwrap().clone()
    }

    pub fn completed(&self) -> Vec<(u64, HashMap<String, FreeDeviceState>)> {
        self.completed.lock().unwrap().clone()
    }

    pub fn completion_count(&self) -> usize {
        self.completed.lock().unwrap().len()
    }
}

impl ScheduledInvocationListener for RecordingListener {
    fn invocation_initiated(&self, context: &InvocationContext) {
        self.initiated.lock().unwrap().push(context.invocation_id());
    }

    fn invocation_complete(
        &self,
        context: &InvocationContext,
        device_states: &HashMap<String, FreeDeviceState>,
    ) {
        self.completed
            .lock()
            .unwrap()
            .push((context.invocation_id(), device_states.clone()));
    }
}

/// Scheduler over physical devices with the given serials.
pub fn test_scheduler(
    serials: &[&str],
    executor: Arc<FakeExecutor>,
) -> (CommandScheduler, Arc<LocalDevicePool>) {
    let pool = Arc::new(LocalDevicePool::with_devices(serials));
    let scheduler = CommandScheduler::new(test_config(), pool.clone(), executor);
    (scheduler, pool)
}

/// Reserve a localhost port that is free right now.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(20)).await;
    assert!(result, "{}", message);
}
