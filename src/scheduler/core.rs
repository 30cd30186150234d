use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::command_file::{CommandFileParser, LineCommandFileParser};
use crate::config::SchedulerConfig;
use crate::configuration::{
    append_extra_args, ArgsConfigurationFactory, Configuration, ConfigurationFactory,
    DEFAULT_DEVICE_NAME,
};
use crate::device::{
    AllocatedDevices, DeviceAllocator, DeviceDescriptor, DeviceHandle, DevicePool, FreeDeviceState,
};
use crate::error::{ConfigError, ExitCode, FleetError, Result};
use crate::handover::{ControlHandler, HandoverCoordinator, HandoverMessage, HandoverState};
use crate::scheduler::command::{CommandSnapshot, CommandTracker, ExecutableCommand, TrackerSnapshot};
use crate::scheduler::queue::CommandQueue;
use crate::scheduler::wake::WakeGate;
use crate::watcher::{CommandFileListener, CommandFileWatcher, WatchedFile};
use crate::worker::{
    ExecutionUnit, InvocationContext, InvocationExecutor, InvocationHealthCheck, InvocationInfo,
    InvocationOutcome, Rescheduler, ScheduledInvocationListener,
};

/// Everything guarded by the scheduler lock.
struct SchedulerState {
    queue: CommandQueue,
    next_tracker_id: u64,
    next_exec_id: u64,
    /// Running execution units by invocation id.
    units: HashMap<u64, Arc<ExecutionUnit>>,
    /// Wake-up timers of sleeping commands by exec id.
    sleep_timers: HashMap<u64, AbortHandle>,
    shutdown: bool,
    shutdown_on_empty: bool,
    /// Set while held devices are being reported to a new scheduler. No
    /// invocation starts until it is cleared or the scheduler shuts down.
    handing_over: bool,
}

impl SchedulerState {
    fn new() -> Self {
        Self {
            queue: CommandQueue::new(),
            next_tracker_id: 1,
            next_exec_id: 1,
            units: HashMap::new(),
            sleep_timers: HashMap::new(),
            shutdown: false,
            shutdown_on_empty: false,
            handing_over: false,
        }
    }

    fn new_tracker(&mut self, args: Vec<String>, source_file: Option<PathBuf>) -> Arc<CommandTracker> {
        let id = self.next_tracker_id;
        self.next_tracker_id += 1;
        Arc::new(CommandTracker::new(id, args, source_file))
    }

    fn new_exec(
        &mut self,
        tracker: Arc<CommandTracker>,
        config: Configuration,
        rescheduled: bool,
    ) -> ExecutableCommand {
        let exec_id = self.next_exec_id;
        self.next_exec_id += 1;
        ExecutableCommand::new(exec_id, tracker, config, rescheduled)
    }

    fn cancel_timers(&mut self, exec_ids: &[u64]) {
        for exec_id in exec_ids {
            if let Some(timer) = self.sleep_timers.remove(exec_id) {
                timer.abort();
            }
        }
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown || (self.shutdown_on_empty && self.queue.is_empty())
    }

    fn dispatch_paused(&self) -> bool {
        self.shutdown || self.handing_over
    }

    /// Serials of pool devices held by running invocations.
    fn held_serials(&self) -> Vec<String> {
        let mut serials: Vec<String> = self
            .units
            .values()
            .filter(|u| u.owns_devices())
            .flat_map(|u| u.context().devices().handles())
            .filter(|d| !d.is_placeholder())
            .map(|d| d.serial.clone())
            .collect();
        serials.sort();
        serials
    }
}

struct SchedulerInner {
    config: SchedulerConfig,
    factory: Arc<dyn ConfigurationFactory>,
    parser: Arc<dyn CommandFileParser>,
    allocator: DeviceAllocator,
    executor: Arc<dyn InvocationExecutor>,
    listeners: Vec<Arc<dyn ScheduledInvocationListener>>,
    health_checks: Vec<Arc<dyn InvocationHealthCheck>>,
    state: Mutex<SchedulerState>,
    gate: Arc<WakeGate>,
    watcher: Arc<CommandFileWatcher>,
    handover: Arc<HandoverCoordinator>,
    last_exit_code: StdMutex<ExitCode>,
    started: AtomicBool,
    hard_shutdown: AtomicBool,
    /// Stops the command file watcher.
    shutdown_token: CancellationToken,
    /// Cancelled once the scheduling loop has fully exited.
    terminated: CancellationToken,
}

pub struct SchedulerBuilder {
    config: SchedulerConfig,
    pool: Arc<dyn DevicePool>,
    executor: Arc<dyn InvocationExecutor>,
    factory: Arc<dyn ConfigurationFactory>,
    parser: Arc<dyn CommandFileParser>,
    listeners: Vec<Arc<dyn ScheduledInvocationListener>>,
    health_checks: Vec<Arc<dyn InvocationHealthCheck>>,
}

impl SchedulerBuilder {
    pub fn with_config_factory(mut self, factory: Arc<dyn ConfigurationFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_command_file_parser(mut self, parser: Arc<dyn CommandFileParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Listener notified about every invocation.
    pub fn with_listener(mut self, listener: Arc<dyn ScheduledInvocationListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn with_health_check(mut self, check: Arc<dyn InvocationHealthCheck>) -> Self {
        self.health_checks.push(check);
        self
    }

    pub fn build(self) -> CommandScheduler {
        let handover = Arc::new(HandoverCoordinator::new(
            self.config.handover.clone(),
            self.pool.clone(),
        ));
        let inner = Arc::new_cyclic(|weak: &Weak<SchedulerInner>| {
            let listener = Arc::new(ReloadListener {
                inner: weak.clone(),
            });
            SchedulerInner {
                config: self.config,
                factory: self.factory,
                parser: self.parser,
                allocator: DeviceAllocator::new(self.pool),
                executor: self.executor,
                listeners: self.listeners,
                health_checks: self.health_checks,
                state: Mutex::new(SchedulerState::new()),
                gate: Arc::new(WakeGate::new()),
                watcher: Arc::new(CommandFileWatcher::new(listener)),
                handover,
                last_exit_code: StdMutex::new(ExitCode::NoError),
                started: AtomicBool::new(false),
                hard_shutdown: AtomicBool::new(false),
                shutdown_token: CancellationToken::new(),
                terminated: CancellationToken::new(),
            }
        });
        CommandScheduler { inner }
    }
}

/// Fair, device-aware command scheduler.
///
/// Commands wait in a ready set until every device they need can be
/// allocated. Each pass serves the commands that have run least first.
/// Looping commands are put back to sleep for their loop delay after each
/// dispatch.
///
/// Cloning is cheap; all clones drive the same scheduler.
#[derive(Clone)]
pub struct CommandScheduler {
    inner: Arc<SchedulerInner>,
}

impl CommandScheduler {
    pub fn builder(
        config: SchedulerConfig,
        pool: Arc<dyn DevicePool>,
        executor: Arc<dyn InvocationExecutor>,
    ) -> SchedulerBuilder {
        SchedulerBuilder {
            config,
            pool,
            executor,
            factory: Arc::new(ArgsConfigurationFactory::new()),
            parser: Arc::new(LineCommandFileParser::new()),
            listeners: Vec::new(),
            health_checks: Vec::new(),
        }
    }

    pub fn new(
        config: SchedulerConfig,
        pool: Arc<dyn DevicePool>,
        executor: Arc<dyn InvocationExecutor>,
    ) -> Self {
        Self::builder(config, pool, executor).build()
    }

    fn from_weak(inner: &Weak<SchedulerInner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    // ===== Adding commands =====

    /// Add a command built from `args`. Returns the new tracker id.
    pub async fn add_command(&self, args: &[String]) -> Result<u64> {
        self.add_command_with_exec_time(args, Duration::ZERO).await
    }

    /// Add a command whose tracker starts with `total_exec_time` already
    /// accumulated, so it keeps its place in the fairness order.
    pub async fn add_command_with_exec_time(
        &self,
        args: &[String],
        total_exec_time: Duration,
    ) -> Result<u64> {
        let config = self.inner.factory.create_configuration(args)?;
        let id = {
            let mut state = self.inner.state.lock().await;
            if state.shutdown {
                return Err(FleetError::ShutDown);
            }
            let tracker = state.new_tracker(args.to_vec(), None);
            tracker.increment_exec_time(total_exec_time);
            let cmd = state.new_exec(tracker, config, false);
            let id = cmd.tracker_id();
            state.queue.push_ready(cmd);
            id
        };
        tracing::info!(command_id = id, args = ?args, "Added command");
        self.inner.gate.signal();
        Ok(id)
    }

    /// Add every command in a command file, with `extra_args` appended to
    /// each. When reloading is enabled the file is watched, and re-adding a
    /// watched file replaces the commands it contributed before.
    pub async fn add_command_file(&self, path: &Path, extra_args: &[String]) -> Result<Vec<u64>> {
        let parsed = self.inner.parser.parse(path)?;
        let path = std::fs::canonicalize(path).map_err(|source| FleetError::CommandFile {
            path: path.to_path_buf(),
            source,
        })?;

        let mut commands = Vec::with_capacity(parsed.commands.len());
        for mut args in parsed.commands {
            append_extra_args(&mut args, extra_args);
            let config = self
                .inner
                .factory
                .create_configuration(&args)
                .map_err(|source| FleetError::CommandLine {
                    command: args.join(" "),
                    source,
                })?;
            commands.push((args, config));
        }

        let reload = self.inner.config.reload_command_files;
        let dependencies = if reload {
            Some(WatchedFile::from_included(&parsed.includes)?)
        } else {
            None
        };
        let replace = reload && self.inner.watcher.is_file_watched(&path);

        let ids = {
            let mut state = self.inner.state.lock().await;
            if state.shutdown {
                return Err(FleetError::ShutDown);
            }
            if replace {
                let removed = state.queue.remove_from_file(&path);
                state.cancel_timers(&removed);
            }
            let mut ids = Vec::with_capacity(commands.len());
            for (args, config) in commands {
                let tracker = state.new_tracker(args, Some(path.clone()));
                let cmd = state.new_exec(tracker, config, false);
                ids.push(cmd.tracker_id());
                state.queue.push_ready(cmd);
            }
            ids
        };

        if let Some(dependencies) = dependencies {
            self.inner
                .watcher
                .add_command_file(&path, extra_args.to_vec(), dependencies)?;
        }
        tracing::info!(path = %path.display(), commands = ids.len(), "Loaded command file");
        self.inner.gate.signal();
        Ok(ids)
    }

    /// Reload a changed command file: drop its pending commands, then add
    /// it again.
    pub async fn reload_command_file(&self, path: &Path, extra_args: &[String]) {
        self.remove_commands_from_file(path).await;
        if let Err(e) = self.add_command_file(path, extra_args).await {
            tracing::error!(path = %path.display(), error = %e, "Failed to reload command file");
            if self.inner.config.shutdown_on_command_file_error {
                self.shutdown().await;
            }
        }
    }

    async fn remove_commands_from_file(&self, path: &Path) {
        let mut state = self.inner.state.lock().await;
        let removed = state.queue.remove_from_file(path);
        state.cancel_timers(&removed);
    }

    /// Run a command once, right now, with `listener` attached.
    ///
    /// Fails with [`FleetError::NoDeviceAvailable`] instead of queueing when
    /// its devices cannot be allocated. Never loops. Returns the invocation id.
    pub async fn exec_command(
        &self,
        listener: Arc<dyn ScheduledInvocationListener>,
        args: &[String],
    ) -> Result<u64> {
        let mut config = self.inner.factory.create_configuration(args)?;
        config.options.loop_mode = false;
        let devices = self
            .inner
            .allocator
            .allocate(&config.device_configs)
            .ok_or_else(|| FleetError::NoDeviceAvailable(config.name.clone()))?;

        let result = self
            .start_immediate(args, config, devices.clone(), true, listener)
            .await;
        if result.is_err() {
            self.release(&devices);
        }
        result
    }

    /// Run a single-device command once on `device`.
    ///
    /// The caller keeps ownership of the device, so it is not returned to
    /// the pool afterwards. Fails with [`FleetError::DeviceInUse`] if the
    /// device is part of another running invocation.
    pub async fn exec_command_on_device(
        &self,
        listener: Arc<dyn ScheduledInvocationListener>,
        device: DeviceHandle,
        args: &[String],
    ) -> Result<u64> {
        let mut config = self.inner.factory.create_configuration(args)?;
        if config.is_multi_device() {
            return Err(ConfigError::Unsupported(
                "Multi-device configurations cannot run on a single given device".to_string(),
            )
            .into());
        }
        config.options.loop_mode = false;
        let slot = config
            .device_configs
            .first()
            .map(|d| d.name.clone())
            .unwrap_or_else(|| DEFAULT_DEVICE_NAME.to_string());
        let devices = AllocatedDevices::single(slot, device);
        self.start_immediate(args, config, devices, false, listener)
            .await
    }

    async fn start_immediate(
        &self,
        args: &[String],
        config: Configuration,
        devices: AllocatedDevices,
        owns_devices: bool,
        listener: Arc<dyn ScheduledInvocationListener>,
    ) -> Result<u64> {
        let mut state = self.inner.state.lock().await;
        if state.shutdown {
            return Err(FleetError::ShutDown);
        }
        if state.handing_over {
            return Err(FleetError::Handover("handover in progress".to_string()));
        }
        let tracker = state.new_tracker(args.to_vec(), None);
        let cmd = state.new_exec(tracker, config, false);
        let exec_id = cmd.exec_id;
        state.queue.insert_executing(cmd.clone());
        match self.start_unit_locked(&mut state, cmd, devices, owns_devices, vec![listener]) {
            Ok(_) => Ok(exec_id),
            Err(e) => {
                state.queue.finish(exec_id);
                Err(e)
            }
        }
    }

    // ===== Scheduling =====

    /// Try to start every ready command, least-run first. Returns how many
    /// were started.
    pub async fn run_scheduling_pass(&self) -> usize {
        let ready = {
            let state = self.inner.state.lock().await;
            if state.dispatch_paused() {
                return 0;
            }
            state.queue.sorted_ready()
        };

        let mut started = 0;
        for cmd in ready {
            let Some(devices) = self.inner.allocator.allocate(&cmd.config.device_configs) else {
                let mut state = self.inner.state.lock().await;
                if state.queue.warn_once(cmd.exec_id) {
                    tracing::warn!(
                        command_id = cmd.tracker_id(),
                        name = %cmd.command_name(),
                        "Could not schedule command, no matching device available"
                    );
                }
                continue;
            };

            let launched = {
                let mut state = self.inner.state.lock().await;
                if state.dispatch_paused() {
                    false
                } else if !state.queue.start_executing(cmd.exec_id) {
                    // Removed while devices were being allocated.
                    false
                } else {
                    match self.start_unit_locked(&mut state, cmd.clone(), devices.clone(), true, Vec::new()) {
                        Ok(_) => {
                            if cmd.is_loop_mode() {
                                self.enqueue_loop_iteration(&mut state, &cmd.tracker);
                            }
                            true
                        }
                        Err(e) => {
                            tracing::error!(command_id = cmd.tracker_id(), error = %e, "Failed to start invocation");
                            state.queue.finish(cmd.exec_id);
                            state.queue.push_ready(cmd.clone());
                            false
                        }
                    }
                }
            };

            if launched {
                started += 1;
            } else {
                self.release(&devices);
            }
        }
        started
    }

    fn release(&self, devices: &AllocatedDevices) {
        for device in devices.handles() {
            self.inner.allocator.free(device, FreeDeviceState::Available);
        }
    }

    /// Queue the next iteration of a looping tracker.
    fn enqueue_loop_iteration(&self, state: &mut SchedulerState, tracker: &Arc<CommandTracker>) {
        if state.shutdown || tracker.is_loop_disabled() {
            return;
        }
        match self.inner.factory.create_configuration(tracker.args()) {
            Ok(config) => {
                let delay = config.options.loop_delay();
                let cmd = state.new_exec(tracker.clone(), config, false);
                self.enqueue_after(state, cmd, delay);
            }
            Err(e) => tracing::error!(
                command_id = tracker.id(),
                error = %e,
                "Failed to recreate configuration for looping command"
            ),
        }
    }

    /// Make `cmd` ready after `delay`, sleeping until then.
    fn enqueue_after(&self, state: &mut SchedulerState, mut cmd: ExecutableCommand, delay: Duration) {
        if delay.is_zero() {
            state.queue.push_ready(cmd);
            return;
        }
        let exec_id = cmd.exec_id;
        cmd.sleep_until = chrono::Duration::from_std(delay)
            .ok()
            .map(|d| Utc::now() + d);
        state.queue.push_sleeping(cmd);

        let inner = Arc::downgrade(&self.inner);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let woke = {
                let mut state = inner.state.lock().await;
                state.sleep_timers.remove(&exec_id);
                state.queue.wake(exec_id)
            };
            if woke {
                inner.gate.signal();
            }
        });
        state.sleep_timers.insert(exec_id, timer.abort_handle());
    }

    async fn enqueue_rescheduled(
        &self,
        tracker: &Arc<CommandTracker>,
        config: Configuration,
        delay: Duration,
    ) -> bool {
        {
            let mut state = self.inner.state.lock().await;
            if state.shutdown {
                return false;
            }
            let cmd = state.new_exec(tracker.clone(), config, true);
            self.enqueue_after(&mut state, cmd, delay);
        }
        tracing::info!(command_id = tracker.id(), delay_ms = delay.as_millis() as u64, "Rescheduled command");
        self.inner.gate.signal();
        true
    }

    /// Register and spawn an execution unit. Must be called with the
    /// scheduler lock held; never touches the device pool.
    fn start_unit_locked(
        &self,
        state: &mut SchedulerState,
        cmd: ExecutableCommand,
        devices: AllocatedDevices,
        owns_devices: bool,
        extra_listeners: Vec<Arc<dyn ScheduledInvocationListener>>,
    ) -> Result<Arc<ExecutionUnit>> {
        for unit in state.units.values() {
            if let Some(device) = unit.context().devices().overlaps(&devices) {
                return Err(FleetError::DeviceInUse(device.serial.clone()));
            }
        }

        let invocation_id = cmd.exec_id;
        let context = InvocationContext::new(invocation_id, cmd.tracker_id(), devices);
        let rescheduler: Arc<dyn Rescheduler> = Arc::new(CommandRescheduler {
            inner: Arc::downgrade(&self.inner),
            tracker: cmd.tracker.clone(),
        });
        let unit = Arc::new(ExecutionUnit::new(cmd, context, owns_devices));
        state.units.insert(invocation_id, unit.clone());

        let mut listeners = self.inner.listeners.clone();
        listeners.extend(extra_listeners);
        // Timed-out invocations escalate right away when no window is set.
        let escalation = self.inner.config.stop_escalation().unwrap_or(Duration::ZERO);
        let scheduler = self.clone();
        let task_unit = unit.clone();
        tokio::spawn(async move {
            let outcome = task_unit
                .run(
                    scheduler.inner.executor.clone(),
                    rescheduler,
                    listeners.clone(),
                    escalation,
                )
                .await;
            scheduler
                .complete_invocation(&task_unit, outcome, &listeners)
                .await;
        });
        Ok(unit)
    }

    /// Cleanup once an invocation has ended, whichever way it ended.
    async fn complete_invocation(
        &self,
        unit: &Arc<ExecutionUnit>,
        outcome: InvocationOutcome,
        listeners: &[Arc<dyn ScheduledInvocationListener>],
    ) {
        let invocation_id = unit.invocation_id();
        self.inner.state.lock().await.units.remove(&invocation_id);

        let mut device_states = HashMap::new();
        for device in unit.context().devices().handles() {
            let state = self
                .inner
                .allocator
                .release_state(device, outcome.device_state(&device.serial));
            device_states.insert(device.serial.clone(), state);
        }

        for listener in listeners {
            listener.invocation_complete(unit.context(), &device_states);
        }

        if unit.owns_devices() {
            for device in unit.context().devices().handles() {
                let state = device_states
                    .get(&device.serial)
                    .copied()
                    .unwrap_or(FreeDeviceState::Available);
                self.inner.allocator.free(device, state);
                if !device.is_placeholder() {
                    self.inner.handover.notify_device_freed(&device.serial).await;
                }
            }
        }

        *self
            .inner
            .last_exit_code
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = outcome.exit_code;

        {
            let mut state = self.inner.state.lock().await;
            unit.command().tracker.increment_exec_time(unit.elapsed());
            state.queue.finish(invocation_id);
        }
        self.inner.gate.signal();

        if outcome.is_fatal() {
            tracing::error!(
                invocation_id,
                error = ?outcome.error,
                "Fatal host error, shutting down"
            );
            self.shutdown().await;
        }
    }

    async fn run_health_checks(&self) {
        if self.inner.health_checks.is_empty() {
            return;
        }
        let units: Vec<Arc<ExecutionUnit>> =
            self.inner.state.lock().await.units.values().cloned().collect();
        for unit in units {
            for check in &self.inner.health_checks {
                if let Some(reason) = check.check(unit.context()) {
                    tracing::warn!(
                        invocation_id = unit.invocation_id(),
                        reason = %reason,
                        "Invocation failed health check"
                    );
                    unit.request_stop(&reason, self.inner.config.stop_escalation());
                    break;
                }
            }
        }
    }

    // ===== Lifecycle =====

    /// Spawn the scheduling loop.
    pub fn start(&self) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.run().await })
    }

    /// The scheduling loop. Returns once the scheduler is shut down and
    /// every running invocation has finished.
    pub async fn run(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            tracing::warn!("Scheduler already running");
            return;
        }
        let config = &self.inner.config;
        tracing::info!(poll_interval_ms = config.poll_interval_ms, "Command scheduler started");

        let gate = self.inner.gate.clone();
        self.inner
            .allocator
            .pool()
            .on_availability_changed(Box::new(move |_serial| gate.signal()));

        if config.handover.enabled {
            let handler = Arc::new(SchedulerControlHandler {
                inner: Arc::downgrade(&self.inner),
            });
            if let Err(e) = self.inner.handover.start(handler).await {
                tracing::error!(error = %e, "Failed to start control listener");
            }
        }

        if config.reload_command_files {
            let watcher = self.inner.watcher.clone();
            let cancel = self.inner.shutdown_token.clone();
            let interval = config.command_file_poll_interval();
            tokio::spawn(async move { watcher.run(interval, cancel).await });
        }

        loop {
            self.run_health_checks().await;
            self.run_scheduling_pass().await;
            if self.is_shutdown().await {
                break;
            }
            self.inner.gate.wait_and_reset(config.poll_interval()).await;
            if self.is_shutdown().await {
                break;
            }
        }
        // Covers the exit-on-empty path, where the shutdown flag is not set yet.
        self.shutdown().await;

        tracing::info!("Waiting for running invocations to finish");
        while self.executing_command_count().await > 0 {
            self.inner.gate.wait_and_reset(config.poll_interval()).await;
        }

        self.inner.handover.finish_outgoing().await;
        self.inner.handover.stop();
        if !self.inner.hard_shutdown.load(Ordering::SeqCst) {
            self.inner.allocator.pool().terminate();
        }
        tracing::info!("Command scheduler stopped");
        self.inner.terminated.cancel();
    }

    /// Wait until the scheduling loop has exited.
    pub async fn await_termination(&self) {
        self.inner.terminated.cancelled().await
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.is_cancelled()
    }

    /// Stop accepting commands and drop the pending ones. Running
    /// invocations are left to finish.
    pub async fn shutdown(&self) {
        let first = {
            let mut state = self.inner.state.lock().await;
            let first = !state.shutdown;
            state.shutdown = true;
            let removed = state.queue.clear_pending();
            state.cancel_timers(&removed);
            first
        };
        self.inner.watcher.remove_all_files();
        self.inner.shutdown_token.cancel();
        if first {
            tracing::info!("Command scheduler shutting down");
        }
        self.inner.gate.signal();
    }

    /// Exit once no command is ready, sleeping or executing.
    pub async fn shutdown_on_empty(&self) {
        self.inner.state.lock().await.shutdown_on_empty = true;
        tracing::info!("Command scheduler will shut down when empty");
        self.inner.gate.signal();
    }

    /// Shut down, interrupt every running invocation immediately and tear
    /// the device layer down.
    pub async fn shutdown_hard(&self) {
        self.inner.hard_shutdown.store(true, Ordering::SeqCst);
        self.shutdown().await;
        let units: Vec<Arc<ExecutionUnit>> =
            self.inner.state.lock().await.units.values().cloned().collect();
        tracing::warn!(running = units.len(), "Hard shutdown, interrupting invocations");
        for unit in units {
            unit.request_stop("hard shutdown", Some(Duration::ZERO));
        }
        self.inner.allocator.pool().terminate_hard();
    }

    pub async fn is_shutdown(&self) -> bool {
        self.inner.state.lock().await.is_shutdown()
    }

    pub async fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().await.shutdown
    }

    /// Drop every ready and sleeping command and stop watching command
    /// files. Executing commands are unaffected.
    pub async fn remove_all_commands(&self) {
        {
            let mut state = self.inner.state.lock().await;
            let removed = state.queue.clear_pending();
            state.cancel_timers(&removed);
        }
        self.inner.watcher.remove_all_files();
        tracing::info!("Removed all pending commands");
    }

    /// Request a running invocation to stop.
    pub async fn stop_invocation(&self, invocation_id: u64) -> Result<()> {
        let unit = self
            .inner
            .state
            .lock()
            .await
            .units
            .get(&invocation_id)
            .cloned()
            .ok_or(FleetError::InvocationNotFound(invocation_id))?;
        unit.request_stop("stopped by operator", self.inner.config.stop_escalation());
        Ok(())
    }

    /// Turn loop mode off for every future iteration of a tracker.
    pub async fn set_loop_mode_disabled(&self, tracker_id: u64) -> bool {
        let state = self.inner.state.lock().await;
        let found = match state.queue.commands().find(|c| c.tracker_id() == tracker_id) {
            Some(cmd) => {
                cmd.tracker.disable_loop();
                tracing::info!(command_id = tracker_id, "Loop mode disabled");
                true
            }
            None => false,
        };
        found
    }

    // ===== Introspection =====

    pub async fn ready_command_count(&self) -> usize {
        self.inner.state.lock().await.queue.ready_count()
    }

    pub async fn sleeping_command_count(&self) -> usize {
        self.inner.state.lock().await.queue.sleeping_count()
    }

    pub async fn executing_command_count(&self) -> usize {
        self.inner.state.lock().await.queue.executing_count()
    }

    /// Executing commands first, then ready, then sleeping.
    pub async fn all_commands(&self) -> Vec<CommandSnapshot> {
        self.inner.state.lock().await.queue.all_commands()
    }

    /// Trackers with at least one command in the scheduler, by id.
    pub async fn command_trackers(&self) -> Vec<TrackerSnapshot> {
        let state = self.inner.state.lock().await;
        let trackers: BTreeMap<u64, TrackerSnapshot> = state
            .queue
            .commands()
            .map(|c| (c.tracker_id(), TrackerSnapshot::from(c.tracker.as_ref())))
            .collect();
        trackers.into_values().collect()
    }

    pub async fn invocations(&self) -> Vec<InvocationInfo> {
        let state = self.inner.state.lock().await;
        let mut infos: Vec<InvocationInfo> = state.units.values().map(|u| u.info()).collect();
        infos.sort_by_key(|i| i.invocation_id);
        infos
    }

    pub async fn invocation_info(&self, invocation_id: u64) -> Option<InvocationInfo> {
        self.inner
            .state
            .lock()
            .await
            .units
            .get(&invocation_id)
            .map(|u| u.info())
    }

    pub fn last_invocation_exit_code(&self) -> ExitCode {
        *self
            .inner
            .last_exit_code
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn devices(&self) -> Vec<DeviceDescriptor> {
        self.inner.allocator.pool().list_all()
    }

    pub fn watched_command_files(&self) -> Vec<PathBuf> {
        self.inner.watcher.watched_files()
    }

    // ===== Handover =====

    pub fn handover_state(&self) -> HandoverState {
        self.inner.handover.state()
    }

    /// Address of the running control listener.
    pub fn control_addr(&self) -> Option<SocketAddr> {
        self.inner.handover.bound_addr()
    }

    /// Devices force-allocated on behalf of a previous scheduler.
    pub fn handed_over_device_count(&self) -> usize {
        self.inner.handover.remote_device_count()
    }

    /// Hand every held device to the scheduler listening on `port`, then
    /// shut down gracefully.
    ///
    /// No invocation starts while the devices are reported. Devices this
    /// scheduler holds on behalf of its own predecessor are not passed on.
    /// If the handshake fails the scheduler keeps running and the error is
    /// returned.
    pub async fn handover_shutdown(&self, port: u16) -> Result<()> {
        let held = {
            let mut state = self.inner.state.lock().await;
            if state.shutdown {
                return Err(FleetError::ShutDown);
            }
            if state.handing_over {
                return Err(FleetError::Handover("handover already in progress".to_string()));
            }
            state.handing_over = true;
            state.held_serials()
        };

        if let Err(e) = self.inner.handover.initiate(port, &held).await {
            self.inner.state.lock().await.handing_over = false;
            self.inner.gate.signal();
            return Err(e);
        }
        tracing::info!(port, devices = held.len(), "Handover initiated, shutting down");
        self.shutdown().await;
        Ok(())
    }
}

/// Reschedule hook handed to each invocation.
struct CommandRescheduler {
    inner: Weak<SchedulerInner>,
    tracker: Arc<CommandTracker>,
}

#[async_trait]
impl Rescheduler for CommandRescheduler {
    async fn schedule_config(&self, mut config: Configuration) -> bool {
        let Some(scheduler) = CommandScheduler::from_weak(&self.inner) else {
            return false;
        };
        config.options.loop_mode = false;
        scheduler
            .enqueue_rescheduled(&self.tracker, config, Duration::ZERO)
            .await
    }

    async fn reschedule_command(&self) -> bool {
        let Some(scheduler) = CommandScheduler::from_weak(&self.inner) else {
            return false;
        };
        let config = match scheduler
            .inner
            .factory
            .create_configuration(self.tracker.args())
        {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(command_id = self.tracker.id(), error = %e, "Failed to reschedule command");
                return false;
            }
        };
        let delay = config.options.loop_delay();
        scheduler
            .enqueue_rescheduled(&self.tracker, config, delay)
            .await
    }
}

struct ReloadListener {
    inner: Weak<SchedulerInner>,
}

#[async_trait]
impl CommandFileListener for ReloadListener {
    async fn notify_file_changed(&self, path: &Path, extra_args: &[String]) {
        if let Some(scheduler) = CommandScheduler::from_weak(&self.inner) {
            scheduler.reload_command_file(path, extra_args).await;
        }
    }
}

struct SchedulerControlHandler {
    inner: Weak<SchedulerInner>,
}

#[async_trait]
impl ControlHandler for SchedulerControlHandler {
    async fn handle(&self, message: HandoverMessage) -> HandoverMessage {
        let Some(scheduler) = CommandScheduler::from_weak(&self.inner) else {
            return HandoverMessage::error("scheduler stopped");
        };
        match message {
            HandoverMessage::StartHandover { port } => {
                if scheduler.is_shutting_down().await {
                    return HandoverMessage::error("scheduler is shutting down");
                }
                tracing::info!(port, "Handover requested by new scheduler");
                tokio::spawn(async move {
                    if let Err(e) = scheduler.handover_shutdown(port).await {
                        tracing::error!(port, error = %e, "Handover failed, continuing to run");
                    }
                });
                HandoverMessage::Ack
            }
            HandoverMessage::HandoverComplete => {
                let response = scheduler
                    .inner
                    .handover
                    .handle_incoming(HandoverMessage::HandoverComplete)
                    .await;
                tokio::spawn(async move {
                    if let Err(e) = scheduler.inner.handover.rebind_control_addr().await {
                        tracing::error!(error = %e, "Control address not recovered after handover");
                    }
                });
                response
            }
            other => scheduler.inner.handover.handle_incoming(other).await,
        }
    }
}
