use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::{AbortHandle, JoinError};

use crate::device::FreeDeviceState;
use crate::error::{ExitCode, InvocationError};
use crate::scheduler::command::ExecutableCommand;
use crate::worker::invocation::{
    InvocationContext, InvocationExecutor, Rescheduler, ScheduledInvocationListener,
};

/// How an invocation ended, before end-of-run device probes.
#[derive(Debug, Clone)]
pub struct InvocationOutcome {
    pub exit_code: ExitCode,
    /// Health reported for specific devices, keyed by serial. Devices not
    /// listed are treated as available.
    pub device_states: HashMap<String, FreeDeviceState>,
    pub error: Option<String>,
}

impl InvocationOutcome {
    fn success() -> Self {
        Self {
            exit_code: ExitCode::NoError,
            device_states: HashMap::new(),
            error: None,
        }
    }

    fn failure(exit_code: ExitCode, error: String) -> Self {
        Self {
            exit_code,
            device_states: HashMap::new(),
            error: Some(error),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.exit_code == ExitCode::FatalHostError
    }

    pub fn device_state(&self, serial: &str) -> FreeDeviceState {
        self.device_states
            .get(serial)
            .copied()
            .unwrap_or(FreeDeviceState::Available)
    }

    fn from_result(
        result: Result<Result<(), InvocationError>, JoinError>,
        stop_reason: Option<String>,
    ) -> Self {
        match result {
            Ok(Ok(())) => Self::success(),
            Ok(Err(e)) => {
                let message = e.to_string();
                match e {
                    InvocationError::DeviceUnavailable { serial, .. } => {
                        let mut outcome = Self::failure(ExitCode::DeviceUnavailable, message);
                        outcome
                            .device_states
                            .insert(serial, FreeDeviceState::Unavailable);
                        outcome
                    }
                    InvocationError::DeviceUnresponsive { serial, .. } => {
                        let mut outcome = Self::failure(ExitCode::DeviceUnresponsive, message);
                        outcome
                            .device_states
                            .insert(serial, FreeDeviceState::Unresponsive);
                        outcome
                    }
                    InvocationError::FatalHost(_) => Self::failure(ExitCode::FatalHostError, message),
                    InvocationError::Failed(_) => {
                        Self::failure(ExitCode::ThrowableException, message)
                    }
                }
            }
            Err(e) if e.is_cancelled() => Self::failure(
                ExitCode::ThrowableException,
                format!(
                    "Invocation interrupted: {}",
                    stop_reason.unwrap_or_else(|| "aborted".to_string())
                ),
            ),
            Err(e) => Self::failure(ExitCode::ThrowableException, format!("Invocation panicked: {}", e)),
        }
    }
}

/// Externally visible view of a running invocation.
#[derive(Debug, Clone, Serialize)]
pub struct InvocationInfo {
    pub invocation_id: u64,
    pub command_id: u64,
    pub name: String,
    pub serials: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub stop_requested: bool,
}

/// Abort handle of the invocation task, plus a forced stop requested before
/// the task existed.
#[derive(Default)]
struct AbortSlot {
    handle: Option<AbortHandle>,
    pending: Option<Duration>,
}

/// One running command bound to its devices.
///
/// The unit owns the invocation task. It enforces the invocation timeout,
/// relays stop requests and classifies how the invocation ended. Releasing
/// devices and bookkeeping are done by the scheduler once [`run`](Self::run)
/// returns.
pub struct ExecutionUnit {
    command: ExecutableCommand,
    context: Arc<InvocationContext>,
    started: Instant,
    started_at: DateTime<Utc>,
    abort: Mutex<AbortSlot>,
    stop_reason: Mutex<Option<String>>,
    owns_devices: bool,
}

impl ExecutionUnit {
    /// `owns_devices` is false when the caller supplied the devices and keeps
    /// ownership of them.
    pub fn new(command: ExecutableCommand, context: InvocationContext, owns_devices: bool) -> Self {
        Self {
            command,
            context: Arc::new(context),
            started: Instant::now(),
            started_at: Utc::now(),
            abort: Mutex::new(AbortSlot::default()),
            stop_reason: Mutex::new(None),
            owns_devices,
        }
    }

    pub fn invocation_id(&self) -> u64 {
        self.context.invocation_id()
    }

    pub fn command(&self) -> &ExecutableCommand {
        &self.command
    }

    pub fn context(&self) -> &Arc<InvocationContext> {
        &self.context
    }

    pub fn owns_devices(&self) -> bool {
        self.owns_devices
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn info(&self) -> InvocationInfo {
        InvocationInfo {
            invocation_id: self.invocation_id(),
            command_id: self.command.tracker_id(),
            name: self.command.command_name().to_string(),
            serials: self.context.serials(),
            started_at: self.started_at,
            elapsed_ms: u64::try_from(self.elapsed().as_millis()).unwrap_or(u64::MAX),
            stop_requested: self.context.is_stop_requested(),
        }
    }

    /// Ask the invocation to stop.
    ///
    /// The invocation's cancellation token fires right away. With an
    /// escalation window the invocation task is aborted once the window
    /// passes, whether or not it honoured the request.
    pub fn request_stop(&self, reason: &str, escalation: Option<Duration>) {
        {
            let mut stop_reason = self.stop_reason.lock().unwrap_or_else(PoisonError::into_inner);
            if stop_reason.is_none() {
                *stop_reason = Some(reason.to_string());
            }
        }
        tracing::info!(
            invocation_id = self.invocation_id(),
            reason,
            "Stopping invocation"
        );
        self.context.cancel_token().cancel();

        let Some(window) = escalation else {
            return;
        };
        let handle = {
            let mut slot = self.abort_slot();
            match slot.handle {
                Some(ref handle) => handle.clone(),
                None => {
                    // Not spawned yet: `run` applies the shortest window once it is.
                    slot.pending = Some(slot.pending.map_or(window, |p| p.min(window)));
                    return;
                }
            }
        };
        self.escalate(handle, window);
    }

    fn abort_slot(&self) -> MutexGuard<'_, AbortSlot> {
        self.abort.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Abort the invocation task once `window` has passed.
    fn escalate(&self, handle: AbortHandle, window: Duration) {
        if window.is_zero() {
            handle.abort();
            return;
        }
        let invocation_id = self.invocation_id();
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if !handle.is_finished() {
                tracing::warn!(invocation_id, "Invocation ignored stop request, aborting");
                handle.abort();
            }
        });
    }

    fn stop_reason(&self) -> Option<String> {
        self.stop_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run the invocation to completion.
    ///
    /// `timeout_escalation` is how long a timed-out invocation gets to honour
    /// cancellation before it is aborted.
    pub async fn run(
        &self,
        executor: Arc<dyn InvocationExecutor>,
        rescheduler: Arc<dyn Rescheduler>,
        listeners: Vec<Arc<dyn ScheduledInvocationListener>>,
        timeout_escalation: Duration,
    ) -> InvocationOutcome {
        for listener in &listeners {
            listener.invocation_initiated(&self.context);
        }

        tracing::info!(
            invocation_id = self.invocation_id(),
            command_id = self.command.tracker_id(),
            name = %self.command.command_name(),
            serials = ?self.context.serials(),
            "Starting invocation"
        );

        let context = self.context.clone();
        let config = self.command.config.clone();
        let mut handle = tokio::spawn(async move {
            executor
                .invoke(context, config, rescheduler, listeners)
                .await
        });
        let pending = {
            let mut slot = self.abort_slot();
            slot.handle = Some(handle.abort_handle());
            slot.pending.take()
        };
        if let Some(window) = pending {
            self.escalate(handle.abort_handle(), window);
        }

        let result = match self.command.config.options.invocation_timeout() {
            Some(timeout) => {
                tokio::select! {
                    result = &mut handle => result,
                    _ = tokio::time::sleep(timeout) => {
                        tracing::warn!(
                            invocation_id = self.invocation_id(),
                            timeout_ms = self.command.config.options.invocation_timeout_ms,
                            "Invocation timed out"
                        );
                        self.request_stop("invocation timeout", Some(timeout_escalation));
                        handle.await
                    }
                }
            }
            None => handle.await,
        };

        let outcome = InvocationOutcome::from_result(result, self.stop_reason());

        let strays = self.context.stray_children();
        if !strays.is_empty() {
            tracing::error!(
                invocation_id = self.invocation_id(),
                children = ?strays,
                "Invocation finished with helper tasks still running"
            );
        }

        match outcome.error {
            Some(ref error) => tracing::warn!(
                invocation_id = self.invocation_id(),
                exit_code = %outcome.exit_code,
                error = %error,
                elapsed_ms = self.elapsed().as_millis() as u64,
                "Invocation finished with error"
            ),
            None => tracing::info!(
                invocation_id = self.invocation_id(),
                elapsed_ms = self.elapsed().as_millis() as u64,
                "Invocation completed"
            ),
        }
        outcome
    }
}
