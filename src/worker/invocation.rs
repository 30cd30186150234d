use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::configuration::Configuration;
use crate::device::{AllocatedDevices, DeviceHandle, FreeDeviceState};
use crate::error::InvocationError;

/// Everything an executor gets to see about the invocation it runs.
pub struct InvocationContext {
    invocation_id: u64,
    command_id: u64,
    devices: AllocatedDevices,
    cancel: CancellationToken,
    children: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl InvocationContext {
    pub fn new(invocation_id: u64, command_id: u64, devices: AllocatedDevices) -> Self {
        Self {
            invocation_id,
            command_id,
            devices,
            cancel: CancellationToken::new(),
            children: Mutex::new(Vec::new()),
        }
    }

    pub fn invocation_id(&self) -> u64 {
        self.invocation_id
    }

    /// Id of the tracker this invocation belongs to.
    pub fn command_id(&self) -> u64 {
        self.command_id
    }

    pub fn devices(&self) -> &AllocatedDevices {
        &self.devices
    }

    pub fn serials(&self) -> Vec<String> {
        self.devices.serials()
    }

    pub fn device(&self, name: &str) -> Option<&DeviceHandle> {
        self.devices.get(name)
    }

    pub fn device_by_serial(&self, serial: &str) -> Option<&DeviceHandle> {
        self.devices.by_serial(serial)
    }

    /// True once a stop has been requested. Executors are expected to poll
    /// this (or await [`cancelled`](Self::cancelled)) and return promptly.
    pub fn is_stop_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Spawn a helper task on behalf of the invocation.
    ///
    /// Helpers are tracked so that any still running after the invocation
    /// returns can be reported.
    pub fn spawn_child<F>(&self, name: impl Into<String>, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name.into(), handle));
    }

    /// Names of helper tasks that have not finished yet.
    pub fn stray_children(&self) -> Vec<String> {
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Runs the actual work of a command on its allocated devices.
#[async_trait]
pub trait InvocationExecutor: Send + Sync {
    async fn invoke(
        &self,
        context: Arc<InvocationContext>,
        config: Arc<Configuration>,
        rescheduler: Arc<dyn Rescheduler>,
        listeners: Vec<Arc<dyn ScheduledInvocationListener>>,
    ) -> Result<(), InvocationError>;
}

/// Lets a running invocation put work back on the scheduler.
#[async_trait]
pub trait Rescheduler: Send + Sync {
    /// Enqueue `config` for immediate execution, with loop mode off.
    async fn schedule_config(&self, config: Configuration) -> bool;

    /// Enqueue the invocation's command again after its loop delay.
    async fn reschedule_command(&self) -> bool;
}

/// Observer of invocation lifecycle events.
pub trait ScheduledInvocationListener: Send + Sync {
    fn invocation_initiated(&self, _context: &InvocationContext) {}

    /// Called once per invocation with the health each device is being
    /// released with, keyed by serial.
    fn invocation_complete(
        &self,
        _context: &InvocationContext,
        _device_states: &HashMap<String, FreeDeviceState>,
    ) {
    }
}

/// Periodic check run against every executing invocation. Returning a
/// reason stops the invocation.
pub trait InvocationHealthCheck: Send + Sync {
    fn check(&self, context: &InvocationContext) -> Option<String>;
}
