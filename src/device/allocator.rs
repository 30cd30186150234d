use std::sync::Arc;

use super::{DeviceHandle, DevicePool, FreeDeviceState};
use crate::configuration::DeviceConfig;

/// Devices allocated for one command, in the order its device slots were
/// declared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocatedDevices {
    devices: Vec<(String, DeviceHandle)>,
}

impl AllocatedDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(name: impl Into<String>, device: DeviceHandle) -> Self {
        Self {
            devices: vec![(name.into(), device)],
        }
    }

    pub fn push(&mut self, name: impl Into<String>, device: DeviceHandle) {
        self.devices.push((name.into(), device));
    }

    pub fn get(&self, name: &str) -> Option<&DeviceHandle> {
        self.devices
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, device)| device)
    }

    pub fn by_serial(&self, serial: &str) -> Option<&DeviceHandle> {
        self.handles().find(|device| device.serial == serial)
    }

    pub fn handles(&self) -> impl Iterator<Item = &DeviceHandle> {
        self.devices.iter().map(|(_, device)| device)
    }

    pub fn serials(&self) -> Vec<String> {
        self.handles().map(|device| device.serial.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DeviceHandle)> {
        self.devices.iter().map(|(name, device)| (name.as_str(), device))
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// True if any device appears in both sets.
    pub fn overlaps(&self, other: &AllocatedDevices) -> Option<&DeviceHandle> {
        self.handles().find(|device| other.by_serial(&device.serial).is_some())
    }
}

/// All-or-nothing device allocation on top of a [`DevicePool`].
#[derive(Clone)]
pub struct DeviceAllocator {
    pool: Arc<dyn DevicePool>,
}

impl DeviceAllocator {
    pub fn new(pool: Arc<dyn DevicePool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<dyn DevicePool> {
        &self.pool
    }

    /// Allocate a device for every slot, or none at all.
    ///
    /// Slots are tried in declared order. If one cannot be satisfied, every
    /// device taken so far in this attempt goes back to the pool, so a
    /// multi-device command never sits on a partial set while waiting.
    pub fn allocate(&self, device_configs: &[DeviceConfig]) -> Option<AllocatedDevices> {
        if device_configs.is_empty() {
            return None;
        }
        let mut allocated = AllocatedDevices::new();
        for device_config in device_configs {
            match self.pool.allocate(&device_config.requirement) {
                Some(device) => allocated.push(device_config.name.clone(), device),
                None => {
                    if !allocated.is_empty() {
                        tracing::debug!(
                            slot = %device_config.name,
                            released = allocated.len(),
                            "Partial device allocation, releasing devices"
                        );
                    }
                    for device in allocated.handles() {
                        let state = self.rollback_state(device);
                        self.pool.free(device, state);
                    }
                    return None;
                }
            }
        }
        Some(allocated)
    }

    /// Return a device to the pool.
    pub fn free(&self, device: &DeviceHandle, state: FreeDeviceState) {
        self.pool.free(device, state);
    }

    /// Health a device should be released with at the end of an invocation.
    ///
    /// Placeholders always go back available. A physical device that went
    /// offline, or fails the responsiveness probe, goes back unavailable.
    /// Otherwise `prior` (what the invocation reported) stands.
    pub fn release_state(&self, device: &DeviceHandle, prior: FreeDeviceState) -> FreeDeviceState {
        if device.is_placeholder() {
            FreeDeviceState::Available
        } else if !self.pool.is_online(device) {
            tracing::info!(serial = %device.serial, "Device offline at end of invocation");
            FreeDeviceState::Unavailable
        } else if !self.pool.is_responsive(device) {
            tracing::info!(serial = %device.serial, "Device failed responsiveness check");
            FreeDeviceState::Unavailable
        } else {
            prior
        }
    }

    fn rollback_state(&self, device: &DeviceHandle) -> FreeDeviceState {
        if !device.is_placeholder() && !self.pool.is_online(device) {
            FreeDeviceState::Unavailable
        } else {
            FreeDeviceState::Available
        }
    }
}
