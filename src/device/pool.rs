use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{
    AvailabilityCallback, DeviceAllocationState, DeviceDescriptor, DeviceHandle, DeviceKind,
    DevicePool, DeviceRequirement, FreeDeviceState,
};

#[derive(Debug, Clone)]
struct LocalDevice {
    serial: String,
    product: Option<String>,
    kind: DeviceKind,
    state: DeviceAllocationState,
    online: bool,
    responsive: bool,
    last_free_state: Option<FreeDeviceState>,
}

impl LocalDevice {
    fn descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor {
            serial: self.serial.clone(),
            product: self.product.clone(),
            state: self.state,
            placeholder: self.kind == DeviceKind::Placeholder,
        }
    }

    fn handle(&self) -> DeviceHandle {
        DeviceHandle {
            serial: self.serial.clone(),
            kind: self.kind,
        }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    /// Devices in discovery order, which is also allocation preference order.
    devices: Vec<LocalDevice>,
    terminated: bool,
}

impl PoolState {
    fn find_mut(&mut self, serial: &str) -> Option<&mut LocalDevice> {
        self.devices.iter_mut().find(|d| d.serial == serial)
    }
}

/// In-memory device pool.
///
/// Devices are registered explicitly (physical serials, or numbered
/// placeholders). Health flags can be flipped to simulate a device dropping
/// offline or failing the end-of-run probe.
#[derive(Default)]
pub struct LocalDevicePool {
    state: Mutex<PoolState>,
    callbacks: Mutex<Vec<AvailabilityCallback>>,
}

impl LocalDevicePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pool with one available physical device per serial.
    pub fn with_devices<S: AsRef<str>>(serials: &[S]) -> Self {
        let pool = Self::new();
        for serial in serials {
            pool.add_device(serial.as_ref(), None);
        }
        pool
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a physical device as available.
    pub fn add_device(&self, serial: &str, product: Option<&str>) {
        self.insert(LocalDevice {
            serial: serial.to_string(),
            product: product.map(str::to_string),
            kind: DeviceKind::Physical,
            state: DeviceAllocationState::Available,
            online: true,
            responsive: true,
            last_free_state: None,
        });
    }

    /// Register `count` placeholder devices named `null-device-N`.
    pub fn add_placeholder_devices(&self, count: usize) {
        for i in 0..count {
            self.insert(LocalDevice {
                serial: format!("null-device-{}", i),
                product: None,
                kind: DeviceKind::Placeholder,
                state: DeviceAllocationState::Available,
                online: true,
                responsive: true,
                last_free_state: None,
            });
        }
    }

    fn insert(&self, device: LocalDevice) {
        let serial = device.serial.clone();
        {
            let mut state = self.lock();
            if state.find_mut(&serial).is_some() {
                tracing::warn!(serial = %serial, "Device already registered");
                return;
            }
            state.devices.push(device);
        }
        tracing::debug!(serial = %serial, "Device added to pool");
        self.notify_available(&serial);
    }

    pub fn set_online(&self, serial: &str, online: bool) {
        if let Some(device) = self.lock().find_mut(serial) {
            device.online = online;
        }
    }

    pub fn set_responsive(&self, serial: &str, responsive: bool) {
        if let Some(device) = self.lock().find_mut(serial) {
            device.responsive = responsive;
        }
    }

    /// Make an unavailable device available again, as a recovery would.
    pub fn recover(&self, serial: &str) {
        let recovered = match self.lock().find_mut(serial) {
            Some(device) if device.state == DeviceAllocationState::Unavailable => {
                device.state = DeviceAllocationState::Available;
                device.online = true;
                device.responsive = true;
                true
            }
            _ => false,
        };
        if recovered {
            self.notify_available(serial);
        }
    }

    pub fn state_of(&self, serial: &str) -> Option<DeviceAllocationState> {
        self.lock()
            .devices
            .iter()
            .find(|d| d.serial == serial)
            .map(|d| d.state)
    }

    /// Health the device was last returned with.
    pub fn last_free_state(&self, serial: &str) -> Option<FreeDeviceState> {
        self.lock()
            .devices
            .iter()
            .find(|d| d.serial == serial)
            .and_then(|d| d.last_free_state)
    }

    pub fn available_count(&self) -> usize {
        self.lock()
            .devices
            .iter()
            .filter(|d| d.state == DeviceAllocationState::Available)
            .count()
    }

    pub fn is_terminated(&self) -> bool {
        self.lock().terminated
    }

    fn notify_available(&self, serial: &str) {
        let callbacks = self.callbacks.lock().unwrap_or_else(PoisonError::into_inner);
        for callback in callbacks.iter() {
            callback(serial);
        }
    }
}

impl DevicePool for LocalDevicePool {
    fn allocate(&self, requirement: &DeviceRequirement) -> Option<DeviceHandle> {
        let mut state = self.lock();
        if state.terminated {
            return None;
        }
        let device = state.devices.iter_mut().find(|d| {
            d.state == DeviceAllocationState::Available && requirement.matches(&d.descriptor())
        })?;
        device.state = DeviceAllocationState::Allocated;
        tracing::debug!(serial = %device.serial, "Device allocated");
        Some(device.handle())
    }

    fn force_allocate(&self, serial: &str) -> Option<DeviceHandle> {
        let mut state = self.lock();
        if state.terminated {
            return None;
        }
        if let Some(device) = state.find_mut(serial) {
            device.state = DeviceAllocationState::Allocated;
            return Some(device.handle());
        }
        // Unknown to us yet, but the sibling holds it: track it as allocated.
        let device = LocalDevice {
            serial: serial.to_string(),
            product: None,
            kind: DeviceKind::Physical,
            state: DeviceAllocationState::Allocated,
            online: true,
            responsive: true,
            last_free_state: None,
        };
        let handle = device.handle();
        state.devices.push(device);
        Some(handle)
    }

    fn free(&self, device: &DeviceHandle, free_state: FreeDeviceState) {
        let became_available = {
            let mut state = self.lock();
            let Some(entry) = state.find_mut(&device.serial) else {
                tracing::warn!(serial = %device.serial, "Freeing unknown device");
                return;
            };
            if entry.state != DeviceAllocationState::Allocated {
                tracing::error!(
                    serial = %device.serial,
                    state = %entry.state,
                    "Device was in unexpected state when freeing"
                );
            }
            entry.last_free_state = Some(free_state);
            entry.state = if entry.kind == DeviceKind::Placeholder
                || free_state == FreeDeviceState::Available
            {
                DeviceAllocationState::Available
            } else {
                DeviceAllocationState::Unavailable
            };
            entry.state == DeviceAllocationState::Available
        };
        tracing::debug!(serial = %device.serial, state = %free_state, "Device freed");
        if became_available {
            self.notify_available(&device.serial);
        }
    }

    fn list_all(&self) -> Vec<DeviceDescriptor> {
        self.lock().devices.iter().map(LocalDevice::descriptor).collect()
    }

    fn on_availability_changed(&self, callback: AvailabilityCallback) {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    fn is_online(&self, device: &DeviceHandle) -> bool {
        self.lock()
            .devices
            .iter()
            .find(|d| d.serial == device.serial)
            .map(|d| d.online)
            .unwrap_or(false)
    }

    fn is_responsive(&self, device: &DeviceHandle) -> bool {
        self.lock()
            .devices
            .iter()
            .find(|d| d.serial == device.serial)
            .map(|d| d.responsive)
            .unwrap_or(false)
    }

    fn terminate(&self) {
        self.lock().terminated = true;
        tracing::info!("Device pool terminated");
    }

    fn terminate_hard(&self) {
        let mut state = self.lock();
        state.terminated = true;
        for device in state.devices.iter_mut() {
            if device.state == DeviceAllocationState::Allocated {
                device.state = DeviceAllocationState::Unavailable;
            }
        }
        tracing::warn!("Device pool terminated hard");
    }
}

/// Count of devices per allocation state, for status displays.
pub fn summarize(descriptors: &[DeviceDescriptor]) -> HashMap<DeviceAllocationState, usize> {
    let mut summary = HashMap::new();
    for descriptor in descriptors {
        *summary.entry(descriptor.state).or_insert(0) += 1;
    }
    summary
}
