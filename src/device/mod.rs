//! Device model and the pool seam the scheduler allocates from.
//!
//! The scheduler never owns devices. It borrows [`DeviceHandle`]s from a
//! [`DevicePool`] for the lifetime of one execution unit and hands them back
//! with a [`FreeDeviceState`] describing how the device looked at the end.
//!
//! # Components
//!
//! - [`DevicePool`]: the external device manager contract
//! - [`LocalDevicePool`]: in-memory pool used by the binary and tests
//! - [`DeviceAllocator`]: all-or-nothing multi-device allocation

pub mod allocator;
pub mod pool;

use serde::Serialize;

pub use allocator::{AllocatedDevices, DeviceAllocator};
pub use pool::LocalDevicePool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Physical,
    /// Stands in for a device slot without real hardware behind it.
    Placeholder,
}

/// Borrowed reference to a pool device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    pub serial: String,
    pub kind: DeviceKind,
}

impl DeviceHandle {
    pub fn physical(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            kind: DeviceKind::Physical,
        }
    }

    pub fn placeholder(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            kind: DeviceKind::Placeholder,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.kind == DeviceKind::Placeholder
    }
}

/// Health a device is returned to the pool with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FreeDeviceState {
    Available,
    Unavailable,
    Unresponsive,
}

impl std::fmt::Display for FreeDeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FreeDeviceState::Available => write!(f, "available"),
            FreeDeviceState::Unavailable => write!(f, "unavailable"),
            FreeDeviceState::Unresponsive => write!(f, "unresponsive"),
        }
    }
}

/// Allocation state as reported by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceAllocationState {
    Available,
    Allocated,
    Unavailable,
}

impl std::fmt::Display for DeviceAllocationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceAllocationState::Available => write!(f, "available"),
            DeviceAllocationState::Allocated => write!(f, "allocated"),
            DeviceAllocationState::Unavailable => write!(f, "unavailable"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor {
    pub serial: String,
    pub product: Option<String>,
    pub state: DeviceAllocationState,
    pub placeholder: bool,
}

/// Declarative constraints a device must satisfy to be allocated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceRequirement {
    pub serial: Option<String>,
    pub product: Option<String>,
    /// Accept placeholder devices instead of physical ones.
    pub placeholder: bool,
}

impl DeviceRequirement {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn with_serial(serial: impl Into<String>) -> Self {
        Self {
            serial: Some(serial.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, descriptor: &DeviceDescriptor) -> bool {
        if self.placeholder != descriptor.placeholder {
            return false;
        }
        if let Some(ref serial) = self.serial {
            if serial != &descriptor.serial {
                return false;
            }
        }
        if let Some(ref product) = self.product {
            if descriptor.product.as_ref() != Some(product) {
                return false;
            }
        }
        true
    }
}

/// Callback fired by the pool when a device becomes available.
pub type AvailabilityCallback = Box<dyn Fn(&str) + Send + Sync>;

/// External device manager contract.
///
/// Implementations own and lock their internal state themselves. The
/// scheduler never calls into the pool while holding its own lock.
pub trait DevicePool: Send + Sync {
    /// Allocate one device matching `requirement`, if any is available.
    fn allocate(&self, requirement: &DeviceRequirement) -> Option<DeviceHandle>;

    /// Mark a device allocated regardless of its current state. Used when a
    /// sibling scheduler reports it still holds the device.
    fn force_allocate(&self, serial: &str) -> Option<DeviceHandle>;

    /// Return a device to the pool.
    fn free(&self, device: &DeviceHandle, state: FreeDeviceState);

    fn list_all(&self) -> Vec<DeviceDescriptor>;

    /// Register a callback fired whenever a device becomes available.
    fn on_availability_changed(&self, callback: AvailabilityCallback);

    /// Whether the device is still connected.
    fn is_online(&self, _device: &DeviceHandle) -> bool {
        true
    }

    /// Basic responsiveness probe run at the end of an invocation.
    fn is_responsive(&self, _device: &DeviceHandle) -> bool {
        true
    }

    /// Stop device monitoring and release pool resources.
    fn terminate(&self) {}

    /// Tear the device layer down immediately.
    fn terminate_hard(&self) {
        self.terminate();
    }
}
