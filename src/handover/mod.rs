//! Handing a running fleet over to a freshly started scheduler.
//!
//! The scheduler that owns the control address manages the devices. A new
//! scheduler that finds the address taken binds a temporary port and sends
//! `start_handover` to the owner. The owner then connects back, reports every
//! device it still holds, shuts down gracefully, reports each device as its
//! invocation finishes, and finally sends `handover_complete`. The new
//! scheduler then takes the control address over.
//!
//! # Components
//!
//! - [`HandoverMessage`]: newline-delimited JSON protocol
//! - [`HandoverClient`]: request/response client with per-request timeout
//! - [`ControlServer`]: control listener dispatching to a [`ControlHandler`]
//! - [`HandoverCoordinator`]: the handover state machine on either side

pub mod client;
pub mod coordinator;
pub mod protocol;
pub mod server;

pub use client::HandoverClient;
pub use coordinator::{HandoverCoordinator, HandoverState};
pub use protocol::HandoverMessage;
pub use server::{ControlHandler, ControlServer};
