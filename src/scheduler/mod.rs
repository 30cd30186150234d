//! Command scheduling.
//!
//! # Components
//!
//! - [`CommandScheduler`]: the scheduling loop and public command API
//! - [`CommandQueue`]: ready, sleeping and executing command sets
//! - [`CommandTracker`] / [`ExecutableCommand`]: a command and one attempt at running it
//! - [`WakeGate`]: wakes the loop early when something changes

pub mod command;
pub mod core;
pub mod queue;
pub mod wake;

pub use self::core::{CommandScheduler, SchedulerBuilder};
pub use command::{CommandSnapshot, CommandState, CommandTracker, ExecutableCommand, TrackerSnapshot};
pub use queue::CommandQueue;
pub use wake::WakeGate;
