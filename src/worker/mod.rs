//! Execution of scheduled commands.
//!
//! Each command the scheduler dispatches runs inside an [`ExecutionUnit`],
//! which owns one invocation task and everything needed to stop it.
//!
//! # Components
//!
//! - [`InvocationExecutor`]: the seam that does the actual work
//! - [`ExecutionUnit`]: timeout, cooperative stop and forced abort around one invocation
//! - [`ShellInvocationExecutor`]: runs the command line through `sh -c`
//!
//! # Execution Flow
//!
//! 1. The scheduler allocates devices and builds an [`InvocationContext`]
//! 2. [`ExecutionUnit::run`] spawns [`InvocationExecutor::invoke`]
//! 3. The invocation returns, times out, or is stopped
//! 4. The returned [`InvocationOutcome`] tells the scheduler how to release
//!    each device

pub mod executor;
pub mod invocation;
pub mod unit;

pub use executor::ShellInvocationExecutor;
pub use invocation::{
    InvocationContext, InvocationExecutor, InvocationHealthCheck, Rescheduler,
    ScheduledInvocationListener,
};
pub use unit::{ExecutionUnit, InvocationInfo, InvocationOutcome};
