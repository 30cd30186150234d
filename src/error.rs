use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Scheduler is shutting down, command rejected")]
    ShutDown,

    #[error("No device available for command: {0}")]
    NoDeviceAvailable(String),

    #[error("Attempting invocation on device {0} when one is already running")]
    DeviceInUse(String),

    #[error("Invocation not found: {0}")]
    InvocationNotFound(u64),

    #[error("Failed to read command file {path}: {source}")]
    CommandFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to add command '{command}': {source}")]
    CommandLine {
        command: String,
        #[source]
        source: ConfigError,
    },

    #[error("Command file dependency cycle through {0}")]
    DependencyCycle(PathBuf),

    #[error("Handover error: {0}")]
    Handover(String),

    #[error("Handover handshake timed out after {0:?}")]
    HandoverTimeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FleetError>;

/// Raised while turning an argument vector into a runnable configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("No configuration name provided")]
    MissingName,

    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("{0} serials given for {1} devices")]
    SerialMismatch(usize, usize),

    #[error("{0}")]
    Unsupported(String),
}

/// Failure categories an invocation executor may report.
///
/// Device-level variants identify the device by serial so that the execution
/// unit can release it with the matching health state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvocationError {
    #[error("Device {serial} is not available: {reason}")]
    DeviceUnavailable { serial: String, reason: String },

    #[error("Device {serial} is unresponsive: {reason}")]
    DeviceUnresponsive { serial: String, reason: String },

    #[error("Fatal host error: {0}")]
    FatalHost(String),

    #[error("Invocation failed: {0}")]
    Failed(String),
}

/// Exit status of the most recent invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitCode {
    #[default]
    NoError,
    DeviceUnresponsive,
    DeviceUnavailable,
    FatalHostError,
    ThrowableException,
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitCode::NoError => write!(f, "no_error"),
            ExitCode::DeviceUnresponsive => write!(f, "device_unresponsive"),
            ExitCode::DeviceUnavailable => write!(f, "device_unavailable"),
            ExitCode::FatalHostError => write!(f, "fatal_host_error"),
            ExitCode::ThrowableException => write!(f, "throwable_exception"),
        }
    }
}
