use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;

use crate::configuration::Configuration;
use crate::error::InvocationError;
use crate::worker::invocation::{
    InvocationContext, InvocationExecutor, Rescheduler, ScheduledInvocationListener,
};

/// Environment variable holding the comma-separated serials of the
/// invocation's devices.
pub const SERIALS_ENV: &str = "FLEET_SERIALS";

/// Runs a command's command line through `sh -c`.
///
/// The configuration name is run when no command line was given. The
/// allocated serials are exported in [`SERIALS_ENV`]. The child process is
/// killed if the invocation is stopped.
#[derive(Debug, Clone)]
pub struct ShellInvocationExecutor {
    shell: String,
}

impl Default for ShellInvocationExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellInvocationExecutor {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }

    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    fn command_text(config: &Configuration) -> String {
        if config.command_line.is_empty() {
            config.name.clone()
        } else {
            config.command_line.join(" ")
        }
    }

    fn process_output(
        invocation_id: u64,
        result: Result<std::process::Output, std::io::Error>,
    ) -> Result<(), InvocationError> {
        match result {
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                let exit_code = output.status.code();

                tracing::debug!(
                    invocation_id,
                    stdout_bytes = output.stdout.len(),
                    stderr_bytes = output.stderr.len(),
                    "Captured command output"
                );

                if output.status.success() {
                    tracing::info!(invocation_id, exit_code = ?exit_code, "Command completed");
                    Ok(())
                } else {
                    tracing::info!(invocation_id, exit_code = ?exit_code, "Command failed");
                    Err(InvocationError::Failed(if stderr.trim().is_empty() {
                        format!("Exit code: {:?}", exit_code)
                    } else {
                        stderr.trim().to_string()
                    }))
                }
            }
            Err(e) => {
                tracing::error!(invocation_id, error = %e, "Command execution failed");
                Err(InvocationError::Failed(e.to_string()))
            }
        }
    }
}

#[async_trait]
impl InvocationExecutor for ShellInvocationExecutor {
    async fn invoke(
        &self,
        context: Arc<InvocationContext>,
        config: Arc<Configuration>,
        _rescheduler: Arc<dyn Rescheduler>,
        _listeners: Vec<Arc<dyn ScheduledInvocationListener>>,
    ) -> Result<(), InvocationError> {
        let command = Self::command_text(&config);
        let invocation_id = context.invocation_id();
        tracing::info!(invocation_id, command = %command, "Executing command");

        let child = Command::new(&self.shell)
            .arg("-c")
            .arg(&command)
            .env(SERIALS_ENV, context.serials().join(","))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => return Self::process_output(invocation_id, Err(e)),
        };

        tokio::select! {
            result = child.wait_with_output() => Self::process_output(invocation_id, result),
            _ = context.cancelled() => {
                // Dropping the output future kills the child.
                tracing::info!(invocation_id, "Command stopped");
                Err(InvocationError::Failed("stopped".to_string()))
            }
        }
    }
}
