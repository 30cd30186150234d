use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::configuration::Configuration;

/// Long-lived record of a command the user added.
///
/// Survives every execution attempt and accumulates total execution time,
/// which is the fairness key: the tracker that has run least goes first.
#[derive(Debug)]
pub struct CommandTracker {
    id: u64,
    args: Vec<String>,
    source_file: Option<PathBuf>,
    exec_time_ms: AtomicU64,
    loop_disabled: AtomicBool,
}

impl CommandTracker {
    pub fn new(id: u64, args: Vec<String>, source_file: Option<PathBuf>) -> Self {
        Self {
            id,
            args,
            source_file,
            exec_time_ms: AtomicU64::new(0),
            loop_disabled: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn source_file(&self) -> Option<&Path> {
        self.source_file.as_deref()
    }

    pub fn is_from_file(&self, path: &Path) -> bool {
        self.source_file.as_deref() == Some(path)
    }

    /// Cumulative execution time, in milliseconds.
    pub fn total_exec_time_ms(&self) -> u64 {
        self.exec_time_ms.load(Ordering::SeqCst)
    }

    /// Add to the cumulative execution time. Only the scheduler calls this,
    /// under its lock.
    pub fn increment_exec_time(&self, elapsed: Duration) {
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.exec_time_ms.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn is_loop_disabled(&self) -> bool {
        self.loop_disabled.load(Ordering::SeqCst)
    }

    pub fn disable_loop(&self) {
        self.loop_disabled.store(true, Ordering::SeqCst);
    }
}

/// A single scheduled attempt of a tracker.
#[derive(Debug, Clone)]
pub struct ExecutableCommand {
    pub exec_id: u64,
    pub tracker: Arc<CommandTracker>,
    pub config: Arc<Configuration>,
    /// Created by the executor through the reschedule API.
    pub rescheduled: bool,
    pub created_at: DateTime<Utc>,
    /// Set while the command is sleeping before its next loop iteration.
    pub sleep_until: Option<DateTime<Utc>>,
}

impl ExecutableCommand {
    pub fn new(
        exec_id: u64,
        tracker: Arc<CommandTracker>,
        config: Configuration,
        rescheduled: bool,
    ) -> Self {
        Self {
            exec_id,
            tracker,
            config: Arc::new(config),
            rescheduled,
            created_at: Utc::now(),
            sleep_until: None,
        }
    }

    pub fn tracker_id(&self) -> u64 {
        self.tracker.id()
    }

    pub fn command_name(&self) -> &str {
        &self.config.name
    }

    /// Loop mode as configured, unless turned off for the tracker.
    pub fn is_loop_mode(&self) -> bool {
        self.config.is_loop_mode() && !self.tracker.is_loop_disabled()
    }

    /// Ordering key used by each scheduling pass.
    pub fn priority_key(&self) -> (u64, u64) {
        (self.tracker.total_exec_time_ms(), self.tracker.id())
    }

    pub fn snapshot(&self, state: CommandState) -> CommandSnapshot {
        CommandSnapshot {
            exec_id: self.exec_id,
            tracker_id: self.tracker.id(),
            name: self.config.name.clone(),
            args: self.tracker.args().to_vec(),
            state,
            total_exec_time_ms: self.tracker.total_exec_time_ms(),
            created_at: self.created_at,
            sleep_until: self.sleep_until,
            rescheduled: self.rescheduled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    WaitingForDevice,
    Sleeping,
    Executing,
}

impl std::fmt::Display for CommandState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandState::WaitingForDevice => write!(f, "Wait_for_device"),
            CommandState::Sleeping => write!(f, "Sleeping"),
            CommandState::Executing => write!(f, "Executing"),
        }
    }
}

/// Point-in-time view of one executable command.
#[derive(Debug, Clone, Serialize)]
pub struct CommandSnapshot {
    pub exec_id: u64,
    pub tracker_id: u64,
    pub name: String,
    pub args: Vec<String>,
    pub state: CommandState,
    pub total_exec_time_ms: u64,
    pub created_at: DateTime<Utc>,
    pub sleep_until: Option<DateTime<Utc>>,
    /// Created by the invocation itself rather than by the loop.
    pub rescheduled: bool,
}

/// Point-in-time view of a tracker.
#[derive(Debug, Clone, Serialize)]
pub struct TrackerSnapshot {
    pub id: u64,
    pub args: Vec<String>,
    pub source_file: Option<PathBuf>,
    pub total_exec_time_ms: u64,
    pub loop_disabled: bool,
}

impl From<&CommandTracker> for TrackerSnapshot {
    fn from(tracker: &CommandTracker) -> Self {
        Self {
            id: tracker.id(),
            args: tracker.args().to_vec(),
            source_file: tracker.source_file.clone(),
            total_exec_time_ms: tracker.total_exec_time_ms(),
            loop_disabled: tracker.is_loop_disabled(),
        }
    }
}
