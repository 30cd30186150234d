use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::scheduler::command::{CommandSnapshot, CommandState, ExecutableCommand};

/// The three disjoint command sets plus the "could not schedule" warned set.
///
/// Every executable command lives in exactly one of ready, sleeping or
/// executing. Callers hold the scheduler lock for every operation.
#[derive(Debug, Default)]
pub struct CommandQueue {
    ready: Vec<ExecutableCommand>,
    sleeping: HashMap<u64, ExecutableCommand>,
    executing: HashMap<u64, ExecutableCommand>,
    unscheduled_warning: HashSet<u64>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_ready(&mut self, cmd: ExecutableCommand) {
        self.ready.push(cmd);
    }

    pub fn push_sleeping(&mut self, cmd: ExecutableCommand) {
        self.sleeping.insert(cmd.exec_id, cmd);
    }

    /// Ready commands ordered by (cumulative exec time, tracker id).
    pub fn sorted_ready(&self) -> Vec<ExecutableCommand> {
        let mut ready = self.ready.clone();
        ready.sort_by_key(ExecutableCommand::priority_key);
        ready
    }

    /// Move a ready command into executing. Returns false if it is no longer
    /// ready (removed while the lock was released).
    pub fn start_executing(&mut self, exec_id: u64) -> bool {
        let Some(pos) = self.ready.iter().position(|c| c.exec_id == exec_id) else {
            return false;
        };
        let cmd = self.ready.remove(pos);
        self.unscheduled_warning.remove(&exec_id);
        self.executing.insert(exec_id, cmd);
        true
    }

    /// Put a command straight into executing, bypassing ready.
    pub fn insert_executing(&mut self, cmd: ExecutableCommand) {
        self.executing.insert(cmd.exec_id, cmd);
    }

    /// Move a sleeping command to ready. Returns false if it was removed.
    pub fn wake(&mut self, exec_id: u64) -> bool {
        match self.sleeping.remove(&exec_id) {
            Some(mut cmd) => {
                cmd.sleep_until = None;
                self.ready.push(cmd);
                true
            }
            None => false,
        }
    }

    pub fn finish(&mut self, exec_id: u64) -> Option<ExecutableCommand> {
        self.executing.remove(&exec_id)
    }

    /// Remove every pending command. Returns the exec ids of the sleeping
    /// commands that were dropped so their timers can be cancelled.
    pub fn clear_pending(&mut self) -> Vec<u64> {
        self.ready.clear();
        self.unscheduled_warning.clear();
        self.sleeping.drain().map(|(id, _)| id).collect()
    }

    /// Remove pending commands sourced from `path`. Returns the exec ids
    /// removed from sleeping.
    pub fn remove_from_file(&mut self, path: &Path) -> Vec<u64> {
        let warned = &mut self.unscheduled_warning;
        self.ready.retain(|c| {
            let keep = !c.tracker.is_from_file(path);
            if !keep {
                warned.remove(&c.exec_id);
            }
            keep
        });
        let removed: Vec<u64> = self
            .sleeping
            .values()
            .filter(|c| c.tracker.is_from_file(path))
            .map(|c| c.exec_id)
            .collect();
        for id in &removed {
            self.sleeping.remove(id);
        }
        removed
    }

    /// Record that `exec_id` could not be scheduled. Returns true the first
    /// time, so the caller logs once per command.
    pub fn warn_once(&mut self, exec_id: u64) -> bool {
        self.unscheduled_warning.insert(exec_id)
    }

    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    pub fn sleeping_count(&self) -> usize {
        self.sleeping.len()
    }

    pub fn executing_count(&self) -> usize {
        self.executing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.sleeping.is_empty() && self.executing.is_empty()
    }

    pub fn is_executing(&self, exec_id: u64) -> bool {
        self.executing.contains_key(&exec_id)
    }

    /// Executing first, then ready, then sleeping.
    pub fn all_commands(&self) -> Vec<CommandSnapshot> {
        let mut executing: Vec<&ExecutableCommand> = self.executing.values().collect();
        executing.sort_by_key(|c| c.exec_id);
        let mut sleeping: Vec<&ExecutableCommand> = self.sleeping.values().collect();
        sleeping.sort_by_key(|c| c.exec_id);

        executing
            .into_iter()
            .map(|c| c.snapshot(CommandState::Executing))
            .chain(
                self.ready
                    .iter()
                    .map(|c| c.snapshot(CommandState::WaitingForDevice)),
            )
            .chain(sleeping.into_iter().map(|c| c.snapshot(CommandState::Sleeping)))
            .collect()
    }

    /// Every command currently tracked, in any state.
    pub fn commands(&self) -> impl Iterator<Item = &ExecutableCommand> {
        self.executing
            .values()
            .chain(self.ready.iter())
            .chain(self.sleeping.values())
    }
}
