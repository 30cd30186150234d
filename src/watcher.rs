//! Polls loaded command files and reports the ones that changed.
//!
//! A file counts as changed when its own modification time moved, or when
//! any file it includes (transitively) changed. Each pass stats every
//! distinct path once.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::command_file::IncludedFile;
use crate::error::{FleetError, Result};

/// Receives change notifications for watched top-level files.
#[async_trait]
pub trait CommandFileListener: Send + Sync {
    async fn notify_file_changed(&self, path: &Path, extra_args: &[String]);
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[derive(Debug, Clone)]
pub struct WatchedFile {
    path: PathBuf,
    last_modified: Option<SystemTime>,
    extra_args: Vec<String>,
    dependencies: Vec<WatchedFile>,
}

impl WatchedFile {
    /// Snapshot `path` and its dependencies. Fails if `path` appears among
    /// its own dependencies.
    pub fn new(
        path: impl Into<PathBuf>,
        extra_args: Vec<String>,
        dependencies: Vec<WatchedFile>,
    ) -> Result<Self> {
        let path = path.into();
        if dependencies.iter().any(|d| d.contains(&path)) {
            return Err(FleetError::DependencyCycle(path));
        }
        Ok(Self {
            last_modified: modified_time(&path),
            path,
            extra_args,
            dependencies,
        })
    }

    /// Build the dependency tree recorded by the command file parser.
    pub fn from_included(included: &[IncludedFile]) -> Result<Vec<WatchedFile>> {
        included
            .iter()
            .map(|inc| {
                let deps = Self::from_included(&inc.includes)?;
                Self::new(inc.path.clone(), Vec::new(), deps)
            })
            .collect()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn extra_args(&self) -> &[String] {
        &self.extra_args
    }

    pub fn dependencies(&self) -> &[WatchedFile] {
        &self.dependencies
    }

    fn contains(&self, path: &Path) -> bool {
        self.path == path || self.dependencies.iter().any(|d| d.contains(path))
    }

    /// Returns whether this file or anything it depends on changed, and
    /// records the new modification times.
    ///
    /// `seen` maps each path already stat'ed this pass to (changed, mtime).
    /// Every dependency is visited so all timestamps stay current.
    fn check_changed(&mut self, seen: &mut HashMap<PathBuf, (bool, Option<SystemTime>)>) -> bool {
        let (own_changed, current) = match seen.get(&self.path) {
            Some(&entry) => entry,
            None => {
                let current = modified_time(&self.path);
                let changed = match current {
                    // Unreadable counts as unchanged.
                    None => false,
                    Some(t) => self.last_modified != Some(t),
                };
                seen.insert(self.path.clone(), (changed, current));
                (changed, current)
            }
        };
        if current.is_some() {
            self.last_modified = current;
        }

        let mut dep_changed = false;
        for dep in self.dependencies.iter_mut() {
            dep_changed |= dep.check_changed(seen);
        }
        own_changed || dep_changed
    }
}

pub struct CommandFileWatcher {
    files: Mutex<HashMap<PathBuf, WatchedFile>>,
    listener: Arc<dyn CommandFileListener>,
}

impl CommandFileWatcher {
    pub fn new(listener: Arc<dyn CommandFileListener>) -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            listener,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, WatchedFile>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Watch `path`, replacing any existing registration for it.
    pub fn add_command_file(
        &self,
        path: &Path,
        extra_args: Vec<String>,
        dependencies: Vec<WatchedFile>,
    ) -> Result<()> {
        let file = WatchedFile::new(path, extra_args, dependencies)?;
        if self.lock().insert(path.to_path_buf(), file).is_some() {
            tracing::debug!(path = %path.display(), "Replaced watched command file");
        } else {
            tracing::debug!(path = %path.display(), "Watching command file");
        }
        Ok(())
    }

    pub fn is_file_watched(&self, path: &Path) -> bool {
        self.lock().contains_key(path)
    }

    pub fn remove_all_files(&self) {
        self.lock().clear();
    }

    pub fn watched_files(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.lock().keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Run one check pass and notify the listener for every changed
    /// top-level file. Returns the changed paths.
    pub async fn check_for_updates(&self) -> Vec<PathBuf> {
        let changed: Vec<(PathBuf, Vec<String>)> = {
            let mut files = self.lock();
            let mut seen = HashMap::new();
            files
                .values_mut()
                .filter_map(|file| {
                    file.check_changed(&mut seen)
                        .then(|| (file.path.clone(), file.extra_args.clone()))
                })
                .collect()
        };

        for (path, extra_args) in &changed {
            tracing::info!(path = %path.display(), "Command file changed, reloading");
            self.listener.notify_file_changed(path, extra_args).await;
        }
        changed.into_iter().map(|(path, _)| path).collect()
    }

    /// Poll until `cancel` fires.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        tracing::info!(interval_ms = interval.as_millis() as u64, "Command file watcher started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    self.check_for_updates().await;
                }
            }
        }
        tracing::info!("Command file watcher stopped");
    }
}
