//! Polling file watcher.
//!
//! Each poll stats every watched path and runs its callback when the
//! modification time differs from the last one seen. Polling keeps the
//! behavior identical on every filesystem, network mounts included.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use tracing::{debug, warn};

pub type ChangeCallback = Arc<dyn Fn(&Path) -> anyhow::Result<()> + Send + Sync>;

struct WatchEntry {
    last_mtime: SystemTime,
    on_change: ChangeCallback,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollReport {
    pub changed: usize,
    pub failed: usize,
}

#[derive(Default)]
pub struct FileWatcher {
    entries: Mutex<HashMap<PathBuf, WatchEntry>>,
}

fn mtime(path: &Path) -> std::io::Result<SystemTime> {
    std::fs::metadata(path)?.modified()
}

impl FileWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start watching `path`, which must exist. Re-watching a path replaces
    /// its callback and resets its baseline.
    pub fn watch(&self, path: impl Into<PathBuf>, on_change: ChangeCallback) -> std::io::Result<()> {
        let path = path.into();
        let last_mtime = mtime(&path)?;
        debug!(path = %path.display(), "Watching file");
        self.entries.lock().insert(
            path,
            WatchEntry {
                last_mtime,
                on_change,
            },
        );
        Ok(())
    }

    pub fn unwatch(&self, path: &Path) -> bool {
        self.entries.lock().remove(path).is_some()
    }

    pub fn is_watching(&self, path: &Path) -> bool {
        self.entries.lock().contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Check every watched path once.
    ///
    /// A path that cannot be stat'ed is skipped this round. The stored
    /// mtime is updated to the value observed before the callback ran, so a
    /// callback that rewrites its own file triggers one more (idempotent)
    /// call on the next poll.
    pub fn poll(&self) -> PollReport {
        let snapshot: Vec<(PathBuf, SystemTime, ChangeCallback)> = self
            .entries
            .lock()
            .iter()
            .map(|(p, e)| (p.clone(), e.last_mtime, e.on_change.clone()))
            .collect();

        let mut report = PollReport::default();
        for (path, last, on_change) in snapshot {
            let current = match mtime(&path) {
                Ok(t) => t,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to stat watched file");
                    continue;
                }
            };
            if current == last {
                continue;
            }

            report.changed += 1;
            if let Some(entry) = self.entries.lock().get_mut(&path) {
                entry.last_mtime = current;
            }
            if let Err(e) = on_change(&path) {
                report.failed += 1;
                warn!(path = %path.display(), error = %e, "File update callback failed");
            }
        }
        report
    }
}
