//! Removal of old per-user log files under `<user_dir>/<principal>/logs`.

use std::path::Path;
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: usize,
    pub failed: usize,
}

/// Delete every file whose name ends in `log` and whose modification time
/// is more than `max_age` before `now`. Unreadable entries are logged and
/// skipped.
pub fn clean_user_logs(user_dir: &Path, max_age: Duration, now: SystemTime) -> CleanupReport {
    let mut report = CleanupReport::default();
    let Some(cutoff) = now.checked_sub(max_age) else {
        return report;
    };
    let users = match std::fs::read_dir(user_dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %user_dir.display(), error = %e, "No user directory to clean");
            return report;
        }
    };
    for user in users.flatten() {
        let logs = user.path().join("logs");
        if logs.is_dir() {
            clean_dir(&logs, cutoff, &mut report);
        }
    }
    if report.removed > 0 {
        info!(removed = report.removed, "Removed old user logs");
    }
    report
}

fn clean_dir(dir: &Path, cutoff: SystemTime, report: &mut CleanupReport) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Failed to read log directory");
            report.failed += 1;
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            clean_dir(&path, cutoff, report);
            continue;
        }
        if !path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with("log"))
        {
            continue;
        }
        let modified = match entry.metadata().and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to stat log file");
                report.failed += 1;
                continue;
            }
        };
        if modified >= cutoff {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "Removed old log");
                report.removed += 1;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to remove old log");
                report.failed += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    const DAY: Duration = Duration::from_secs(86_400);

    fn touch(path: &Path, modified: SystemTime) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "x").unwrap();
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(modified)
            .unwrap();
    }

    #[test]
    fn removes_only_old_log_files() {
        let tmp = tempfile::tempdir().unwrap();
        let now = SystemTime::UNIX_EPOCH + DAY * 1_000;
        let old = now - DAY * 40;
        let fresh = now - DAY;

        let alice = tmp.path().join("alice/logs");
        touch(&alice.join("20240101.golog"), old);
        touch(&alice.join("nested/old.log"), old);
        touch(&alice.join("recent.golog"), fresh);
        touch(&alice.join("notes.txt"), old);
        touch(&tmp.path().join("alice/session.log"), old);

        let report = clean_user_logs(tmp.path(), DAY * 30, now);
        assert_eq!(report, CleanupReport { removed: 2, failed: 0 });
        assert!(!alice.join("20240101.golog").exists());
        assert!(!alice.join("nested/old.log").exists());
        assert!(alice.join("recent.golog").exists());
        assert!(alice.join("notes.txt").exists());
        // Only the logs directory is cleaned.
        assert!(tmp.path().join("alice/session.log").exists());
    }

    #[test]
    fn missing_user_dir_is_not_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let report = clean_user_logs(&tmp.path().join("nope"), DAY, SystemTime::now());
        assert_eq!(report, CleanupReport::default());
    }
}
