// Periodic reclamation of finished job workspaces
use crate::metrics;
use crate::workspace::ACTIVE_MARKER;
use fs2::FileExt;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const LOCK_FILE: &str = ".cleanup.lock";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted: Vec<PathBuf>,
    pub skipped_active: usize,
}

/// Deletes workspaces older than the retention window.
///
/// A directory holding a marker younger than twice the retention is in use
/// and left alone; an older marker belongs to a crashed job and is ignored.
/// One sweep at a time: an in-process mutex plus an advisory lock file shared
/// with other processes on the same volume. Either being held skips the cycle;
/// a poisoned mutex does not.
pub struct CleanupSweeper {
    root: PathBuf,
    retention: Duration,
    guard: Mutex<()>,
}

impl CleanupSweeper {
    pub fn new(root: impl Into<PathBuf>, retention: Duration) -> Self {
        Self {
            root: root.into(),
            retention,
            guard: Mutex::new(()),
        }
    }

    pub fn sweep(&self) -> Option<SweepReport> {
        self.sweep_at(SystemTime::now())
    }

    /// Run one sweep treating `now` as the current time. Returns `None` when
    /// another sweep holds either lock.
    pub fn sweep_at(&self, now: SystemTime) -> Option<SweepReport> {
        let _local = match self.guard.try_lock() {
            Ok(guard) => guard,
            // A sweep that panicked leaves nothing behind worth protecting
            Err(TryLockError::Poisoned(poisoned)) => {
                warn!("Previous cleanup sweep panicked, continuing");
                poisoned.into_inner()
            }
            Err(TryLockError::WouldBlock) => {
                debug!("Cleanup already running in this process, skipping");
                return None;
            }
        };

        if let Err(e) = fs::create_dir_all(&self.root) {
            warn!(root = %self.root.display(), error = %e, "Cannot create outputs root");
            return None;
        }
        let lock_path = self.root.join(LOCK_FILE);
        let lock_file = match OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
        {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %lock_path.display(), error = %e, "Cannot open cleanup lock");
                return None;
            }
        };
        if lock_file.try_lock_exclusive().is_err() {
            debug!("Cleanup lock held by another process, skipping");
            return None;
        }

        let report = self.sweep_locked(now);
        let _ = lock_file.unlock();
        Some(report)
    }

    fn sweep_locked(&self, now: SystemTime) -> SweepReport {
        let mut report = SweepReport::default();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(root = %self.root.display(), error = %e, "Cannot list outputs root");
                return report;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }

            match self.marker_state(&path, now) {
                MarkerState::Fresh | MarkerState::Unreadable => {
                    report.skipped_active += 1;
                    continue;
                }
                MarkerState::Absent | MarkerState::Stale => {}
            }

            let dir_age = match entry.metadata().and_then(|m| m.modified()) {
                Ok(modified) => age(now, modified),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Cannot stat workspace");
                    continue;
                }
            };
            if dir_age < self.retention {
                continue;
            }

            match fs::remove_dir_all(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), age_secs = dir_age.as_secs(), "Deleted expired workspace");
                    report.deleted.push(path);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete workspace"),
            }
        }

        report
    }

    fn marker_state(&self, dir: &Path, now: SystemTime) -> MarkerState {
        let marker = dir.join(ACTIVE_MARKER);
        if !marker.exists() {
            return MarkerState::Absent;
        }
        match fs::metadata(&marker).and_then(|m| m.modified()) {
            Ok(modified) if age(now, modified) < self.retention * 2 => MarkerState::Fresh,
            Ok(_) => MarkerState::Stale,
            Err(_) => MarkerState::Unreadable,
        }
    }

    /// Sweep every `interval` on the blocking pool until the task is aborted.
    pub fn spawn_periodic(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let sweeper = Arc::clone(&self);
                match tokio::task::spawn_blocking(move || sweeper.sweep()).await {
                    Ok(Some(report)) if !report.deleted.is_empty() => {
                        metrics::CLEANUP_DELETED.inc_by(report.deleted.len() as u64);
                        info!(
                            deleted = report.deleted.len(),
                            skipped_active = report.skipped_active,
                            "Cleaned up expired workspaces"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Cleanup task failed"),
                }
            }
        })
    }
}

enum MarkerState {
    Absent,
    Fresh,
    Stale,
    Unreadable,
}

fn age(now: SystemTime, then: SystemTime) -> Duration {
    now.duration_since(then).unwrap_or_default()
}
