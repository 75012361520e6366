//! Run-scoped exclusive lock over the local store.
//!
//! Every sync run holds this lock for its whole lifetime; readers outside a
//! run never take it.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, RoadmapError};

/// Advisory file lock guarding the entity store and sync state.
pub struct RunLock {
    lock_file: File,
    lock_path: PathBuf,
}

impl RunLock {
    pub const LOCK_FILENAME: &'static str = "sync.lock";

    /// Try to acquire the lock without blocking.
    pub fn try_acquire(data_dir: &Path) -> Result<Option<Self>> {
        let lock_path = data_dir.join(Self::LOCK_FILENAME);
        fs::create_dir_all(data_dir)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| RoadmapError::LockFailed(format!("open lock file: {e}")))?;

        match lock_file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                debug!("Run lock held by another process");
                return Ok(None);
            }
            Err(e) => {
                return Err(RoadmapError::LockFailed(format!("try acquire lock: {e}")));
            }
        }

        let holder = LockHolder::current();
        if let Ok(json) = serde_json::to_string(&holder) {
            // Informational only; the flock is what excludes other runs.
            fs::write(&lock_path, json).ok();
        }

        debug!(path = %lock_path.display(), "Acquired run lock");
        Ok(Some(Self {
            lock_file,
            lock_path,
        }))
    }

    /// Poll for the lock until `timeout` elapses. Timing out is an error:
    /// a run that cannot lock the store must not start.
    pub fn acquire_timeout(data_dir: &Path, timeout: Duration) -> Result<Self> {
        let start = Instant::now();
        let poll_interval = Duration::from_millis(50);

        loop {
            if let Some(lock) = Self::try_acquire(data_dir)? {
                return Ok(lock);
            }
            if start.elapsed() >= timeout {
                break;
            }
            std::thread::sleep(poll_interval);
        }

        let holder = Self::status(data_dir).ok().flatten();
        warn!(timeout = ?timeout, holder = ?holder, "Timed out waiting for run lock");
        let detail = holder.map_or_else(
            || format!("another sync holds {} (waited {timeout:?})", Self::LOCK_FILENAME),
            |h| {
                format!(
                    "held by pid {} on {} since {} (waited {timeout:?})",
                    h.pid, h.hostname, h.acquired_at
                )
            },
        );
        Err(RoadmapError::LockTimeout(detail))
    }

    /// Read the recorded holder without acquiring.
    pub fn status(data_dir: &Path) -> Result<Option<LockHolder>> {
        let lock_path = data_dir.join(Self::LOCK_FILENAME);
        if !lock_path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&lock_path)?;
        if content.trim().is_empty() {
            return Ok(None);
        }
        let holder: LockHolder = serde_json::from_str(&content)
            .map_err(|e| RoadmapError::LockFailed(format!("parse lock holder: {e}")))?;

        #[cfg(target_os = "linux")]
        {
            if !Path::new(&format!("/proc/{}", holder.pid)).exists() {
                return Ok(None);
            }
        }

        Ok(Some(holder))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.lock_file) {
            debug!("Failed to release run lock: {}", e);
        }
        debug!("Released run lock");
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub hostname: String,
}

impl LockHolder {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            acquired_at: Utc::now(),
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
        }
    }
}
