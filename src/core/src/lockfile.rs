//! File-based mutual exclusion for cross-process resources.
//!
//! Two resources are guarded this way: the plugin registry during
//! writes, and the install root during a self-update commit (the
//! installer refuses to run while the latter is held). The lock is a
//! JSON file created with `create_new`, carrying enough metadata to
//! produce a useful "who holds this" diagnostic and to detect stale
//! locks left behind by dead processes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{PortunixError, Result};

/// Metadata written into a lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Process id of the holder
    pub pid: u32,
    /// Operation the holder is performing, for diagnostics
    pub operation: String,
    /// When the lock was acquired
    pub acquired_at: DateTime<Utc>,
}

/// A held lock; released on drop.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Acquire the lock at `path`, recording `operation` as the holder
    /// description. Fails with a `LockHeld` error naming the holder if
    /// a live process owns the lock; stale locks from dead processes
    /// are reclaimed.
    pub fn acquire(path: &Path, operation: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        for attempt in 0..2 {
            match Self::try_create(path, operation) {
                Ok(lock) => return Ok(lock),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = Self::read_info(path);
                    if attempt == 0 && holder.as_ref().map_or(true, |info| !process_alive(info.pid)) {
                        warn!(lock = %path.display(), "removing stale lock from dead process");
                        let _ = fs::remove_file(path);
                        continue;
                    }
                    let description = holder.map_or_else(
                        || "an unknown process".to_string(),
                        |info| format!("{} (pid {})", info.operation, info.pid),
                    );
                    return Err(PortunixError::lock_held(path.display().to_string(), description));
                }
                Err(err) => return Err(err.into()),
            }
        }

        // Second create attempt lost a race with another process.
        let holder = Self::read_info(path).map_or_else(
            || "an unknown process".to_string(),
            |info| format!("{} (pid {})", info.operation, info.pid),
        );
        Err(PortunixError::lock_held(path.display().to_string(), holder))
    }

    /// Whether a live process currently holds the lock at `path`.
    pub fn is_held(path: &Path) -> bool {
        match Self::read_info(path) {
            Some(info) => process_alive(info.pid),
            None => path.exists(),
        }
    }

    fn try_create(path: &Path, operation: &str) -> std::io::Result<Self> {
        let file = fs::OpenOptions::new().write(true).create_new(true).open(path)?;
        let info = LockInfo {
            pid: std::process::id(),
            operation: operation.to_string(),
            acquired_at: Utc::now(),
        };
        serde_json::to_writer_pretty(&file, &info)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        file.sync_all()?;
        debug!(lock = %path.display(), operation, "lock acquired");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    fn read_info(path: &Path) -> Option<LockInfo> {
        let contents = fs::read(path).ok()?;
        serde_json::from_slice(&contents).ok()
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(lock = %self.path.display(), error = %err, "failed to release lock");
        } else {
            debug!(lock = %self.path.display(), "lock released");
        }
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    // SAFETY: signal 0 performs only an existence check.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    // Without a cheap liveness probe, assume the holder is alive and
    // let the user resolve genuinely stale locks.
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("resource.lock");
        {
            let _lock = LockFile::acquire(&path, "test").unwrap();
            assert!(path.exists());
            assert!(LockFile::is_held(&path));
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_contention_names_holder() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("resource.lock");
        let _held = LockFile::acquire(&path, "self-update commit").unwrap();

        let err = LockFile::acquire(&path, "install").unwrap_err();
        assert_eq!(err.exit_code(), 5);
        assert!(err.to_string().contains("self-update commit"));
    }

    #[cfg(unix)]
    #[test]
    fn test_stale_lock_is_reclaimed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("resource.lock");
        let stale = LockInfo {
            // A pid from the kernel's unreachable range on any test box.
            pid: u32::MAX - 1,
            operation: "crashed run".to_string(),
            acquired_at: Utc::now(),
        };
        fs::write(&path, serde_json::to_vec(&stale).unwrap()).unwrap();

        let _lock = LockFile::acquire(&path, "recovery").unwrap();
        assert!(LockFile::is_held(&path));
    }
}
