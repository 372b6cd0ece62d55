//! Process Lock File
//!
//! Prevents two node processes from driving the same front-end at once.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::defaults;

#[derive(Debug, Error)]
pub enum LockError {
    #[error(
        "another tilesync node is already running (PID: {pid})\n\n\
         Stop the other instance, or if none is running remove the stale lock file:\n   \
         rm {}",
        .path.display()
    )]
    Held { pid: u32, path: PathBuf },

    #[error("lock file I/O error ({}): {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// PID lock in the node's data directory, released on drop.
#[derive(Debug)]
pub struct NodeLock {
    lock_path: PathBuf,
    owned: bool,
}

impl NodeLock {
    /// Take the lock, removing a stale one left by a dead process.
    pub fn acquire(data_dir: &Path) -> Result<Self, LockError> {
        fs::create_dir_all(data_dir).map_err(|source| LockError::Io {
            path: data_dir.to_path_buf(),
            source,
        })?;
        let lock_path = data_dir.join(defaults::LOCK_FILE_NAME);

        if lock_path.exists() {
            match Self::holder(&lock_path) {
                Some(pid) if Self::is_node_running(pid) => {
                    return Err(LockError::Held {
                        pid,
                        path: lock_path,
                    });
                }
                Some(pid) => {
                    info!(pid, "[Lock] Removing stale lock file from previous node");
                }
                None => warn!(
                    path = %lock_path.display(),
                    "[Lock] Unreadable lock file, replacing it"
                ),
            }
            if let Err(e) = fs::remove_file(&lock_path) {
                warn!(error = %e, "[Lock] Failed to remove old lock file");
            }
        }

        let pid = std::process::id();
        let io_err = |source| LockError::Io {
            path: lock_path.clone(),
            source,
        };
        let mut file = File::create(&lock_path).map_err(io_err)?;
        writeln!(file, "{pid}").map_err(io_err)?;
        debug!(pid, path = %lock_path.display(), "[Lock] Acquired");

        Ok(Self {
            lock_path,
            owned: true,
        })
    }

    fn holder(lock_path: &Path) -> Option<u32> {
        fs::read_to_string(lock_path).ok()?.trim().parse().ok()
    }

    #[cfg(unix)]
    fn is_node_running(pid: u32) -> bool {
        if pid == std::process::id() {
            return true;
        }
        fs::read_to_string(format!("/proc/{pid}/cmdline"))
            .is_ok_and(|cmdline| cmdline.contains("tilesync"))
    }

    #[cfg(not(unix))]
    fn is_node_running(_pid: u32) -> bool {
        true
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }

    pub fn release(&mut self) {
        if self.owned {
            match fs::remove_file(&self.lock_path) {
                Ok(()) => debug!(path = %self.lock_path.display(), "[Lock] Released"),
                Err(e) => warn!(error = %e, "[Lock] Failed to remove lock file"),
            }
            self.owned = false;
        }
    }
}

impl Drop for NodeLock {
    fn drop(&mut self) {
        self.release();
    }
}
