//! Workspace advisory lock (§5): exactly one sprint may run per workspace.
//!
//! A plain `O_EXCL`-style file create at a well-known path, holding the
//! owning process's pid as its content. A lock left behind by a process
//! that is no longer alive is reclaimed rather than treated as held.

use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("a sprint is already running in this workspace (held by pid {held_by})")]
    AlreadyHeld { held_by: u32 },

    #[error("workspace lock I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Held for the duration of `start_sprint`; releases the lock file on drop.
pub struct WorkspaceLock {
    path: PathBuf,
}

impl WorkspaceLock {
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        match std::fs::OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                write!(file, "{}", std::process::id())?;
                Ok(Self { path: path.to_path_buf() })
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                match std::fs::read_to_string(path).ok().and_then(|s| s.trim().parse::<u32>().ok()) {
                    Some(held_by) if pid_is_alive(held_by) => Err(LockError::AlreadyHeld { held_by }),
                    _ => {
                        // The owning pid is dead (or the file is unreadable/corrupt):
                        // reclaim it rather than block forever on a stale lock.
                        std::fs::remove_file(path)?;
                        Self::acquire(path)
                    }
                }
            }
            Err(err) => Err(LockError::Io(err)),
        }
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(target_os = "linux")]
fn pid_is_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
fn pid_is_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn acquiring_twice_in_the_same_process_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sprint.lock");

        let _first = WorkspaceLock::acquire(&path).unwrap();
        let second = WorkspaceLock::acquire(&path);
        assert!(matches!(second, Err(LockError::AlreadyHeld { .. })));
    }

    #[test]
    fn dropping_the_lock_releases_the_path_for_reacquisition() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sprint.lock");

        {
            let _first = WorkspaceLock::acquire(&path).unwrap();
        }
        let second = WorkspaceLock::acquire(&path);
        assert!(second.is_ok());
    }

    #[test]
    fn a_lock_left_by_a_dead_pid_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sprint.lock");
        // pid 4294967295 will never be a real running process.
        std::fs::write(&path, "4294967295").unwrap();

        let lock = WorkspaceLock::acquire(&path);
        assert!(lock.is_ok());
    }
}
