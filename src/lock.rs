//! One running snapshot process per destination root.

use crate::error::SnapshotError;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const LOCK_FILE: &str = ".dsnapshot.lock";

/// Held for the lifetime of a run; the lock file is removed on drop.
#[derive(Debug)]
pub struct RootLock {
    path: PathBuf,
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    // EPERM means the process exists but belongs to someone else.
    matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

impl RootLock {
    /// Takes the lock on `root`, replacing a lock left by a dead process.
    pub fn acquire(root: &Path) -> Result<Self, SnapshotError> {
        let path = root.join(LOCK_FILE);
        loop {
            match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id())?;
                    file.sync_all()?;
                    debug!("Acquired {}", path.display());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let holder = fs::read_to_string(&path)
                        .ok()
                        .and_then(|s| s.trim().parse::<u32>().ok());
                    match holder {
                        Some(pid) if pid_alive(pid) => {
                            return Err(SnapshotError::Locked { pid, path });
                        }
                        _ => {
                            warn!("Removing stale lock {}", path.display());
                            match fs::remove_file(&path) {
                                Ok(()) => {}
                                Err(e) if e.kind() == ErrorKind::NotFound => {}
                                Err(e) => return Err(e.into()),
                            }
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RootLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to remove lock {}: {}", self.path.display(), e);
        }
    }
}
