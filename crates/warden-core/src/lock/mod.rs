//! PID-file lock.
//!
//! A single-instance lock backed by a plain PID file: one decimal PID,
//! one line. Staleness is decided by probing the recorded PID with the
//! zero signal, and a stale lock is recovered the moment it is
//! observed. The lock file is the only state shared across processes;
//! it is written once per ownership transfer and read with a single
//! read.
//!
//! Filesystem failures here are logged and reported as "not acquired"
//! or silently tolerated on release; they never abort the caller. The
//! lifecycle layer treats a failed acquisition as "already running".

use std::fs;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::{getpid, Pid};
use tracing::{debug, info, warn};

/// Permissions for a freshly created PID file directory.
const PID_DIR_MODE: u32 = 0o744;

/// A PID-file based single-instance lock.
#[derive(Debug, Clone)]
pub struct PidLock {
    path: PathBuf,
}

impl PidLock {
    /// Create a lock handle for the given path. No filesystem access
    /// happens until one of the operations runs.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Try to take the lock, writing `pid` (the calling process by
    /// default) into the file. Fails when another live process already
    /// holds it. A stale lock is recovered and then taken over.
    pub fn acquire(&self, pid: Option<Pid>) -> bool {
        if self.is_held() {
            return false;
        }

        let pid = pid.unwrap_or_else(getpid);

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                let mut builder = fs::DirBuilder::new();
                builder.recursive(true);
                #[cfg(unix)]
                {
                    use std::os::unix::fs::DirBuilderExt;
                    builder.mode(PID_DIR_MODE);
                }
                if let Err(e) = builder.create(parent) {
                    warn!(path = %parent.display(), error = %e, "failed to create PID file directory");
                    return false;
                }
            }
        }

        match fs::write(&self.path, format!("{}\n", pid.as_raw())) {
            Ok(()) => {
                debug!(path = %self.path.display(), pid = pid.as_raw(), "lock acquired");
                true
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to write PID file");
                false
            }
        }
    }

    /// Remove the lock file. Idempotent; removal errors are logged and
    /// swallowed.
    pub fn release(&self) {
        if !self.path.exists() {
            return;
        }
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove PID file");
        } else {
            debug!(path = %self.path.display(), "lock released");
        }
    }

    /// Whether another live process holds the lock.
    ///
    /// Returns false when the file is absent, when the recorded PID is
    /// the caller's own, or when the recorded PID is not alive. A stale
    /// lock is released before returning false.
    #[must_use]
    pub fn is_held(&self) -> bool {
        let Some(pid) = self.held_by() else {
            return false;
        };
        if pid == getpid() {
            return false;
        }
        if Self::is_alive(pid) {
            true
        } else {
            info!(path = %self.path.display(), pid = pid.as_raw(), "recovering stale lock");
            self.release();
            false
        }
    }

    /// The PID recorded in the lock file, with no staleness check.
    /// Unreadable or malformed contents read as "no lock".
    #[must_use]
    pub fn held_by(&self) -> Option<Pid> {
        let raw = fs::read_to_string(&self.path).ok()?;
        raw.trim()
            .parse::<i32>()
            .ok()
            .filter(|pid| *pid > 0)
            .map(Pid::from_raw)
    }

    /// Probe a PID with the zero signal. EPERM means the process exists
    /// but belongs to someone else, so it still counts as alive.
    #[must_use]
    pub fn is_alive(pid: Pid) -> bool {
        match kill(pid, None) {
            Ok(()) | Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}
