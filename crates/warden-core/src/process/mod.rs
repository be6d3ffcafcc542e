//! Process realm management.
//!
//! Wraps the fork primitive and tags each side of the split with a
//! realm label: the console invoker, the detached daemon, a fleet
//! worker, or the foreground stand-in when daemonization is disabled.
//! Post-fork setup runs in the child: optional lock re-acquisition,
//! session creation, and identity drops.

use std::process;

use nix::unistd::{fork, geteuid, setegid, seteuid, setsid, ForkResult, Group, Pid, User};
use tracing::{error, info, warn};

use crate::config::Options;
use crate::lock::PidLock;

/// The process's role in the lifecycle. Assigned at fork time and
/// immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Realm {
    /// The pre-fork invoker.
    Console,
    /// The detached supervisor.
    Daemon,
    /// A fleet worker running the payload.
    Worker,
    /// Daemonization disabled; the invoker plays the supervisor role.
    Foreground,
}

impl std::fmt::Display for Realm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Console => write!(f, "console"),
            Self::Daemon => write!(f, "daemon"),
            Self::Worker => write!(f, "worker"),
            Self::Foreground => write!(f, "foreground"),
        }
    }
}

/// Which split a fork performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkKind {
    /// Console splits into console + daemon.
    Daemon,
    /// Daemon splits into daemon + worker.
    Fleet,
}

impl ForkKind {
    /// The realm the child ends up in.
    #[must_use]
    pub const fn child_realm(self) -> Realm {
        match self {
            Self::Daemon => Realm::Daemon,
            Self::Fleet => Realm::Worker,
        }
    }
}

/// Which side of a successful fork the caller is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forked {
    /// The parent side; the child's PID is reported for bookkeeping.
    Parent {
        /// PID of the freshly forked child.
        child: Pid,
    },
    /// The child side, already tagged with its realm.
    Child {
        /// The realm this process now belongs to.
        realm: Realm,
    },
}

/// Process-level errors.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The fork itself failed.
    #[error("fork failed: {0}")]
    Fork(nix::errno::Errno),

    /// Identity switches were requested without root.
    #[error(
        "switching to user {user:?} / group {group:?} requires root, \
         but the effective uid is {euid}"
    )]
    NotRoot {
        /// Requested target user.
        user: Option<String>,
        /// Requested target group.
        group: Option<String>,
        /// The non-zero effective UID observed.
        euid: u32,
    },
}

/// Fork once and perform the child-side setup.
///
/// In the child: re-acquire the PID lock when `relock` is set (failure
/// exits the child with status 1), create a new session (failure also
/// exits), then apply the configured identity drops. The child never
/// sees an error from this function; unrecoverable conditions end the
/// child process directly, so only the parent can observe them.
///
/// # Errors
///
/// Returns [`ProcessError::Fork`] when the fork itself fails; callers
/// treat that as fatal.
pub fn fork_realm(
    kind: ForkKind,
    relock: bool,
    lock: &PidLock,
    options: &Options,
) -> Result<Forked, ProcessError> {
    // SAFETY: every fork happens while the process is single-threaded.
    // The daemon split runs before the serving phase spawns anything,
    // and fleet worker splits happen on the sole supervising thread
    // (single mode, the one path that hosts a helper thread, never
    // forks). fork() from a single-threaded process is well-defined,
    // and the child only runs the payload or exits.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => Ok(Forked::Parent { child }),
        Ok(ForkResult::Child) => {
            if relock && !lock.acquire(None) {
                error!(path = %lock.path().display(), "child could not take over the lock");
                process::exit(1);
            }
            if let Err(errno) = setsid() {
                error!(%errno, "setsid failed in forked child");
                process::exit(1);
            }
            apply_identity(options);
            Ok(Forked::Child {
                realm: kind.child_realm(),
            })
        }
        Err(errno) => Err(ProcessError::Fork(errno)),
    }
}

/// Apply the configured group and user switches, group first. Unknown
/// names log a warning and are skipped; switch failures likewise.
fn apply_identity(options: &Options) {
    if let Some(name) = &options.runasgroup {
        match Group::from_name(name) {
            Ok(Some(group)) => match setegid(group.gid) {
                Ok(()) => info!(group = %name, gid = %group.gid, "switched effective group"),
                Err(errno) => warn!(group = %name, %errno, "failed to switch effective group"),
            },
            Ok(None) => warn!(group = %name, "unknown group, not switching"),
            Err(errno) => warn!(group = %name, %errno, "group lookup failed"),
        }
    }

    if let Some(name) = &options.runasuser {
        match User::from_name(name) {
            Ok(Some(user)) => match seteuid(user.uid) {
                Ok(()) => info!(user = %name, uid = %user.uid, "switched effective user"),
                Err(errno) => warn!(user = %name, %errno, "failed to switch effective user"),
            },
            Ok(None) => warn!(user = %name, "unknown user, not switching"),
            Err(errno) => warn!(user = %name, %errno, "user lookup failed"),
        }
    }
}

/// Verify the caller may perform the configured identity switches.
///
/// # Errors
///
/// Returns [`ProcessError::NotRoot`] when `runasuser` or `runasgroup`
/// is set and the effective UID is not 0.
pub fn require_root_for_identity(options: &Options) -> Result<(), ProcessError> {
    if options.runasuser.is_none() && options.runasgroup.is_none() {
        return Ok(());
    }
    let euid = geteuid();
    if euid.is_root() {
        Ok(())
    } else {
        Err(ProcessError::NotRoot {
            user: options.runasuser.clone(),
            group: options.runasgroup.clone(),
            euid: euid.as_raw(),
        })
    }
}
