//! Async-safe signal routing.
//!
//! Handlers installed here do exactly one thing: flip an atomic flag in
//! a fixed-size inbox. No allocation, no locks, no payload calls. The
//! supervisor drains the inbox at its loop ticks and performs the real
//! work there. The inbox is a set, not a queue: repeated deliveries of
//! the same signal between drains collapse into one observation.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::debug;

/// The signals the supervisor routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sig {
    /// Reload request; triggers a fleet restart unless the payload
    /// claims it.
    Hup,
    /// Interactive interrupt. Equivalent to `Term`.
    Int,
    /// Termination request.
    Term,
    /// A child changed state; drives opportunistic reaping.
    Chld,
    /// Reserved for the payload.
    Usr1,
    /// Reserved for the payload.
    Usr2,
}

impl Sig {
    /// Every routed signal, in inbox order.
    pub const ALL: [Self; 6] = [
        Self::Hup,
        Self::Int,
        Self::Term,
        Self::Chld,
        Self::Usr1,
        Self::Usr2,
    ];

    /// The subset whose default dispositions are restored when the
    /// supervisor loop exits.
    pub const CORE: [Self; 4] = [Self::Hup, Self::Int, Self::Term, Self::Chld];

    const fn index(self) -> usize {
        match self {
            Self::Hup => 0,
            Self::Int => 1,
            Self::Term => 2,
            Self::Chld => 3,
            Self::Usr1 => 4,
            Self::Usr2 => 5,
        }
    }

    /// The corresponding OS signal.
    #[must_use]
    pub const fn as_signal(self) -> Signal {
        match self {
            Self::Hup => Signal::SIGHUP,
            Self::Int => Signal::SIGINT,
            Self::Term => Signal::SIGTERM,
            Self::Chld => Signal::SIGCHLD,
            Self::Usr1 => Signal::SIGUSR1,
            Self::Usr2 => Signal::SIGUSR2,
        }
    }

    /// Map a raw signal number back onto the routed set.
    #[must_use]
    pub fn from_raw(signo: libc::c_int) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|sig| sig.as_signal() as libc::c_int == signo)
    }
}

impl std::fmt::Display for Sig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hup => write!(f, "SIGHUP"),
            Self::Int => write!(f, "SIGINT"),
            Self::Term => write!(f, "SIGTERM"),
            Self::Chld => write!(f, "SIGCHLD"),
            Self::Usr1 => write!(f, "SIGUSR1"),
            Self::Usr2 => write!(f, "SIGUSR2"),
        }
    }
}

/// Per-signal "observed since last drain" flags.
static PENDING: [AtomicBool; 6] = [
    AtomicBool::new(false),
    AtomicBool::new(false),
    AtomicBool::new(false),
    AtomicBool::new(false),
    AtomicBool::new(false),
    AtomicBool::new(false),
];

/// The installed handler. Only atomic stores are allowed here.
extern "C" fn note_signal(signo: libc::c_int) {
    if let Some(sig) = Sig::from_raw(signo) {
        PENDING[sig.index()].store(true, Ordering::SeqCst);
    }
}

/// Signal routing errors.
#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    /// `sigaction` rejected a handler installation.
    #[error("sigaction({signal}) failed: {errno}")]
    Sigaction {
        /// The signal whose handler could not be installed.
        signal: Sig,
        /// Errno from the kernel.
        errno: nix::errno::Errno,
    },
}

/// Installs the routed handlers and owns the drain side of the inbox.
#[derive(Debug)]
pub struct SignalRouter {
    _private: (),
}

impl SignalRouter {
    /// Install handlers for all routed signals.
    ///
    /// # Errors
    ///
    /// Returns an error if any `sigaction` call fails; already
    /// installed handlers are left in place.
    pub fn install() -> Result<Self, SignalError> {
        let action = SigAction::new(
            SigHandler::Handler(note_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        for sig in Sig::ALL {
            // SAFETY: `note_signal` is async-signal-safe: it performs a
            // single atomic store and nothing else. The action is valid
            // for the lifetime of the process.
            unsafe { signal::sigaction(sig.as_signal(), &action) }
                .map_err(|errno| SignalError::Sigaction { signal: sig, errno })?;
        }

        debug!("signal handlers installed");
        Ok(Self { _private: () })
    }

    /// Take every signal observed since the last drain. Single-reader:
    /// the supervisor loop is the only caller.
    pub fn drain(&self) -> Vec<Sig> {
        Sig::ALL
            .into_iter()
            .filter(|sig| PENDING[sig.index()].swap(false, Ordering::SeqCst))
            .collect()
    }

    /// Restore the default disposition for every routed signal and
    /// clear the inbox. Used in freshly forked workers, which must not
    /// inherit the supervisor's handlers.
    ///
    /// # Errors
    ///
    /// Returns the first `sigaction` failure.
    pub fn reset_to_defaults() -> Result<(), SignalError> {
        let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        for sig in Sig::ALL {
            // SAFETY: installing SIG_DFL is always safe.
            unsafe { signal::sigaction(sig.as_signal(), &action) }
                .map_err(|errno| SignalError::Sigaction { signal: sig, errno })?;
            PENDING[sig.index()].store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Restore default dispositions for HUP, INT, TERM and CHLD, as
    /// done when the supervision loop exits. Failures are tolerated;
    /// the process is about to leave supervised operation anyway.
    pub fn restore_core_defaults(&self) {
        let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        for sig in Sig::CORE {
            // SAFETY: installing SIG_DFL is always safe.
            let _ = unsafe { signal::sigaction(sig.as_signal(), &action) };
            PENDING[sig.index()].store(false, Ordering::SeqCst);
        }
    }
}

/// Dispositions and the inbox are process-wide; tests that touch them
/// serialize on this guard.
#[cfg(test)]
pub(crate) static DISPOSITION_TEST_GUARD: std::sync::Mutex<()> = std::sync::Mutex::new(());
