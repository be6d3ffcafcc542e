//! The host↔payload contract.
//!
//! A payload is the user-supplied application the supervisor runs. It
//! implements [`Payload`], whose only required method is `run`; every
//! other hook is a default-implemented no-op, so a payload states its
//! capabilities simply by overriding the methods it cares about. The
//! supervisor constructs payload instances through a registered
//! factory, never by name.
//!
//! Hooks take shared references. In single mode the `run` body is
//! hosted on a helper thread while the supervising thread keeps
//! dispatching `shutdown` and `signal`, so implementations keep their
//! mutable state behind interior mutability (atomics, `Mutex`).

use std::collections::HashMap;
use std::sync::Arc;

use clap::Command;
use nix::unistd::Pid;

use crate::errors::{ErrorEvent, ErrorFlow};
use crate::process::Realm;
use crate::signal::Sig;

/// How a payload run ended. The variants map onto the stable exit
/// codes read by the surrounding OS supervisor (cron, systemd, a
/// process manager).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Normal halt. Exit 0.
    Halt,
    /// Error halt. Exit 8.
    Exit,
    /// Ask the outer supervisor for a cron-style restart. Exit 2.
    Restart,
    /// Reload request, and the default reading of a worker exit. Exit 1.
    Reload,
}

impl ExitKind {
    /// The process exit code this outcome translates to.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Halt => 0,
            Self::Exit => 8,
            Self::Restart => 2,
            Self::Reload => 1,
        }
    }
}

/// Tag attached to each supervised child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    /// A fleet worker.
    Worker,
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Worker => write!(f, "worker"),
        }
    }
}

/// Per-worker configuration handed from the admission hook to the
/// worker's `run`. A flat string map; the supervisor never interprets
/// the contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerConfig {
    values: HashMap<String, String>,
}

impl WorkerConfig {
    /// An empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume and extend, builder style.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Insert one value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Look up one value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the configuration carries no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// The payload's answer to a fleet admission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Launch one worker with this configuration.
    Launch(WorkerConfig),
    /// Cancel this admission phase; launching stays enabled.
    Refuse,
    /// Stop launching altogether; the supervisor drains outstanding
    /// workers and exits.
    Halt,
}

/// The application run under the supervisor.
///
/// Only `run` is required. Hooks fire at defined lifecycle points; the
/// default implementations do nothing, which is how a payload opts out
/// of a capability. While a single-mode `run` is pending, `shutdown`
/// and `signal` may be invoked from the supervising thread.
pub trait Payload: Send + Sync {
    /// Extend the command surface before arguments are parsed. Core
    /// commands are already registered on the passed `Command`.
    fn preflight(&self, command: Command) -> Command {
        command
    }

    /// One-time setup, after daemonization and before `run` or the
    /// supervision loop.
    fn initialize(&self, _args: &[String]) {}

    /// The application body. In single mode this runs in the daemon
    /// realm with no worker configuration; in fleet mode it runs once
    /// per worker with the configuration admission produced.
    fn run(&self, worker: Option<&WorkerConfig>) -> ExitKind;

    /// Handle a command the core did not recognize. `None` means
    /// unhandled and is reported as a usage error.
    fn cli(&self, _command: &str, _args: &[String]) -> Option<i32> {
        None
    }

    /// Orderly-shutdown notice, delivered on INT or TERM before
    /// outstanding workers are reaped. In single mode it arrives while
    /// `run` is still pending.
    fn shutdown(&self) {}

    /// Final notice after the supervision loop exits cleanly.
    fn dismiss(&self) {}

    /// A routed signal reached the daemon. Returning true on HUP
    /// suppresses the default fleet restart.
    fn signal(&self, _sig: Sig) -> bool {
        false
    }

    /// Produce the configuration for the next worker, or decline.
    fn worker_config(&self) -> Admission {
        Admission::Launch(WorkerConfig::default())
    }

    /// Polled once per admission attempt; true admits one worker past
    /// the fleet cap.
    fn launch_override(&self) -> bool {
        false
    }

    /// A worker was forked. Runs in the parent, strictly before any
    /// `reaped_worker` for the same PID.
    fn spawned_worker(&self, _pid: Pid, _parent: Realm, _config: &WorkerConfig) {}

    /// A worker was reaped and removed from the child table.
    fn reaped_worker(&self, _pid: Pid, _kind: WorkerKind) {}

    /// An error event reached the bridge. Runs before registered
    /// handlers; `Stop` swallows the event.
    fn on_error(&self, _event: &ErrorEvent) -> ErrorFlow {
        ErrorFlow::Continue
    }
}

/// Constructor for payload instances.
pub type PayloadFactory = Box<dyn FnMut() -> Box<dyn Payload>>;

/// Owns the payload factory and the at-most-one instance per process.
///
/// The instance is built lazily on first hook dispatch and shared
/// behind an `Arc` so a single-mode run can be hosted on a helper
/// thread. A forked worker drops the inherited instance and builds a
/// fresh one before `run`.
pub struct PayloadHost {
    factory: PayloadFactory,
    instance: Option<Arc<dyn Payload>>,
}

impl std::fmt::Debug for PayloadHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadHost")
            .field("instance", &self.instance.is_some())
            .finish()
    }
}

impl PayloadHost {
    /// Register the payload factory.
    #[must_use]
    pub fn new(factory: PayloadFactory) -> Self {
        Self {
            factory,
            instance: None,
        }
    }

    /// The payload instance, constructing it on first use.
    pub fn payload(&mut self) -> &dyn Payload {
        let Self { factory, instance } = self;
        if instance.is_none() {
            *instance = Some(Arc::from(factory()));
        }
        instance.as_ref().unwrap().as_ref()
    }

    /// A shared handle to the payload instance, constructing it on
    /// first use. Used to hand the instance to the run thread.
    pub fn instance(&mut self) -> Arc<dyn Payload> {
        let Self { factory, instance } = self;
        Arc::clone(instance.get_or_insert_with(|| Arc::from(factory())))
    }

    /// Drop the current instance, if any. The next dispatch constructs
    /// a fresh one.
    pub fn drop_instance(&mut self) {
        self.instance = None;
    }

    /// Whether an instance has been constructed.
    #[must_use]
    pub fn has_instance(&self) -> bool {
        self.instance.is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Minimal;

    impl Payload for Minimal {
        fn run(&self, _worker: Option<&WorkerConfig>) -> ExitKind {
            ExitKind::Halt
        }
    }

    #[test]
    fn test_exit_kind_codes() {
        assert_eq!(ExitKind::Halt.code(), 0);
        assert_eq!(ExitKind::Exit.code(), 8);
        assert_eq!(ExitKind::Restart.code(), 2);
        assert_eq!(ExitKind::Reload.code(), 1);
    }

    #[test]
    fn test_default_hooks_are_inert() {
        let payload = Minimal;
        assert!(payload.cli("anything", &[]).is_none());
        assert!(!payload.signal(Sig::Hup));
        assert!(!payload.launch_override());
        assert_eq!(
            payload.worker_config(),
            Admission::Launch(WorkerConfig::default())
        );
        assert_eq!(
            payload.on_error(&ErrorEvent::new(crate::errors::Severity::Error, "x")),
            ErrorFlow::Continue
        );
    }

    #[test]
    fn test_worker_config_accessors() {
        let config = WorkerConfig::new().with("shard", "3").with("role", "indexer");
        assert_eq!(config.get("shard"), Some("3"));
        assert_eq!(config.get("missing"), None);
        assert_eq!(config.len(), 2);
        assert!(!config.is_empty());

        let mut config = WorkerConfig::new();
        assert!(config.is_empty());
        config.insert("k", "v");
        assert_eq!(config.get("k"), Some("v"));
    }

    #[test]
    fn test_host_builds_instance_lazily() {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&built);
        let mut host = PayloadHost::new(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::new(Minimal)
        }));

        assert!(!host.has_instance());
        assert_eq!(built.load(Ordering::SeqCst), 0);

        let _ = host.payload();
        let _ = host.payload();
        assert!(host.has_instance());
        assert_eq!(built.load(Ordering::SeqCst), 1, "construction happens once");
    }

    #[test]
    fn test_host_rebuilds_after_drop() {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&built);
        let mut host = PayloadHost::new(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::new(Minimal)
        }));

        let _ = host.payload();
        host.drop_instance();
        assert!(!host.has_instance());
        let _ = host.payload();
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_shared_handle_is_the_same_instance() {
        let mut host = PayloadHost::new(Box::new(|| Box::new(Minimal)));
        let first = host.instance();
        let second = host.instance();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(host.has_instance());
    }
}
