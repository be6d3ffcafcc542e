//! Fleet and single-mode supervision.
//!
//! The supervisor owns the child table, the launching flag and the
//! exit aggregate, and drives the fleet loop: admission, signal drain,
//! reap, quiesce, termination check. Parallelism is inter-process via
//! fork; supervision itself is plain sequential code with explicit
//! sleeps. Single mode has no fleet, but it keeps the same cadence:
//! [`run_single`] hosts the payload's `run` on a helper thread so the
//! supervising thread can keep draining the signal inbox while the run
//! is pending.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, error, info, warn};

use crate::config::{ExitPolicy, Options};
use crate::errors::{event_from_panic, ErrorBridge, ErrorEvent};
use crate::lock::PidLock;
use crate::payload::{Admission, Payload, PayloadHost, WorkerConfig, WorkerKind};
use crate::process::{fork_realm, ForkKind, Forked, Realm};
use crate::signal::{Sig, SignalRouter};

/// Pause between supervision loop iterations.
pub const QUIESCE_INTERVAL: Duration = Duration::from_secs(1);

/// Polling interval while force-reap waits for killed children.
pub const FORCE_REAP_INTERVAL: Duration = Duration::from_millis(10);

/// What the loop head should do next. Signals set this; the loop head
/// inspects it instead of unwinding out of the loop body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Directive {
    /// Keep supervising.
    #[default]
    Continue,
    /// Leave the loop and re-enter it with a fresh launching flag.
    Restart,
    /// Leave the loop for good and proceed to teardown.
    Shutdown,
}

/// How one pass through the fleet loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FleetOutcome {
    /// The directive that ended the loop, or `Continue` for a natural
    /// drain-out.
    pub directive: Directive,
    /// The aggregated exit code.
    pub code: i32,
}

/// Aggregates worker exit codes under the configured policy.
#[derive(Debug, Clone, Copy)]
pub struct ExitAggregate {
    policy: ExitPolicy,
    code: i32,
}

impl ExitAggregate {
    /// Start a fresh aggregate.
    #[must_use]
    pub const fn new(policy: ExitPolicy) -> Self {
        Self { policy, code: 0 }
    }

    /// Fold in one reaped worker's exit code.
    pub fn record(&mut self, code: i32) {
        match self.policy {
            ExitPolicy::Success => {}
            ExitPolicy::WorstCase => self.code = self.code.max(code.abs()),
        }
    }

    /// The aggregated code so far. Always 0 under the success policy.
    #[must_use]
    pub const fn code(&self) -> i32 {
        self.code
    }
}

/// One live child, as tracked by the supervisor.
#[derive(Debug, Clone)]
struct WorkerEntry {
    kind: WorkerKind,
    spawned_at: DateTime<Utc>,
}

/// The fleet control loop and its exclusively owned state.
#[derive(Debug)]
pub struct Supervisor {
    children: HashMap<Pid, WorkerEntry>,
    aggregate: ExitAggregate,
    launching: bool,
    force_reaped: bool,
    directive: Directive,
}

impl Supervisor {
    /// Create a supervisor with an empty child table and launching
    /// enabled.
    #[must_use]
    pub fn new(policy: ExitPolicy) -> Self {
        Self {
            children: HashMap::new(),
            aggregate: ExitAggregate::new(policy),
            launching: true,
            force_reaped: false,
            directive: Directive::Continue,
        }
    }

    /// Number of workers currently tracked.
    #[must_use]
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Whether new launches are still admitted.
    #[must_use]
    pub const fn is_launching(&self) -> bool {
        self.launching
    }

    /// Disable further launches; outstanding workers drain out.
    pub const fn halt_launches(&mut self) {
        self.launching = false;
    }

    /// The aggregated exit code so far.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        self.aggregate.code()
    }

    /// Drive the fleet loop until a directive or a natural drain-out
    /// ends it. Default dispositions for the core signals are restored
    /// on the way out, except on a restart directive: the caller
    /// re-enters the loop immediately and the handlers must survive
    /// the hand-off, or the next SIGHUP would kill the daemon outright.
    pub fn run(
        &mut self,
        host: &mut PayloadHost,
        router: &SignalRouter,
        bridge: &mut ErrorBridge,
        options: &Options,
        lock: &PidLock,
        realm: Realm,
    ) -> FleetOutcome {
        self.directive = Directive::Continue;
        info!(fleet = options.fleet, realm = %realm, "entering fleet loop");

        loop {
            self.admit(host, bridge, options, lock, realm);

            for sig in router.drain() {
                self.handle_signal(sig, host, router);
            }

            self.reap(host);

            if self.directive != Directive::Continue {
                break;
            }
            if !self.launching && self.children.is_empty() {
                break;
            }

            thread::sleep(QUIESCE_INTERVAL);
        }

        if self.directive != Directive::Restart {
            router.restore_core_defaults();
        }
        info!(code = self.aggregate.code(), directive = ?self.directive, "fleet loop done");
        FleetOutcome {
            directive: self.directive,
            code: self.aggregate.code(),
        }
    }

    /// Admission phase: launch workers until the cap is met, the
    /// payload declines, or a fork fails.
    ///
    /// In a successfully forked child this function never returns: the
    /// worker resets its signal dispositions, runs a fresh payload
    /// instance and exits with the translated code.
    fn admit(
        &mut self,
        host: &mut PayloadHost,
        bridge: &mut ErrorBridge,
        options: &Options,
        lock: &PidLock,
        realm: Realm,
    ) {
        if !self.launching || options.fleet == 0 {
            return;
        }

        while self.children.len() < options.fleet as usize || host.payload().launch_override() {
            match host.payload().worker_config() {
                Admission::Refuse => {
                    debug!("payload refused this admission phase");
                    break;
                }
                Admission::Halt => {
                    info!("payload halted further launches");
                    self.launching = false;
                    break;
                }
                Admission::Launch(config) => {
                    match fork_realm(ForkKind::Fleet, false, lock, options) {
                        Ok(Forked::Child { .. }) => {
                            if let Err(e) = SignalRouter::reset_to_defaults() {
                                warn!(error = %e, "worker kept inherited signal handlers");
                            }
                            host.drop_instance();
                            let code = run_payload(host, bridge, Some(&config));
                            process::exit(code);
                        }
                        Ok(Forked::Parent { child }) => {
                            self.record_spawn(child, WorkerKind::Worker);
                            host.payload().spawned_worker(child, realm, &config);
                        }
                        Err(e) => {
                            error!(error = %e, "worker fork failed, halting launches");
                            self.launching = false;
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Act on one drained signal.
    fn handle_signal(&mut self, sig: Sig, host: &mut PayloadHost, router: &SignalRouter) {
        match sig {
            Sig::Hup => {
                if host.payload().signal(Sig::Hup) {
                    debug!("payload claimed SIGHUP");
                } else {
                    info!("fleet restart requested via SIGHUP");
                    self.directive = Directive::Restart;
                }
            }
            Sig::Int | Sig::Term => {
                info!(signal = %sig, "orderly shutdown requested");
                host.payload().shutdown();
                self.force_reap(router, host);
                host.payload().signal(sig);
                self.directive = Directive::Shutdown;
            }
            Sig::Chld => self.reap(host),
            Sig::Usr1 | Sig::Usr2 => {
                host.payload().signal(sig);
            }
        }
    }

    /// Reap phase: collect every exited child without blocking.
    fn reap(&mut self, host: &mut PayloadHost) {
        loop {
            match waitpid(None::<Pid>, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    if let Some(kind) = self.record_exit(pid, Some(code)) {
                        host.payload().reaped_worker(pid, kind);
                    }
                }
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    // No exit status to aggregate; the slot is still freed.
                    if let Some(kind) = self.record_exit(pid, None) {
                        debug!(pid = pid.as_raw(), signal = %signal, "worker killed by signal");
                        host.payload().reaped_worker(pid, kind);
                    }
                }
                Ok(WaitStatus::StillAlive) => break,
                Ok(_) => {}
                Err(Errno::ECHILD) => break,
                Err(Errno::EINTR) => {}
                Err(errno) => {
                    warn!(%errno, "waitpid failed");
                    break;
                }
            }
        }
    }

    /// Kill and collect every outstanding worker. Idempotent: a second
    /// call observes the latch and does nothing.
    pub fn force_reap(&mut self, router: &SignalRouter, host: &mut PayloadHost) {
        if self.force_reaped {
            return;
        }
        self.force_reaped = true;

        info!(children = self.children.len(), "force-reaping outstanding workers");
        for pid in self.children.keys().copied().collect::<Vec<_>>() {
            if let Err(errno) = kill(pid, Signal::SIGKILL) {
                debug!(pid = pid.as_raw(), %errno, "SIGKILL delivery failed");
            }
        }

        let _ = router.drain();

        loop {
            self.reap(host);
            if self.children.is_empty() {
                break;
            }
            thread::sleep(FORCE_REAP_INTERVAL);
        }
    }

    fn record_spawn(&mut self, pid: Pid, kind: WorkerKind) {
        debug!(pid = pid.as_raw(), kind = %kind, "worker spawned");
        self.children.insert(
            pid,
            WorkerEntry {
                kind,
                spawned_at: Utc::now(),
            },
        );
    }

    /// Remove a reaped child from the table, feeding the aggregate
    /// when an exit status is available. Unknown PIDs are ignored.
    fn record_exit(&mut self, pid: Pid, code: Option<i32>) -> Option<WorkerKind> {
        let entry = self.children.remove(&pid)?;
        let uptime_ms = Utc::now()
            .signed_duration_since(entry.spawned_at)
            .num_milliseconds();
        if let Some(code) = code {
            self.aggregate.record(code);
            debug!(pid = pid.as_raw(), code, uptime_ms, "worker reaped");
        }
        Some(entry.kind)
    }
}

/// Location of the most recent payload panic, captured by the
/// temporary panic hook in [`contained_run`].
static PANIC_LOCATION: Mutex<Option<(String, u32)>> = Mutex::new(None);

/// Run the payload once with panic containment, translating the
/// outcome into the stable exit-code contract. A panic yields code 1
/// plus the fault event, located when the hook saw it.
fn contained_run(payload: &dyn Payload, worker: Option<&WorkerConfig>) -> (i32, Option<ErrorEvent>) {
    let prior = panic::take_hook();
    panic::set_hook(Box::new(|info| {
        if let Some(location) = info.location() {
            if let Ok(mut slot) = PANIC_LOCATION.lock() {
                *slot = Some((location.file().to_string(), location.line()));
            }
        }
    }));

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| payload.run(worker)));
    panic::set_hook(prior);

    match outcome {
        Ok(kind) => (kind.code(), None),
        Err(panic_payload) => {
            let mut event = event_from_panic(panic_payload.as_ref());
            if let Ok(mut slot) = PANIC_LOCATION.lock() {
                if let Some((file, line)) = slot.take() {
                    event = event.with_location(file, line);
                }
            }
            (1, Some(event))
        }
    }
}

/// Log a contained payload fault and offer it to the bridge.
fn report_fault(event: &ErrorEvent, bridge: &mut ErrorBridge, payload: &dyn Payload) {
    match event.location() {
        Some(location) => {
            error!(message = %event.message, %location, "payload run failed");
        }
        None => error!(message = %event.message, "payload run failed"),
    }
    bridge.report(event, Some(payload));
}

/// Run the payload once and translate its outcome into the stable
/// exit-code contract. A panicking payload is contained: the fault is
/// reported through the bridge with its source location and the
/// translated code is 1.
pub fn run_payload(
    host: &mut PayloadHost,
    bridge: &mut ErrorBridge,
    worker: Option<&WorkerConfig>,
) -> i32 {
    let (code, fault) = contained_run(host.payload(), worker);
    if let Some(event) = fault {
        report_fault(&event, bridge, host.payload());
    }
    code
}

/// Supervise a single-mode payload run.
///
/// `run` executes on a helper thread so this thread can keep draining
/// the signal inbox at the quiesce cadence: INT and TERM reach the
/// `shutdown` and `signal` hooks and produce an orderly clean exit
/// even while the run is pending, and HUP/USR1/USR2 are forwarded to
/// the `signal` hook as they arrive. A run still pending when shutdown
/// wins is abandoned to process exit. Core signal dispositions are
/// restored on the way out.
pub fn run_single(host: &mut PayloadHost, router: &SignalRouter, bridge: &mut ErrorBridge) -> i32 {
    let payload = host.instance();
    let (tx, rx) = mpsc::channel();

    let runner = {
        let payload = Arc::clone(&payload);
        thread::Builder::new()
            .name("warden-payload".to_string())
            .spawn(move || {
                let _ = tx.send(contained_run(payload.as_ref(), None));
            })
    };
    if let Err(e) = runner {
        error!(error = %e, "could not spawn the payload run thread");
        return 1;
    }

    let code = 'supervise: loop {
        match rx.recv_timeout(QUIESCE_INTERVAL) {
            Ok((code, fault)) => {
                if let Some(event) = fault {
                    report_fault(&event, bridge, payload.as_ref());
                }
                break 'supervise code;
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                for sig in router.drain() {
                    match sig {
                        Sig::Int | Sig::Term => {
                            info!(signal = %sig, "orderly shutdown requested");
                            payload.shutdown();
                            payload.signal(sig);
                            break 'supervise 0;
                        }
                        Sig::Hup | Sig::Usr1 | Sig::Usr2 => {
                            payload.signal(sig);
                        }
                        // No supervised children in single mode.
                        Sig::Chld => {}
                    }
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                error!("payload run thread vanished");
                break 'supervise 1;
            }
        }
    };

    router.restore_core_defaults();
    code
}
