//! Command round-trips against a live lock: `status`, the watchdog
//! flag on `start`, the TERM-then-KILL stop ladder, and stale-lock
//! recovery.
//!
//! The "daemon" here is a detached shell process (double-spawned so it
//! is reparented to init and never becomes our zombie) whose PID is
//! written into the lock, which is exactly what a real daemon leaves
//! behind.

use std::fs;

use nix::unistd::Pid;
use warden_core::config::Options;
use warden_core::lifecycle::Warden;
use warden_core::lock::PidLock;
use warden_core::payload::{ExitKind, Payload, WorkerConfig};

struct Inert;

impl Payload for Inert {
    fn run(&self, _worker: Option<&WorkerConfig>) -> ExitKind {
        ExitKind::Halt
    }
}

/// Spawn `body` under `sh`, detached from this process, and return the
/// new PID. The intermediate shell exits immediately, so the spawned
/// process is reaped by init rather than lingering as our zombie.
fn spawn_detached(body: &str) -> Pid {
    let output = std::process::Command::new("sh")
        .arg("-c")
        .arg(format!("{body} & echo $!"))
        .output()
        .expect("spawn detached process");
    let pid: i32 = String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse()
        .expect("parse detached pid");
    Pid::from_raw(pid)
}

fn warden(pidfile: &std::path::Path) -> Warden {
    let options = Options::builder()
        .appname("t")
        .pidfile(pidfile)
        .build()
        .expect("valid options");
    Warden::new(options, Box::new(|| Box::new(Inert))).expect("construct warden")
}

#[test]
fn status_start_stop_round_trip() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let pidfile = tmp.path().join("t.pid");
    let mut warden = warden(&pidfile);

    // Nothing running yet.
    assert_eq!(warden.attach(["status"]), 1);

    // A detached sleeper stands in for a running daemon.
    let daemon = spawn_detached("sleep 30");
    let lock = PidLock::new(&pidfile);
    assert!(lock.acquire(Some(daemon)));

    assert_eq!(warden.attach(["status"]), 0);

    // A second start loses the lock race; the watchdog flag downgrades
    // that to success for polling supervisors.
    assert_eq!(warden.attach(["start"]), 1);
    assert_eq!(warden.attach(["start", "-w"]), 0);

    // Stop delivers SIGTERM, confirms death, and clears the lock.
    assert_eq!(warden.attach(["stop"]), 0);
    assert!(!pidfile.exists(), "stop must remove the lock file");
    assert!(!PidLock::is_alive(daemon));

    assert_eq!(warden.attach(["status"]), 1);
    assert_eq!(warden.attach(["stop"]), 1);
}

#[test]
fn stop_escalates_to_sigkill_for_term_ignoring_daemon() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let pidfile = tmp.path().join("t.pid");
    let mut warden = warden(&pidfile);

    let stubborn = spawn_detached("( trap '' TERM; while :; do sleep 1; done )");
    let lock = PidLock::new(&pidfile);
    assert!(lock.acquire(Some(stubborn)));

    assert_eq!(warden.attach(["stop"]), 0);
    assert!(!PidLock::is_alive(stubborn), "SIGKILL must have landed");
    assert!(!pidfile.exists());
}

#[test]
fn stale_lock_is_recovered_by_status() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let pidfile = tmp.path().join("t.pid");
    let mut warden = warden(&pidfile);

    // A PID far above pid_max: the recorded owner is gone.
    fs::write(&pidfile, "4000000\n").expect("seed stale lock");

    assert_eq!(warden.attach(["status"]), 1);
    assert!(!pidfile.exists(), "the stale lock must be removed on check");
}

#[test]
fn stale_lock_makes_stop_report_not_running() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let pidfile = tmp.path().join("t.pid");
    let mut warden = warden(&pidfile);

    fs::write(&pidfile, "4000000\n").expect("seed stale lock");

    assert_eq!(warden.attach(["stop"]), 1);
    assert!(!pidfile.exists());
}
