//! Command routing: built-ins, payload-registered commands, and the
//! fall-through to the payload's `cli` hook.

use clap::Command;
use warden_core::config::Options;
use warden_core::lifecycle::{Warden, EXIT_USAGE};
use warden_core::payload::{ExitKind, Payload, WorkerConfig};

struct CliPayload;

impl Payload for CliPayload {
    fn preflight(&self, command: Command) -> Command {
        command.subcommand(Command::new("ping").about("Registered by the payload"))
    }

    fn run(&self, _worker: Option<&WorkerConfig>) -> ExitKind {
        ExitKind::Halt
    }

    fn cli(&self, command: &str, args: &[String]) -> Option<i32> {
        match command {
            "ping" => Some(7),
            "greet" => Some(i32::try_from(args.len()).unwrap_or(0) + 40),
            _ => None,
        }
    }
}

fn warden(tmp: &tempfile::TempDir) -> Warden {
    let options = Options::builder()
        .appname("t")
        .pidfile(tmp.path().join("t.pid"))
        .build()
        .expect("valid options");
    Warden::new(options, Box::new(|| Box::new(CliPayload))).expect("construct warden")
}

#[test]
fn payload_registered_command_routes_to_cli_hook() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let mut warden = warden(&tmp);
    assert_eq!(warden.attach(["ping"]), 7);
}

#[test]
fn external_command_reaches_cli_hook_with_arguments() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let mut warden = warden(&tmp);
    assert_eq!(warden.attach(["greet", "alice", "bob"]), 42);
}

#[test]
fn unhandled_command_is_a_usage_error() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let mut warden = warden(&tmp);
    assert_eq!(warden.attach(["frobnicate"]), EXIT_USAGE);
}

#[test]
fn missing_command_is_a_usage_error() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let mut warden = warden(&tmp);
    let empty: [&str; 0] = [];
    assert_eq!(warden.attach(empty), EXIT_USAGE);
}

#[test]
fn status_without_lock_reports_not_running() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let mut warden = warden(&tmp);
    assert_eq!(warden.attach(["status"]), 1);
}

#[test]
fn stop_without_lock_reports_not_running() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let mut warden = warden(&tmp);
    assert_eq!(warden.attach(["stop"]), 1);
}
