//! Worst-case exit aggregation across a fleet.
//!
//! Two workers return different outcomes; under the worst-case policy
//! the daemon's own exit code is the largest translated code seen.
//! This test forks real workers and therefore lives alone in its file.

use std::sync::{Arc, Mutex};

use warden_core::config::{ExitPolicy, Mode, Options};
use warden_core::lifecycle::Warden;
use warden_core::payload::{Admission, ExitKind, Payload, WorkerConfig};

struct MixedOutcomes {
    launches: Arc<Mutex<usize>>,
}

impl Payload for MixedOutcomes {
    fn run(&self, worker: Option<&WorkerConfig>) -> ExitKind {
        match worker.and_then(|config| config.get("outcome")) {
            Some("exit") => ExitKind::Exit,
            Some("reload") => ExitKind::Reload,
            _ => ExitKind::Halt,
        }
    }

    fn worker_config(&self) -> Admission {
        let mut launches = self.launches.lock().unwrap();
        let outcome = match *launches {
            0 => "reload",
            1 => "exit",
            _ => return Admission::Halt,
        };
        *launches += 1;
        Admission::Launch(WorkerConfig::new().with("outcome", outcome))
    }
}

#[test]
fn worst_case_policy_propagates_the_largest_worker_code() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let launches = Arc::new(Mutex::new(0));

    let options = Options::builder()
        .appname("t")
        .appdir(tmp.path())
        .pidfile(tmp.path().join("t.pid"))
        .daemonize(false)
        .mode(Mode::Fleet)
        .fleet(2)
        .exitmode(ExitPolicy::WorstCase)
        .build()
        .expect("valid options");

    let factory = {
        let launches = Arc::clone(&launches);
        Box::new(move || {
            Box::new(MixedOutcomes {
                launches: Arc::clone(&launches),
            }) as Box<dyn Payload>
        })
    };

    let mut warden = Warden::new(options, factory).expect("construct warden");

    // reload translates to 1, error halt to 8; max(|1|, |8|) wins.
    assert_eq!(warden.attach(["start"]), 8);
}
