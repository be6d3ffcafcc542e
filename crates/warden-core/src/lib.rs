//! # warden-core
//!
//! Core library for warden, a UNIX daemon supervisor. It takes a
//! user-supplied application payload and runs it as a long-lived
//! background process, optionally as a supervised fleet of homogeneous
//! worker processes.
//!
//! ## Features
//!
//! - **Lifecycle dispatch**: `start`, `stop`, `restart`, `status`, plus
//!   payload-registered commands, against a PID-file lock
//! - **Daemonization**: fork + setsid with optional identity drops
//! - **Fleet supervision**: launch admission up to a worker cap,
//!   asynchronous reaping, exit-code aggregation, orderly teardown
//! - **Signal routing**: async-safe inbox drained at loop ticks
//! - **Hook contract**: the payload opts into capabilities by
//!   overriding trait methods
//!
//! ## Example
//!
//! ```rust,no_run
//! use warden_core::config::Options;
//! use warden_core::lifecycle::Warden;
//! use warden_core::payload::{ExitKind, Payload, WorkerConfig};
//!
//! struct App;
//!
//! impl Payload for App {
//!     fn run(&self, _worker: Option<&WorkerConfig>) -> ExitKind {
//!         ExitKind::Halt
//!     }
//! }
//!
//! let options = Options::builder()
//!     .appname("app")
//!     .appdir("/var/lib/app")
//!     .build()
//!     .expect("valid options");
//! let mut warden = Warden::new(options, Box::new(|| Box::new(App))).expect("construct");
//! std::process::exit(warden.attach(std::env::args().skip(1)));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod errors;
pub mod lifecycle;
pub mod lock;
pub mod logging;
pub mod payload;
pub mod process;
pub mod signal;
pub mod supervisor;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{ExitPolicy, Mode, Options};
    pub use crate::lifecycle::Warden;
    pub use crate::payload::{Admission, ExitKind, Payload, PayloadFactory, WorkerConfig};
    pub use crate::process::Realm;
    pub use crate::signal::Sig;
}

/// Re-export commonly used types at the crate root.
pub use config::{ExitPolicy, Mode, Options};
pub use lifecycle::Warden;
pub use payload::{Admission, ExitKind, Payload, PayloadFactory, WorkerConfig, WorkerKind};
pub use process::Realm;
pub use signal::Sig;
