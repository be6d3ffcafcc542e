//! Top-level lifecycle dispatch.
//!
//! [`Warden`] ties the pieces together: it owns the options, the
//! payload host, the error bridge and the lock, and routes the built-in
//! commands (`start`, `stop`, `restart`, `status`) plus whatever the
//! payload registered through its `preflight` hook. The argument source
//! is opaque: callers hand over whatever iterator of strings they
//! parsed their process arguments into.

use std::env;
use std::ffi::OsString;
use std::thread;

use clap::{Arg, ArgAction, ArgMatches, Command};
use nix::sys::signal::{kill, Signal};
use nix::unistd::geteuid;
use tracing::{error, info, warn};

use crate::config::{Mode, Options};
use crate::errors::{ErrorBridge, Severity, WardenError};
use crate::lock::PidLock;
use crate::payload::{PayloadFactory, PayloadHost};
use crate::process::{self, fork_realm, ForkKind, Forked, Realm};
use crate::signal::SignalRouter;
use crate::supervisor::{run_single, Directive, Supervisor};

/// Exit code for a command nobody handled.
pub const EXIT_USAGE: i32 = 64;

/// The daemon supervisor entry point.
pub struct Warden {
    options: Options,
    host: PayloadHost,
    bridge: ErrorBridge,
    lock: PidLock,
}

impl std::fmt::Debug for Warden {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Warden")
            .field("appname", &self.options.appname)
            .field("pidfile", &self.lock.path())
            .finish()
    }
}

impl Warden {
    /// Build a supervisor from validated options and a payload factory.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the options fail validation.
    pub fn new(options: Options, factory: PayloadFactory) -> Result<Self, WardenError> {
        options.validate()?;
        let lock = PidLock::new(options.pid_file());
        let bridge = ErrorBridge::new(Severity::from_filter(&options.loglevel));
        Ok(Self {
            options,
            host: PayloadHost::new(factory),
            bridge,
            lock,
        })
    }

    /// The configuration this supervisor runs with.
    #[must_use]
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Dispatch a command against the lifecycle and return the process
    /// exit code the invoker should use.
    ///
    /// With daemonization disabled, `start` is forced regardless of the
    /// parsed command; that is the foreground mode used for debugging
    /// and containers.
    pub fn attach<I, S>(&mut self, args: I) -> i32
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();

        let command = self.host.payload().preflight(build_command(&self.options));
        let argv = std::iter::once(self.options.appname.clone()).chain(args.iter().cloned());
        let matches = match command.try_get_matches_from(argv) {
            Ok(matches) => matches,
            Err(e) => {
                let _ = e.print();
                return EXIT_USAGE;
            }
        };

        if !self.options.daemonize {
            let watchdog = matches
                .subcommand()
                .is_some_and(|(name, sub)| name == "start" && sub.get_flag("watchdog"));
            return self.start(watchdog, &args);
        }

        match matches.subcommand() {
            Some(("status", _)) => self.status(),
            Some(("stop", _)) => self.stop(),
            Some(("restart", _)) => {
                let _ = self.stop();
                self.start(false, &args)
            }
            Some(("start", sub)) => self.start(sub.get_flag("watchdog"), &args),
            Some((other, sub)) => self.dispatch_fallthrough(other, sub),
            None => {
                error!("no command given");
                EXIT_USAGE
            }
        }
    }

    /// Route an unknown command to the payload's `cli` hook.
    fn dispatch_fallthrough(&mut self, name: &str, sub: &ArgMatches) -> i32 {
        // External subcommands carry their trailing words under the
        // empty id; commands the payload registered via preflight have
        // no such id, hence the fallible lookup.
        let rest: Vec<String> = sub
            .try_get_many::<OsString>("")
            .ok()
            .flatten()
            .map(|values| {
                values
                    .map(|value| value.to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();

        match self.host.payload().cli(name, &rest) {
            Some(code) => code,
            None => {
                error!(command = name, "unhandled command");
                EXIT_USAGE
            }
        }
    }

    /// Report whether a live daemon holds the lock.
    fn status(&self) -> i32 {
        if self.lock.is_held() {
            if let Some(pid) = self.lock.held_by() {
                info!(pid = pid.as_raw(), "daemon is running");
            }
            0
        } else {
            info!("daemon is not running");
            1
        }
    }

    /// Stop the locked daemon: SIGTERM, grace, SIGKILL, grace. The lock
    /// file is removed only once the PID is confirmed dead.
    fn stop(&self) -> i32 {
        let Some(pid) = self.lock.held_by() else {
            warn!("daemon is not running");
            return 1;
        };
        if !PidLock::is_alive(pid) {
            info!(pid = pid.as_raw(), "daemon is not running, clearing stale lock");
            self.lock.release();
            return 1;
        }

        info!(pid = pid.as_raw(), "stopping daemon");
        if let Err(errno) = kill(pid, Signal::SIGTERM) {
            warn!(pid = pid.as_raw(), %errno, "SIGTERM delivery failed");
        }
        thread::sleep(self.options.stop_grace);

        if PidLock::is_alive(pid) {
            warn!(pid = pid.as_raw(), "daemon ignored SIGTERM, escalating to SIGKILL");
            if let Err(errno) = kill(pid, Signal::SIGKILL) {
                warn!(pid = pid.as_raw(), %errno, "SIGKILL delivery failed");
            }
            thread::sleep(self.options.stop_grace);
        }

        if PidLock::is_alive(pid) {
            warn!(pid = pid.as_raw(), "daemon survived SIGKILL");
            return 1;
        }

        self.lock.release();
        info!("daemon stopped");
        0
    }

    /// The start sequence: lock check, identity pre-check, optional
    /// daemon fork, then the serving phase shared by both modes.
    fn start(&mut self, watchdog: bool, args: &[String]) -> i32 {
        if !self.options.concurrent && self.lock.is_held() {
            warn!(appname = %self.options.appname, "already running");
            return i32::from(!watchdog);
        }

        self.options.runtime.effective_uid = Some(geteuid().as_raw());

        if let Err(e) = process::require_root_for_identity(&self.options) {
            error!(error = %e, "refusing to start");
            return 1;
        }

        let realm = if self.options.daemonize {
            match fork_realm(ForkKind::Daemon, true, &self.lock, &self.options) {
                Ok(Forked::Parent { child }) => {
                    info!(pid = child.as_raw(), "daemon detached into background");
                    return 0;
                }
                Ok(Forked::Child { realm }) => realm,
                Err(e) => {
                    error!(error = %e, "daemonization failed");
                    return 1;
                }
            }
        } else {
            Realm::Foreground
        };

        self.serve(realm, args)
    }

    /// Everything after the daemon fork: handlers, environment capture,
    /// payload initialization, mode dispatch and teardown. Shared by
    /// the daemon and foreground realms.
    fn serve(&mut self, realm: Realm, args: &[String]) -> i32 {
        let router = match SignalRouter::install() {
            Ok(router) => router,
            Err(e) => {
                error!(error = %e, "could not install signal handlers");
                return 1;
            }
        };

        self.options.runtime.invoked_by = env::var("LOGNAME").ok();
        self.options.runtime.tty = nix::unistd::ttyname(std::io::stdin())
            .ok()
            .map(|path| path.display().to_string());

        if realm == Realm::Daemon {
            if let Some(dir) = &self.options.appdir {
                if let Err(e) = env::set_current_dir(dir) {
                    warn!(dir = %dir.display(), error = %e, "could not enter appdir");
                }
            }
        }

        self.host.payload().initialize(args);
        info!(realm = %realm, mode = %self.options.mode, "payload initialized");

        let code = match self.options.mode {
            // Single mode keeps the inbox drained while run() is
            // pending, so INT/TERM still produce an orderly shutdown.
            Mode::Single => run_single(&mut self.host, &router, &mut self.bridge),
            Mode::Fleet => self.supervise(realm, &router),
        };

        self.host.payload().dismiss();
        if realm == Realm::Daemon {
            self.lock.release();
        }
        code
    }

    /// Run the fleet loop, re-entering it whenever a restart directive
    /// ends a pass.
    fn supervise(&mut self, realm: Realm, router: &SignalRouter) -> i32 {
        loop {
            let mut supervisor = Supervisor::new(self.options.exitmode);
            let outcome = supervisor.run(
                &mut self.host,
                router,
                &mut self.bridge,
                &self.options,
                &self.lock,
                realm,
            );
            match outcome.directive {
                Directive::Restart => {
                    info!("re-entering fleet loop");
                }
                Directive::Shutdown | Directive::Continue => return outcome.code,
            }
        }
    }
}

/// The built-in command surface. The payload's `preflight` hook may
/// extend the returned `Command` before parsing.
fn build_command(options: &Options) -> Command {
    Command::new(options.appname.clone())
        .about(options.appdescription.clone())
        .allow_external_subcommands(true)
        .subcommand(
            Command::new("start")
                .about("Launch the daemon")
                .arg(
                    Arg::new("watchdog")
                        .short('w')
                        .long("watchdog")
                        .action(ArgAction::SetTrue)
                        .help("Treat an already-running daemon as success"),
                ),
        )
        .subcommand(Command::new("stop").about("Stop the running daemon"))
        .subcommand(Command::new("restart").about("Stop the running daemon, then start it again"))
        .subcommand(Command::new("status").about("Report whether the daemon is running"))
}
