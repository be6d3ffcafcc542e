//! Supervisor configuration.
//!
//! [`Options`] is the owned configuration object threaded through the
//! whole lifecycle: built up before `attach`, append-mostly during
//! startup (runtime observations land in [`RuntimeInfo`]), read-mostly
//! afterwards. Values load from a TOML file or through the builder.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Execution model for the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// One payload instance runs in the daemon process itself.
    #[default]
    Single,
    /// The daemon supervises a fleet of forked worker processes.
    Fleet,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single => write!(f, "single"),
            Self::Fleet => write!(f, "fleet"),
        }
    }
}

/// Policy for aggregating worker exit codes into the daemon's own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExitPolicy {
    /// Always exit 0, whatever the workers returned.
    #[default]
    Success,
    /// Exit with the largest absolute worker exit code seen.
    WorstCase,
}

impl std::fmt::Display for ExitPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::WorstCase => write!(f, "worst-case"),
        }
    }
}

/// Facts about the invoking environment, captured during startup.
///
/// Not part of the persisted configuration.
#[derive(Debug, Clone, Default)]
pub struct RuntimeInfo {
    /// Effective UID recorded at the start of the start sequence.
    pub effective_uid: Option<u32>,
    /// Login name of the invoking user, from `LOGNAME`.
    pub invoked_by: Option<String>,
    /// Controlling terminal name, when stdin is a tty.
    pub tty: Option<String>,
}

/// Process-wide supervisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    /// Application name. Required; the default PID file path derives
    /// from its lowercase form.
    pub appname: String,

    /// Description shown in the command-line help.
    #[serde(default)]
    pub appdescription: String,

    /// Application home directory. Required unless `pidfile` is set
    /// explicitly; the daemon changes into it after detaching.
    #[serde(default)]
    pub appdir: Option<PathBuf>,

    /// Explicit PID file path, overriding the derived default.
    #[serde(default)]
    pub pidfile: Option<PathBuf>,

    /// Detach into the background. When false the invoker plays the
    /// supervisor role in the foreground.
    #[serde(default = "default_daemonize")]
    pub daemonize: bool,

    /// Skip the single-instance lock check on start.
    #[serde(default)]
    pub concurrent: bool,

    /// Execution model.
    #[serde(default)]
    pub mode: Mode,

    /// Maximum concurrent workers in fleet mode.
    #[serde(default = "default_fleet")]
    pub fleet: u32,

    /// Exit-code aggregation policy.
    #[serde(default)]
    pub exitmode: ExitPolicy,

    /// Drop to this user after the daemon fork. Requires root.
    #[serde(default)]
    pub runasuser: Option<String>,

    /// Drop to this group after the daemon fork. Requires root.
    #[serde(default)]
    pub runasgroup: Option<String>,

    /// Minimum severity emitted to the log sink.
    #[serde(default = "default_loglevel")]
    pub loglevel: String,

    /// Grace period between SIGTERM and SIGKILL when stopping, and
    /// again after SIGKILL before giving up.
    #[serde(default = "default_stop_grace")]
    #[serde(with = "humantime_serde")]
    pub stop_grace: Duration,

    /// Startup observations. Never serialized.
    #[serde(skip)]
    pub runtime: RuntimeInfo,
}

fn default_daemonize() -> bool {
    true
}

const fn default_fleet() -> u32 {
    1
}

fn default_loglevel() -> String {
    "warn".to_string()
}

const fn default_stop_grace() -> Duration {
    Duration::from_secs(1)
}

impl Default for Options {
    fn default() -> Self {
        Self {
            appname: String::new(),
            appdescription: String::new(),
            appdir: None,
            pidfile: None,
            daemonize: default_daemonize(),
            concurrent: false,
            mode: Mode::default(),
            fleet: default_fleet(),
            exitmode: ExitPolicy::default(),
            runasuser: None,
            runasgroup: None,
            loglevel: default_loglevel(),
            stop_grace: default_stop_grace(),
            runtime: RuntimeInfo::default(),
        }
    }
}

impl Options {
    /// Create a new builder for `Options`.
    #[must_use]
    pub fn builder() -> OptionsBuilder {
        OptionsBuilder::default()
    }

    /// Load options from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, cannot be parsed,
    /// or fails validation.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let options: Self = toml::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        options.validate()?;
        Ok(options)
    }

    /// Validate the required-field invariants.
    ///
    /// # Errors
    ///
    /// Returns an error when `appname` is empty, when neither `appdir`
    /// nor `pidfile` is set, or when `fleet` is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.appname.trim().is_empty() {
            return Err(ConfigError::MissingAppname);
        }
        if self.appdir.is_none() && self.pidfile.is_none() {
            return Err(ConfigError::MissingPidfileBasis);
        }
        if self.fleet == 0 {
            return Err(ConfigError::ZeroFleet);
        }
        Ok(())
    }

    /// The PID file path: the explicit override when set, otherwise
    /// `/var/run/<appname-lowercase>.pid`.
    #[must_use]
    pub fn pid_file(&self) -> PathBuf {
        self.pidfile.clone().unwrap_or_else(|| {
            PathBuf::from(format!("/var/run/{}.pid", self.appname.to_lowercase()))
        })
    }
}

/// Builder for [`Options`].
#[derive(Debug, Default)]
pub struct OptionsBuilder {
    options: Options,
}

impl OptionsBuilder {
    /// Set the application name.
    #[must_use]
    pub fn appname(mut self, appname: impl Into<String>) -> Self {
        self.options.appname = appname.into();
        self
    }

    /// Set the CLI description text.
    #[must_use]
    pub fn appdescription(mut self, description: impl Into<String>) -> Self {
        self.options.appdescription = description.into();
        self
    }

    /// Set the application home directory.
    #[must_use]
    pub fn appdir(mut self, appdir: impl Into<PathBuf>) -> Self {
        self.options.appdir = Some(appdir.into());
        self
    }

    /// Override the PID file path.
    #[must_use]
    pub fn pidfile(mut self, pidfile: impl Into<PathBuf>) -> Self {
        self.options.pidfile = Some(pidfile.into());
        self
    }

    /// Enable or disable daemonization.
    #[must_use]
    pub const fn daemonize(mut self, daemonize: bool) -> Self {
        self.options.daemonize = daemonize;
        self
    }

    /// Allow concurrent instances (skip the lock check).
    #[must_use]
    pub const fn concurrent(mut self, concurrent: bool) -> Self {
        self.options.concurrent = concurrent;
        self
    }

    /// Set the execution model.
    #[must_use]
    pub const fn mode(mut self, mode: Mode) -> Self {
        self.options.mode = mode;
        self
    }

    /// Set the worker cap for fleet mode.
    #[must_use]
    pub const fn fleet(mut self, fleet: u32) -> Self {
        self.options.fleet = fleet;
        self
    }

    /// Set the exit-code aggregation policy.
    #[must_use]
    pub const fn exitmode(mut self, exitmode: ExitPolicy) -> Self {
        self.options.exitmode = exitmode;
        self
    }

    /// Drop to this user after the daemon fork.
    #[must_use]
    pub fn runasuser(mut self, user: impl Into<String>) -> Self {
        self.options.runasuser = Some(user.into());
        self
    }

    /// Drop to this group after the daemon fork.
    #[must_use]
    pub fn runasgroup(mut self, group: impl Into<String>) -> Self {
        self.options.runasgroup = Some(group.into());
        self
    }

    /// Set the log level floor.
    #[must_use]
    pub fn loglevel(mut self, loglevel: impl Into<String>) -> Self {
        self.options.loglevel = loglevel.into();
        self
    }

    /// Set the stop grace period.
    #[must_use]
    pub const fn stop_grace(mut self, grace: Duration) -> Self {
        self.options.stop_grace = grace;
        self
    }

    /// Validate and produce the final `Options`.
    ///
    /// # Errors
    ///
    /// Returns the first validation failure, as [`Options::validate`].
    pub fn build(self) -> Result<Options, ConfigError> {
        self.options.validate()?;
        Ok(self.options)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The `appname` option is required.
    #[error("missing required option: appname")]
    MissingAppname,

    /// Either `appdir` or an explicit `pidfile` must be present.
    #[error("missing required option: appdir or pidfile")]
    MissingPidfileBasis,

    /// `fleet` must be at least 1.
    #[error("fleet must be at least 1")]
    ZeroFleet,

    /// Failed to read the configuration file.
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        /// The file that could not be read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the configuration file.
    #[error("failed to parse {}: {detail}", .path.display())]
    Parse {
        /// The file that could not be parsed.
        path: PathBuf,
        /// Parser diagnostic.
        detail: String,
    },
}


mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
