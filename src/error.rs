//! Error taxonomy for the supervisor.
use thiserror::Error;

/// Errors raised while loading or validating the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    /// The configuration file is not valid YAML.
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A program declaration is missing a required field.
    #[error("program '{program}' is missing required field '{field}'")]
    MissingField {
        /// Name of the offending program.
        program: String,
        /// Name of the missing field.
        field: &'static str,
    },

    /// `numprocs` was zero or negative.
    #[error("program '{program}' has invalid numprocs: {numprocs}")]
    InvalidNumProcs {
        /// Name of the offending program.
        program: String,
        /// The rejected value.
        numprocs: i64,
    },

    /// A `stopsignal` name did not resolve to a known signal.
    #[error("program '{program}' declares unknown signal '{signal}'")]
    UnknownSignal {
        /// Name of the offending program.
        program: String,
        /// The unresolved signal name.
        signal: String,
    },

    /// `umask` could not be parsed as an octal integer.
    #[error("program '{program}' has an unparseable umask: '{umask}'")]
    InvalidUmask {
        /// Name of the offending program.
        program: String,
        /// The raw, unparsed value.
        umask: String,
    },

    /// `console: true` was set on a platform without pseudo-terminal support.
    #[error("program '{program}' requests console but this platform has no pty support")]
    ConsoleUnsupported {
        /// Name of the offending program.
        program: String,
    },

    /// An environment variable referenced by `$NAME`/`${NAME}` expansion was not set.
    #[error("config references undefined environment variable '{0}'")]
    MissingEnvVar(String),
}

/// Errors raised by the process launcher while spawning a child.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The child process could not be created.
    #[error("failed to spawn program '{program}': {source}")]
    Exec {
        /// Name of the program that failed to spawn.
        program: String,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The requested `user`/`group` did not resolve to a known account.
    #[error("failed to resolve identity for program '{program}': {0}")]
    Identity(String, #[source] std::io::Error),

    /// Opening a redirected output file failed.
    #[error("failed to open output '{path}' for program '{program}': {source}")]
    Output {
        /// Name of the program.
        program: String,
        /// Path that failed to open.
        path: String,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// Allocating a pseudo-terminal failed.
    #[error("failed to allocate pty for program '{program}': {0}")]
    Pty(String, #[source] nix::Error),
}

/// Errors surfaced by the control plane.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Requested program is not present in the registry.
    #[error("program '{0}' not found")]
    NotFound(String),

    /// `start` was issued against a program already `STARTED`.
    #[error("program '{0}' is already running")]
    AlreadyRunning(String),

    /// `stop`/`restart` was issued against a program that is not `STARTED`.
    #[error("program '{0}' is not running")]
    NotRunning(String),

    /// The configuration failed to (re)load.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A child could not be spawned.
    #[error("spawn error: {0}")]
    Spawn(#[from] SpawnError),

    /// A graceful stop did not complete within `stoptime` and was escalated to `SIGKILL`.
    ///
    /// Not surfaced to control clients as a failure; logged and otherwise swallowed.
    #[error("program '{0}' did not stop before its timeout and was killed")]
    StopTimeout(String),

    /// Control message framing failed or an unknown verb was sent.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Transport-level I/O failure on the control socket.
    #[error("control socket I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Control message JSON could not be (de)serialized.
    #[error("failed to (de)serialize control message: {0}")]
    Serde(#[from] serde_json::Error),

    /// No resident supervisor is reachable at the configured socket.
    #[error("no supervisor is listening at the configured socket")]
    NotAvailable,
}

/// Failure delivering a single alert to a transport. Always logged, never propagated.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The outbound HTTP request for the webhook transport failed.
    #[error("webhook delivery failed: {0}")]
    Webhook(#[from] reqwest::Error),

    /// The raw SMTP dialog or connection failed.
    #[error("smtp delivery failed: {0}")]
    Smtp(std::io::Error),

    /// The syslog datagram could not be sent.
    #[error("syslog delivery failed: {0}")]
    Syslog(std::io::Error),
}

impl<T> From<std::sync::PoisonError<T>> for ControlError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ControlError::Protocol(format!("registry mutex poisoned: {err}"))
    }
}
