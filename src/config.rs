//! Configuration loading and normalization for the supervisor.
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    collections::{BTreeSet, HashMap},
    env, fs,
    path::{Path, PathBuf},
};
use strum_macros::AsRefStr;

use crate::error::ConfigError;

/// Restart policy for a program, encoded as a clean tagged variant rather than the
/// boolean-or-string overloading of the format this supervisor's config is modeled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr)]
#[serde(rename_all = "lowercase")]
pub enum AutoRestart {
    /// Never restart, regardless of exit code.
    Never,
    /// Always restart.
    Always,
    /// Restart only when the exit code is not in `exitcodes`.
    #[serde(rename = "unexpected")]
    OnUnexpected,
}

impl Default for AutoRestart {
    fn default() -> Self {
        AutoRestart::Never
    }
}

/// Where a program's stdout/stderr stream is routed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputTarget {
    /// Append-mode file at this path.
    File(PathBuf),
    /// The sentinel `"discard"` — stream is sent to the null device.
    Discard,
}

impl OutputTarget {
    fn from_raw(raw: Option<String>) -> Self {
        match raw {
            None => OutputTarget::Discard,
            Some(s) if s.eq_ignore_ascii_case("discard") => OutputTarget::Discard,
            Some(s) => OutputTarget::File(PathBuf::from(s)),
        }
    }
}

/// A fully normalized program declaration: defaults applied, signals and umask parsed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramConfig {
    /// Unique program name (the registry key).
    pub name: String,
    /// Command line, to be word-split at spawn time.
    pub cmd: String,
    /// Number of instances to keep alive.
    pub numprocs: u32,
    /// Whether to start this program on daemon boot or reload-add.
    pub autostart: bool,
    /// Restart policy.
    pub autorestart: AutoRestart,
    /// Exit codes considered "expected".
    pub exitcodes: BTreeSet<i32>,
    /// Seconds a child must stay alive to be declared successfully started.
    pub starttime: u64,
    /// Maximum consecutive failed start attempts before giving up.
    pub startretries: u32,
    /// Symbolic signal name sent on graceful stop.
    pub stopsignal: String,
    /// Seconds to wait after `stopsignal` before escalating to a forced kill.
    pub stoptime: u64,
    /// Where stdout is routed.
    pub stdout: OutputTarget,
    /// Where stderr is routed.
    pub stderr: OutputTarget,
    /// Environment overlay applied on top of the daemon's own environment.
    pub env: HashMap<String, String>,
    /// Working directory, or `None` to inherit the daemon's.
    pub workingdir: Option<PathBuf>,
    /// Octal file mode mask applied in the child before exec.
    pub umask: Option<u32>,
    /// User to switch to before exec (requires superuser).
    pub user: Option<String>,
    /// Group to switch to before exec (requires superuser).
    pub group: Option<String>,
    /// Whether the child's standard streams are bound to a pseudo-terminal.
    pub console: bool,
}

/// The subset of `ProgramConfig` that participates in reload-time equality (§4.5).
/// Derived runtime state (status, instances, retry counters) is never part of it.
#[derive(Serialize)]
struct ProgramSignature<'a> {
    cmd: &'a str,
    numprocs: u32,
    autorestart: AutoRestart,
    exitcodes: &'a BTreeSet<i32>,
    starttime: u64,
    startretries: u32,
    stopsignal: &'a str,
    stoptime: u64,
    stdout: &'a OutputTarget,
    stderr: &'a OutputTarget,
    env: &'a HashMap<String, String>,
    workingdir: &'a Option<PathBuf>,
    umask: Option<u32>,
    user: &'a Option<String>,
    group: &'a Option<String>,
    console: bool,
}

impl ProgramConfig {
    /// Computes a stable hash over the signature fields, for cheap equality
    /// short-circuiting and for inclusion in diagnostic log lines.
    pub fn signature_hash(&self) -> String {
        let signature = ProgramSignature {
            cmd: &self.cmd,
            numprocs: self.numprocs,
            autorestart: self.autorestart,
            exitcodes: &self.exitcodes,
            starttime: self.starttime,
            startretries: self.startretries,
            stopsignal: &self.stopsignal,
            stoptime: self.stoptime,
            stdout: &self.stdout,
            stderr: &self.stderr,
            env: &self.env,
            workingdir: &self.workingdir,
            umask: self.umask,
            user: &self.user,
            group: &self.group,
            console: self.console,
        };
        let json =
            serde_json::to_string(&signature).expect("ProgramSignature is always serializable");
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        let result = hasher.finalize();
        format!(
            "{:016x}",
            u64::from_be_bytes(result[0..8].try_into().unwrap())
        )
    }

    /// True if two programs would behave identically once spawned; used by the
    /// reload coordinator to decide whether to replace a running program.
    pub fn same_signature(&self, other: &ProgramConfig) -> bool {
        self.signature_hash() == other.signature_hash()
    }
}

/// Raw, not-yet-defaulted program declaration as it appears in YAML.
#[derive(Debug, Default, Deserialize)]
struct RawProgramConfig {
    cmd: Option<String>,
    numprocs: Option<u32>,
    autostart: Option<bool>,
    autorestart: Option<AutoRestart>,
    exitcodes: Option<ExitCodesRaw>,
    starttime: Option<u64>,
    startretries: Option<u32>,
    stopsignal: Option<String>,
    stoptime: Option<u64>,
    stdout: Option<String>,
    stderr: Option<String>,
    env: Option<HashMap<String, String>>,
    workingdir: Option<PathBuf>,
    umask: Option<String>,
    user: Option<String>,
    group: Option<String>,
    console: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExitCodesRaw {
    Scalar(i32),
    List(Vec<i32>),
}

/// Email alert transport settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmailAlertConfig {
    /// Whether this transport is active.
    #[serde(default)]
    pub enabled: bool,
    /// SMTP server hostname.
    #[serde(default)]
    pub smtp_host: String,
    /// SMTP server port.
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    /// Envelope sender address.
    #[serde(default)]
    pub from: String,
    /// Envelope recipient address.
    #[serde(default)]
    pub to: String,
}

fn default_smtp_port() -> u16 {
    25
}

/// HTTP webhook alert transport settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookAlertConfig {
    /// Whether this transport is active.
    #[serde(default)]
    pub enabled: bool,
    /// Destination URL.
    #[serde(default)]
    pub url: String,
    /// HTTP method; defaults to `POST`.
    pub method: Option<String>,
    /// Additional request headers.
    pub headers: Option<HashMap<String, String>>,
}

/// Syslog (UDP) alert transport settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyslogAlertConfig {
    /// Whether this transport is active.
    #[serde(default)]
    pub enabled: bool,
    /// Syslog collector hostname.
    #[serde(default)]
    pub host: String,
    /// Syslog collector port.
    #[serde(default = "default_syslog_port")]
    pub port: u16,
    /// Syslog facility tag (default `user`).
    pub facility: Option<String>,
}

fn default_syslog_port() -> u16 {
    514
}

/// The global alert record; replaced wholesale on every reload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Email transport, if configured.
    #[serde(default)]
    pub email: Option<EmailAlertConfig>,
    /// Webhook transport, if configured.
    #[serde(default)]
    pub webhook: Option<WebhookAlertConfig>,
    /// Syslog transport, if configured.
    #[serde(default)]
    pub syslog: Option<SyslogAlertConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    programs: HashMap<String, RawProgramConfig>,
    #[serde(default)]
    alerts: AlertConfig,
}

/// Fully loaded and normalized configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Normalized program records, keyed by name.
    pub programs: HashMap<String, ProgramConfig>,
    /// Alert transport configuration.
    pub alerts: AlertConfig,
}

const DEFAULT_EXITCODES: &[i32] = &[0];
const DEFAULT_STOPSIGNAL: &str = "TERM";
const DEFAULT_STOPTIME: u64 = 10;

fn normalize_program(name: &str, raw: RawProgramConfig) -> Result<ProgramConfig, ConfigError> {
    let cmd = raw.cmd.ok_or_else(|| ConfigError::MissingField {
        program: name.to_string(),
        field: "cmd",
    })?;

    let numprocs = raw.numprocs.unwrap_or(1);
    if numprocs < 1 {
        return Err(ConfigError::InvalidNumProcs {
            program: name.to_string(),
            numprocs: numprocs as i64,
        });
    }

    let exitcodes: BTreeSet<i32> = match raw.exitcodes {
        None => DEFAULT_EXITCODES.iter().copied().collect(),
        Some(ExitCodesRaw::Scalar(code)) => BTreeSet::from([code]),
        Some(ExitCodesRaw::List(codes)) => codes.into_iter().collect(),
    };

    let stopsignal = raw
        .stopsignal
        .unwrap_or_else(|| DEFAULT_STOPSIGNAL.to_string());
    if resolve_signal(&stopsignal).is_none() {
        return Err(ConfigError::UnknownSignal {
            program: name.to_string(),
            signal: stopsignal,
        });
    }

    let umask = match raw.umask {
        None => None,
        Some(value) => Some(u32::from_str_radix(value.trim(), 8).map_err(|_| {
            ConfigError::InvalidUmask {
                program: name.to_string(),
                umask: value,
            }
        })?),
    };

    let console = raw.console.unwrap_or(false);
    if console && !console_supported() {
        return Err(ConfigError::ConsoleUnsupported {
            program: name.to_string(),
        });
    }

    Ok(ProgramConfig {
        name: name.to_string(),
        cmd,
        numprocs,
        autostart: raw.autostart.unwrap_or(false),
        autorestart: raw.autorestart.unwrap_or_default(),
        exitcodes,
        starttime: raw.starttime.unwrap_or(0),
        startretries: raw.startretries.unwrap_or(0),
        stopsignal,
        stoptime: raw.stoptime.unwrap_or(DEFAULT_STOPTIME),
        stdout: OutputTarget::from_raw(raw.stdout),
        stderr: OutputTarget::from_raw(raw.stderr),
        env: raw.env.unwrap_or_default(),
        workingdir: raw.workingdir,
        umask,
        user: raw.user,
        group: raw.group,
        console,
    })
}

/// Resolves a symbolic signal name (with or without a `SIG` prefix) to a `nix` signal.
pub fn resolve_signal(name: &str) -> Option<nix::sys::signal::Signal> {
    use nix::sys::signal::Signal::*;
    let trimmed = name.trim();
    let upper = trimmed.to_ascii_uppercase();
    let bare = upper.strip_prefix("SIG").unwrap_or(&upper);
    Some(match bare {
        "HUP" => SIGHUP,
        "INT" => SIGINT,
        "QUIT" => SIGQUIT,
        "ILL" => SIGILL,
        "TRAP" => SIGTRAP,
        "ABRT" => SIGABRT,
        "BUS" => SIGBUS,
        "FPE" => SIGFPE,
        "KILL" => SIGKILL,
        "USR1" => SIGUSR1,
        "SEGV" => SIGSEGV,
        "USR2" => SIGUSR2,
        "PIPE" => SIGPIPE,
        "ALRM" => SIGALRM,
        "TERM" => SIGTERM,
        "CHLD" => SIGCHLD,
        "CONT" => SIGCONT,
        "STOP" => SIGSTOP,
        "TSTP" => SIGTSTP,
        "TTIN" => SIGTTIN,
        "TTOU" => SIGTTOU,
        "URG" => SIGURG,
        "XCPU" => SIGXCPU,
        "XFSZ" => SIGXFSZ,
        "VTALRM" => SIGVTALRM,
        "PROF" => SIGPROF,
        "WINCH" => SIGWINCH,
        "IO" => SIGIO,
        "SYS" => SIGSYS,
        _ => return None,
    })
}

#[cfg(unix)]
fn console_supported() -> bool {
    true
}

#[cfg(not(unix))]
fn console_supported() -> bool {
    false
}

/// Expands `$NAME` / `${NAME}` references in a string against the process environment.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?").unwrap();
    let mut err = None;
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                if err.is_none() {
                    err = Some(ConfigError::MissingEnvVar(var_name.to_string()));
                }
                String::new()
            }
        }
    });
    if let Some(e) = err {
        return Err(e);
    }
    Ok(result.to_string())
}

/// Loads a `.env` file, populating only environment variables that are not already set.
fn load_env_file(path: &Path) -> Result<(), ConfigError> {
    let content = fs::read_to_string(path)?;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            let mut value = value.trim();
            if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
                value = &value[1..value.len() - 1];
            }
            if env::var(key).is_err() {
                unsafe {
                    env::set_var(key, value);
                }
            }
        }
    }
    Ok(())
}

/// Loads and normalizes the configuration at `path`.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let dotenv = base_dir.join(".env");
    if dotenv.is_file() {
        load_env_file(&dotenv)?;
    }

    let content = fs::read_to_string(path)?;
    let expanded = expand_env_vars(&content)?;
    let raw: RawConfig = serde_yaml::from_str(&expanded)?;

    let mut programs = HashMap::with_capacity(raw.programs.len());
    for (name, raw_program) in raw.programs {
        programs.insert(name.clone(), normalize_program(&name, raw_program)?);
    }

    Ok(Config {
        programs,
        alerts: raw.alerts,
    })
}
