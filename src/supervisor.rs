//! Supervisor daemon: wires together the registry, monitor, control server, and
//! signal handling into the resident `taskmasterd` process (§2, §4).
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::alerts::AlertSink;
use crate::config::{Config, load_config};
use crate::constants::{LISTENER_POLL_TIMEOUT, PID_FILE_NAME};
use crate::control::{self, AttachHub, ServerContext};
use crate::error::ControlError;
use crate::eventlog::EventLog;
use crate::registry::Registry;
use crate::reload;
use crate::runtime;

/// Top-level supervisor errors, surfaced as process exit codes by the binary.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The configuration failed to load at startup.
    #[error("configuration error: {0}")]
    Config(#[from] crate::error::ConfigError),

    /// The control socket could not be bound.
    #[error("failed to bind control socket: {0}")]
    Bind(std::io::Error),

    /// Privilege resolution/drop failed.
    #[error("privilege error: {0}")]
    Privilege(String),

    /// Writing the PID file failed.
    #[error("failed to write PID file: {0}")]
    PidFile(std::io::Error),
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);
static RELOAD_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_shutdown_signal(_signum: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

extern "C" fn on_reload_signal(_signum: libc::c_int) {
    RELOAD_REQUESTED.store(true, Ordering::SeqCst);
}

/// Installs `SIGTERM`/`SIGINT` (request shutdown) and `SIGHUP` (request reload)
/// handlers. Hand-rolled rather than a crate: the handler must only touch an
/// `AtomicBool`, and must distinguish hangup from termination, which no signal
/// crate in this dependency set does.
fn install_signal_handlers() {
    use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

    let shutdown_action = SigAction::new(
        SigHandler::Handler(on_shutdown_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let reload_action = SigAction::new(
        SigHandler::Handler(on_reload_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );

    unsafe {
        let _ = sigaction(Signal::SIGTERM, &shutdown_action);
        let _ = sigaction(Signal::SIGINT, &shutdown_action);
        let _ = sigaction(Signal::SIGHUP, &reload_action);
    }
}

/// Drops the daemon's own privileges to `user`/`group`, requiring the daemon to
/// currently be root. Distinct from [`crate::privilege::UserContext`], which
/// resolves a per-program identity for a child between `fork` and `exec`; this
/// applies once, in the supervisor itself, at startup.
fn drop_daemon_privileges(user: Option<&str>, group: Option<&str>) -> Result<(), String> {
    use nix::unistd::{Group, User, getuid, setgid, setuid};

    if !getuid().is_root() {
        return Err("run-as user/group requested but the daemon is not running as root".to_string());
    }

    let mut gid = None;
    if let Some(name) = group {
        let group = Group::from_name(name)
            .map_err(|err| format!("group '{name}' lookup failed: {err}"))?
            .ok_or_else(|| format!("group '{name}' not found"))?;
        gid = Some(group.gid);
    }

    let mut uid = None;
    if let Some(name) = user {
        let resolved = User::from_name(name)
            .map_err(|err| format!("user '{name}' lookup failed: {err}"))?
            .ok_or_else(|| format!("user '{name}' not found"))?;
        uid = Some(resolved.uid);
        if gid.is_none() {
            gid = Some(resolved.gid);
        }
    }

    if let Some(gid) = gid {
        setgid(gid).map_err(|err| format!("setgid failed: {err}"))?;
    }
    if let Some(uid) = uid {
        setuid(uid).map_err(|err| format!("setuid failed: {err}"))?;
    }

    Ok(())
}

/// The resident supervisor process: holds every piece of long-lived state.
pub struct Supervisor {
    config_path: PathBuf,
    registry: Arc<Registry>,
    log: Arc<EventLog>,
    attach_hub: Arc<AttachHub>,
    pid_path: PathBuf,
}

impl Supervisor {
    /// Loads `config_path`, resolves/drops privileges if requested, and prepares
    /// (but does not yet bind) the supervisor's runtime state.
    pub fn bootstrap(config_path: PathBuf) -> Result<Self, SupervisorError> {
        let config = load_config(&config_path)?;

        let (run_as_user, run_as_group) = runtime::requested_identity();
        if run_as_user.is_some() || run_as_group.is_some() {
            drop_daemon_privileges(run_as_user.as_deref(), run_as_group.as_deref())
                .map_err(SupervisorError::Privilege)?;
        }

        let state_dir = runtime::state_dir();
        fs::create_dir_all(&state_dir).map_err(SupervisorError::PidFile)?;
        let pid_path = state_dir.join(PID_FILE_NAME);

        let alerts = AlertSink::new(config.alerts.clone());
        let log_path = state_dir.join("taskmaster.log");
        let log = EventLog::open_with_alerts(&log_path, alerts).map_err(SupervisorError::PidFile)?;

        let registry = Registry::new(config.programs);

        Ok(Self {
            config_path,
            registry: Arc::new(registry),
            log: Arc::new(log),
            attach_hub: AttachHub::new(),
            pid_path,
        })
    }

    /// Binds the control socket, autostarts every `autostart` program, spawns the
    /// monitor thread, and serves control connections until shutdown is requested.
    pub fn run(&self) -> Result<(), SupervisorError> {
        install_signal_handlers();

        let socket_path = runtime::socket_path();
        let listener = control::bind_listener(&socket_path).map_err(SupervisorError::Bind)?;
        listener
            .set_nonblocking(true)
            .map_err(SupervisorError::Bind)?;

        fs::write(&self.pid_path, std::process::id().to_string()).map_err(SupervisorError::PidFile)?;

        for name in self.registry.program_names() {
            let autostart = self
                .registry
                .config_of(&name)
                .map(|config| config.autostart)
                .unwrap_or(false);
            if autostart
                && let Err(err) = self.registry.start(&name, &self.log)
            {
                warn!("autostart of '{name}' failed: {err}");
            }
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        crate::monitor::spawn(Arc::clone(&self.registry), Arc::clone(&self.log), Arc::clone(&shutdown));

        let config_path = self.config_path.clone();
        let registry_for_reload = Arc::clone(&self.registry);
        let log_for_reload = Arc::clone(&self.log);
        let reload_fn: Box<dyn Fn() -> Result<bool, ControlError> + Send + Sync> =
            Box::new(move || reload_from_disk(&config_path, &registry_for_reload, &log_for_reload));

        let ctx = Arc::new(ServerContext {
            registry: Arc::clone(&self.registry),
            log: Arc::clone(&self.log),
            attach_hub: Arc::clone(&self.attach_hub),
            shutdown: Arc::clone(&shutdown),
            reload: reload_fn,
        });

        info!("taskmasterd listening on {:?}", socket_path);

        loop {
            if SHUTDOWN_REQUESTED.swap(false, Ordering::SeqCst) || shutdown.load(Ordering::SeqCst) {
                info!("shutdown requested, stopping all programs");
                break;
            }
            if RELOAD_REQUESTED.swap(false, Ordering::SeqCst) {
                info!("hangup received, reloading configuration");
                if let Err(err) = (ctx.reload)() {
                    error!("reload failed: {err}");
                }
            }

            match listener.accept() {
                Ok((stream, _addr)) => {
                    let ctx = Arc::clone(&ctx);
                    std::thread::spawn(move || control::handle_connection(stream, &ctx));
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(LISTENER_POLL_TIMEOUT);
                }
                Err(err) => {
                    warn!("control listener accept failed: {err}");
                    std::thread::sleep(LISTENER_POLL_TIMEOUT);
                }
            }
        }

        shutdown.store(true, Ordering::SeqCst);
        self.registry.stop_all(&self.log);
        let _ = fs::remove_file(&socket_path);
        let _ = fs::remove_file(&self.pid_path);
        Ok(())
    }
}

fn reload_from_disk(config_path: &Path, registry: &Registry, log: &EventLog) -> Result<bool, ControlError> {
    let config: Config = load_config(config_path)?;
    reload::reload(registry, log, config)
}
