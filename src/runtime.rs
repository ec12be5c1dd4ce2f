//! Runtime context: resolves the control socket path and run-as identity once at
//! startup, instead of scattering `env::var` calls through the codebase.
use std::{
    env,
    path::PathBuf,
    sync::{OnceLock, RwLock},
};

use crate::constants::DEFAULT_SOCKET_PATH;

#[derive(Debug, Clone)]
struct RuntimeContext {
    socket_path: PathBuf,
    run_as_user: Option<String>,
    run_as_group: Option<String>,
    state_dir: PathBuf,
}

static CONTEXT: OnceLock<RwLock<RuntimeContext>> = OnceLock::new();

fn context_lock() -> &'static RwLock<RuntimeContext> {
    CONTEXT.get_or_init(|| RwLock::new(RuntimeContext::from_env()))
}

impl RuntimeContext {
    fn from_env() -> Self {
        let socket_path = env::var_os("TASKMASTER_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH));
        let state_dir = socket_path
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/tmp"));

        Self {
            socket_path,
            run_as_user: env::var("TASKMASTER_RUN_AS_USER").ok(),
            run_as_group: env::var("TASKMASTER_RUN_AS_GROUP").ok(),
            state_dir,
        }
    }
}

/// Re-reads the runtime context from the current environment. Tests that mutate
/// `TASKMASTER_SOCKET`/`TASKMASTER_RUN_AS_USER`/`TASKMASTER_RUN_AS_GROUP` must call this
/// after changing the environment and hold `crate::test_utils::env_lock()` while doing so.
pub fn reload_from_env() {
    let mut guard = context_lock().write().expect("runtime context poisoned");
    *guard = RuntimeContext::from_env();
}

/// Path of the control socket (or, on platforms without local sockets, informational only).
pub fn socket_path() -> PathBuf {
    context_lock()
        .read()
        .expect("runtime context poisoned")
        .socket_path
        .clone()
}

/// Directory alongside the control socket where the supervisor records its PID.
pub fn state_dir() -> PathBuf {
    context_lock()
        .read()
        .expect("runtime context poisoned")
        .state_dir
        .clone()
}

/// The identity the daemon should drop privileges to before serving, if requested and root.
pub fn requested_identity() -> (Option<String>, Option<String>) {
    let guard = context_lock().read().expect("runtime context poisoned");
    (guard.run_as_user.clone(), guard.run_as_group.clone())
}
