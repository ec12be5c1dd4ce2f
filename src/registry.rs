//! In-memory program registry and lifecycle controller.
use std::collections::{HashMap, HashSet};
use std::os::fd::OwnedFd;
use std::process::Child;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

use crate::config::{ProgramConfig, resolve_signal};
use crate::constants::RESTART_SETTLE_DELAY;
use crate::error::ControlError;
use crate::eventlog::{Event, EventLog};
use crate::launcher::{self, SpawnedProcess};

/// A single live child belonging to a program.
pub struct Instance {
    /// Index among the program's `numprocs` siblings.
    pub index: u32,
    child: Child,
    /// OS process id.
    pub pid: u32,
    started_at: Instant,
    /// Consecutive failed-start count, carried across restarts of the same slot.
    pub retries: u32,
    /// Master side of the instance's pty, if `console: true`.
    pub pty_master: Option<OwnedFd>,
}

impl Instance {
    fn run_time(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Derived, externally visible status of a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramStatus {
    /// Known but has never had a live instance.
    Created,
    /// At least one instance is alive.
    Started,
    /// Had instances at some point; none alive now.
    Stopped,
}

/// A program's configuration plus its live instance set.
pub struct ProgramRuntime {
    /// Normalized configuration.
    pub config: ProgramConfig,
    instances: Vec<Instance>,
    ever_started: bool,
    /// Instance slots that exhausted their retry budget; excluded from reconciliation
    /// until a manual `start`/`restart` clears them.
    failed_slots: HashSet<u32>,
}

impl ProgramRuntime {
    fn new(config: ProgramConfig) -> Self {
        Self {
            config,
            instances: Vec::new(),
            ever_started: false,
            failed_slots: HashSet::new(),
        }
    }

    /// Derived status per §3 of the program record.
    pub fn status(&self) -> ProgramStatus {
        if !self.instances.is_empty() {
            ProgramStatus::Started
        } else if self.ever_started {
            ProgramStatus::Stopped
        } else {
            ProgramStatus::Created
        }
    }

    /// Read-only view of the currently alive instances.
    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }
}

/// A point-in-time view of one program, for the `status` control verb.
pub struct ProgramSnapshot {
    /// Program name.
    pub name: String,
    /// PID of the lowest-indexed alive instance, if any.
    pub pid: Option<u32>,
    /// Derived status.
    pub status: ProgramStatus,
    /// Configured command line.
    pub cmd: String,
    /// Whether any client is currently attached (populated by the control server).
    pub attached: bool,
}

/// The single source of truth: program name → (record, instance set), mutex-guarded.
pub struct Registry {
    inner: Mutex<HashMap<String, ProgramRuntime>>,
}

impl Registry {
    /// Builds a registry from a freshly loaded configuration; no instances are started.
    pub fn new(programs: HashMap<String, ProgramConfig>) -> Self {
        let map = programs
            .into_iter()
            .map(|(name, config)| (name, ProgramRuntime::new(config)))
            .collect();
        Self {
            inner: Mutex::new(map),
        }
    }

    /// Names of every known program.
    pub fn program_names(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Starts every instance up to `numprocs`. Fails `NotFound`/`AlreadyRunning`.
    pub fn start(&self, name: &str, log: &EventLog) -> Result<(), ControlError> {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let program = guard.get_mut(name).ok_or_else(|| ControlError::NotFound(name.to_string()))?;
        if program.status() == ProgramStatus::Started {
            return Err(ControlError::AlreadyRunning(name.to_string()));
        }
        program.failed_slots.clear();
        reconcile_locked(name, program, log)
    }

    /// Sends `stopsignal`, waits up to `stoptime`, force-kills, then removes all instances.
    ///
    /// Only the signal send and the final bookkeeping hold the registry mutex; the
    /// timed wait and force-kill run unlocked so a slow-to-stop program never blocks
    /// other programs' `start`/`stop`/`status` or the monitor's reap pass.
    pub fn stop(&self, name: &str, log: &EventLog) -> Result<(), ControlError> {
        let (stopsignal, stoptime, mut instances) = {
            let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            let program = guard.get_mut(name).ok_or_else(|| ControlError::NotFound(name.to_string()))?;
            if program.status() != ProgramStatus::Started {
                return Err(ControlError::NotRunning(name.to_string()));
            }
            let stopsignal = resolve_signal(&program.config.stopsignal).unwrap_or(Signal::SIGTERM);
            let stoptime = Duration::from_secs(program.config.stoptime);
            let instances = std::mem::take(&mut program.instances);
            (stopsignal, stoptime, instances)
        };

        for instance in &instances {
            let _ = signal::kill(Pid::from_raw(instance.pid as i32), stopsignal);
        }

        let deadline = Instant::now() + stoptime;
        while Instant::now() < deadline {
            instances.retain(|instance| !is_reaped(instance.pid));
            if instances.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        for instance in &instances {
            if !is_reaped(instance.pid) {
                let _ = signal::kill(Pid::from_raw(instance.pid as i32), Signal::SIGKILL);
                let _ = waitpid(Pid::from_raw(instance.pid as i32), None);
            }
        }

        for instance in instances {
            log.record(Event::Stopped, name, Some(instance.index), Some(instance.pid), "stopped");
        }

        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(program) = guard.get_mut(name) {
            program.failed_slots.clear();
        }
        Ok(())
    }

    /// `stop` followed, after a short settle delay, by `start`.
    pub fn restart(&self, name: &str, log: &EventLog) -> Result<(), ControlError> {
        self.stop(name, log)?;
        std::thread::sleep(RESTART_SETTLE_DELAY);
        self.start(name, log)
    }

    /// Spawns instances to close the gap between alive count and `numprocs`, skipping
    /// slots that have permanently failed.
    pub fn reconcile(&self, name: &str, log: &EventLog) -> Result<(), ControlError> {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let program = guard.get_mut(name).ok_or_else(|| ControlError::NotFound(name.to_string()))?;
        reconcile_locked(name, program, log)
    }

    /// Inserts a new program (reload-add). Caller decides whether to `start` it.
    pub fn insert_program(&self, name: String, config: ProgramConfig) {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        guard.insert(name, ProgramRuntime::new(config));
    }

    /// Removes a program, returning its record (caller must have stopped it first).
    pub fn remove_program(&self, name: &str) -> Option<ProgramConfig> {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        guard.remove(name).map(|runtime| runtime.config)
    }

    /// Replaces a program's configuration in place, preserving its runtime state
    /// (used on signature-equal reload to pick up non-semantic field changes).
    pub fn update_config(&self, name: &str, config: ProgramConfig) {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(program) = guard.get_mut(name) {
            program.config = config;
        }
    }

    /// Current configuration for a program, if known.
    pub fn config_of(&self, name: &str) -> Option<ProgramConfig> {
        let guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        guard.get(name).map(|program| program.config.clone())
    }

    /// Removes and returns a reaped instance at `index`, so the monitor can decide
    /// whether to replace it.
    pub fn take_exited_instance(&self, name: &str, index: u32) -> Option<(Instance, bool)> {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let program = guard.get_mut(name)?;
        let pos = program.instances.iter().position(|i| i.index == index)?;
        let failed_cap_hit = program.failed_slots.contains(&index);
        Some((program.instances.remove(pos), failed_cap_hit))
    }

    /// Marks a slot as permanently failed, so `reconcile` will not refill it.
    pub fn mark_slot_failed(&self, name: &str, index: u32) {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(program) = guard.get_mut(name) {
            program.failed_slots.insert(index);
        }
    }

    /// Re-inserts a freshly spawned replacement instance at the same slot.
    pub fn insert_instance(&self, name: &str, instance: Instance) {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(program) = guard.get_mut(name) {
            program.instances.push(instance);
        }
    }

    /// Spawns a replacement instance at `index`, carrying over `retries`. Used by the
    /// monitor when restart policy calls for a fresh instance after a reaped exit.
    pub fn respawn_instance(
        &self,
        name: &str,
        index: u32,
        retries: u32,
        log: &EventLog,
    ) -> Result<(), ControlError> {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let program = guard
            .get_mut(name)
            .ok_or_else(|| ControlError::NotFound(name.to_string()))?;
        let SpawnedProcess { child, pty_master } = launcher::spawn(&program.config, index)?;
        let pid = child.id();
        program.instances.push(Instance {
            index,
            child,
            pid,
            started_at: Instant::now(),
            retries,
            pty_master,
        });
        program.ever_started = true;
        log.record(Event::Started, name, Some(index), Some(pid), "restarted");
        Ok(())
    }

    /// Whether `name` currently has at least one alive instance. Used by the attach
    /// bridge to notice a program stop and disconnect its clients.
    pub fn is_started(&self, name: &str) -> bool {
        let guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        guard
            .get(name)
            .map(|program| program.status() == ProgramStatus::Started)
            .unwrap_or(false)
    }

    /// Snapshot of every PID currently alive, for the monitor's reap pass.
    pub fn all_alive_instances(&self) -> Vec<(String, u32, u32, Duration, u32)> {
        let guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        guard
            .iter()
            .flat_map(|(name, program)| {
                program.instances.iter().map(move |instance| {
                    (
                        name.clone(),
                        instance.index,
                        instance.pid,
                        instance.run_time(),
                        instance.retries,
                    )
                })
            })
            .collect()
    }

    /// Builds the `status` verb's response payload.
    pub fn status_snapshot(&self) -> Vec<ProgramSnapshot> {
        let guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let mut names: Vec<&String> = guard.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| {
                let program = &guard[name];
                let pid = program.instances.iter().map(|i| i.pid).min();
                ProgramSnapshot {
                    name: name.clone(),
                    pid,
                    status: program.status(),
                    cmd: program.config.cmd.clone(),
                    attached: false,
                }
            })
            .collect()
    }

    /// Borrows the pty master fd for `name`'s lowest-indexed instance, for attach.
    pub fn pty_master_fd(&self, name: &str) -> Result<std::os::fd::RawFd, ControlError> {
        use std::os::fd::AsRawFd;
        let guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let program = guard.get(name).ok_or_else(|| ControlError::NotFound(name.to_string()))?;
        program
            .instances
            .iter()
            .min_by_key(|i| i.index)
            .and_then(|i| i.pty_master.as_ref())
            .map(|fd| fd.as_raw_fd())
            .ok_or_else(|| ControlError::NotRunning(name.to_string()))
    }

    /// Stops every known program; used during graceful daemon shutdown.
    pub fn stop_all(&self, log: &EventLog) {
        let names = self.program_names();
        for name in names {
            let _ = self.stop(&name, log);
        }
    }
}

fn reconcile_locked(name: &str, program: &mut ProgramRuntime, log: &EventLog) -> Result<(), ControlError> {
    let alive: HashSet<u32> = program.instances.iter().map(|i| i.index).collect();
    for index in 1..=program.config.numprocs {
        if alive.contains(&index) || program.failed_slots.contains(&index) {
            continue;
        }
        let SpawnedProcess { child, pty_master } = launcher::spawn(&program.config, index)?;
        let pid = child.id();
        program.instances.push(Instance {
            index,
            child,
            pid,
            started_at: Instant::now(),
            retries: 0,
            pty_master,
        });
        log.record(Event::Started, name, Some(index), Some(pid), "started");
    }
    program.ever_started = true;
    Ok(())
}

fn is_reaped(pid: u32) -> bool {
    match waitpid(Pid::from_raw(pid as i32), Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => false,
        Ok(_) => true,
        Err(_) => true,
    }
}
