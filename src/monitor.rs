//! Background reaper: polls every instance on a fixed cadence, classifies exits, and
//! applies restart policy with retry accounting (§4.4).
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tracing::{info, warn};

use crate::config::AutoRestart;
use crate::constants::MONITOR_TICK;
use crate::eventlog::{Event, EventLog};
use crate::registry::Registry;

/// Outcome of reaping one instance, decided per §4.4 steps 2-5.
struct ExitClassification {
    should_restart: bool,
    failed: bool,
    retries: u32,
}

fn classify(
    run_time: Duration,
    exit_code: Option<i32>,
    exitcodes: &std::collections::BTreeSet<i32>,
    policy: AutoRestart,
    starttime: u64,
    startretries: u32,
    prior_retries: u32,
) -> ExitClassification {
    let expected = exit_code.is_some_and(|code| exitcodes.contains(&code));
    let mut should_restart = match policy {
        AutoRestart::Always => true,
        AutoRestart::Never => false,
        AutoRestart::OnUnexpected => !expected,
    };
    let mut retries = prior_retries;
    let mut failed = false;

    if run_time < Duration::from_secs(starttime) {
        retries += 1;
        if retries <= startretries {
            should_restart = true;
        } else {
            should_restart = false;
            failed = true;
        }
    } else if should_restart && startretries > 0 {
        retries += 1;
        if retries > startretries {
            should_restart = false;
            failed = true;
        }
    }

    ExitClassification {
        should_restart,
        failed,
        retries,
    }
}

/// Non-blocking reap of a single pid. `None` if still alive.
fn reap(pid: u32) -> Option<Option<i32>> {
    match waitpid(Pid::from_raw(pid as i32), Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => None,
        Ok(WaitStatus::Exited(_, code)) => Some(Some(code)),
        Ok(WaitStatus::Signaled(_, _, _)) => Some(None),
        Ok(_) => None,
        Err(_) => Some(None),
    }
}

/// Runs one monitor tick: reaps every terminated instance across every program and
/// applies restart policy. Returns the number of instances it acted on (for tests).
pub fn tick(registry: &Registry, log: &EventLog) -> usize {
    let mut acted = 0;
    for (name, index, pid, run_time, retries) in registry.all_alive_instances() {
        let Some(exit_code) = reap(pid) else {
            continue;
        };
        acted += 1;

        let Some(config) = registry.config_of(&name) else {
            continue;
        };
        let Some((instance, _failed_cap_hit)) = registry.take_exited_instance(&name, index) else {
            continue;
        };
        drop(instance);

        let classification = classify(
            run_time,
            exit_code,
            &config.exitcodes,
            config.autorestart,
            config.starttime,
            config.startretries,
            retries,
        );

        if classification.should_restart {
            log.record(
                Event::Restarting,
                &name,
                Some(index),
                Some(pid),
                "restarting after exit",
            );
            if let Err(err) =
                registry.respawn_instance(&name, index, classification.retries, log)
            {
                warn!("failed to respawn '{name}:{index}': {err}");
                registry.mark_slot_failed(&name, index);
                log.record(
                    Event::Failed,
                    &name,
                    Some(index),
                    None,
                    &format!("respawn failed: {err}"),
                );
            }
        } else if classification.failed {
            registry.mark_slot_failed(&name, index);
            log.record(
                Event::Failed,
                &name,
                Some(index),
                Some(pid),
                "exhausted startretries",
            );
        } else {
            log.record(Event::Stopped, &name, Some(index), Some(pid), "exited, no restart");
        }
    }
    acted
}

/// Spawns the monitor as a detached background thread, ticking until `shutdown` is set.
pub fn spawn(registry: Arc<Registry>, log: Arc<EventLog>, shutdown: Arc<AtomicBool>) {
    std::thread::spawn(move || {
        info!("monitor started, tick = {:?}", MONITOR_TICK);
        while !shutdown.load(Ordering::Relaxed) {
            tick(&registry, &log);
            std::thread::sleep(MONITOR_TICK);
        }
    });
}
