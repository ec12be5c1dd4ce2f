//! Reload coordinator: diffs a freshly parsed configuration against the live
//! registry and applies the minimum necessary changes (§4.5).
use crate::config::Config;
use crate::error::ControlError;
use crate::eventlog::EventLog;
use crate::registry::Registry;

/// Runs the full reload: adds/replaces programs named in `new_config`, prunes
/// programs no longer named by it, and replaces the alert record wholesale (§4.5).
/// Returns whether any add/remove/replace occurred.
pub fn reload(registry: &Registry, log: &EventLog, new_config: Config) -> Result<bool, ControlError> {
    let new_names: std::collections::HashSet<String> =
        new_config.programs.keys().cloned().collect();
    log.alerts().replace(new_config.alerts.clone());
    let added_or_replaced = apply(registry, log, new_config)?;
    let pruned = prune(registry, log, &new_names);
    Ok(added_or_replaced || pruned)
}

/// Applies `new_config` to `registry` with minimum disturbance. Returns whether
/// anything was added, removed, or replaced; a signature-equal reload is a no-op
/// that still updates non-semantic fields in place (§8 "reload idempotence").
pub fn apply(registry: &Registry, log: &EventLog, new_config: Config) -> Result<bool, ControlError> {
    let mut changed = false;

    for (name, new_program) in new_config.programs {
        match registry.config_of(&name) {
            None => {
                changed = true;
                let autostart = new_program.autostart;
                registry.insert_program(name.clone(), new_program);
                if autostart {
                    registry.start(&name, log)?;
                }
            }
            Some(old_program) => {
                if old_program.same_signature(&new_program) {
                    registry.update_config(&name, new_program);
                } else {
                    changed = true;
                    match registry.stop(&name, log) {
                        Ok(()) | Err(ControlError::NotRunning(_)) => {}
                        Err(err) => return Err(err),
                    }
                    registry.remove_program(&name);
                    let autostart = new_program.autostart;
                    registry.insert_program(name.clone(), new_program);
                    if autostart {
                        registry.start(&name, log)?;
                    }
                }
            }
        }
    }

    Ok(changed)
}

/// Stops and removes every program present in the registry but absent from
/// `new_names`. Split from [`apply`] so callers can run it with the live program
/// set computed before any additions landed.
pub fn prune(registry: &Registry, log: &EventLog, new_names: &std::collections::HashSet<String>) -> bool {
    let mut changed = false;
    for name in registry.program_names() {
        if !new_names.contains(&name) {
            changed = true;
            let _ = registry.stop(&name, log);
            registry.remove_program(&name);
        }
    }
    changed
}
