//! Lightweight process manager for Unix services.

#![warn(unused_crate_dependencies)]
// These dependencies are only used in the binary (src/bin/main.rs)
// Test dependencies are only used in test code
#[cfg(test)]
use assert_cmd as _;
#[cfg(test)]
use predicates as _;
use strum as _;
#[cfg(test)]
use tempfile as _;
use tracing_subscriber as _;

/// Alerting transports (email/webhook/syslog) fanned out from the event log.
pub mod alerts;

/// CLI parsing.
pub mod cli;

/// Control-plane client used by CLI invocations.
pub mod client;

/// Config loading.
pub mod config;

/// Constants.
pub mod constants;

/// Control server: the daemon side of the control socket.
pub mod control;

/// Append-only lifecycle event log.
pub mod eventlog;

/// Errors.
pub mod error;

/// Process launcher.
pub mod launcher;

/// Background reaper and restart-policy engine.
pub mod monitor;

/// In-memory program registry and lifecycle controller.
pub mod registry;

/// Reload coordinator.
pub mod reload;

/// Supervisor daemon.
pub mod supervisor;

/// Test utils.
#[doc(hidden)]
pub mod test_utils;

/// Runtime paths and modes.
pub mod runtime;

/// Privilege dropping.
pub mod privilege;
