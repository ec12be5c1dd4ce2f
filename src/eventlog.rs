//! Append-only event log, truncated once at daemon startup. Every line written here
//! is also fanned out to the alerting sink (§4.7): this is the single choke point
//! lifecycle transitions pass through, so the two can never drift out of sync.
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use chrono::Local;
use tracing::warn;

use crate::alerts::AlertSink;

/// Which lifecycle transition a log line records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// An instance was spawned and is now alive.
    Started,
    /// An instance was removed with no restart.
    Stopped,
    /// An instance is being replaced after an exit, per restart policy.
    Restarting,
    /// An instance (or program) permanently gave up restarting.
    Failed,
}

impl Event {
    fn symbol(self) -> char {
        match self {
            Event::Started => '▶',
            Event::Stopped => '▪',
            Event::Restarting => '↻',
            Event::Failed => '✖',
        }
    }
}

/// Mutex-guarded handle to the log file; one line is written per lifecycle event.
pub struct EventLog {
    file: Mutex<File>,
    alerts: AlertSink,
}

impl EventLog {
    /// Opens (truncating) the log file at `path`, with no alert transports configured.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        Self::open_with_alerts(path, AlertSink::new(Default::default()))
    }

    /// Opens (truncating) the log file at `path`, fanning every line out to `alerts`.
    pub fn open_with_alerts(path: &Path, alerts: AlertSink) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
            alerts,
        })
    }

    /// The alerting sink backing this log, so the reload coordinator can replace its
    /// configuration wholesale (§4.5).
    pub fn alerts(&self) -> &AlertSink {
        &self.alerts
    }

    /// Writes `<symbol> [timestamp] [program[:instance]] [PID:pid] message` and fans
    /// the same line out to every enabled alert transport.
    pub fn record(&self, event: Event, program: &str, instance: Option<u32>, pid: Option<u32>, message: &str) {
        let label = match instance {
            Some(index) => format!("{program}:{index}"),
            None => program.to_string(),
        };
        let pid_text = match pid {
            Some(pid) => pid.to_string(),
            None => "-".to_string(),
        };
        let line = format!(
            "{} [{}] [{label}] [PID:{pid_text}] {message}",
            event.symbol(),
            Local::now().format("%Y-%m-%d %H:%M:%S"),
        );

        let mut guard = match self.file.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(err) = writeln!(guard, "{line}") {
            warn!("failed to write event log line: {err}");
        }
        drop(guard);

        self.alerts.fire(&line);
    }
}
