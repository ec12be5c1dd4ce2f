//! Command-line interface for `taskmasterd`.
use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };
            return Ok(LogLevelArg(level));
        }

        let lowercase = trimmed.to_ascii_lowercase();
        let level = match lowercase.as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" | "information" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

/// Command-line interface for `taskmasterd`.
#[derive(Parser)]
#[command(name = "taskmasterd", version, author)]
#[command(about = "A process supervisor that starts, restarts, and monitors a declared fleet of child processes", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands. `Daemon` runs the resident supervisor; the rest are
/// thin control-plane clients that talk to an already-running daemon over
/// the control socket (§4.6, §6).
#[derive(Subcommand)]
pub enum Commands {
    /// Run the resident supervisor process in the foreground.
    Daemon {
        /// Path to the configuration file.
        #[arg(short, long, default_value = "taskmaster.yaml")]
        config: String,
    },

    /// Start a program's instances.
    Start {
        /// Name of the program to start.
        name: String,
    },

    /// Stop a program's instances.
    Stop {
        /// Name of the program to stop.
        name: String,
    },

    /// Stop then start a program.
    Restart {
        /// Name of the program to restart.
        name: String,
    },

    /// Show the status of every registered program.
    Status {
        /// Emit machine-readable JSON output instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Ask the running daemon to reload its configuration from disk.
    Reload,

    /// Attach an interactive session to a program's pseudo-terminal.
    Attach {
        /// Name of the program to attach to.
        name: String,
    },

    /// Ask the running daemon to shut down.
    Quit,
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
