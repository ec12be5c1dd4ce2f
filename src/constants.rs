//! Constants used throughout the daemon.

use std::time::Duration;

/// Default filesystem path for the control socket on POSIX platforms.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/taskmaster.sock";

/// Filesystem permission mode applied to the control socket.
pub const SOCKET_MODE: u32 = 0o600;

/// Name of the file recording the resident supervisor's PID.
pub const PID_FILE_NAME: &str = "taskmasterd.pid";

/// Cadence of the monitor's reaping loop.
pub const MONITOR_TICK: Duration = Duration::from_secs(2);

/// Upper bound the control listener blocks on `accept` before re-checking shutdown/reload flags.
pub const LISTENER_POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Settle delay between the stop and start halves of a `restart`.
pub const RESTART_SETTLE_DELAY: Duration = Duration::from_millis(250);

/// Byte that terminates an attach bridge from the client side (Ctrl-]).
pub const ATTACH_ESCAPE_BYTE: u8 = 0x1D;

/// Chunk size used when copying bytes in the attach bridge.
pub const ATTACH_BRIDGE_BUFFER: usize = 4096;

/// Exit code for a normal, requested shutdown.
pub const EXIT_OK: i32 = 0;

/// Exit code when the configuration fails to load at startup.
pub const EXIT_CONFIG_ERROR: i32 = 1;

/// Exit code when the control socket could not be bound.
pub const EXIT_BIND_ERROR: i32 = 2;
