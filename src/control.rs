//! Control server: accepts local connections, parses framed command messages,
//! dispatches into the registry/reload coordinator, and bridges `attach` sessions
//! to a child's pseudo-terminal (§4.6).
use std::collections::HashMap;
use std::fs;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::constants::{ATTACH_BRIDGE_BUFFER, ATTACH_ESCAPE_BYTE, SOCKET_MODE};
use crate::error::ControlError;
use crate::eventlog::EventLog;
use crate::registry::Registry;

/// A single framed control message: `{ "cmd": <verb>, "target": <name-or-null> }`.
/// Shared wire format between the daemon's listener and the CLI client.
#[derive(Debug, Serialize, Deserialize)]
pub struct ControlRequest {
    pub cmd: String,
    #[serde(default)]
    pub target: Option<String>,
}

impl ControlRequest {
    /// Builds a request for `cmd` against an optional `target` program name.
    pub fn new(cmd: impl Into<String>, target: Option<String>) -> Self {
        Self {
            cmd: cmd.into(),
            target,
        }
    }
}

/// A single framed control reply: `{ "ok": bool, "message": string, ... }`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ControlReply {
    pub ok: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attach: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shutdown: Option<bool>,
}

impl ControlReply {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
            ..Default::default()
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
            ..Default::default()
        }
    }
}

impl From<ControlError> for ControlReply {
    fn from(err: ControlError) -> Self {
        ControlReply::err(err.to_string())
    }
}

/// Shared state every per-connection worker dispatches against.
pub struct ServerContext {
    pub registry: Arc<Registry>,
    pub log: Arc<EventLog>,
    pub attach_hub: Arc<AttachHub>,
    pub shutdown: Arc<AtomicBool>,
    /// Reloads the daemon's configuration from disk; returns whether anything changed.
    pub reload: Box<dyn Fn() -> Result<bool, ControlError> + Send + Sync>,
}

/// Binds the control socket at `path`, removing any stale file first, and sets its
/// mode to `0600` per §6.
pub fn bind_listener(path: &Path) -> io::Result<UnixListener> {
    if path.exists() {
        fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(SOCKET_MODE))?;
    Ok(listener)
}

/// Whether the peer on the other end of `stream` is the superuser. Non-Linux POSIX
/// platforms without `SO_PEERCRED` are trusted (§9 notes pty/console support is
/// POSIX-only; peer-credential enforcement is best-effort beyond Linux).
#[cfg(target_os = "linux")]
fn peer_is_privileged(stream: &UnixStream) -> bool {
    use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
    match getsockopt(stream, PeerCredentials) {
        Ok(creds) => creds.uid() == 0,
        Err(err) => {
            warn!("failed to read control socket peer credentials: {err}");
            false
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn peer_is_privileged(_stream: &UnixStream) -> bool {
    true
}

fn poll_readable(fd: RawFd, timeout_ms: i32) -> bool {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let rc = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
    rc > 0 && (pollfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR)) != 0
}

/// Serves one accepted connection to completion: reads newline-delimited requests,
/// dispatches them, and writes newline-delimited replies, until EOF, `quit`, or an
/// `attach` that takes over the connection.
pub fn handle_connection(stream: UnixStream, ctx: &ServerContext) {
    if !peer_is_privileged(&stream) {
        let mut stream = stream;
        let reply = ControlReply::err("control socket requires a superuser peer");
        let _ = write_reply(&mut stream, &reply);
        return;
    }

    let mut writer = match stream.try_clone() {
        Ok(s) => s,
        Err(err) => {
            warn!("failed to clone control connection: {err}");
            return;
        }
    };
    let mut reader = BufReader::new(stream);

    loop {
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) => return,
            Ok(_) => {}
            Err(err) => {
                warn!("control connection read failed: {err}");
                return;
            }
        }
        if line.trim().is_empty() {
            continue;
        }

        let request: ControlRequest = match serde_json::from_str(line.trim()) {
            Ok(req) => req,
            Err(err) => {
                let reply = ControlReply::err(format!("protocol error: {err}"));
                if write_reply(&mut writer, &reply).is_err() {
                    return;
                }
                continue;
            }
        };

        match request.cmd.as_str() {
            "status" => {
                let data = status_payload(&ctx.registry, &ctx.attach_hub);
                let mut reply = ControlReply::ok("status");
                reply.data = Some(data);
                if write_reply(&mut writer, &reply).is_err() {
                    return;
                }
            }
            "start" => {
                let reply = dispatch_target(&request, |name| ctx.registry.start(name, &ctx.log));
                if write_reply(&mut writer, &reply).is_err() {
                    return;
                }
            }
            "stop" => {
                let reply = dispatch_target(&request, |name| ctx.registry.stop(name, &ctx.log));
                if write_reply(&mut writer, &reply).is_err() {
                    return;
                }
            }
            "restart" => {
                let reply = dispatch_target(&request, |name| ctx.registry.restart(name, &ctx.log));
                if write_reply(&mut writer, &reply).is_err() {
                    return;
                }
            }
            "reload" => {
                let reply = match (ctx.reload)() {
                    Ok(true) => ControlReply::ok("reload applied changes"),
                    Ok(false) => ControlReply::ok("nothing changed"),
                    Err(err) => err.into(),
                };
                if write_reply(&mut writer, &reply).is_err() {
                    return;
                }
            }
            "attach" => {
                let Some(name) = request.target.clone() else {
                    let reply = ControlReply::err("attach requires a target");
                    if write_reply(&mut writer, &reply).is_err() {
                        return;
                    }
                    continue;
                };
                match ctx.registry.pty_master_fd(&name) {
                    Ok(_) => {
                        let mut reply = ControlReply::ok("attached");
                        reply.attach = Some(true);
                        reply.target = Some(name.clone());
                        if write_reply(&mut writer, &reply).is_err() {
                            return;
                        }
                        let client_for_hub = match writer.try_clone() {
                            Ok(s) => s,
                            Err(_) => return,
                        };
                        run_attach_bridge(reader, writer, client_for_hub, name, ctx);
                        return;
                    }
                    Err(err) => {
                        let reply = err.into();
                        if write_reply(&mut writer, &reply).is_err() {
                            return;
                        }
                    }
                }
            }
            "quit" => {
                let mut reply = ControlReply::ok("shutting down");
                reply.shutdown = Some(true);
                let _ = write_reply(&mut writer, &reply);
                ctx.shutdown.store(true, Ordering::SeqCst);
                return;
            }
            other => {
                let reply = ControlReply::err(format!("unknown verb '{other}'"));
                if write_reply(&mut writer, &reply).is_err() {
                    return;
                }
            }
        }
    }
}

fn dispatch_target(
    request: &ControlRequest,
    f: impl FnOnce(&str) -> Result<(), ControlError>,
) -> ControlReply {
    let Some(name) = request.target.as_deref() else {
        return ControlReply::err(format!("'{}' requires a target", request.cmd));
    };
    match f(name) {
        Ok(()) => ControlReply::ok(format!("{} ok", request.cmd)),
        Err(err) => err.into(),
    }
}

fn status_payload(registry: &Registry, attach_hub: &AttachHub) -> serde_json::Value {
    let snapshot = registry.status_snapshot();
    let entries: Vec<serde_json::Value> = snapshot
        .into_iter()
        .map(|program| {
            serde_json::json!({
                "name": program.name,
                "pid": program.pid,
                "status": format!("{:?}", program.status).to_uppercase(),
                "cmd": program.cmd,
                "attached": attach_hub.has_clients(&program.name),
            })
        })
        .collect();
    serde_json::Value::Array(entries)
}

fn write_reply(stream: &mut UnixStream, reply: &ControlReply) -> io::Result<()> {
    let payload = serde_json::to_vec(reply).map_err(io::Error::other)?;
    stream.write_all(&payload)?;
    stream.write_all(b"\n")?;
    stream.flush()
}

/// Fan-out hub for `attach` sessions: one broadcaster thread per attached program
/// reads the pty master once and copies bytes to every currently attached client,
/// so multiple clients see identical output (§4.6).
pub struct AttachHub {
    outputs: Mutex<HashMap<String, Vec<(RawFd, UnixStream)>>>,
}

impl AttachHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            outputs: Mutex::new(HashMap::new()),
        })
    }

    fn register(&self, name: &str, client: UnixStream) -> bool {
        let fd = client.as_raw_fd();
        let mut guard = self.outputs.lock().unwrap_or_else(|p| p.into_inner());
        let entry = guard.entry(name.to_string()).or_default();
        let first = entry.is_empty();
        entry.push((fd, client));
        first
    }

    fn unregister(&self, name: &str, fd: RawFd) {
        let mut guard = self.outputs.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = guard.get_mut(name) {
            entry.retain(|(candidate, _)| *candidate != fd);
        }
    }

    fn broadcast(&self, name: &str, data: &[u8]) {
        let mut guard = self.outputs.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = guard.get_mut(name) {
            entry.retain_mut(|(_, client)| client.write_all(data).is_ok());
        }
    }

    fn disconnect_all(&self, name: &str) {
        let mut guard = self.outputs.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = guard.remove(name) {
            for (_, client) in entry {
                let _ = client.shutdown(std::net::Shutdown::Both);
            }
        }
    }

    /// Whether any client is currently attached to `name`, for the `status` verb.
    pub fn has_clients(&self, name: &str) -> bool {
        let guard = self.outputs.lock().unwrap_or_else(|p| p.into_inner());
        guard.get(name).is_some_and(|entry| !entry.is_empty())
    }
}

/// Runs the bidirectional copy between `client` and the named program's pty master
/// until EOF, Ctrl-] (`0x1D`), or the program stops (§4.6, §5).
fn run_attach_bridge(
    mut reader: BufReader<UnixStream>,
    writer: UnixStream,
    broadcast_handle: UnixStream,
    name: String,
    ctx: &ServerContext,
) {
    let registry = Arc::clone(&ctx.registry);
    let hub = Arc::clone(&ctx.attach_hub);
    let is_first = hub.register(&name, broadcast_handle);

    if is_first {
        let registry_for_broadcaster = Arc::clone(&registry);
        let hub_for_broadcaster = Arc::clone(&hub);
        let name_for_broadcaster = name.clone();
        std::thread::spawn(move || {
            broadcast_loop(registry_for_broadcaster, hub_for_broadcaster, name_for_broadcaster);
        });
    }

    let mut buf = [0u8; ATTACH_BRIDGE_BUFFER];
    loop {
        if !registry.is_started(&name) {
            break;
        }
        if !poll_readable(reader.get_ref().as_raw_fd(), 200) {
            continue;
        }
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => continue,
            Err(_) => break,
        };
        if let Some(escape_at) = buf[..n].iter().position(|&b| b == ATTACH_ESCAPE_BYTE) {
            if escape_at > 0 && write_to_pty(&registry, &name, &buf[..escape_at]).is_err() {
                break;
            }
            break;
        }
        if write_to_pty(&registry, &name, &buf[..n]).is_err() {
            break;
        }
    }

    hub.unregister(&name, writer.as_raw_fd());
    let _ = writer.shutdown(std::net::Shutdown::Both);
}

fn write_to_pty(registry: &Registry, name: &str, data: &[u8]) -> io::Result<()> {
    let fd = registry
        .pty_master_fd(name)
        .map_err(|err| io::Error::other(err.to_string()))?;
    let rc = unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn broadcast_loop(registry: Arc<Registry>, hub: Arc<AttachHub>, name: String) {
    let mut buf = [0u8; ATTACH_BRIDGE_BUFFER];
    loop {
        let fd = match registry.pty_master_fd(&name) {
            Ok(fd) => fd,
            Err(_) => break,
        };
        if !poll_readable(fd, 200) {
            if !registry.is_started(&name) {
                break;
            }
            continue;
        }
        let rc = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if rc <= 0 {
            break;
        }
        hub.broadcast(&name, &buf[..rc as usize]);
    }
    info!("attach broadcaster for '{name}' exiting");
    hub.disconnect_all(&name);
}
