#![allow(dead_code)]

use std::{
    io::{BufRead, BufReader, Write},
    os::unix::net::UnixStream,
    path::{Path, PathBuf},
    process::{Child, Command as StdCommand},
    thread,
    time::{Duration, Instant},
};

use assert_cmd::cargo::cargo_bin;
use serde_json::Value;
use tempfile::TempDir;

/// A resident `taskmasterd` spawned against a scratch config and socket, for
/// integration tests. Killed and its socket/pid file cleaned up on drop.
pub struct Daemon {
    child: Child,
    pub dir: TempDir,
    pub socket_path: PathBuf,
}

impl Daemon {
    /// Writes `config_yaml` to a scratch directory and launches `taskmasterd daemon`
    /// against it, with the control socket also scoped to that directory.
    pub fn start(config_yaml: &str) -> Self {
        let dir = TempDir::new().expect("failed to create tempdir");
        let config_path = dir.path().join("taskmaster.yaml");
        std::fs::write(&config_path, config_yaml).expect("failed to write config");
        let socket_path = dir.path().join("control.sock");

        let child = StdCommand::new(cargo_bin!("taskmasterd"))
            .arg("daemon")
            .arg("--config")
            .arg(&config_path)
            .env("TASKMASTER_SOCKET", &socket_path)
            .spawn()
            .expect("failed to spawn taskmasterd");

        wait_for_path(&socket_path);

        Self {
            child,
            dir,
            socket_path,
        }
    }

    /// Sends a single control request and returns the parsed reply.
    pub fn send(&self, cmd: &str, target: Option<&str>) -> Value {
        send(&self.socket_path, cmd, target)
    }

    /// Polls `status` until `name`'s entry matches `predicate`, or panics after 5s.
    pub fn wait_for_status(&self, name: &str, predicate: impl Fn(&Value) -> bool) -> Value {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let reply = self.send("status", None);
            if let Some(entry) = status_entry(&reply, name)
                && predicate(&entry)
            {
                return entry;
            }
            if Instant::now() >= deadline {
                panic!("timed out waiting for '{name}' status to match");
            }
            thread::sleep(Duration::from_millis(100));
        }
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        let _ = send(&self.socket_path, "quit", None);
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(50)),
                _ => {
                    let _ = self.child.kill();
                    let _ = self.child.wait();
                    break;
                }
            }
        }
    }
}

/// Sends one newline-delimited JSON request directly over the control socket,
/// bypassing the crate's own client so tests never touch its process-global state.
pub fn send(socket_path: &Path, cmd: &str, target: Option<&str>) -> Value {
    let mut stream =
        UnixStream::connect(socket_path).unwrap_or_else(|err| panic!("connect {socket_path:?}: {err}"));
    let request = serde_json::json!({ "cmd": cmd, "target": target });
    let mut payload = serde_json::to_vec(&request).unwrap();
    payload.push(b'\n');
    stream.write_all(&payload).unwrap();

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    serde_json::from_str(line.trim()).unwrap_or_else(|err| panic!("parse reply {line:?}: {err}"))
}

/// Looks up `name`'s entry in a `status` reply's `data` array.
pub fn status_entry(reply: &Value, name: &str) -> Option<Value> {
    reply
        .get("data")?
        .as_array()?
        .iter()
        .find(|entry| entry.get("name").and_then(Value::as_str) == Some(name))
        .cloned()
}

pub fn wait_for_path(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if path.exists() {
            return;
        }
        thread::sleep(Duration::from_millis(50));
    }
    panic!("timed out waiting for {path:?} to exist");
}

pub fn wait_for_file_value(path: &Path, expected: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(content) = std::fs::read_to_string(path)
            && content.trim() == expected
        {
            return;
        }
        if Instant::now() >= deadline {
            panic!("timed out waiting for value '{expected}' in {path:?}");
        }
        thread::sleep(Duration::from_millis(100));
    }
}

pub fn is_process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

pub fn wait_for_process_exit(pid: u32) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if !is_process_alive(pid) {
            return;
        }
        thread::sleep(Duration::from_millis(100));
    }
    panic!("timed out waiting for PID {pid} to exit");
}
