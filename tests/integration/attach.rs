#[path = "common/mod.rs"]
mod common;

use std::{
    io::{BufRead, BufReader, Read, Write},
    os::unix::net::UnixStream,
    time::Duration,
};

use common::Daemon;

fn attach(socket_path: &std::path::Path, name: &str) -> (BufReader<UnixStream>, UnixStream) {
    let mut stream = UnixStream::connect(socket_path).unwrap();
    let request = serde_json::json!({ "cmd": "attach", "target": name });
    let mut payload = serde_json::to_vec(&request).unwrap();
    payload.push(b'\n');
    stream.write_all(&payload).unwrap();

    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    let reply: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
    assert_eq!(reply.get("ok").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(reply.get("attach").and_then(|v| v.as_bool()), Some(true));
    (reader, stream)
}

fn read_some(reader: &mut BufReader<UnixStream>, timeout: Duration) -> Vec<u8> {
    reader
        .get_ref()
        .set_read_timeout(Some(timeout))
        .unwrap();
    let mut buf = [0u8; 4096];
    match reader.read(&mut buf) {
        Ok(n) => buf[..n].to_vec(),
        Err(_) => Vec::new(),
    }
}

#[test]
fn attaching_to_a_console_program_echoes_its_output() {
    let daemon = Daemon::start(
        r#"
programs:
  shell:
    cmd: "/bin/cat"
    autostart: true
    console: true
"#,
    );
    daemon.wait_for_status("shell", |entry| {
        entry.get("status").and_then(|v| v.as_str()) == Some("STARTED")
    });

    let (mut reader, mut writer) = attach(&daemon.socket_path, "shell");
    writer.write_all(b"hello\n").unwrap();

    let mut collected = Vec::new();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !collected.windows(5).any(|w| w == b"hello") {
        collected.extend(read_some(&mut reader, Duration::from_millis(200)));
        if std::time::Instant::now() >= deadline {
            panic!("never saw echoed output, got {collected:?}");
        }
    }
}

#[test]
fn two_clients_attached_to_the_same_program_both_see_its_output() {
    let daemon = Daemon::start(
        r#"
programs:
  shell:
    cmd: "/bin/cat"
    autostart: true
    console: true
"#,
    );
    daemon.wait_for_status("shell", |entry| {
        entry.get("status").and_then(|v| v.as_str()) == Some("STARTED")
    });

    let (mut reader_a, mut writer_a) = attach(&daemon.socket_path, "shell");
    let (mut reader_b, _writer_b) = attach(&daemon.socket_path, "shell");

    writer_a.write_all(b"broadcast\n").unwrap();

    for reader in [&mut reader_a, &mut reader_b] {
        let mut collected = Vec::new();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !collected.windows(9).any(|w| w == b"broadcast") {
            collected.extend(read_some(reader, Duration::from_millis(200)));
            if std::time::Instant::now() >= deadline {
                panic!("client did not observe broadcast output, got {collected:?}");
            }
        }
    }
}

#[test]
fn stopping_a_program_disconnects_its_attached_clients() {
    let daemon = Daemon::start(
        r#"
programs:
  shell:
    cmd: "/bin/cat"
    autostart: true
    console: true
"#,
    );
    daemon.wait_for_status("shell", |entry| {
        entry.get("status").and_then(|v| v.as_str()) == Some("STARTED")
    });

    let (mut reader, _writer) = attach(&daemon.socket_path, "shell");

    let reply = daemon.send("stop", Some("shell"));
    assert_eq!(reply.get("ok").and_then(|v| v.as_bool()), Some(true));

    reader
        .get_ref()
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut buf = [0u8; 64];
    let n = reader.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0, "attach stream should reach EOF once the program stops");
}
