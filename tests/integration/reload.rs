#[path = "common/mod.rs"]
mod common;

use std::{thread, time::Duration};

use common::Daemon;

#[test]
fn reload_adds_a_new_program_and_starts_it() {
    let daemon = Daemon::start(
        r#"
programs:
  a:
    cmd: "/bin/sleep 30"
    autostart: true
"#,
    );
    daemon.wait_for_status("a", |entry| {
        entry.get("status").and_then(|v| v.as_str()) == Some("STARTED")
    });

    std::fs::write(
        daemon.dir.path().join("taskmaster.yaml"),
        r#"
programs:
  a:
    cmd: "/bin/sleep 30"
    autostart: true
  b:
    cmd: "/bin/sleep 30"
    autostart: true
"#,
    )
    .unwrap();

    let reply = daemon.send("reload", None);
    assert_eq!(reply.get("ok").and_then(|v| v.as_bool()), Some(true));

    daemon.wait_for_status("b", |entry| {
        entry.get("status").and_then(|v| v.as_str()) == Some("STARTED")
    });
}

#[test]
fn reload_removes_a_program_dropped_from_the_file() {
    let daemon = Daemon::start(
        r#"
programs:
  a:
    cmd: "/bin/sleep 30"
    autostart: true
  b:
    cmd: "/bin/sleep 30"
    autostart: true
"#,
    );
    daemon.wait_for_status("b", |entry| {
        entry.get("status").and_then(|v| v.as_str()) == Some("STARTED")
    });

    std::fs::write(
        daemon.dir.path().join("taskmaster.yaml"),
        r#"
programs:
  a:
    cmd: "/bin/sleep 30"
    autostart: true
"#,
    )
    .unwrap();

    let reply = daemon.send("reload", None);
    assert_eq!(reply.get("ok").and_then(|v| v.as_bool()), Some(true));

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status = daemon.send("status", None);
        if common::status_entry(&status, "b").is_none() {
            break;
        }
        if std::time::Instant::now() >= deadline {
            panic!("program 'b' was not removed by reload");
        }
        thread::sleep(Duration::from_millis(100));
    }
}

#[test]
fn reload_with_no_changes_reports_nothing_changed_and_preserves_the_pid() {
    let daemon = Daemon::start(
        r#"
programs:
  a:
    cmd: "/bin/sleep 30"
    autostart: true
"#,
    );
    let before = daemon.wait_for_status("a", |entry| {
        entry.get("status").and_then(|v| v.as_str()) == Some("STARTED")
    });
    let pid_before = before.get("pid").and_then(|v| v.as_u64()).unwrap();

    let reply = daemon.send("reload", None);
    assert_eq!(reply.get("ok").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(
        reply.get("message").and_then(|v| v.as_str()),
        Some("nothing changed")
    );

    let after = daemon.send("status", None);
    let entry = common::status_entry(&after, "a").unwrap();
    assert_eq!(entry.get("pid").and_then(|v| v.as_u64()), Some(pid_before));
}

#[test]
fn reload_on_a_changed_command_replaces_the_running_instance() {
    let daemon = Daemon::start(
        r#"
programs:
  a:
    cmd: "/bin/sleep 30"
    autostart: true
"#,
    );
    let before = daemon.wait_for_status("a", |entry| {
        entry.get("status").and_then(|v| v.as_str()) == Some("STARTED")
    });
    let pid_before = before.get("pid").and_then(|v| v.as_u64()).unwrap();

    std::fs::write(
        daemon.dir.path().join("taskmaster.yaml"),
        r#"
programs:
  a:
    cmd: "/bin/sleep 60"
    autostart: true
"#,
    )
    .unwrap();

    let reply = daemon.send("reload", None);
    assert_eq!(reply.get("ok").and_then(|v| v.as_bool()), Some(true));
    assert_ne!(
        reply.get("message").and_then(|v| v.as_str()),
        Some("nothing changed")
    );

    let after = daemon.wait_for_status("a", |entry| {
        entry
            .get("pid")
            .and_then(|v| v.as_u64())
            .is_some_and(|pid| pid != pid_before)
    });
    assert!(after.get("pid").is_some());
}
