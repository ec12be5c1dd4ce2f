#[path = "common/mod.rs"]
mod common;

use common::Daemon;

#[test]
fn autostart_program_is_running_after_boot() {
    let daemon = Daemon::start(
        r#"
programs:
  sleeper:
    cmd: "/bin/sleep 30"
    autostart: true
"#,
    );

    let entry = daemon.wait_for_status("sleeper", |entry| {
        entry.get("status").and_then(|v| v.as_str()) == Some("STARTED")
    });
    assert!(entry.get("pid").unwrap().is_number());
}

#[test]
fn program_without_autostart_stays_created() {
    let daemon = Daemon::start(
        r#"
programs:
  idle:
    cmd: "/bin/sleep 30"
    autostart: false
"#,
    );

    let reply = daemon.send("status", None);
    let entry = common::status_entry(&reply, "idle").unwrap();
    assert_eq!(entry.get("status").and_then(|v| v.as_str()), Some("CREATED"));
}

#[test]
fn start_then_stop_round_trips_through_status() {
    let daemon = Daemon::start(
        r#"
programs:
  web:
    cmd: "/bin/sleep 30"
    autostart: false
"#,
    );

    let reply = daemon.send("start", Some("web"));
    assert_eq!(reply.get("ok").and_then(|v| v.as_bool()), Some(true));
    daemon.wait_for_status("web", |entry| {
        entry.get("status").and_then(|v| v.as_str()) == Some("STARTED")
    });

    let reply = daemon.send("stop", Some("web"));
    assert_eq!(reply.get("ok").and_then(|v| v.as_bool()), Some(true));
    daemon.wait_for_status("web", |entry| {
        entry.get("status").and_then(|v| v.as_str()) == Some("STOPPED")
    });
}

#[test]
fn start_on_unknown_program_fails() {
    let daemon = Daemon::start("programs: {}\n");
    let reply = daemon.send("start", Some("ghost"));
    assert_eq!(reply.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert!(
        reply
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap()
            .contains("not found")
    );
}

#[test]
fn double_start_is_rejected() {
    let daemon = Daemon::start(
        r#"
programs:
  web:
    cmd: "/bin/sleep 30"
    autostart: true
"#,
    );
    daemon.wait_for_status("web", |entry| {
        entry.get("status").and_then(|v| v.as_str()) == Some("STARTED")
    });

    let reply = daemon.send("start", Some("web"));
    assert_eq!(reply.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert!(
        reply
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap()
            .contains("already running")
    );
}

#[test]
fn restart_produces_a_new_pid() {
    let daemon = Daemon::start(
        r#"
programs:
  web:
    cmd: "/bin/sleep 30"
    autostart: true
"#,
    );
    let before = daemon.wait_for_status("web", |entry| {
        entry.get("status").and_then(|v| v.as_str()) == Some("STARTED")
    });
    let pid_before = before.get("pid").and_then(|v| v.as_u64()).unwrap();

    let reply = daemon.send("restart", Some("web"));
    assert_eq!(reply.get("ok").and_then(|v| v.as_bool()), Some(true));

    let after = daemon.wait_for_status("web", |entry| {
        entry
            .get("pid")
            .and_then(|v| v.as_u64())
            .is_some_and(|pid| pid != pid_before)
    });
    let pid_after = after.get("pid").and_then(|v| v.as_u64()).unwrap();
    assert_ne!(pid_before, pid_after);
    common::wait_for_process_exit(pid_before as u32);
}

#[test]
fn numprocs_keeps_multiple_instances_alive() {
    let daemon = Daemon::start(
        r#"
programs:
  worker:
    cmd: "/bin/sleep 30"
    autostart: true
    numprocs: 3
"#,
    );
    daemon.wait_for_status("worker", |entry| {
        entry.get("status").and_then(|v| v.as_str()) == Some("STARTED")
    });

    let reply = daemon.send("status", None);
    let entry = common::status_entry(&reply, "worker").unwrap();
    assert_eq!(entry.get("status").and_then(|v| v.as_str()), Some("STARTED"));
}
