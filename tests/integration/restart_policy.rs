#[path = "common/mod.rs"]
mod common;

use std::{thread, time::Duration};

use common::Daemon;

/// Gives the background monitor (2s tick) time to reap and classify an exit.
fn settle() {
    thread::sleep(Duration::from_secs(3));
}

#[test]
fn always_policy_restarts_after_a_clean_exit() {
    let daemon = Daemon::start(
        r#"
programs:
  blip:
    cmd: "/bin/sleep 1"
    autostart: true
    autorestart: always
    starttime: 0
"#,
    );
    let first = daemon.wait_for_status("blip", |entry| {
        entry.get("status").and_then(|v| v.as_str()) == Some("STARTED")
    });
    let pid_first = first.get("pid").and_then(|v| v.as_u64()).unwrap();

    settle();
    settle();

    let reply = daemon.send("status", None);
    let entry = common::status_entry(&reply, "blip").unwrap();
    assert_eq!(entry.get("status").and_then(|v| v.as_str()), Some("STARTED"));
    let pid_later = entry.get("pid").and_then(|v| v.as_u64()).unwrap();
    assert_ne!(
        pid_first, pid_later,
        "always policy should have respawned at least once by now"
    );
}

#[test]
fn never_policy_leaves_the_program_stopped_after_exit() {
    let daemon = Daemon::start(
        r#"
programs:
  onceoff:
    cmd: "/bin/sleep 1"
    autostart: true
    autorestart: never
"#,
    );
    daemon.wait_for_status("onceoff", |entry| {
        entry.get("status").and_then(|v| v.as_str()) == Some("STARTED")
    });

    let entry = daemon.wait_for_status("onceoff", |entry| {
        entry.get("status").and_then(|v| v.as_str()) == Some("STOPPED")
    });
    assert!(entry.get("pid").unwrap().is_null());
}

#[test]
fn on_unexpected_does_not_restart_a_declared_exit_code() {
    let daemon = Daemon::start(
        r#"
programs:
  tidy:
    cmd: "/bin/sh -c 'exit 0'"
    autostart: true
    autorestart: unexpected
    exitcodes: 0
"#,
    );

    let entry = daemon.wait_for_status("tidy", |entry| {
        entry.get("status").and_then(|v| v.as_str()) == Some("STOPPED")
    });
    assert!(entry.get("pid").unwrap().is_null());
}

#[test]
fn on_unexpected_restarts_after_an_undeclared_exit_code() {
    let daemon = Daemon::start(
        r#"
programs:
  crashy:
    cmd: "/bin/sh -c 'exit 1'"
    autostart: true
    autorestart: unexpected
    exitcodes: 0
    startretries: 5
"#,
    );

    // With a non-zero exit code outside `exitcodes`, the monitor keeps respawning
    // a fresh instance every tick rather than settling into STOPPED.
    settle();
    let reply = daemon.send("status", None);
    let entry = common::status_entry(&reply, "crashy").unwrap();
    assert_eq!(entry.get("status").and_then(|v| v.as_str()), Some("STARTED"));
}

#[test]
fn exhausting_startretries_on_a_crash_loop_marks_the_program_stopped() {
    let daemon = Daemon::start(
        r#"
programs:
  loopy:
    cmd: "/bin/sh -c 'exit 1'"
    autostart: true
    autorestart: always
    starttime: 5
    startretries: 2
"#,
    );

    // Every exit lands well under `starttime`, so each one burns the retry budget;
    // after it's exhausted the slot is marked failed and reconcile stops refilling it.
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        let reply = daemon.send("status", None);
        let entry = common::status_entry(&reply, "loopy").unwrap();
        if entry.get("status").and_then(|v| v.as_str()) == Some("STOPPED") {
            break;
        }
        if std::time::Instant::now() >= deadline {
            panic!("loopy never settled into STOPPED after exhausting startretries");
        }
        thread::sleep(Duration::from_millis(200));
    }
}
