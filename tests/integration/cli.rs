#[path = "common/mod.rs"]
mod common;

use assert_cmd::Command;
use common::Daemon;
use predicates::str::contains;

fn client(daemon: &Daemon) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("taskmasterd"));
    cmd.env("TASKMASTER_SOCKET", &daemon.socket_path);
    cmd
}

#[test]
fn status_with_no_running_daemon_fails_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("taskmasterd"));
    cmd.env("TASKMASTER_SOCKET", dir.path().join("nothing.sock"))
        .arg("status")
        .assert()
        .failure();
}

#[test]
fn status_json_lists_autostart_programs() {
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

    client(&daemon)
        .arg("status")
        .arg("--json")
        .assert()
        .success()
        .stdout(contains("\"web\""))
        .stdout(contains("STARTED"));
}

#[test]
fn status_table_lists_the_expected_columns() {
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

    client(&daemon)
        .arg("status")
        .assert()
        .success()
        .stdout(contains("NAME"))
        .stdout(contains("STATUS"))
        .stdout(contains("web"));
}

#[test]
fn start_stop_restart_round_trip_through_the_cli() {
    let daemon = Daemon::start(
        r#"
programs:
  web:
    cmd: "/bin/sleep 30"
    autostart: false
"#,
    );

    client(&daemon).arg("start").arg("web").assert().success();
    daemon.wait_for_status("web", |entry| {
        entry.get("status").and_then(|v| v.as_str()) == Some("STARTED")
    });

    client(&daemon).arg("restart").arg("web").assert().success();
    daemon.wait_for_status("web", |entry| {
        entry.get("status").and_then(|v| v.as_str()) == Some("STARTED")
    });

    client(&daemon).arg("stop").arg("web").assert().success();
    daemon.wait_for_status("web", |entry| {
        entry.get("status").and_then(|v| v.as_str()) == Some("STOPPED")
    });
}

#[test]
fn stop_on_an_unknown_program_fails_with_a_useful_message() {
    let daemon = Daemon::start("programs: {}\n");
    client(&daemon)
        .arg("stop")
        .arg("ghost")
        .assert()
        .failure()
        .stdout(contains("not found"));
}

#[test]
fn reload_with_no_changes_reports_nothing_changed() {
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

    client(&daemon)
        .arg("reload")
        .assert()
        .success()
        .stdout(contains("nothing changed"));
}
