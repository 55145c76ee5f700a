#[path = "common/mod.rs"]
mod common;

use std::{
    process::{Command as StdCommand, Stdio},
    time::Duration,
};

use assert_cmd::Command;
use common::{pid_file, sleeper, wait_until_blocking, write_config};
use predicates::str::contains;
use tempfile::tempdir;
use warden::{process::is_alive, test_utils::free_port};

fn warden() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("warden"))
}

#[test]
fn unknown_command_exits_non_zero() {
    warden()
        .arg("launch")
        .assert()
        .failure()
        .stderr(contains("unrecognized subcommand"));
}

#[test]
fn start_without_config_fails() {
    let dir = tempdir().unwrap();
    warden()
        .arg("start")
        .arg("--config")
        .arg(dir.path().join("missing.yaml"))
        .assert()
        .failure()
        .stderr(contains("Failed to read config file"));
}

#[test]
fn stop_without_supervisor_succeeds() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path(), &format!("services:\n{}", sleeper("api", free_port())));

    warden()
        .arg("stop")
        .arg("--config")
        .arg(&config)
        .assert()
        .success()
        .stdout(contains("No running warden supervisor found"));
}

#[test]
fn failed_startup_exits_non_zero_with_report() {
    let dir = tempdir().unwrap();
    let config = write_config(
        dir.path(),
        &format!(
            "services:\n  api:\n    port: {}\n    command: \"sleep 30\"\n    cwd: \"missing\"\n",
            free_port()
        ),
    );

    warden()
        .arg("start")
        .arg("--fast")
        .arg("--config")
        .arg(&config)
        .timeout(Duration::from_secs(30))
        .assert()
        .failure()
        .stdout(contains("0/1 services healthy"));

    assert!(pid_file(dir.path()).supervisor().is_none());
}

#[test]
fn stop_tears_down_a_resident_supervisor() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path(), &format!("services:\n{}", sleeper("api", free_port())));

    let mut resident = StdCommand::new(assert_cmd::cargo::cargo_bin!("warden"))
        .arg("start")
        .arg("--fast")
        .arg("--config")
        .arg(&config)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to launch warden");

    let registered = wait_until_blocking(Duration::from_secs(10), || {
        let pids = pid_file(dir.path());
        pids.supervisor().is_some() && pids.get("api").is_some()
    });
    assert!(registered, "supervisor never recorded its pids");
    let service_pid = pid_file(dir.path()).get("api").unwrap();
    assert!(is_alive(service_pid));

    warden()
        .arg("stop")
        .arg("--config")
        .arg(&config)
        .timeout(Duration::from_secs(30))
        .assert()
        .success();

    let exited = wait_until_blocking(Duration::from_secs(10), || {
        matches!(resident.try_wait(), Ok(Some(_)))
    });
    if !exited {
        let _ = resident.kill();
    }
    assert!(exited, "resident supervisor did not exit");
    assert!(resident.wait().unwrap().success());
    assert!(!is_alive(service_pid));
    assert!(!dir.path().join("logs").join("pids.json").exists());
}
