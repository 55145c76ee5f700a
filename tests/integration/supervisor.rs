#[path = "common/mod.rs"]
mod common;

use std::{
    cell::RefCell,
    collections::BTreeSet,
    fs,
    process::Command as StdCommand,
    time::{Duration, Instant},
};

use common::{load, pid_file, sleeper, sleeper_with_health, wait_until, write_config};
use async_trait::async_trait;
use tempfile::tempdir;
use warden::{
    conflict::{ConflictResolver, HostProbe, ProcessInfo},
    diagnostics::RuleDiagnostician,
    process::{is_alive, wait_for_exit},
    status::ServiceStatus,
    supervisor::Supervisor,
    test_utils::{free_port, http_response, spawn_http_stub},
};

fn supervisor_for(config_path: &std::path::Path) -> Supervisor {
    let config = load(config_path);
    Supervisor::new(&config, Box::new(RuleDiagnostician::default())).expect("supervisor builds")
}

#[tokio::test]
async fn fast_start_runs_every_service_and_stop_all_cleans_up() {
    let dir = tempdir().unwrap();
    let config = write_config(
        dir.path(),
        &format!(
            "services:\n{}{}",
            sleeper("api", free_port()),
            sleeper("worker", free_port())
        ),
    );
    let supervisor = supervisor_for(&config);

    assert!(supervisor.start_all(&[], true, false).await.unwrap());

    let api = supervisor.pid("api").expect("api pid");
    let worker = supervisor.pid("worker").expect("worker pid");
    assert!(is_alive(api) && is_alive(worker));
    assert_eq!(supervisor.status("api"), ServiceStatus::Running);
    assert_eq!(pid_file(dir.path()).get("worker"), Some(worker));

    let report = supervisor.report();
    assert_eq!(report.summary_line(), "2/2 services healthy");

    supervisor.stop_all(false).await.unwrap();
    assert!(wait_for_exit(api, Duration::from_secs(2)).await);
    assert!(wait_for_exit(worker, Duration::from_secs(2)).await);
    assert_eq!(supervisor.status("api"), ServiceStatus::Stopped);
    assert!(!dir.path().join("logs").join("pids.json").exists());
}

#[tokio::test]
async fn starting_twice_keeps_a_single_process() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path(), &format!("services:\n{}", sleeper("api", free_port())));
    let supervisor = supervisor_for(&config);
    let ids = vec!["api".to_string()];

    assert!(supervisor.start_all(&ids, true, false).await.unwrap());
    let first = supervisor.pid("api").unwrap();

    assert!(supervisor.start_all(&ids, true, false).await.unwrap());
    let second = supervisor.pid("api").unwrap();

    assert_ne!(first, second);
    assert!(!is_alive(first), "previous process must be gone before the new one runs");
    assert!(is_alive(second));

    supervisor.stop_all(true).await.unwrap();
}

#[tokio::test]
async fn spawn_failure_is_fatal_and_isolated() {
    let dir = tempdir().unwrap();
    let config = write_config(
        dir.path(),
        &format!(
            "services:\n{}  broken:\n    port: {}\n    command: \"sleep 30\"\n    cwd: \"does/not/exist\"\n",
            sleeper("api", free_port()),
            free_port()
        ),
    );
    let supervisor = supervisor_for(&config);

    assert!(!supervisor.start_all(&[], false, false).await.unwrap());

    assert_eq!(supervisor.status("broken"), ServiceStatus::Failed);
    assert_eq!(supervisor.recovery().attempts_used("broken"), 0);
    assert!(supervisor.recovery().last_failure("broken").is_none());
    assert!(supervisor.status("api").is_up());

    let report = supervisor.report();
    assert_eq!(report.summary_line(), "1/2 services healthy");
    let broken = report.services.iter().find(|s| s.id == "broken").unwrap();
    assert!(broken.error.as_deref().unwrap_or_default().contains("Failed to spawn"));

    supervisor.stop_all(false).await.unwrap();
}

#[tokio::test]
async fn unknown_service_id_is_rejected() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path(), &format!("services:\n{}", sleeper("api", free_port())));
    let supervisor = supervisor_for(&config);

    let err = supervisor
        .start_all(&["ghost".to_string()], true, false)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("ghost"));
    assert!(supervisor.pid("api").is_none());
}

#[tokio::test]
async fn healthy_start_is_recorded_in_history() {
    let dir = tempdir().unwrap();
    let (health_port, hits) = spawn_http_stub(vec![http_response("200 OK", None)]).await;
    let config = write_config(
        dir.path(),
        &format!(
            "services:\n{}",
            sleeper_with_health("api", free_port(), health_port, "5s", 10)
        ),
    );
    let supervisor = supervisor_for(&config);

    assert!(supervisor.start_all(&[], false, false).await.unwrap());
    assert_eq!(supervisor.status("api"), ServiceStatus::Healthy);
    assert!(hits.load(std::sync::atomic::Ordering::SeqCst) >= 1);

    supervisor.stop_all(false).await.unwrap();

    let history = fs::read_to_string(dir.path().join("logs").join("startup-history.json")).unwrap();
    let history: serde_json::Value = serde_json::from_str(&history).unwrap();
    let sessions = history["sessions"].as_array().unwrap();
    assert_eq!(sessions.len(), 1);
    let record = &sessions[0]["services"]["api"];
    assert_eq!(record["success"], serde_json::Value::Bool(true));
    assert!(record["startup_duration_ms"].is_u64());
    assert!(sessions[0]["ended_at"].is_string());
}

#[tokio::test]
async fn dead_service_is_restarted_by_the_supervision_loop() {
    let dir = tempdir().unwrap();
    let config = write_config(
        dir.path(),
        &format!(
            "monitor: {{ interval: \"200ms\", restart_delay: \"100ms\" }}\nservices:\n  api:\n    port: {}\n    command: \"sleep 1\"\n",
            free_port()
        ),
    );
    let supervisor = supervisor_for(&config);

    assert!(supervisor.start_all(&[], true, false).await.unwrap());
    let first = supervisor.pid("api").unwrap();

    let restarted = async {
        wait_until(Duration::from_secs(8), || {
            matches!(supervisor.pid("api"), Some(pid) if pid != first)
        })
        .await;
    };
    tokio::time::timeout(Duration::from_secs(10), supervisor.supervise(restarted))
        .await
        .expect("supervision loop returns on shutdown");

    let second = supervisor.pid("api").expect("service restarted");
    assert_ne!(first, second);

    supervisor.stop_all(true).await.unwrap();
}

/// Reports one stray process whose command line looks like the service.
struct StrayProbe {
    stray: u32,
}

#[async_trait(?Send)]
impl HostProbe for StrayProbe {
    async fn port_in_use(&self, _port: u16) -> bool {
        false
    }

    async fn port_owners(&self, _port: u16) -> Vec<u32> {
        Vec::new()
    }

    async fn processes(&self) -> Vec<ProcessInfo> {
        vec![ProcessInfo {
            pid: self.stray,
            command_line: "legacy-api --serve".to_string(),
        }]
    }
}

#[tokio::test]
async fn stale_process_is_cleared_before_start() {
    let dir = tempdir().unwrap();
    let mut stray = StdCommand::new("sleep").arg("30").spawn().unwrap();
    let stray_pid = stray.id();

    let config = write_config(
        dir.path(),
        &format!(
            "services:\n  api:\n    port: {}\n    command: \"sleep 30\"\n    conflict_patterns: [\"legacy-api\"]\n",
            free_port()
        ),
    );
    let supervisor = supervisor_for(&config)
        .with_conflict_resolver(ConflictResolver::new(Box::new(StrayProbe { stray: stray_pid })));

    assert!(supervisor.start_all(&[], true, false).await.unwrap());

    let reaped = wait_until(Duration::from_secs(5), || matches!(stray.try_wait(), Ok(Some(_)))).await;
    assert!(reaped, "stray process should have been terminated");
    assert!(supervisor.pid("api").is_some_and(is_alive));

    supervisor.stop_all(false).await.unwrap();
}

#[tokio::test]
async fn restarting_one_service_spares_a_sibling_matching_its_pattern() {
    let dir = tempdir().unwrap();
    let config = write_config(
        dir.path(),
        &format!(
            "services:\n  api:\n    port: {}\n    command: \"sleep 31\"\n    conflict_patterns: [\"^sleep \"]\n  worker:\n    port: {}\n    command: \"sleep 32\"\n",
            free_port(),
            free_port()
        ),
    );
    let supervisor = supervisor_for(&config);

    assert!(supervisor.start_all(&[], true, false).await.unwrap());
    let worker = supervisor.pid("worker").expect("worker pid");
    let api = supervisor.pid("api").expect("api pid");

    assert!(supervisor.start_all(&["api".to_string()], true, false).await.unwrap());

    assert!(is_alive(worker), "sibling must survive conflict clearing");
    assert_eq!(supervisor.pid("worker"), Some(worker));
    assert_eq!(supervisor.status("worker"), ServiceStatus::Running);
    assert!(supervisor.pid("api").is_some_and(|pid| pid != api && is_alive(pid)));

    supervisor.stop_all(true).await.unwrap();
}

#[tokio::test]
async fn monitor_restarts_stop_once_the_budget_is_spent() {
    let dir = tempdir().unwrap();
    let config = write_config(
        dir.path(),
        &format!(
            "monitor: {{ interval: \"100ms\", restart_delay: \"50ms\" }}\nrecovery: {{ max_attempts: 2 }}\nservices:\n  api:\n    port: {}\n    command: \"sleep 0.3\"\n",
            free_port()
        ),
    );
    let supervisor = supervisor_for(&config);

    assert!(supervisor.start_all(&[], true, false).await.unwrap());
    let seen = RefCell::new(BTreeSet::from([supervisor.pid("api").unwrap()]));

    let observe = async {
        let deadline = Instant::now() + Duration::from_secs(4);
        while Instant::now() < deadline {
            if let Some(pid) = supervisor.pid("api") {
                seen.borrow_mut().insert(pid);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    supervisor.supervise(observe).await;

    assert_eq!(seen.borrow().len(), 3, "initial launch plus two restarts: {:?}", seen.borrow());
    assert_eq!(supervisor.status("api"), ServiceStatus::Failed);
    assert!(supervisor.pid("api").is_none());

    supervisor.stop_all(true).await.unwrap();
}
