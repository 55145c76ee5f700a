#[path = "common/mod.rs"]
mod common;

use std::{fs, time::Duration};

use common::{load, sleeper_with_health, write_config};
use tempfile::tempdir;
use warden::{
    diagnostics::{RuleDiagnostician, WAIT_AND_RESTART},
    recovery::RecoveryTimings,
    status::ServiceStatus,
    supervisor::Supervisor,
    test_utils::{free_port, http_response, spawn_http_stub},
};

fn quick_supervisor(config_path: &std::path::Path) -> Supervisor {
    let config = load(config_path);
    Supervisor::new(
        &config,
        Box::new(RuleDiagnostician::with_settle(Duration::from_millis(50))),
    )
    .expect("supervisor builds")
    .with_recovery_timings(RecoveryTimings {
        generic_delay: Duration::from_millis(50),
        stabilization: Duration::from_millis(50),
        verify_timeout: Duration::from_secs(1),
    })
}

#[tokio::test]
async fn unhealthy_service_recovers_after_restart() {
    let dir = tempdir().unwrap();
    let unavailable = http_response("503 Service Unavailable", None);
    let (health_port, _) = spawn_http_stub(vec![
        unavailable.clone(),
        unavailable,
        http_response("200 OK", None),
    ])
    .await;
    let config = write_config(
        dir.path(),
        &format!(
            "recovery: {{ max_attempts: 3 }}\nservices:\n{}",
            sleeper_with_health("api", free_port(), health_port, "1s", 2)
        ),
    );
    let supervisor = quick_supervisor(&config);

    assert!(supervisor.start_all(&[], false, false).await.unwrap());
    assert_eq!(supervisor.status("api"), ServiceStatus::Healthy);
    assert_eq!(supervisor.recovery().attempts_used("api"), 0);

    supervisor.stop_all(false).await.unwrap();

    let history = fs::read_to_string(dir.path().join("logs").join("startup-history.json")).unwrap();
    let history: serde_json::Value = serde_json::from_str(&history).unwrap();
    let record = &history["sessions"][0]["services"]["api"];
    assert_eq!(record["success"], serde_json::Value::Bool(true));
    let recoveries = record["recoveries"].as_array().unwrap();
    assert_eq!(recoveries.len(), 1);
    assert_eq!(recoveries[0]["success"], serde_json::Value::Bool(true));
    assert_eq!(recoveries[0]["strategy"]["name"], WAIT_AND_RESTART);
}

#[tokio::test]
async fn recovery_budget_ends_in_a_permanent_failure() {
    let dir = tempdir().unwrap();
    let (health_port, _) =
        spawn_http_stub(vec![http_response("503 Service Unavailable", None)]).await;
    let config = write_config(
        dir.path(),
        &format!(
            "recovery: {{ max_attempts: 2 }}\nservices:\n{}",
            sleeper_with_health("api", free_port(), health_port, "500ms", 2)
        ),
    );
    let supervisor = quick_supervisor(&config);

    assert!(!supervisor.start_all(&[], false, false).await.unwrap());
    assert_eq!(supervisor.status("api"), ServiceStatus::Failed);

    let failure = supervisor
        .recovery()
        .last_failure("api")
        .expect("failure recorded");
    assert_eq!(failure.attempts, 2);
    assert_eq!(
        failure.strategy.map(|strategy| strategy.name),
        Some(WAIT_AND_RESTART.to_string())
    );

    let rendered = supervisor.report().render(false);
    assert!(rendered.contains("diagnosis: slow_startup"));
    assert!(rendered.contains("0/1 services healthy"));

    supervisor.stop_all(true).await.unwrap();
}
