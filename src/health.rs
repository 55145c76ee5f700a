//! Bounded HTTP health polling.
use std::time::{Duration, Instant};

use reqwest::{Client, StatusCode, header::CONTENT_TYPE, redirect::Policy};
use tracing::{debug, info};

use crate::{
    config::{HealthPolicy, ServiceDescriptor},
    constants::{MAX_HEALTH_REQUEST_TIMEOUT, MIN_HEALTH_INTERVAL},
    error::SupervisorError,
    process::is_alive,
};

/// Result of a successful health wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthReport {
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Polls health endpoints. Redirects are not followed, so a 3xx answer counts as healthy.
#[derive(Debug, Clone)]
pub struct HealthChecker {
    client: Client,
}

impl HealthChecker {
    pub fn new() -> Result<Self, SupervisorError> {
        let client = Client::builder().redirect(Policy::none()).build()?;
        Ok(Self { client })
    }

    /// Spacing between probes and the per-request timeout for a policy.
    pub fn schedule(timeout: Duration, max_attempts: u32) -> (Duration, Duration) {
        let interval = (timeout / max_attempts.max(1)).max(MIN_HEALTH_INTERVAL);
        (interval, interval.min(MAX_HEALTH_REQUEST_TIMEOUT))
    }

    /// Waits for the descriptor's health endpoint within `timeout`.
    ///
    /// After the warm-up delay, probes at most `max_attempts` times. When `pid` is given and
    /// that process dies, waiting stops with [`SupervisorError::ProcessExited`].
    pub async fn wait(
        &self,
        descriptor: &ServiceDescriptor,
        timeout: Duration,
        pid: Option<u32>,
    ) -> Result<HealthReport, SupervisorError> {
        let service = descriptor.id.as_str();
        let Some(policy) = descriptor.health.as_ref() else {
            return Ok(HealthReport {
                attempts: 0,
                elapsed: Duration::ZERO,
            });
        };

        let started = Instant::now();
        if !policy.warmup.is_zero() {
            debug!("Waiting {:?} before probing '{service}'", policy.warmup);
            tokio::time::sleep(policy.warmup).await;
        }

        let max_attempts = policy.max_attempts.max(1);
        let (interval, request_timeout) = Self::schedule(timeout, max_attempts);
        let deadline = Instant::now() + timeout;
        let mut attempts = 0;

        while attempts < max_attempts {
            if let Some(pid) = pid
                && !is_alive(pid)
            {
                return Err(SupervisorError::ProcessExited {
                    service: service.to_string(),
                    detail: format!("pid {pid} is gone"),
                });
            }

            attempts += 1;
            let probe_started = Instant::now();
            if self.probe(policy, request_timeout).await {
                let elapsed = started.elapsed();
                info!("✔ Service '{service}' healthy after {attempts} attempt(s) ({elapsed:?})");
                return Ok(HealthReport { attempts, elapsed });
            }

            let now = Instant::now();
            if now >= deadline || attempts >= max_attempts {
                break;
            }
            let pause = interval
                .saturating_sub(probe_started.elapsed())
                .min(deadline - now);
            tokio::time::sleep(pause).await;
        }

        Err(SupervisorError::HealthCheckTimeout {
            service: service.to_string(),
            timeout,
            attempts,
        })
    }

    /// One probe with a short timeout, used to verify a recovery.
    pub async fn check_once(&self, policy: &HealthPolicy, timeout: Duration) -> bool {
        self.probe(policy, timeout).await
    }

    async fn probe(&self, policy: &HealthPolicy, timeout: Duration) -> bool {
        let response = match self.client.get(&policy.url).timeout(timeout).send().await {
            Ok(response) => response,
            Err(err) => {
                debug!("Health probe {} failed: {err}", policy.url);
                return false;
            }
        };

        let status = response.status();
        if status.is_success() || status.is_redirection() {
            return true;
        }

        let html = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.to_ascii_lowercase().contains("text/html"));
        let starting = matches!(
            status,
            StatusCode::NOT_FOUND | StatusCode::INTERNAL_SERVER_ERROR
        );
        if policy.lenient_html && html && starting {
            debug!("Accepting {status} HTML answer from {} as starting", policy.url);
            return true;
        }

        debug!("Health probe {} answered {status}", policy.url);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{descriptor_with_health, http_response, spawn_http_stub};
    use std::sync::atomic::Ordering;
    use tempfile::tempdir;

    fn url(port: u16) -> String {
        format!("http://127.0.0.1:{port}/health")
    }

    #[test]
    fn schedule_respects_floor_and_request_cap() {
        let (interval, request) = HealthChecker::schedule(Duration::from_secs(30), 30);
        assert_eq!(interval, Duration::from_secs(1));
        assert_eq!(request, Duration::from_secs(1));

        let (interval, _) = HealthChecker::schedule(Duration::from_secs(1), 100);
        assert_eq!(interval, MIN_HEALTH_INTERVAL);

        let (interval, request) = HealthChecker::schedule(Duration::from_secs(60), 2);
        assert_eq!(interval, Duration::from_secs(30));
        assert_eq!(request, MAX_HEALTH_REQUEST_TIMEOUT);
    }

    #[tokio::test]
    async fn becomes_healthy_after_failures() {
        let dir = tempdir().unwrap();
        let (port, hits) = spawn_http_stub(vec![
            http_response("503 Service Unavailable", None),
            http_response("503 Service Unavailable", None),
            http_response("200 OK", None),
        ])
        .await;
        let desc = descriptor_with_health(
            "api",
            port,
            "serve",
            dir.path(),
            &url(port),
            (Duration::from_secs(5), 20),
        );

        let report = HealthChecker::new()
            .unwrap()
            .wait(&desc, Duration::from_secs(5), None)
            .await
            .unwrap();
        assert_eq!(report.attempts, 3);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn redirect_counts_as_healthy() {
        let (port, _) = spawn_http_stub(vec![http_response("302 Found", None)]).await;
        let dir = tempdir().unwrap();
        let desc = descriptor_with_health(
            "web",
            port,
            "serve",
            dir.path(),
            &url(port),
            (Duration::from_secs(2), 4),
        );
        let checker = HealthChecker::new().unwrap();
        assert!(
            checker
                .check_once(desc.health.as_ref().unwrap(), Duration::from_secs(1))
                .await
        );
    }

    #[tokio::test]
    async fn html_errors_only_pass_when_lenient() {
        let (port, _) = spawn_http_stub(vec![http_response(
            "404 Not Found",
            Some("text/html; charset=utf-8"),
        )])
        .await;
        let dir = tempdir().unwrap();
        let mut desc = descriptor_with_health(
            "ui",
            port,
            "serve",
            dir.path(),
            &url(port),
            (Duration::from_millis(600), 2),
        );
        let checker = HealthChecker::new().unwrap();

        let err = checker
            .wait(&desc, Duration::from_millis(600), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::HealthCheckTimeout { attempts: 2, .. }
        ));
        assert!(err.is_recoverable());

        desc.health.as_mut().unwrap().lenient_html = true;
        assert!(checker.wait(&desc, Duration::from_millis(600), None).await.is_ok());
    }

    #[tokio::test]
    async fn dead_process_fails_fast() {
        let dir = tempdir().unwrap();
        let port = crate::test_utils::free_port();
        let desc = descriptor_with_health(
            "api",
            port,
            "serve",
            dir.path(),
            &url(port),
            (Duration::from_secs(30), 30),
        );

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        let started = Instant::now();
        let err = HealthChecker::new()
            .unwrap()
            .wait(&desc, Duration::from_secs(30), Some(pid))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::ProcessExited { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn missing_policy_is_trivially_healthy() {
        let dir = tempdir().unwrap();
        let desc = crate::test_utils::descriptor("bg", 1, "sleep 1", dir.path());
        let report = HealthChecker::new()
            .unwrap()
            .wait(&desc, Duration::from_secs(1), None)
            .await
            .unwrap();
        assert_eq!(report.attempts, 0);
    }
}
