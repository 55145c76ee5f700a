//! Built-in rule-based diagnostician used when no external one is injected.
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::{
    config::ServiceDescriptor,
    constants::WAIT_AND_RESTART_DELAY,
    failure::FailureCategory,
    recovery::{Diagnosis, Diagnostician, RecoveryActions, Strategy, Symptoms},
};

pub const CLEAR_PORT_AND_RESTART: &str = "clear-port-and-restart";
pub const RESTART: &str = "restart";
pub const WAIT_AND_RESTART: &str = "wait-and-restart";

/// Maps symptoms to a handful of well-understood causes.
///
/// Build and dependency failures are diagnosed but get no strategy: restarting does not fix
/// them, so the orchestrator's single generic attempt applies.
#[derive(Debug, Clone)]
pub struct RuleDiagnostician {
    settle: Duration,
}

impl Default for RuleDiagnostician {
    fn default() -> Self {
        Self {
            settle: WAIT_AND_RESTART_DELAY,
        }
    }
}

impl RuleDiagnostician {
    pub fn with_settle(settle: Duration) -> Self {
        Self { settle }
    }

    fn diagnosis(cause: &str, category: FailureCategory, confidence: f64, details: String) -> Diagnosis {
        Diagnosis {
            cause: cause.to_string(),
            category,
            confidence,
            details: Some(details),
        }
    }
}

#[async_trait(?Send)]
impl Diagnostician for RuleDiagnostician {
    async fn diagnose(&self, service: &str, symptoms: &Symptoms) -> Option<Diagnosis> {
        let markers = symptoms.log_markers.join(", ");
        let diagnosis = match symptoms.category {
            FailureCategory::PortConflict => Self::diagnosis(
                "port_conflict",
                FailureCategory::PortConflict,
                0.9,
                format!("port already in use ({markers})"),
            ),
            FailureCategory::BuildError | FailureCategory::DependencyError => Self::diagnosis(
                "broken_build",
                symptoms.category,
                0.8,
                format!("log shows {markers}"),
            ),
            _ if symptoms.memory_pressure => Self::diagnosis(
                "memory_pressure",
                symptoms.category,
                0.6,
                format!(
                    "{:.0}% of memory available",
                    symptoms.available_memory_ratio * 100.0
                ),
            ),
            _ if !symptoms.process_alive => Self::diagnosis(
                "process_crashed",
                symptoms.category,
                0.7,
                symptoms
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "process is not running".to_string()),
            ),
            FailureCategory::Timeout | FailureCategory::ConnectionRefused => Self::diagnosis(
                "slow_startup",
                symptoms.category,
                0.5,
                "process alive but not answering health checks".to_string(),
            ),
            _ => {
                debug!("No rule matched symptoms for '{service}'");
                return None;
            }
        };
        Some(diagnosis)
    }

    fn select_strategy(&self, _service: &str, diagnosis: &Diagnosis) -> Option<Strategy> {
        match diagnosis.cause.as_str() {
            "port_conflict" => Some(Strategy::new(
                CLEAR_PORT_AND_RESTART,
                "kill the port holder and start again",
            )),
            "process_crashed" => Some(Strategy::new(RESTART, "start the service again")),
            "slow_startup" | "memory_pressure" => Some(Strategy::new(
                WAIT_AND_RESTART,
                "give the host time to settle, then restart",
            )),
            _ => None,
        }
    }

    async fn execute(
        &self,
        strategy: &Strategy,
        descriptor: &ServiceDescriptor,
        actions: &dyn RecoveryActions,
    ) -> Result<(), String> {
        let id = descriptor.id.as_str();
        match strategy.name.as_str() {
            CLEAR_PORT_AND_RESTART => {
                actions.stop_service(id, true).await.map_err(|e| e.to_string())?;
                if !actions.clear_conflicts(id).await {
                    return Err(format!("port {} is still held", descriptor.port));
                }
            }
            RESTART => {
                actions.stop_service(id, false).await.map_err(|e| e.to_string())?;
            }
            WAIT_AND_RESTART => {
                tokio::time::sleep(self.settle).await;
                actions.stop_service(id, false).await.map_err(|e| e.to_string())?;
            }
            other => return Err(format!("unknown strategy '{other}'")),
        }
        actions.restart_service(id).await.map_err(|e| e.to_string())
    }
}
