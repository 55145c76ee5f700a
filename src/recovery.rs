//! Bounded diagnose, strategy, execute and verify cycles for services that failed to become
//! healthy.
use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    path::PathBuf,
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::{
    config::ServiceDescriptor,
    constants::{
        DEFAULT_ERROR_MARKERS, GENERIC_RECOVERY_DELAY, MEMORY_PRESSURE_RATIO,
        RECOVERY_STABILIZATION_DELAY, RECOVERY_VERIFY_TIMEOUT, SYMPTOM_LOG_LINES,
    },
    error::SupervisorError,
    failure::{FailureCategory, classify},
    history::RecoveryRecord,
    logs::{find_markers, resolve_log_path},
    process::{MemorySnapshot, is_alive, port_bound},
};

/// Observations gathered about a failing service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Symptoms {
    pub process_alive: bool,
    pub port_bound: bool,
    /// Known error markers found in the recent service log.
    #[serde(default)]
    pub log_markers: Vec<String>,
    pub memory_pressure: bool,
    pub available_memory_ratio: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub category: FailureCategory,
}

/// A diagnostician's explanation of the symptoms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub cause: String,
    pub category: FailureCategory,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// A named remediation. Its actions are known only to the diagnostician that chose it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Strategy {
    pub name: String,
    pub description: String,
}

impl Strategy {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
        }
    }
}

/// Service operations a strategy may perform. Implemented by the supervisor.
#[async_trait(?Send)]
pub trait RecoveryActions {
    async fn stop_service(&self, id: &str, force: bool) -> Result<(), SupervisorError>;

    /// Runs the full start pipeline (conflict clearing, spawn, monitor attach) again.
    async fn restart_service(&self, id: &str) -> Result<(), SupervisorError>;

    async fn clear_conflicts(&self, id: &str) -> bool;

    /// Single health probe with a short timeout.
    async fn verify_health(&self, id: &str, timeout: Duration) -> bool;

    fn current_pid(&self, id: &str) -> Option<u32>;

    /// Stores the outcome of an attempt for later analysis.
    fn record_recovery(&self, id: &str, record: RecoveryRecord);
}

/// External diagnostic collaborator.
#[async_trait(?Send)]
pub trait Diagnostician {
    async fn diagnose(&self, service: &str, symptoms: &Symptoms) -> Option<Diagnosis>;

    fn select_strategy(&self, service: &str, diagnosis: &Diagnosis) -> Option<Strategy>;

    async fn execute(
        &self,
        strategy: &Strategy,
        descriptor: &ServiceDescriptor,
        actions: &dyn RecoveryActions,
    ) -> Result<(), String>;
}

/// Why recovery of a service ended without success.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryFailure {
    pub attempts: u32,
    pub diagnosis: Option<Diagnosis>,
    pub strategy: Option<Strategy>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryOutcome {
    Recovered {
        attempt: u32,
        strategy: Option<Strategy>,
    },
    /// The attempt failed but budget remains.
    Failed { attempt: u32, error: String },
    /// No further attempts will be made for this service in this run.
    Exhausted(RecoveryFailure),
}

/// Delays used by the orchestrator.
#[derive(Debug, Clone, Copy)]
pub struct RecoveryTimings {
    pub generic_delay: Duration,
    pub stabilization: Duration,
    pub verify_timeout: Duration,
}

impl Default for RecoveryTimings {
    fn default() -> Self {
        Self {
            generic_delay: GENERIC_RECOVERY_DELAY,
            stabilization: RECOVERY_STABILIZATION_DELAY,
            verify_timeout: RECOVERY_VERIFY_TIMEOUT,
        }
    }
}

/// Runs recovery attempts under a per-service budget.
///
/// The attempt counter resets only after a verified success. When the diagnostician yields
/// no diagnosis or no strategy, a single generic stop, delay, restart and verify cycle is run
/// and, if that fails too, recovery for the service is over.
pub struct RecoveryOrchestrator {
    diagnostician: Box<dyn Diagnostician>,
    max_attempts: u32,
    logs_dir: PathBuf,
    timings: RecoveryTimings,
    attempts: RefCell<HashMap<String, u32>>,
    given_up: RefCell<HashSet<String>>,
    last_failure: RefCell<HashMap<String, RecoveryFailure>>,
}

impl RecoveryOrchestrator {
    pub fn new(diagnostician: Box<dyn Diagnostician>, max_attempts: u32, logs_dir: PathBuf) -> Self {
        Self {
            diagnostician,
            max_attempts,
            logs_dir,
            timings: RecoveryTimings::default(),
            attempts: RefCell::new(HashMap::new()),
            given_up: RefCell::new(HashSet::new()),
            last_failure: RefCell::new(HashMap::new()),
        }
    }

    pub fn with_timings(mut self, timings: RecoveryTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Attempts consumed since the last successful recovery.
    pub fn attempts_used(&self, id: &str) -> u32 {
        self.attempts.borrow().get(id).copied().unwrap_or(0)
    }

    /// The failure that ended recovery for `id`, if it ended.
    pub fn last_failure(&self, id: &str) -> Option<RecoveryFailure> {
        self.last_failure.borrow().get(id).cloned()
    }

    fn exhausted(&self, id: &str) -> Option<RecoveryFailure> {
        let used = self.attempts_used(id);
        if used < self.max_attempts && !self.given_up.borrow().contains(id) {
            return None;
        }
        Some(self.last_failure(id).unwrap_or_else(|| RecoveryFailure {
            attempts: used,
            diagnosis: None,
            strategy: None,
            error: format!("recovery budget of {} attempt(s) used up", self.max_attempts),
        }))
    }

    pub async fn collect_symptoms(
        &self,
        descriptor: &ServiceDescriptor,
        pid: Option<u32>,
        last_error: Option<&str>,
    ) -> Symptoms {
        let mut markers: Vec<String> = DEFAULT_ERROR_MARKERS.iter().map(|m| m.to_string()).collect();
        markers.extend(descriptor.error_markers.iter().cloned());
        let log_markers = find_markers(
            &resolve_log_path(&self.logs_dir, &descriptor.id),
            &markers,
            SYMPTOM_LOG_LINES,
        );

        let memory = MemorySnapshot::capture();
        let available_memory_ratio = memory.available_ratio();

        let category = match classify(&log_markers.join("\n")) {
            FailureCategory::Unknown => last_error.map(classify).unwrap_or(FailureCategory::Unknown),
            category => category,
        };

        Symptoms {
            process_alive: pid.is_some_and(is_alive),
            port_bound: port_bound(descriptor.port).await,
            log_markers,
            memory_pressure: available_memory_ratio < MEMORY_PRESSURE_RATIO,
            available_memory_ratio,
            last_error: last_error.map(str::to_string),
            category,
        }
    }

    async fn generic_recovery(&self, id: &str, actions: &dyn RecoveryActions) -> Result<(), String> {
        actions
            .stop_service(id, true)
            .await
            .map_err(|err| err.to_string())?;
        tokio::time::sleep(self.timings.generic_delay).await;
        actions
            .restart_service(id)
            .await
            .map_err(|err| err.to_string())
    }

    /// Runs one attempt for `descriptor`.
    pub async fn recover(
        &self,
        descriptor: &ServiceDescriptor,
        last_error: Option<&str>,
        actions: &dyn RecoveryActions,
    ) -> RecoveryOutcome {
        let id = descriptor.id.as_str();
        if let Some(failure) = self.exhausted(id) {
            return RecoveryOutcome::Exhausted(failure);
        }

        let attempt = self.attempts_used(id) + 1;
        self.attempts.borrow_mut().insert(id.to_string(), attempt);
        info!(
            "Recovery attempt {attempt}/{} for '{id}'",
            self.max_attempts
        );

        let symptoms = self
            .collect_symptoms(descriptor, actions.current_pid(id), last_error)
            .await;
        let diagnosis = self.diagnostician.diagnose(id, &symptoms).await;
        let strategy = diagnosis
            .as_ref()
            .and_then(|diagnosis| self.diagnostician.select_strategy(id, diagnosis));

        let executed = match (&diagnosis, &strategy) {
            (Some(diagnosis), Some(strategy)) => {
                info!(
                    "Diagnosed '{id}' as {} ({}); applying strategy '{}'",
                    diagnosis.cause, diagnosis.category, strategy.name
                );
                self.diagnostician.execute(strategy, descriptor, actions).await
            }
            _ => {
                warn!("No recovery strategy for '{id}'; running generic restart");
                self.generic_recovery(id, actions).await
            }
        };

        let verified = match &executed {
            Ok(()) => {
                tokio::time::sleep(self.timings.stabilization).await;
                actions.verify_health(id, self.timings.verify_timeout).await
            }
            Err(_) => false,
        };
        let error = match executed {
            Err(err) => Some(err),
            Ok(()) if !verified => Some("health verification timed out after recovery".to_string()),
            Ok(()) => None,
        };

        actions.record_recovery(
            id,
            RecoveryRecord {
                at: Utc::now(),
                attempt,
                symptoms,
                diagnosis: diagnosis.clone(),
                strategy: strategy.clone(),
                success: error.is_none(),
                error: error.clone(),
            },
        );

        let Some(error) = error else {
            info!("✔ Service '{id}' recovered on attempt {attempt}");
            self.attempts.borrow_mut().remove(id);
            self.last_failure.borrow_mut().remove(id);
            return RecoveryOutcome::Recovered { attempt, strategy };
        };

        let generic = strategy.is_none();
        let failure = RecoveryFailure {
            attempts: attempt,
            diagnosis,
            strategy,
            error: error.clone(),
        };
        self.last_failure
            .borrow_mut()
            .insert(id.to_string(), failure.clone());

        if generic {
            self.given_up.borrow_mut().insert(id.to_string());
        }
        if generic || attempt >= self.max_attempts {
            error!("Recovery for '{id}' exhausted after {attempt} attempt(s): {error}");
            RecoveryOutcome::Exhausted(failure)
        } else {
            warn!("Recovery attempt {attempt} for '{id}' failed: {error}");
            RecoveryOutcome::Failed { attempt, error }
        }
    }

    /// Repeats [`recover`](Self::recover) until the service recovers or the budget ends.
    ///
    /// Returns the attempt that succeeded.
    pub async fn run(
        &self,
        descriptor: &ServiceDescriptor,
        last_error: Option<&str>,
        actions: &dyn RecoveryActions,
    ) -> Result<u32, RecoveryFailure> {
        let mut last_error = last_error.map(str::to_string);
        loop {
            match self.recover(descriptor, last_error.as_deref(), actions).await {
                RecoveryOutcome::Recovered { attempt, .. } => return Ok(attempt),
                RecoveryOutcome::Failed { error, .. } => last_error = Some(error),
                RecoveryOutcome::Exhausted(failure) => return Err(failure),
            }
        }
    }
}
