//! The service manager: sequences conflict clearing, spawn, monitoring, health checks and
//! recovery for every configured service, and owns all runtime registries.
use std::{
    cell::{Cell, RefCell},
    collections::{BTreeMap, BTreeSet, HashMap},
    future::Future,
    path::PathBuf,
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use futures::{
    FutureExt, StreamExt,
    future::{LocalBoxFuture, join_all},
    stream::FuturesUnordered,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{
    build_step::run_build,
    config::{BuildStep, Config, ServiceDescriptor},
    conflict::ConflictResolver,
    constants::{DEFAULT_HEALTH_TIMEOUT, PID_FILE_NAME},
    error::{HistoryError, SupervisorError},
    forecast::ForecastingEngine,
    health::HealthChecker,
    history::RecoveryRecord,
    monitor::{MonitorEvent, ProcessMonitor},
    pidfile::PidFile,
    process::is_alive,
    recovery::{
        Diagnostician, RecoveryActions, RecoveryFailure, RecoveryOrchestrator, RecoveryTimings,
    },
    spawner::{LifecycleEvent, ProcessHandle, ProcessSpawner},
    status::{ServiceReport, ServiceStatus, StatusReport},
};

#[derive(Debug, Clone, Default)]
struct ServiceState {
    status: ServiceStatus,
    pid: Option<u32>,
    error: Option<String>,
    failure: Option<RecoveryFailure>,
}

/// Result of the spawn half of a service pipeline.
#[derive(Debug)]
enum Spawned {
    Running,
    /// Started but already gone, or otherwise unhealthy in a recoverable way.
    Unhealthy(String),
    /// Not recoverable; recorded already.
    Fatal,
}

struct EventStreams {
    lifecycle: mpsc::UnboundedReceiver<LifecycleEvent>,
    monitor: mpsc::UnboundedReceiver<MonitorEvent>,
}

/// Explicit service manager value with injected collaborators.
///
/// All registries live behind `RefCell`s and are only touched between suspension points, so
/// the supervisor must be driven from a single-threaded runtime.
pub struct Supervisor {
    descriptors: BTreeMap<String, ServiceDescriptor>,
    logs_dir: PathBuf,
    build: Option<BuildStep>,
    spawner: ProcessSpawner,
    conflicts: ConflictResolver,
    monitor: ProcessMonitor,
    health: HealthChecker,
    forecast: RefCell<ForecastingEngine>,
    recovery: RecoveryOrchestrator,
    restart_delay: Duration,
    max_restarts: u32,
    processes: RefCell<HashMap<String, ProcessHandle>>,
    states: RefCell<BTreeMap<String, ServiceState>>,
    restarts: RefCell<HashMap<String, u32>>,
    selected: RefCell<BTreeSet<String>>,
    skip_health: Cell<bool>,
    pid_file: RefCell<PidFile>,
    events: RefCell<Option<EventStreams>>,
}

impl Supervisor {
    /// Builds a supervisor for a loaded configuration.
    pub fn new(
        config: &Config,
        diagnostician: Box<dyn Diagnostician>,
    ) -> Result<Self, SupervisorError> {
        let descriptors = config.descriptors()?;
        let logs_dir = config.logs_path();
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        let (monitor_tx, monitor_rx) = mpsc::unbounded_channel();

        let supervisor = Self {
            build: config.build_step()?,
            spawner: ProcessSpawner::new(logs_dir.clone(), lifecycle_tx),
            conflicts: ConflictResolver::default(),
            monitor: ProcessMonitor::new(config.monitor_interval()?, monitor_tx),
            health: HealthChecker::new()?,
            forecast: RefCell::new(ForecastingEngine::for_config(config)?),
            recovery: RecoveryOrchestrator::new(
                diagnostician,
                config.recovery.max_attempts,
                logs_dir.clone(),
            ),
            restart_delay: config.monitor_restart_delay()?,
            max_restarts: config.recovery.max_attempts,
            processes: RefCell::new(HashMap::new()),
            states: RefCell::new(
                descriptors
                    .keys()
                    .map(|id| (id.clone(), ServiceState::default()))
                    .collect(),
            ),
            restarts: RefCell::new(HashMap::new()),
            selected: RefCell::new(BTreeSet::new()),
            skip_health: Cell::new(false),
            pid_file: RefCell::new(PidFile::load(logs_dir.join(PID_FILE_NAME))?),
            events: RefCell::new(Some(EventStreams {
                lifecycle: lifecycle_rx,
                monitor: monitor_rx,
            })),
            descriptors,
            logs_dir,
        };
        Ok(supervisor)
    }

    /// Replaces the conflict resolver, e.g. with one backed by a different host probe.
    pub fn with_conflict_resolver(mut self, conflicts: ConflictResolver) -> Self {
        self.conflicts = conflicts;
        self
    }

    pub fn with_recovery_timings(mut self, timings: RecoveryTimings) -> Self {
        self.recovery = self.recovery.with_timings(timings);
        self
    }

    pub fn descriptor(&self, id: &str) -> Result<&ServiceDescriptor, SupervisorError> {
        self.descriptors
            .get(id)
            .ok_or_else(|| SupervisorError::UnknownService(id.to_string()))
    }

    pub fn status(&self, id: &str) -> ServiceStatus {
        self.states
            .borrow()
            .get(id)
            .map(|state| state.status)
            .unwrap_or_default()
    }

    /// Pid of the live process registered for `id`.
    pub fn pid(&self, id: &str) -> Option<u32> {
        self.processes.borrow().get(id).map(|handle| handle.pid)
    }

    pub fn recovery(&self) -> &RecoveryOrchestrator {
        &self.recovery
    }

    /// Records the resident supervisor pid so `stop` can find it.
    pub fn register_supervisor_pid(&self, pid: Option<u32>) {
        if let Err(err) = self.pid_file.borrow_mut().set_supervisor(pid) {
            warn!("Failed to update PID file: {err}");
        }
    }

    fn update_state<F>(&self, id: &str, update: F)
    where
        F: FnOnce(&mut ServiceState),
    {
        update(self.states.borrow_mut().entry(id.to_string()).or_default());
    }

    fn set_status(&self, id: &str, status: ServiceStatus) {
        self.update_state(id, |state| state.status = status);
    }

    fn mark_failed(&self, id: &str, error: &str) {
        self.update_state(id, |state| {
            state.status = ServiceStatus::Failed;
            state.pid = None;
            state.error = Some(error.to_string());
        });
    }

    fn with_history<T, F>(&self, update: F) -> Option<T>
    where
        F: FnOnce(&mut ForecastingEngine) -> Result<T, HistoryError>,
    {
        match update(&mut self.forecast.borrow_mut()) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!("Failed to update startup history: {err}");
                None
            }
        }
    }

    fn forget_pid(&self, id: &str) {
        let mut pid_file = self.pid_file.borrow_mut();
        if pid_file.get(id).is_some()
            && let Err(err) = pid_file.remove(id)
        {
            warn!("Failed to update PID file for '{id}': {err}");
        }
    }

    /// Inserts a freshly spawned handle, refusing to shadow a live one.
    fn register(&self, id: &str, handle: ProcessHandle) -> Result<u32, (SupervisorError, ProcessHandle)> {
        let mut processes = self.processes.borrow_mut();
        if processes.contains_key(id) {
            return Err((SupervisorError::AlreadyRunning(id.to_string()), handle));
        }
        let pid = handle.pid;
        processes.insert(id.to_string(), handle);
        drop(processes);

        if let Err(err) = self.pid_file.borrow_mut().insert(id, pid) {
            warn!("Failed to update PID file for '{id}': {err}");
        }
        Ok(pid)
    }

    /// Stops and unregisters the process for `id`, if any.
    pub async fn stop_service(&self, id: &str, force: bool) -> Result<(), SupervisorError> {
        self.monitor.detach(id);
        let handle = self.processes.borrow_mut().remove(id);
        self.forget_pid(id);

        if let Some(handle) = handle {
            info!("Stopping service '{id}' (pid {})", handle.pid);
            if let Err(err) = self.spawner.stop(&handle, force).await {
                if force {
                    return Err(err);
                }
                warn!("{err}; forcing");
                self.spawner.stop(&handle, true).await?;
            }
        }
        self.update_state(id, |state| {
            state.status = ServiceStatus::Stopped;
            state.pid = None;
        });
        Ok(())
    }

    /// Conflict clearing, spawn and monitor attachment for one service.
    ///
    /// Any process already registered for the id is stopped first, so at most one live process
    /// per id exists at any time.
    async fn spawn_pipeline(&self, id: &str) -> Result<(), SupervisorError> {
        let descriptor = self.descriptor(id)?;

        if self.processes.borrow().contains_key(id) {
            self.stop_service(id, false).await?;
        }

        self.set_status(id, ServiceStatus::Starting);
        self.with_history(|forecast| forecast.record_start(id, Utc::now()));

        // Processes launched by this supervisor are never conflicts, even when they match.
        let supervised = self.spawner.live_children();
        if !self.conflicts.clear(descriptor, &supervised).await {
            let conflict = SupervisorError::PortConflict {
                service: id.to_string(),
                port: descriptor.port,
            };
            warn!("{conflict}; starting anyway");
        }

        let handle = match self.spawner.start(descriptor).await {
            Ok(handle) => handle,
            Err(err) => {
                self.mark_failed(id, &err.to_string());
                return Err(err);
            }
        };

        if let Some(exit) = handle.exit_status() {
            let err = SupervisorError::ProcessExited {
                service: id.to_string(),
                detail: format!("exited right after start with {exit}"),
            };
            self.mark_failed(id, &err.to_string());
            return Err(err);
        }

        let pid = match self.register(id, handle) {
            Ok(pid) => pid,
            Err((err, duplicate)) => {
                warn!("{err}; stopping the duplicate (pid {})", duplicate.pid);
                self.spawner.stop(&duplicate, true).await?;
                return Err(err);
            }
        };

        self.update_state(id, |state| {
            state.status = ServiceStatus::Running;
            state.pid = Some(pid);
            state.error = None;
            state.failure = None;
        });
        self.monitor.attach(id, pid, descriptor.port);
        Ok(())
    }

    async fn spawn_phase(&self, id: &str) -> Spawned {
        match self.spawn_pipeline(id).await {
            Ok(()) => Spawned::Running,
            Err(err) if err.is_recoverable() => Spawned::Unhealthy(err.to_string()),
            Err(err) => {
                error!("{err}");
                self.mark_failed(id, &err.to_string());
                self.with_history(|forecast| forecast.record_failure(id, &err.to_string()));
                Spawned::Fatal
            }
        }
    }

    async fn health_phase(&self, id: &str, spawned: Spawned) {
        let Ok(descriptor) = self.descriptor(id) else {
            return;
        };

        let last_error = match spawned {
            Spawned::Fatal => return,
            Spawned::Running if self.skip_health.get() => return,
            Spawned::Unhealthy(error) if self.skip_health.get() => {
                self.with_history(|forecast| forecast.record_failure(id, &error));
                return;
            }
            Spawned::Unhealthy(error) => error,
            Spawned::Running => {
                let base = descriptor
                    .health
                    .as_ref()
                    .map(|policy| policy.timeout)
                    .unwrap_or(DEFAULT_HEALTH_TIMEOUT);
                let timeout = self.forecast.borrow().adaptive_timeout(id, base);
                match self.health.wait(descriptor, timeout, self.pid(id)).await {
                    Ok(report) => {
                        debug!(
                            "'{id}' passed its health check after {} probe(s) in {:?}",
                            report.attempts, report.elapsed
                        );
                        self.mark_started(id, descriptor);
                        return;
                    }
                    Err(err) => err.to_string(),
                }
            }
        };

        warn!("{last_error}");
        self.with_history(|forecast| forecast.record_failure(id, &last_error));
        self.update_state(id, |state| {
            state.status = ServiceStatus::Failed;
            state.error = Some(last_error.clone());
        });

        match self.recovery.run(descriptor, Some(&last_error), self).await {
            Ok(_) => self.mark_started(id, descriptor),
            Err(failure) => {
                let fatal = SupervisorError::RecoveryExhausted {
                    service: id.to_string(),
                    attempts: failure.attempts,
                };
                error!("{fatal}: {}", failure.error);
                if let Some(diagnosis) = &failure.diagnosis {
                    error!(
                        "Last diagnosis for '{id}': {} ({})",
                        diagnosis.cause, diagnosis.category
                    );
                }
                self.monitor.detach(id);
                self.update_state(id, |state| {
                    state.status = ServiceStatus::Failed;
                    state.error = Some(failure.error.clone());
                    state.failure = Some(failure);
                });
            }
        }
    }

    fn mark_started(&self, id: &str, descriptor: &ServiceDescriptor) {
        let status = if descriptor.health.is_some() {
            ServiceStatus::Healthy
        } else {
            ServiceStatus::Running
        };
        self.update_state(id, |state| {
            state.status = status;
            state.error = None;
            state.failure = None;
        });
        if let Some(Some(elapsed)) = self.with_history(|forecast| forecast.record_success(id, Utc::now())) {
            debug!("'{id}' became ready in {elapsed:?}");
        }
    }

    fn select(&self, ids: &[String]) -> Result<Vec<String>, SupervisorError> {
        if ids.is_empty() {
            return Ok(self.descriptors.keys().cloned().collect());
        }
        let mut selected = Vec::new();
        for id in ids {
            self.descriptor(id)?;
            if !selected.contains(id) {
                selected.push(id.clone());
            }
        }
        Ok(selected)
    }

    /// Starts the selected services (all when `ids` is empty) and returns whether every one of
    /// them ended running or healthy.
    ///
    /// Spawn pipelines run concurrently, then health phases run concurrently. One service's
    /// failure never aborts another's pipeline.
    pub async fn start_all(
        &self,
        ids: &[String],
        skip_health: bool,
        include_build: bool,
    ) -> Result<bool, SupervisorError> {
        let ids = self.select(ids)?;
        self.skip_health.set(skip_health);

        if include_build {
            match &self.build {
                Some(step) => {
                    run_build(step, &self.logs_dir).await?;
                }
                None => warn!("--build requested but no build step is configured"),
            }
        }

        self.selected.borrow_mut().extend(ids.iter().cloned());
        info!("Starting {} service(s)...", ids.len());

        let spawned = join_all(ids.iter().map(|id| self.spawn_phase(id))).await;
        join_all(
            ids.iter()
                .zip(spawned)
                .map(|(id, spawned)| self.health_phase(id, spawned)),
        )
        .await;

        let report = self.report();
        if report.all_up() {
            info!("✔ {}", report.summary_line());
        } else {
            warn!("{}", report.summary_line());
        }
        Ok(report.all_up())
    }

    /// Stops every tracked process and clears monitoring.
    pub async fn stop_all(&self, force: bool) -> Result<(), SupervisorError> {
        self.monitor.detach_all();
        let handles: Vec<(String, ProcessHandle)> = self.processes.borrow_mut().drain().collect();
        for (id, _) in &handles {
            self.forget_pid(id);
        }

        let results = join_all(
            handles
                .iter()
                .map(|(_, handle)| self.spawner.stop(handle, force)),
        )
        .await;

        for (id, _) in &handles {
            self.set_status(id, ServiceStatus::Stopped);
            self.update_state(id, |state| state.pid = None);
        }
        self.with_history(|forecast| forecast.end_session(Utc::now()));

        let mut first_error = None;
        for err in results.into_iter().filter_map(Result::err) {
            error!("{err}");
            first_error.get_or_insert(err);
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Status of the services selected so far, in id order.
    pub fn report(&self) -> StatusReport {
        let selected = self.selected.borrow();
        let states = self.states.borrow();
        let forecast = self.forecast.borrow();

        let services = selected
            .iter()
            .filter_map(|id| self.descriptors.get(id))
            .map(|descriptor| {
                let state = states.get(&descriptor.id).cloned().unwrap_or_default();
                ServiceReport {
                    id: descriptor.id.clone(),
                    name: descriptor.name.clone(),
                    tier: descriptor.tier,
                    status: state.status,
                    pid: state.pid,
                    prediction: forecast.predict_startup_time(&descriptor.id),
                    risk: Some(forecast.analyze_failure_risk(&descriptor.id).level),
                    error: state.error,
                    failure: state.failure,
                }
            })
            .collect();
        StatusReport { services }
    }

    fn on_lifecycle_event(&self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Exited { service, pid, exit } => {
                let tracked = self.pid(&service) == Some(pid);
                if !tracked {
                    debug!("Ignoring exit of untracked pid {pid} ('{service}')");
                    return;
                }
                self.processes.borrow_mut().remove(&service);
                self.forget_pid(&service);
                let error = format!("process exited unexpectedly with {exit}");
                warn!("Service '{service}' (pid {pid}) {error}");
                self.mark_failed(&service, &error);
                self.with_history(|forecast| forecast.record_failure(&service, &error));
            }
            LifecycleEvent::Started { service, pid } => {
                debug!("Service '{service}' acknowledged with pid {pid}");
            }
            LifecycleEvent::FailedToStart { service, error } => {
                debug!("Service '{service}' failed to start: {error}");
            }
        }
    }

    fn on_monitor_event(&self, event: MonitorEvent) -> Option<LocalBoxFuture<'_, ()>> {
        let MonitorEvent::Died {
            service,
            pid,
            generation,
            reason,
        } = event;

        if !self.monitor.is_current(&service, generation) {
            debug!("Ignoring stale monitor event for '{service}' (pid {pid})");
            return None;
        }
        self.monitor.retire(&service, generation);
        self.update_state(&service, |state| {
            state.status = ServiceStatus::Failed;
            state.error = Some(format!("monitor: {reason}"));
        });

        let used = self.restarts.borrow().get(&service).copied().unwrap_or(0);
        if used >= self.max_restarts {
            error!(
                "Service '{service}' died ({reason}) and its restart budget of {} is used up",
                self.max_restarts
            );
            return None;
        }
        self.restarts.borrow_mut().insert(service.clone(), used + 1);
        info!(
            "Restarting '{service}' in {:?} (restart {}/{})",
            self.restart_delay,
            used + 1,
            self.max_restarts
        );

        let delay = self.restart_delay;
        Some(
            async move {
                tokio::time::sleep(delay).await;
                let spawned = self.spawn_phase(&service).await;
                self.health_phase(&service, spawned).await;
            }
            .boxed_local(),
        )
    }

    /// Reacts to process exits and monitor deaths until `shutdown` resolves.
    pub async fn supervise<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let Some(mut streams) = self.events.borrow_mut().take() else {
            warn!("Supervision loop is already running");
            return;
        };

        let mut restarts: FuturesUnordered<LocalBoxFuture<'_, ()>> = FuturesUnordered::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                Some(event) = streams.lifecycle.recv() => self.on_lifecycle_event(event),
                Some(event) = streams.monitor.recv() => {
                    if let Some(restart) = self.on_monitor_event(event) {
                        restarts.push(restart);
                    }
                }
                Some(()) = restarts.next(), if !restarts.is_empty() => {}
                else => break,
            }
        }

        drop(restarts);
        *self.events.borrow_mut() = Some(streams);
    }
}

#[async_trait(?Send)]
impl RecoveryActions for Supervisor {
    async fn stop_service(&self, id: &str, force: bool) -> Result<(), SupervisorError> {
        Supervisor::stop_service(self, id, force).await
    }

    async fn restart_service(&self, id: &str) -> Result<(), SupervisorError> {
        self.spawn_pipeline(id).await
    }

    async fn clear_conflicts(&self, id: &str) -> bool {
        match self.descriptor(id) {
            Ok(descriptor) => {
                let supervised = self.spawner.live_children();
                self.conflicts.clear(descriptor, &supervised).await
            }
            Err(_) => false,
        }
    }

    async fn verify_health(&self, id: &str, timeout: Duration) -> bool {
        let Ok(descriptor) = self.descriptor(id) else {
            return false;
        };
        match &descriptor.health {
            Some(policy) => self.health.check_once(policy, timeout).await,
            None => self.pid(id).is_some_and(is_alive),
        }
    }

    fn current_pid(&self, id: &str) -> Option<u32> {
        self.pid(id)
    }

    fn record_recovery(&self, id: &str, record: RecoveryRecord) {
        self.with_history(|forecast| forecast.record_recovery(id, record));
    }
}
