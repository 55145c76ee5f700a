//! Child process creation, output capture, reaping and termination.
use std::{
    collections::BTreeSet,
    env, fmt, io,
    os::unix::process::ExitStatusExt,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use tokio::{
    process::Command,
    sync::{mpsc, watch},
};
use tracing::{debug, error, info, warn};

use crate::{
    config::ServiceDescriptor,
    constants::{
        CHILD_RUNTIME_ENV_VAR, DEFAULT_RUNTIME_ENV, DEFAULT_SHELL, KILL_REAP_TIMEOUT,
        RUNTIME_ENV_VAR, SHELL_COMMAND_FLAG, SHELL_SPAWN_FAILURE_CODES, SPAWN_POLL_INTERVAL,
        SPAWN_READY_CHECKS, STOP_GRACE_PERIOD,
    },
    error::SupervisorError,
    logs::{Stream, mark_session_start, resolve_log_path, spawn_log_writer},
    process::{is_alive, signal_tree},
};

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => match Signal::try_from(signal) {
                Ok(sig) => write!(f, "signal {sig}"),
                Err(_) => write!(f, "signal {signal}"),
            },
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Observable spawner transitions, delivered to the owner of the event receiver.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Started { service: String, pid: u32 },
    Exited { service: String, pid: u32, exit: ExitInfo },
    FailedToStart { service: String, error: String },
}

/// Handle for one live child. Not `Clone`: the supervisor registry is its only owner.
#[derive(Debug)]
pub struct ProcessHandle {
    pub service: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    exit: watch::Receiver<Option<ExitInfo>>,
}

impl ProcessHandle {
    /// Exit information once the reaper has collected the child.
    pub fn exit_status(&self) -> Option<ExitInfo> {
        *self.exit.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_status().is_some()
    }

    /// Waits up to `timeout` for the child to be reaped.
    pub async fn wait_exit(&self, timeout: Duration) -> Option<ExitInfo> {
        let mut exit = self.exit.clone();
        let waited = tokio::time::timeout(timeout, exit.wait_for(Option::is_some)).await;
        match waited {
            Ok(Ok(info)) => *info,
            // The reaper dropped its sender without a value; fall back to the process table.
            Ok(Err(_)) => (!is_alive(self.pid)).then_some(ExitInfo {
                code: None,
                signal: None,
            }),
            Err(_) => None,
        }
    }
}

/// Value of the runtime environment flag handed to children.
pub fn runtime_environment() -> String {
    env::var(RUNTIME_ENV_VAR).unwrap_or_else(|_| DEFAULT_RUNTIME_ENV.to_string())
}

/// Starts and stops service processes.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    logs_dir: PathBuf,
    events: mpsc::UnboundedSender<LifecycleEvent>,
    children: Arc<Mutex<BTreeSet<u32>>>,
}

impl ProcessSpawner {
    pub fn new(logs_dir: PathBuf, events: mpsc::UnboundedSender<LifecycleEvent>) -> Self {
        Self {
            logs_dir,
            events,
            children: Arc::default(),
        }
    }

    /// Pids of children launched by this spawner that have not been reaped yet.
    ///
    /// Each child leads its own process group, so the set also identifies their descendants.
    pub fn live_children(&self) -> Vec<u32> {
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    fn emit(&self, event: LifecycleEvent) {
        let _ = self.events.send(event);
    }

    fn spawn_failed(&self, service: &str, source: io::Error) -> SupervisorError {
        error!("Failed to start service '{service}': {source}");
        self.emit(LifecycleEvent::FailedToStart {
            service: service.to_string(),
            error: source.to_string(),
        });
        SupervisorError::Spawn {
            service: service.to_string(),
            source,
        }
    }

    /// Spawns `sh -c <command>` for the descriptor in its own process group.
    ///
    /// The child is watched for a short readiness window: shell "not executable" and
    /// "command not found" exits become [`SupervisorError::Spawn`]; any other early exit is
    /// returned as a handle whose [`ProcessHandle::exit_status`] is already set.
    pub async fn start(
        &self,
        descriptor: &ServiceDescriptor,
    ) -> Result<ProcessHandle, SupervisorError> {
        let service = descriptor.id.as_str();
        debug!(
            "Launching service: '{service}' with command: `{}`",
            descriptor.command
        );

        if !descriptor.cwd.is_dir() {
            return Err(self.spawn_failed(
                service,
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("working directory {} does not exist", descriptor.cwd.display()),
                ),
            ));
        }

        if let Err(err) = std::fs::create_dir_all(&self.logs_dir) {
            warn!(
                "Unable to create logs directory {}: {err}",
                self.logs_dir.display()
            );
        }

        let log_path = resolve_log_path(&self.logs_dir, service);
        if let Err(err) = mark_session_start(&log_path, service, &descriptor.command).await {
            warn!("Unable to write launch separator to {}: {err}", log_path.display());
        }

        let mut cmd = Command::new(DEFAULT_SHELL);
        cmd.arg(SHELL_COMMAND_FLAG)
            .arg(&descriptor.command)
            .current_dir(&descriptor.cwd)
            .envs(&descriptor.env)
            .env("PORT", descriptor.port.to_string())
            .env("HOST", descriptor.bind_host())
            .env(CHILD_RUNTIME_ENV_VAR, runtime_environment())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        unsafe {
            cmd.pre_exec(|| {
                // Own process group so the whole tree can be signalled without touching ours.
                if libc::setpgid(0, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }

                #[cfg(target_os = "linux")]
                {
                    use libc::{PR_SET_PDEATHSIG, SIGTERM, prctl};
                    if prctl(PR_SET_PDEATHSIG, SIGTERM, 0, 0, 0) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                }

                Ok(())
            });
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => return Err(self.spawn_failed(service, err)),
        };
        let Some(pid) = child.id() else {
            return Err(self.spawn_failed(
                service,
                io::Error::other("process exited before its pid could be read"),
            ));
        };
        let started_at = Utc::now();
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pid);

        if let Some(stdout) = child.stdout.take() {
            spawn_log_writer(service, stdout, Stream::Stdout, log_path.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_log_writer(service, stderr, Stream::Stderr, log_path);
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let events = self.events.clone();
        let children = Arc::clone(&self.children);
        let reaped_service = service.to_string();
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => ExitInfo::from(status),
                Err(err) => {
                    warn!("Failed to reap '{reaped_service}' (pid {pid}): {err}");
                    ExitInfo {
                        code: None,
                        signal: None,
                    }
                }
            };
            children
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&pid);
            debug!("Service '{reaped_service}' (pid {pid}) exited with {exit}");
            let _ = exit_tx.send(Some(exit));
            let _ = events.send(LifecycleEvent::Exited {
                service: reaped_service,
                pid,
                exit,
            });
        });

        let handle = ProcessHandle {
            service: service.to_string(),
            pid,
            started_at,
            exit: exit_rx,
        };

        for _ in 0..SPAWN_READY_CHECKS {
            tokio::time::sleep(SPAWN_POLL_INTERVAL).await;
            let Some(exit) = handle.exit_status() else {
                continue;
            };
            if exit
                .code
                .is_some_and(|code| SHELL_SPAWN_FAILURE_CODES.contains(&code))
            {
                return Err(self.spawn_failed(
                    service,
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("command `{}` could not be executed ({exit})", descriptor.command),
                    ),
                ));
            }
            warn!("Service '{service}' (pid {pid}) exited right after start with {exit}");
            return Ok(handle);
        }

        info!("Service '{service}' started with PID: {pid}");
        self.emit(LifecycleEvent::Started {
            service: service.to_string(),
            pid,
        });
        Ok(handle)
    }

    /// Stops a child: SIGTERM to its group, up to 5 s grace, then SIGKILL.
    ///
    /// `force` sends SIGKILL straight away.
    pub async fn stop(&self, handle: &ProcessHandle, force: bool) -> Result<(), SupervisorError> {
        let service = handle.service.as_str();
        let pid = handle.pid;
        let stop_error = |source: io::Error| SupervisorError::Stop {
            service: service.to_string(),
            source,
        };

        if handle.has_exited() {
            debug!("Service '{service}' (pid {pid}) already exited");
            return Ok(());
        }

        if !force {
            debug!("Sending SIGTERM to '{service}' (pid {pid})");
            let delivered = signal_tree(pid, Signal::SIGTERM).map_err(|e| stop_error(e.into()))?;
            if !delivered || handle.wait_exit(STOP_GRACE_PERIOD).await.is_some() {
                info!("Service '{service}' stopped");
                return Ok(());
            }
            warn!(
                "Service '{service}' (pid {pid}) ignored SIGTERM for {STOP_GRACE_PERIOD:?}; sending SIGKILL"
            );
        }

        signal_tree(pid, Signal::SIGKILL).map_err(|e| stop_error(e.into()))?;
        if handle.wait_exit(KILL_REAP_TIMEOUT).await.is_none() && is_alive(pid) {
            return Err(stop_error(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("pid {pid} survived SIGKILL"),
            )));
        }
        info!("Service '{service}' killed");
        Ok(())
    }
}
