//! Optional build command executed before any service starts.
use std::{path::Path, process::Stdio};

use nix::sys::signal::Signal;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::{
    config::BuildStep,
    constants::{DEFAULT_SHELL, SHELL_COMMAND_FLAG},
    error::SupervisorError,
    logs::{Stream, resolve_log_path, spawn_log_writer},
    process::signal_tree,
};

/// Name under which build output is logged.
pub const BUILD_LOG_NAME: &str = "build";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Succeeded,
    /// An optional build failed; startup continues.
    Degraded(String),
}

async fn execute(step: &BuildStep, logs_dir: &Path) -> Result<(), String> {
    if let Err(err) = std::fs::create_dir_all(logs_dir) {
        warn!("Unable to create logs directory {}: {err}", logs_dir.display());
    }

    let mut child = Command::new(DEFAULT_SHELL)
        .arg(SHELL_COMMAND_FLAG)
        .arg(&step.command)
        .current_dir(&step.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| format!("could not run `{}`: {err}", step.command))?;

    let log_path = resolve_log_path(logs_dir, BUILD_LOG_NAME);
    if let Some(stdout) = child.stdout.take() {
        spawn_log_writer(BUILD_LOG_NAME, stdout, Stream::Stdout, log_path.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_log_writer(BUILD_LOG_NAME, stderr, Stream::Stderr, log_path);
    }

    match tokio::time::timeout(step.timeout, child.wait()).await {
        Ok(Ok(status)) if status.success() => Ok(()),
        Ok(Ok(status)) => Err(format!("`{}` exited with {status}", step.command)),
        Ok(Err(err)) => Err(format!("failed waiting for `{}`: {err}", step.command)),
        Err(_) => {
            if let Some(pid) = child.id() {
                let _ = signal_tree(pid, Signal::SIGKILL);
            }
            let _ = child.wait().await;
            Err(format!(
                "`{}` timed out after {:?}",
                step.command, step.timeout
            ))
        }
    }
}

/// Runs the build step. A failure is fatal unless the step is optional.
pub async fn run_build(step: &BuildStep, logs_dir: &Path) -> Result<BuildOutcome, SupervisorError> {
    info!("Running build step: `{}`", step.command);
    match execute(step, logs_dir).await {
        Ok(()) => {
            info!("✔ Build step finished");
            Ok(BuildOutcome::Succeeded)
        }
        Err(reason) if step.optional => {
            warn!("Optional build step failed, continuing: {reason}");
            Ok(BuildOutcome::Degraded(reason))
        }
        Err(reason) => {
            error!("Build step failed: {reason}");
            Err(SupervisorError::BuildFailure(reason))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    fn step(command: &str, dir: &Path, optional: bool, timeout: Duration) -> BuildStep {
        BuildStep {
            command: command.to_string(),
            cwd: dir.to_path_buf(),
            timeout,
            optional,
        }
    }

    #[tokio::test]
    async fn successful_build_runs_in_cwd() {
        let dir = tempdir().unwrap();
        let outcome = run_build(
            &step("touch built.flag", dir.path(), false, Duration::from_secs(5)),
            &dir.path().join("logs"),
        )
        .await
        .unwrap();
        assert_eq!(outcome, BuildOutcome::Succeeded);
        assert!(dir.path().join("built.flag").exists());
    }

    #[tokio::test]
    async fn required_build_failure_is_fatal() {
        let dir = tempdir().unwrap();
        let err = run_build(
            &step("exit 2", dir.path(), false, Duration::from_secs(5)),
            &dir.path().join("logs"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SupervisorError::BuildFailure(_)));
    }

    #[tokio::test]
    async fn optional_build_failure_degrades() {
        let dir = tempdir().unwrap();
        let outcome = run_build(
            &step("exit 2", dir.path(), true, Duration::from_secs(5)),
            &dir.path().join("logs"),
        )
        .await
        .unwrap();
        assert!(matches!(outcome, BuildOutcome::Degraded(_)));
    }

    #[tokio::test]
    async fn build_timeout_kills_the_command() {
        let dir = tempdir().unwrap();
        let started = Instant::now();
        let err = run_build(
            &step("sleep 30", dir.path(), false, Duration::from_millis(200)),
            &dir.path().join("logs"),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
