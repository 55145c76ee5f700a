use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use std::{
    error::Error,
    io::IsTerminal,
    path::Path,
    process::ExitCode,
};
use tokio::signal::unix::{SignalKind, signal as unix_signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use warden::{
    cli::{Cli, Commands, parse_args, service_ids},
    config::{Config, load_config},
    constants::{PID_FILE_NAME, STOP_GRACE_PERIOD},
    diagnostics::RuleDiagnostician,
    pidfile::PidFile,
    process::{is_alive, terminate_pid, wait_for_exit},
    supervisor::Supervisor,
};

fn main() -> ExitCode {
    let args = parse_args();
    init_logging(&args);

    match run(args) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Cli) -> Result<ExitCode, Box<dyn Error>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    match args.command {
        Commands::Start {
            services,
            build,
            fast,
        } => runtime.block_on(start(
            &args.config,
            service_ids(services.as_deref()),
            build,
            fast,
        )),
        Commands::Stop { force } => {
            let config = load_config(Some(&args.config))?;
            runtime.block_on(stop(&config, force))?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Restart {
            services,
            build,
            fast,
        } => {
            let config = load_config(Some(&args.config))?;
            runtime.block_on(stop(&config, false))?;
            runtime.block_on(start(
                &args.config,
                service_ids(services.as_deref()),
                build,
                fast,
            ))
        }
    }
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn pid_file_path(config: &Config) -> std::path::PathBuf {
    config.logs_path().join(PID_FILE_NAME)
}

/// Live supervisor recorded in the pid file, other than this process.
fn resident_supervisor(path: &Path) -> Option<u32> {
    let pid_file = PidFile::load(path).ok()?;
    pid_file
        .supervisor()
        .filter(|pid| *pid != std::process::id() && is_alive(*pid))
}

async fn start(
    config_path: &str,
    ids: Vec<String>,
    build: bool,
    fast: bool,
) -> Result<ExitCode, Box<dyn Error>> {
    let config = load_config(Some(config_path))?;
    let pid_path = pid_file_path(&config);

    if let Some(pid) = resident_supervisor(&pid_path) {
        error!("A warden supervisor is already running (pid {pid}); use `warden restart`");
        return Ok(ExitCode::FAILURE);
    }
    // Whatever is left belongs to a supervisor that no longer exists.
    PidFile::load(&pid_path)?.clear()?;

    // Listen before anything is spawned so an early `stop` still gets a clean teardown.
    let shutdown = shutdown_signal()?;
    let supervisor = Supervisor::new(&config, Box::new(RuleDiagnostician::default()))?;
    supervisor.register_supervisor_pid(Some(std::process::id()));

    let started = match supervisor.start_all(&ids, fast, build).await {
        Ok(started) => started,
        Err(err) => {
            error!("{err}");
            teardown(&supervisor).await;
            return Err(err.into());
        }
    };

    println!("{}", supervisor.report().render(std::io::stdout().is_terminal()));

    if !started {
        error!("Startup failed; stopping every service");
        teardown(&supervisor).await;
        return Ok(ExitCode::FAILURE);
    }

    info!("Supervising services; press Ctrl-C to stop");
    supervisor.supervise(shutdown).await;
    teardown(&supervisor).await;
    Ok(ExitCode::SUCCESS)
}

async fn teardown(supervisor: &Supervisor) {
    if let Err(err) = supervisor.stop_all(false).await {
        warn!("Some services did not stop cleanly: {err}");
    }
    supervisor.register_supervisor_pid(None);
}

/// Resolves on the first SIGINT or SIGTERM received after this call.
fn shutdown_signal() -> std::io::Result<impl Future<Output = ()>> {
    let mut interrupt = unix_signal(SignalKind::interrupt())?;
    let mut terminate = unix_signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
    })
}

/// Signals a resident supervisor, then terminates any children it left behind.
async fn stop(config: &Config, force: bool) -> Result<(), Box<dyn Error>> {
    let pid_path = pid_file_path(config);

    match resident_supervisor(&pid_path) {
        Some(pid) => {
            let sig = if force { Signal::SIGKILL } else { Signal::SIGTERM };
            info!("Sending {sig} to warden supervisor (pid {pid})");
            if let Err(err) = signal::kill(Pid::from_raw(pid as i32), sig) {
                warn!("Failed to signal supervisor {pid}: {err}");
            }
            if !wait_for_exit(pid, STOP_GRACE_PERIOD * 2).await {
                warn!("Supervisor {pid} is still running; killing it");
                let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
                wait_for_exit(pid, STOP_GRACE_PERIOD).await;
            }
        }
        None => println!("No running warden supervisor found"),
    }

    let mut pid_file = PidFile::load(&pid_path)?;
    for (service, pid) in pid_file.services().clone() {
        if !is_alive(pid) {
            continue;
        }
        info!("Stopping leftover service '{service}' (pid {pid})");
        match terminate_pid(pid, Signal::SIGTERM, STOP_GRACE_PERIOD, force).await {
            Ok(true) => {}
            Ok(false) => warn!("Service '{service}' (pid {pid}) survived SIGKILL"),
            Err(err) => warn!("Failed to stop '{service}' (pid {pid}): {err}"),
        }
    }
    pid_file.clear()?;
    Ok(())
}
