//! Constants and configuration values for the warden supervisor.
//!
//! This module centralizes the timing values, file names and defaults used
//! throughout the supervisor so the bounded waits stay visible in one place.

use std::time::Duration;

// ============================================================================
// File System Constants
// ============================================================================

/// Default configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "warden.yaml";

/// Default logs directory, relative to the configuration file.
pub const DEFAULT_LOGS_DIR: &str = "logs";

/// Name of the startup history file stored in the logs directory.
pub const HISTORY_FILE_NAME: &str = "startup-history.json";

/// Name of the PID file stored in the logs directory.
pub const PID_FILE_NAME: &str = "pids.json";

/// Lock file suffix used while rewriting persisted files.
pub const LOCK_SUFFIX: &str = ".lock";

/// Schema version written into the history metadata.
pub const HISTORY_FORMAT_VERSION: u32 = 1;

// ============================================================================
// Shell Execution Constants
// ============================================================================

/// Default shell used for executing service and build commands.
pub const DEFAULT_SHELL: &str = "sh";

/// Shell argument flag for executing command strings.
pub const SHELL_COMMAND_FLAG: &str = "-c";

/// Exit codes the shell uses for "not executable" and "command not found".
pub const SHELL_SPAWN_FAILURE_CODES: [i32; 2] = [126, 127];

// ============================================================================
// Environment
// ============================================================================

/// Runtime environment flag read by the supervisor.
pub const RUNTIME_ENV_VAR: &str = "WARDEN_ENV";

/// Name under which the runtime environment is passed to children.
pub const CHILD_RUNTIME_ENV_VAR: &str = "APP_ENV";

/// Default runtime environment.
pub const DEFAULT_RUNTIME_ENV: &str = "development";

/// Default bind host handed to children ("all interfaces").
pub const DEFAULT_BIND_HOST: &str = "0.0.0.0";

// ============================================================================
// Process Management Timing
// ============================================================================

/// Grace period between SIGTERM and SIGKILL when stopping a service.
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Extra time allowed for the kernel to reap a process after SIGKILL.
pub const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Interval between liveness polls while waiting for a pid to exit.
pub const PROCESS_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Number of consecutive alive polls before a spawn is acknowledged.
pub const SPAWN_READY_CHECKS: usize = 3;

/// Polling interval used while acknowledging a spawn.
pub const SPAWN_POLL_INTERVAL: Duration = Duration::from_millis(50);

// ============================================================================
// Conflict Resolution
// ============================================================================

/// Settle time after terminating the owner of a conflicting port.
pub const PORT_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Wait after interrupting a conflicting process before escalating to SIGKILL.
pub const CONFLICT_TERM_WAIT: Duration = Duration::from_secs(3);

/// Timeout for a single TCP connect probe.
pub const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(250);

// ============================================================================
// Monitoring
// ============================================================================

/// Default interval between liveness probes of a running service.
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(5);

/// Default delay before a dead service is restarted.
pub const MONITOR_RESTART_DELAY: Duration = Duration::from_secs(2);

// ============================================================================
// Health Checks
// ============================================================================

/// Default overall health-check timeout for a service.
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of health probes.
pub const DEFAULT_HEALTH_ATTEMPTS: u32 = 30;

/// Default warm-up delay before the first probe.
pub const DEFAULT_HEALTH_WARMUP: Duration = Duration::from_secs(2);

/// Lower bound on the spacing between two health probes.
pub const MIN_HEALTH_INTERVAL: Duration = Duration::from_millis(250);

/// Upper bound on the timeout of a single health request.
pub const MAX_HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Forecasting
// ============================================================================

/// Default cap on persisted sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 100;

/// Default number of recent sessions used for trend analysis.
pub const DEFAULT_TREND_WINDOW: usize = 10;

/// Minimum samples needed before a prediction is produced.
pub const MIN_PREDICTION_SAMPLES: usize = 2;

/// Confidence at or above which a prediction is reliable.
pub const RELIABLE_CONFIDENCE: f64 = 0.8;

/// Base buffer multiplier applied to a predicted startup time.
pub const TIMEOUT_BUFFER_BASE: f64 = 1.5;

/// Adaptive timeouts never go below this fraction of the base timeout.
pub const TIMEOUT_MIN_FACTOR: f64 = 0.5;

/// Adaptive timeouts never exceed this multiple of the base timeout.
pub const TIMEOUT_MAX_FACTOR: f64 = 3.0;

/// Failure rate below which risk is low.
pub const LOW_RISK_THRESHOLD: f64 = 0.2;

/// Failure rate above which risk is high.
pub const HIGH_RISK_THRESHOLD: f64 = 0.5;

/// Number of failure categories reported by risk analysis.
pub const TOP_FAILURE_CATEGORIES: usize = 3;

// ============================================================================
// Recovery
// ============================================================================

/// Default maximum number of recovery attempts per service and run.
pub const DEFAULT_MAX_RECOVERY_ATTEMPTS: u32 = 3;

/// Delay between a forced stop and the restart in generic recovery.
pub const GENERIC_RECOVERY_DELAY: Duration = Duration::from_secs(2);

/// Stabilization delay before verifying a recovered service.
pub const RECOVERY_STABILIZATION_DELAY: Duration = Duration::from_secs(3);

/// Timeout of the single health check run after recovery.
pub const RECOVERY_VERIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Fraction of available memory under which the host is under pressure.
pub const MEMORY_PRESSURE_RATIO: f64 = 0.1;

/// Pause before the built-in wait-and-restart strategy restarts a slow service.
pub const WAIT_AND_RESTART_DELAY: Duration = Duration::from_secs(5);

/// Number of log lines inspected when collecting symptoms.
pub const SYMPTOM_LOG_LINES: usize = 50;

/// Error markers searched for in every service log.
pub const DEFAULT_ERROR_MARKERS: &[&str] = &[
    "address already in use",
    "error[e",
    "failed to compile",
    "syntaxerror",
    "modulenotfounderror",
    "traceback (most recent call last)",
    "cannot find module",
    "panicked at",
];

// ============================================================================
// Build Step
// ============================================================================

/// Default timeout for the pre-start build command.
pub const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(600);
