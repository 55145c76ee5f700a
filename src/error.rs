//! Error handling for warden.
use std::time::Duration;

use thiserror::Error;

/// Defines all possible errors that can occur while supervising services.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read config file: {0}")]
    ConfigReadError(#[from] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    ConfigParseError(#[from] serde_yaml::Error),

    /// Semantic error in an otherwise well-formed configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The requested service id is not part of the configuration.
    #[error("Unknown service '{0}'")]
    UnknownService(String),

    /// The OS could not create the service process. Fatal, no recovery.
    #[error("Failed to spawn service '{service}': {source}")]
    Spawn {
        /// The service that failed to spawn.
        service: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Another process still holds the service port after conflict resolution.
    #[error("Port {port} for service '{service}' is held by another process")]
    PortConflict {
        /// The service whose port is occupied.
        service: String,
        /// The occupied port.
        port: u16,
    },

    /// Health polling ran out of attempts or time.
    #[error("Health check for '{service}' timed out after {timeout:?} ({attempts} attempts)")]
    HealthCheckTimeout {
        /// The service that stayed unhealthy.
        service: String,
        /// The timeout that was applied.
        timeout: Duration,
        /// Number of probes performed.
        attempts: u32,
    },

    /// The process died while its health was being awaited.
    #[error("Service '{service}' exited before becoming healthy: {detail}")]
    ProcessExited {
        /// The service whose process is gone.
        service: String,
        /// How the process ended.
        detail: String,
    },

    /// Recovery attempts for a service are used up. Fatal for that service only.
    #[error("Recovery exhausted for service '{service}' after {attempts} attempt(s)")]
    RecoveryExhausted {
        /// The service that could not be recovered.
        service: String,
        /// Attempts consumed.
        attempts: u32,
    },

    /// The pre-start build command failed.
    #[error("Build step failed: {0}")]
    BuildFailure(String),

    /// Error stopping a service process.
    #[error("Failed to stop service '{service}': {source}")]
    Stop {
        /// The service name that failed to stop.
        service: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// A second live process was about to be registered for the same id.
    #[error("Service '{0}' already has a live process registered")]
    AlreadyRunning(String),

    /// Error for the startup history file.
    #[error("History error: {0}")]
    History(#[from] HistoryError),

    /// Error for the PID file.
    #[error("PID file error: {0}")]
    PidFile(#[from] PidFileError),

    /// The HTTP client for health probes could not be built.
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Error raised by a signal system call.
    #[error("Signal delivery failed: {0}")]
    ErrNo(#[from] nix::errno::Errno),
}

/// Error type for startup history persistence.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// Error reading or writing the history file.
    #[error("Failed to access history file: {0}")]
    Io(#[from] std::io::Error),

    /// Error parsing the JSON history file.
    #[error("Failed to parse history file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Error type for PID file operations.
#[derive(Debug, Error)]
pub enum PidFileError {
    /// Error reading or writing the PID file.
    #[error("Failed to read PID file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Error parsing the PID file.
    #[error("Failed to parse PID file: {0}")]
    ParseError(#[from] serde_json::Error),

    /// Requested service is not present in the PID file.
    #[error("Service not found in PID file")]
    ServiceNotFound,
}

impl SupervisorError {
    /// Whether the failure can be handed to the recovery orchestrator.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SupervisorError::PortConflict { .. }
                | SupervisorError::HealthCheckTimeout { .. }
                | SupervisorError::ProcessExited { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_port_and_health_failures_are_recoverable() {
        let health = SupervisorError::HealthCheckTimeout {
            service: "api".into(),
            timeout: Duration::from_secs(30),
            attempts: 10,
        };
        let spawn = SupervisorError::Spawn {
            service: "api".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        let exhausted = SupervisorError::RecoveryExhausted {
            service: "api".into(),
            attempts: 3,
        };

        assert!(health.is_recoverable());
        assert!(!spawn.is_recoverable());
        assert!(!exhausted.is_recoverable());
        assert!(!SupervisorError::BuildFailure("exit 1".into()).is_recoverable());
    }
}
