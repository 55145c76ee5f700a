//! Warden starts a fixed set of local services, keeps them alive and heals them when they
//! fail. Each service runs through a pipeline of conflict clearing, spawn, liveness
//! monitoring, health polling and diagnosis-driven recovery, while a persisted startup
//! history feeds adaptive health-check timeouts and failure-risk estimates.

/// Optional pre-start build step.
pub mod build_step;

/// CLI interface.
pub mod cli;

/// Configuration management.
pub mod config;

/// Port and process conflict resolution.
pub mod conflict;

/// Timing constants and defaults.
pub mod constants;

/// Built-in rule diagnostician.
pub mod diagnostics;

/// Error handling.
pub mod error;

/// Failure categorisation.
pub mod failure;

/// Startup-time prediction and failure-risk analysis.
pub mod forecast;

/// HTTP health polling.
pub mod health;

/// Persisted startup history.
pub mod history;

/// Logs management.
pub mod logs;

/// Periodic liveness probes.
pub mod monitor;

/// Pid registry shared between invocations.
pub mod pidfile;

/// Low-level process and port helpers.
pub mod process;

/// Recovery orchestration.
pub mod recovery;

/// Child process spawning and stopping.
pub mod spawner;

/// Service status and the aggregate report.
pub mod status;

/// The service manager.
pub mod supervisor;

#[doc(hidden)]
pub mod test_utils;
