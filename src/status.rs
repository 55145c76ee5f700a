//! Service lifecycle states and the aggregate status report.
use std::fmt::Write as _;

use serde::Serialize;
use strum_macros::{AsRefStr, Display};

use crate::{
    config::Tier,
    forecast::{Prediction, RiskLevel},
    recovery::RecoveryFailure,
};

const GREEN_BOLD: &str = "\x1b[1;32m"; // Bright Green
const RED_BOLD: &str = "\x1b[1;31m"; // Bright Red
const YELLOW_BOLD: &str = "\x1b[1;33m"; // Yellow/Gold
const MAGENTA_BOLD: &str = "\x1b[1;35m"; // Magenta
const RESET: &str = "\x1b[0m"; // Reset color

/// Lifecycle of one service: `stopped -> starting -> running -> (healthy | failed)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ServiceStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Healthy,
    Failed,
}

impl ServiceStatus {
    /// Running or healthy.
    pub fn is_up(&self) -> bool {
        matches!(self, ServiceStatus::Running | ServiceStatus::Healthy)
    }

    fn color(&self) -> &'static str {
        match self {
            ServiceStatus::Healthy => GREEN_BOLD,
            ServiceStatus::Running => MAGENTA_BOLD,
            ServiceStatus::Starting => YELLOW_BOLD,
            ServiceStatus::Failed => RED_BOLD,
            ServiceStatus::Stopped => RESET,
        }
    }
}

/// One line of the status report.
#[derive(Debug, Clone)]
pub struct ServiceReport {
    pub id: String,
    pub name: String,
    pub tier: Tier,
    pub status: ServiceStatus,
    pub pid: Option<u32>,
    pub prediction: Option<Prediction>,
    pub risk: Option<RiskLevel>,
    pub error: Option<String>,
    /// Set when recovery gave up on the service.
    pub failure: Option<RecoveryFailure>,
}

#[derive(Debug, Clone, Default)]
pub struct StatusReport {
    pub services: Vec<ServiceReport>,
}

impl StatusReport {
    pub fn healthy_count(&self) -> usize {
        self.services.iter().filter(|s| s.status.is_up()).count()
    }

    pub fn all_up(&self) -> bool {
        self.healthy_count() == self.services.len()
    }

    pub fn summary_line(&self) -> String {
        format!(
            "{}/{} services healthy",
            self.healthy_count(),
            self.services.len()
        )
    }

    /// Renders the report as a plain table, with ANSI colours when `color` is set.
    pub fn render(&self, color: bool) -> String {
        let paint = |code: &str, text: &str| {
            if color {
                format!("{code}{text}{RESET}")
            } else {
                text.to_string()
            }
        };

        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<16} {:<20} {:<9} {:<9} {:>8} {:>10} {:<6}",
            "SERVICE", "NAME", "TIER", "STATUS", "PID", "PREDICTED", "RISK"
        );

        for service in &self.services {
            let pid = service
                .pid
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| "-".into());
            let predicted = service
                .prediction
                .map(|p| format!("{:.1}s", p.predicted_ms / 1000.0))
                .unwrap_or_else(|| "-".into());
            let risk = service
                .risk
                .map(|r| r.to_string())
                .unwrap_or_else(|| "-".into());
            let status = format!("{:<9}", service.status.as_ref());

            let _ = writeln!(
                out,
                "{:<16} {:<20} {:<9} {} {:>8} {:>10} {:<6}",
                service.id,
                service.name,
                service.tier.as_ref(),
                paint(service.status.color(), &status),
                pid,
                predicted,
                risk
            );

            if let Some(failure) = &service.failure {
                if let Some(diagnosis) = &failure.diagnosis {
                    let _ = writeln!(
                        out,
                        "  diagnosis: {} ({}, confidence {:.2})",
                        diagnosis.cause, diagnosis.category, diagnosis.confidence
                    );
                }
                let strategy = failure
                    .strategy
                    .as_ref()
                    .map(|s| s.name.as_str())
                    .unwrap_or("generic restart");
                let _ = writeln!(
                    out,
                    "  strategy:  {strategy} ({} attempt(s))",
                    failure.attempts
                );
                let _ = writeln!(out, "  error:     {}", failure.error);
            } else if let Some(error) = service.error.as_ref().filter(|_| !service.status.is_up()) {
                let _ = writeln!(out, "  error:     {error}");
            }
        }

        let summary = self.summary_line();
        let summary = if self.all_up() {
            paint(GREEN_BOLD, &summary)
        } else {
            paint(RED_BOLD, &summary)
        };
        let _ = writeln!(out, "{summary}");
        out
    }
}
