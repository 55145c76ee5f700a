//! Startup forecasting from the persisted history: time predictions, adaptive health timeouts and
//! failure-risk estimates.
use std::{collections::HashMap, path::PathBuf, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};
use tracing::debug;

use crate::{
    config::{Config, HistoryConfig},
    constants::{
        HIGH_RISK_THRESHOLD, HISTORY_FILE_NAME, LOW_RISK_THRESHOLD, MIN_PREDICTION_SAMPLES,
        RELIABLE_CONFIDENCE, TIMEOUT_BUFFER_BASE, TIMEOUT_MAX_FACTOR, TIMEOUT_MIN_FACTOR,
        TOP_FAILURE_CATEGORIES,
    },
    error::HistoryError,
    failure::{FailureCategory, classify},
    history::{HistorySession, HistoryStore, RecoveryRecord, ServiceRecord, SystemSnapshot},
};

/// Predicted startup time for one service. Derived on demand, never persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub predicted_ms: f64,
    pub confidence: f64,
    pub samples: usize,
    pub reliable: bool,
}

/// Coarse failure likelihood bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn from_rate(rate: f64) -> Self {
        if rate < LOW_RISK_THRESHOLD {
            RiskLevel::Low
        } else if rate <= HIGH_RISK_THRESHOLD {
            RiskLevel::Medium
        } else {
            RiskLevel::High
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailureRisk {
    pub level: RiskLevel,
    pub failure_rate: f64,
    /// Sessions in the window that recorded an outcome for the service.
    pub sessions: usize,
    pub failures: usize,
    /// Most frequent error categories, most common first.
    pub top_categories: Vec<(FailureCategory, usize)>,
}

/// Recency-weighted prediction over `samples` (oldest first).
///
/// Weights run from 1 for the oldest sample to `n` for the newest. Confidence is
/// `1 - stddev/mean` over the unweighted samples, clamped to `[0, 1]`.
pub fn predict_from_samples(samples: &[f64]) -> Option<Prediction> {
    if samples.len() < MIN_PREDICTION_SAMPLES {
        return None;
    }

    let n = samples.len() as f64;
    let (weighted_sum, weight_total) = samples
        .iter()
        .enumerate()
        .fold((0.0, 0.0), |(sum, weights), (idx, value)| {
            let weight = (idx + 1) as f64;
            (sum + value * weight, weights + weight)
        });
    let predicted_ms = weighted_sum / weight_total;

    let mean = samples.iter().sum::<f64>() / n;
    let confidence = if mean > 0.0 {
        let variance = samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        (1.0 - variance.sqrt() / mean).clamp(0.0, 1.0)
    } else {
        0.0
    };

    Some(Prediction {
        predicted_ms,
        confidence,
        samples: samples.len(),
        reliable: confidence >= RELIABLE_CONFIDENCE,
    })
}

/// Health timeout derived from a prediction, bounded to `[0.5 x base, 3 x base]`.
///
/// Without a reliable prediction `base` is returned unchanged.
pub fn adaptive_timeout_for(prediction: Option<&Prediction>, base: Duration) -> Duration {
    let Some(prediction) = prediction.filter(|p| p.reliable) else {
        return base;
    };

    let base_ms = base.as_secs_f64() * 1000.0;
    let buffer = TIMEOUT_BUFFER_BASE + (1.0 - prediction.confidence);
    let candidate = prediction.predicted_ms * buffer;
    let bounded = candidate.clamp(base_ms * TIMEOUT_MIN_FACTOR, base_ms * TIMEOUT_MAX_FACTOR);
    Duration::from_secs_f64(bounded / 1000.0)
}

/// Owns the startup history and the session of the current supervisor run.
#[derive(Debug)]
pub struct ForecastingEngine {
    store: HistoryStore,
    window: usize,
    session_open: bool,
}

impl ForecastingEngine {
    pub fn open(path: impl Into<PathBuf>, config: &HistoryConfig) -> Result<Self, HistoryError> {
        Ok(Self {
            store: HistoryStore::open(path, config.max_sessions)?,
            window: config.trend_window.max(1),
            session_open: false,
        })
    }

    /// Opens `<logs_dir>/startup-history.json` for a loaded configuration.
    pub fn for_config(config: &Config) -> Result<Self, HistoryError> {
        Self::open(config.logs_path().join(HISTORY_FILE_NAME), &config.history)
    }

    pub fn store(&self) -> &HistoryStore {
        &self.store
    }

    /// The most recent completed sessions, oldest first, at most `window` of them.
    fn window_sessions(&self) -> impl Iterator<Item = &HistorySession> {
        let sessions = self.store.sessions();
        let completed = if self.session_open {
            sessions.len().saturating_sub(1)
        } else {
            sessions.len()
        };
        let skip = completed.saturating_sub(self.window);
        sessions.iter().take(completed).skip(skip)
    }

    fn window_records<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a ServiceRecord> {
        self.window_sessions()
            .filter_map(move |session| session.services.get(id))
    }

    pub fn predict_startup_time(&self, id: &str) -> Option<Prediction> {
        let samples: Vec<f64> = self
            .window_records(id)
            .filter(|record| record.success == Some(true))
            .filter_map(|record| record.startup_duration_ms)
            .map(|ms| ms as f64)
            .collect();
        predict_from_samples(&samples)
    }

    pub fn adaptive_timeout(&self, id: &str, base: Duration) -> Duration {
        let prediction = self.predict_startup_time(id);
        let timeout = adaptive_timeout_for(prediction.as_ref(), base);
        if timeout != base {
            debug!("Adaptive health timeout for '{id}': {timeout:?} (base {base:?})");
        }
        timeout
    }

    pub fn analyze_failure_risk(&self, id: &str) -> FailureRisk {
        let mut sessions = 0;
        let mut failures = 0;
        let mut categories: HashMap<FailureCategory, usize> = HashMap::new();

        for record in self.window_records(id) {
            let Some(success) = record.success else {
                continue;
            };
            sessions += 1;
            if !success {
                failures += 1;
                if let Some(error) = record.error.as_deref() {
                    *categories.entry(classify(error)).or_default() += 1;
                }
            }
        }

        let failure_rate = if sessions == 0 {
            0.0
        } else {
            failures as f64 / sessions as f64
        };

        let mut top_categories: Vec<(FailureCategory, usize)> = categories.into_iter().collect();
        top_categories.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        top_categories.truncate(TOP_FAILURE_CATEGORIES);

        FailureRisk {
            level: RiskLevel::from_rate(failure_rate),
            failure_rate,
            sessions,
            failures,
            top_categories,
        }
    }

    fn ensure_session(&mut self, at: DateTime<Utc>) -> Result<(), HistoryError> {
        if !self.session_open {
            self.store
                .append(HistorySession::begin(at, SystemSnapshot::capture()))?;
            self.session_open = true;
        }
        Ok(())
    }

    fn update_record<F>(&mut self, id: &str, at: DateTime<Utc>, update: F) -> Result<(), HistoryError>
    where
        F: FnOnce(&mut ServiceRecord),
    {
        self.ensure_session(at)?;
        self.store.update_last(|session| {
            update(session.services.entry(id.to_string()).or_default());
        })
    }

    /// Marks a (re)start attempt. Earlier recovery records for the service are kept.
    pub fn record_start(&mut self, id: &str, at: DateTime<Utc>) -> Result<(), HistoryError> {
        self.update_record(id, at, |record| {
            record.started_at = Some(at);
            record.ended_at = None;
            record.startup_duration_ms = None;
            record.success = None;
            record.error = None;
        })
    }

    /// Marks the service healthy and returns the measured startup duration.
    pub fn record_success(
        &mut self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Duration>, HistoryError> {
        let mut measured = None;
        self.update_record(id, at, |record| {
            record.ended_at = Some(at);
            record.success = Some(true);
            if let Some(started) = record.started_at {
                let elapsed = (at - started).to_std().unwrap_or_default();
                record.startup_duration_ms = Some(elapsed.as_millis() as u64);
                measured = Some(elapsed);
            }
        })?;
        Ok(measured)
    }

    pub fn record_failure(&mut self, id: &str, error: &str) -> Result<(), HistoryError> {
        let now = Utc::now();
        self.update_record(id, now, |record| {
            record.ended_at = Some(now);
            record.success = Some(false);
            record.error = Some(error.to_string());
        })
    }

    pub fn record_recovery(&mut self, id: &str, entry: RecoveryRecord) -> Result<(), HistoryError> {
        let at = entry.at;
        self.update_record(id, at, |record| record.recoveries.push(entry))
    }

    /// Closes the current session. Later records open a new one.
    pub fn end_session(&mut self, at: DateTime<Utc>) -> Result<(), HistoryError> {
        if !self.session_open {
            return Ok(());
        }
        self.session_open = false;
        self.store.update_last(|session| session.ended_at = Some(at))
    }
}
