//! Persisted startup history: a capped, file-backed ring buffer of supervisor sessions.
use std::{
    collections::{BTreeMap, VecDeque},
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    constants::{HISTORY_FORMAT_VERSION, LOCK_SUFFIX},
    error::HistoryError,
    process::MemorySnapshot,
    recovery::{Diagnosis, Strategy, Symptoms},
};

/// Host description captured once per session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemSnapshot {
    pub platform: String,
    pub arch: String,
    pub cpu_count: usize,
    pub free_memory_mb: u64,
    pub total_memory_mb: u64,
    pub runtime_version: String,
}

impl SystemSnapshot {
    pub fn capture() -> Self {
        let memory = MemorySnapshot::capture();
        Self {
            platform: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            cpu_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            free_memory_mb: memory.available_bytes / (1024 * 1024),
            total_memory_mb: memory.total_bytes / (1024 * 1024),
            runtime_version: concat!("warden ", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Outcome of one recovery attempt, kept for later analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryRecord {
    pub at: DateTime<Utc>,
    pub attempt: u32,
    pub symptoms: Symptoms,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<Diagnosis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Startup outcome of one service within a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub startup_duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recoveries: Vec<RecoveryRecord>,
}

/// One supervisor invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistorySession {
    pub id: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceRecord>,
    pub system: SystemSnapshot,
}

impl HistorySession {
    pub fn begin(started_at: DateTime<Utc>, system: SystemSnapshot) -> Self {
        Self {
            id: format!(
                "{}-{}",
                started_at.format("%Y%m%dT%H%M%S%.3f"),
                std::process::id()
            ),
            started_at,
            ended_at: None,
            services: BTreeMap::new(),
            system,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HistoryMetadata {
    version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct HistoryFile {
    sessions: VecDeque<HistorySession>,
    metadata: HistoryMetadata,
}

/// Capped session buffer backed by a JSON file that is rewritten in full on every change.
#[derive(Debug)]
pub struct HistoryStore {
    path: PathBuf,
    cap: usize,
    sessions: VecDeque<HistorySession>,
}

impl HistoryStore {
    /// Reads the whole history file. A missing file starts an empty history; an unreadable one
    /// is logged and replaced on the next write.
    pub fn open(path: impl Into<PathBuf>, cap: usize) -> Result<Self, HistoryError> {
        let path = path.into();
        let cap = cap.max(1);
        let mut sessions = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            match serde_json::from_str::<HistoryFile>(&contents) {
                Ok(file) => file.sessions,
                Err(err) => {
                    warn!(
                        "Ignoring unreadable history file {}: {err}",
                        path.display()
                    );
                    VecDeque::new()
                }
            }
        } else {
            VecDeque::new()
        };

        while sessions.len() > cap {
            sessions.pop_front();
        }

        debug!(
            "Loaded {} history session(s) from {}",
            sessions.len(),
            path.display()
        );
        Ok(Self {
            path,
            cap,
            sessions,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sessions(&self) -> &VecDeque<HistorySession> {
        &self.sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Appends a session, evicting the oldest ones beyond the cap, and persists.
    pub fn append(&mut self, session: HistorySession) -> Result<(), HistoryError> {
        self.sessions.push_back(session);
        while self.sessions.len() > self.cap {
            self.sessions.pop_front();
        }
        self.save()
    }

    /// Mutates the newest session and persists. No-op on an empty history.
    pub fn update_last<F>(&mut self, update: F) -> Result<(), HistoryError>
    where
        F: FnOnce(&mut HistorySession),
    {
        match self.sessions.back_mut() {
            Some(session) => {
                update(session);
                self.save()
            }
            None => Ok(()),
        }
    }

    /// Rewrites the whole file through a temp file while holding an advisory lock.
    fn save(&self) -> Result<(), HistoryError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let file = HistoryFile {
            sessions: self.sessions.clone(),
            metadata: HistoryMetadata {
                version: HISTORY_FORMAT_VERSION,
                updated_at: Some(Utc::now()),
            },
        };
        let json = serde_json::to_string_pretty(&file)?;

        let lock_path = PathBuf::from(format!("{}{}", self.path.display(), LOCK_SUFFIX));
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        lock.lock_exclusive()?;

        let tmp_path = self.path.with_extension("json.tmp");
        let result = fs::write(&tmp_path, json).and_then(|_| fs::rename(&tmp_path, &self.path));
        let _ = FileExt::unlock(&lock);
        result?;
        Ok(())
    }
}
