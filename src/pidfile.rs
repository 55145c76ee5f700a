//! Persisted pid registry shared between the resident supervisor and `stop`/`restart`.
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::PidFileError;

/// Contents of `<logs_dir>/pids.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PidFile {
    #[serde(skip)]
    path: PathBuf,
    /// Pid of the resident supervisor, if one is running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    supervisor: Option<u32>,
    /// Map of service ids to their child PIDs.
    #[serde(default)]
    services: BTreeMap<String, u32>,
}

impl PidFile {
    /// Loads the PID file at `path`; a missing file yields an empty registry.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, PidFileError> {
        let path = path.into();
        let mut pid_file = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            serde_json::from_str::<Self>(&contents)?
        } else {
            Self::default()
        };
        pid_file.path = path;
        Ok(pid_file)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the services map.
    pub fn services(&self) -> &BTreeMap<String, u32> {
        &self.services
    }

    pub fn supervisor(&self) -> Option<u32> {
        self.supervisor
    }

    /// Retrieves a service PID.
    pub fn get(&self, service: &str) -> Option<u32> {
        self.services.get(service).copied()
    }

    /// Saves the current state, or deletes the file once nothing is registered.
    pub fn save(&self) -> Result<(), PidFileError> {
        if self.supervisor.is_none() && self.services.is_empty() {
            if self.path.exists() {
                fs::remove_file(&self.path)?;
            }
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn set_supervisor(&mut self, pid: Option<u32>) -> Result<(), PidFileError> {
        self.supervisor = pid;
        self.save()
    }

    /// Inserts a new service PID and saves.
    pub fn insert(&mut self, service: &str, pid: u32) -> Result<(), PidFileError> {
        self.services.insert(service.to_string(), pid);
        self.save()
    }

    /// Removes a service and saves.
    pub fn remove(&mut self, service: &str) -> Result<(), PidFileError> {
        if self.services.remove(service).is_some() {
            self.save()
        } else {
            Err(PidFileError::ServiceNotFound)
        }
    }

    /// Forgets every entry and deletes the file.
    pub fn clear(&mut self) -> Result<(), PidFileError> {
        self.supervisor = None;
        self.services.clear();
        self.save()
    }
}
