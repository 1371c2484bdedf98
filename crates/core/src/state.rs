use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::EngineError;
use crate::types::AccountRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Running,
    Stopped,
    Manual,
    Completed,
}

/// Durable progress of one pass over the account pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleState {
    pub cycle_id: String,
    pub accounts_fingerprint: String,
    pub status: CycleStatus,
    /// Index of the next account to run. `total + 1` once completed.
    pub next_index: usize,
    pub total: usize,
    pub last_updated: DateTime<Local>,
}

impl CycleState {
    pub fn new(fingerprint: String, total: usize) -> Self {
        let now = Local::now();
        Self {
            cycle_id: now.format("%Y%m%d_%H%M%S").to_string(),
            accounts_fingerprint: fingerprint,
            status: CycleStatus::Running,
            next_index: 0,
            total,
            last_updated: now,
        }
    }

    /// Whether a new cycle over `fingerprint` should continue this one.
    pub fn resumable(&self, fingerprint: &str) -> bool {
        self.accounts_fingerprint == fingerprint
            && self.status != CycleStatus::Completed
            && self.next_index < self.total
    }
}

/// Stable identity of the enabled pool, in order.
pub fn fingerprint(accounts: &[AccountRecord]) -> String {
    let ids: Vec<&str> = accounts.iter().filter(|a| a.enabled).map(|a| a.id.as_str()).collect();
    let digest = Sha256::digest(ids.join("|").as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

pub struct CycleStore {
    path: PathBuf,
}

impl CycleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` when there is no usable state; a corrupt file is reported and
    /// treated as absent.
    pub fn load(&self) -> Option<CycleState> {
        let raw = fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "cycle state unreadable, starting fresh");
                None
            }
        }
    }

    /// Atomically replace the state file: write a sibling temp file, flush
    /// it to disk, then rename over the target.
    pub fn save(&self, state: &CycleState) -> Result<(), EngineError> {
        let persist = |e: &dyn std::fmt::Display| EngineError::Persist(format!("{}: {}", self.path.display(), e));
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(|e| persist(&e))?;
        let json = serde_json::to_vec_pretty(state).map_err(|e| persist(&e))?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| persist(&e))?;
        tmp.write_all(&json).map_err(|e| persist(&e))?;
        tmp.as_file().sync_all().map_err(|e| persist(&e))?;
        tmp.persist(&self.path).map_err(|e| persist(&e.error))?;
        Ok(())
    }
}

/// File-backed stop request, checked between accounts.
#[derive(Debug, Clone)]
pub struct StopSignal {
    path: PathBuf,
}

impl StopSignal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn is_set(&self) -> bool {
        self.path.exists()
    }

    pub fn request(&self) -> Result<(), EngineError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| EngineError::Persist(e.to_string()))?;
        }
        fs::write(&self.path, b"").map_err(|e| EngineError::Persist(e.to_string()))?;
        info!(path = %self.path.display(), "stop requested");
        Ok(())
    }

    pub fn clear(&self) -> Result<(), EngineError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!("stop flag cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::Persist(e.to_string())),
        }
    }
}
