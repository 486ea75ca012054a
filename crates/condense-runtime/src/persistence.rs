//! Validator state persistence
//!
//! Keeps the last committed round, its weights and the rolling score windows
//! so that smoothing and trimming continue across restarts.
//!
//! Two stores:
//! - [`MemoryWeightStore`]: in-process, for tests
//! - [`FileWeightStore`]: `snapshot.json` in a state directory, replaced
//!   atomically, with the previous generation kept as `snapshot.prev.json`

use condense_core::{ScoreRecord, Weights};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{info, warn};

const SNAPSHOT_FILE: &str = "snapshot.json";
const PREVIOUS_FILE: &str = "snapshot.prev.json";
const STAGING_FILE: &str = "snapshot.json.tmp";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

/// Everything needed to resume scoring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorSnapshot {
    /// Last round whose weights were committed
    pub round: u64,
    pub weights: Weights,
    /// Window contents, oldest first
    #[serde(default)]
    pub scores: Vec<ScoreRecord>,
    pub saved_at_ms: i64,
}

impl ValidatorSnapshot {
    pub fn new(round: u64, weights: Weights, scores: Vec<ScoreRecord>) -> Self {
        Self {
            round,
            weights,
            scores,
            saved_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec_pretty(self).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
    }
}

/// Where the validator checkpoints after each committed round.
pub trait WeightStore: Send + Sync {
    fn save_snapshot(&self, snapshot: &ValidatorSnapshot) -> Result<(), StoreError>;

    /// `None` when nothing was ever saved.
    fn load_snapshot(&self) -> Result<Option<ValidatorSnapshot>, StoreError>;

    /// Forget all saved state.
    fn clear(&self) -> Result<(), StoreError>;
}

/// Holds the encoded snapshot so that saves go through the same
/// serialization as the file store.
#[derive(Default)]
pub struct MemoryWeightStore {
    encoded: Mutex<Option<Vec<u8>>>,
}

impl MemoryWeightStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<Vec<u8>>> {
        self.encoded.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl WeightStore for MemoryWeightStore {
    fn save_snapshot(&self, snapshot: &ValidatorSnapshot) -> Result<(), StoreError> {
        *self.slot() = Some(snapshot.encode()?);
        Ok(())
    }

    fn load_snapshot(&self) -> Result<Option<ValidatorSnapshot>, StoreError> {
        self.slot()
            .as_deref()
            .map(ValidatorSnapshot::decode)
            .transpose()
    }

    fn clear(&self) -> Result<(), StoreError> {
        *self.slot() = None;
        Ok(())
    }
}

pub struct FileWeightStore {
    dir: PathBuf,
}

impl FileWeightStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        info!(dir = %dir.display(), "Opened validator state directory");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read(&self, file: &str) -> Result<Option<ValidatorSnapshot>, StoreError> {
        match std::fs::read(self.dir.join(file)) {
            Ok(bytes) => ValidatorSnapshot::decode(&bytes).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn remove_if_present(path: &Path) -> Result<(), StoreError> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

impl WeightStore for FileWeightStore {
    fn save_snapshot(&self, snapshot: &ValidatorSnapshot) -> Result<(), StoreError> {
        let staging = self.dir.join(STAGING_FILE);
        let current = self.dir.join(SNAPSHOT_FILE);
        std::fs::write(&staging, snapshot.encode()?)?;
        if current.exists() {
            std::fs::rename(&current, self.dir.join(PREVIOUS_FILE))?;
        }
        std::fs::rename(&staging, &current)?;
        Ok(())
    }

    /// Falls back to the previous generation when the current file is
    /// unreadable; fails only if neither decodes.
    fn load_snapshot(&self) -> Result<Option<ValidatorSnapshot>, StoreError> {
        match self.read(SNAPSHOT_FILE) {
            Ok(Some(snapshot)) => Ok(Some(snapshot)),
            Ok(None) => self.read(PREVIOUS_FILE),
            Err(e) => match self.read(PREVIOUS_FILE) {
                Ok(Some(previous)) => {
                    warn!(error = %e, round = previous.round, "Current snapshot unreadable, using previous");
                    Ok(Some(previous))
                }
                _ => Err(e),
            },
        }
    }

    fn clear(&self) -> Result<(), StoreError> {
        for file in [SNAPSHOT_FILE, PREVIOUS_FILE, STAGING_FILE] {
            remove_if_present(&self.dir.join(file))?;
        }
        Ok(())
    }
}
