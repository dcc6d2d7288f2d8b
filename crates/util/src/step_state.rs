//! Local cache for per-step inputs, outputs, and executions.
//!
//! Only [`PersistedStepState`] is ever written here; the canonical workflow definition is always
//! re-read from the server. Entries are keyed by workflow URI. The JSON-backed store mirrors the
//! ergonomics of the other config files (tilde expansion, config directory fallback, env override).

use crate::path_processing::expand_tilde;
use chrono::serde::ts_milliseconds;
use chrono::{DateTime, Utc};
use dirs_next::config_dir;
use flowsync_types::PersistedStepState;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, warn};

/// Environment variable controlling the step state file location.
pub const STEP_STATE_PATH_ENV: &str = "FLOWSYNC_STATE_PATH";

/// Default filename for the persisted step state.
pub const STEP_STATE_FILE_NAME: &str = "step_state.json";

/// Errors surfaced by step state persistence.
#[derive(Debug, Error)]
pub enum StepStateStoreError {
    /// I/O failure while reading or writing the cache file.
    #[error("step state I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization or deserialization failure.
    #[error("step state serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Backend for the per-workflow step state cache.
pub trait StepStateStore: Send + Sync {
    /// Loads the cached state for a workflow URI.
    fn load(&self, workflow_uri: &str) -> Result<Option<PersistedStepState>, StepStateStoreError>;

    /// Replaces the cached state for a workflow URI.
    fn save(&self, workflow_uri: &str, state: &PersistedStepState) -> Result<(), StepStateStoreError>;

    /// Drops the cached state for a workflow URI.
    fn remove(&self, workflow_uri: &str) -> Result<(), StepStateStoreError>;
}

#[derive(Default, Serialize, Deserialize)]
struct StepStateFile {
    #[serde(default)]
    workflows: IndexMap<String, StepStateEntry>,
}

#[derive(Clone, Serialize, Deserialize)]
struct StepStateEntry {
    #[serde(flatten)]
    state: PersistedStepState,
    #[serde(with = "ts_milliseconds")]
    updated_at: DateTime<Utc>,
}

impl StepStateFile {
    fn get(&self, workflow_uri: &str) -> Option<PersistedStepState> {
        self.workflows.get(workflow_uri).map(|entry| entry.state.clone())
    }

    fn upsert(&mut self, workflow_uri: &str, state: &PersistedStepState) {
        self.workflows.insert(
            workflow_uri.to_string(),
            StepStateEntry {
                state: state.clone(),
                updated_at: Utc::now(),
            },
        );
    }
}

fn lock_file(file: &Mutex<StepStateFile>) -> MutexGuard<'_, StepStateFile> {
    file.lock().unwrap_or_else(PoisonError::into_inner)
}

/// JSON-backed store persisted on disk, one file holding every workflow.
pub struct JsonStepStateStore {
    path: PathBuf,
    file: Mutex<StepStateFile>,
}

impl JsonStepStateStore {
    /// Opens the store at the provided path, or the default path when omitted.
    pub fn new<P: Into<Option<PathBuf>>>(path: P) -> Result<Self, StepStateStoreError> {
        let resolved_path = match path.into() {
            Some(path) => expand_tilde(&path.to_string_lossy()),
            None => default_step_state_path(),
        };
        let file = load_step_state_file(&resolved_path)?;
        debug!(path = %resolved_path.display(), workflows = file.workflows.len(), "opened step state store");
        Ok(Self {
            path: resolved_path,
            file: Mutex::new(file),
        })
    }

    /// Opens the store at the default location.
    pub fn with_defaults() -> Result<Self, StepStateStoreError> {
        Self::new(None::<PathBuf>)
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save_locked(&self, file: &StepStateFile) -> Result<(), StepStateStoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(file)?;
        let staging_path = self.path.with_extension("json.tmp");
        fs::write(&staging_path, content)?;
        fs::rename(&staging_path, &self.path)?;
        Ok(())
    }
}

impl StepStateStore for JsonStepStateStore {
    fn load(&self, workflow_uri: &str) -> Result<Option<PersistedStepState>, StepStateStoreError> {
        Ok(lock_file(&self.file).get(workflow_uri))
    }

    fn save(&self, workflow_uri: &str, state: &PersistedStepState) -> Result<(), StepStateStoreError> {
        let mut file = lock_file(&self.file);
        file.upsert(workflow_uri, state);
        self.save_locked(&file)
    }

    fn remove(&self, workflow_uri: &str) -> Result<(), StepStateStoreError> {
        let mut file = lock_file(&self.file);
        if file.workflows.shift_remove(workflow_uri).is_some() {
            self.save_locked(&file)?;
        }
        Ok(())
    }
}

/// In-memory store used by tests and ephemeral sessions.
#[derive(Default)]
pub struct InMemoryStepStateStore {
    file: Mutex<StepStateFile>,
}

impl InMemoryStepStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StepStateStore for InMemoryStepStateStore {
    fn load(&self, workflow_uri: &str) -> Result<Option<PersistedStepState>, StepStateStoreError> {
        Ok(lock_file(&self.file).get(workflow_uri))
    }

    fn save(&self, workflow_uri: &str, state: &PersistedStepState) -> Result<(), StepStateStoreError> {
        lock_file(&self.file).upsert(workflow_uri, state);
        Ok(())
    }

    fn remove(&self, workflow_uri: &str) -> Result<(), StepStateStoreError> {
        lock_file(&self.file).workflows.shift_remove(workflow_uri);
        Ok(())
    }
}

/// Default cache location, honoring [`STEP_STATE_PATH_ENV`].
pub fn default_step_state_path() -> PathBuf {
    if let Ok(path) = env::var(STEP_STATE_PATH_ENV)
        && !path.trim().is_empty()
    {
        return expand_tilde(&path);
    }

    config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("flowsync")
        .join(STEP_STATE_FILE_NAME)
}

fn load_step_state_file(path: &Path) -> Result<StepStateFile, StepStateStoreError> {
    match fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<StepStateFile>(&content) {
            Ok(file) => Ok(file),
            Err(error) => {
                warn!("Failed to parse step state file at {}: {}", path.display(), error);
                Ok(StepStateFile::default())
            }
        },
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(StepStateFile::default()),
        Err(error) => Err(StepStateStoreError::Io(error)),
    }
}
