//! Durable key-value storage for run bookkeeping.
//!
//! The orchestrator may be torn down and restarted at any time, so resume offsets, the last
//! failure, queued configuration runs, and the interruption handler repository are written here
//! instead of living only in memory. The JSON-backed store follows the same conventions as the
//! other configuration files (tilde expansion, config directory fallback, environment override).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map as JsonMap, Value};
use thiserror::Error;
use tracing::warn;

use crate::path_processing::{app_file_path, expand_tilde};

/// Environment variable controlling the state file location.
pub const STATE_PATH_ENV: &str = "ROWPILOT_STATE_PATH";

/// Default filename for the persisted state store.
pub const STATE_FILE_NAME: &str = "state.json";

/// Errors surfaced by state store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    /// I/O failure while reading or writing the state file.
    #[error("state I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization or deserialization failure.
    #[error("state serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// A previous writer panicked while holding the store lock.
    #[error("state store lock poisoned")]
    Poisoned,
}

/// Shared trait implemented by state persistence backends.
pub trait StateStore: Send + Sync {
    /// Returns the stored values for the requested keys; missing keys are absent from the map.
    fn get(&self, keys: &[&str]) -> Result<JsonMap<String, Value>, StateStoreError>;

    /// Stores every entry of `entries`, replacing existing values.
    fn set(&self, entries: JsonMap<String, Value>) -> Result<(), StateStoreError>;

    /// Removes the provided keys.
    fn remove(&self, keys: &[&str]) -> Result<(), StateStoreError>;
}

/// Reads and deserializes a single key.
///
/// A stored value that no longer matches the expected shape is treated as absent so a stale
/// record never blocks startup.
pub fn read_value<T: DeserializeOwned>(store: &dyn StateStore, key: &str) -> Result<Option<T>, StateStoreError> {
    let mut entries = store.get(&[key])?;
    let Some(raw) = entries.remove(key) else {
        return Ok(None);
    };
    match serde_json::from_value(raw) {
        Ok(value) => Ok(Some(value)),
        Err(error) => {
            warn!(key, error = %error, "Ignoring unreadable state entry");
            Ok(None)
        }
    }
}

/// Serializes and stores a single key.
pub fn write_value<T: Serialize>(store: &dyn StateStore, key: &str, value: &T) -> Result<(), StateStoreError> {
    let mut entries = JsonMap::new();
    entries.insert(key.to_string(), serde_json::to_value(value)?);
    store.set(entries)
}

fn lock(entries: &Mutex<JsonMap<String, Value>>) -> Result<MutexGuard<'_, JsonMap<String, Value>>, StateStoreError> {
    entries.lock().map_err(|_| StateStoreError::Poisoned)
}

fn select(entries: &JsonMap<String, Value>, keys: &[&str]) -> JsonMap<String, Value> {
    keys.iter()
        .filter_map(|key| entries.get(*key).map(|value| (key.to_string(), value.clone())))
        .collect()
}

/// JSON-backed state store persisted on disk.
pub struct JsonStateStore {
    path: PathBuf,
    entries: Mutex<JsonMap<String, Value>>,
}

impl JsonStateStore {
    /// Create a store at the provided path (or the default path when omitted).
    pub fn new<P: Into<Option<PathBuf>>>(path: P) -> Result<Self, StateStoreError> {
        let resolved_path = match path.into() {
            Some(path) => expand_tilde(path.to_string_lossy()),
            None => app_file_path(STATE_PATH_ENV, STATE_FILE_NAME),
        };

        let entries = load_state_file(&resolved_path)?;
        Ok(Self {
            path: resolved_path,
            entries: Mutex::new(entries),
        })
    }

    /// Access the underlying state path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save_locked(&self, entries: &JsonMap<String, Value>) -> Result<(), StateStoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(entries)?;
        fs::write(&self.path, content)?;
        Ok(())
    }
}

impl StateStore for JsonStateStore {
    fn get(&self, keys: &[&str]) -> Result<JsonMap<String, Value>, StateStoreError> {
        let entries = lock(&self.entries)?;
        Ok(select(&entries, keys))
    }

    fn set(&self, updates: JsonMap<String, Value>) -> Result<(), StateStoreError> {
        let mut entries = lock(&self.entries)?;
        entries.extend(updates);
        self.save_locked(&entries)
    }

    fn remove(&self, keys: &[&str]) -> Result<(), StateStoreError> {
        let mut entries = lock(&self.entries)?;
        for key in keys {
            entries.remove(*key);
        }
        self.save_locked(&entries)
    }
}

/// In-memory state store used by tests and ephemeral runs.
#[derive(Default)]
pub struct InMemoryStateStore {
    entries: Mutex<JsonMap<String, Value>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for InMemoryStateStore {
    fn get(&self, keys: &[&str]) -> Result<JsonMap<String, Value>, StateStoreError> {
        let entries = lock(&self.entries)?;
        Ok(select(&entries, keys))
    }

    fn set(&self, updates: JsonMap<String, Value>) -> Result<(), StateStoreError> {
        let mut entries = lock(&self.entries)?;
        entries.extend(updates);
        Ok(())
    }

    fn remove(&self, keys: &[&str]) -> Result<(), StateStoreError> {
        let mut entries = lock(&self.entries)?;
        for key in keys {
            entries.remove(*key);
        }
        Ok(())
    }
}

fn load_state_file(path: &Path) -> Result<JsonMap<String, Value>, StateStoreError> {
    match fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<JsonMap<String, Value>>(&content) {
            Ok(entries) => Ok(entries),
            Err(error) => {
                warn!(path = %path.display(), error = %error, "Failed to parse state file; starting empty");
                Ok(JsonMap::new())
            }
        },
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(JsonMap::new()),
        Err(error) => Err(StateStoreError::Io(error)),
    }
}
