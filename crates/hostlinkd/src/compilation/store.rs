//! Durable key/value storage for the compilation-await record.
//!
//! The record is the only state that outlives a host rebuild or a process
//! restart. It is spread over three keys so that tooling inspecting the store
//! sees the same layout the host's preference store would hold.

use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

/// Whether a client was connected when the write started.
pub const KEY_WAS_CONNECTED: &str = "WasConnectedBeforeCompile";

/// RFC 3339 timestamp of when the write started.
pub const KEY_START_TIME: &str = "CompilationStartTime";

/// Opaque JSON describing the request and, once known, its result.
pub const KEY_PENDING_RESULT: &str = "PendingCompilationResult";

const RECORD_KEYS: [&str; 3] = [KEY_WAS_CONNECTED, KEY_START_TIME, KEY_PENDING_RESULT];

/// Minimal key/value persistence.
pub trait DurableStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;
    fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Applies several changes as one unit. `None` removes the key.
    ///
    /// Stores that can write atomically override this; the default applies
    /// the changes one by one.
    fn apply(&self, changes: Vec<(&str, Option<Value>)>) -> Result<(), StoreError> {
        for (key, value) in changes {
            match value {
                Some(value) => self.set(key, value)?,
                None => self.remove(key)?,
            }
        }
        Ok(())
    }
}

/// Errors from durable storage.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to read {path}: {error}")]
    Read { path: PathBuf, error: String },

    #[error("Failed to write {path}: {error}")]
    Write { path: PathBuf, error: String },

    #[error("Corrupt store {path}: {error}")]
    Corrupt { path: PathBuf, error: String },
}

/// JSON-file store. Every mutation rewrites the file through a temporary
/// sibling and a rename.
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load(&self) -> Result<Map<String, Value>, StoreError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    error: e.to_string(),
                })
            }
        };

        if text.trim().is_empty() {
            return Ok(Map::new());
        }

        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(StoreError::Corrupt {
                path: self.path.clone(),
                error: "top-level value is not an object".to_string(),
            }),
            Err(e) => Err(StoreError::Corrupt {
                path: self.path.clone(),
                error: e.to_string(),
            }),
        }
    }

    fn persist(&self, map: &Map<String, Value>) -> Result<(), StoreError> {
        let write_err = |e: std::io::Error| StoreError::Write {
            path: self.path.clone(),
            error: e.to_string(),
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(write_err)?;
            }
        }

        let text = serde_json::to_string_pretty(map).map_err(|e| StoreError::Write {
            path: self.path.clone(),
            error: e.to_string(),
        })?;

        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp).map_err(write_err)?;
            file.write_all(text.as_bytes()).map_err(write_err)?;
            file.sync_all().map_err(write_err)?;
        }
        fs::rename(&tmp, &self.path).map_err(write_err)
    }

    fn update<F>(&self, mutate: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Map<String, Value>) -> bool,
    {
        let _guard = self.guard();
        let mut map = self.load()?;
        if mutate(&mut map) {
            self.persist(&map)?;
        }
        Ok(())
    }
}

impl DurableStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let _guard = self.guard();
        Ok(self.load()?.remove(key))
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.update(|map| {
            map.insert(key.to_string(), value);
            true
        })
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.update(|map| map.remove(key).is_some())
    }

    fn apply(&self, changes: Vec<(&str, Option<Value>)>) -> Result<(), StoreError> {
        self.update(|map| {
            let mut changed = false;
            for (key, value) in changes {
                changed |= match value {
                    Some(value) => {
                        map.insert(key.to_string(), value);
                        true
                    }
                    None => map.remove(key).is_some(),
                };
            }
            changed
        })
    }
}

/// In-memory store for tests and embedders without a state directory.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of keys currently held.
    pub fn len(&self) -> usize {
        self.values().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values().is_empty()
    }
}

impl DurableStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.values().get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.values().insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.values().remove(key);
        Ok(())
    }

    fn apply(&self, changes: Vec<(&str, Option<Value>)>) -> Result<(), StoreError> {
        let mut values = self.values();
        for (key, value) in changes {
            match value {
                Some(value) => values.insert(key.to_string(), value),
                None => values.remove(key),
            };
        }
        Ok(())
    }
}

/// Request details captured before a write-classified operation runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingResult {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub operation: String,

    /// Handler result, filled in once the operation has run.
    #[serde(default)]
    pub result: Option<Value>,
}

/// The durable compilation-await record.
#[derive(Debug, Clone, PartialEq)]
pub struct CompilationRecord {
    pub was_connected_before_compile: bool,

    /// `None` when the stored timestamp is missing or unreadable.
    pub compilation_start_time: Option<DateTime<Utc>>,

    pub pending_result: Option<PendingResult>,
}

impl CompilationRecord {
    /// Creates the record written before a write-classified operation runs.
    pub fn begin(pending: PendingResult, started_at: DateTime<Utc>) -> Self {
        Self {
            was_connected_before_compile: true,
            compilation_start_time: Some(started_at),
            pending_result: Some(pending),
        }
    }

    /// Reads the record. Returns `None` if none of its keys are present.
    pub fn load(store: &dyn DurableStore) -> Result<Option<Self>, StoreError> {
        let was_connected = store.get(KEY_WAS_CONNECTED)?;
        let start_time = store.get(KEY_START_TIME)?;
        let pending = store.get(KEY_PENDING_RESULT)?;

        if was_connected.is_none() && start_time.is_none() && pending.is_none() {
            return Ok(None);
        }

        let compilation_start_time = start_time.as_ref().and_then(Value::as_str).and_then(|s| {
            match DateTime::parse_from_rfc3339(s) {
                Ok(t) => Some(t.with_timezone(&Utc)),
                Err(e) => {
                    warn!(value = %s, error = %e, "Unreadable compilation start time");
                    None
                }
            }
        });

        let pending_result = match pending {
            None | Some(Value::Null) => None,
            Some(value) => match serde_json::from_value::<PendingResult>(value) {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!(error = %e, "Unreadable pending compilation result");
                    None
                }
            },
        };

        Ok(Some(Self {
            was_connected_before_compile: was_connected
                .as_ref()
                .and_then(Value::as_bool)
                .unwrap_or(false),
            compilation_start_time,
            pending_result,
        }))
    }

    /// Writes every key of the record in one store update.
    pub fn save(&self, store: &dyn DurableStore) -> Result<(), StoreError> {
        let pending = match &self.pending_result {
            Some(pending) => Some(serde_json::to_value(pending).map_err(|e| StoreError::Write {
                path: PathBuf::from(KEY_PENDING_RESULT),
                error: e.to_string(),
            })?),
            None => None,
        };

        store.apply(vec![
            (
                KEY_WAS_CONNECTED,
                Some(Value::Bool(self.was_connected_before_compile)),
            ),
            (
                KEY_START_TIME,
                self.compilation_start_time
                    .map(|t| Value::String(t.to_rfc3339())),
            ),
            (KEY_PENDING_RESULT, pending),
        ])
    }

    /// Removes every key of the record in one store update.
    pub fn clear(store: &dyn DurableStore) -> Result<(), StoreError> {
        store.apply(RECORD_KEYS.iter().map(|key| (*key, None)).collect())
    }

    /// Time since the write started. A missing start time counts as
    /// infinitely old so the record resolves as timed out.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        match self.compilation_start_time {
            Some(start) => (now - start).to_std().unwrap_or(Duration::ZERO),
            None => Duration::MAX,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        self.pending_result
            .as_ref()
            .and_then(|p| p.request_id.as_deref())
    }
}
