//! Persistence of per-scope sync state and the operating throttle delay.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::scope::ScopeState;

/// Stores [`ScopeState`] per scope id and the calibrated throttle delay.
pub trait StateStore: Send + Sync {
    fn load_scope_state(&self, scope_id: &str) -> SyncResult<Option<ScopeState>>;

    fn save_scope_state(&self, scope_id: &str, state: &ScopeState) -> SyncResult<()>;

    fn load_throttle_delay(&self) -> SyncResult<Option<u64>>;

    fn save_throttle_delay(&self, delay_ms: u64) -> SyncResult<()>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StateDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    throttle_delay_ms: Option<u64>,
    #[serde(default)]
    scopes: BTreeMap<String, ScopeState>,
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> SyncError {
    SyncError::storage("state store lock poisoned")
}

/// In-memory state, lost on drop.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    doc: Mutex<StateDocument>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn load_scope_state(&self, scope_id: &str) -> SyncResult<Option<ScopeState>> {
        Ok(self.doc.lock().map_err(poisoned)?.scopes.get(scope_id).cloned())
    }

    fn save_scope_state(&self, scope_id: &str, state: &ScopeState) -> SyncResult<()> {
        self.doc
            .lock()
            .map_err(poisoned)?
            .scopes
            .insert(scope_id.to_string(), state.clone());
        Ok(())
    }

    fn load_throttle_delay(&self) -> SyncResult<Option<u64>> {
        Ok(self.doc.lock().map_err(poisoned)?.throttle_delay_ms)
    }

    fn save_throttle_delay(&self, delay_ms: u64) -> SyncResult<()> {
        self.doc.lock().map_err(poisoned)?.throttle_delay_ms = Some(delay_ms);
        Ok(())
    }
}

/// State kept in one JSON document, rewritten on every save.
#[derive(Debug)]
pub struct JsonFileStateStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> SyncResult<StateDocument> {
        if !self.path.exists() {
            return Ok(StateDocument::default());
        }
        let raw = std::fs::read_to_string(&self.path).map_err(|e| {
            SyncError::storage(format!("Failed to read {}: {e}", self.path.display()))
        })?;
        if raw.trim().is_empty() {
            return Ok(StateDocument::default());
        }
        serde_json::from_str(&raw).map_err(|e| {
            SyncError::storage(format!("Corrupt state file {}: {e}", self.path.display()))
        })
    }

    fn write(&self, doc: &StateDocument) -> SyncResult<()> {
        write_json_atomically(&self.path, doc)
    }

    fn update(&self, apply: impl FnOnce(&mut StateDocument)) -> SyncResult<()> {
        let _guard = self.lock.lock().map_err(poisoned)?;
        let mut doc = self.read()?;
        apply(&mut doc);
        self.write(&doc)?;
        debug!(path = %self.path.display(), "State saved");
        Ok(())
    }
}

impl StateStore for JsonFileStateStore {
    fn load_scope_state(&self, scope_id: &str) -> SyncResult<Option<ScopeState>> {
        let _guard = self.lock.lock().map_err(poisoned)?;
        Ok(self.read()?.scopes.remove(scope_id))
    }

    fn save_scope_state(&self, scope_id: &str, state: &ScopeState) -> SyncResult<()> {
        self.update(|doc| {
            doc.scopes.insert(scope_id.to_string(), state.clone());
        })
    }

    fn load_throttle_delay(&self) -> SyncResult<Option<u64>> {
        let _guard = self.lock.lock().map_err(poisoned)?;
        Ok(self.read()?.throttle_delay_ms)
    }

    fn save_throttle_delay(&self, delay_ms: u64) -> SyncResult<()> {
        self.update(|doc| doc.throttle_delay_ms = Some(delay_ms))
    }
}

/// Serialize `value` to a sibling temp file, then rename it over `path`.
pub(crate) fn write_json_atomically<T: Serialize>(path: &Path, value: &T) -> SyncResult<()> {
    let json = serde_json::to_string_pretty(value)?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SyncError::storage(format!("Failed to create {}: {e}", parent.display()))
            })?;
        }
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json)
        .and_then(|()| std::fs::rename(&tmp, path))
        .map_err(|e| SyncError::storage(format!("Failed to write {}: {e}", path.display())))
}
