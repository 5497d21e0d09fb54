use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

use super::{AddressBook, ContactStore};
use crate::error::{SyncError, SyncResult};
use crate::model::{ContactRecord, GroupRecord};
use crate::state::write_json_atomically;

/// Address books kept in one JSON document, keyed by scope id.
#[derive(Debug)]
pub struct JsonFileContactStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileContactStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> SyncResult<BTreeMap<String, AddressBook>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let raw = std::fs::read_to_string(&self.path).map_err(|e| {
            SyncError::storage(format!("Failed to read {}: {e}", self.path.display()))
        })?;
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&raw).map_err(|e| {
            SyncError::storage(format!("Corrupt address book {}: {e}", self.path.display()))
        })
    }

    fn with_book<T>(&self, scope: &str, apply: impl FnOnce(&mut AddressBook) -> T) -> SyncResult<T> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| SyncError::storage("address book lock poisoned"))?;
        let mut books = self.read()?;
        let result = apply(books.entry(scope.to_string()).or_default());
        write_json_atomically(&self.path, &books)?;
        debug!(path = %self.path.display(), scope, "Address book saved");
        Ok(result)
    }

    fn snapshot(&self, scope: &str) -> SyncResult<AddressBook> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| SyncError::storage("address book lock poisoned"))?;
        Ok(self.read()?.remove(scope).unwrap_or_default())
    }
}

impl ContactStore for JsonFileContactStore {
    fn list_contacts(&self, scope: &str) -> SyncResult<Vec<ContactRecord>> {
        Ok(self.snapshot(scope)?.contacts())
    }

    fn list_groups(&self, scope: &str) -> SyncResult<Vec<GroupRecord>> {
        Ok(self.snapshot(scope)?.groups())
    }

    fn upsert_contact(&self, scope: &str, record: ContactRecord) -> SyncResult<ContactRecord> {
        self.with_book(scope, |book| book.upsert_contact(record))
    }

    fn delete_contacts(&self, scope: &str, records: &[ContactRecord]) -> SyncResult<()> {
        self.with_book(scope, |book| book.delete_contacts(records))
    }

    fn upsert_group(&self, scope: &str, group: GroupRecord) -> SyncResult<GroupRecord> {
        self.with_book(scope, |book| book.upsert_group(group))
    }

    fn delete_group(&self, scope: &str, group: &GroupRecord) -> SyncResult<()> {
        self.with_book(scope, |book| book.delete_group(group))
    }
}
