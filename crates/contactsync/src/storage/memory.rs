use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{AddressBook, ContactStore};
use crate::error::{SyncError, SyncResult};
use crate::model::{ContactRecord, GroupRecord};

/// In-memory address books keyed by scope id.
#[derive(Debug, Default)]
pub struct MemoryContactStore {
    books: Mutex<HashMap<String, AddressBook>>,
    unavailable: AtomicBool,
}

impl MemoryContactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following call fail with [`SyncError::Storage`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Insert a record directly, bypassing availability.
    pub fn seed_contact(&self, scope: &str, record: ContactRecord) -> ContactRecord {
        match self.books.lock() {
            Ok(mut books) => books.entry(scope.to_string()).or_default().upsert_contact(record),
            Err(_) => record,
        }
    }

    pub fn seed_group(&self, scope: &str, group: GroupRecord) -> GroupRecord {
        match self.books.lock() {
            Ok(mut books) => books.entry(scope.to_string()).or_default().upsert_group(group),
            Err(_) => group,
        }
    }

    fn books(&self) -> SyncResult<MutexGuard<'_, HashMap<String, AddressBook>>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SyncError::storage("address book is unavailable"));
        }
        self.books
            .lock()
            .map_err(|_| SyncError::storage("address book lock poisoned"))
    }
}

impl ContactStore for MemoryContactStore {
    fn list_contacts(&self, scope: &str) -> SyncResult<Vec<ContactRecord>> {
        Ok(self
            .books()?
            .get(scope)
            .map(AddressBook::contacts)
            .unwrap_or_default())
    }

    fn list_groups(&self, scope: &str) -> SyncResult<Vec<GroupRecord>> {
        Ok(self
            .books()?
            .get(scope)
            .map(AddressBook::groups)
            .unwrap_or_default())
    }

    fn upsert_contact(&self, scope: &str, record: ContactRecord) -> SyncResult<ContactRecord> {
        Ok(self
            .books()?
            .entry(scope.to_string())
            .or_default()
            .upsert_contact(record))
    }

    fn delete_contacts(&self, scope: &str, records: &[ContactRecord]) -> SyncResult<()> {
        if let Some(book) = self.books()?.get_mut(scope) {
            book.delete_contacts(records);
        }
        Ok(())
    }

    fn upsert_group(&self, scope: &str, group: GroupRecord) -> SyncResult<GroupRecord> {
        Ok(self
            .books()?
            .entry(scope.to_string())
            .or_default()
            .upsert_group(group))
    }

    fn delete_group(&self, scope: &str, group: &GroupRecord) -> SyncResult<()> {
        if let Some(book) = self.books()?.get_mut(scope) {
            book.delete_group(group);
        }
        Ok(())
    }
}
