//! Local address-book storage consumed by the reconciler.

mod json_file;
mod memory;

pub use json_file::JsonFileContactStore;
pub use memory::MemoryContactStore;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::SyncResult;
use crate::model::{ContactRecord, GroupRecord};

/// Local address book, addressed by scope id.
///
/// Every error is fatal for the pass of that scope.
pub trait ContactStore: Send + Sync {
    fn list_contacts(&self, scope: &str) -> SyncResult<Vec<ContactRecord>>;

    fn list_groups(&self, scope: &str) -> SyncResult<Vec<GroupRecord>>;

    /// Insert or replace a contact. A record without `local_id` gets one assigned.
    fn upsert_contact(&self, scope: &str, record: ContactRecord) -> SyncResult<ContactRecord>;

    fn delete_contacts(&self, scope: &str, records: &[ContactRecord]) -> SyncResult<()>;

    /// Insert or replace a group. A group without `local_id` gets one assigned.
    fn upsert_group(&self, scope: &str, group: GroupRecord) -> SyncResult<GroupRecord>;

    fn delete_group(&self, scope: &str, group: &GroupRecord) -> SyncResult<()>;
}

/// Contents of one scope's address book.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct AddressBook {
    #[serde(default)]
    contacts: BTreeMap<String, ContactRecord>,
    #[serde(default)]
    groups: BTreeMap<String, GroupRecord>,
    #[serde(default)]
    next_id: u64,
}

impl AddressBook {
    fn allocate(&mut self, prefix: char) -> String {
        self.next_id += 1;
        format!("{prefix}{}", self.next_id)
    }

    pub(crate) fn contacts(&self) -> Vec<ContactRecord> {
        self.contacts.values().cloned().collect()
    }

    pub(crate) fn groups(&self) -> Vec<GroupRecord> {
        self.groups.values().cloned().collect()
    }

    pub(crate) fn upsert_contact(&mut self, mut record: ContactRecord) -> ContactRecord {
        let id = match record.local_id.clone() {
            Some(id) => id,
            None => {
                let id = self.allocate('c');
                record.local_id = Some(id.clone());
                id
            }
        };
        self.contacts.insert(id, record.clone());
        record
    }

    pub(crate) fn delete_contacts(&mut self, records: &[ContactRecord]) {
        for id in records.iter().filter_map(|r| r.local_id.as_ref()) {
            self.contacts.remove(id);
        }
    }

    pub(crate) fn upsert_group(&mut self, mut group: GroupRecord) -> GroupRecord {
        let id = match group.local_id.clone() {
            Some(id) => id,
            None => {
                let id = self.allocate('g');
                group.local_id = Some(id.clone());
                id
            }
        };
        self.groups.insert(id, group.clone());
        group
    }

    /// Remove the group and every membership pointing at it.
    pub(crate) fn delete_group(&mut self, group: &GroupRecord) {
        if let Some(id) = &group.local_id {
            self.groups.remove(id);
            for contact in self.contacts.values_mut() {
                contact.groups.remove(id);
            }
        }
    }
}
