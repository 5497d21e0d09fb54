//! Group id translation between the two replicas.

use std::collections::{BTreeSet, HashMap};

use crate::model::{GroupRecord, RemoteId};

/// Maps local group ids to remote group ids, built after the groups phase.
#[derive(Debug, Clone, Default)]
pub struct GroupIndex {
    local_to_remote: HashMap<String, RemoteId>,
    remote_to_local: HashMap<RemoteId, String>,
}

impl GroupIndex {
    /// Index every local group that is linked to a remote one.
    pub fn from_local(groups: &[GroupRecord]) -> Self {
        let mut index = Self::default();
        for group in groups {
            if let (Some(local), Some(remote)) = (&group.local_id, &group.remote_id) {
                index.insert(local.clone(), remote.clone());
            }
        }
        index
    }

    pub fn insert(&mut self, local_id: String, remote_id: RemoteId) {
        self.remote_to_local.insert(remote_id.clone(), local_id.clone());
        self.local_to_remote.insert(local_id, remote_id);
    }

    pub fn remote_for(&self, local_id: &str) -> Option<&RemoteId> {
        self.local_to_remote.get(local_id)
    }

    pub fn local_for(&self, remote_id: &RemoteId) -> Option<&str> {
        self.remote_to_local.get(remote_id).map(String::as_str)
    }

    /// Local membership set in remote ids. Unlinked groups are dropped.
    pub fn to_remote(&self, local_groups: &BTreeSet<String>) -> BTreeSet<String> {
        local_groups
            .iter()
            .filter_map(|g| self.remote_for(g))
            .map(|id| id.as_str().to_string())
            .collect()
    }

    /// Remote membership set in local ids. Unlinked groups are dropped.
    pub fn to_local(&self, remote_groups: &BTreeSet<String>) -> BTreeSet<String> {
        remote_groups
            .iter()
            .filter_map(|g| self.local_for(&RemoteId::new(g)))
            .map(str::to_string)
            .collect()
    }

    /// Remote memberships restricted to groups this index knows about.
    pub fn linked_remote(&self, remote_groups: &BTreeSet<String>) -> BTreeSet<String> {
        remote_groups
            .iter()
            .filter(|g| self.remote_to_local.contains_key(&RemoteId::new(g.as_str())))
            .cloned()
            .collect()
    }
}

/// Value comparison for a group pair.
pub(crate) fn group_differs(local: &GroupRecord, remote: &GroupRecord) -> bool {
    local.name != remote.name || local.system_group != remote.system_group
}

/// Find a user group by name, ignoring case.
pub(crate) fn find_by_name<'a>(groups: &'a [GroupRecord], name: &str) -> Option<&'a GroupRecord> {
    groups
        .iter()
        .find(|g| !g.is_system() && g.name.eq_ignore_ascii_case(name.trim()))
}
