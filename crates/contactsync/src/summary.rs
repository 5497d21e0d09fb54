//! Outcome counters for reconciliation passes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Actions applied to the local replica.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalCounts {
    pub added: u32,
    pub removed: u32,
    pub updated: u32,
    pub conflicted: u32,
    pub ignored: u32,
}

impl LocalCounts {
    pub fn merge(&mut self, other: &LocalCounts) {
        self.added += other.added;
        self.removed += other.removed;
        self.updated += other.updated;
        self.conflicted += other.conflicted;
        self.ignored += other.ignored;
    }
}

/// Actions applied to the remote replica.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCounts {
    pub added: u32,
    pub removed: u32,
    pub updated: u32,
    pub ignored: u32,
}

impl RemoteCounts {
    pub fn merge(&mut self, other: &RemoteCounts) {
        self.added += other.added;
        self.removed += other.removed;
        self.updated += other.updated;
        self.ignored += other.ignored;
    }
}

/// Counts for one record kind in one pass. Counters only ever grow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummaryData {
    pub local: LocalCounts,
    pub remote: RemoteCounts,
    pub not_changed: u32,
    pub conflicted: u32,
    /// Mutations postponed to the next pass after a 503.
    pub deferred: u32,
}

impl SyncSummaryData {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add another summary into this one.
    pub fn merge(&mut self, other: &SyncSummaryData) {
        self.local.merge(&other.local);
        self.remote.merge(&other.remote);
        self.not_changed += other.not_changed;
        self.conflicted += other.conflicted;
        self.deferred += other.deferred;
    }

    /// Total number of mutations applied on either side.
    #[must_use]
    pub fn changes(&self) -> u32 {
        self.local.added
            + self.local.removed
            + self.local.updated
            + self.remote.added
            + self.remote.removed
            + self.remote.updated
    }
}

impl fmt::Display for SyncSummaryData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "local +{} -{} ~{} !{} ?{} | remote +{} -{} ~{} ?{} | unchanged {} conflicts {} deferred {}",
            self.local.added,
            self.local.removed,
            self.local.updated,
            self.local.conflicted,
            self.local.ignored,
            self.remote.added,
            self.remote.removed,
            self.remote.updated,
            self.remote.ignored,
            self.not_changed,
            self.conflicted,
            self.deferred,
        )
    }
}

/// Summary of one scope pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeSummary {
    pub contacts: SyncSummaryData,
    pub groups: SyncSummaryData,
}

impl ScopeSummary {
    pub fn merge(&mut self, other: &ScopeSummary) {
        self.contacts.merge(&other.contacts);
        self.groups.merge(&other.groups);
    }
}
