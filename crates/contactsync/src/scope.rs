//! Sync scopes: one account paired with one local contact store.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{SyncError, SyncResult};
use crate::model::{RemoteId, Timestamp};

/// Per-scope policy flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopePolicy {
    /// Fetch only; never mutate the remote side.
    pub read_only: bool,
    /// Push only; never mutate the local side.
    pub write_only: bool,
    /// Conflict tie-break direction.
    pub prefer_remote_on_conflict: bool,
    pub sync_groups_enabled: bool,
    /// Restrict the pass to members of one remote group.
    pub scoped_group_name: Option<String>,
}

impl ScopePolicy {
    /// Validates the policy.
    pub fn validate(&self) -> SyncResult<()> {
        if self.read_only && self.write_only {
            return Err(SyncError::config(
                "read_only and write_only are mutually exclusive",
            ));
        }
        if let Some(name) = &self.scoped_group_name {
            if name.trim().is_empty() {
                return Err(SyncError::config("scoped_group_name must not be empty"));
            }
        }
        Ok(())
    }

    /// Whether conflicts can arise at all.
    #[must_use]
    pub fn is_bidirectional(&self) -> bool {
        !self.read_only && !self.write_only
    }
}

/// Persisted bookkeeping of the last consistent pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeState {
    pub last_sync_timestamp: Timestamp,
    /// Set after a destructive reset; suppresses deletion detection until cleared.
    pub reset_flag: bool,
    /// Remote ids of contacts linked after the previous pass.
    pub known_contact_ids: BTreeSet<RemoteId>,
    /// Remote ids of groups linked after the previous pass.
    pub known_group_ids: BTreeSet<RemoteId>,
}

impl ScopeState {
    /// State marking a destructive reset: deletions are not propagated until a pass completes.
    #[must_use]
    pub fn reset() -> Self {
        Self {
            reset_flag: true,
            ..Self::default()
        }
    }
}

/// One (account, local store) pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncScope {
    pub id: String,
    pub account: String,
    #[serde(default)]
    pub policy: ScopePolicy,
    #[serde(default)]
    pub state: ScopeState,
}

impl SyncScope {
    pub fn new(id: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            account: account.into(),
            policy: ScopePolicy::default(),
            state: ScopeState::default(),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: ScopePolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_state(mut self, state: ScopeState) -> Self {
        self.state = state;
        self
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.account.trim().is_empty() {
            return Err(SyncError::config(format!(
                "scope '{}' has no account",
                self.id
            )));
        }
        self.policy.validate()
    }
}

/// Which scopes a pass covers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ScopeFilter {
    #[default]
    All,
    /// Only the scopes with these ids.
    Scopes(BTreeSet<String>),
    /// Only the scopes of one account.
    Account(String),
}

impl ScopeFilter {
    pub fn scope(id: impl Into<String>) -> Self {
        ScopeFilter::Scopes(BTreeSet::from([id.into()]))
    }

    #[must_use]
    pub fn matches(&self, scope: &SyncScope) -> bool {
        match self {
            ScopeFilter::All => true,
            ScopeFilter::Scopes(ids) => ids.contains(&scope.id),
            ScopeFilter::Account(account) => account.eq_ignore_ascii_case(&scope.account),
        }
    }
}
