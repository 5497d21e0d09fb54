//! Bidirectional reconciliation of one scope.
//!
//! A pass runs the groups phase, then the contacts phase. Each phase fetches
//! both replicas, classifies every record with [`plan::plan`] and applies the
//! resulting actions in order.

mod engine;
pub mod groups;
pub mod plan;

pub use engine::Reconciler;
pub use groups::GroupIndex;
pub use plan::{Action, IgnoreReason, Plan, PlanContext, Side, Syncable};

use serde::Serialize;
use std::fmt;

use crate::error::SyncError;
use crate::scope::ScopeState;
use crate::summary::ScopeSummary;

/// Step of the per-scope state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum SyncPhase {
    #[default]
    Idle,
    FetchingRemote,
    FetchingLocal,
    Diffing,
    Applying,
    AwaitingAuthRefresh,
    Summarizing,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncPhase::Idle => "idle",
            SyncPhase::FetchingRemote => "fetching_remote",
            SyncPhase::FetchingLocal => "fetching_local",
            SyncPhase::Diffing => "diffing",
            SyncPhase::Applying => "applying",
            SyncPhase::AwaitingAuthRefresh => "awaiting_auth_refresh",
            SyncPhase::Summarizing => "summarizing",
        };
        f.write_str(name)
    }
}

/// Record kind a phase works on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum RecordKind {
    Groups,
    #[default]
    Contacts,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecordKind::Groups => "groups",
            RecordKind::Contacts => "contacts",
        })
    }
}

/// Position of a pass: the page start index while fetching, the action
/// index while applying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PassCursor {
    pub kind: RecordKind,
    pub phase: SyncPhase,
    pub index: usize,
}

/// How a scope pass ended.
#[derive(Debug)]
pub enum PassStatus {
    /// Every action applied; state advanced.
    Completed,
    /// Finished, but some mutations were postponed by a 503. State unchanged.
    Deferred,
    /// Transport failure or a rate-limited fetch; the next scheduled pass retries.
    Interrupted(SyncError),
    Cancelled,
    /// Auth exhaustion, storage failure or another error ending the pass.
    Failed(SyncError),
}

impl PassStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, PassStatus::Completed)
    }

    pub fn error(&self) -> Option<&SyncError> {
        match self {
            PassStatus::Interrupted(e) | PassStatus::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Result of reconciling one scope.
#[derive(Debug)]
pub struct ScopeOutcome {
    pub scope_id: String,
    pub account: String,
    pub summary: ScopeSummary,
    pub status: PassStatus,
    /// Where the pass stopped.
    pub cursor: PassCursor,
    /// State to persist; `Some` only for a completed pass.
    pub next_state: Option<ScopeState>,
}

impl ScopeOutcome {
    /// Outcome of a scope whose pass could not start.
    pub(crate) fn failed(scope: &crate::scope::SyncScope, err: SyncError) -> Self {
        Self {
            scope_id: scope.id.clone(),
            account: scope.account.clone(),
            summary: ScopeSummary::default(),
            status: PassStatus::Failed(err),
            cursor: PassCursor::default(),
            next_state: None,
        }
    }
}
