//! Pure classification of one record kind into actions.
//!
//! Nothing here talks to the network or the store; the engine applies the
//! resulting [`Plan`] in order.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::config::SyncSettings;
use crate::model::{ContactRecord, GroupRecord, RemoteId, Timestamp};
use crate::scope::SyncScope;

/// Replica a count or an action applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    ReadOnly,
    WriteOnly,
    /// The remote schema cannot hold the record.
    NotRepresentable,
    /// A second local record claims an already-paired remote id.
    DuplicateRemoteId,
    /// System groups are never renamed or deleted remotely.
    SystemGroup,
    /// The remote entry was fetched but could not be decoded.
    Unreadable,
}

/// What to do with one record. Indices refer to the slices given to [`plan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    NotChanged {
        local: usize,
        id: RemoteId,
    },
    /// Push the local record over its remote counterpart. `remote` is `None`
    /// when the remote side was not fetched.
    UpdateRemote {
        local: usize,
        remote: Option<usize>,
        conflict: bool,
    },
    UpdateLocal {
        local: usize,
        remote: usize,
        conflict: bool,
    },
    CreateRemote {
        local: usize,
    },
    CreateLocal {
        remote: usize,
    },
    /// The remote replica disappeared since the last pass.
    DeleteLocal {
        local: usize,
    },
    /// The local replica disappeared since the last pass.
    DeleteRemote {
        id: RemoteId,
        remote: Option<usize>,
    },
    Ignore {
        side: Side,
        reason: IgnoreReason,
        /// Remote id of a pair that stays linked even though nothing is written.
        linked: Option<RemoteId>,
    },
}

/// Ordered actions for one record kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub actions: Vec<Action>,
}

impl Plan {
    /// Number of actions that issue a request or a store write.
    pub fn mutation_count(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| !matches!(a, Action::NotChanged { .. } | Action::Ignore { .. }))
            .count()
    }
}

/// Record behavior the planner needs.
pub trait Syncable {
    fn remote_id(&self) -> Option<&RemoteId>;
    fn last_modified(&self) -> Timestamp;
    fn representable(&self) -> bool {
        true
    }
    /// Protected records are never changed or deleted remotely.
    fn protected(&self) -> bool {
        false
    }
}

impl Syncable for ContactRecord {
    fn remote_id(&self) -> Option<&RemoteId> {
        self.remote_id.as_ref()
    }

    fn last_modified(&self) -> Timestamp {
        self.last_modified
    }

    fn representable(&self) -> bool {
        self.is_representable()
    }
}

impl Syncable for GroupRecord {
    fn remote_id(&self) -> Option<&RemoteId> {
        self.remote_id.as_ref()
    }

    fn last_modified(&self) -> Timestamp {
        self.last_modified
    }

    fn representable(&self) -> bool {
        !self.name.trim().is_empty()
    }

    fn protected(&self) -> bool {
        self.is_system()
    }
}

/// Policy and bookkeeping that drive classification.
#[derive(Debug, Clone, Default)]
pub struct PlanContext {
    pub read_only: bool,
    pub write_only: bool,
    pub prefer_remote_on_conflict: bool,
    pub last_sync: Timestamp,
    pub tolerance_secs: i64,
    /// Deletion detection is off while set.
    pub reset: bool,
    /// Remote ids whose entries were fetched but could not be decoded.
    pub unreadable: BTreeSet<RemoteId>,
    /// A fetched entry could not even be identified, so absence from the
    /// remote view proves nothing.
    pub remote_view_partial: bool,
}

impl PlanContext {
    pub fn for_scope(scope: &SyncScope, settings: &SyncSettings) -> Self {
        Self {
            read_only: scope.policy.read_only,
            write_only: scope.policy.write_only,
            prefer_remote_on_conflict: scope.policy.prefer_remote_on_conflict,
            last_sync: scope.state.last_sync_timestamp,
            tolerance_secs: settings.timestamp_tolerance_secs,
            reset: scope.state.reset_flag,
            unreadable: BTreeSet::new(),
            remote_view_partial: false,
        }
    }

    fn bidirectional(&self) -> bool {
        !self.read_only && !self.write_only
    }
}

/// Classify every record.
///
/// `remotes` is `None` when the remote side was not fetched; `known` then
/// stands in for the remote view. `differs` compares the values of a pair.
pub fn plan<L, R>(
    locals: &[L],
    remotes: Option<&[R]>,
    known: &BTreeSet<RemoteId>,
    ctx: &PlanContext,
    differs: impl Fn(&L, &R) -> bool,
) -> Plan
where
    L: Syncable,
    R: Syncable,
{
    let mut actions = Vec::with_capacity(locals.len());

    let Some(remotes) = remotes else {
        return plan_unfetched(locals, known, ctx);
    };

    let index: HashMap<&RemoteId, usize> = remotes
        .iter()
        .enumerate()
        .filter_map(|(i, r)| r.remote_id().map(|id| (id, i)))
        .collect();
    let mut paired: HashSet<usize> = HashSet::new();

    for (li, local) in locals.iter().enumerate() {
        let Some(id) = local.remote_id() else {
            actions.push(local_only(li, local, ctx));
            continue;
        };

        match index.get(id) {
            Some(&ri) if paired.contains(&ri) => actions.push(Action::Ignore {
                side: Side::Local,
                reason: IgnoreReason::DuplicateRemoteId,
                linked: None,
            }),
            Some(&ri) => {
                paired.insert(ri);
                actions.push(classify_pair(li, local, ri, &remotes[ri], ctx, &differs));
            }
            // The remote copy may exist; never delete or recreate it blind.
            None if ctx.unreadable.contains(id) || ctx.remote_view_partial => {
                actions.push(Action::Ignore {
                    side: Side::Local,
                    reason: IgnoreReason::Unreadable,
                    linked: (ctx.unreadable.contains(id) || known.contains(id)).then(|| id.clone()),
                });
            }
            None if known.contains(id) && !ctx.reset => {
                actions.push(if ctx.write_only {
                    ignore(Side::Local, IgnoreReason::WriteOnly)
                } else {
                    Action::DeleteLocal { local: li }
                });
            }
            // Stale or never-confirmed id: the remote copy does not exist.
            None => actions.push(local_only(li, local, ctx)),
        }
    }

    for (ri, remote) in remotes.iter().enumerate() {
        if paired.contains(&ri) {
            continue;
        }
        let Some(id) = remote.remote_id() else {
            continue;
        };
        if known.contains(id) && !ctx.reset {
            actions.push(if ctx.read_only {
                ignore(Side::Remote, IgnoreReason::ReadOnly)
            } else if remote.protected() {
                ignore(Side::Remote, IgnoreReason::SystemGroup)
            } else {
                Action::DeleteRemote {
                    id: id.clone(),
                    remote: Some(ri),
                }
            });
        } else if ctx.write_only {
            actions.push(ignore(Side::Local, IgnoreReason::WriteOnly));
        } else {
            actions.push(Action::CreateLocal { remote: ri });
        }
    }

    Plan { actions }
}

/// Write-only classification: the known set is the remote view.
///
/// Nothing was fetched, so a local record carrying a remote id is treated as
/// linked even when the id is not in the known set.
fn plan_unfetched<L: Syncable>(locals: &[L], known: &BTreeSet<RemoteId>, ctx: &PlanContext) -> Plan {
    let mut actions = Vec::with_capacity(locals.len());
    let mut claimed: HashSet<&RemoteId> = HashSet::new();

    for (li, local) in locals.iter().enumerate() {
        match local.remote_id() {
            Some(id) => {
                if !claimed.insert(id) {
                    actions.push(ignore(Side::Local, IgnoreReason::DuplicateRemoteId));
                } else if local.last_modified() > ctx.last_sync {
                    actions.push(if ctx.read_only {
                        linked_ignore(Side::Remote, IgnoreReason::ReadOnly, id)
                    } else if !local.representable() {
                        linked_ignore(Side::Remote, IgnoreReason::NotRepresentable, id)
                    } else {
                        Action::UpdateRemote {
                            local: li,
                            remote: None,
                            conflict: false,
                        }
                    });
                } else {
                    actions.push(Action::NotChanged {
                        local: li,
                        id: id.clone(),
                    });
                }
            }
            None => actions.push(local_only(li, local, ctx)),
        }
    }

    if !ctx.reset {
        for id in known.iter().filter(|id| !claimed.contains(id)) {
            actions.push(if ctx.read_only {
                ignore(Side::Remote, IgnoreReason::ReadOnly)
            } else {
                Action::DeleteRemote {
                    id: id.clone(),
                    remote: None,
                }
            });
        }
    }

    Plan { actions }
}

fn ignore(side: Side, reason: IgnoreReason) -> Action {
    Action::Ignore {
        side,
        reason,
        linked: None,
    }
}

fn linked_ignore(side: Side, reason: IgnoreReason, id: &RemoteId) -> Action {
    Action::Ignore {
        side,
        reason,
        linked: Some(id.clone()),
    }
}

fn local_only<L: Syncable>(li: usize, local: &L, ctx: &PlanContext) -> Action {
    if ctx.read_only {
        ignore(Side::Remote, IgnoreReason::ReadOnly)
    } else if !local.representable() {
        ignore(Side::Remote, IgnoreReason::NotRepresentable)
    } else {
        Action::CreateRemote { local: li }
    }
}

fn classify_pair<L, R>(
    li: usize,
    local: &L,
    ri: usize,
    remote: &R,
    ctx: &PlanContext,
    differs: &impl Fn(&L, &R) -> bool,
) -> Action
where
    L: Syncable,
    R: Syncable,
{
    // Both sides carry the same id once paired.
    let id = local
        .remote_id()
        .cloned()
        .unwrap_or_else(|| RemoteId::new(""));
    let (lm, rm) = (local.last_modified(), remote.last_modified());

    if (lm - rm).abs() <= ctx.tolerance_secs {
        return Action::NotChanged { local: li, id };
    }

    let conflict = ctx.bidirectional()
        && lm > ctx.last_sync
        && rm > ctx.last_sync
        && differs(local, remote);

    let push_local = if conflict {
        !ctx.prefer_remote_on_conflict
    } else {
        lm > rm
    };

    if push_local {
        if ctx.read_only {
            linked_ignore(Side::Remote, IgnoreReason::ReadOnly, &id)
        } else if remote.protected() {
            linked_ignore(Side::Remote, IgnoreReason::SystemGroup, &id)
        } else if !local.representable() {
            linked_ignore(Side::Remote, IgnoreReason::NotRepresentable, &id)
        } else {
            Action::UpdateRemote {
                local: li,
                remote: Some(ri),
                conflict,
            }
        }
    } else if ctx.write_only {
        linked_ignore(Side::Local, IgnoreReason::WriteOnly, &id)
    } else {
        Action::UpdateLocal {
            local: li,
            remote: ri,
            conflict,
        }
    }
}
