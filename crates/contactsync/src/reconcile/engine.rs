//! Applies plans against both replicas for one scope.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use super::groups::{find_by_name, group_differs, GroupIndex};
use super::plan::{plan, Action, PlanContext, Side, Syncable};
use super::{PassCursor, PassStatus, RecordKind, ScopeOutcome, SyncPhase};
use crate::atom::{self, Feed, UnreadableEntry};
use crate::auth::AuthSessionManager;
use crate::client::{HttpReply, RequestEngine};
use crate::config::SyncSettings;
use crate::error::{SyncError, SyncResult};
use crate::model::{ContactRecord, GroupRecord, RemoteId};
use crate::request::{RequestDescriptor, RequestFactory};
use crate::scope::{ScopeState, SyncScope};
use crate::secret::Secret;
use crate::session::SyncContext;
use crate::storage::ContactStore;
use crate::summary::{ScopeSummary, SyncSummaryData};

/// A delete answered with 404 already reached its goal.
const NOT_FOUND: u16 = 404;

/// Reconciles scopes against the remote service and a local store.
pub struct Reconciler {
    engine: Arc<RequestEngine>,
    auth: Arc<AuthSessionManager>,
    factory: RequestFactory,
    store: Arc<dyn ContactStore>,
    settings: SyncSettings,
}

impl Reconciler {
    pub fn new(
        engine: Arc<RequestEngine>,
        auth: Arc<AuthSessionManager>,
        factory: RequestFactory,
        store: Arc<dyn ContactStore>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            engine,
            auth,
            factory,
            store,
            settings,
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Run one pass over `scope`. Never fails: the outcome carries the status
    /// and, for a completed pass, the state to persist.
    #[instrument(skip(self, scope, ctx), fields(scope = %scope.id, account = %scope.account))]
    pub async fn reconcile(&self, scope: &SyncScope, ctx: &SyncContext) -> ScopeOutcome {
        let mut pass = Pass::new(self, scope, ctx);
        let result = pass.run().await;
        pass.finish(result)
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("factory", &self.factory)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Result of one mutating request.
enum Mutation {
    Applied(HttpReply),
    /// 503; retried by a later pass.
    Deferred,
    /// The remote refused the entry itself.
    Rejected(u16),
}

enum ScopedGroup {
    Unscoped,
    Resolved(RemoteId),
    /// Absent and the scope may not create it.
    Missing,
    /// Creation was rate limited.
    Deferred,
}

/// Membership translation for contact writes.
struct ContactViews<'g> {
    index: &'g GroupIndex,
    groups_enabled: bool,
    scoped: Option<&'g RemoteId>,
}

impl ContactViews<'_> {
    /// The local record as it should be written remotely.
    fn remote_view(&self, local: &ContactRecord, remote: Option<&ContactRecord>) -> ContactRecord {
        let mut groups = if self.groups_enabled {
            self.index.to_remote(&local.groups)
        } else {
            BTreeSet::new()
        };
        // Memberships this side does not manage are carried over.
        if let Some(remote) = remote {
            let linked = self.index.linked_remote(&remote.groups);
            groups.extend(
                remote
                    .groups
                    .iter()
                    .filter(|g| !self.groups_enabled || !linked.contains(*g))
                    .cloned(),
            );
        }
        if let Some(id) = self.scoped {
            groups.insert(id.as_str().to_string());
        }

        ContactRecord {
            local_id: None,
            remote_id: local.remote_id.clone(),
            fields: local.fields.clone(),
            groups,
            last_modified: local.last_modified,
        }
    }

    /// The remote record as it should be stored locally.
    fn local_view(&self, remote: &ContactRecord, local: Option<&ContactRecord>) -> ContactRecord {
        let mut groups = if self.groups_enabled {
            self.index.to_local(&remote.groups)
        } else {
            BTreeSet::new()
        };
        if let Some(local) = local {
            groups.extend(
                local
                    .groups
                    .iter()
                    .filter(|g| !self.groups_enabled || self.index.remote_for(g).is_none())
                    .cloned(),
            );
        }

        ContactRecord {
            local_id: local.and_then(|l| l.local_id.clone()),
            remote_id: remote.remote_id.clone(),
            fields: remote.fields.clone(),
            groups,
            last_modified: remote.last_modified,
        }
    }
}

struct Pass<'a> {
    reconciler: &'a Reconciler,
    scope: &'a SyncScope,
    ctx: &'a SyncContext,
    plan_ctx: PlanContext,
    cursor: PassCursor,
    token: Option<Secret>,
    summary: ScopeSummary,
    linked_contacts: BTreeSet<RemoteId>,
    linked_groups: BTreeSet<RemoteId>,
}

impl<'a> Pass<'a> {
    fn new(reconciler: &'a Reconciler, scope: &'a SyncScope, ctx: &'a SyncContext) -> Self {
        Self {
            reconciler,
            scope,
            ctx,
            plan_ctx: PlanContext::for_scope(scope, &reconciler.settings),
            cursor: PassCursor::default(),
            token: None,
            summary: ScopeSummary::default(),
            linked_contacts: BTreeSet::new(),
            linked_groups: BTreeSet::new(),
        }
    }

    async fn run(&mut self) -> SyncResult<()> {
        self.scope.validate()?;
        self.ctx.check_cancelled()?;

        let (index, local_groups) = if self.scope.policy.sync_groups_enabled {
            self.sync_groups().await?
        } else {
            (GroupIndex::default(), Vec::new())
        };
        self.sync_contacts(&index, &local_groups).await
    }

    fn enter(&mut self, phase: SyncPhase) {
        if self.cursor.phase != phase {
            debug!(
                kind = %self.cursor.kind,
                from = %self.cursor.phase,
                to = %phase,
                "Phase transition"
            );
            self.cursor.phase = phase;
        }
    }

    async fn token(&mut self) -> SyncResult<Secret> {
        if let Some(token) = &self.token {
            return Ok(token.clone());
        }
        let token = self.reconciler.auth.get_token(&self.scope.account).await?;
        self.token = Some(token.clone());
        Ok(token)
    }

    async fn refresh_after(&mut self, status: u16) -> SyncResult<()> {
        let resume = self.cursor.phase;
        warn!(status, kind = %self.cursor.kind, index = self.cursor.index, "Authorization rejected");
        self.enter(SyncPhase::AwaitingAuthRefresh);
        self.token = None;
        let token = self.reconciler.auth.refresh(&self.scope.account).await?;
        self.token = Some(token);
        self.enter(resume);
        info!(kind = %self.cursor.kind, index = self.cursor.index, "Resuming after token refresh");
        Ok(())
    }

    /// Send one request, refreshing once and retrying the same step on an
    /// authorization failure.
    async fn call<F>(&mut self, build: F) -> SyncResult<HttpReply>
    where
        F: Fn(&Secret) -> SyncResult<RequestDescriptor>,
    {
        let mut refreshed = false;
        loop {
            let token = self.token().await?;
            let descriptor = build(&token)?;
            let outcome = self.reconciler.engine.send(&descriptor).await;
            match outcome.into_result(&self.scope.account) {
                Err(SyncError::Unauthorized { status, .. }) if !refreshed => {
                    refreshed = true;
                    self.refresh_after(status).await?;
                }
                result => return result,
            }
        }
    }

    async fn mutate<F>(&mut self, build: F) -> SyncResult<Mutation>
    where
        F: Fn(&Secret) -> SyncResult<RequestDescriptor>,
    {
        match self.call(build).await {
            Ok(reply) => Ok(Mutation::Applied(reply)),
            Err(SyncError::RateLimited) => Ok(Mutation::Deferred),
            Err(SyncError::Remote { status, .. }) => Ok(Mutation::Rejected(status)),
            // A 400 that survives a fresh token is a rejected entry.
            Err(SyncError::Unauthorized { status: 400, .. }) => Ok(Mutation::Rejected(400)),
            Err(err) => Err(err),
        }
    }

    /// Fetch every page until a short one.
    async fn fetch_pages<T>(
        &mut self,
        build: impl Fn(&Secret, u32, u32) -> SyncResult<RequestDescriptor>,
        parse: fn(&str) -> SyncResult<Feed<T>>,
    ) -> SyncResult<Feed<T>> {
        let page_size = self.reconciler.settings.page_size;
        let mut start = 1u32;
        let mut feed = Feed::default();
        loop {
            self.ctx.check_cancelled()?;
            self.cursor.index = start as usize;
            let reply = self.call(|token| build(token, start, page_size)).await?;
            let page = parse(&reply.body)?;
            let received = page.entries;
            feed.extend(page);
            debug!(kind = %self.cursor.kind, start, received, "Fetched page");
            if received < page_size as usize {
                break;
            }
            start += page_size;
        }
        Ok(feed)
    }

    /// Hand the undecodable entries of a fetch to the planner. Entries no
    /// local record is linked to are counted as ignored here.
    fn note_unreadable<L: Syncable>(&mut self, unreadable: &[UnreadableEntry], locals: &[L]) {
        let claimed: BTreeSet<&RemoteId> = locals.iter().filter_map(|l| l.remote_id()).collect();
        let state = &self.scope.state;
        let (known, data, linked) = match self.cursor.kind {
            RecordKind::Groups => (
                &state.known_group_ids,
                &mut self.summary.groups,
                &mut self.linked_groups,
            ),
            RecordKind::Contacts => (
                &state.known_contact_ids,
                &mut self.summary.contacts,
                &mut self.linked_contacts,
            ),
        };
        self.plan_ctx.unreadable.clear();
        self.plan_ctx.remote_view_partial = false;

        for entry in unreadable {
            warn!(
                kind = %self.cursor.kind,
                entry = entry.id.as_ref().map(RemoteId::as_str),
                reason = %entry.reason,
                "Skipping unreadable remote entry"
            );
            match &entry.id {
                Some(id) => {
                    self.plan_ctx.unreadable.insert(id.clone());
                    if claimed.contains(id) {
                        continue;
                    }
                    if known.contains(id) {
                        linked.insert(id.clone());
                    }
                }
                None => self.plan_ctx.remote_view_partial = true,
            }
            data.local.ignored += 1;
        }
    }

    /// Decode the entry an update returned, re-reading it when the reply
    /// body is unusable.
    async fn confirmed_entry<T>(
        &mut self,
        id: &RemoteId,
        body: &str,
        parse: fn(&str) -> SyncResult<T>,
    ) -> SyncResult<T> {
        let err = match parse(body) {
            Ok(entry) => return Ok(entry),
            Err(err) => err,
        };
        warn!(entry = %id, error = %err, "Unreadable update reply, re-reading the entry");
        let reconciler = self.reconciler;
        let scope = self.scope;
        let account = scope.account.as_str();
        let reply = self
            .call(|token| reconciler.factory.get(account, token, id))
            .await?;
        parse(&reply.body)
    }

    async fn sync_groups(&mut self) -> SyncResult<(GroupIndex, Vec<GroupRecord>)> {
        let reconciler = self.reconciler;
        let scope = self.scope;
        let account = scope.account.as_str();
        self.cursor.kind = RecordKind::Groups;

        let feed = if self.plan_ctx.write_only {
            None
        } else {
            self.enter(SyncPhase::FetchingRemote);
            Some(
                self.fetch_pages(
                    |token, start, max| reconciler.factory.list_groups(account, token, start, max),
                    atom::parse_group_feed,
                )
                .await?,
            )
        };
        let (remotes, unreadable) = split_feed(feed);

        self.enter(SyncPhase::FetchingLocal);
        let locals = reconciler.store.list_groups(&scope.id)?;

        self.enter(SyncPhase::Diffing);
        self.note_unreadable(&unreadable, &locals);
        let group_plan = plan(
            &locals,
            remotes.as_deref(),
            &scope.state.known_group_ids,
            &self.plan_ctx,
            group_differs,
        );
        debug!(
            actions = group_plan.actions.len(),
            mutations = group_plan.mutation_count(),
            "Group plan ready"
        );

        self.enter(SyncPhase::Applying);
        let remotes = remotes.unwrap_or_default();
        for (i, action) in group_plan.actions.iter().enumerate() {
            self.ctx.check_cancelled()?;
            self.cursor.index = i;
            self.apply_group(action, &locals, &remotes).await?;
        }

        let groups = reconciler.store.list_groups(&scope.id)?;
        // System groups are never deletion candidates.
        for group in groups.iter().chain(remotes.iter()).filter(|g| g.is_system()) {
            if let Some(id) = &group.remote_id {
                self.linked_groups.remove(id);
            }
        }
        Ok((GroupIndex::from_local(&groups), groups))
    }

    async fn apply_group(
        &mut self,
        action: &Action,
        locals: &[GroupRecord],
        remotes: &[GroupRecord],
    ) -> SyncResult<()> {
        let reconciler = self.reconciler;
        let scope = self.scope;
        let account = scope.account.as_str();

        match action {
            Action::NotChanged { id, .. } => {
                self.summary.groups.not_changed += 1;
                self.linked_groups.insert(id.clone());
            }
            Action::Ignore { side, reason, linked } => {
                debug!(side = ?side, reason = ?reason, "Group ignored");
                count_ignored(&mut self.summary.groups, *side);
                if let Some(id) = linked {
                    self.linked_groups.insert(id.clone());
                }
            }
            Action::CreateRemote { local } => {
                let group = &locals[*local];
                let entry = atom::group_entry_xml(&GroupRecord {
                    local_id: None,
                    remote_id: None,
                    system_group: None,
                    ..group.clone()
                });
                match self
                    .mutate(|token| reconciler.factory.add_group(account, token, entry.clone()))
                    .await?
                {
                    Mutation::Applied(reply) => {
                        let created = atom::parse_group_entry(&reply.body)?;
                        self.record_group(group, &created, true)?;
                        if let Some(id) = created.remote_id {
                            self.linked_groups.insert(id);
                        }
                        self.summary.groups.remote.added += 1;
                    }
                    Mutation::Deferred => self.summary.groups.deferred += 1,
                    Mutation::Rejected(status) => {
                        warn!(group = %group.name, status, "Remote rejected new group");
                        self.summary.groups.remote.ignored += 1;
                    }
                }
            }
            Action::UpdateRemote {
                local, conflict, ..
            } => {
                let group = &locals[*local];
                let Some(id) = group.remote_id.clone() else {
                    self.summary.groups.remote.ignored += 1;
                    return Ok(());
                };
                self.linked_groups.insert(id.clone());
                let entry = atom::group_entry_xml(group);
                match self
                    .mutate(|token| reconciler.factory.update_group(account, token, &id, entry.clone()))
                    .await?
                {
                    Mutation::Applied(reply) => {
                        let updated = self
                            .confirmed_entry(&id, &reply.body, atom::parse_group_entry)
                            .await?;
                        self.record_group(group, &updated, false)?;
                        count_update(&mut self.summary.groups, Side::Remote, *conflict);
                    }
                    Mutation::Deferred => self.summary.groups.deferred += 1,
                    Mutation::Rejected(status) => {
                        warn!(group = %group.name, status, "Remote rejected group update");
                        self.summary.groups.remote.ignored += 1;
                    }
                }
            }
            Action::UpdateLocal {
                local,
                remote,
                conflict,
            } => {
                let merged = GroupRecord {
                    local_id: locals[*local].local_id.clone(),
                    ..remotes[*remote].clone()
                };
                if let Some(id) = &merged.remote_id {
                    self.linked_groups.insert(id.clone());
                }
                reconciler.store.upsert_group(&scope.id, merged)?;
                count_update(&mut self.summary.groups, Side::Local, *conflict);
            }
            Action::CreateLocal { remote } => {
                let created = GroupRecord {
                    local_id: None,
                    ..remotes[*remote].clone()
                };
                if let Some(id) = &created.remote_id {
                    self.linked_groups.insert(id.clone());
                }
                reconciler.store.upsert_group(&scope.id, created)?;
                self.summary.groups.local.added += 1;
            }
            Action::DeleteLocal { local } => {
                reconciler.store.delete_group(&scope.id, &locals[*local])?;
                self.summary.groups.local.removed += 1;
            }
            Action::DeleteRemote { id, .. } => {
                match self
                    .mutate(|token| reconciler.factory.delete_group(account, token, id))
                    .await?
                {
                    Mutation::Applied(_) | Mutation::Rejected(NOT_FOUND) => {
                        self.summary.groups.remote.removed += 1;
                    }
                    Mutation::Deferred => {
                        self.summary.groups.deferred += 1;
                        self.linked_groups.insert(id.clone());
                    }
                    Mutation::Rejected(status) => {
                        warn!(group = %id, status, "Remote rejected group deletion");
                        self.summary.groups.remote.ignored += 1;
                        self.linked_groups.insert(id.clone());
                    }
                }
            }
        }
        Ok(())
    }

    /// Copy the returned timestamp into the local group. The returned id
    /// replaces a different linked one only when `relink` is set.
    fn record_group(&self, local: &GroupRecord, returned: &GroupRecord, relink: bool) -> SyncResult<()> {
        let remote_id = settled_id(&local.remote_id, &returned.remote_id, relink, &local.name);
        if local.remote_id == remote_id && local.last_modified == returned.last_modified {
            return Ok(());
        }
        let updated = GroupRecord {
            remote_id,
            last_modified: returned.last_modified,
            ..local.clone()
        };
        self.reconciler.store.upsert_group(&self.scope.id, updated)?;
        Ok(())
    }

    async fn resolve_scoped_group(
        &mut self,
        name: &str,
        local_groups: &[GroupRecord],
    ) -> SyncResult<ScopedGroup> {
        if let Some(id) = find_by_name(local_groups, name).and_then(|g| g.remote_id.clone()) {
            return Ok(ScopedGroup::Resolved(id));
        }

        let reconciler = self.reconciler;
        let scope = self.scope;
        let account = scope.account.as_str();
        self.enter(SyncPhase::FetchingRemote);
        let remote_groups = self
            .fetch_pages(
                |token, start, max| reconciler.factory.list_groups(account, token, start, max),
                atom::parse_group_feed,
            )
            .await?
            .records;
        if let Some(id) = find_by_name(&remote_groups, name).and_then(|g| g.remote_id.clone()) {
            return Ok(ScopedGroup::Resolved(id));
        }

        if self.plan_ctx.read_only {
            warn!(group = name, "Scoped group does not exist remotely");
            return Ok(ScopedGroup::Missing);
        }

        let entry = atom::group_entry_xml(&GroupRecord::new(name.trim(), self.ctx.started_at()));
        match self
            .mutate(|token| reconciler.factory.add_group(account, token, entry.clone()))
            .await?
        {
            Mutation::Applied(reply) => {
                let created = atom::parse_group_entry(&reply.body)?;
                info!(group = name, "Created scoped group");
                created
                    .remote_id
                    .map(ScopedGroup::Resolved)
                    .ok_or_else(|| SyncError::parse("created group has no id"))
            }
            Mutation::Deferred => {
                self.summary.groups.deferred += 1;
                Ok(ScopedGroup::Deferred)
            }
            Mutation::Rejected(status) => Err(SyncError::Remote {
                status,
                body: format!("scoped group '{name}' could not be created"),
            }),
        }
    }

    async fn sync_contacts(
        &mut self,
        index: &GroupIndex,
        local_groups: &[GroupRecord],
    ) -> SyncResult<()> {
        let reconciler = self.reconciler;
        let scope = self.scope;
        let account = scope.account.as_str();
        self.cursor.kind = RecordKind::Contacts;
        self.cursor.index = 0;

        let scoped = match scope.policy.scoped_group_name.as_deref() {
            Some(name) => self.resolve_scoped_group(name, local_groups).await?,
            None => ScopedGroup::Unscoped,
        };

        let feed = match &scoped {
            ScopedGroup::Deferred => {
                info!("Scoped group unavailable, contacts left for the next pass");
                return Ok(());
            }
            _ if self.plan_ctx.write_only => None,
            ScopedGroup::Missing => Some(Feed::default()),
            ScopedGroup::Resolved(group) => {
                self.enter(SyncPhase::FetchingRemote);
                Some(
                    self.fetch_pages(
                        |token, start, max| {
                            reconciler
                                .factory
                                .list_by_group(account, token, group, start, max)
                        },
                        atom::parse_contact_feed,
                    )
                    .await?,
                )
            }
            ScopedGroup::Unscoped => {
                self.enter(SyncPhase::FetchingRemote);
                Some(
                    self.fetch_pages(
                        |token, start, max| reconciler.factory.list_all(account, token, start, max),
                        atom::parse_contact_feed,
                    )
                    .await?,
                )
            }
        };
        let (remotes, unreadable) = split_feed(feed);
        let scoped_id = match &scoped {
            ScopedGroup::Resolved(id) => Some(id),
            _ => None,
        };

        self.enter(SyncPhase::FetchingLocal);
        let locals = reconciler.store.list_contacts(&scope.id)?;

        self.enter(SyncPhase::Diffing);
        self.note_unreadable(&unreadable, &locals);
        let groups_enabled = scope.policy.sync_groups_enabled;
        let without_scope = |set: BTreeSet<String>| -> BTreeSet<String> {
            match scoped_id {
                Some(id) => set.into_iter().filter(|g| g != id.as_str()).collect(),
                None => set,
            }
        };
        let differs = |local: &ContactRecord, remote: &ContactRecord| {
            local.significant_fields() != remote.significant_fields()
                || (groups_enabled
                    && without_scope(index.to_remote(&local.groups))
                        != without_scope(index.linked_remote(&remote.groups)))
        };
        let contact_plan = plan(
            &locals,
            remotes.as_deref(),
            &scope.state.known_contact_ids,
            &self.plan_ctx,
            differs,
        );
        info!(
            local = locals.len(),
            remote = remotes.as_ref().map(Vec::len),
            actions = contact_plan.actions.len(),
            mutations = contact_plan.mutation_count(),
            "Contact plan ready"
        );

        self.enter(SyncPhase::Applying);
        let remotes = remotes.unwrap_or_default();
        let views = ContactViews {
            index,
            groups_enabled,
            scoped: scoped_id,
        };
        for (i, action) in contact_plan.actions.iter().enumerate() {
            self.ctx.check_cancelled()?;
            self.cursor.index = i;
            self.apply_contact(action, &locals, &remotes, &views).await?;
        }
        Ok(())
    }

    async fn apply_contact(
        &mut self,
        action: &Action,
        locals: &[ContactRecord],
        remotes: &[ContactRecord],
        views: &ContactViews<'_>,
    ) -> SyncResult<()> {
        let reconciler = self.reconciler;
        let scope = self.scope;
        let account = scope.account.as_str();

        match action {
            Action::NotChanged { id, .. } => {
                self.summary.contacts.not_changed += 1;
                self.linked_contacts.insert(id.clone());
            }
            Action::Ignore { side, reason, linked } => {
                debug!(side = ?side, reason = ?reason, "Contact ignored");
                count_ignored(&mut self.summary.contacts, *side);
                if let Some(id) = linked {
                    self.linked_contacts.insert(id.clone());
                }
            }
            Action::CreateRemote { local } => {
                let record = &locals[*local];
                let mut view = views.remote_view(record, None);
                view.remote_id = None;
                let entry = atom::contact_entry_xml(&view);
                match self
                    .mutate(|token| reconciler.factory.add(account, token, entry.clone()))
                    .await?
                {
                    Mutation::Applied(reply) => {
                        let created = atom::parse_contact_entry(&reply.body)?;
                        self.record_contact(record, &created, true)?;
                        if let Some(id) = created.remote_id {
                            self.linked_contacts.insert(id);
                        }
                        self.summary.contacts.remote.added += 1;
                        debug!(contact = record.label(), "Created remotely");
                    }
                    Mutation::Deferred => self.summary.contacts.deferred += 1,
                    Mutation::Rejected(status) => {
                        warn!(contact = record.label(), status, "Remote rejected new contact");
                        self.summary.contacts.remote.ignored += 1;
                    }
                }
            }
            Action::UpdateRemote {
                local,
                remote,
                conflict,
            } => {
                let record = &locals[*local];
                let Some(id) = record.remote_id.clone() else {
                    self.summary.contacts.remote.ignored += 1;
                    return Ok(());
                };
                self.linked_contacts.insert(id.clone());
                let view = views.remote_view(record, (*remote).map(|i| &remotes[i]));
                let entry = atom::contact_entry_xml(&view);
                match self
                    .mutate(|token| reconciler.factory.update(account, token, &id, entry.clone()))
                    .await?
                {
                    Mutation::Applied(reply) => {
                        let updated = self
                            .confirmed_entry(&id, &reply.body, atom::parse_contact_entry)
                            .await?;
                        self.record_contact(record, &updated, false)?;
                        count_update(&mut self.summary.contacts, Side::Remote, *conflict);
                        debug!(contact = record.label(), conflict = *conflict, "Updated remotely");
                    }
                    Mutation::Deferred => self.summary.contacts.deferred += 1,
                    Mutation::Rejected(status) => {
                        warn!(contact = record.label(), status, "Remote rejected contact update");
                        self.summary.contacts.remote.ignored += 1;
                    }
                }
            }
            Action::UpdateLocal {
                local,
                remote,
                conflict,
            } => {
                let merged = views.local_view(&remotes[*remote], Some(&locals[*local]));
                if let Some(id) = &merged.remote_id {
                    self.linked_contacts.insert(id.clone());
                }
                reconciler.store.upsert_contact(&scope.id, merged)?;
                count_update(&mut self.summary.contacts, Side::Local, *conflict);
            }
            Action::CreateLocal { remote } => {
                let created = views.local_view(&remotes[*remote], None);
                if let Some(id) = &created.remote_id {
                    self.linked_contacts.insert(id.clone());
                }
                reconciler.store.upsert_contact(&scope.id, created)?;
                self.summary.contacts.local.added += 1;
            }
            Action::DeleteLocal { local } => {
                reconciler
                    .store
                    .delete_contacts(&scope.id, std::slice::from_ref(&locals[*local]))?;
                self.summary.contacts.local.removed += 1;
            }
            Action::DeleteRemote { id, .. } => {
                match self
                    .mutate(|token| reconciler.factory.delete(account, token, id))
                    .await?
                {
                    Mutation::Applied(_) | Mutation::Rejected(NOT_FOUND) => {
                        self.summary.contacts.remote.removed += 1;
                    }
                    Mutation::Deferred => {
                        self.summary.contacts.deferred += 1;
                        self.linked_contacts.insert(id.clone());
                    }
                    Mutation::Rejected(status) => {
                        warn!(contact = %id, status, "Remote rejected contact deletion");
                        self.summary.contacts.remote.ignored += 1;
                        self.linked_contacts.insert(id.clone());
                    }
                }
            }
        }
        Ok(())
    }

    /// Copy the returned timestamp into the local contact. The returned id
    /// replaces a different linked one only when `relink` is set.
    fn record_contact(
        &self,
        local: &ContactRecord,
        returned: &ContactRecord,
        relink: bool,
    ) -> SyncResult<()> {
        let remote_id = settled_id(&local.remote_id, &returned.remote_id, relink, local.label());
        if local.remote_id == remote_id && local.last_modified == returned.last_modified {
            return Ok(());
        }
        let updated = ContactRecord {
            remote_id,
            last_modified: returned.last_modified,
            ..local.clone()
        };
        self.reconciler.store.upsert_contact(&self.scope.id, updated)?;
        Ok(())
    }

    fn finish(mut self, result: SyncResult<()>) -> ScopeOutcome {
        let stopped_at = self.cursor;
        self.enter(SyncPhase::Summarizing);

        let deferred = self.summary.contacts.deferred + self.summary.groups.deferred;
        let status = match result {
            Ok(()) if deferred > 0 => PassStatus::Deferred,
            Ok(()) => PassStatus::Completed,
            Err(SyncError::Cancelled) => PassStatus::Cancelled,
            Err(err) if err.is_retryable() => PassStatus::Interrupted(err),
            Err(err) => PassStatus::Failed(err),
        };

        let next_state = if status.is_completed() {
            Some(ScopeState {
                last_sync_timestamp: self.ctx.started_at(),
                reset_flag: false,
                known_contact_ids: std::mem::take(&mut self.linked_contacts),
                known_group_ids: if self.scope.policy.sync_groups_enabled {
                    std::mem::take(&mut self.linked_groups)
                } else {
                    self.scope.state.known_group_ids.clone()
                },
            })
        } else {
            None
        };

        match &status {
            PassStatus::Completed => info!(
                contacts = %self.summary.contacts,
                groups = %self.summary.groups,
                "Scope synchronized"
            ),
            PassStatus::Deferred => warn!(
                deferred,
                contacts = %self.summary.contacts,
                "Scope pass finished with deferred changes"
            ),
            PassStatus::Cancelled => info!(
                kind = %stopped_at.kind,
                phase = %stopped_at.phase,
                index = stopped_at.index,
                "Scope pass cancelled"
            ),
            PassStatus::Interrupted(err) => warn!(
                error = %err,
                kind = %stopped_at.kind,
                phase = %stopped_at.phase,
                index = stopped_at.index,
                "Scope pass interrupted"
            ),
            PassStatus::Failed(err) => error!(
                error = %err,
                kind = %stopped_at.kind,
                phase = %stopped_at.phase,
                index = stopped_at.index,
                "Scope pass failed"
            ),
        }
        self.enter(SyncPhase::Idle);

        ScopeOutcome {
            scope_id: self.scope.id.clone(),
            account: self.scope.account.clone(),
            summary: self.summary,
            status,
            cursor: stopped_at,
            next_state,
        }
    }
}

fn split_feed<T>(feed: Option<Feed<T>>) -> (Option<Vec<T>>, Vec<UnreadableEntry>) {
    match feed {
        Some(feed) => (Some(feed.records), feed.unreadable),
        None => (None, Vec::new()),
    }
}

/// The id a local record keeps after a write. A linked id is only replaced
/// when the write re-created the record.
fn settled_id(
    current: &Option<RemoteId>,
    returned: &Option<RemoteId>,
    relink: bool,
    label: &str,
) -> Option<RemoteId> {
    match (current, returned) {
        (Some(current), Some(returned)) if current != returned && !relink => {
            warn!(
                record = label,
                linked = %current,
                returned = %returned,
                "Remote answered with another id, keeping the linked one"
            );
            Some(current.clone())
        }
        (_, Some(returned)) => Some(returned.clone()),
        (current, None) => current.clone(),
    }
}

fn count_ignored(data: &mut SyncSummaryData, side: Side) {
    match side {
        Side::Local => data.local.ignored += 1,
        Side::Remote => data.remote.ignored += 1,
    }
}

fn count_update(data: &mut SyncSummaryData, side: Side, conflict: bool) {
    if conflict {
        data.local.conflicted += 1;
        data.conflicted += 1;
        return;
    }
    match side {
        Side::Local => data.local.updated += 1,
        Side::Remote => data.remote.updated += 1,
    }
}
