//! Integration tests for scope reconciliation against the mock service.
//!
//! Tests cover:
//! - Creation, update and deletion in both directions
//! - Idempotent re-runs
//! - Unreadable feed entries and unreadable update replies
//! - Conflicts and one-way policies
//! - Resuming after a token refresh
//! - Deferred, interrupted, failed and cancelled passes
//! - Groups, system groups and scoped groups

mod helpers;

use std::collections::BTreeSet;
use tokio_util::sync::CancellationToken;

use contactsync::model::fields;
use contactsync::reconcile::{PassStatus, SyncPhase};
use contactsync::session::SyncContext;
use contactsync::storage::ContactStore;
use contactsync::{
    ContactRecord, GroupRecord, RemoteId, ScopePolicy, ScopeState, SyncError, SyncSettings,
    SystemGroup,
};
use helpers::mock_contacts_server::MockOp;
use helpers::test_data::{contact, offline_reconciler, scope, scope_with, Harness, PASS_START, SCOPE};

fn local_named(harness: &Harness, name: &str) -> ContactRecord {
    harness
        .locals()
        .into_iter()
        .find(|c| c.field(fields::DISPLAY_NAME) == Some(name))
        .unwrap_or_else(|| panic!("no local contact named {name}"))
}

fn edit_local(harness: &Harness, name: &str, field: &str, value: &str, last_modified: i64) {
    let mut record = local_named(harness, name);
    record.fields.insert(field.to_string(), value.to_string());
    record.last_modified = last_modified;
    harness.store.upsert_contact(SCOPE, record).unwrap();
}

// =============================================================================
// Push and Pull Tests
// =============================================================================

#[tokio::test]
async fn test_local_contacts_are_created_remotely() {
    let harness = Harness::start().await;
    harness.seed_local(contact("Ada Lovelace", PASS_START - 100));
    harness.seed_local(contact("Alan Turing", PASS_START - 50));

    let outcome = harness.run(&scope()).await;

    assert!(outcome.status.is_completed(), "status {:?}", outcome.status);
    assert_eq!(outcome.summary.contacts.remote.added, 2);
    assert_eq!(harness.server.contacts().len(), 2);

    let ada = local_named(&harness, "Ada Lovelace");
    let id = ada.remote_id.clone().expect("local contact should be linked");
    let remote = harness.server.contact(&id).unwrap();
    assert_eq!(remote.field(fields::PRIMARY_EMAIL), Some("ada.lovelace@example.com"));
    assert_eq!(remote.last_modified, PASS_START - 100);

    let state = outcome.next_state.unwrap();
    assert_eq!(state.last_sync_timestamp, PASS_START);
    assert_eq!(state.known_contact_ids.len(), 2);
    assert!(state.known_contact_ids.contains(&id));
}

#[tokio::test]
async fn test_second_pass_changes_nothing() {
    let harness = Harness::start().await;
    harness.seed_local(contact("Ada Lovelace", PASS_START - 100));
    harness.server.seed_contact(contact("Grace Hopper", PASS_START - 200));

    let (scope, first) = harness.run_and_advance(scope(), PASS_START).await;
    assert!(first.status.is_completed());
    let mutations = harness.server.mutation_count();

    let (_, second) = harness.run_and_advance(scope, PASS_START + 100).await;

    assert!(second.status.is_completed());
    assert_eq!(second.summary.contacts.not_changed, 2);
    assert_eq!(second.summary.contacts.changes(), 0);
    assert_eq!(harness.server.mutation_count(), mutations);
    assert_eq!(harness.locals().len(), 2);
}

#[tokio::test]
async fn test_remote_contacts_are_pulled() {
    let harness = Harness::start().await;
    let id = harness.server.seed_contact(
        contact("Grace Hopper", PASS_START - 200).with_field(fields::MOBILE_PHONE, "+1 555 0100"),
    );

    let outcome = harness.run(&scope()).await;

    assert_eq!(outcome.summary.contacts.local.added, 1);
    let grace = local_named(&harness, "Grace Hopper");
    assert_eq!(grace.remote_id.as_ref(), Some(&id));
    assert!(grace.local_id.is_some());
    assert_eq!(grace.field(fields::MOBILE_PHONE), Some("+1 555 0100"));
    assert_eq!(harness.server.mutation_count(), 0);
}

#[tokio::test]
async fn test_feed_is_read_page_by_page() {
    let harness = Harness::start().await;
    for i in 0..30 {
        harness
            .server
            .seed_contact(contact(&format!("Person {i:02}"), PASS_START - 10));
    }

    let outcome = harness.run(&scope()).await;

    assert_eq!(outcome.summary.contacts.local.added, 30);
    let pages = harness.server.recorded(MockOp::ListContacts);
    assert_eq!(pages.len(), 2);
    assert!(pages[1]
        .query
        .contains(&("start-index".to_string(), "26".to_string())));
}

#[tokio::test]
async fn test_local_edit_updates_remote() {
    let harness = Harness::start().await;
    harness.seed_local(contact("Ada Lovelace", PASS_START - 100));
    let (scope, _) = harness.run_and_advance(scope(), PASS_START).await;

    edit_local(&harness, "Ada Lovelace", fields::JOB_TITLE, "Analyst", PASS_START + 50);
    let (_, outcome) = harness.run_and_advance(scope, PASS_START + 100).await;

    assert!(outcome.status.is_completed());
    assert_eq!(outcome.summary.contacts.remote.updated, 1);
    assert_eq!(harness.server.calls(MockOp::UpdateContact), 1);
    let id = local_named(&harness, "Ada Lovelace").remote_id.unwrap();
    let remote = harness.server.contact(&id).unwrap();
    assert_eq!(remote.field(fields::JOB_TITLE), Some("Analyst"));
    assert_eq!(remote.last_modified, PASS_START + 50);
}

#[tokio::test]
async fn test_remote_edit_updates_local() {
    let harness = Harness::start().await;
    let id = harness.server.seed_contact(contact("Grace Hopper", PASS_START - 200));
    let (scope, _) = harness.run_and_advance(scope(), PASS_START).await;

    harness.server.edit_contact(&id, |c| {
        c.fields.insert(fields::ORGANIZATION.to_string(), "US Navy".to_string());
        c.last_modified = PASS_START + 30;
    });
    let (_, outcome) = harness.run_and_advance(scope, PASS_START + 100).await;

    assert_eq!(outcome.summary.contacts.local.updated, 1);
    let grace = local_named(&harness, "Grace Hopper");
    assert_eq!(grace.field(fields::ORGANIZATION), Some("US Navy"));
    assert_eq!(grace.last_modified, PASS_START + 30);
    assert_eq!(harness.server.mutation_count(), 0);
}

#[tokio::test]
async fn test_unreadable_feed_entries_are_ignored() {
    let harness = Harness::start().await;
    harness.server.seed_contact(contact("Grace Hopper", PASS_START - 200));
    let ada_id = harness.server.contact_id("ada");
    harness.seed_local(contact("Ada Lovelace", PASS_START - 300).with_remote_id(ada_id.clone()));
    // One entry lost its timestamp, the other its id.
    harness.server.seed_raw_contact_entry(format!(
        "<entry><id>{ada_id}</id><title>Ada Lovelace</title></entry>"
    ));
    harness.server.seed_raw_contact_entry(
        "<entry><updated>2023-11-14T22:13:20.000Z</updated><title>Nobody</title></entry>",
    );
    let state = ScopeState {
        last_sync_timestamp: PASS_START - 250,
        known_contact_ids: BTreeSet::from([ada_id.clone()]),
        ..ScopeState::default()
    };

    let outcome = harness.run(&scope().with_state(state)).await;

    assert!(outcome.status.is_completed(), "status {:?}", outcome.status);
    assert_eq!(outcome.summary.contacts.local.added, 1);
    assert_eq!(outcome.summary.contacts.local.ignored, 2);
    assert_eq!(outcome.summary.contacts.local.removed, 0);
    assert_eq!(harness.server.mutation_count(), 0);
    let ada = local_named(&harness, "Ada Lovelace");
    assert_eq!(ada.remote_id.as_ref(), Some(&ada_id));
    assert!(outcome
        .next_state
        .unwrap()
        .known_contact_ids
        .contains(&ada_id));
}

#[tokio::test]
async fn test_unreadable_update_reply_is_read_back() {
    let harness = Harness::start().await;
    harness.seed_local(contact("Ada Lovelace", PASS_START - 100));
    let (scope, _) = harness.run_and_advance(scope(), PASS_START).await;

    edit_local(&harness, "Ada Lovelace", fields::JOB_TITLE, "Analyst", PASS_START + 50);
    harness.server.stamp_updates_at(PASS_START + 150);
    harness.server.garble_reply(MockOp::UpdateContact, 1);
    let (scope, outcome) = harness.run_and_advance(scope, PASS_START + 100).await;

    assert!(outcome.status.is_completed(), "status {:?}", outcome.status);
    assert_eq!(outcome.summary.contacts.remote.updated, 1);
    assert_eq!(harness.server.calls(MockOp::GetContact), 1);
    assert_eq!(local_named(&harness, "Ada Lovelace").last_modified, PASS_START + 150);

    let (_, next) = harness.run_and_advance(scope, PASS_START + 200).await;
    assert_eq!(next.summary.contacts.not_changed, 1);
    assert_eq!(next.summary.contacts.changes(), 0);
    assert_eq!(harness.server.calls(MockOp::UpdateContact), 1);
}

// =============================================================================
// Deletion Tests
// =============================================================================

#[tokio::test]
async fn test_local_deletion_is_propagated_once() {
    let harness = Harness::start().await;
    harness.seed_local(contact("Ada Lovelace", PASS_START - 100));
    harness.seed_local(contact("Alan Turing", PASS_START - 100));
    let (scope, _) = harness.run_and_advance(scope(), PASS_START).await;

    let ada = local_named(&harness, "Ada Lovelace");
    let id = ada.remote_id.clone().unwrap();
    harness.store.delete_contacts(SCOPE, &[ada]).unwrap();
    let (scope, outcome) = harness.run_and_advance(scope, PASS_START + 100).await;

    assert_eq!(harness.server.calls(MockOp::DeleteContact), 1);
    assert_eq!(outcome.summary.contacts.remote.removed, 1);
    assert_eq!(outcome.summary.contacts.not_changed, 1);
    assert!(harness.server.contact(&id).is_none());
    assert!(!scope.state.known_contact_ids.contains(&id));

    let (_, third) = harness.run_and_advance(scope, PASS_START + 200).await;
    assert_eq!(third.summary.contacts.changes(), 0);
    assert_eq!(harness.server.calls(MockOp::DeleteContact), 1);
}

#[tokio::test]
async fn test_remote_deletion_removes_local() {
    let harness = Harness::start().await;
    let id = harness.server.seed_contact(contact("Grace Hopper", PASS_START - 200));
    let (scope, _) = harness.run_and_advance(scope(), PASS_START).await;

    harness.server.remove_contact(&id);
    let (scope, outcome) = harness.run_and_advance(scope, PASS_START + 100).await;

    assert_eq!(outcome.summary.contacts.local.removed, 1);
    assert!(harness.locals().is_empty());
    assert!(scope.state.known_contact_ids.is_empty());
}

#[tokio::test]
async fn test_delete_of_missing_entry_counts_as_removed() {
    let harness = Harness::start().await;
    harness.seed_local(contact("Ada Lovelace", PASS_START - 100));
    let (scope, _) = harness.run_and_advance(scope(), PASS_START).await;

    let ada = local_named(&harness, "Ada Lovelace");
    harness.store.delete_contacts(SCOPE, &[ada]).unwrap();
    harness.server.fail_call(MockOp::DeleteContact, 1, 404);
    let (scope, outcome) = harness.run_and_advance(scope, PASS_START + 100).await;

    assert!(outcome.status.is_completed());
    assert_eq!(outcome.summary.contacts.remote.removed, 1);
    assert!(scope.state.known_contact_ids.is_empty());
}

#[tokio::test]
async fn test_reset_suppresses_deletions() {
    let harness = Harness::start().await;
    let stale = harness.server.contact_id("gone");
    harness.seed_local(contact("Ada Lovelace", PASS_START - 100).with_remote_id(stale.clone()));
    let state = ScopeState {
        known_contact_ids: BTreeSet::from([stale.clone()]),
        ..ScopeState::reset()
    };

    let outcome = harness.run(&scope().with_state(state)).await;

    assert_eq!(outcome.summary.contacts.local.removed, 0);
    assert_eq!(outcome.summary.contacts.remote.added, 1);
    let ada = local_named(&harness, "Ada Lovelace");
    assert_ne!(ada.remote_id.as_ref(), Some(&stale));
    let next = outcome.next_state.unwrap();
    assert!(!next.reset_flag);
    assert!(!next.known_contact_ids.contains(&stale));
}

// =============================================================================
// Conflict and Policy Tests
// =============================================================================

#[tokio::test]
async fn test_conflict_prefers_local_by_default() {
    let harness = Harness::start().await;
    harness.seed_local(contact("Ada Lovelace", PASS_START - 100));
    let (scope, _) = harness.run_and_advance(scope(), PASS_START).await;
    let id = local_named(&harness, "Ada Lovelace").remote_id.unwrap();

    edit_local(&harness, "Ada Lovelace", fields::NOTES, "local note", PASS_START + 50);
    harness.server.edit_contact(&id, |c| {
        c.fields.insert(fields::NOTES.to_string(), "remote note".to_string());
        c.last_modified = PASS_START + 60;
    });
    let (_, outcome) = harness.run_and_advance(scope, PASS_START + 100).await;

    assert_eq!(outcome.summary.contacts.conflicted, 1);
    assert_eq!(outcome.summary.contacts.local.conflicted, 1);
    assert_eq!(outcome.summary.contacts.remote.updated, 0);
    let remote = harness.server.contact(&id).unwrap();
    assert_eq!(remote.field(fields::NOTES), Some("local note"));
}

#[tokio::test]
async fn test_conflict_can_prefer_remote() {
    let harness = Harness::start().await;
    let policy = ScopePolicy {
        prefer_remote_on_conflict: true,
        ..ScopePolicy::default()
    };
    harness.seed_local(contact("Ada Lovelace", PASS_START - 100));
    let (scope, _) = harness.run_and_advance(scope_with(policy), PASS_START).await;
    let id = local_named(&harness, "Ada Lovelace").remote_id.unwrap();

    edit_local(&harness, "Ada Lovelace", fields::NOTES, "local note", PASS_START + 60);
    harness.server.edit_contact(&id, |c| {
        c.fields.insert(fields::NOTES.to_string(), "remote note".to_string());
        c.last_modified = PASS_START + 50;
    });
    let (_, outcome) = harness.run_and_advance(scope, PASS_START + 100).await;

    assert_eq!(outcome.summary.contacts.conflicted, 1);
    assert_eq!(harness.server.calls(MockOp::UpdateContact), 0);
    assert_eq!(
        local_named(&harness, "Ada Lovelace").field(fields::NOTES),
        Some("remote note")
    );
}

#[tokio::test]
async fn test_read_only_scope_never_writes_remotely() {
    let harness = Harness::start().await;
    let policy = ScopePolicy {
        read_only: true,
        ..ScopePolicy::default()
    };
    harness.seed_local(contact("Ada Lovelace", PASS_START - 100));
    harness.server.seed_contact(contact("Grace Hopper", PASS_START - 200));

    let outcome = harness.run(&scope_with(policy)).await;

    assert!(outcome.status.is_completed());
    assert_eq!(outcome.summary.contacts.remote.ignored, 1);
    assert_eq!(outcome.summary.contacts.local.added, 1);
    assert_eq!(harness.server.mutation_count(), 0);
}

#[tokio::test]
async fn test_write_only_scope_never_reads_remote() {
    let harness = Harness::start().await;
    let policy = ScopePolicy {
        write_only: true,
        ..ScopePolicy::default()
    };
    harness.seed_local(contact("Ada Lovelace", PASS_START - 100));
    harness.server.seed_contact(contact("Grace Hopper", PASS_START - 200));

    let outcome = harness.run(&scope_with(policy)).await;

    assert!(outcome.status.is_completed());
    assert_eq!(harness.server.calls(MockOp::ListContacts), 0);
    assert_eq!(outcome.summary.contacts.remote.added, 1);
    assert_eq!(harness.locals().len(), 1);
}

#[tokio::test]
async fn test_write_only_pass_after_reset_keeps_links() {
    let harness = Harness::start().await;
    let policy = ScopePolicy {
        write_only: true,
        ..ScopePolicy::default()
    };
    let id = harness.server.seed_contact(contact("Ada Lovelace", PASS_START - 200));
    harness.seed_local(
        contact("Ada Lovelace", PASS_START - 100)
            .with_field(fields::NOTES, "edited offline")
            .with_remote_id(id.clone()),
    );

    let outcome = harness
        .run(&scope_with(policy).with_state(ScopeState::reset()))
        .await;

    assert!(outcome.status.is_completed(), "status {:?}", outcome.status);
    assert_eq!(harness.server.calls(MockOp::AddContact), 0);
    assert_eq!(harness.server.calls(MockOp::UpdateContact), 1);
    assert_eq!(harness.server.contacts().len(), 1);
    assert_eq!(
        harness.server.contact(&id).unwrap().field(fields::NOTES),
        Some("edited offline")
    );
    assert_eq!(local_named(&harness, "Ada Lovelace").remote_id, Some(id.clone()));
    assert!(outcome.next_state.unwrap().known_contact_ids.contains(&id));
}

#[tokio::test]
async fn test_unrepresentable_contact_is_skipped() {
    let harness = Harness::start().await;
    harness.seed_local(ContactRecord::new(PASS_START - 10).with_field(fields::NOTES, "no name"));

    let outcome = harness.run(&scope()).await;

    assert!(outcome.status.is_completed());
    assert_eq!(outcome.summary.contacts.remote.ignored, 1);
    assert_eq!(harness.server.calls(MockOp::AddContact), 0);
}

// =============================================================================
// Auth Resume and Error Tests
// =============================================================================

#[tokio::test]
async fn test_pass_resumes_after_token_refresh() {
    let harness = Harness::start().await;
    for i in 0..10 {
        harness.seed_local(contact(&format!("Person {i}"), PASS_START - 100));
    }
    harness.server.fail_call(MockOp::AddContact, 6, 401);

    let outcome = harness.run(&scope()).await;

    assert!(outcome.status.is_completed(), "status {:?}", outcome.status);
    assert_eq!(harness.server.calls(MockOp::AddContact), 11);
    assert_eq!(harness.server.contacts().len(), 10);
    assert_eq!(outcome.summary.contacts.remote.added, 10);
    assert_eq!(harness.server.tokens_issued(), 2);
    assert_eq!(outcome.next_state.unwrap().last_sync_timestamp, PASS_START);

    let auth_headers: Vec<_> = harness
        .server
        .recorded(MockOp::AddContact)
        .into_iter()
        .filter_map(|c| c.authorization)
        .collect();
    assert_eq!(auth_headers[5], "Bearer access-1");
    assert_eq!(auth_headers[6], "Bearer access-2");
}

#[tokio::test]
async fn test_second_auth_failure_fails_pass() {
    let harness = Harness::start().await;
    harness.seed_local(contact("Ada Lovelace", PASS_START - 100));
    harness.server.fail_call(MockOp::AddContact, 1, 401);
    harness.server.fail_call(MockOp::AddContact, 2, 403);

    let outcome = harness.run(&scope()).await;

    assert!(
        matches!(outcome.status, PassStatus::Failed(SyncError::Unauthorized { status: 403, .. })),
        "status {:?}",
        outcome.status
    );
    assert!(outcome.next_state.is_none());
    assert_eq!(harness.server.calls(MockOp::AddContact), 2);
}

#[tokio::test]
async fn test_rate_limited_mutation_is_deferred() {
    let harness = Harness::start().await;
    harness.seed_local(contact("Ada Lovelace", PASS_START - 100));
    harness.seed_local(contact("Alan Turing", PASS_START - 100));
    harness.server.fail_call(MockOp::AddContact, 1, 503);

    let outcome = harness.run(&scope()).await;

    assert!(matches!(outcome.status, PassStatus::Deferred), "status {:?}", outcome.status);
    assert!(outcome.next_state.is_none());
    assert_eq!(outcome.summary.contacts.deferred, 1);
    assert_eq!(outcome.summary.contacts.remote.added, 1);

    // The deferred contact goes out on the next pass.
    let retry = harness.run_at(&scope(), PASS_START + 100).await;
    assert!(retry.status.is_completed());
    assert_eq!(retry.summary.contacts.remote.added, 1);
    assert_eq!(harness.server.contacts().len(), 2);
}

#[tokio::test]
async fn test_rejected_entry_is_ignored() {
    let harness = Harness::start().await;
    harness.seed_local(contact("Ada Lovelace", PASS_START - 100));
    harness.server.fail_call(MockOp::AddContact, 1, 409);

    let outcome = harness.run(&scope()).await;

    assert!(outcome.status.is_completed());
    assert_eq!(outcome.summary.contacts.remote.ignored, 1);
    assert!(local_named(&harness, "Ada Lovelace").remote_id.is_none());
}

#[tokio::test]
async fn test_unavailable_storage_fails_pass() {
    let harness = Harness::start().await;
    harness.store.set_unavailable(true);

    let outcome = harness.run(&scope()).await;

    assert!(matches!(outcome.status, PassStatus::Failed(SyncError::Storage { .. })));
    assert!(outcome.next_state.is_none());
}

#[tokio::test]
async fn test_unreachable_service_interrupts_pass() {
    let store = std::sync::Arc::new(contactsync::storage::MemoryContactStore::new());
    let reconciler = offline_reconciler(store);
    let ctx = SyncContext::starting_at(PASS_START, CancellationToken::new());

    let outcome = reconciler.reconcile(&scope(), &ctx).await;

    assert!(matches!(outcome.status, PassStatus::Interrupted(SyncError::Offline { .. })));
    assert!(outcome.next_state.is_none());
}

#[tokio::test]
async fn test_cancelled_pass_stops_before_work() {
    let harness = Harness::start().await;
    harness.seed_local(contact("Ada Lovelace", PASS_START - 100));
    let token = CancellationToken::new();
    token.cancel();
    let ctx = SyncContext::starting_at(PASS_START, token);

    let outcome = harness.reconciler.reconcile(&scope(), &ctx).await;

    assert!(matches!(outcome.status, PassStatus::Cancelled));
    assert!(outcome.next_state.is_none());
    assert_eq!(harness.server.calls(MockOp::ListContacts), 0);
}

#[tokio::test]
async fn test_cancellation_between_mutations_stops_the_pass() {
    let harness = Harness::start().await;
    for i in 0..5 {
        harness.seed_local(contact(&format!("Person {i}"), PASS_START - 100));
    }
    let token = CancellationToken::new();
    harness.server.cancel_on(MockOp::AddContact, 2, token.clone());
    let ctx = SyncContext::starting_at(PASS_START, token);

    let outcome = harness.reconciler.reconcile(&scope(), &ctx).await;

    assert!(matches!(outcome.status, PassStatus::Cancelled), "status {:?}", outcome.status);
    assert!(outcome.next_state.is_none());
    assert_eq!(outcome.cursor.phase, SyncPhase::Applying);
    assert_eq!(outcome.summary.contacts.remote.added, 2);
    assert_eq!(harness.server.calls(MockOp::AddContact), 2);
    assert_eq!(harness.server.contacts().len(), 2);
    let linked = harness.locals().iter().filter(|c| c.remote_id.is_some()).count();
    assert_eq!(linked, 2);

    // The next pass picks up the rest without duplicating the first two.
    let resumed = harness.run_at(&scope(), PASS_START + 100).await;
    assert!(resumed.status.is_completed());
    assert_eq!(resumed.summary.contacts.not_changed, 2);
    assert_eq!(resumed.summary.contacts.remote.added, 3);
    assert_eq!(harness.server.contacts().len(), 5);
}

#[tokio::test]
async fn test_rate_limited_fetch_interrupts_pass() {
    let harness = Harness::start().await;
    harness.seed_local(contact("Ada Lovelace", PASS_START - 100));
    harness.server.fail_call(MockOp::ListContacts, 1, 503);

    let outcome = harness.run(&scope()).await;

    assert!(
        matches!(outcome.status, PassStatus::Interrupted(SyncError::RateLimited)),
        "status {:?}",
        outcome.status
    );
    assert!(outcome.next_state.is_none());
    assert_eq!(outcome.cursor.phase, SyncPhase::FetchingRemote);
    assert_eq!(harness.server.mutation_count(), 0);

    let retry = harness.run_at(&scope(), PASS_START + 100).await;
    assert!(retry.status.is_completed());
    assert_eq!(retry.summary.contacts.remote.added, 1);
}

#[tokio::test]
async fn test_timestamps_within_tolerance_are_equal() {
    let settings = SyncSettings {
        timestamp_tolerance_secs: 5,
        ..SyncSettings::for_testing()
    };
    let harness = Harness::with_settings(settings).await;
    harness.seed_local(contact("Ada Lovelace", PASS_START - 100));
    let (scope, _) = harness.run_and_advance(scope(), PASS_START).await;

    edit_local(&harness, "Ada Lovelace", fields::NOTES, "minor", PASS_START - 97);
    let (_, outcome) = harness.run_and_advance(scope, PASS_START + 100).await;

    assert_eq!(outcome.summary.contacts.not_changed, 1);
    assert_eq!(harness.server.calls(MockOp::UpdateContact), 0);
}

// =============================================================================
// Group Tests
// =============================================================================

fn groups_policy() -> ScopePolicy {
    ScopePolicy {
        sync_groups_enabled: true,
        ..ScopePolicy::default()
    }
}

#[tokio::test]
async fn test_groups_and_memberships_are_pushed() {
    let harness = Harness::start().await;
    let club = harness
        .store
        .seed_group(SCOPE, GroupRecord::new("Book club", PASS_START - 100));
    let club_local = club.local_id.clone().unwrap();
    harness.seed_local(contact("Ada Lovelace", PASS_START - 100).with_group(club_local.clone()));
    let builtin = harness
        .server
        .seed_system_group(SystemGroup::Contacts, PASS_START - 1000);

    let outcome = harness.run(&scope_with(groups_policy())).await;

    assert!(outcome.status.is_completed(), "status {:?}", outcome.status);
    assert_eq!(outcome.summary.groups.remote.added, 1);
    assert_eq!(outcome.summary.groups.local.added, 1);

    let groups = harness.store.list_groups(SCOPE).unwrap();
    let club = groups.iter().find(|g| g.name == "Book club").unwrap();
    let club_remote = club.remote_id.clone().unwrap();
    assert!(groups.iter().any(|g| g.system_group == Some(SystemGroup::Contacts)));

    let ada_id = local_named(&harness, "Ada Lovelace").remote_id.unwrap();
    let ada = harness.server.contact(&ada_id).unwrap();
    assert!(ada.groups.contains(club_remote.as_str()));

    let state = outcome.next_state.unwrap();
    assert!(state.known_group_ids.contains(&club_remote));
    assert!(!state.known_group_ids.contains(&builtin));
}

#[tokio::test]
async fn test_remote_memberships_map_to_local_groups() {
    let harness = Harness::start().await;
    let team = harness
        .server
        .seed_group(GroupRecord::new("Team", PASS_START - 500));
    harness
        .server
        .seed_contact(contact("Grace Hopper", PASS_START - 200).with_group(team.as_str()));

    let outcome = harness.run(&scope_with(groups_policy())).await;

    assert!(outcome.status.is_completed());
    let groups = harness.store.list_groups(SCOPE).unwrap();
    let team_local = groups
        .iter()
        .find(|g| g.remote_id.as_ref() == Some(&team))
        .and_then(|g| g.local_id.clone())
        .unwrap();
    let grace = local_named(&harness, "Grace Hopper");
    assert_eq!(grace.groups, BTreeSet::from([team_local]));
}

#[tokio::test]
async fn test_system_groups_are_never_deleted() {
    let harness = Harness::start().await;
    let builtin = harness
        .server
        .seed_system_group(SystemGroup::Friends, PASS_START - 1000);
    let (scope, _) = harness.run_and_advance(scope_with(groups_policy()), PASS_START).await;

    let local = harness
        .store
        .list_groups(SCOPE)
        .unwrap()
        .into_iter()
        .find(|g| g.remote_id.as_ref() == Some(&builtin))
        .unwrap();
    harness.store.delete_group(SCOPE, &local).unwrap();
    let (_, outcome) = harness.run_and_advance(scope, PASS_START + 100).await;

    assert!(outcome.status.is_completed());
    assert_eq!(harness.server.calls(MockOp::DeleteGroup), 0);
    assert_eq!(harness.server.groups().len(), 1);
}

#[tokio::test]
async fn test_scoped_group_limits_the_pass() {
    let harness = Harness::start().await;
    let policy = ScopePolicy {
        scoped_group_name: Some("Synced".to_string()),
        ..ScopePolicy::default()
    };
    harness.server.seed_contact(contact("Outsider", PASS_START - 200));
    harness.seed_local(contact("Ada Lovelace", PASS_START - 100));

    let (scope, outcome) = harness.run_and_advance(scope_with(policy), PASS_START).await;

    assert!(outcome.status.is_completed(), "status {:?}", outcome.status);
    assert_eq!(harness.server.calls(MockOp::AddGroup), 1);
    assert_eq!(outcome.summary.contacts.local.added, 0);
    assert_eq!(harness.locals().len(), 1);

    let synced: RemoteId = harness
        .server
        .groups()
        .into_iter()
        .find(|g| g.name == "Synced")
        .and_then(|g| g.remote_id)
        .unwrap();
    let ada_id = local_named(&harness, "Ada Lovelace").remote_id.unwrap();
    assert!(harness.server.contact(&ada_id).unwrap().groups.contains(synced.as_str()));

    let (_, second) = harness.run_and_advance(scope, PASS_START + 100).await;
    assert!(second.status.is_completed());
    assert_eq!(harness.server.calls(MockOp::AddGroup), 1);
    assert_eq!(second.summary.contacts.not_changed, 1);
}

#[tokio::test]
async fn test_missing_scoped_group_in_read_only_scope() {
    let harness = Harness::start().await;
    let policy = ScopePolicy {
        read_only: true,
        scoped_group_name: Some("Synced".to_string()),
        ..ScopePolicy::default()
    };
    harness.server.seed_contact(contact("Outsider", PASS_START - 200));

    let outcome = harness.run(&scope_with(policy)).await;

    assert!(outcome.status.is_completed());
    assert_eq!(harness.server.mutation_count(), 0);
    assert!(harness.locals().is_empty());
}
