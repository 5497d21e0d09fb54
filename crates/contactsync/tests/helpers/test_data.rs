//! Shared fixtures: a reconciler wired to the mock contacts server.

#![allow(dead_code)]

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use contactsync::auth::AuthSessionManager;
use contactsync::client::RequestEngine;
use contactsync::credentials::MemoryCredentialStore;
use contactsync::model::fields;
use contactsync::reconcile::{Reconciler, ScopeOutcome};
use contactsync::request::RequestFactory;
use contactsync::session::{SyncContext, SyncCoordinator};
use contactsync::storage::MemoryContactStore;
use contactsync::throttle::ThrottleController;
use contactsync::{
    ContactRecord, Endpoints, OAuthClientConfig, ScopePolicy, SyncScope, SyncSettings,
};

use super::mock_contacts_server::{MockContactsServer, ACCOUNT};

/// Start time of the first pass in reconciliation tests.
pub const PASS_START: i64 = 1_700_000_000;
pub const SCOPE: &str = "personal";
pub const REFRESH_TOKEN: &str = "refresh-1";

pub fn oauth() -> OAuthClientConfig {
    OAuthClientConfig::new("client-id", "client-secret", "urn:ietf:wg:oauth:2.0:oob")
}

pub fn scope() -> SyncScope {
    SyncScope::new(SCOPE, ACCOUNT)
}

pub fn scope_with(policy: ScopePolicy) -> SyncScope {
    scope().with_policy(policy)
}

/// A representable contact named `name`.
pub fn contact(name: &str, last_modified: i64) -> ContactRecord {
    ContactRecord::new(last_modified)
        .with_field(fields::DISPLAY_NAME, name)
        .with_field(
            fields::PRIMARY_EMAIL,
            format!("{}@example.com", name.to_lowercase().replace(' ', ".")),
        )
}

/// Everything a reconciliation test needs, backed by one mock server.
pub struct Harness {
    pub server: MockContactsServer,
    pub settings: SyncSettings,
    pub engine: Arc<RequestEngine>,
    pub auth: Arc<AuthSessionManager>,
    pub factory: RequestFactory,
    pub store: Arc<MemoryContactStore>,
    pub credentials: Arc<MemoryCredentialStore>,
    pub reconciler: Reconciler,
}

impl Harness {
    pub async fn start() -> Self {
        Self::with_settings(SyncSettings::for_testing()).await
    }

    pub async fn with_settings(settings: SyncSettings) -> Self {
        let server = MockContactsServer::start().await;
        let throttle = Arc::new(ThrottleController::new(settings.throttle.clone()));
        let engine = Arc::new(
            RequestEngine::new(&settings, throttle, SyncCoordinator::new())
                .expect("engine should build"),
        );
        let factory = RequestFactory::new(server.endpoints());
        let credentials = Arc::new(MemoryCredentialStore::with_secret(ACCOUNT, REFRESH_TOKEN));
        let auth = AuthSessionManager::install(
            oauth(),
            factory.clone(),
            Arc::clone(&engine),
            credentials.clone(),
        );
        let store = Arc::new(MemoryContactStore::new());
        let reconciler = Reconciler::new(
            Arc::clone(&engine),
            Arc::clone(&auth),
            factory.clone(),
            store.clone(),
            settings.clone(),
        );

        Self {
            server,
            settings,
            engine,
            auth,
            factory,
            store,
            credentials,
            reconciler,
        }
    }

    /// Run one pass starting at `started_at`.
    pub async fn run_at(&self, scope: &SyncScope, started_at: i64) -> ScopeOutcome {
        let ctx = SyncContext::starting_at(started_at, CancellationToken::new());
        self.reconciler.reconcile(scope, &ctx).await
    }

    pub async fn run(&self, scope: &SyncScope) -> ScopeOutcome {
        self.run_at(scope, PASS_START).await
    }

    /// Run a pass and carry its state into the returned scope.
    pub async fn run_and_advance(&self, scope: SyncScope, started_at: i64) -> (SyncScope, ScopeOutcome) {
        let outcome = self.run_at(&scope, started_at).await;
        let next = match &outcome.next_state {
            Some(state) => scope.with_state(state.clone()),
            None => scope,
        };
        (next, outcome)
    }

    pub fn locals(&self) -> Vec<ContactRecord> {
        use contactsync::storage::ContactStore;
        self.store.list_contacts(SCOPE).expect("store should list")
    }

    pub fn seed_local(&self, record: ContactRecord) -> ContactRecord {
        self.store.seed_contact(SCOPE, record)
    }
}

/// A reconciler whose endpoints refuse every connection.
pub fn offline_reconciler(store: Arc<MemoryContactStore>) -> Reconciler {
    let settings = SyncSettings::for_testing();
    let throttle = Arc::new(ThrottleController::new(settings.throttle.clone()));
    let engine = Arc::new(
        RequestEngine::new(&settings, throttle, SyncCoordinator::new())
            .expect("engine should build"),
    );
    let factory = RequestFactory::new(Endpoints::loopback("http://127.0.0.1:9"));
    let auth = AuthSessionManager::install(
        oauth(),
        factory.clone(),
        Arc::clone(&engine),
        Arc::new(MemoryCredentialStore::with_secret(ACCOUNT, REFRESH_TOKEN)),
    );
    Reconciler::new(engine, auth, factory, store, settings)
}
