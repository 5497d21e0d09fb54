//! Entry points: scheduled and manual passes, cancellation and calibration.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::auth::AuthSessionManager;
use crate::client::RequestEngine;
use crate::config::{Endpoints, OAuthClientConfig, SyncSettings};
use crate::credentials::{normalize_account, CredentialStore};
use crate::error::{SyncError, SyncResult};
use crate::reconcile::{PassStatus, Reconciler, ScopeOutcome};
use crate::request::RequestFactory;
use crate::scope::{ScopeFilter, SyncScope};
use crate::session::{ActivityKind, SyncContext, SyncCoordinator};
use crate::state::StateStore;
use crate::storage::ContactStore;
use crate::summary::ScopeSummary;
use crate::throttle::{CalibrationReport, HttpSampler, ThrottleController};

/// Persistence collaborators of a service.
#[derive(Clone)]
pub struct ServiceStores {
    pub credentials: Arc<dyn CredentialStore>,
    pub contacts: Arc<dyn ContactStore>,
    pub state: Arc<dyn StateStore>,
}

/// Why a selected scope did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Cancelled,
    /// An earlier scope of the same account hit an account-fatal error.
    AccountHalted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedScope {
    pub scope_id: String,
    pub reason: SkipReason,
}

/// Everything one session did.
#[derive(Debug)]
pub struct SessionReport {
    pub manual: bool,
    pub started_at: DateTime<Utc>,
    pub outcomes: Vec<ScopeOutcome>,
    pub skipped: Vec<SkippedScope>,
    /// Sum of every scope summary.
    pub totals: ScopeSummary,
}

impl SessionReport {
    fn new(manual: bool, started_at: DateTime<Utc>) -> Self {
        Self {
            manual,
            started_at,
            outcomes: Vec::new(),
            skipped: Vec::new(),
            totals: ScopeSummary::default(),
        }
    }

    fn record(&mut self, outcome: ScopeOutcome) {
        self.totals.merge(&outcome.summary);
        self.outcomes.push(outcome);
    }

    /// Outcome of the scope with `scope_id`.
    pub fn outcome(&self, scope_id: &str) -> Option<&ScopeOutcome> {
        self.outcomes.iter().find(|o| o.scope_id == scope_id)
    }

    pub fn completed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status.is_completed())
            .count()
    }

    /// Every selected scope ran and completed.
    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty() && self.completed() == self.outcomes.len()
    }
}

/// Owns the process-wide activity guard and runs passes over the configured scopes.
pub struct SyncService {
    settings: SyncSettings,
    scopes: Vec<SyncScope>,
    engine: Arc<RequestEngine>,
    auth: Arc<AuthSessionManager>,
    factory: RequestFactory,
    reconciler: Reconciler,
    state: Arc<dyn StateStore>,
    coordinator: SyncCoordinator,
    running: Mutex<CancellationToken>,
    pending: Mutex<Option<CancellationToken>>,
}

impl SyncService {
    /// Wire the engine, auth manager and reconciler over `stores`.
    ///
    /// The operating throttle delay is restored from the state store.
    pub fn new(
        settings: SyncSettings,
        endpoints: Endpoints,
        oauth: OAuthClientConfig,
        stores: ServiceStores,
        scopes: Vec<SyncScope>,
    ) -> SyncResult<Self> {
        settings.validate()?;
        let mut ids = BTreeSet::new();
        for scope in &scopes {
            scope.validate()?;
            if !ids.insert(scope.id.as_str()) {
                return Err(SyncError::config(format!("duplicate scope id '{}'", scope.id)));
            }
        }

        let throttle = Arc::new(ThrottleController::from_store(
            settings.throttle.clone(),
            stores.state.as_ref(),
        )?);
        let coordinator = SyncCoordinator::new();
        let engine = Arc::new(RequestEngine::new(&settings, throttle, coordinator.clone())?);
        let factory = RequestFactory::new(endpoints);
        let auth = AuthSessionManager::install(
            oauth,
            factory.clone(),
            Arc::clone(&engine),
            stores.credentials,
        );
        let reconciler = Reconciler::new(
            Arc::clone(&engine),
            Arc::clone(&auth),
            factory.clone(),
            stores.contacts,
            settings.clone(),
        );

        Ok(Self {
            settings,
            scopes,
            engine,
            auth,
            factory,
            reconciler,
            state: stores.state,
            coordinator,
            running: Mutex::new(CancellationToken::new()),
            pending: Mutex::new(None),
        })
    }

    pub fn auth(&self) -> &Arc<AuthSessionManager> {
        &self.auth
    }

    pub fn throttle(&self) -> &Arc<ThrottleController> {
        self.engine.throttle()
    }

    pub fn scopes(&self) -> &[SyncScope] {
        &self.scopes
    }

    pub fn is_busy(&self) -> bool {
        self.coordinator.current().is_some()
    }

    /// Run a pass after `delay_ms`, replacing any pass still waiting to start.
    pub fn schedule_sync(self: &Arc<Self>, delay_ms: u64) -> JoinHandle<()> {
        let token = CancellationToken::new();
        match self.pending.lock() {
            Ok(mut pending) => {
                if let Some(previous) = pending.replace(token.clone()) {
                    previous.cancel();
                    debug!("Replaced pending scheduled pass");
                }
            }
            Err(_) => warn!("Pending schedule lock poisoned"),
        }

        let service = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {
                    debug!("Scheduled pass superseded");
                    return;
                }
                () = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
            }
            match service.begin_sync(false, ScopeFilter::All).await {
                Ok(report) => debug!(completed = report.completed(), "Scheduled pass finished"),
                Err(err) => warn!(error = %err, "Scheduled synchronization did not run"),
            }
        })
    }

    /// Run one session over every scope selected by `filter`.
    ///
    /// Fails with [`SyncError::Busy`] while another pass or a calibration is
    /// active. Per-scope failures are reported in the returned report.
    #[instrument(skip(self, filter))]
    pub async fn begin_sync(&self, manual: bool, filter: ScopeFilter) -> SyncResult<SessionReport> {
        let _guard = self.coordinator.try_begin(ActivityKind::Sync)?;
        let cancel = CancellationToken::new();
        *self
            .running
            .lock()
            .map_err(|_| SyncError::storage("cancel handle lock poisoned"))? = cancel.clone();

        let mut report = SessionReport::new(manual, Utc::now());
        let selected: Vec<&SyncScope> = self.scopes.iter().filter(|s| filter.matches(s)).collect();
        info!(scopes = selected.len(), "Synchronization started");

        let mut halted: BTreeSet<String> = BTreeSet::new();
        for (i, scope) in selected.into_iter().enumerate() {
            if i > 0 && self.settings.scope_delay_ms > 0 {
                tokio::select! {
                    () = cancel.cancelled() => {}
                    () = tokio::time::sleep(Duration::from_millis(self.settings.scope_delay_ms)) => {}
                }
            }
            if cancel.is_cancelled() {
                report.skipped.push(SkippedScope {
                    scope_id: scope.id.clone(),
                    reason: SkipReason::Cancelled,
                });
                continue;
            }

            let account = normalize_account(&scope.account);
            if halted.contains(&account) {
                report.skipped.push(SkippedScope {
                    scope_id: scope.id.clone(),
                    reason: SkipReason::AccountHalted,
                });
                continue;
            }

            let outcome = self.run_scope(scope, &cancel).await;
            if outcome.status.error().is_some_and(SyncError::is_account_fatal) {
                warn!(account = %account, scope = %scope.id, "Skipping remaining scopes of account");
                halted.insert(account);
            }
            report.record(outcome);
        }

        info!(
            completed = report.completed(),
            skipped = report.skipped.len(),
            contacts = %report.totals.contacts,
            "Synchronization finished"
        );
        Ok(report)
    }

    async fn run_scope(&self, scope: &SyncScope, cancel: &CancellationToken) -> ScopeOutcome {
        let state = match self.state.load_scope_state(&scope.id) {
            Ok(state) => state.unwrap_or_else(|| scope.state.clone()),
            Err(err) => {
                error!(scope = %scope.id, error = %err, "Failed to load scope state");
                return ScopeOutcome::failed(scope, err);
            }
        };
        let scope = scope.clone().with_state(state);
        let ctx = SyncContext::new(cancel.clone());

        let mut outcome = self.reconciler.reconcile(&scope, &ctx).await;
        if let Some(next) = &outcome.next_state {
            if let Err(err) = self.state.save_scope_state(&scope.id, next) {
                error!(scope = %scope.id, error = %err, "Failed to persist scope state");
                outcome.status = PassStatus::Failed(err);
                outcome.next_state = None;
            }
        }
        outcome
    }

    /// Cancel the running pass and any pass waiting to start.
    pub fn cancel(&self) {
        if let Ok(running) = self.running.lock() {
            running.cancel();
        }
        if let Ok(mut pending) = self.pending.lock() {
            if let Some(token) = pending.take() {
                token.cancel();
            }
        }
        info!("Cancellation requested");
    }

    /// Calibrate the throttle delay against `account`, starting at
    /// `starting_delay_ms` or the configured initial delay.
    #[instrument(skip(self))]
    pub async fn calibrate(
        &self,
        account: &str,
        starting_delay_ms: Option<u64>,
    ) -> SyncResult<CalibrationReport> {
        let _guard = self.coordinator.try_begin(ActivityKind::Calibration)?;
        let throttle = self.engine.throttle();
        let start = starting_delay_ms.unwrap_or(throttle.config().initial_delay_ms);
        let sampler = HttpSampler::new(
            Arc::clone(&self.engine),
            Arc::clone(&self.auth),
            self.factory.clone(),
            normalize_account(account),
        );
        throttle.calibrate(&sampler, start, self.state.as_ref()).await
    }
}

impl std::fmt::Debug for SyncService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncService")
            .field("scopes", &self.scopes.len())
            .field("active", &self.coordinator.current())
            .finish_non_exhaustive()
    }
}
