//! OAuth2 session lifecycle per account.
//!
//! Sessions are cached behind an `RwLock` and replaced as a whole. Refreshes of
//! one account are serialized by a per-account mutex; the session generation
//! lets a waiter detect that another task already refreshed.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::client::{
    dispatch, AuthFailureListener, Failure, HttpReply, OutcomeHandler, RequestEngine,
};
use crate::config::OAuthClientConfig;
use crate::credentials::{normalize_account, CredentialStore};
use crate::error::{SyncError, SyncResult};
use crate::request::RequestFactory;
use crate::secret::Secret;

/// Access tokens this close to expiry are treated as expired.
const EXPIRY_SKEW_SECS: i64 = 60;

/// The one authoritative session of an account.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub account: String,
    /// `None` until the first refresh, and after the remote rejected it.
    pub access_token: Option<Secret>,
    pub refresh_token: Secret,
    pub expires_at: Option<DateTime<Utc>>,
    /// Incremented on every refresh or store.
    pub generation: u64,
}

impl AuthSession {
    /// The access token, unless missing or about to expire.
    pub fn usable_access_token(&self) -> Option<&Secret> {
        let token = self.access_token.as_ref()?;
        match self.expires_at {
            Some(expires_at) if expires_at <= Utc::now() + Duration::seconds(EXPIRY_SKEW_SECS) => {
                None
            }
            _ => Some(token),
        }
    }
}

/// Token endpoint response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Secret,
    #[serde(default)]
    refresh_token: Option<Secret>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Maps token endpoint outcomes onto errors. Any 400/401/403 means the grant is dead.
struct TokenExchange<'a> {
    account: &'a str,
}

impl OutcomeHandler for TokenExchange<'_> {
    type Output = SyncResult<TokenResponse>;

    fn on_success(&mut self, reply: HttpReply) -> Self::Output {
        serde_json::from_str(&reply.body)
            .map_err(|e| SyncError::parse(format!("Invalid token response: {e}")))
    }

    fn on_created(&mut self, reply: HttpReply) -> Self::Output {
        self.on_success(reply)
    }

    fn on_error(&mut self, failure: Failure) -> Self::Output {
        match failure {
            Failure::Offline(message) => Err(SyncError::Offline { message }),
            Failure::Status(reply) => Err(SyncError::Remote {
                status: reply.status,
                body: reply.body,
            }),
        }
    }

    fn on_auth_failure(&mut self, reply: HttpReply) -> Self::Output {
        Err(SyncError::ReauthenticationRequired {
            account: self.account.to_string(),
            message: format!("token endpoint returned {}: {}", reply.status, reply.body),
        })
    }

    fn on_rate_limited(&mut self, _reply: HttpReply) -> Self::Output {
        Err(SyncError::RateLimited)
    }
}

/// Owns access and refresh tokens for every account.
pub struct AuthSessionManager {
    oauth: OAuthClientConfig,
    factory: RequestFactory,
    engine: Arc<RequestEngine>,
    store: Arc<dyn CredentialStore>,
    sessions: RwLock<HashMap<String, Arc<AuthSession>>>,
    refresh_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AuthSessionManager {
    pub fn new(
        oauth: OAuthClientConfig,
        factory: RequestFactory,
        engine: Arc<RequestEngine>,
        store: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            oauth,
            factory,
            engine,
            store,
            sessions: RwLock::new(HashMap::new()),
            refresh_locks: StdMutex::new(HashMap::new()),
        }
    }

    /// Create the manager and register it as the engine's auth failure listener.
    pub fn install(
        oauth: OAuthClientConfig,
        factory: RequestFactory,
        engine: Arc<RequestEngine>,
        store: Arc<dyn CredentialStore>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self::new(oauth, factory, Arc::clone(&engine), store));
        let listener: Arc<dyn AuthFailureListener> = manager.clone();
        engine.set_auth_failure_listener(Arc::downgrade(&listener));
        manager
    }

    /// Consent page URL for `account`.
    pub fn authorization_url(&self, account: &str) -> SyncResult<String> {
        Ok(self.factory.authenticate(&self.oauth, account)?.url)
    }

    /// Snapshot of the cached session.
    pub async fn session(&self, account: &str) -> Option<Arc<AuthSession>> {
        self.sessions
            .read()
            .await
            .get(&normalize_account(account))
            .cloned()
    }

    /// Current bearer token, refreshing first when none is cached.
    #[instrument(skip(self))]
    pub async fn get_token(&self, account: &str) -> SyncResult<Secret> {
        let session = self.load_session(account).await?;
        if let Some(token) = session.usable_access_token() {
            return Ok(token.clone());
        }
        self.refresh(account).await
    }

    /// Persist `refresh_token` and replace the cached session.
    #[instrument(skip(self, refresh_token))]
    pub async fn store_token(&self, account: &str, refresh_token: Secret) -> SyncResult<()> {
        let key = normalize_account(account);
        self.store.save(&key, &refresh_token)?;

        let mut sessions = self.sessions.write().await;
        let generation = sessions.get(&key).map_or(0, |s| s.generation) + 1;
        sessions.insert(
            key.clone(),
            Arc::new(AuthSession {
                account: key,
                access_token: None,
                refresh_token,
                expires_at: None,
                generation,
            }),
        );
        info!("Stored refresh token");
        Ok(())
    }

    /// Delete the persisted and cached session.
    #[instrument(skip(self))]
    pub async fn remove_token(&self, account: &str) -> SyncResult<()> {
        let key = normalize_account(account);
        self.store.delete(&key)?;
        self.sessions.write().await.remove(&key);
        info!("Removed session");
        Ok(())
    }

    /// Exchange an authorization code for tokens and store the refresh token.
    #[instrument(skip(self, code))]
    pub async fn exchange_code(&self, account: &str, code: &str) -> SyncResult<()> {
        let key = normalize_account(account);
        let request = self.factory.token_request(&self.oauth, &key, code)?;
        let outcome = self.engine.send(&request).await;
        let response = dispatch(outcome, &mut TokenExchange { account: &key })?;

        let refresh_token = response.refresh_token.clone().ok_or_else(|| {
            SyncError::credential("authorization response did not include a refresh token")
        })?;
        self.store.save(&key, &refresh_token)?;

        let mut sessions = self.sessions.write().await;
        let generation = sessions.get(&key).map_or(0, |s| s.generation) + 1;
        sessions.insert(key.clone(), Arc::new(session_from(&key, response, refresh_token, generation)));
        info!(generation, "Authorization code exchanged");
        Ok(())
    }

    /// Exchange the refresh token for a new access token.
    ///
    /// If another task refreshed while this one waited for the account lock,
    /// its token is returned without a second exchange.
    #[instrument(skip(self))]
    pub async fn refresh(&self, account: &str) -> SyncResult<Secret> {
        let key = normalize_account(account);
        let observed = self.load_session(&key).await?.generation;

        let lock = self.refresh_lock(&key)?;
        let _guard = lock.lock().await;

        let current = self.load_session(&key).await?;
        if current.generation != observed {
            if let Some(token) = current.usable_access_token() {
                debug!(generation = current.generation, "Session already refreshed");
                return Ok(token.clone());
            }
        }

        let request = self
            .factory
            .refresh_request(&self.oauth, &key, &current.refresh_token)?;
        let outcome = self.engine.send(&request).await;
        let response = match dispatch(outcome, &mut TokenExchange { account: &key }) {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "Token refresh failed");
                return Err(err);
            }
        };

        let refresh_token = match &response.refresh_token {
            Some(rotated) if rotated != &current.refresh_token => {
                self.store.save(&key, rotated)?;
                rotated.clone()
            }
            _ => current.refresh_token.clone(),
        };
        let token = response.access_token.clone();

        let mut sessions = self.sessions.write().await;
        let generation = sessions
            .get(&key)
            .map_or(current.generation, |s| s.generation)
            + 1;
        sessions.insert(key.clone(), Arc::new(session_from(&key, response, refresh_token, generation)));
        info!(generation, "Access token refreshed");
        Ok(token)
    }

    /// Drop the cached access token so the next `get_token` refreshes.
    pub async fn invalidate(&self, account: &str) {
        let key = normalize_account(account);
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(&key) {
            if session.access_token.is_some() {
                let replaced = AuthSession {
                    access_token: None,
                    expires_at: None,
                    ..AuthSession::clone(session)
                };
                sessions.insert(key, Arc::new(replaced));
            }
        }
    }

    async fn load_session(&self, account: &str) -> SyncResult<Arc<AuthSession>> {
        let key = normalize_account(account);
        if let Some(session) = self.sessions.read().await.get(&key) {
            return Ok(Arc::clone(session));
        }

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(&key) {
            return Ok(Arc::clone(session));
        }
        let refresh_token = self
            .store
            .load(&key)?
            .ok_or_else(|| SyncError::NotAuthenticated {
                account: key.clone(),
            })?;
        debug!(account = %key, "Loaded persisted session");
        let session = Arc::new(AuthSession {
            account: key.clone(),
            access_token: None,
            refresh_token,
            expires_at: None,
            generation: 0,
        });
        sessions.insert(key, Arc::clone(&session));
        Ok(session)
    }

    fn refresh_lock(&self, key: &str) -> SyncResult<Arc<Mutex<()>>> {
        let mut locks = self
            .refresh_locks
            .lock()
            .map_err(|_| SyncError::credential("refresh lock table poisoned"))?;
        Ok(Arc::clone(locks.entry(key.to_string()).or_default()))
    }
}

fn session_from(
    account: &str,
    response: TokenResponse,
    refresh_token: Secret,
    generation: u64,
) -> AuthSession {
    AuthSession {
        account: account.to_string(),
        expires_at: response
            .expires_in
            .map(|secs| Utc::now() + Duration::seconds(secs)),
        access_token: Some(response.access_token.clone()),
        refresh_token,
        generation,
    }
}

#[async_trait]
impl AuthFailureListener for AuthSessionManager {
    async fn on_auth_failure(&self, account: &str) {
        debug!(account, "Bearer token rejected, invalidating");
        self.invalidate(account).await;
    }
}

impl std::fmt::Debug for AuthSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSessionManager")
            .field("client_id", &self.oauth.client_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(expires_in: Option<i64>) -> AuthSession {
        AuthSession {
            account: "a@example.com".into(),
            access_token: Some(Secret::new("at")),
            refresh_token: Secret::new("rt"),
            expires_at: expires_in.map(|s| Utc::now() + Duration::seconds(s)),
            generation: 1,
        }
    }

    #[test]
    fn test_usable_access_token_respects_expiry() {
        assert!(session(None).usable_access_token().is_some());
        assert!(session(Some(3600)).usable_access_token().is_some());
        assert!(session(Some(30)).usable_access_token().is_none());
        assert!(session(Some(-10)).usable_access_token().is_none());
    }

    #[test]
    fn test_token_response_without_refresh_token() {
        let response: TokenResponse =
            serde_json::from_str(r#"{"access_token": "ya29.x", "expires_in": 3599, "token_type": "Bearer"}"#)
                .unwrap();
        assert!(response.refresh_token.is_none());
        assert_eq!(response.access_token.expose(), "ya29.x");
    }

    #[test]
    fn test_token_endpoint_rejection_requires_reauthentication() {
        for status in [400, 401, 403] {
            let outcome = crate::client::Outcome::from_reply(HttpReply::new(status, "invalid_grant"));
            let err = dispatch(outcome, &mut TokenExchange { account: "a" }).unwrap_err();
            assert!(err.is_account_fatal(), "status {status}");
        }
    }
}
