//! Configuration for the request engine, throttle and reconciliation passes.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{SyncError, SyncResult};
use crate::secret::Secret;

/// Default OAuth2 endpoint base of the contacts provider.
pub const DEFAULT_AUTH_BASE: &str = "https://accounts.google.com/o/oauth2";

/// Default base for the contacts feeds.
pub const DEFAULT_API_BASE: &str = "https://www.google.com";

/// OAuth2 scope granting read/write access to contacts.
pub const CONTACTS_SCOPE: &str = "https://www.google.com/m8/feeds";

/// Remote endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    /// OAuth2 base URL (`/auth` and `/token` are appended).
    pub auth_base: String,
    /// Contacts API base URL (`/m8/feeds/...` is appended).
    pub api_base: String,
    /// Keep plain `http://` for loopback hosts instead of upgrading to HTTPS.
    pub allow_insecure_loopback: bool,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            auth_base: DEFAULT_AUTH_BASE.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            allow_insecure_loopback: false,
        }
    }
}

impl Endpoints {
    /// Endpoints pointing at a local mock server.
    #[must_use]
    pub fn loopback(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            auth_base: format!("{base}/o/oauth2"),
            api_base: base.to_string(),
            allow_insecure_loopback: true,
        }
    }
}

/// OAuth2 installed-application client registration.
///
/// The client secret is redacted from [`Debug`] output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub client_secret: Secret,
    pub redirect_uri: String,
    #[serde(default = "default_scope")]
    pub scope: String,
}

fn default_scope() -> String {
    CONTACTS_SCOPE.to_string()
}

impl OAuthClientConfig {
    /// Create a client registration with the default contacts scope.
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: Secret::from(client_secret.into()),
            redirect_uri: redirect_uri.into(),
            scope: default_scope(),
        }
    }
}

/// Throttle calibration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Operating delay used until a calibrated value is persisted (default: 0ms).
    pub initial_delay_ms: u64,
    /// Sample requests per calibration run (default: 100).
    pub sample_count: u32,
    /// Delay increment after a run with rejections (default: 20ms).
    pub step_ms: u64,
    /// Optional ceiling for the candidate delay; `None` searches without bound.
    pub max_delay_ms: Option<u64>,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 0,
            sample_count: 100,
            step_ms: 20,
            max_delay_ms: None,
        }
    }
}

impl ThrottleConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.sample_count == 0 {
            return Err(SyncError::config("sample_count must be > 0"));
        }
        if self.step_ms == 0 {
            return Err(SyncError::config("step_ms must be > 0"));
        }
        if let Some(max) = self.max_delay_ms {
            if max < self.initial_delay_ms {
                return Err(SyncError::config("max_delay_ms must be >= initial_delay_ms"));
            }
        }
        Ok(())
    }
}

/// Settings shared by every pass in a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Request timeout in milliseconds; 0 disables the timeout.
    pub request_timeout_ms: u64,
    /// Contacts requested per page (`max-results`).
    pub page_size: u32,
    /// Pause between consecutive scopes in one session.
    pub scope_delay_ms: u64,
    /// Timestamps closer than this are treated as equal.
    pub timestamp_tolerance_secs: i64,
    /// User agent sent with every request.
    pub user_agent: String,
    /// Throttle settings.
    pub throttle: ThrottleConfig,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            page_size: 500,
            scope_delay_ms: 2_000,
            timestamp_tolerance_secs: 0,
            user_agent: format!("contactsync/{}", env!("CARGO_PKG_VERSION")),
            throttle: ThrottleConfig::default(),
        }
    }
}

impl SyncSettings {
    /// Settings tuned for tests: short timeout, no inter-scope pause.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            request_timeout_ms: 5_000,
            page_size: 25,
            scope_delay_ms: 0,
            ..Self::default()
        }
    }

    /// Request timeout, `None` when unbounded.
    #[must_use]
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.page_size == 0 {
            return Err(SyncError::config("page_size must be > 0"));
        }
        if self.timestamp_tolerance_secs < 0 {
            return Err(SyncError::config("timestamp_tolerance_secs must be >= 0"));
        }
        self.throttle.validate()
    }
}
