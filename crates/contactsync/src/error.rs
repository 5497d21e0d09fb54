//! Error types for contact synchronization.

use thiserror::Error;

use crate::session::ActivityKind;

/// Result type alias using `SyncError`.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while talking to the contacts service or reconciling a scope.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Configuration validation error, or a transport that could not be built.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Stored credential is malformed or the credential store is unusable.
    #[error("Credential storage error: {message}")]
    Credential { message: String },

    /// No session exists for the account.
    #[error("Account '{account}' is not authenticated")]
    NotAuthenticated { account: String },

    /// The remote rejected the bearer token (400/401/403).
    #[error("Authorization failed for '{account}' (HTTP {status})")]
    Unauthorized { account: String, status: u16 },

    /// The refresh token itself was rejected; the user must authorize again.
    #[error("Re-authentication required for '{account}': {message}")]
    ReauthenticationRequired { account: String, message: String },

    /// Transport failure or timeout.
    #[error("Offline: {message}")]
    Offline { message: String },

    /// The remote answered 503.
    #[error("Rate limited by remote service")]
    RateLimited,

    /// Any other unexpected HTTP status.
    #[error("Remote error (HTTP {status}): {body}")]
    Remote { status: u16, body: String },

    /// Response body could not be decoded.
    #[error("Parse error: {message}")]
    Parse { message: String },

    /// The storage collaborator failed; fatal for the scope.
    #[error("Storage error: {message}")]
    Storage { message: String },

    /// A sync pass or calibration run is already in progress.
    #[error("A {active} is already in progress")]
    Busy { active: ActivityKind },

    /// The pass was canceled between record-level steps.
    #[error("Synchronization canceled")]
    Cancelled,

    /// Calibration aborted on a non rate-limit error.
    #[error("Calibration failed at {delay_ms} ms: {message}")]
    CalibrationFailed { delay_ms: u64, message: String },

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parsing error.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a credential error.
    pub fn credential(message: impl Into<String>) -> Self {
        Self::Credential {
            message: message.into(),
        }
    }

    /// Create an offline error.
    pub fn offline(message: impl Into<String>) -> Self {
        Self::Offline {
            message: message.into(),
        }
    }

    /// Create a parse error.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Transient failures that the next scheduled pass is expected to clear.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Offline { .. } | SyncError::RateLimited)
    }

    /// Failures that stop every further pass for the account until the user acts.
    pub fn is_account_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::ReauthenticationRequired { .. }
                | SyncError::NotAuthenticated { .. }
                | SyncError::Credential { .. }
                | SyncError::Config { .. }
        )
    }
}
