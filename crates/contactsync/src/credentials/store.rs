//! Credential storage abstraction

use crate::error::SyncResult;
use crate::secret::Secret;

/// Trait for credential storage backends.
///
/// Keys are account names as given by [`normalize_account`].
pub trait CredentialStore: Send + Sync {
    /// Store the secret for an account, replacing any previous value.
    fn save(&self, account: &str, secret: &Secret) -> SyncResult<()>;

    /// Load the secret for an account.
    fn load(&self, account: &str) -> SyncResult<Option<Secret>>;

    /// Delete the secret for an account. Deleting a missing account is not an error.
    fn delete(&self, account: &str) -> SyncResult<()>;

    /// Check if a secret exists for an account.
    fn exists(&self, account: &str) -> bool {
        matches!(self.load(account), Ok(Some(_)))
    }
}

/// Canonical account key: trimmed and lower-cased.
pub fn normalize_account(account: &str) -> String {
    account.trim().to_lowercase()
}
