use std::collections::HashMap;
use std::sync::Mutex;

use super::store::{normalize_account, CredentialStore};
use crate::error::{SyncError, SyncResult};
use crate::secret::Secret;

/// Credential store held in process memory.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    secrets: Mutex<HashMap<String, Secret>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with one account.
    pub fn with_secret(account: &str, secret: impl Into<Secret>) -> Self {
        let store = Self::new();
        if let Ok(mut secrets) = store.secrets.lock() {
            secrets.insert(normalize_account(account), secret.into());
        }
        store
    }

    fn lock(&self) -> SyncResult<std::sync::MutexGuard<'_, HashMap<String, Secret>>> {
        self.secrets
            .lock()
            .map_err(|_| SyncError::credential("credential store lock poisoned"))
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn save(&self, account: &str, secret: &Secret) -> SyncResult<()> {
        self.lock()?.insert(normalize_account(account), secret.clone());
        Ok(())
    }

    fn load(&self, account: &str) -> SyncResult<Option<Secret>> {
        Ok(self.lock()?.get(&normalize_account(account)).cloned())
    }

    fn delete(&self, account: &str) -> SyncResult<()> {
        self.lock()?.remove(&normalize_account(account));
        Ok(())
    }
}
