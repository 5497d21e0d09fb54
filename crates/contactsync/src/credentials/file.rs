//! Encrypted file credential storage backend

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use zeroize::Zeroize;

use super::store::{normalize_account, CredentialStore};
use crate::error::{SyncError, SyncResult};
use crate::secret::Secret;

const NONCE_LEN: usize = 12;

#[derive(Serialize, Deserialize)]
struct StoredCredential {
    secret: Secret,
    saved_at: DateTime<Utc>,
}

/// Credential store keeping every account in one AES-256-GCM encrypted file.
///
/// The file holds base64 of `nonce || ciphertext`; the plaintext is a JSON map
/// from account to credential.
pub struct FileCredentialStore {
    path: PathBuf,
    key: [u8; 32],
    lock: Mutex<()>,
}

impl FileCredentialStore {
    /// Create a store at `path` encrypted with `key`.
    pub fn new(path: impl Into<PathBuf>, key: [u8; 32]) -> Self {
        Self {
            path: path.into(),
            key,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn cipher(&self) -> SyncResult<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| SyncError::credential(format!("Encryption init failed: {e}")))
    }

    fn encrypt(&self, data: &[u8]) -> SyncResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let ciphertext = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce_bytes), data)
            .map_err(|e| SyncError::credential(format!("Encryption failed: {e}")))?;

        let mut result = nonce_bytes.to_vec();
        result.extend(ciphertext);
        Ok(result)
    }

    fn decrypt(&self, data: &[u8]) -> SyncResult<Vec<u8>> {
        if data.len() < NONCE_LEN {
            return Err(SyncError::credential("Invalid encrypted data"));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        self.cipher()?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| SyncError::credential(format!("Decryption failed: {e}")))
    }

    fn read_all(&self) -> SyncResult<BTreeMap<String, StoredCredential>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let encoded = std::fs::read_to_string(&self.path)?;
        let encrypted = BASE64
            .decode(encoded.trim())
            .map_err(|e| SyncError::credential(format!("Invalid credential file: {e}")))?;
        let mut plaintext = self.decrypt(&encrypted)?;
        let parsed = serde_json::from_slice(&plaintext)
            .map_err(|e| SyncError::credential(format!("Invalid credential data: {e}")));
        plaintext.zeroize();
        parsed
    }

    fn write_all(&self, entries: &BTreeMap<String, StoredCredential>) -> SyncResult<()> {
        if entries.is_empty() {
            if self.path.exists() {
                std::fs::remove_file(&self.path)?;
            }
            return Ok(());
        }

        let mut json = serde_json::to_vec(entries)?;
        let encrypted = self.encrypt(&json);
        json.zeroize();
        let encoded = BASE64.encode(encrypted?);

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, encoded)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    fn guard(&self) -> SyncResult<std::sync::MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| SyncError::credential("credential store lock poisoned"))
    }
}

impl std::fmt::Debug for FileCredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCredentialStore")
            .field("path", &self.path)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl Drop for FileCredentialStore {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl CredentialStore for FileCredentialStore {
    fn save(&self, account: &str, secret: &Secret) -> SyncResult<()> {
        let _guard = self.guard()?;
        let mut entries = self.read_all()?;
        entries.insert(
            normalize_account(account),
            StoredCredential {
                secret: secret.clone(),
                saved_at: Utc::now(),
            },
        );
        self.write_all(&entries)
    }

    fn load(&self, account: &str) -> SyncResult<Option<Secret>> {
        let _guard = self.guard()?;
        let mut entries = self.read_all()?;
        match entries.remove(&normalize_account(account)) {
            Some(stored) if stored.secret.is_empty() => Err(SyncError::credential(format!(
                "Stored credential for '{account}' is empty"
            ))),
            Some(stored) => Ok(Some(stored.secret.clone())),
            None => Ok(None),
        }
    }

    fn delete(&self, account: &str) -> SyncResult<()> {
        let _guard = self.guard()?;
        let mut entries = self.read_all()?;
        if entries.remove(&normalize_account(account)).is_some() {
            self.write_all(&entries)?;
        }
        Ok(())
    }
}
