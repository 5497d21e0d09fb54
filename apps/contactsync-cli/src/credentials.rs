//! Encryption key for the credential file

use std::hash::{Hash, Hasher};
use zeroize::Zeroize;

const KEY_SALT: &str = "contactsync-credential-key-v1";

/// Key derived from host, user and home directory.
///
/// Ties `credentials.enc` to the machine and login that wrote it. Each 8-byte
/// segment of the key hashes the identity under a different segment index.
pub fn machine_key() -> [u8; 32] {
    let mut identity = machine_identity();
    let key = derive_key(&identity);
    identity.zeroize();
    key
}

fn machine_identity() -> String {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_default();
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default();
    let home = dirs::home_dir()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{host}\n{user}\n{home}")
}

fn derive_key(identity: &str) -> [u8; 32] {
    let mut key = [0u8; 32];
    for (segment, chunk) in key.chunks_mut(8).enumerate() {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        KEY_SALT.hash(&mut hasher);
        segment.hash(&mut hasher);
        identity.hash(&mut hasher);
        chunk.copy_from_slice(&hasher.finish().to_le_bytes());
    }
    key
}
