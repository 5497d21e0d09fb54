//! Persistence of per-account refresh tokens.

mod file;
mod memory;
mod store;

pub use file::FileCredentialStore;
pub use memory::MemoryCredentialStore;
pub use store::{normalize_account, CredentialStore};
