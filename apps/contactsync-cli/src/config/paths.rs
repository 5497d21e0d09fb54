//! Platform-specific configuration paths

use crate::error::{CliError, CliResult};
use std::path::{Path, PathBuf};

/// Environment variable overriding the configuration directory.
pub const CONFIG_DIR_ENV: &str = "CONTACTSYNC_CONFIG_DIR";

/// Files the CLI reads and writes
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub config_dir: PathBuf,
    /// Settings, endpoints, client registration and scopes
    pub config_file: PathBuf,
    /// Encrypted refresh tokens
    pub credentials_file: PathBuf,
    /// Per-scope sync state and the calibrated throttle delay
    pub state_file: PathBuf,
    /// The local address books
    pub contacts_file: PathBuf,
}

impl ConfigPaths {
    /// Paths under `CONTACTSYNC_CONFIG_DIR`, or the platform config directory:
    /// - Linux: ~/.config/contactsync/
    /// - macOS: ~/Library/Application Support/contactsync/
    /// - Windows: %APPDATA%\contactsync\
    pub fn new() -> CliResult<Self> {
        if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
            return Ok(Self::in_dir(dir));
        }
        let base_dir = dirs::config_dir().ok_or_else(|| {
            CliError::Config("Could not determine configuration directory".to_string())
        })?;
        Ok(Self::in_dir(base_dir.join("contactsync")))
    }

    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let config_dir = dir.as_ref().to_path_buf();
        Self {
            config_file: config_dir.join("config.json"),
            credentials_file: config_dir.join("credentials.enc"),
            state_file: config_dir.join("state.json"),
            contacts_file: config_dir.join("contacts.json"),
            config_dir,
        }
    }

    pub fn ensure_dir_exists(&self) -> CliResult<()> {
        if !self.config_dir.exists() {
            std::fs::create_dir_all(&self.config_dir)?;
        }
        Ok(())
    }
}
