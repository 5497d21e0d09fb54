//! Configuration file handling

mod paths;

pub use paths::{ConfigPaths, CONFIG_DIR_ENV};

use contactsync::{Endpoints, OAuthClientConfig, SyncScope, SyncSettings};
use serde::{Deserialize, Serialize};

use crate::error::{CliError, CliResult};

/// Contents of `config.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub settings: SyncSettings,
    #[serde(default)]
    pub endpoints: Endpoints,
    pub oauth: OAuthClientConfig,
    #[serde(default)]
    pub scopes: Vec<SyncScope>,
}

impl CliConfig {
    /// Load and validate `config.json`.
    pub fn load(paths: &ConfigPaths) -> CliResult<Self> {
        if !paths.config_file.exists() {
            return Err(CliError::Config(format!(
                "{} not found",
                paths.config_file.display()
            )));
        }
        let content = std::fs::read_to_string(&paths.config_file)?;
        let config: CliConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CliResult<()> {
        if self.oauth.client_id.trim().is_empty() {
            return Err(CliError::Config("oauth.client_id is required".to_string()));
        }
        self.settings.validate()?;
        for scope in &self.scopes {
            scope.validate()?;
        }
        Ok(())
    }

    /// Scope ids configured for `account`.
    pub fn scopes_for(&self, account: &str) -> Vec<&str> {
        self.scopes
            .iter()
            .filter(|s| s.account.eq_ignore_ascii_case(account))
            .map(|s| s.id.as_str())
            .collect()
    }
}
