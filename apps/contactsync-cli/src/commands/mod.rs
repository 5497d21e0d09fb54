//! CLI command implementations

pub mod auth_url;
pub mod calibrate;
pub mod login;
pub mod logout;
pub mod status;
pub mod sync;

use std::sync::Arc;

use contactsync::credentials::FileCredentialStore;
use contactsync::state::JsonFileStateStore;
use contactsync::storage::JsonFileContactStore;
use contactsync::{ServiceStores, SyncService};

use crate::config::{CliConfig, ConfigPaths};
use crate::credentials::machine_key;
use crate::error::CliResult;

/// Load `config.json` and wire a service over the files in `paths`.
pub(crate) fn build_service(paths: &ConfigPaths) -> CliResult<(CliConfig, SyncService)> {
    paths.ensure_dir_exists()?;
    let config = CliConfig::load(paths)?;
    let stores = ServiceStores {
        credentials: Arc::new(FileCredentialStore::new(
            &paths.credentials_file,
            machine_key(),
        )),
        contacts: Arc::new(JsonFileContactStore::new(&paths.contacts_file)),
        state: Arc::new(JsonFileStateStore::new(&paths.state_file)),
    };
    let service = SyncService::new(
        config.settings.clone(),
        config.endpoints.clone(),
        config.oauth.clone(),
        stores,
        config.scopes.clone(),
    )?;
    Ok((config, service))
}
