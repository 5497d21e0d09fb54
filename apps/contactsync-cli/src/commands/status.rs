//! Status command - Show configured scopes and their saved state

use chrono::{DateTime, Utc};
use clap::Args;
use contactsync::credentials::{CredentialStore, FileCredentialStore};
use contactsync::state::{JsonFileStateStore, StateStore};
use contactsync::ScopeState;

use crate::config::{CliConfig, ConfigPaths};
use crate::credentials::machine_key;
use crate::error::CliResult;

/// Arguments for the status command
#[derive(Args)]
pub struct StatusArgs {}

/// Execute the status command
pub async fn execute(_args: StatusArgs) -> CliResult<()> {
    let paths = ConfigPaths::new()?;
    for line in status_lines(&paths)? {
        println!("{line}");
    }
    Ok(())
}

fn status_lines(paths: &ConfigPaths) -> CliResult<Vec<String>> {
    let config = CliConfig::load(paths)?;
    let state = JsonFileStateStore::new(&paths.state_file);
    let credentials = FileCredentialStore::new(&paths.credentials_file, machine_key());

    let mut lines = Vec::new();
    match state.load_throttle_delay()? {
        Some(delay) => lines.push(format!("Throttle delay: {delay} ms (calibrated)")),
        None => lines.push(format!(
            "Throttle delay: {} ms (not calibrated)",
            config.settings.throttle.initial_delay_ms
        )),
    }

    if config.scopes.is_empty() {
        lines.push("No scopes configured.".to_string());
    }
    for scope in &config.scopes {
        let authorized = if credentials.exists(&scope.account) {
            "authorized"
        } else {
            "not authorized"
        };
        let saved = state.load_scope_state(&scope.id)?.unwrap_or_default();
        lines.push(format!(
            "{} ({}, {authorized}): {}",
            scope.id,
            scope.account,
            describe(&saved)
        ));
    }
    Ok(lines)
}

fn describe(state: &ScopeState) -> String {
    if state.last_sync_timestamp == 0 {
        return "never synced".to_string();
    }
    let when = DateTime::<Utc>::from_timestamp(state.last_sync_timestamp, 0)
        .map_or_else(|| state.last_sync_timestamp.to_string(), |t| t.to_rfc3339());
    let mut text = format!(
        "last sync {when}, {} contacts, {} groups",
        state.known_contact_ids.len(),
        state.known_group_ids.len()
    );
    if state.reset_flag {
        text.push_str(", reset pending");
    }
    text
}
