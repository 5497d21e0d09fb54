//! Sync command - Run one manual session

use std::collections::BTreeSet;

use clap::Args;
use contactsync::reconcile::PassStatus;
use contactsync::service::SkipReason;
use contactsync::{ScopeFilter, SessionReport};
use tracing::warn;

use super::build_service;
use crate::config::ConfigPaths;
use crate::error::{CliError, CliResult};

/// Arguments for the sync command
#[derive(Args)]
pub struct SyncArgs {
    /// Only sync these scopes
    #[arg(long = "scope", conflicts_with = "account")]
    pub scopes: Vec<String>,

    /// Only sync the scopes of this account
    #[arg(long)]
    pub account: Option<String>,
}

impl SyncArgs {
    fn filter(&self) -> ScopeFilter {
        if let Some(account) = &self.account {
            return ScopeFilter::Account(account.clone());
        }
        if self.scopes.is_empty() {
            ScopeFilter::All
        } else {
            ScopeFilter::Scopes(self.scopes.iter().cloned().collect::<BTreeSet<_>>())
        }
    }
}

/// Execute the sync command
pub async fn execute(args: SyncArgs) -> CliResult<()> {
    let paths = ConfigPaths::new()?;
    let (_, service) = build_service(&paths)?;

    let filter = args.filter();
    if service.scopes().iter().all(|s| !filter.matches(s)) {
        return Err(CliError::Validation("no configured scope matches".to_string()));
    }

    let session = service.begin_sync(true, filter);
    tokio::pin!(session);
    let report = tokio::select! {
        report = &mut session => report?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupt received, finishing the current step");
            service.cancel();
            session.await?
        }
    };

    for line in report_lines(&report) {
        println!("{line}");
    }
    first_error(report)
}

fn report_lines(report: &SessionReport) -> Vec<String> {
    let mut lines = Vec::new();
    for outcome in &report.outcomes {
        let status = match &outcome.status {
            PassStatus::Completed => "completed".to_string(),
            PassStatus::Deferred => "deferred (rate limited)".to_string(),
            PassStatus::Cancelled => format!("cancelled at {}", outcome.cursor.phase),
            PassStatus::Interrupted(e) => {
                format!("interrupted at {}: {e}, retry later", outcome.cursor.phase)
            }
            PassStatus::Failed(e) => format!("failed at {}: {e}", outcome.cursor.phase),
        };
        lines.push(format!("{}: {status}", outcome.scope_id));
        lines.push(format!("  contacts: {}", outcome.summary.contacts));
        if outcome.summary.groups.changes() > 0 {
            lines.push(format!("  groups:   {}", outcome.summary.groups));
        }
    }
    for skipped in &report.skipped {
        let reason = match skipped.reason {
            SkipReason::Cancelled => "cancelled",
            SkipReason::AccountHalted => "skipped, account needs attention",
        };
        lines.push(format!("{}: {reason}", skipped.scope_id));
    }
    lines.push(format!(
        "{} of {} scopes completed",
        report.completed(),
        report.outcomes.len() + report.skipped.len()
    ));
    lines
}

/// The first pass error decides the exit code.
fn first_error(report: SessionReport) -> CliResult<()> {
    let cancelled = report
        .outcomes
        .iter()
        .any(|o| matches!(o.status, PassStatus::Cancelled));
    match report.outcomes.into_iter().find_map(|o| match o.status {
        PassStatus::Interrupted(e) | PassStatus::Failed(e) => Some(e),
        _ => None,
    }) {
        Some(e) => Err(e.into()),
        None if cancelled => Err(CliError::Interrupted),
        None => Ok(()),
    }
}
