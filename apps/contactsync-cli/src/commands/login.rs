//! Login command - Exchange an authorization code for a refresh token

use clap::Args;
use tracing::info;

use super::build_service;
use crate::config::ConfigPaths;
use crate::error::{CliError, CliResult};

/// Arguments for the login command
#[derive(Args)]
pub struct LoginArgs {
    /// Account the code was issued for
    pub account: String,

    /// Authorization code shown after approving access
    #[arg(long)]
    pub code: String,
}

/// Execute the login command
pub async fn execute(args: LoginArgs) -> CliResult<()> {
    let paths = ConfigPaths::new()?;
    login(&args, &paths).await?;
    println!("Authorized {}.", args.account);
    Ok(())
}

async fn login(args: &LoginArgs, paths: &ConfigPaths) -> CliResult<()> {
    let code = args.code.trim();
    if code.is_empty() {
        return Err(CliError::Validation("authorization code is empty".to_string()));
    }
    let (config, service) = build_service(paths)?;
    service.auth().exchange_code(&args.account, code).await?;
    if config.scopes_for(&args.account).is_empty() {
        info!(account = %args.account, "No scope is configured for this account yet");
    }
    Ok(())
}
