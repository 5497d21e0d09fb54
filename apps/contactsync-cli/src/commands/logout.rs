//! Logout command - Forget the stored refresh token of an account

use clap::Args;

use super::build_service;
use crate::config::ConfigPaths;
use crate::error::CliResult;

/// Arguments for the logout command
#[derive(Args)]
pub struct LogoutArgs {
    /// Account to forget
    pub account: String,
}

/// Execute the logout command
pub async fn execute(args: LogoutArgs) -> CliResult<()> {
    let paths = ConfigPaths::new()?;
    logout(&args, &paths).await?;
    println!("Credentials for {} removed.", args.account);
    Ok(())
}

async fn logout(args: &LogoutArgs, paths: &ConfigPaths) -> CliResult<()> {
    let (_, service) = build_service(paths)?;
    service.auth().remove_token(&args.account).await?;
    Ok(())
}
