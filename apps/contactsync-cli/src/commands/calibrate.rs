//! Calibrate command - Search for the smallest delay the remote accepts

use clap::Args;

use super::build_service;
use crate::config::ConfigPaths;
use crate::error::{CliError, CliResult};

/// Arguments for the calibrate command
#[derive(Args)]
pub struct CalibrateArgs {
    /// Account whose quota is sampled
    pub account: String,

    /// Delay to start the search from, in milliseconds
    #[arg(long)]
    pub start_ms: Option<u64>,
}

/// Execute the calibrate command
pub async fn execute(args: CalibrateArgs) -> CliResult<()> {
    let paths = ConfigPaths::new()?;
    let (config, service) = build_service(&paths)?;
    if config.scopes_for(&args.account).is_empty() {
        return Err(CliError::Validation(format!(
            "no scope is configured for '{}'",
            args.account
        )));
    }

    println!("Calibrating against {}...", args.account);
    let report = service.calibrate(&args.account, args.start_ms).await?;
    println!(
        "Operating delay set to {} ms ({} runs, {} samples, {} rejected)",
        report.delay_ms, report.runs, report.samples_sent, report.rejections
    );
    Ok(())
}
