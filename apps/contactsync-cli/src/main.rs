//! contactsync CLI - Operate contact synchronization from the command line
//!
//! This CLI enables users to:
//! - Authorize accounts through the installed-application consent flow
//! - Calibrate the request throttle against the remote quota
//! - Run manual sync sessions and inspect saved state

use clap::{Parser, Subcommand};

mod commands;
mod config;
mod credentials;
mod error;
mod logging;

use error::CliResult;

/// contactsync - Two-way contact synchronization
#[derive(Parser)]
#[command(name = "contactsync")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the consent URL for an account
    AuthUrl(commands::auth_url::AuthUrlArgs),

    /// Store the refresh token for an authorization code
    Login(commands::login::LoginArgs),

    /// Remove the stored credentials of an account
    Logout(commands::logout::LogoutArgs),

    /// Find the smallest request delay the remote accepts
    Calibrate(commands::calibrate::CalibrateArgs),

    /// Run a manual sync session
    Sync(commands::sync::SyncArgs),

    /// Show configured scopes and their saved state
    Status(commands::status::StatusArgs),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    if let Err(e) = run(cli.command).await {
        e.print();
        std::process::exit(e.exit_code());
    }
}

async fn run(command: Commands) -> CliResult<()> {
    match command {
        Commands::AuthUrl(args) => commands::auth_url::execute(args).await,
        Commands::Login(args) => commands::login::execute(args).await,
        Commands::Logout(args) => commands::logout::execute(args).await,
        Commands::Calibrate(args) => commands::calibrate::execute(args).await,
        Commands::Sync(args) => commands::sync::execute(args).await,
        Commands::Status(args) => commands::status::execute(args).await,
    }
}
