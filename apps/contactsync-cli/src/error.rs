//! CLI error types and exit codes

use contactsync::SyncError;
use thiserror::Error;

/// Exit codes for the CLI
/// - 0: Success
/// - 1: General error
/// - 2: Authorization required
/// - 3: Network error
/// - 4: Validation error
/// - 5: Remote service error
/// - 6: Another sync or calibration is running
pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("Account '{0}' is not authorized. Run 'contactsync login {0}' first.")]
    NotAuthenticated(String),

    #[error("Authorization failed: {0}")]
    AuthorizationFailed(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Remote service error: {0}")]
    Remote(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Credential storage error: {0}")]
    CredentialStorage(String),

    #[error("Address book error: {0}")]
    Storage(String),

    #[error("Busy: {0}")]
    Busy(String),

    #[error("Interrupted")]
    Interrupted,
}

impl CliError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::NotAuthenticated(_) | CliError::AuthorizationFailed(_) => 2,
            CliError::Network(_) => 3,
            CliError::Validation(_) => 4,
            CliError::Remote(_) => 5,
            CliError::Busy(_) => 6,
            CliError::Config(_)
            | CliError::CredentialStorage(_)
            | CliError::Storage(_)
            | CliError::Interrupted => 1,
        }
    }

    /// Print the error to stderr with appropriate formatting
    pub fn print(&self) {
        let use_color = std::env::var("NO_COLOR").is_err();

        if use_color {
            eprintln!("\x1b[31mError:\x1b[0m {self}");
        } else {
            eprintln!("Error: {self}");
        }

        if let Some(suggestion) = self.suggestion() {
            if use_color {
                eprintln!("\n\x1b[33mSuggestion:\x1b[0m {suggestion}");
            } else {
                eprintln!("\nSuggestion: {suggestion}");
            }
        }
    }

    fn suggestion(&self) -> Option<&'static str> {
        match self {
            CliError::AuthorizationFailed(_) => {
                Some("Run 'contactsync auth-url <account>' and log in again.")
            }
            CliError::Network(_) => Some("Check your network connection and try again."),
            CliError::Busy(_) => Some("Wait for the running operation to finish."),
            CliError::Config(_) => Some("Check config.json in the configuration directory."),
            _ => None,
        }
    }
}

impl From<SyncError> for CliError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::NotAuthenticated { account } => CliError::NotAuthenticated(account),
            SyncError::Unauthorized { .. } | SyncError::ReauthenticationRequired { .. } => {
                CliError::AuthorizationFailed(e.to_string())
            }
            SyncError::Offline { message } => CliError::Network(message),
            SyncError::RateLimited
            | SyncError::Remote { .. }
            | SyncError::Parse { .. }
            | SyncError::CalibrationFailed { .. } => CliError::Remote(e.to_string()),
            SyncError::Credential { message } => CliError::CredentialStorage(message),
            SyncError::Storage { message } => CliError::Storage(message),
            SyncError::Busy { .. } => CliError::Busy(e.to_string()),
            SyncError::Cancelled => CliError::Interrupted,
            SyncError::Config { message } => CliError::Config(message),
            SyncError::Json(_) | SyncError::Url(_) | SyncError::Io(_) => {
                CliError::Config(e.to_string())
            }
        }
    }
}

impl From<std::io::Error> for CliError {
    fn from(e: std::io::Error) -> Self {
        CliError::Config(format!("I/O error: {e}"))
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        CliError::Config(format!("JSON error: {e}"))
    }
}
