//! Auth-url command - Print the consent page URL for an account

use clap::Args;

use super::build_service;
use crate::config::ConfigPaths;
use crate::error::CliResult;

/// Arguments for the auth-url command
#[derive(Args)]
pub struct AuthUrlArgs {
    /// Account to authorize
    pub account: String,
}

/// Execute the auth-url command
pub async fn execute(args: AuthUrlArgs) -> CliResult<()> {
    let paths = ConfigPaths::new()?;
    let url = authorization_url(&args, &paths)?;
    println!("Open this URL in a browser and approve access:\n\n  {url}\n");
    println!("Then run: contactsync login {} --code <CODE>", args.account);
    Ok(())
}

fn authorization_url(args: &AuthUrlArgs, paths: &ConfigPaths) -> CliResult<String> {
    let (_, service) = build_service(paths)?;
    Ok(service.auth().authorization_url(&args.account)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::config_dir;

    #[test]
    fn test_url_names_client_and_account() {
        let (_temp, paths) = config_dir();
        let args = AuthUrlArgs {
            account: "user@example.com".to_string(),
        };

        let url = authorization_url(&args, &paths).unwrap();

        assert!(url.starts_with("http://127.0.0.1:9/o/oauth2/auth?"));
        assert!(url.contains("client_id=client-id"));
        assert!(url.contains("user%40example.com"));
    }
}
