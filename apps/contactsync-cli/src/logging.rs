//! Tracing subscriber setup

use tracing_subscriber::EnvFilter;

/// Environment variable holding a filter directive, e.g. `contactsync=debug`.
pub const LOG_ENV: &str = "CONTACTSYNC_LOG";

/// Install the global subscriber. Logs go to stderr so command output stays clean.
///
/// `CONTACTSYNC_LOG` wins over the verbosity flag.
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(default_directive(verbosity)))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info,contactsync=info",
        2 => "info,contactsync=debug",
        _ => "debug,contactsync=trace",
    }
}
