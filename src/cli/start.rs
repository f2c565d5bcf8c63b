use crate::cli::{actions::Action, commands, dispatch, telemetry};
use anyhow::Result;
use tracing::Level;

/// Resolve the log level from the CLI: an explicit `--log-level` (or its env
/// var) wins; otherwise repeated `-v` flags raise it from the ERROR baseline.
fn resolve_level(matches: &clap::ArgMatches) -> Option<Level> {
    if let Some(name) = matches.get_one::<String>(commands::ARG_LOG_LEVEL) {
        return parse_level(name);
    }
    match matches.get_count(commands::ARG_VERBOSE) {
        0 => None,
        1 => Some(Level::WARN),
        2 => Some(Level::INFO),
        3 => Some(Level::DEBUG),
        _ => Some(Level::TRACE),
    }
}

fn parse_level(name: &str) -> Option<Level> {
    match name {
        "error" => Some(Level::ERROR),
        "warn" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

/// Main entry point for the CLI - builds and returns the Action
///
/// # Errors
///
/// Returns an error if argument parsing, telemetry initialization, or action
/// dispatch fails
pub fn start() -> Result<Action> {
    let matches = commands::new().get_matches();

    telemetry::init(resolve_level(&matches))?;

    let action = dispatch::handler(&matches)?;

    Ok(action)
}
