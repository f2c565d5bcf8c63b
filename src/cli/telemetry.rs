use anyhow::Result;
use tracing::Level;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Dependencies that narrate the request hot path; their chatter drowns the
/// authorization verdicts this service actually logs. `RUST_LOG` directives
/// still override these.
const QUIET_DEPENDENCIES: [&str; 4] = ["sqlx=warn", "hyper_util=error", "h2=error", "reqwest=warn"];

fn build_filter(level: Level) -> Result<EnvFilter> {
    let mut filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    for directive in QUIET_DEPENDENCIES {
        filter = filter.add_directive(directive.parse()?);
    }
    Ok(filter)
}

/// Initialize logging.
///
/// The resolved CLI level sets the default; compact single-line output with
/// targets kept, since the target is what distinguishes a policy decision
/// from a storage query in the stream.
///
/// # Errors
///
/// Returns an error if a filter directive does not parse or a subscriber is
/// already installed
pub fn init(level: Option<Level>) -> Result<()> {
    let filter = build_filter(level.unwrap_or(Level::ERROR))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_target(true))
        .try_init()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_directives_parse() {
        for level in [Level::ERROR, Level::INFO, Level::TRACE] {
            assert!(build_filter(level).is_ok());
        }
    }

    #[test]
    fn filter_keeps_the_default_level() {
        // RUST_LOG would shadow the default directive; clear it for the check.
        temp_env::with_vars([("RUST_LOG", None::<&str>)], || {
            let filter = build_filter(Level::DEBUG).expect("filter");
            let rendered = filter.to_string();
            assert!(rendered.contains("debug"));
            assert!(rendered.contains("sqlx=warn"));
        });
    }
}
