use clap::{
    Arg, ArgAction, ColorChoice, Command,
    builder::styling::{AnsiColor, Effects, Styles},
};

pub const ARG_VERBOSE: &str = "verbose";
pub const ARG_LOG_LEVEL: &str = "log-level";
pub const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let long_version: &'static str = Box::leak(
        format!("{} - {}", env!("CARGO_PKG_VERSION"), crate::GIT_COMMIT_HASH).into_boxed_str(),
    );

    let command = Command::new("gardi")
        .about("Authentication and authorization server for reverse proxies")
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(long_version)
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .help("Port to listen on")
                .default_value("9091")
                .env("GARDI_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("dsn")
                .short('d')
                .long("dsn")
                .help("Database connection string")
                .long_help(
                    "Database connection string. When omitted, an in-memory store is used and all sessions/logs are lost on restart.",
                )
                .env("GARDI_DSN"),
        )
        .arg(
            Arg::new("access-control")
                .long("access-control")
                .help("Path to the YAML access control rules")
                .env("GARDI_ACCESS_CONTROL")
                .required(true),
        )
        .arg(
            Arg::new("users-file")
                .long("users-file")
                .help("Path to the YAML user database")
                .env("GARDI_USERS_FILE")
                .required(true),
        )
        .arg(
            Arg::new("portal-url")
                .long("portal-url")
                .help("External URL of the login portal")
                .env("GARDI_PORTAL_URL")
                .required(true),
        )
        .arg(
            Arg::new("default-redirection-url")
                .long("default-redirection-url")
                .help("Where to send users after login when no target is known")
                .env("GARDI_DEFAULT_REDIRECTION_URL"),
        );

    let command = session_args(command);
    let command = regulation_args(command);
    let command = totp_args(command);
    let command = webauthn_args(command);
    let command = duo_args(command);
    logging_args(command)
}

fn logging_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_VERBOSE)
                .short('v')
                .long("verbose")
                .help("Raise log verbosity; repeat for more (-v warn, -vv info, ...)")
                .global(true)
                .action(ArgAction::Count),
        )
        .arg(
            Arg::new(ARG_LOG_LEVEL)
                .long("log-level")
                .help("Explicit log level; overrides -v when set")
                .env("GARDI_LOG_LEVEL")
                .global(true)
                .value_parser(LOG_LEVELS),
        )
}

fn session_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("session-secret")
                .long("session-secret")
                .help("HMAC secret protecting the session cookie")
                .env("GARDI_SESSION_SECRET")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new("session-cookie-name")
                .long("session-cookie-name")
                .help("Name of the session cookie")
                .default_value("gardi_session")
                .env("GARDI_SESSION_COOKIE_NAME"),
        )
        .arg(
            Arg::new("session-cookie-domain")
                .long("session-cookie-domain")
                .help("Domain the session cookie is scoped to")
                .env("GARDI_SESSION_COOKIE_DOMAIN")
                .required(true),
        )
        .arg(
            Arg::new("session-cookie-insecure")
                .long("session-cookie-insecure")
                .help("Drop the Secure cookie attribute (local development only)")
                .env("GARDI_SESSION_COOKIE_INSECURE")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("session-inactivity-seconds")
                .long("session-inactivity-seconds")
                .help("Idle time before a session is destroyed")
                .default_value("300")
                .env("GARDI_SESSION_INACTIVITY_SECONDS")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("session-expiration-seconds")
                .long("session-expiration-seconds")
                .help("Absolute session lifetime")
                .default_value("3600")
                .env("GARDI_SESSION_EXPIRATION_SECONDS")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("session-remember-me-seconds")
                .long("session-remember-me-seconds")
                .help("Absolute lifetime for remember-me sessions")
                .default_value("2592000")
                .env("GARDI_SESSION_REMEMBER_ME_SECONDS")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("identity-token-ttl-seconds")
                .long("identity-token-ttl-seconds")
                .help("Lifetime of identity verification tokens")
                .default_value("300")
                .env("GARDI_IDENTITY_TOKEN_TTL_SECONDS")
                .value_parser(clap::value_parser!(i64)),
        )
}

fn regulation_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("regulation-max-retries")
                .long("regulation-max-retries")
                .help("Failed attempts inside the window before a ban")
                .default_value("3")
                .env("GARDI_REGULATION_MAX_RETRIES")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("regulation-find-time-seconds")
                .long("regulation-find-time-seconds")
                .help("Length of the failure window")
                .default_value("120")
                .env("GARDI_REGULATION_FIND_TIME_SECONDS")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("regulation-ban-time-seconds")
                .long("regulation-ban-time-seconds")
                .help("Ban duration after the window is breached")
                .default_value("300")
                .env("GARDI_REGULATION_BAN_TIME_SECONDS")
                .value_parser(clap::value_parser!(i64)),
        )
}

fn totp_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("totp-issuer")
                .long("totp-issuer")
                .help("Issuer shown in authenticator apps")
                .default_value("Gardi")
                .env("GARDI_TOTP_ISSUER"),
        )
        .arg(
            Arg::new("totp-period")
                .long("totp-period")
                .help("TOTP step length in seconds")
                .default_value("30")
                .env("GARDI_TOTP_PERIOD")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("totp-digits")
                .long("totp-digits")
                .help("TOTP code length")
                .default_value("6")
                .env("GARDI_TOTP_DIGITS")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("totp-algorithm")
                .long("totp-algorithm")
                .help("TOTP HMAC algorithm: SHA1, SHA256, SHA512")
                .default_value("SHA1")
                .env("GARDI_TOTP_ALGORITHM"),
        )
}

fn webauthn_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("webauthn-rp-id")
                .long("webauthn-rp-id")
                .help("WebAuthn relying-party id (defaults to the portal host)")
                .env("GARDI_WEBAUTHN_RP_ID"),
        )
        .arg(
            Arg::new("webauthn-rp-origin")
                .long("webauthn-rp-origin")
                .help("WebAuthn relying-party origin (defaults to the portal origin)")
                .env("GARDI_WEBAUTHN_RP_ORIGIN"),
        )
}

fn duo_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("duo-api-host")
                .long("duo-api-host")
                .help("Duo API hostname (enables the Duo push factor)")
                .env("GARDI_DUO_API_HOST"),
        )
        .arg(
            Arg::new("duo-integration-key")
                .long("duo-integration-key")
                .help("Duo integration key")
                .env("GARDI_DUO_INTEGRATION_KEY")
                .requires("duo-api-host"),
        )
        .arg(
            Arg::new("duo-secret-key")
                .long("duo-secret-key")
                .help("Duo secret key")
                .env("GARDI_DUO_SECRET_KEY")
                .hide_env_values(true)
                .requires("duo-api-host"),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUIRED: [&str; 10] = [
        "gardi",
        "--access-control",
        "/etc/gardi/access-control.yml",
        "--users-file",
        "/etc/gardi/users.yml",
        "--portal-url",
        "https://auth.example.com",
        "--session-secret",
        "unsafe-test-secret",
        "--session-cookie-domain",
    ];

    fn required_args() -> Vec<String> {
        let mut args: Vec<String> = REQUIRED.iter().map(ToString::to_string).collect();
        args.push("example.com".to_string());
        args
    }

    #[test]
    fn test_new() {
        let command = new();
        assert_eq!(command.get_name(), "gardi");
        assert_eq!(
            command.get_about().map(ToString::to_string),
            Some("Authentication and authorization server for reverse proxies".to_string())
        );
    }

    #[test]
    fn defaults_apply() {
        let matches = new().get_matches_from(required_args());
        assert_eq!(matches.get_one::<u16>("port").copied(), Some(9091));
        assert_eq!(
            matches.get_one::<i64>("session-inactivity-seconds").copied(),
            Some(300)
        );
        assert_eq!(
            matches.get_one::<usize>("regulation-max-retries").copied(),
            Some(3)
        );
        assert_eq!(
            matches.get_one::<String>("totp-algorithm").cloned(),
            Some("SHA1".to_string())
        );
        assert_eq!(matches.get_one::<String>("dsn"), None);
    }

    #[test]
    fn missing_required_args_fail() {
        let result = new().try_get_matches_from(vec!["gardi"]);
        assert!(result.is_err());
    }

    #[test]
    fn env_overrides_apply() {
        temp_env::with_vars(
            [
                ("GARDI_PORT", Some("8443")),
                ("GARDI_REGULATION_MAX_RETRIES", Some("5")),
            ],
            || {
                let matches = new().get_matches_from(required_args());
                assert_eq!(matches.get_one::<u16>("port").copied(), Some(8443));
                assert_eq!(
                    matches.get_one::<usize>("regulation-max-retries").copied(),
                    Some(5)
                );
            },
        );
    }

    #[test]
    fn duo_keys_require_api_host() {
        let mut args = required_args();
        args.push("--duo-integration-key".to_string());
        args.push("DIXXXXXXXXXXXXXXXXXX".to_string());
        let result = new().try_get_matches_from(args);
        assert_eq!(
            result.map_err(|e| e.kind()),
            Err(clap::error::ErrorKind::MissingRequiredArgument)
        );
    }

    #[test]
    fn log_level_from_env() {
        temp_env::with_vars([("GARDI_LOG_LEVEL", Some("debug"))], || {
            let matches = new().get_matches_from(required_args());
            assert_eq!(
                matches.get_one::<String>(ARG_LOG_LEVEL).map(String::as_str),
                Some("debug")
            );
        });
    }

    #[test]
    fn repeated_verbose_flags_count() {
        let mut args = required_args();
        args.push("-vv".to_string());
        let matches = new().get_matches_from(args);
        assert_eq!(matches.get_count(ARG_VERBOSE), 2);
    }

    #[test]
    fn invalid_log_level_is_rejected() {
        let mut args = required_args();
        args.push("--log-level".to_string());
        args.push("loud".to_string());
        assert!(new().try_get_matches_from(args).is_err());
    }
}
