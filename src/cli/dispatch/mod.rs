use anyhow::{Context, Result, anyhow};
use secrecy::SecretString;
use std::path::PathBuf;
use url::Url;

use crate::api::{PortalConfig, ServerOptions};
use crate::cli::actions::Action;
use crate::mfa::duo::DuoConfig;
use crate::mfa::totp::TotpConfig;
use crate::mfa::webauthn::WebauthnConfig;
use crate::regulation::RegulationConfig;
use crate::session::SessionConfig;

fn required_string(matches: &clap::ArgMatches, name: &str) -> Result<String> {
    matches
        .get_one::<String>(name)
        .cloned()
        .with_context(|| format!("missing required argument: --{name}"))
}

fn parse_session(matches: &clap::ArgMatches) -> Result<SessionConfig> {
    let secret = required_string(matches, "session-secret")?;
    if secret.len() < 20 {
        anyhow::bail!("--session-secret must be at least 20 characters");
    }
    let domain = required_string(matches, "session-cookie-domain")?;

    let mut config = SessionConfig::new(domain, SecretString::new(secret))
        .with_cookie_secure(!matches.get_flag("session-cookie-insecure"));
    if let Some(name) = matches.get_one::<String>("session-cookie-name") {
        config = config.with_cookie_name(name.clone());
    }
    if let Some(seconds) = matches.get_one::<i64>("session-inactivity-seconds") {
        config = config.with_inactivity_seconds(*seconds);
    }
    if let Some(seconds) = matches.get_one::<i64>("session-expiration-seconds") {
        config = config.with_expiration_seconds(*seconds);
    }
    if let Some(seconds) = matches.get_one::<i64>("session-remember-me-seconds") {
        config = config.with_remember_me_seconds(*seconds);
    }
    Ok(config)
}

fn parse_regulation(matches: &clap::ArgMatches) -> RegulationConfig {
    let mut config = RegulationConfig::new();
    if let Some(retries) = matches.get_one::<usize>("regulation-max-retries") {
        config = config.with_max_retries(*retries);
    }
    if let Some(seconds) = matches.get_one::<i64>("regulation-find-time-seconds") {
        config = config.with_find_time_seconds(*seconds);
    }
    if let Some(seconds) = matches.get_one::<i64>("regulation-ban-time-seconds") {
        config = config.with_ban_time_seconds(*seconds);
    }
    config
}

fn parse_totp(matches: &clap::ArgMatches) -> TotpConfig {
    let issuer = matches
        .get_one::<String>("totp-issuer")
        .cloned()
        .unwrap_or_else(|| "Gardi".to_string());
    let mut config = TotpConfig::new(issuer);
    if let Some(period) = matches.get_one::<u32>("totp-period") {
        config = config.with_period(*period);
    }
    if let Some(digits) = matches.get_one::<u32>("totp-digits") {
        config = config.with_digits(*digits);
    }
    if let Some(algorithm) = matches.get_one::<String>("totp-algorithm") {
        config = config.with_algorithm(algorithm.clone());
    }
    config
}

fn parse_webauthn(matches: &clap::ArgMatches, portal_url: &str) -> Result<WebauthnConfig> {
    let portal = Url::parse(portal_url)
        .with_context(|| format!("Invalid portal URL: {portal_url}"))?;
    let default_rp_id = portal
        .host_str()
        .ok_or_else(|| anyhow!("Portal URL must include a host: {portal_url}"))?
        .to_string();

    let rp_id = matches
        .get_one::<String>("webauthn-rp-id")
        .cloned()
        .unwrap_or(default_rp_id);
    let rp_origin = matches
        .get_one::<String>("webauthn-rp-origin")
        .cloned()
        .unwrap_or_else(|| portal_url.trim_end_matches('/').to_string());

    Ok(WebauthnConfig::new(rp_id, rp_origin))
}

fn parse_duo(matches: &clap::ArgMatches) -> Result<Option<DuoConfig>> {
    let Some(api_host) = matches.get_one::<String>("duo-api-host").cloned() else {
        return Ok(None);
    };
    let integration_key = matches
        .get_one::<String>("duo-integration-key")
        .cloned()
        .context("missing required argument: --duo-integration-key")?;
    let secret_key = matches
        .get_one::<String>("duo-secret-key")
        .cloned()
        .context("missing required argument: --duo-secret-key")?;
    Ok(Some(DuoConfig::new(
        api_host,
        integration_key,
        SecretString::new(secret_key),
    )))
}

/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(9091);
    let dsn = matches.get_one::<String>("dsn").cloned();
    let access_control_path =
        PathBuf::from(required_string(matches, "access-control")?);
    let users_path = PathBuf::from(required_string(matches, "users-file")?);
    let portal_url = required_string(matches, "portal-url")?;

    let portal = PortalConfig::new(portal_url.clone()).with_default_redirection_url(
        matches.get_one::<String>("default-redirection-url").cloned(),
    );

    let options = ServerOptions {
        port,
        dsn,
        access_control_path,
        users_path,
        webauthn: parse_webauthn(matches, &portal_url)?,
        portal,
        session: parse_session(matches)?,
        regulation: parse_regulation(matches),
        totp: parse_totp(matches),
        duo: parse_duo(matches)?,
        identity_token_ttl_seconds: matches
            .get_one::<i64>("identity-token-ttl-seconds")
            .copied()
            .unwrap_or(300),
    };

    Ok(Action::Server(Box::new(options)))
}
