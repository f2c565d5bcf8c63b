//! HTTP handlers and the shared application state.

pub mod error;
pub mod firstfactor;
pub mod health;
pub mod identity;
pub mod logout;
pub mod reset_password;
pub mod secondfactor;
pub mod state;
pub mod types;
pub mod verify;

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::authorization::AccessControl;
use crate::mfa::duo::DuoVerifier;
use crate::mfa::totp::TotpVerifier;
use crate::mfa::webauthn::WebauthnVerifier;
use crate::notification::Notifier;
use crate::regulation::Regulator;
use crate::session::{LoadedSession, SessionRecord, SessionStore};
use crate::users::UserBackend;
use crate::verification::IdentityTokenService;

use self::error::AuthzError;

/// Portal-facing settings shared across handlers.
#[derive(Clone, Debug)]
pub struct PortalConfig {
    portal_url: String,
    default_redirection_url: Option<String>,
}

impl PortalConfig {
    #[must_use]
    pub fn new(portal_url: String) -> Self {
        Self {
            portal_url: portal_url.trim_end_matches('/').to_string() + "/",
            default_redirection_url: None,
        }
    }

    #[must_use]
    pub fn with_default_redirection_url(mut self, url: Option<String>) -> Self {
        self.default_redirection_url = url;
        self
    }

    #[must_use]
    pub fn portal_url(&self) -> &str {
        &self.portal_url
    }

    #[must_use]
    pub fn default_redirection_url(&self) -> Option<&str> {
        self.default_redirection_url.as_deref()
    }
}

/// Everything a handler needs, wired once at startup and injected as an
/// `Extension<Arc<AppState>>`.
pub struct AppState {
    sessions: SessionStore,
    access: Arc<AccessControl>,
    users: Arc<dyn UserBackend>,
    regulator: Regulator,
    totp: TotpVerifier,
    webauthn: WebauthnVerifier,
    duo: Option<DuoVerifier>,
    tokens: IdentityTokenService,
    notifier: Arc<dyn Notifier>,
    portal: PortalConfig,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        sessions: SessionStore,
        access: Arc<AccessControl>,
        users: Arc<dyn UserBackend>,
        regulator: Regulator,
        totp: TotpVerifier,
        webauthn: WebauthnVerifier,
        duo: Option<DuoVerifier>,
        tokens: IdentityTokenService,
        notifier: Arc<dyn Notifier>,
        portal: PortalConfig,
    ) -> Self {
        Self {
            sessions,
            access,
            users,
            regulator,
            totp,
            webauthn,
            duo,
            tokens,
            notifier,
            portal,
        }
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    #[must_use]
    pub fn access(&self) -> &AccessControl {
        &self.access
    }

    pub(crate) fn users(&self) -> &dyn UserBackend {
        self.users.as_ref()
    }

    pub(crate) fn regulator(&self) -> &Regulator {
        &self.regulator
    }

    pub(crate) fn totp(&self) -> &TotpVerifier {
        &self.totp
    }

    pub(crate) fn webauthn(&self) -> &WebauthnVerifier {
        &self.webauthn
    }

    pub(crate) fn duo(&self) -> Option<&DuoVerifier> {
        self.duo.as_ref()
    }

    pub(crate) fn tokens(&self) -> &IdentityTokenService {
        &self.tokens
    }

    pub(crate) fn notifier(&self) -> &dyn Notifier {
        self.notifier.as_ref()
    }

    #[must_use]
    pub fn portal(&self) -> &PortalConfig {
        &self.portal
    }
}

/// Pull one cookie value out of the `Cookie` header.
pub(crate) fn extract_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let header = headers.get(axum::http::header::COOKIE)?;
    let value = header.to_str().ok()?;
    for pair in value.split(';') {
        let trimmed = pair.trim();
        let mut parts = trimmed.splitn(2, '=');
        let key = parts.next()?.trim();
        let val = parts.next()?.trim();
        if key == name {
            return Some(val.to_string());
        }
    }
    None
}

/// Extract a client IP from common proxy headers.
pub(crate) fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if forwarded.is_some() {
        return forwarded.map(str::to_string);
    }
    headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Resolve the session cookie to a session, mapping backend failure to
/// `Unavailable`.
pub(crate) async fn load_session(
    state: &AppState,
    headers: &HeaderMap,
    now: DateTime<Utc>,
) -> Result<LoadedSession, AuthzError> {
    let cookie = extract_cookie(headers, state.sessions().config().cookie_name());
    Ok(state.sessions().load(cookie.as_deref(), now).await?)
}

/// State-changing portal endpoints require the CSRF token issued with the
/// session, carried in the `X-CSRF-Token` header.
pub(crate) fn require_csrf(headers: &HeaderMap, record: &SessionRecord) -> Result<(), AuthzError> {
    let presented = headers
        .get("x-csrf-token")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if presented.is_empty() || presented != record.csrf_token {
        return Err(AuthzError::InvalidInput("Missing or stale CSRF token".to_string()));
    }
    Ok(())
}
