//! Second-factor endpoints.
//!
//! Each method (TOTP, WebAuthn, Duo) has its own handlers, but the
//! surrounding ceremony is shared and method-blind: require a one-factor
//! session, consult the regulator, run the verifier, write the log row, and
//! on acceptance rotate the session up to `TwoFactor`.

pub mod duo;
pub mod totp;
pub mod webauthn;

use axum::Json;
use axum::http::header::SET_COOKIE;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use tracing::info;

use super::error::AuthzError;
use super::types::{OkResponse, RedirectResponse};
use super::{AppState, load_session};
use crate::authorization::AuthenticationLevel;
use crate::mfa::VerifyOutcome;
use crate::regulation::{Attempt, Regulation};
use crate::session::SessionRecord;
use crate::storage::AttemptKind;

/// A one-factor session about to attempt a second factor.
pub(super) struct FactorSession {
    pub id: String,
    pub record: SessionRecord,
    pub username: String,
}

/// Second-factor endpoints require an authenticated, persisted session.
pub(super) async fn require_one_factor(
    state: &AppState,
    headers: &HeaderMap,
    now: DateTime<Utc>,
) -> Result<FactorSession, AuthzError> {
    let loaded = load_session(state, headers, now).await?;
    if loaded.record.level < AuthenticationLevel::OneFactor {
        return Err(AuthzError::Unauthenticated);
    }
    let (Some(id), Some(username)) = (loaded.id.clone(), loaded.record.username()) else {
        return Err(AuthzError::Unauthenticated);
    };
    let username = username.to_string();
    Ok(FactorSession {
        id,
        record: loaded.record,
        username,
    })
}

/// Regulator gate shared by all second-factor endpoints.
pub(super) async fn check_regulation(
    state: &AppState,
    username: &str,
    now: DateTime<Utc>,
) -> Result<(), AuthzError> {
    match state.regulator().check(username, now).await? {
        Regulation::Allowed => Ok(()),
        Regulation::Banned { .. } => Err(AuthzError::AuthBanned),
    }
}

/// Map a verifier outcome onto session and log effects.
///
/// Acceptance promotes and rotates the session; rejection writes a failure
/// row and surfaces `AuthFailed`; rate-limiting touches nothing.
pub(super) async fn conclude(
    state: &AppState,
    session: FactorSession,
    kind: AttemptKind,
    request_uri: &str,
    remote_ip: Option<String>,
    outcome: VerifyOutcome,
    now: DateTime<Utc>,
) -> Result<Response, AuthzError> {
    let attempt = |successful| Attempt {
        username: session.username.clone(),
        successful,
        kind,
        remote_ip: remote_ip.clone(),
        request_uri: request_uri.to_string(),
        request_method: "POST".to_string(),
    };

    match outcome {
        VerifyOutcome::RateLimited => Err(AuthzError::RateLimited),
        VerifyOutcome::Rejected => {
            state.regulator().mark(&attempt(false), now).await?;
            Err(AuthzError::AuthFailed)
        }
        VerifyOutcome::Accepted => {
            state.regulator().mark(&attempt(true), now).await?;

            let mut record = session.record;
            record.promote_two_factor(now);
            let new_id = state
                .sessions()
                .regenerate(Some(&session.id), &mut record, now)
                .await?;

            info!(
                username = %session.username,
                method = kind.as_str(),
                "second factor succeeded"
            );

            let mut headers = HeaderMap::new();
            let cookie = state.sessions().cookie(&new_id, record.remember_me);
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                headers.insert(SET_COOKIE, value);
            }
            let redirect = record.redirect_url.clone().or_else(|| {
                state
                    .portal()
                    .default_redirection_url()
                    .map(str::to_string)
            });
            Ok((
                StatusCode::OK,
                headers,
                Json(OkResponse::with_data(RedirectResponse { redirect })),
            )
                .into_response())
        }
    }
}
