//! Password reset flow.
//!
//! Three steps: `identity/start` issues a reset token (the response is
//! intentionally identical whether or not the username exists), the emailed
//! token is traded for an elevated session in `identity/finish`, and the
//! elevated session may then set a new password. The reset elevation can ride
//! on an anonymous session — the user proved control of the mailbox, not a
//! password.

use axum::Json;
use axum::extract::Extension;
use axum::http::header::SET_COOKIE;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use super::error::AuthzError;
use super::types::{
    IdentityFinishRequest, KoResponse, OkResponse, ResetPasswordRequest,
    ResetPasswordStartRequest,
};
use super::{AppState, load_session, require_csrf};
use crate::notification::Notification;
use crate::session::Elevation;
use crate::users::UserError;
use crate::verification::TokenPurpose;

#[utoipa::path(
    post,
    path = "/api/reset-password/identity/start",
    request_body = ResetPasswordStartRequest,
    responses(
        (status = 200, description = "Accepted; a token was sent if the account exists")
    ),
    tag = "password-reset"
)]
pub async fn identity_start(
    state: Extension<Arc<AppState>>,
    payload: Option<Json<ResetPasswordStartRequest>>,
) -> Response {
    match handle_identity_start(&state, payload).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn handle_identity_start(
    state: &AppState,
    payload: Option<Json<ResetPasswordStartRequest>>,
) -> Result<Response, AuthzError> {
    let Some(Json(request)) = payload else {
        return Err(AuthzError::InvalidInput("Missing request body".to_string()));
    };
    if request.username.trim().is_empty() {
        return Err(AuthzError::InvalidInput("Username is required".to_string()));
    }

    let now = Utc::now();
    // Unknown usernames get the same 200 as known ones: this endpoint must
    // not be an account oracle.
    match state.users().get_details(request.username.trim()).await {
        Ok(details) => {
            let token = state
                .tokens()
                .issue(&details.username, TokenPurpose::ResetPassword, now)
                .await?;
            let notification = Notification {
                username: details.username.clone(),
                recipients: details.emails.clone(),
                subject: "Password reset".to_string(),
                body: format!("Use this one-time code to reset your password: {token}"),
            };
            if let Err(err) = state.notifier().send(&notification) {
                tracing::error!("failed to deliver reset token: {err}");
                return Err(AuthzError::Unavailable);
            }
        }
        Err(UserError::NotFound) => {
            warn!(username = %request.username, "password reset requested for unknown user");
        }
        Err(UserError::Unavailable(detail)) => {
            tracing::error!("user backend unavailable during reset start: {detail}");
            return Err(AuthzError::Unavailable);
        }
        Err(UserError::InvalidCredentials) => return Err(AuthzError::Internal),
    }

    Ok((StatusCode::OK, Json(OkResponse::empty())).into_response())
}

#[utoipa::path(
    post,
    path = "/api/reset-password/identity/finish",
    request_body = IdentityFinishRequest,
    responses(
        (status = 200, description = "Session elevated for password reset"),
        (status = 401, description = "Token invalid or expired", body = KoResponse)
    ),
    tag = "password-reset"
)]
pub async fn identity_finish(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    payload: Option<Json<IdentityFinishRequest>>,
) -> Response {
    match handle_identity_finish(&state, &headers, payload).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn handle_identity_finish(
    state: &AppState,
    headers: &HeaderMap,
    payload: Option<Json<IdentityFinishRequest>>,
) -> Result<Response, AuthzError> {
    let Some(Json(request)) = payload else {
        return Err(AuthzError::InvalidInput("Missing request body".to_string()));
    };

    let now = Utc::now();
    let username = state
        .tokens()
        .consume(&request.token, TokenPurpose::ResetPassword, now)
        .await?
        .ok_or(AuthzError::Unauthenticated)?;

    // The elevation may attach to an anonymous session; the token proves
    // mailbox control, which is all a reset needs.
    let loaded = load_session(state, headers, now).await?;
    let mut record = loaded.record;
    record.elevation = Some(Elevation {
        username: username.clone(),
        purpose: TokenPurpose::ResetPassword,
        expires_at: now + Duration::seconds(state.sessions().config().elevation_ttl_seconds()),
    });

    let new_id = state
        .sessions()
        .regenerate(loaded.id.as_deref(), &mut record, now)
        .await?;

    info!(username = %username, "session elevated for password reset");

    let mut response_headers = HeaderMap::new();
    let cookie = state.sessions().cookie(&new_id, record.remember_me);
    if let Ok(value) = HeaderValue::from_str(&cookie) {
        response_headers.insert(SET_COOKIE, value);
    }
    Ok((StatusCode::OK, response_headers, Json(OkResponse::empty())).into_response())
}

#[utoipa::path(
    post,
    path = "/api/reset-password",
    request_body = ResetPasswordRequest,
    responses(
        (status = 200, description = "Password updated"),
        (status = 403, description = "Session is not elevated for reset", body = KoResponse)
    ),
    tag = "password-reset"
)]
pub async fn reset_password(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    payload: Option<Json<ResetPasswordRequest>>,
) -> Response {
    match handle_reset(&state, &headers, payload).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn handle_reset(
    state: &AppState,
    headers: &HeaderMap,
    payload: Option<Json<ResetPasswordRequest>>,
) -> Result<Response, AuthzError> {
    let Some(Json(request)) = payload else {
        return Err(AuthzError::InvalidInput("Missing request body".to_string()));
    };
    if request.password.len() < 8 {
        return Err(AuthzError::InvalidInput(
            "Password must be at least 8 characters".to_string(),
        ));
    }

    let now = Utc::now();
    let loaded = load_session(state, headers, now).await?;
    require_csrf(headers, &loaded.record)?;

    let Some(elevation) = loaded
        .record
        .active_elevation(TokenPurpose::ResetPassword, now)
        .cloned()
    else {
        return Err(AuthzError::Forbidden(
            "Password reset requires identity verification".to_string(),
        ));
    };

    match state
        .users()
        .update_password(&elevation.username, &request.password)
        .await
    {
        Ok(()) => {}
        Err(UserError::NotFound) => return Err(AuthzError::Internal),
        Err(UserError::Unavailable(detail)) => {
            tracing::error!("user backend unavailable during reset: {detail}");
            return Err(AuthzError::Unavailable);
        }
        Err(UserError::InvalidCredentials) => return Err(AuthzError::Internal),
    }

    // The elevation is spent; de-elevation rotates like any transition.
    let Some(id) = loaded.id.as_deref() else {
        return Err(AuthzError::Internal);
    };
    let mut record = loaded.record;
    record.elevation = None;
    let new_id = state.sessions().regenerate(Some(id), &mut record, now).await?;

    info!(username = %elevation.username, "password reset completed");

    let mut response_headers = HeaderMap::new();
    let cookie = state.sessions().cookie(&new_id, record.remember_me);
    if let Ok(value) = HeaderValue::from_str(&cookie) {
        response_headers.insert(SET_COOKIE, value);
    }
    Ok((StatusCode::OK, response_headers, Json(OkResponse::empty())).into_response())
}
