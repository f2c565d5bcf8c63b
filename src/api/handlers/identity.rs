//! Identity verification for device registration.
//!
//! A logged-in user asks for a device-registration token (`start`), receives
//! it out-of-band, and trades it for a short-lived session elevation
//! (`finish`). Elevation is granted here and nowhere else; the enrolment
//! endpoints only check it.

use axum::Json;
use axum::extract::Extension;
use axum::http::header::SET_COOKIE;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::info;

use super::error::AuthzError;
use super::secondfactor::require_one_factor;
use super::types::{IdentityFinishRequest, KoResponse, OkResponse};
use super::{AppState, require_csrf};
use crate::notification::Notification;
use crate::session::Elevation;
use crate::verification::TokenPurpose;

#[utoipa::path(
    post,
    path = "/api/identity/start",
    responses(
        (status = 200, description = "Verification token issued and sent"),
        (status = 401, description = "Not authenticated", body = KoResponse)
    ),
    tag = "devices"
)]
pub async fn start(headers: HeaderMap, state: Extension<Arc<AppState>>) -> Response {
    match handle_start(&state, &headers).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn handle_start(state: &AppState, headers: &HeaderMap) -> Result<Response, AuthzError> {
    let now = Utc::now();
    let session = require_one_factor(state, headers, now).await?;
    require_csrf(headers, &session.record)?;

    let token = state
        .tokens()
        .issue(&session.username, TokenPurpose::RegisterDevice, now)
        .await?;

    let recipients = session
        .record
        .profile
        .as_ref()
        .map(|profile| profile.emails.clone())
        .unwrap_or_default();
    let notification = Notification {
        username: session.username.clone(),
        recipients,
        subject: "Confirm your identity".to_string(),
        body: format!(
            "Enter this one-time code to register a new device: {token}"
        ),
    };
    if let Err(err) = state.notifier().send(&notification) {
        tracing::error!("failed to deliver identity verification token: {err}");
        return Err(AuthzError::Unavailable);
    }

    Ok((StatusCode::OK, Json(OkResponse::empty())).into_response())
}

#[utoipa::path(
    post,
    path = "/api/identity/finish",
    request_body = IdentityFinishRequest,
    responses(
        (status = 200, description = "Session elevated"),
        (status = 401, description = "Token invalid, expired, or not yours", body = KoResponse)
    ),
    tag = "devices"
)]
pub async fn finish(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    payload: Option<Json<IdentityFinishRequest>>,
) -> Response {
    match handle_finish(&state, &headers, payload).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn handle_finish(
    state: &AppState,
    headers: &HeaderMap,
    payload: Option<Json<IdentityFinishRequest>>,
) -> Result<Response, AuthzError> {
    let Some(Json(request)) = payload else {
        return Err(AuthzError::InvalidInput("Missing request body".to_string()));
    };

    let now = Utc::now();
    let session = require_one_factor(state, headers, now).await?;
    require_csrf(headers, &session.record)?;

    let username = state
        .tokens()
        .consume(&request.token, TokenPurpose::RegisterDevice, now)
        .await?
        .ok_or(AuthzError::Unauthenticated)?;
    if username != session.username {
        // Consumed, but for someone else's account: fail closed.
        return Err(AuthzError::Unauthenticated);
    }

    let ttl = state.sessions().config().elevation_ttl_seconds();
    let mut record = session.record;
    record.elevation = Some(Elevation {
        username: username.clone(),
        purpose: TokenPurpose::RegisterDevice,
        expires_at: now + Duration::seconds(ttl),
    });

    // Elevation is a privilege transition; rotate like one.
    let new_id = state
        .sessions()
        .regenerate(Some(&session.id), &mut record, now)
        .await?;

    info!(username = %username, "session elevated for device registration");

    let mut response_headers = HeaderMap::new();
    let cookie = state.sessions().cookie(&new_id, record.remember_me);
    if let Ok(value) = HeaderValue::from_str(&cookie) {
        response_headers.insert(SET_COOKIE, value);
    }
    Ok((StatusCode::OK, response_headers, Json(OkResponse::empty())).into_response())
}
