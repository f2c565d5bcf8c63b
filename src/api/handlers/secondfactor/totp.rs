//! TOTP verification and enrolment endpoints.

use axum::Json;
use axum::extract::Extension;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use std::sync::Arc;

use super::super::error::AuthzError;
use super::super::types::{
    KoResponse, OkResponse, TotpRegisterResponse, TotpVerifyRequest,
};
use super::super::{AppState, extract_client_ip, require_csrf};
use super::{check_regulation, conclude, require_one_factor};
use crate::storage::AttemptKind;
use crate::verification::TokenPurpose;

const ENDPOINT_URI: &str = "/api/secondfactor/totp";

#[utoipa::path(
    post,
    path = "/api/secondfactor/totp",
    request_body = TotpVerifyRequest,
    responses(
        (status = 200, description = "Session promoted to two-factor"),
        (status = 401, description = "Code rejected", body = KoResponse),
        (status = 403, description = "No TOTP enrolment", body = KoResponse),
        (status = 429, description = "User is banned", body = KoResponse)
    ),
    tag = "authentication"
)]
pub async fn verify(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    payload: Option<Json<TotpVerifyRequest>>,
) -> Response {
    match handle_verify(&state, &headers, payload).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn handle_verify(
    state: &AppState,
    headers: &HeaderMap,
    payload: Option<Json<TotpVerifyRequest>>,
) -> Result<Response, AuthzError> {
    let Some(Json(request)) = payload else {
        return Err(AuthzError::InvalidInput("Missing request body".to_string()));
    };
    let code = request.code.trim();
    if code.is_empty() || !code.chars().all(|c| c.is_ascii_digit()) {
        return Err(AuthzError::InvalidInput("Malformed one-time code".to_string()));
    }

    let now = Utc::now();
    let session = require_one_factor(state, headers, now).await?;
    check_regulation(state, &session.username, now).await?;

    let outcome = state.totp().verify(&session.username, code, now).await?;
    conclude(
        state,
        session,
        AttemptKind::Totp,
        ENDPOINT_URI,
        extract_client_ip(headers),
        outcome,
        now,
    )
    .await
}

/// Enrol (or re-enrol) the TOTP device. Requires an elevated session: the
/// user must have consumed a device-registration token first.
#[utoipa::path(
    post,
    path = "/api/secondfactor/totp/register",
    responses(
        (status = 200, description = "Fresh enrolment"),
        (status = 401, description = "Not authenticated", body = KoResponse),
        (status = 403, description = "Session is not elevated", body = KoResponse)
    ),
    tag = "devices"
)]
pub async fn register(headers: HeaderMap, state: Extension<Arc<AppState>>) -> Response {
    match handle_register(&state, &headers).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn handle_register(state: &AppState, headers: &HeaderMap) -> Result<Response, AuthzError> {
    let now = Utc::now();
    let session = require_one_factor(state, headers, now).await?;
    require_csrf(headers, &session.record)?;

    if session
        .record
        .active_elevation(TokenPurpose::RegisterDevice, now)
        .is_none()
    {
        return Err(AuthzError::Forbidden(
            "Device registration requires identity verification".to_string(),
        ));
    }

    let enrollment = state.totp().enroll(&session.username).await?;
    Ok((
        StatusCode::OK,
        Json(OkResponse::with_data(TotpRegisterResponse {
            secret: enrollment.secret_base32,
            otpauth_url: enrollment.otpauth_url,
        })),
    )
        .into_response())
}
