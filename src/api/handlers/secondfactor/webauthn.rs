//! WebAuthn assertion and enrolment endpoints.
//!
//! The two-step protocol parks the library's ephemeral state on the session
//! record between `start` and the completing request, so any concurrent
//! rotation (or a fresh factor) invalidates the half-finished ceremony.

use axum::Json;
use axum::extract::Extension;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use std::sync::Arc;
use webauthn_rs::prelude::{PublicKeyCredential, RegisterPublicKeyCredential};

use super::super::error::AuthzError;
use super::super::types::{
    KoResponse, OkResponse, WebauthnRegisterFinishRequest, WebauthnVerifyRequest,
};
use super::super::{AppState, extract_client_ip, require_csrf};
use super::{check_regulation, conclude, require_one_factor};
use crate::mfa::MfaError;
use crate::storage::AttemptKind;
use crate::verification::TokenPurpose;

const ENDPOINT_URI: &str = "/api/secondfactor/webauthn";

/// Begin an assertion: generate the challenge and park the state.
#[utoipa::path(
    post,
    path = "/api/secondfactor/webauthn/start",
    responses(
        (status = 200, description = "Assertion challenge"),
        (status = 401, description = "Not authenticated", body = KoResponse),
        (status = 403, description = "No registered credential", body = KoResponse)
    ),
    tag = "authentication"
)]
pub async fn start(headers: HeaderMap, state: Extension<Arc<AppState>>) -> Response {
    match handle_start(&state, &headers).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn handle_start(state: &AppState, headers: &HeaderMap) -> Result<Response, AuthzError> {
    let now = Utc::now();
    let mut session = require_one_factor(state, headers, now).await?;

    let (challenge, parked) = state.webauthn().initiate(&session.username).await?;

    session.record.webauthn_state = Some(parked);
    state.sessions().save(&session.id, &session.record).await?;

    Ok((StatusCode::OK, Json(challenge)).into_response())
}

/// Complete the assertion and, on success, promote to two-factor.
#[utoipa::path(
    post,
    path = "/api/secondfactor/webauthn",
    request_body = WebauthnVerifyRequest,
    responses(
        (status = 200, description = "Session promoted to two-factor"),
        (status = 401, description = "Assertion rejected", body = KoResponse),
        (status = 429, description = "User is banned", body = KoResponse)
    ),
    tag = "authentication"
)]
pub async fn verify(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    payload: Option<Json<WebauthnVerifyRequest>>,
) -> Response {
    match handle_verify(&state, &headers, payload).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn handle_verify(
    state: &AppState,
    headers: &HeaderMap,
    payload: Option<Json<WebauthnVerifyRequest>>,
) -> Result<Response, AuthzError> {
    let Some(Json(request)) = payload else {
        return Err(AuthzError::InvalidInput("Missing request body".to_string()));
    };
    let assertion: PublicKeyCredential = serde_json::from_value(request.response)
        .map_err(|_| AuthzError::InvalidInput("Malformed assertion".to_string()))?;

    let now = Utc::now();
    let mut session = require_one_factor(state, headers, now).await?;
    check_regulation(state, &session.username, now).await?;

    // Take the parked state; the challenge is single-shot either way.
    let parked = session
        .record
        .webauthn_state
        .take()
        .ok_or(MfaError::InvalidState)?;
    state.sessions().save(&session.id, &session.record).await?;

    let outcome = state
        .webauthn()
        .verify(&session.username, &parked, &assertion)
        .await?;
    conclude(
        state,
        session,
        AttemptKind::Webauthn,
        ENDPOINT_URI,
        extract_client_ip(headers),
        outcome,
        now,
    )
    .await
}

/// Begin credential registration. Requires an elevated session.
#[utoipa::path(
    post,
    path = "/api/secondfactor/webauthn/register/start",
    responses(
        (status = 200, description = "Creation challenge"),
        (status = 401, description = "Not authenticated", body = KoResponse),
        (status = 403, description = "Session is not elevated", body = KoResponse)
    ),
    tag = "devices"
)]
pub async fn register_start(headers: HeaderMap, state: Extension<Arc<AppState>>) -> Response {
    match handle_register_start(&state, &headers).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn handle_register_start(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Response, AuthzError> {
    let now = Utc::now();
    let mut session = require_one_factor(state, headers, now).await?;
    require_csrf(headers, &session.record)?;
    require_elevation(&session, now)?;

    let display_name = session
        .record
        .profile
        .as_ref()
        .map_or_else(|| session.username.clone(), |p| p.display_name.clone());
    let (challenge, parked) = state
        .webauthn()
        .registration_start(&session.username, &display_name)
        .await?;

    session.record.webauthn_state = Some(parked);
    state.sessions().save(&session.id, &session.record).await?;

    Ok((StatusCode::OK, Json(challenge)).into_response())
}

/// Complete credential registration.
#[utoipa::path(
    post,
    path = "/api/secondfactor/webauthn/register/finish",
    request_body = WebauthnRegisterFinishRequest,
    responses(
        (status = 200, description = "Credential registered"),
        (status = 401, description = "Not authenticated", body = KoResponse),
        (status = 403, description = "Session is not elevated", body = KoResponse)
    ),
    tag = "devices"
)]
pub async fn register_finish(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    payload: Option<Json<WebauthnRegisterFinishRequest>>,
) -> Response {
    match handle_register_finish(&state, &headers, payload).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn handle_register_finish(
    state: &AppState,
    headers: &HeaderMap,
    payload: Option<Json<WebauthnRegisterFinishRequest>>,
) -> Result<Response, AuthzError> {
    let Some(Json(request)) = payload else {
        return Err(AuthzError::InvalidInput("Missing request body".to_string()));
    };
    let credential: RegisterPublicKeyCredential = serde_json::from_value(request.response)
        .map_err(|_| AuthzError::InvalidInput("Malformed attestation".to_string()))?;

    let now = Utc::now();
    let mut session = require_one_factor(state, headers, now).await?;
    require_csrf(headers, &session.record)?;
    require_elevation(&session, now)?;

    let parked = session
        .record
        .webauthn_state
        .take()
        .ok_or(MfaError::InvalidState)?;
    state.sessions().save(&session.id, &session.record).await?;

    let description = request.description.as_deref().unwrap_or("Security key");
    state
        .webauthn()
        .registration_finish(&session.username, &parked, &credential, description, now)
        .await?;

    Ok((StatusCode::OK, Json(OkResponse::empty())).into_response())
}

fn require_elevation(
    session: &super::FactorSession,
    now: chrono::DateTime<Utc>,
) -> Result<(), AuthzError> {
    if session
        .record
        .active_elevation(TokenPurpose::RegisterDevice, now)
        .is_none()
    {
        return Err(AuthzError::Forbidden(
            "Device registration requires identity verification".to_string(),
        ));
    }
    Ok(())
}
