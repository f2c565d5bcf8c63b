//! Duo push endpoints.
//!
//! `start` fires the push and parks the Duo transaction id on the session;
//! the completing request polls the transaction within the per-request
//! deadline. Deadline expiry is surfaced as 429 without counting against the
//! user.

use axum::Json;
use axum::extract::Extension;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use std::sync::Arc;

use super::super::error::AuthzError;
use super::super::types::{KoResponse, OkResponse};
use super::super::{AppState, extract_client_ip};
use super::{check_regulation, conclude, require_one_factor};
use crate::mfa::MfaError;
use crate::mfa::duo::DuoVerifier;
use crate::storage::AttemptKind;

const ENDPOINT_URI: &str = "/api/secondfactor/duo";

fn duo<'a>(state: &'a AppState) -> Result<&'a DuoVerifier, AuthzError> {
    state
        .duo()
        .ok_or_else(|| AuthzError::Forbidden("Duo is not configured".to_string()))
}

/// Send the push and park the transaction.
#[utoipa::path(
    post,
    path = "/api/secondfactor/duo/start",
    responses(
        (status = 200, description = "Push sent"),
        (status = 401, description = "Not authenticated", body = KoResponse),
        (status = 403, description = "Duo unavailable or not enrolled", body = KoResponse),
        (status = 429, description = "User is banned", body = KoResponse)
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
    check_regulation(state, &session.username, now).await?;

    let transaction = duo(state)?.initiate(&session.username).await?;
    session.record.duo_transaction = Some(transaction);
    state.sessions().save(&session.id, &session.record).await?;

    Ok((StatusCode::OK, Json(OkResponse::empty())).into_response())
}

/// Wait for the user's answer and promote on approval.
#[utoipa::path(
    post,
    path = "/api/secondfactor/duo",
    responses(
        (status = 200, description = "Push approved; session promoted"),
        (status = 401, description = "Push denied", body = KoResponse),
        (status = 429, description = "Timed out waiting for the push, or banned", body = KoResponse)
    ),
    tag = "authentication"
)]
pub async fn verify(headers: HeaderMap, state: Extension<Arc<AppState>>) -> Response {
    match handle_verify(&state, &headers).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn handle_verify(state: &AppState, headers: &HeaderMap) -> Result<Response, AuthzError> {
    let now = Utc::now();
    let mut session = require_one_factor(state, headers, now).await?;
    check_regulation(state, &session.username, now).await?;

    let transaction = session
        .record
        .duo_transaction
        .take()
        .ok_or(MfaError::InvalidState)?;
    state.sessions().save(&session.id, &session.record).await?;

    let outcome = duo(state)?.verify(&session.username, &transaction).await;
    conclude(
        state,
        session,
        AttemptKind::Duo,
        ENDPOINT_URI,
        extract_client_ip(headers),
        outcome,
        now,
    )
    .await
}
