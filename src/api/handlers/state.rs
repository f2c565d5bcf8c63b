//! Session introspection for the portal.

use axum::Json;
use axum::extract::Extension;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use std::sync::Arc;

use super::types::StateResponse;
use super::{AppState, load_session};
use crate::verification::TokenPurpose;

#[utoipa::path(
    get,
    path = "/api/state",
    responses(
        (status = 200, description = "Current session state", body = StateResponse)
    ),
    tag = "authentication"
)]
pub async fn state(headers: axum::http::HeaderMap, app: Extension<Arc<AppState>>) -> Response {
    let now = Utc::now();
    let loaded = match load_session(&app, &headers, now).await {
        Ok(loaded) => loaded,
        Err(err) => return err.into_response(),
    };

    let elevated = loaded
        .record
        .active_elevation(TokenPurpose::RegisterDevice, now)
        .is_some()
        || loaded
            .record
            .active_elevation(TokenPurpose::ResetPassword, now)
            .is_some();

    Json(StateResponse {
        username: loaded.record.username().map(str::to_string),
        authentication_level: loaded.record.level.as_u8(),
        elevated,
        csrf_token: loaded.record.csrf_token.clone(),
        default_redirection_url: app
            .portal()
            .default_redirection_url()
            .map(str::to_string),
    })
    .into_response()
}
