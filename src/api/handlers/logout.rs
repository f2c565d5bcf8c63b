//! Session termination.

use axum::Json;
use axum::extract::Extension;
use axum::http::header::SET_COOKIE;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use super::types::OkResponse;
use super::{AppState, load_session};

/// Destroy the session and clear the cookie. Idempotent: logging out twice,
/// or with no session at all, still succeeds.
#[utoipa::path(
    post,
    path = "/api/logout",
    responses(
        (status = 200, description = "Session cleared")
    ),
    tag = "authentication"
)]
pub async fn logout(headers: HeaderMap, state: Extension<Arc<AppState>>) -> Response {
    let now = Utc::now();
    let loaded = match load_session(&state, &headers, now).await {
        Ok(loaded) => loaded,
        Err(err) => return err.into_response(),
    };

    if let Some(id) = loaded.id.as_deref() {
        if let Err(err) = state.sessions().destroy(id).await {
            // Logout must still clear the cookie; the record expires anyway.
            tracing::error!("failed to destroy session on logout: {err}");
        } else if let Some(username) = loaded.record.username() {
            info!(username, "session destroyed on logout");
        }
    }

    let mut response_headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&state.sessions().clear_cookie()) {
        response_headers.insert(SET_COOKIE, value);
    }
    (StatusCode::OK, response_headers, Json(OkResponse::empty())).into_response()
}
