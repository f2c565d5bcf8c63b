//! The first-factor (username/password) endpoint.
//!
//! Order matters: the regulator is consulted before the user backend so a
//! banned user never reaches the directory, and the authentication log row is
//! written before the response so the next regulation check sees this
//! attempt. On success the session is rotated to `OneFactor`.

use axum::Json;
use axum::extract::Extension;
use axum::http::header::SET_COOKIE;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

use super::error::AuthzError;
use super::types::{FirstFactorRequest, KoResponse, OkResponse, RedirectResponse};
use super::{AppState, extract_client_ip, load_session};
use crate::regulation::{Attempt, Regulation};
use crate::session::UserProfile;
use crate::storage::AttemptKind;
use crate::users::{UserDetails, UserError};

const ENDPOINT_URI: &str = "/api/firstfactor";

#[utoipa::path(
    post,
    path = "/api/firstfactor",
    request_body = FirstFactorRequest,
    responses(
        (status = 200, description = "Authenticated at one-factor"),
        (status = 401, description = "Credentials rejected", body = KoResponse),
        (status = 429, description = "User is banned", body = KoResponse)
    ),
    tag = "authentication"
)]
pub async fn firstfactor(
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
    payload: Option<Json<FirstFactorRequest>>,
) -> Response {
    let Some(Json(request)) = payload else {
        return AuthzError::InvalidInput("Missing request body".to_string()).into_response();
    };
    if request.username.is_empty() || request.password.is_empty() {
        return AuthzError::InvalidInput("Username and password are required".to_string())
            .into_response();
    }

    match handle(&state, &headers, &request).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn handle(
    state: &AppState,
    headers: &HeaderMap,
    request: &FirstFactorRequest,
) -> Result<Response, AuthzError> {
    let now = Utc::now();
    let remote_ip = extract_client_ip(headers);

    // Banned users are turned away before the backend sees the password.
    if let Regulation::Banned { .. } = state.regulator().check(&request.username, now).await? {
        return Err(AuthzError::AuthBanned);
    }

    let details = match state
        .users()
        .check_credentials(&request.username, &request.password)
        .await
    {
        Ok(details) => details,
        Err(UserError::Unavailable(detail)) => {
            warn!("user backend unavailable during first factor: {detail}");
            return Err(AuthzError::Unavailable);
        }
        Err(UserError::NotFound | UserError::InvalidCredentials) => {
            state
                .regulator()
                .mark(&attempt(&request.username, false, remote_ip), now)
                .await?;
            return Err(AuthzError::AuthFailed);
        }
    };

    state
        .regulator()
        .mark(&attempt(&request.username, true, remote_ip), now)
        .await?;

    let loaded = load_session(state, headers, now).await?;
    let mut record = loaded.record;
    record.remember_me = request.keep_me_logged_in;
    record.redirect_url = request.target_url.clone();
    record.promote_one_factor(profile_from(details), now);

    let new_id = state
        .sessions()
        .regenerate(loaded.id.as_deref(), &mut record, now)
        .await?;

    info!(username = %request.username, "first factor succeeded");

    let redirect = redirect_target(
        request.target_url.as_deref(),
        state.sessions().config().cookie_domain(),
        state.portal().default_redirection_url(),
    );

    let mut response_headers = HeaderMap::new();
    let cookie = state.sessions().cookie(&new_id, record.remember_me);
    if let Ok(value) = HeaderValue::from_str(&cookie) {
        response_headers.insert(SET_COOKIE, value);
    }
    Ok((
        StatusCode::OK,
        response_headers,
        Json(OkResponse::with_data(RedirectResponse { redirect })),
    )
        .into_response())
}

fn attempt(username: &str, successful: bool, remote_ip: Option<String>) -> Attempt {
    Attempt {
        username: username.to_string(),
        successful,
        kind: AttemptKind::OneFactor,
        remote_ip,
        request_uri: ENDPOINT_URI.to_string(),
        request_method: "POST".to_string(),
    }
}

fn profile_from(details: UserDetails) -> UserProfile {
    UserProfile {
        username: details.username,
        display_name: details.display_name,
        emails: details.emails,
        groups: details.groups,
    }
}

/// Only redirect to targets inside the protected domain; anything else falls
/// back to the configured default.
fn redirect_target(
    target: Option<&str>,
    cookie_domain: &str,
    default: Option<&str>,
) -> Option<String> {
    let candidate = target.and_then(|raw| Url::parse(raw).ok()).filter(|url| {
        url.scheme() == "https"
            && url.host_str().is_some_and(|host| {
                host == cookie_domain || host.ends_with(&format!(".{cookie_domain}"))
            })
    });
    match candidate {
        Some(url) => Some(url.to_string()),
        None => default.map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_accepts_subdomains_of_the_cookie_domain() {
        assert_eq!(
            redirect_target(Some("https://app.example.com/x"), "example.com", None).as_deref(),
            Some("https://app.example.com/x")
        );
        assert_eq!(
            redirect_target(Some("https://example.com/"), "example.com", None).as_deref(),
            Some("https://example.com/")
        );
    }

    #[test]
    fn redirect_rejects_foreign_hosts() {
        assert_eq!(
            redirect_target(Some("https://evil.com/"), "example.com", None),
            None
        );
        assert_eq!(
            redirect_target(Some("https://notexample.com/"), "example.com", None),
            None
        );
        // Suffix trickery does not pass the label boundary check.
        assert_eq!(
            redirect_target(Some("https://bexample.com/"), "example.com", None),
            None
        );
    }

    #[test]
    fn redirect_rejects_plain_http() {
        assert_eq!(
            redirect_target(Some("http://app.example.com/"), "example.com", None),
            None
        );
    }

    #[test]
    fn rejected_target_falls_back_to_default() {
        assert_eq!(
            redirect_target(
                Some("https://evil.com/"),
                "example.com",
                Some("https://home.example.com/")
            )
            .as_deref(),
            Some("https://home.example.com/")
        );
        assert_eq!(
            redirect_target(None, "example.com", Some("https://home.example.com/")).as_deref(),
            Some("https://home.example.com/")
        );
    }
}
