//! The verification endpoint called by reverse proxies.
//!
//! The proxy forwards the original request's coordinates in headers; the
//! response status is the verdict. 200 carries the identity headers for the
//! upstream, 401 carries a redirect to the portal with the original URL, 403
//! is a hard deny. Identity headers are only ever set on allow, so upstreams
//! cannot be spoofed by clients sending them directly.

use axum::Json;
use axum::extract::Extension;
use axum::http::header::{LOCATION, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;
use url::Url;

use super::error::AuthzError;
use super::types::KoResponse;
use super::{AppState, extract_client_ip, load_session};
use crate::authorization::{AccessPolicy, RequestFingerprint, Subject};
use crate::session::SessionRecord;

const HEADER_FORWARDED_METHOD: &str = "x-forwarded-method";
const HEADER_FORWARDED_PROTO: &str = "x-forwarded-proto";
const HEADER_FORWARDED_HOST: &str = "x-forwarded-host";
const HEADER_FORWARDED_URI: &str = "x-forwarded-uri";
const HEADER_ORIGINAL_URL: &str = "x-original-url";

const HEADER_REMOTE_USER: &str = "remote-user";
const HEADER_REMOTE_NAME: &str = "remote-name";
const HEADER_REMOTE_EMAIL: &str = "remote-email";
const HEADER_REMOTE_GROUPS: &str = "remote-groups";

/// Forward-auth entry point.
#[utoipa::path(
    get,
    path = "/api/verify",
    responses(
        (status = 200, description = "Request is allowed; identity headers attached"),
        (status = 400, description = "Verification headers missing or malformed", body = KoResponse),
        (status = 401, description = "Authentication (or step-up) required", body = KoResponse),
        (status = 403, description = "Denied by policy", body = KoResponse)
    ),
    tag = "verification"
)]
pub async fn verify(headers: HeaderMap, state: Extension<Arc<AppState>>) -> Response {
    let now = Utc::now();

    let mut fingerprint = match build_fingerprint(&headers) {
        Ok(fingerprint) => fingerprint,
        Err(err) => return err.into_response(),
    };

    let loaded = match load_session(&state, &headers, now).await {
        Ok(loaded) => loaded,
        Err(err) => return err.into_response(),
    };
    fingerprint.subject = loaded.record.subject();

    let judgment = state.access().evaluate(&fingerprint, loaded.record.level);
    debug!(
        host = %fingerprint.host,
        path = %fingerprint.path,
        level = loaded.record.level.as_u8(),
        policy = ?judgment.policy,
        deferred = judgment.deferred,
        "verification judgment"
    );

    let mut response = match judgment.policy {
        AccessPolicy::Bypass => allow(&loaded.record),
        AccessPolicy::OneFactor | AccessPolicy::TwoFactor => {
            if judgment.policy.satisfied_by(loaded.record.level) {
                allow(&loaded.record)
            } else {
                step_up(&state, &fingerprint)
            }
        }
        AccessPolicy::Deny => {
            // A subject-gated rule earlier in the list might still grant
            // access once the user authenticates; offer step-up instead of a
            // hard deny in that case. Deferral only happens below OneFactor.
            if judgment.deferred {
                step_up(&state, &fingerprint)
            } else {
                deny()
            }
        }
    };

    if loaded.tampered {
        if let Ok(value) = HeaderValue::from_str(&state.sessions().clear_cookie()) {
            response.headers_mut().append(SET_COOKIE, value);
        }
    }
    response
}

/// 200 with identity headers for the upstream.
fn allow(record: &SessionRecord) -> Response {
    let mut headers = HeaderMap::new();
    if let Some(profile) = &record.profile {
        insert_header(&mut headers, HEADER_REMOTE_USER, &profile.username);
        insert_header(&mut headers, HEADER_REMOTE_NAME, &profile.display_name);
        if let Some(email) = profile.emails.first() {
            insert_header(&mut headers, HEADER_REMOTE_EMAIL, email);
        }
        insert_header(&mut headers, HEADER_REMOTE_GROUPS, &profile.groups.join(","));
    }
    (StatusCode::OK, headers).into_response()
}

/// 401 pointing the user at the portal, carrying the original URL so the
/// portal can route back after authentication.
fn step_up(state: &AppState, fingerprint: &RequestFingerprint) -> Response {
    let location = format!(
        "{}?rd={}",
        state.portal().portal_url(),
        fingerprint.original_url()
    );
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&location) {
        headers.insert(LOCATION, value);
    }
    (
        StatusCode::UNAUTHORIZED,
        headers,
        Json(KoResponse::new("Authentication required".to_string())),
    )
        .into_response()
}

fn deny() -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(KoResponse::new("Access denied".to_string())),
    )
        .into_response()
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

/// Assemble the fingerprint from the proxy's verification headers.
///
/// `X-Original-URL` wins when present; otherwise the `X-Forwarded-*` set must
/// be complete enough to reconstruct the original request.
fn build_fingerprint(headers: &HeaderMap) -> Result<RequestFingerprint, AuthzError> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };

    let method = header(HEADER_FORWARDED_METHOD)
        .unwrap_or("GET")
        .to_uppercase();
    let remote_ip = extract_client_ip(headers).and_then(|raw| raw.parse::<IpAddr>().ok());

    if let Some(original) = header(HEADER_ORIGINAL_URL) {
        let url = Url::parse(original).map_err(|_| {
            AuthzError::InvalidInput("X-Original-URL does not parse".to_string())
        })?;
        let host = url
            .host_str()
            .ok_or_else(|| AuthzError::InvalidInput("X-Original-URL has no host".to_string()))?
            .to_string();
        return Ok(RequestFingerprint {
            method,
            scheme: url.scheme().to_string(),
            host,
            path: url.path().to_string(),
            query: url.query().map(str::to_string),
            remote_ip,
            subject: Subject::default(),
        });
    }

    let scheme = header(HEADER_FORWARDED_PROTO).unwrap_or("https").to_lowercase();
    let host = header(HEADER_FORWARDED_HOST)
        .ok_or_else(|| AuthzError::InvalidInput("Missing X-Forwarded-Host".to_string()))?
        .to_lowercase();
    let uri = header(HEADER_FORWARDED_URI).unwrap_or("/");
    let (path, query) = match uri.split_once('?') {
        Some((path, query)) => (path.to_string(), Some(query.to_string())),
        None => (uri.to_string(), None),
    };

    Ok(RequestFingerprint {
        method,
        scheme,
        host,
        path,
        query,
        remote_ip,
        subject: Subject::default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_from(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(*name, HeaderValue::from_str(value).expect("header value"));
        }
        headers
    }

    #[test]
    fn fingerprint_from_forwarded_headers() {
        let headers = headers_from(&[
            (HEADER_FORWARDED_METHOD, "POST"),
            (HEADER_FORWARDED_PROTO, "https"),
            (HEADER_FORWARDED_HOST, "App.Example.COM"),
            (HEADER_FORWARDED_URI, "/path/to?x=1"),
            ("x-forwarded-for", "203.0.113.4"),
        ]);
        let fingerprint = build_fingerprint(&headers).expect("fingerprint");
        assert_eq!(fingerprint.method, "POST");
        assert_eq!(fingerprint.host, "app.example.com");
        assert_eq!(fingerprint.path, "/path/to");
        assert_eq!(fingerprint.query.as_deref(), Some("x=1"));
        assert_eq!(
            fingerprint.remote_ip,
            Some("203.0.113.4".parse::<IpAddr>().expect("ip"))
        );
    }

    #[test]
    fn fingerprint_prefers_original_url() {
        let headers = headers_from(&[
            (HEADER_FORWARDED_HOST, "wrong.example.com"),
            (HEADER_ORIGINAL_URL, "https://app.example.com/dashboard?tab=2"),
        ]);
        let fingerprint = build_fingerprint(&headers).expect("fingerprint");
        assert_eq!(fingerprint.host, "app.example.com");
        assert_eq!(fingerprint.path, "/dashboard");
        assert_eq!(fingerprint.query.as_deref(), Some("tab=2"));
    }

    #[test]
    fn fingerprint_without_host_is_invalid_input() {
        let headers = headers_from(&[(HEADER_FORWARDED_PROTO, "https")]);
        let err = build_fingerprint(&headers).expect_err("must fail");
        assert!(matches!(err, AuthzError::InvalidInput(_)));
    }

    #[test]
    fn malformed_original_url_is_invalid_input() {
        let headers = headers_from(&[(HEADER_ORIGINAL_URL, "://nope")]);
        assert!(build_fingerprint(&headers).is_err());
    }
}
