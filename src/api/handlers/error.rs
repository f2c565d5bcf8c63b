//! The error taxonomy surfaced by the API.
//!
//! Every handler funnels failures into [`AuthzError`]; the `IntoResponse`
//! mapping is the single place status codes and response bodies are decided.
//! Backend details never leak into a response body, and credential material
//! never reaches a log line.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{error, warn};

use super::types::KoResponse;
use crate::mfa::MfaError;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum AuthzError {
    /// Malformed request or decode failure. No side effects happened.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// No valid session where one is required.
    #[error("authentication required")]
    Unauthenticated,
    /// Policy denies, or a capability (elevation, enrolment) is missing.
    #[error("access denied: {0}")]
    Forbidden(String),
    /// A verifier rejected the credentials. A failure row was recorded.
    #[error("authentication failed")]
    AuthFailed,
    /// The regulator forbids further attempts; no verifier was consulted.
    #[error("too many authentication attempts")]
    AuthBanned,
    /// A verifier signalled back-off; nothing was counted.
    #[error("verification rate limited")]
    RateLimited,
    /// Transient backend failure; authentication state is unchanged.
    #[error("service unavailable")]
    Unavailable,
    /// Invariant violation.
    #[error("internal error")]
    Internal,
}

impl AuthzError {
    fn status(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated | Self::AuthFailed => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::AuthBanned | Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable message for the response body. Deliberately static for the
    /// opaque kinds.
    fn message(&self) -> String {
        match self {
            Self::InvalidInput(message) => message.clone(),
            Self::Forbidden(message) => message.clone(),
            Self::Unauthenticated => "Authentication required".to_string(),
            Self::AuthFailed => "Authentication failed".to_string(),
            Self::AuthBanned => "Too many authentication attempts".to_string(),
            Self::RateLimited => "Verification rate limited".to_string(),
            Self::Unavailable => "Service temporarily unavailable".to_string(),
            Self::Internal => "Internal error".to_string(),
        }
    }
}

impl IntoResponse for AuthzError {
    fn into_response(self) -> Response {
        match &self {
            Self::Unavailable => error!("request failed: service unavailable"),
            Self::Internal => error!("request failed: internal error"),
            other => warn!(kind = ?other, "request rejected"),
        }
        (self.status(), Json(KoResponse::new(self.message()))).into_response()
    }
}

impl From<StorageError> for AuthzError {
    fn from(err: StorageError) -> Self {
        error!("storage backend failure: {err}");
        Self::Unavailable
    }
}

impl From<MfaError> for AuthzError {
    fn from(err: MfaError) -> Self {
        match err {
            MfaError::NotEnrolled => {
                Self::Forbidden("Second factor is not enrolled".to_string())
            }
            MfaError::InvalidState => {
                Self::InvalidInput("No pending challenge for this session".to_string())
            }
            MfaError::Unavailable(detail) => {
                error!("verifier failure: {detail}");
                Self::Unavailable
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_the_taxonomy() {
        assert_eq!(
            AuthzError::InvalidInput("x".to_string()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(AuthzError::Unauthenticated.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AuthzError::AuthFailed.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            AuthzError::Forbidden("x".to_string()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(AuthzError::AuthBanned.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(AuthzError::RateLimited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(AuthzError::Unavailable.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(AuthzError::Internal.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn storage_failure_maps_to_unavailable() {
        let err: AuthzError = StorageError("connection refused".to_string()).into();
        assert!(matches!(err, AuthzError::Unavailable));
    }

    #[test]
    fn unenrolled_second_factor_is_forbidden_with_actionable_message() {
        let err: AuthzError = MfaError::NotEnrolled.into();
        match err {
            AuthzError::Forbidden(message) => {
                assert_eq!(message, "Second factor is not enrolled");
            }
            other => panic!("expected Forbidden, got {other:?}"),
        }
    }

    #[test]
    fn opaque_kinds_do_not_leak_details() {
        let err: AuthzError = StorageError("password=hunter2 leaked".to_string()).into();
        assert_eq!(err.message(), "Service temporarily unavailable");
    }
}
