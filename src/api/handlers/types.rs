//! Request and response bodies for the portal API.
//!
//! Every response uses the `{"status": "OK" | "KO", ...}` envelope so clients
//! can branch without inspecting HTTP status codes.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Success envelope with an optional payload.
#[derive(Debug, Serialize)]
pub struct OkResponse<T: Serialize> {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> OkResponse<T> {
    #[must_use]
    pub fn with_data(data: T) -> Self {
        Self {
            status: "OK",
            data: Some(data),
        }
    }
}

impl OkResponse<()> {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            status: "OK",
            data: None,
        }
    }
}

/// Failure envelope with a stable message.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct KoResponse {
    pub status: String,
    pub message: String,
}

impl KoResponse {
    #[must_use]
    pub fn new(message: String) -> Self {
        Self {
            status: "KO".to_string(),
            message,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct FirstFactorRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub keep_me_logged_in: bool,
    /// Where the portal should send the user after login.
    #[serde(default)]
    pub target_url: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RedirectResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct StateResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub authentication_level: u8,
    /// Set when the session holds an active elevation.
    pub elevated: bool,
    pub csrf_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_redirection_url: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct TotpVerifyRequest {
    pub code: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TotpRegisterResponse {
    pub secret: String,
    pub otpauth_url: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct WebauthnVerifyRequest {
    /// Browser assertion as produced by `navigator.credentials.get`.
    #[schema(value_type = Object)]
    pub response: serde_json::Value,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct WebauthnRegisterFinishRequest {
    #[schema(value_type = Object)]
    pub response: serde_json::Value,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct IdentityFinishRequest {
    pub token: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ResetPasswordStartRequest {
    pub username: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ResetPasswordRequest {
    pub password: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_envelope_shape() {
        let body = serde_json::to_value(OkResponse::with_data(RedirectResponse {
            redirect: Some("https://app.example.com/".to_string()),
        }))
        .expect("serialize");
        assert_eq!(body["status"], "OK");
        assert_eq!(body["data"]["redirect"], "https://app.example.com/");
    }

    #[test]
    fn empty_ok_envelope_omits_data() {
        let body = serde_json::to_value(OkResponse::empty()).expect("serialize");
        assert_eq!(body, serde_json::json!({"status": "OK"}));
    }

    #[test]
    fn ko_envelope_shape() {
        let body = serde_json::to_value(KoResponse::new("nope".to_string())).expect("serialize");
        assert_eq!(body, serde_json::json!({"status": "KO", "message": "nope"}));
    }

    #[test]
    fn first_factor_request_defaults() {
        let request: FirstFactorRequest =
            serde_json::from_str(r#"{"username":"alice","password":"hunter2"}"#).expect("parse");
        assert!(!request.keep_me_logged_in);
        assert!(request.target_url.is_none());
    }
}
