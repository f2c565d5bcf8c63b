//! Duo push verification.
//!
//! `initiate` asks the Duo Auth API to send a push and returns the external
//! transaction identifier; `verify` polls the transaction until the user
//! answers or the per-request deadline expires. Deadline expiry surfaces as
//! `RateLimited`: the attempt is not counted against the user and the session
//! is left untouched.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::Sha512;
use std::time::Duration;
use tracing::{debug, warn};

use super::{MfaError, VerifyOutcome};

type HmacSha512 = Hmac<Sha512>;

const AUTH_PATH: &str = "/auth/v2/auth";
const AUTH_STATUS_PATH: &str = "/auth/v2/auth_status";
const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct DuoConfig {
    api_host: String,
    integration_key: String,
    secret_key: SecretString,
    /// Overall budget for one `verify` call.
    timeout_seconds: u64,
}

impl DuoConfig {
    #[must_use]
    pub fn new(api_host: String, integration_key: String, secret_key: SecretString) -> Self {
        Self {
            api_host,
            integration_key,
            secret_key,
            timeout_seconds: 60,
        }
    }

    #[must_use]
    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }
}

#[derive(Debug, Deserialize)]
struct DuoEnvelope<T> {
    stat: String,
    response: Option<T>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    txid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuthStatusResponse {
    result: Option<String>,
}

pub struct DuoVerifier {
    client: reqwest::Client,
    config: DuoConfig,
}

impl DuoVerifier {
    /// # Errors
    /// Returns an error when the HTTP client cannot be constructed.
    pub fn new(config: DuoConfig) -> Result<Self, MfaError> {
        let client = reqwest::Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_seconds.max(1)))
            .build()
            .map_err(|err| MfaError::Unavailable(format!("duo client build failed: {err}")))?;
        Ok(Self { client, config })
    }

    /// Send a push to the user's enrolled device.
    ///
    /// Returns the Duo transaction identifier to poll with [`Self::verify`].
    ///
    /// # Errors
    /// Duo API failures map to `Unavailable`; a user without a Duo enrolment
    /// maps to `NotEnrolled`.
    pub async fn initiate(&self, username: &str) -> Result<String, MfaError> {
        let params = vec![
            ("async".to_string(), "1".to_string()),
            ("device".to_string(), "auto".to_string()),
            ("factor".to_string(), "push".to_string()),
            ("username".to_string(), username.to_string()),
        ];
        let envelope: DuoEnvelope<AuthResponse> =
            self.request(reqwest::Method::POST, AUTH_PATH, &params).await?;

        if envelope.stat != "OK" {
            let message = envelope.message.unwrap_or_default();
            // Duo reports unenrolled users as an invalid request.
            if message.to_lowercase().contains("enroll") {
                return Err(MfaError::NotEnrolled);
            }
            return Err(MfaError::Unavailable(format!("duo auth failed: {message}")));
        }

        envelope
            .response
            .and_then(|response| response.txid)
            .ok_or_else(|| MfaError::Unavailable("duo auth returned no txid".to_string()))
    }

    /// Poll the transaction until the user answers or the deadline passes.
    pub async fn verify(&self, username: &str, transaction_id: &str) -> VerifyOutcome {
        let deadline = Duration::from_secs(self.config.timeout_seconds.max(1));
        match tokio::time::timeout(deadline, self.poll(transaction_id)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                debug!(username, "duo verification deadline expired");
                VerifyOutcome::RateLimited
            }
        }
    }

    async fn poll(&self, transaction_id: &str) -> VerifyOutcome {
        let params = vec![("txid".to_string(), transaction_id.to_string())];
        loop {
            let envelope: Result<DuoEnvelope<AuthStatusResponse>, MfaError> = self
                .request(reqwest::Method::GET, AUTH_STATUS_PATH, &params)
                .await;
            match envelope {
                Ok(envelope) => {
                    let result = envelope
                        .response
                        .and_then(|response| response.result)
                        .unwrap_or_default();
                    match result.as_str() {
                        "allow" => return VerifyOutcome::Accepted,
                        "deny" => return VerifyOutcome::Rejected,
                        // "waiting" or an empty result: keep polling.
                        _ => {}
                    }
                }
                Err(err) => {
                    warn!("duo status poll failed: {err}");
                    return VerifyOutcome::RateLimited;
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn request<T: for<'de> Deserialize<'de>>(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &[(String, String)],
    ) -> Result<DuoEnvelope<T>, MfaError> {
        let date = Utc::now().to_rfc2822();
        let authorization = self.authorization(&date, method.as_str(), path, params);
        let url = format!("https://{}{path}", self.config.api_host);
        let encoded = canonical_params(params);

        let request = match method {
            reqwest::Method::POST => self
                .client
                .post(&url)
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body(encoded),
            _ => self.client.get(format!("{url}?{encoded}")),
        };

        let response = request
            .header("Date", &date)
            .header("Authorization", authorization)
            .send()
            .await
            .map_err(|err| MfaError::Unavailable(format!("duo request failed: {err}")))?;

        response
            .json::<DuoEnvelope<T>>()
            .await
            .map_err(|err| MfaError::Unavailable(format!("duo response malformed: {err}")))
    }

    /// Duo's HMAC request signature as a Basic authorization header.
    fn authorization(
        &self,
        date: &str,
        method: &str,
        path: &str,
        params: &[(String, String)],
    ) -> String {
        let canon = [
            date.to_string(),
            method.to_uppercase(),
            self.config.api_host.to_lowercase(),
            path.to_string(),
            canonical_params(params),
        ]
        .join("\n");

        let mut mac =
            HmacSha512::new_from_slice(self.config.secret_key.expose_secret().as_bytes())
                .expect("HMAC accepts keys of any length");
        mac.update(canon.as_bytes());
        let signature = hex_encode(&mac.finalize().into_bytes());

        let credentials = format!("{}:{signature}", self.config.integration_key);
        format!("Basic {}", STANDARD.encode(credentials))
    }
}

/// Parameters sorted by key and percent-encoded the way Duo canonicalizes.
fn canonical_params(params: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    sorted
        .iter()
        .map(|(key, value)| format!("{}={}", percent_encode(key), percent_encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}

fn percent_encode(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            other => encoded.push_str(&format!("%{other:02X}")),
        }
    }
    encoded
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}
