//! The repository interface to the storage driver, plus its record types.
//!
//! Everything the core persists goes through [`Repository`]: session records,
//! the append-only authentication log, TOTP and WebAuthn device material, and
//! identity-verification tokens. `Save` operations are upserts; `insert` is
//! strictly append. Two implementations ship: Postgres for deployments and an
//! in-memory one for tests and single-node evaluation.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::session::SessionRecord;
use crate::verification::TokenPurpose;

/// Backend failure. Deliberately coarse: callers map it to `Unavailable`
/// without learning backend details.
#[derive(Debug, Error)]
#[error("storage unavailable: {0}")]
pub struct StorageError(pub String);

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        Self(err.to_string())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Which verifier produced an authentication log row.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum AttemptKind {
    #[serde(rename = "1FA")]
    OneFactor,
    #[serde(rename = "TOTP")]
    Totp,
    #[serde(rename = "U2F")]
    Webauthn,
    #[serde(rename = "DUO")]
    Duo,
}

impl AttemptKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OneFactor => "1FA",
            Self::Totp => "TOTP",
            Self::Webauthn => "U2F",
            Self::Duo => "DUO",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "1FA" => Some(Self::OneFactor),
            "TOTP" => Some(Self::Totp),
            "U2F" => Some(Self::Webauthn),
            "DUO" => Some(Self::Duo),
            _ => None,
        }
    }
}

/// One row of the append-only authentication log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthenticationLogRow {
    pub id: Uuid,
    pub time: DateTime<Utc>,
    pub successful: bool,
    pub username: String,
    pub kind: AttemptKind,
    pub remote_ip: Option<String>,
    pub request_uri: String,
    pub request_method: String,
}

/// Per-user TOTP enrolment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TotpConfigurationRecord {
    pub username: String,
    pub secret_base32: String,
    pub period: u32,
    pub digits: u32,
    pub algorithm: String,
    /// Highest accepted step; replay protection rejects anything at or below.
    pub last_step: Option<i64>,
}

/// One registered WebAuthn credential, serialized the way the verifier
/// library understands it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebauthnCredentialRecord {
    pub username: String,
    pub credential_id: Vec<u8>,
    pub credential: serde_json::Value,
    pub sign_count: i64,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// A purpose-bound, single-use identity-verification token. Only the digest
/// of the raw token is stored.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdentityTokenRecord {
    pub token_hash: Vec<u8>,
    pub username: String,
    pub purpose: TokenPurpose,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
}

/// The storage driver contract consumed by the core.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn save_session(&self, key: &str, record: &SessionRecord) -> StorageResult<()>;
    async fn load_session(&self, key: &str) -> StorageResult<Option<SessionRecord>>;
    async fn delete_session(&self, key: &str) -> StorageResult<()>;

    async fn insert_authentication_log(&self, row: &AuthenticationLogRow) -> StorageResult<()>;
    /// Rows for `username` at or after `since`, newest first.
    async fn list_recent_authentications(
        &self,
        username: &str,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<AuthenticationLogRow>>;

    async fn load_totp_configuration(
        &self,
        username: &str,
    ) -> StorageResult<Option<TotpConfigurationRecord>>;
    async fn save_totp_configuration(&self, record: &TotpConfigurationRecord) -> StorageResult<()>;
    /// Atomically mark `step` consumed for `username`.
    ///
    /// Returns `false` when the step (or a later one) was already used, so a
    /// given `(user, step)` pair can be accepted at most once.
    async fn consume_totp_step(&self, username: &str, step: i64) -> StorageResult<bool>;

    async fn load_webauthn_credentials(
        &self,
        username: &str,
    ) -> StorageResult<Vec<WebauthnCredentialRecord>>;
    async fn save_webauthn_credential(&self, record: &WebauthnCredentialRecord)
        -> StorageResult<()>;
    async fn update_webauthn_credential_counter(
        &self,
        credential_id: &[u8],
        sign_count: i64,
    ) -> StorageResult<()>;

    async fn save_identity_token(&self, record: &IdentityTokenRecord) -> StorageResult<()>;
    /// Atomically consume an unexpired, unconsumed token of the declared
    /// purpose. Returns the issuing username on the one successful call.
    async fn consume_identity_token(
        &self,
        token_hash: &[u8],
        purpose: TokenPurpose,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_kind_round_trips() {
        for kind in [
            AttemptKind::OneFactor,
            AttemptKind::Totp,
            AttemptKind::Webauthn,
            AttemptKind::Duo,
        ] {
            assert_eq!(AttemptKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(AttemptKind::parse("SMS"), None);
    }

    #[test]
    fn attempt_kind_serde_uses_wire_names() {
        let json = serde_json::to_string(&AttemptKind::Webauthn).expect("serialize");
        assert_eq!(json, "\"U2F\"");
    }
}
