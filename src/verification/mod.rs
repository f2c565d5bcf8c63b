//! Identity-verification tokens.
//!
//! Single-use, purpose-bound tokens backing password reset and device
//! registration. The raw token only travels out-of-band (through the
//! notifier); storage sees a SHA-256 digest. Consuming a token is the one and
//! only way a session gains elevation.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::info;

use crate::storage::{IdentityTokenRecord, Repository, StorageResult};

/// What a token is allowed to be consumed for. Purpose mismatch fails closed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenPurpose {
    ResetPassword,
    RegisterDevice,
}

impl TokenPurpose {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ResetPassword => "reset_password",
            Self::RegisterDevice => "register_device",
        }
    }
}

#[derive(Clone)]
pub struct IdentityTokenService {
    repository: Arc<dyn Repository>,
    ttl_seconds: i64,
}

impl IdentityTokenService {
    #[must_use]
    pub fn new(repository: Arc<dyn Repository>, ttl_seconds: i64) -> Self {
        Self {
            repository,
            ttl_seconds,
        }
    }

    /// Issue a fresh token for `username` and `purpose`.
    ///
    /// The returned raw token is handed to the notifier and never stored.
    ///
    /// # Errors
    /// Returns an error when the storage backend is unavailable.
    pub async fn issue(
        &self,
        username: &str,
        purpose: TokenPurpose,
        now: DateTime<Utc>,
    ) -> StorageResult<String> {
        let token = generate_token();
        let record = IdentityTokenRecord {
            token_hash: hash_token(&token),
            username: username.to_string(),
            purpose,
            issued_at: now,
            expires_at: now + Duration::seconds(self.ttl_seconds),
            consumed_at: None,
        };
        self.repository.save_identity_token(&record).await?;
        info!(username, purpose = purpose.as_str(), "identity verification token issued");
        Ok(token)
    }

    /// Consume a token, once, for its declared purpose.
    ///
    /// Returns the issuing username on the one successful call; expired,
    /// unknown, already-consumed, and wrong-purpose tokens all yield `None`.
    ///
    /// # Errors
    /// Returns an error when the storage backend is unavailable.
    pub async fn consume(
        &self,
        token: &str,
        purpose: TokenPurpose,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<String>> {
        let username = self
            .repository
            .consume_identity_token(&hash_token(token), purpose, now)
            .await?;
        if let Some(username) = &username {
            info!(username, purpose = purpose.as_str(), "identity verification token consumed");
        }
        Ok(username)
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn hash_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}
