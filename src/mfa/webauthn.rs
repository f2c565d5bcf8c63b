//! WebAuthn second-factor verification.
//!
//! Wraps `webauthn-rs` security-key flows. The ephemeral protocol state
//! produced by `registration_start`/`initiate` is handed back to the caller as
//! JSON; the pipeline parks it on the session record between the two
//! round-trips, so the verifier itself stays stateless.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;
use webauthn_rs::prelude::*;

use super::{MfaError, VerifyOutcome};
use crate::storage::{Repository, WebauthnCredentialRecord};

#[derive(Clone, Debug)]
pub struct WebauthnConfig {
    rp_id: String,
    rp_origin: String,
    rp_name: String,
}

impl WebauthnConfig {
    #[must_use]
    pub fn new(rp_id: String, rp_origin: String) -> Self {
        Self {
            rp_id,
            rp_origin,
            rp_name: "Gardi".to_string(),
        }
    }

    #[must_use]
    pub fn with_rp_name(mut self, rp_name: String) -> Self {
        self.rp_name = rp_name;
        self
    }
}

pub struct WebauthnVerifier {
    webauthn: Arc<Webauthn>,
    repository: Arc<dyn Repository>,
}

impl WebauthnVerifier {
    /// # Errors
    /// Returns an error when the relying-party origin does not parse or the
    /// builder rejects the configuration.
    pub fn new(repository: Arc<dyn Repository>, config: &WebauthnConfig) -> Result<Self, MfaError> {
        let rp_origin = Url::parse(&config.rp_origin)
            .map_err(|err| MfaError::Unavailable(format!("invalid relying-party origin: {err}")))?;
        let webauthn = WebauthnBuilder::new(&config.rp_id, &rp_origin)
            .map_err(|err| MfaError::Unavailable(format!("webauthn builder rejected: {err}")))?
            .rp_name(&config.rp_name)
            .build()
            .map_err(|err| MfaError::Unavailable(format!("webauthn builder rejected: {err}")))?;
        Ok(Self {
            webauthn: Arc::new(webauthn),
            repository,
        })
    }

    /// Begin registration of a new credential.
    ///
    /// Already-registered credentials are excluded so the same authenticator
    /// cannot be enrolled twice. Returns the browser challenge and the opaque
    /// state to park on the session.
    ///
    /// # Errors
    /// Storage or protocol failures map to `Unavailable`.
    pub async fn registration_start(
        &self,
        username: &str,
        display_name: &str,
    ) -> Result<(CreationChallengeResponse, serde_json::Value), MfaError> {
        let existing = self.repository.load_webauthn_credentials(username).await?;
        let exclude: Vec<CredentialID> = existing
            .into_iter()
            .map(|record| record.credential_id.into())
            .collect();

        let (challenge, registration) = self
            .webauthn
            .start_securitykey_registration(
                user_handle(username),
                username,
                display_name,
                Some(exclude),
                None,
                None,
            )
            .map_err(|err| MfaError::Unavailable(format!("registration start failed: {err}")))?;

        let state = serde_json::to_value(&registration)
            .map_err(|err| MfaError::Unavailable(format!("state does not serialize: {err}")))?;
        Ok((challenge, state))
    }

    /// Complete registration and persist the credential.
    ///
    /// # Errors
    /// `InvalidState` when the parked state does not decode; attestation
    /// failures map to `Unavailable`.
    pub async fn registration_finish(
        &self,
        username: &str,
        state: &serde_json::Value,
        response: &RegisterPublicKeyCredential,
        description: &str,
        now: DateTime<Utc>,
    ) -> Result<(), MfaError> {
        let registration: SecurityKeyRegistration =
            serde_json::from_value(state.clone()).map_err(|_| MfaError::InvalidState)?;

        let credential = self
            .webauthn
            .finish_securitykey_registration(response, &registration)
            .map_err(|err| MfaError::Unavailable(format!("registration rejected: {err}")))?;

        let record = WebauthnCredentialRecord {
            username: username.to_string(),
            credential_id: credential.cred_id().as_slice().to_vec(),
            credential: serde_json::to_value(&credential)
                .map_err(|err| MfaError::Unavailable(format!("credential does not serialize: {err}")))?,
            sign_count: 0,
            description: description.to_string(),
            created_at: now,
        };
        self.repository.save_webauthn_credential(&record).await?;
        debug!(username, "webauthn credential registered");
        Ok(())
    }

    /// Produce an assertion challenge over the user's registered credentials.
    ///
    /// # Errors
    /// `NotEnrolled` when no credential is registered.
    pub async fn initiate(
        &self,
        username: &str,
    ) -> Result<(RequestChallengeResponse, serde_json::Value), MfaError> {
        let records = self.repository.load_webauthn_credentials(username).await?;
        if records.is_empty() {
            return Err(MfaError::NotEnrolled);
        }

        let credentials: Vec<SecurityKey> = records
            .iter()
            .filter_map(|record| serde_json::from_value(record.credential.clone()).ok())
            .collect();
        if credentials.is_empty() {
            return Err(MfaError::Unavailable(
                "stored credentials do not decode".to_string(),
            ));
        }

        let (challenge, authentication) = self
            .webauthn
            .start_securitykey_authentication(&credentials)
            .map_err(|err| MfaError::Unavailable(format!("assertion start failed: {err}")))?;

        let state = serde_json::to_value(&authentication)
            .map_err(|err| MfaError::Unavailable(format!("state does not serialize: {err}")))?;
        Ok((challenge, state))
    }

    /// Verify an assertion against the state parked on the session.
    ///
    /// The signature counter, when the authenticator reports one, must be
    /// strictly greater than the stored counter; anything else smells like a
    /// cloned key and is rejected.
    ///
    /// # Errors
    /// `InvalidState` when the parked state does not decode.
    pub async fn verify(
        &self,
        username: &str,
        state: &serde_json::Value,
        response: &PublicKeyCredential,
    ) -> Result<VerifyOutcome, MfaError> {
        let authentication: SecurityKeyAuthentication =
            serde_json::from_value(state.clone()).map_err(|_| MfaError::InvalidState)?;

        let result = match self
            .webauthn
            .finish_securitykey_authentication(response, &authentication)
        {
            Ok(result) => result,
            Err(err) => {
                debug!(username, "webauthn assertion rejected: {err}");
                return Ok(VerifyOutcome::Rejected);
            }
        };

        let stored = self
            .repository
            .load_webauthn_credentials(username)
            .await?
            .into_iter()
            .find(|record| record.credential_id.as_slice() == result.cred_id().as_slice());
        let Some(stored) = stored else {
            // Signed by a key that is not registered to this user.
            return Ok(VerifyOutcome::Rejected);
        };

        let counter = i64::from(result.counter());
        if counter > 0 && counter <= stored.sign_count {
            warn!(username, "webauthn signature counter did not advance; possible cloned key");
            return Ok(VerifyOutcome::Rejected);
        }

        self.repository
            .update_webauthn_credential_counter(result.cred_id().as_slice(), counter)
            .await?;
        Ok(VerifyOutcome::Accepted)
    }
}

/// Stable per-user handle: WebAuthn wants a UUID, directories give us a name.
fn user_handle(username: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, username.as_bytes())
}
