//! Time-based one-time password verification.
//!
//! Codes are accepted for the current step and one previous step to absorb
//! clock skew. Each accepted `(user, step)` pair is burned through the
//! repository, so resubmitting a code inside its validity window fails.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use totp_rs::{Algorithm, Secret, TOTP};
use tracing::debug;

use super::{MfaError, VerifyOutcome};
use crate::storage::{Repository, TotpConfigurationRecord};

const DEFAULT_PERIOD: u32 = 30;
const DEFAULT_DIGITS: u32 = 6;
const DEFAULT_ALGORITHM: &str = "SHA1";

#[derive(Clone, Debug)]
pub struct TotpConfig {
    issuer: String,
    period: u32,
    digits: u32,
    algorithm: String,
}

impl TotpConfig {
    #[must_use]
    pub fn new(issuer: String) -> Self {
        Self {
            issuer,
            period: DEFAULT_PERIOD,
            digits: DEFAULT_DIGITS,
            algorithm: DEFAULT_ALGORITHM.to_string(),
        }
    }

    #[must_use]
    pub fn with_period(mut self, period: u32) -> Self {
        self.period = period;
        self
    }

    #[must_use]
    pub fn with_digits(mut self, digits: u32) -> Self {
        self.digits = digits;
        self
    }

    #[must_use]
    pub fn with_algorithm(mut self, algorithm: String) -> Self {
        self.algorithm = algorithm;
        self
    }
}

/// Result of an enrolment: shown to the user exactly once.
#[derive(Clone, Debug)]
pub struct TotpEnrollment {
    pub secret_base32: String,
    pub otpauth_url: String,
}

#[derive(Clone)]
pub struct TotpVerifier {
    repository: Arc<dyn Repository>,
    config: TotpConfig,
}

impl TotpVerifier {
    #[must_use]
    pub fn new(repository: Arc<dyn Repository>, config: TotpConfig) -> Self {
        Self { repository, config }
    }

    /// Generate and persist a fresh enrolment for `username`.
    ///
    /// Replaces any previous enrolment; the old secret stops working.
    ///
    /// # Errors
    /// Returns an error when secret generation fails or storage is
    /// unavailable.
    pub async fn enroll(&self, username: &str) -> Result<TotpEnrollment, MfaError> {
        let secret = Secret::generate_secret();
        let secret_bytes = secret
            .to_bytes()
            .map_err(|err| MfaError::Unavailable(format!("secret generation failed: {err}")))?;

        let totp = self
            .build(&self.config.algorithm, self.config.digits, self.config.period, secret_bytes, username)?;
        let enrollment = TotpEnrollment {
            secret_base32: totp.get_secret_base32(),
            otpauth_url: totp.get_url(),
        };

        self.repository
            .save_totp_configuration(&TotpConfigurationRecord {
                username: username.to_string(),
                secret_base32: enrollment.secret_base32.clone(),
                period: self.config.period,
                digits: self.config.digits,
                algorithm: self.config.algorithm.clone(),
                last_step: None,
            })
            .await?;
        debug!(username, "totp enrolment saved");
        Ok(enrollment)
    }

    /// Check a submitted code against the user's enrolment.
    ///
    /// # Errors
    /// `NotEnrolled` when the user has no TOTP configuration; `Unavailable`
    /// on storage failure.
    pub async fn verify(
        &self,
        username: &str,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<VerifyOutcome, MfaError> {
        let Some(record) = self.repository.load_totp_configuration(username).await? else {
            return Err(MfaError::NotEnrolled);
        };

        let secret_bytes = Secret::Encoded(record.secret_base32.clone())
            .to_bytes()
            .map_err(|err| MfaError::Unavailable(format!("stored secret does not decode: {err}")))?;
        let totp = self.build(
            &record.algorithm,
            record.digits,
            record.period,
            secret_bytes,
            username,
        )?;

        let timestamp = u64::try_from(now.timestamp()).unwrap_or(0);
        let period = u64::from(record.period.max(1));
        let current_step = timestamp / period;

        // Current step plus one step of backwards skew.
        let Some(step) = [current_step, current_step.saturating_sub(1)]
            .into_iter()
            .find(|step| totp.generate(step * period) == code)
        else {
            return Ok(VerifyOutcome::Rejected);
        };

        // Burn the step; a replay of the same (user, step) loses here.
        let step = i64::try_from(step).unwrap_or(i64::MAX);
        if self.repository.consume_totp_step(username, step).await? {
            Ok(VerifyOutcome::Accepted)
        } else {
            debug!(username, step, "totp step replayed");
            Ok(VerifyOutcome::Rejected)
        }
    }

    fn build(
        &self,
        algorithm: &str,
        digits: u32,
        period: u32,
        secret_bytes: Vec<u8>,
        username: &str,
    ) -> Result<TOTP, MfaError> {
        let algorithm = parse_algorithm(algorithm)?;
        TOTP::new(
            algorithm,
            digits as usize,
            1,
            u64::from(period.max(1)),
            secret_bytes,
            Some(self.config.issuer.clone()),
            username.to_string(),
        )
        .map_err(|err| MfaError::Unavailable(format!("totp parameters rejected: {err}")))
    }
}

fn parse_algorithm(algorithm: &str) -> Result<Algorithm, MfaError> {
    match algorithm.to_ascii_uppercase().as_str() {
        "SHA1" => Ok(Algorithm::SHA1),
        "SHA256" => Ok(Algorithm::SHA256),
        "SHA512" => Ok(Algorithm::SHA512),
        other => Err(MfaError::Unavailable(format!(
            "unsupported totp algorithm: {other}"
        ))),
    }
}
