//! Second-factor verifiers.
//!
//! Every verifier speaks the same contract: `initiate` produces a challenge,
//! `verify` judges the response as accepted, rejected, or rate-limited. The
//! pipeline treats the outcomes uniformly — a rejection increments the
//! regulator's failure count, an acceptance promotes the session, and
//! rate-limiting is surfaced without counting against the user.

pub mod duo;
pub mod totp;
pub mod webauthn;

use thiserror::Error;

use crate::storage::StorageError;

/// Uniform verdict of a second-factor verification.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VerifyOutcome {
    /// The response satisfied the challenge.
    Accepted,
    /// The response was wrong; counts as a failed attempt.
    Rejected,
    /// The verifier is backing off (or timed out); not counted.
    RateLimited,
}

#[derive(Debug, Error)]
pub enum MfaError {
    /// The user has no enrolled device for this method.
    #[error("no enrolled device")]
    NotEnrolled,
    /// The challenge state is missing, expired, or does not decode.
    #[error("challenge state missing or invalid")]
    InvalidState,
    #[error("verifier unavailable: {0}")]
    Unavailable(String),
}

impl From<StorageError> for MfaError {
    fn from(err: StorageError) -> Self {
        Self::Unavailable(err.to_string())
    }
}
