use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::authorization::{AuthenticationLevel, Subject};
use crate::verification::TokenPurpose;

/// Attributes fetched from the user backend and cached on the session.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub username: String,
    pub display_name: String,
    pub emails: Vec<String>,
    pub groups: Vec<String>,
}

/// A time-bounded capability to perform sensitive self-service actions.
///
/// Granted by consuming an identity-verification token, never by the
/// first/second-factor endpoints. The username is recorded separately from
/// the session's own user because a password-reset elevation can be attached
/// to an anonymous session.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Elevation {
    pub username: String,
    pub purpose: TokenPurpose,
    pub expires_at: DateTime<Utc>,
}

/// One persisted session.
///
/// Invariants, enforced by the promotion methods and asserted in tests:
/// a level at or above `OneFactor` implies a profile and a first-factor
/// timestamp; `TwoFactor` implies a second-factor timestamp no earlier than
/// the first; `last_activity_at` never exceeds `expires_at`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub profile: Option<UserProfile>,
    pub level: AuthenticationLevel,
    pub first_factor_at: Option<DateTime<Utc>>,
    pub second_factor_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub remember_me: bool,
    /// Where to send the user once step-up completes.
    pub redirect_url: Option<String>,
    pub csrf_token: String,
    pub elevation: Option<Elevation>,
    /// Serialized WebAuthn assertion state between initiate and verify.
    pub webauthn_state: Option<serde_json::Value>,
    /// Pending Duo transaction between initiate and verify.
    pub duo_transaction: Option<String>,
}

impl SessionRecord {
    /// Fresh anonymous record. Not persisted until something mutates it.
    #[must_use]
    pub fn anonymous(now: DateTime<Utc>, expires_at: DateTime<Utc>, csrf_token: String) -> Self {
        Self {
            profile: None,
            level: AuthenticationLevel::Anonymous,
            first_factor_at: None,
            second_factor_at: None,
            last_activity_at: now,
            expires_at,
            remember_me: false,
            redirect_url: None,
            csrf_token,
            elevation: None,
            webauthn_state: None,
            duo_transaction: None,
        }
    }

    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.profile.as_ref().map(|profile| profile.username.as_str())
    }

    /// Transition to `OneFactor` with the authenticated profile.
    pub fn promote_one_factor(&mut self, profile: UserProfile, now: DateTime<Utc>) {
        self.profile = Some(profile);
        self.level = AuthenticationLevel::OneFactor;
        self.first_factor_at = Some(now);
        self.second_factor_at = None;
        self.last_activity_at = now;
        // A fresh factor invalidates any half-finished challenge.
        self.webauthn_state = None;
        self.duo_transaction = None;
    }

    /// Transition to `TwoFactor`. Requires a prior first factor.
    pub fn promote_two_factor(&mut self, now: DateTime<Utc>) {
        debug_assert!(self.profile.is_some() && self.first_factor_at.is_some());
        self.level = AuthenticationLevel::TwoFactor;
        self.second_factor_at = Some(now.max(self.first_factor_at.unwrap_or(now)));
        self.last_activity_at = now;
        self.webauthn_state = None;
        self.duo_transaction = None;
    }

    /// The policy subject this session represents.
    #[must_use]
    pub fn subject(&self) -> Subject {
        match &self.profile {
            Some(profile) => Subject {
                username: Some(profile.username.clone()),
                groups: profile.groups.clone(),
                client_id: None,
            },
            None => Subject::default(),
        }
    }

    /// Elevation that is present, unexpired, and for the given purpose.
    #[must_use]
    pub fn active_elevation(&self, purpose: TokenPurpose, now: DateTime<Utc>) -> Option<&Elevation> {
        self.elevation
            .as_ref()
            .filter(|elevation| elevation.purpose == purpose && elevation.expires_at > now)
    }
}
