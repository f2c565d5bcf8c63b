use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// How far a session has climbed the authentication ladder.
///
/// The ordering is load-bearing: verdicts are computed by comparing the
/// session level against the level a rule requires.
#[derive(
    Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum AuthenticationLevel {
    #[default]
    Anonymous,
    OneFactor,
    TwoFactor,
}

impl AuthenticationLevel {
    /// Numeric form used by the state endpoint and log fields.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Anonymous => 0,
            Self::OneFactor => 1,
            Self::TwoFactor => 2,
        }
    }
}

/// The policy a matching rule (or the default policy) demands.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessPolicy {
    Bypass,
    OneFactor,
    TwoFactor,
    /// Fail-closed default.
    #[default]
    Deny,
}

impl AccessPolicy {
    /// The session level that satisfies this policy, if any level does.
    #[must_use]
    pub fn required_level(self) -> Option<AuthenticationLevel> {
        match self {
            Self::Bypass => Some(AuthenticationLevel::Anonymous),
            Self::OneFactor => Some(AuthenticationLevel::OneFactor),
            Self::TwoFactor => Some(AuthenticationLevel::TwoFactor),
            Self::Deny => None,
        }
    }

    /// True when `level` is enough to pass this policy.
    #[must_use]
    pub fn satisfied_by(self, level: AuthenticationLevel) -> bool {
        self.required_level()
            .is_some_and(|required| level >= required)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_ordered() {
        assert!(AuthenticationLevel::Anonymous < AuthenticationLevel::OneFactor);
        assert!(AuthenticationLevel::OneFactor < AuthenticationLevel::TwoFactor);
    }

    #[test]
    fn bypass_is_satisfied_by_anonymous() {
        assert!(AccessPolicy::Bypass.satisfied_by(AuthenticationLevel::Anonymous));
    }

    #[test]
    fn deny_is_never_satisfied() {
        for level in [
            AuthenticationLevel::Anonymous,
            AuthenticationLevel::OneFactor,
            AuthenticationLevel::TwoFactor,
        ] {
            assert!(!AccessPolicy::Deny.satisfied_by(level));
        }
    }

    #[test]
    fn two_factor_requires_two_factor() {
        assert!(!AccessPolicy::TwoFactor.satisfied_by(AuthenticationLevel::OneFactor));
        assert!(AccessPolicy::TwoFactor.satisfied_by(AuthenticationLevel::TwoFactor));
    }

    #[test]
    fn serde_names_are_snake_case() {
        let policy: AccessPolicy = serde_json::from_str("\"one_factor\"").expect("parse");
        assert_eq!(policy, AccessPolicy::OneFactor);
    }
}
