//! The ordered-first-match policy evaluator.

use anyhow::Result;
use tracing::debug;

use super::fingerprint::RequestFingerprint;
use super::level::{AccessPolicy, AuthenticationLevel};
use super::rule::{AccessControlConfig, AccessRule, RuleMatch, compile_network_groups};

/// Outcome of evaluating a fingerprint against the rule set.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Judgment {
    /// Policy of the first matching rule, or the default policy.
    pub policy: AccessPolicy,
    /// True when an earlier subject-scoped rule would have matched had the
    /// session been authenticated. The pipeline prompts for step-up instead of
    /// returning a hard deny when this is set, and re-evaluates afterwards.
    pub deferred: bool,
}

/// The compiled rule set. Immutable after load and shared across requests;
/// configuration reload builds a fresh instance and swaps the handle.
#[derive(Clone, Debug)]
pub struct AccessControl {
    rules: Vec<AccessRule>,
    default_policy: AccessPolicy,
}

impl AccessControl {
    /// Compile the declared configuration into a matchable rule set.
    ///
    /// # Errors
    /// Returns an error for invalid regexes, CIDRs, subject prefixes, or
    /// references to undeclared network groups.
    pub fn compile(config: &AccessControlConfig) -> Result<Self> {
        let groups = compile_network_groups(&config.networks)?;
        let rules = config
            .rules
            .iter()
            .map(|rule| AccessRule::compile(rule, &groups))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            rules,
            default_policy: config.default_policy,
        })
    }

    /// An empty rule set falling through to `default_policy`.
    #[must_use]
    pub fn with_default_policy(default_policy: AccessPolicy) -> Self {
        Self {
            rules: Vec::new(),
            default_policy,
        }
    }

    /// Evaluate in declaration order; the first matching rule is final.
    ///
    /// Subject-scoped rules that cannot be judged yet (session below
    /// `OneFactor`) are skipped, and the skip is reported via
    /// [`Judgment::deferred`] so callers can distinguish "authenticate first"
    /// from "denied outright".
    #[must_use]
    pub fn evaluate(
        &self,
        fingerprint: &RequestFingerprint,
        level: AuthenticationLevel,
    ) -> Judgment {
        let mut deferred = false;
        for (position, rule) in self.rules.iter().enumerate() {
            match rule.matches(fingerprint, level) {
                RuleMatch::Hit => {
                    debug!(
                        rule = position,
                        policy = ?rule.policy,
                        host = %fingerprint.host,
                        "access control rule matched"
                    );
                    return Judgment {
                        policy: rule.policy,
                        deferred,
                    };
                }
                RuleMatch::Deferred => deferred = true,
                RuleMatch::Miss => {}
            }
        }
        Judgment {
            policy: self.default_policy,
            deferred,
        }
    }

    #[must_use]
    pub fn default_policy(&self) -> AccessPolicy {
        self.default_policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorization::fingerprint::Subject;
    use crate::authorization::rule::RuleConfig;

    fn fingerprint(host: &str) -> RequestFingerprint {
        RequestFingerprint {
            method: "GET".to_string(),
            scheme: "https".to_string(),
            host: host.to_string(),
            path: "/".to_string(),
            query: None,
            remote_ip: Some("203.0.113.7".parse().expect("ip")),
            subject: Subject::default(),
        }
    }

    fn access_control(rules: Vec<RuleConfig>, default_policy: AccessPolicy) -> AccessControl {
        AccessControl::compile(&AccessControlConfig {
            default_policy,
            networks: Vec::new(),
            rules,
        })
        .expect("compile access control")
    }

    #[test]
    fn empty_rule_set_uses_default_policy() {
        let access = AccessControl::with_default_policy(AccessPolicy::Deny);
        let judgment = access.evaluate(&fingerprint("app.example.com"), AuthenticationLevel::Anonymous);
        assert_eq!(judgment.policy, AccessPolicy::Deny);
        assert!(!judgment.deferred);
    }

    #[test]
    fn first_match_wins() {
        let access = access_control(
            vec![
                RuleConfig {
                    domain: vec!["app.example.com".to_string()],
                    policy: AccessPolicy::Bypass,
                    ..RuleConfig::default()
                },
                RuleConfig {
                    domain: vec!["app.example.com".to_string()],
                    policy: AccessPolicy::TwoFactor,
                    ..RuleConfig::default()
                },
            ],
            AccessPolicy::Deny,
        );
        let judgment = access.evaluate(&fingerprint("app.example.com"), AuthenticationLevel::Anonymous);
        assert_eq!(judgment.policy, AccessPolicy::Bypass);
    }

    #[test]
    fn subject_gated_rule_sets_deferred_for_anonymous() {
        let access = access_control(
            vec![RuleConfig {
                domain: vec!["admin.example.com".to_string()],
                subject: vec!["group:admins".to_string()],
                policy: AccessPolicy::TwoFactor,
                ..RuleConfig::default()
            }],
            AccessPolicy::Deny,
        );

        // Anonymous: the rule is skipped, not denied; deferred marks the skip.
        let judgment = access.evaluate(&fingerprint("admin.example.com"), AuthenticationLevel::Anonymous);
        assert_eq!(judgment.policy, AccessPolicy::Deny);
        assert!(judgment.deferred);

        // One-factor, not in the group: clean default-deny, no deferral.
        let mut alice = fingerprint("admin.example.com");
        alice.subject = Subject {
            username: Some("alice".to_string()),
            groups: vec!["users".to_string()],
            client_id: None,
        };
        let judgment = access.evaluate(&alice, AuthenticationLevel::OneFactor);
        assert_eq!(judgment.policy, AccessPolicy::Deny);
        assert!(!judgment.deferred);

        // One-factor, in the group: the rule now matches.
        let mut carol = fingerprint("admin.example.com");
        carol.subject = Subject {
            username: Some("carol".to_string()),
            groups: vec!["admins".to_string()],
            client_id: None,
        };
        let judgment = access.evaluate(&carol, AuthenticationLevel::OneFactor);
        assert_eq!(judgment.policy, AccessPolicy::TwoFactor);
    }

    #[test]
    fn deferred_survives_a_later_match() {
        // A skipped subject rule followed by a matching deny: the judgment is
        // deny, but deferred stays set so the pipeline can still offer
        // step-up and re-evaluate once the subject is known.
        let access = access_control(
            vec![
                RuleConfig {
                    subject: vec!["group:admins".to_string()],
                    policy: AccessPolicy::TwoFactor,
                    ..RuleConfig::default()
                },
                RuleConfig {
                    policy: AccessPolicy::Deny,
                    ..RuleConfig::default()
                },
            ],
            AccessPolicy::Deny,
        );
        let judgment = access.evaluate(&fingerprint("x.example.com"), AuthenticationLevel::Anonymous);
        assert_eq!(judgment.policy, AccessPolicy::Deny);
        assert!(judgment.deferred);
    }

    #[test]
    fn unmatched_host_falls_through() {
        let access = access_control(
            vec![RuleConfig {
                domain: vec!["public.example.com".to_string()],
                policy: AccessPolicy::Bypass,
                ..RuleConfig::default()
            }],
            AccessPolicy::OneFactor,
        );
        let judgment = access.evaluate(&fingerprint("other.example.com"), AuthenticationLevel::Anonymous);
        assert_eq!(judgment.policy, AccessPolicy::OneFactor);
    }
}
