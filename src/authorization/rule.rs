//! Rule declarations and their compiled forms.
//!
//! Rules are declared in YAML and compiled once at startup. A compiled rule
//! matches iff every predicate it declares matches; predicates left out are
//! wildcards. Subject predicates are special: they can only be judged once the
//! session is at least `OneFactor`, so matching reports a three-way outcome.

use anyhow::{Context, Result, bail};
use ipnetwork::IpNetwork;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;

use super::fingerprint::{RequestFingerprint, Subject};
use super::level::{AccessPolicy, AuthenticationLevel};

/// A named group of CIDRs referenced by rules.
#[derive(Clone, Debug, Deserialize)]
pub struct NetworkGroupConfig {
    pub name: String,
    pub networks: Vec<String>,
}

/// One rule as declared in the access-control file.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    #[serde(default)]
    pub domain: Vec<String>,
    #[serde(default)]
    pub domain_regex: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub subject: Vec<String>,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub query: Vec<QueryPredicateConfig>,
    pub policy: AccessPolicy,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryPredicateConfig {
    pub key: String,
    pub operator: QueryOperator,
    #[serde(default)]
    pub value: Option<String>,
}

/// The whole access-control section of the configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccessControlConfig {
    pub default_policy: AccessPolicy,
    #[serde(default)]
    pub networks: Vec<NetworkGroupConfig>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// Host predicate: literal, one-label wildcard, or regex.
#[derive(Clone, Debug)]
pub enum DomainPattern {
    /// Exact host, compared case-insensitively.
    Literal(String),
    /// `*.suffix` — the wildcard consumes exactly one label.
    Wildcard(String),
    Regex(Regex),
}

impl DomainPattern {
    fn parse(pattern: &str) -> Result<Self> {
        let lowered = pattern.trim().to_lowercase();
        if lowered.is_empty() {
            bail!("empty domain pattern");
        }
        if let Some(suffix) = lowered.strip_prefix("*.") {
            if suffix.is_empty() {
                bail!("wildcard domain needs a suffix: {pattern}");
            }
            return Ok(Self::Wildcard(suffix.to_string()));
        }
        Ok(Self::Literal(lowered))
    }

    pub(super) fn matches(&self, host: &str) -> bool {
        let host = host.to_lowercase();
        match self {
            Self::Literal(literal) => host == *literal,
            Self::Wildcard(suffix) => host
                .strip_suffix(suffix)
                .and_then(|head| head.strip_suffix('.'))
                .is_some_and(|label| !label.is_empty() && !label.contains('.')),
            Self::Regex(regex) => regex.is_match(&host),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum QueryOperator {
    Equal,
    NotEqual,
    Present,
    Absent,
    Pattern,
}

/// Compiled query predicate over the request's query pairs.
#[derive(Clone, Debug)]
pub struct QueryPredicate {
    key: String,
    operator: QueryOperator,
    value: Option<String>,
    pattern: Option<Regex>,
}

impl QueryPredicate {
    fn compile(config: &QueryPredicateConfig) -> Result<Self> {
        let pattern = match config.operator {
            QueryOperator::Pattern => {
                let raw = config
                    .value
                    .as_deref()
                    .context("query predicate with operator 'pattern' needs a value")?;
                Some(Regex::new(raw).with_context(|| format!("invalid query pattern: {raw}"))?)
            }
            QueryOperator::Equal | QueryOperator::NotEqual => {
                if config.value.is_none() {
                    bail!(
                        "query predicate on key '{}' needs a value for operator {:?}",
                        config.key,
                        config.operator
                    );
                }
                None
            }
            QueryOperator::Present | QueryOperator::Absent => None,
        };
        Ok(Self {
            key: config.key.clone(),
            operator: config.operator,
            value: config.value.clone(),
            pattern,
        })
    }

    fn matches(&self, pairs: &[(String, String)]) -> bool {
        let found = pairs.iter().find(|(key, _)| *key == self.key);
        match self.operator {
            QueryOperator::Present => found.is_some(),
            QueryOperator::Absent => found.is_none(),
            QueryOperator::Equal => {
                found.is_some_and(|(_, value)| Some(value.as_str()) == self.value.as_deref())
            }
            QueryOperator::NotEqual => {
                found.is_some_and(|(_, value)| Some(value.as_str()) != self.value.as_deref())
            }
            QueryOperator::Pattern => found.is_some_and(|(_, value)| {
                self.pattern
                    .as_ref()
                    .is_some_and(|pattern| pattern.is_match(value))
            }),
        }
    }
}

/// Subject predicate with any-of semantics across the rule's list.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SubjectPredicate {
    User(String),
    Group(String),
    OAuth2Client(String),
}

impl SubjectPredicate {
    fn parse(raw: &str) -> Result<Self> {
        if let Some(user) = raw.strip_prefix("user:") {
            return Ok(Self::User(user.to_string()));
        }
        if let Some(group) = raw.strip_prefix("group:") {
            return Ok(Self::Group(group.to_string()));
        }
        if let Some(client) = raw.strip_prefix("oauth2:client:") {
            return Ok(Self::OAuth2Client(client.to_string()));
        }
        bail!("unknown subject predicate: {raw}");
    }

    fn matches(&self, subject: &Subject) -> bool {
        match self {
            Self::User(user) => subject.username.as_deref() == Some(user.as_str()),
            Self::Group(group) => subject.groups.iter().any(|candidate| candidate == group),
            Self::OAuth2Client(client) => subject.client_id.as_deref() == Some(client.as_str()),
        }
    }
}

/// How a single rule relates to a fingerprint.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum RuleMatch {
    /// Every declared predicate matched.
    Hit,
    /// At least one non-subject predicate failed.
    Miss,
    /// All non-subject predicates matched, but subjects could not be judged
    /// because the session is below `OneFactor`. Evaluation continues; the
    /// pipeline uses this to prefer step-up over a hard deny.
    Deferred,
}

/// One compiled element of the ordered rule list.
#[derive(Clone, Debug)]
pub struct AccessRule {
    domains: Vec<DomainPattern>,
    resources: Vec<Regex>,
    subjects: Vec<SubjectPredicate>,
    methods: Vec<String>,
    networks: Vec<IpNetwork>,
    query: Vec<QueryPredicate>,
    pub(super) policy: AccessPolicy,
}

impl AccessRule {
    /// Compile a declared rule, resolving named networks through `groups`.
    pub(super) fn compile(
        config: &RuleConfig,
        groups: &HashMap<String, Vec<IpNetwork>>,
    ) -> Result<Self> {
        let mut domains = Vec::with_capacity(config.domain.len() + config.domain_regex.len());
        for pattern in &config.domain {
            domains.push(DomainPattern::parse(pattern)?);
        }
        for raw in &config.domain_regex {
            let regex =
                Regex::new(raw).with_context(|| format!("invalid domain regex: {raw}"))?;
            domains.push(DomainPattern::Regex(regex));
        }

        let resources = config
            .resources
            .iter()
            .map(|raw| {
                Regex::new(raw).with_context(|| format!("invalid resource pattern: {raw}"))
            })
            .collect::<Result<Vec<_>>>()?;

        let subjects = config
            .subject
            .iter()
            .map(|raw| SubjectPredicate::parse(raw))
            .collect::<Result<Vec<_>>>()?;

        let methods = config
            .methods
            .iter()
            .map(|method| method.to_uppercase())
            .collect();

        let mut networks = Vec::new();
        for raw in &config.networks {
            if let Some(group) = groups.get(raw) {
                networks.extend(group.iter().copied());
            } else {
                let network = raw
                    .parse::<IpNetwork>()
                    .with_context(|| format!("unknown network group or invalid CIDR: {raw}"))?;
                networks.push(network);
            }
        }

        let query = config
            .query
            .iter()
            .map(QueryPredicate::compile)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            domains,
            resources,
            subjects,
            methods,
            networks,
            query,
            policy: config.policy,
        })
    }

    pub(super) fn matches(
        &self,
        fingerprint: &RequestFingerprint,
        level: AuthenticationLevel,
    ) -> RuleMatch {
        if !self.matches_domain(&fingerprint.host)
            || !self.matches_method(&fingerprint.method)
            || !self.matches_resource(fingerprint)
            || !self.matches_network(fingerprint.remote_ip)
            || !self.matches_query(fingerprint)
        {
            return RuleMatch::Miss;
        }

        if self.subjects.is_empty() {
            return RuleMatch::Hit;
        }
        if level < AuthenticationLevel::OneFactor {
            return RuleMatch::Deferred;
        }
        if self
            .subjects
            .iter()
            .any(|predicate| predicate.matches(&fingerprint.subject))
        {
            RuleMatch::Hit
        } else {
            RuleMatch::Miss
        }
    }

    fn matches_domain(&self, host: &str) -> bool {
        self.domains.is_empty() || self.domains.iter().any(|pattern| pattern.matches(host))
    }

    fn matches_method(&self, method: &str) -> bool {
        self.methods.is_empty()
            || self
                .methods
                .iter()
                .any(|candidate| candidate.eq_ignore_ascii_case(method))
    }

    fn matches_resource(&self, fingerprint: &RequestFingerprint) -> bool {
        if self.resources.is_empty() {
            return true;
        }
        let resource = fingerprint.resource();
        self.resources.iter().any(|regex| regex.is_match(&resource))
    }

    fn matches_network(&self, remote_ip: Option<IpAddr>) -> bool {
        if self.networks.is_empty() {
            return true;
        }
        // A network-scoped rule cannot match a request with no usable IP.
        let Some(ip) = remote_ip else {
            return false;
        };
        self.networks.iter().any(|network| network.contains(ip))
    }

    fn matches_query(&self, fingerprint: &RequestFingerprint) -> bool {
        if self.query.is_empty() {
            return true;
        }
        let pairs = fingerprint.query_pairs();
        self.query.iter().all(|predicate| predicate.matches(&pairs))
    }
}

/// Resolve named network groups to their parsed CIDR lists.
pub(super) fn compile_network_groups(
    groups: &[NetworkGroupConfig],
) -> Result<HashMap<String, Vec<IpNetwork>>> {
    let mut compiled = HashMap::with_capacity(groups.len());
    for group in groups {
        let networks = group
            .networks
            .iter()
            .map(|raw| {
                raw.parse::<IpNetwork>()
                    .with_context(|| format!("invalid CIDR '{raw}' in network group {}", group.name))
            })
            .collect::<Result<Vec<_>>>()?;
        if compiled.insert(group.name.clone(), networks).is_some() {
            bail!("duplicate network group: {}", group.name);
        }
    }
    Ok(compiled)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fingerprint(host: &str, path: &str) -> RequestFingerprint {
        RequestFingerprint {
            method: "GET".to_string(),
            scheme: "https".to_string(),
            host: host.to_string(),
            path: path.to_string(),
            query: None,
            remote_ip: Some("192.168.1.10".parse().expect("ip")),
            subject: Subject::default(),
        }
    }

    fn compile(config: RuleConfig) -> AccessRule {
        AccessRule::compile(&config, &HashMap::new()).expect("compile rule")
    }

    #[test]
    fn literal_domain_is_case_insensitive() {
        let pattern = DomainPattern::parse("App.Example.COM").expect("parse");
        assert!(pattern.matches("app.example.com"));
        assert!(pattern.matches("APP.EXAMPLE.COM"));
        assert!(!pattern.matches("other.example.com"));
    }

    #[test]
    fn wildcard_consumes_exactly_one_label() {
        let pattern = DomainPattern::parse("*.example.com").expect("parse");
        assert!(pattern.matches("app.example.com"));
        assert!(!pattern.matches("example.com"));
        assert!(!pattern.matches("a.b.example.com"));
        assert!(!pattern.matches(".example.com"));
    }

    #[test]
    fn domain_regex_matches_host() {
        let rule = compile(RuleConfig {
            domain_regex: vec!["^user-[a-z]+\\.example\\.com$".to_string()],
            policy: AccessPolicy::OneFactor,
            ..RuleConfig::default()
        });
        assert_eq!(
            rule.matches(
                &fingerprint("user-alice.example.com", "/"),
                AuthenticationLevel::Anonymous
            ),
            RuleMatch::Hit
        );
        assert_eq!(
            rule.matches(
                &fingerprint("user-1.example.com", "/"),
                AuthenticationLevel::Anonymous
            ),
            RuleMatch::Miss
        );
    }

    #[test]
    fn missing_predicates_are_wildcards() {
        let rule = compile(RuleConfig {
            policy: AccessPolicy::Bypass,
            ..RuleConfig::default()
        });
        assert_eq!(
            rule.matches(
                &fingerprint("anything.example.com", "/any/path"),
                AuthenticationLevel::Anonymous
            ),
            RuleMatch::Hit
        );
    }

    #[test]
    fn resource_patterns_cover_path_and_query() {
        let rule = compile(RuleConfig {
            resources: vec!["^/api/.*secret=1.*$".to_string()],
            policy: AccessPolicy::TwoFactor,
            ..RuleConfig::default()
        });
        let mut with_query = fingerprint("app.example.com", "/api/items");
        with_query.query = Some("secret=1".to_string());
        assert_eq!(
            rule.matches(&with_query, AuthenticationLevel::Anonymous),
            RuleMatch::Hit
        );
        assert_eq!(
            rule.matches(
                &fingerprint("app.example.com", "/api/items"),
                AuthenticationLevel::Anonymous
            ),
            RuleMatch::Miss
        );
    }

    #[test]
    fn subject_rule_defers_below_one_factor() {
        let rule = compile(RuleConfig {
            subject: vec!["group:admins".to_string()],
            policy: AccessPolicy::TwoFactor,
            ..RuleConfig::default()
        });
        let anonymous = fingerprint("admin.example.com", "/");
        assert_eq!(
            rule.matches(&anonymous, AuthenticationLevel::Anonymous),
            RuleMatch::Deferred
        );

        let mut authed = anonymous.clone();
        authed.subject = Subject {
            username: Some("carol".to_string()),
            groups: vec!["admins".to_string()],
            client_id: None,
        };
        assert_eq!(
            rule.matches(&authed, AuthenticationLevel::OneFactor),
            RuleMatch::Hit
        );

        authed.subject.groups.clear();
        assert_eq!(
            rule.matches(&authed, AuthenticationLevel::OneFactor),
            RuleMatch::Miss
        );
    }

    #[test]
    fn subject_predicates_are_any_of() {
        let rule = compile(RuleConfig {
            subject: vec!["user:alice".to_string(), "group:admins".to_string()],
            policy: AccessPolicy::OneFactor,
            ..RuleConfig::default()
        });
        let mut request = fingerprint("app.example.com", "/");
        request.subject = Subject {
            username: Some("alice".to_string()),
            groups: Vec::new(),
            client_id: None,
        };
        assert_eq!(
            rule.matches(&request, AuthenticationLevel::OneFactor),
            RuleMatch::Hit
        );
    }

    #[test]
    fn oauth2_client_subject() {
        let predicate = SubjectPredicate::parse("oauth2:client:dashboard").expect("parse");
        let subject = Subject {
            username: None,
            groups: Vec::new(),
            client_id: Some("dashboard".to_string()),
        };
        assert!(predicate.matches(&subject));
    }

    #[test]
    fn unknown_subject_prefix_is_rejected() {
        assert!(SubjectPredicate::parse("role:admin").is_err());
    }

    #[test]
    fn network_predicate_uses_cidr_containment() {
        let rule = compile(RuleConfig {
            networks: vec!["192.168.0.0/16".to_string()],
            policy: AccessPolicy::Bypass,
            ..RuleConfig::default()
        });
        assert_eq!(
            rule.matches(
                &fingerprint("app.example.com", "/"),
                AuthenticationLevel::Anonymous
            ),
            RuleMatch::Hit
        );

        let mut outside = fingerprint("app.example.com", "/");
        outside.remote_ip = Some("10.0.0.1".parse().expect("ip"));
        assert_eq!(
            rule.matches(&outside, AuthenticationLevel::Anonymous),
            RuleMatch::Miss
        );

        let mut unknown = fingerprint("app.example.com", "/");
        unknown.remote_ip = None;
        assert_eq!(
            rule.matches(&unknown, AuthenticationLevel::Anonymous),
            RuleMatch::Miss
        );
    }

    #[test]
    fn named_network_groups_resolve() {
        let groups = compile_network_groups(&[NetworkGroupConfig {
            name: "internal".to_string(),
            networks: vec!["10.0.0.0/8".to_string()],
        }])
        .expect("groups");
        let rule = AccessRule::compile(
            &RuleConfig {
                networks: vec!["internal".to_string()],
                policy: AccessPolicy::Bypass,
                ..RuleConfig::default()
            },
            &groups,
        )
        .expect("compile");

        let mut request = fingerprint("app.example.com", "/");
        request.remote_ip = Some("10.20.30.40".parse().expect("ip"));
        assert_eq!(
            rule.matches(&request, AuthenticationLevel::Anonymous),
            RuleMatch::Hit
        );
    }

    #[test]
    fn invalid_network_reference_fails_compile() {
        let result = AccessRule::compile(
            &RuleConfig {
                networks: vec!["no-such-group".to_string()],
                policy: AccessPolicy::Bypass,
                ..RuleConfig::default()
            },
            &HashMap::new(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn query_predicates_all_must_match() {
        let rule = compile(RuleConfig {
            query: vec![
                QueryPredicateConfig {
                    key: "action".to_string(),
                    operator: QueryOperator::Equal,
                    value: Some("edit".to_string()),
                },
                QueryPredicateConfig {
                    key: "token".to_string(),
                    operator: QueryOperator::Absent,
                    value: None,
                },
            ],
            policy: AccessPolicy::TwoFactor,
            ..RuleConfig::default()
        });

        let mut request = fingerprint("app.example.com", "/edit");
        request.query = Some("action=edit".to_string());
        assert_eq!(
            rule.matches(&request, AuthenticationLevel::Anonymous),
            RuleMatch::Hit
        );

        request.query = Some("action=edit&token=x".to_string());
        assert_eq!(
            rule.matches(&request, AuthenticationLevel::Anonymous),
            RuleMatch::Miss
        );
    }

    #[test]
    fn query_pattern_operator() {
        let rule = compile(RuleConfig {
            query: vec![QueryPredicateConfig {
                key: "file".to_string(),
                operator: QueryOperator::Pattern,
                value: Some("^.*\\.pdf$".to_string()),
            }],
            policy: AccessPolicy::OneFactor,
            ..RuleConfig::default()
        });
        let mut request = fingerprint("app.example.com", "/download");
        request.query = Some("file=report.pdf".to_string());
        assert_eq!(
            rule.matches(&request, AuthenticationLevel::Anonymous),
            RuleMatch::Hit
        );
    }

    #[test]
    fn pattern_operator_requires_value() {
        let result = QueryPredicate::compile(&QueryPredicateConfig {
            key: "file".to_string(),
            operator: QueryOperator::Pattern,
            value: None,
        });
        assert!(result.is_err());
    }
}
