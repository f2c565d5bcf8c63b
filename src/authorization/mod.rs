//! Access-control policy: compiled rule sets and the pure evaluator.
//!
//! The rule list is declared in YAML, compiled once at startup, and shared
//! read-only across requests. Evaluation is a pure function over the compiled
//! set and a request fingerprint; it performs no I/O and holds no state, so a
//! configuration reload is modelled as build-new-and-swap.

mod evaluator;
mod fingerprint;
mod level;
mod rule;

pub use evaluator::{AccessControl, Judgment};
pub use fingerprint::{RequestFingerprint, Subject};
pub use level::{AccessPolicy, AuthenticationLevel};
pub use rule::{
    AccessControlConfig, AccessRule, DomainPattern, NetworkGroupConfig, QueryOperator,
    QueryPredicate, QueryPredicateConfig, RuleConfig, SubjectPredicate,
};
