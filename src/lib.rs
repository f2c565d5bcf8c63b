//! # Gardi (Authentication & Authorization Authority)
//!
//! `gardi` sits behind a reverse proxy and decides, per request, whether the
//! request may reach the upstream. The proxy delegates each request to the
//! verification endpoint; `gardi` answers with an allow/deny/step-up verdict
//! derived from an ordered access-control rule list and the caller's session.
//!
//! ## Authentication levels
//!
//! Sessions move through an ordered ladder: `Anonymous < OneFactor <
//! TwoFactor`. The first factor is a username/password check against a
//! pluggable user backend; second factors are TOTP, WebAuthn, or a Duo push.
//! Every level transition rotates the session identifier, which doubles as
//! optimistic concurrency control: parallel requests holding the old
//! identifier downgrade to anonymous on their next load.
//!
//! ## Abuse protection
//!
//! A per-username regulator reads the authentication log and bans further
//! attempts once the configured number of failures lands inside the sliding
//! window. Banned users are rejected before any verifier or backend is
//! consulted.
//!
//! ## Self-service
//!
//! Password reset and device enrolment require *elevation*: a short-lived,
//! session-scoped capability granted by consuming a single-use
//! identity-verification token delivered out-of-band.

pub mod api;
pub mod authorization;
pub mod cli;
pub mod mfa;
pub mod notification;
pub mod regulation;
pub mod session;
pub mod storage;
pub mod users;
pub mod verification;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
