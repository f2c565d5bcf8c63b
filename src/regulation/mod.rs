//! Failed-attempt regulation.
//!
//! A sliding window over the authentication log, keyed by username. Once the
//! configured number of failures lands inside the window with no intervening
//! success, the user is banned for the configured duration. The ban check runs
//! before any verifier or user backend call, both to shield the backends and
//! to keep timing from leaking credential validity.
//!
//! Banned attempts are *not* logged as failures; otherwise retries during the
//! ban would extend it indefinitely.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::storage::{AttemptKind, AuthenticationLogRow, Repository, StorageResult};

const DEFAULT_MAX_RETRIES: usize = 3;
const DEFAULT_FIND_TIME_SECONDS: i64 = 120;
const DEFAULT_BAN_TIME_SECONDS: i64 = 300;

#[derive(Clone, Copy, Debug)]
pub struct RegulationConfig {
    max_retries: usize,
    find_time_seconds: i64,
    ban_time_seconds: i64,
}

impl Default for RegulationConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RegulationConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            find_time_seconds: DEFAULT_FIND_TIME_SECONDS,
            ban_time_seconds: DEFAULT_BAN_TIME_SECONDS,
        }
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_find_time_seconds(mut self, seconds: i64) -> Self {
        self.find_time_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_ban_time_seconds(mut self, seconds: i64) -> Self {
        self.ban_time_seconds = seconds;
        self
    }

    #[must_use]
    pub fn ban_time_seconds(&self) -> i64 {
        self.ban_time_seconds
    }
}

/// Verdict for a user about to attempt authentication.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Regulation {
    Allowed,
    Banned { until: DateTime<Utc> },
}

/// Pure window computation over log rows (newest first).
///
/// Failures older than the most recent success are ignored: a success breaks
/// the window. A ban triggers when `max_retries` consecutive failures land
/// inside `find_time`, and lasts `ban_time` from the oldest counted failure —
/// so it decays naturally as the burst ages out of the log.
#[must_use]
pub fn assess(
    rows: &[AuthenticationLogRow],
    config: &RegulationConfig,
    now: DateTime<Utc>,
) -> Regulation {
    if config.max_retries == 0 {
        return Regulation::Allowed;
    }

    let mut failures: Vec<DateTime<Utc>> = Vec::with_capacity(config.max_retries);
    for row in rows {
        if row.successful {
            break;
        }
        failures.push(row.time);
        if failures.len() >= config.max_retries {
            break;
        }
    }

    if failures.len() < config.max_retries {
        return Regulation::Allowed;
    }

    let newest = failures[0];
    let oldest_counted = failures[failures.len() - 1];
    if newest - oldest_counted >= Duration::seconds(config.find_time_seconds) {
        return Regulation::Allowed;
    }

    let until = oldest_counted + Duration::seconds(config.ban_time_seconds);
    if now < until {
        Regulation::Banned { until }
    } else {
        Regulation::Allowed
    }
}

/// One authentication attempt to record.
#[derive(Clone, Debug)]
pub struct Attempt {
    pub username: String,
    pub successful: bool,
    pub kind: AttemptKind,
    pub remote_ip: Option<String>,
    pub request_uri: String,
    pub request_method: String,
}

#[derive(Clone)]
pub struct Regulator {
    repository: Arc<dyn Repository>,
    config: RegulationConfig,
}

impl Regulator {
    #[must_use]
    pub fn new(repository: Arc<dyn Repository>, config: RegulationConfig) -> Self {
        Self { repository, config }
    }

    #[must_use]
    pub fn config(&self) -> &RegulationConfig {
        &self.config
    }

    /// Decide whether `username` may attempt authentication right now.
    ///
    /// # Errors
    /// Returns an error when the storage backend is unavailable.
    pub async fn check(&self, username: &str, now: DateTime<Utc>) -> StorageResult<Regulation> {
        let since = now - Duration::seconds(self.config.ban_time_seconds);
        let rows = self
            .repository
            .list_recent_authentications(username, since)
            .await?;
        let regulation = assess(&rows, &self.config, now);
        if let Regulation::Banned { until } = regulation {
            warn!(username, %until, "authentication attempt while banned");
        }
        Ok(regulation)
    }

    /// Append one authentication log row. Runs synchronously before the
    /// response so the next regulation check sees this attempt.
    ///
    /// # Errors
    /// Returns an error when the storage backend is unavailable.
    pub async fn mark(&self, attempt: &Attempt, now: DateTime<Utc>) -> StorageResult<()> {
        self.repository
            .insert_authentication_log(&AuthenticationLogRow {
                id: Uuid::new_v4(),
                time: now,
                successful: attempt.successful,
                username: attempt.username.clone(),
                kind: attempt.kind,
                remote_ip: attempt.remote_ip.clone(),
                request_uri: attempt.request_uri.clone(),
                request_method: attempt.request_method.clone(),
            })
            .await
    }
}
