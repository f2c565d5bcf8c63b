//! Pluggable user backends.
//!
//! The core only ever sees this interface; LDAP or other directories slot in
//! behind it. Credentials are never cached across requests — only the fetched
//! details may be cached, and only on the session record.

pub mod file;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Directory attributes for an authenticated user.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct UserDetails {
    pub username: String,
    pub display_name: String,
    pub emails: Vec<String>,
    pub groups: Vec<String>,
}

#[derive(Debug, Error)]
pub enum UserError {
    #[error("user not found")]
    NotFound,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("user backend unavailable: {0}")]
    Unavailable(String),
}

/// The capability set the pipeline consumes.
#[async_trait]
pub trait UserBackend: Send + Sync {
    /// Validate a password and return the user's details on success.
    async fn check_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<UserDetails, UserError>;

    async fn get_details(&self, username: &str) -> Result<UserDetails, UserError>;

    async fn update_password(&self, username: &str, new_password: &str) -> Result<(), UserError>;
}
