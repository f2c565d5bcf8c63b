//! YAML-file user backend.
//!
//! Suitable for small deployments and tests. Password digests are PHC-format
//! Argon2id strings; verification happens here, inside the backend, so the
//! pipeline never touches hashing primitives.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::password_hash::rand_core::OsRng;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::info;

use super::{UserBackend, UserDetails, UserError};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileUser {
    pub displayname: String,
    /// PHC-format digest, e.g. `$argon2id$v=19$...`.
    pub password: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileUsersDocument {
    pub users: BTreeMap<String, FileUser>,
}

#[derive(Debug)]
pub struct FileUserBackend {
    path: Option<PathBuf>,
    users: RwLock<FileUsersDocument>,
}

impl FileUserBackend {
    /// Load the user database from a YAML file.
    ///
    /// # Errors
    /// Returns `Unavailable` when the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, UserError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| UserError::Unavailable(format!("failed to read users file: {err}")))?;
        let document: FileUsersDocument = serde_yaml::from_str(&raw)
            .map_err(|err| UserError::Unavailable(format!("failed to parse users file: {err}")))?;
        info!(path = %path.display(), users = document.users.len(), "users file loaded");
        Ok(Self {
            path: Some(path.to_path_buf()),
            users: RwLock::new(document),
        })
    }

    /// Build from an in-memory document; password updates are not persisted.
    #[must_use]
    pub fn from_document(document: FileUsersDocument) -> Self {
        Self {
            path: None,
            users: RwLock::new(document),
        }
    }

    fn details(username: &str, user: &FileUser) -> UserDetails {
        UserDetails {
            username: username.to_string(),
            display_name: user.displayname.clone(),
            emails: user.email.iter().cloned().collect(),
            groups: user.groups.clone(),
        }
    }

    fn persist(&self, document: &FileUsersDocument) -> Result<(), UserError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let raw = serde_yaml::to_string(document)
            .map_err(|err| UserError::Unavailable(format!("failed to encode users file: {err}")))?;
        std::fs::write(path, raw)
            .map_err(|err| UserError::Unavailable(format!("failed to write users file: {err}")))
    }
}

#[async_trait]
impl UserBackend for FileUserBackend {
    async fn check_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<UserDetails, UserError> {
        let users = self.users.read().await;
        let user = users.users.get(username).ok_or(UserError::NotFound)?;
        let parsed = PasswordHash::new(&user.password)
            .map_err(|err| UserError::Unavailable(format!("malformed password digest: {err}")))?;
        argon2::Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .map_err(|_| UserError::InvalidCredentials)?;
        Ok(Self::details(username, user))
    }

    async fn get_details(&self, username: &str) -> Result<UserDetails, UserError> {
        let users = self.users.read().await;
        users
            .users
            .get(username)
            .map(|user| Self::details(username, user))
            .ok_or(UserError::NotFound)
    }

    async fn update_password(&self, username: &str, new_password: &str) -> Result<(), UserError> {
        let mut users = self.users.write().await;
        if !users.users.contains_key(username) {
            return Err(UserError::NotFound);
        }
        let salt = SaltString::generate(&mut OsRng);
        let digest = argon2::Argon2::default()
            .hash_password(new_password.as_bytes(), &salt)
            .map_err(|err| UserError::Unavailable(format!("failed to hash password: {err}")))?
            .to_string();
        if let Some(user) = users.users.get_mut(username) {
            user.password = digest;
        }
        self.persist(&users)?;
        info!(username, "password updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document_with(username: &str, password: &str) -> FileUsersDocument {
        let salt = SaltString::generate(&mut OsRng);
        let digest = argon2::Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .expect("hash")
            .to_string();
        let mut users = BTreeMap::new();
        users.insert(
            username.to_string(),
            FileUser {
                displayname: "Alice Doe".to_string(),
                password: digest,
                email: Some("alice@example.com".to_string()),
                groups: vec!["dev".to_string(), "admins".to_string()],
            },
        );
        FileUsersDocument { users }
    }

    #[tokio::test]
    async fn valid_credentials_return_details() {
        let backend = FileUserBackend::from_document(document_with("alice", "hunter2"));
        let details = backend
            .check_credentials("alice", "hunter2")
            .await
            .expect("check");
        assert_eq!(details.username, "alice");
        assert_eq!(details.display_name, "Alice Doe");
        assert_eq!(details.emails, vec!["alice@example.com".to_string()]);
        assert_eq!(details.groups.len(), 2);
    }

    #[tokio::test]
    async fn wrong_password_is_invalid_credentials() {
        let backend = FileUserBackend::from_document(document_with("alice", "hunter2"));
        let err = backend
            .check_credentials("alice", "wrong")
            .await
            .expect_err("must fail");
        assert!(matches!(err, UserError::InvalidCredentials));
    }

    #[tokio::test]
    async fn unknown_user_is_not_found() {
        let backend = FileUserBackend::from_document(document_with("alice", "hunter2"));
        let err = backend
            .check_credentials("bob", "hunter2")
            .await
            .expect_err("must fail");
        assert!(matches!(err, UserError::NotFound));
        let err = backend.get_details("bob").await.expect_err("must fail");
        assert!(matches!(err, UserError::NotFound));
    }

    #[tokio::test]
    async fn update_password_takes_effect() {
        let backend = FileUserBackend::from_document(document_with("alice", "hunter2"));
        backend
            .update_password("alice", "correct horse battery staple")
            .await
            .expect("update");
        assert!(backend.check_credentials("alice", "hunter2").await.is_err());
        assert!(
            backend
                .check_credentials("alice", "correct horse battery staple")
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn load_and_persist_round_trip() {
        let path = std::env::temp_dir().join(format!("gardi-users-{}.yml", uuid::Uuid::new_v4()));
        let document = document_with("alice", "hunter2");
        std::fs::write(&path, serde_yaml::to_string(&document).expect("encode")).expect("write");

        let backend = FileUserBackend::load(&path).expect("load");
        backend.update_password("alice", "new-password").await.expect("update");

        // A fresh load sees the persisted digest.
        let reloaded = FileUserBackend::load(&path).expect("reload");
        assert!(reloaded.check_credentials("alice", "new-password").await.is_ok());

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn malformed_file_is_unavailable() {
        let path = std::env::temp_dir().join(format!("gardi-users-{}.yml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "users: [not, a, map]").expect("write");
        let err = FileUserBackend::load(&path).expect_err("must fail");
        assert!(matches!(err, UserError::Unavailable(_)));
        std::fs::remove_file(&path).ok();
    }
}
