//! In-memory repository used by tests and single-node evaluation.
//!
//! A single mutex guards all tables; every operation completes without
//! awaiting while the lock is held, so the serialization guarantees match
//! the Postgres implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use super::{
    AuthenticationLogRow, IdentityTokenRecord, Repository, StorageResult,
    TotpConfigurationRecord, WebauthnCredentialRecord,
};
use crate::session::SessionRecord;
use crate::verification::TokenPurpose;

#[derive(Default)]
struct Tables {
    sessions: HashMap<String, SessionRecord>,
    authentication_log: Vec<AuthenticationLogRow>,
    totp: HashMap<String, TotpConfigurationRecord>,
    webauthn: Vec<WebauthnCredentialRecord>,
    identity_tokens: Vec<IdentityTokenRecord>,
}

#[derive(Default)]
pub struct MemoryRepository {
    tables: Mutex<Tables>,
}

impl MemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        // Lock poisoning only happens when a holder panicked; the data is
        // plain-old-data, so continuing with it is sound.
        self.tables.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn save_session(&self, key: &str, record: &SessionRecord) -> StorageResult<()> {
        self.lock().sessions.insert(key.to_string(), record.clone());
        Ok(())
    }

    async fn load_session(&self, key: &str) -> StorageResult<Option<SessionRecord>> {
        Ok(self.lock().sessions.get(key).cloned())
    }

    async fn delete_session(&self, key: &str) -> StorageResult<()> {
        self.lock().sessions.remove(key);
        Ok(())
    }

    async fn insert_authentication_log(&self, row: &AuthenticationLogRow) -> StorageResult<()> {
        self.lock().authentication_log.push(row.clone());
        Ok(())
    }

    async fn list_recent_authentications(
        &self,
        username: &str,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<AuthenticationLogRow>> {
        let mut rows: Vec<AuthenticationLogRow> = self
            .lock()
            .authentication_log
            .iter()
            .filter(|row| row.username == username && row.time >= since)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.time.cmp(&a.time));
        Ok(rows)
    }

    async fn load_totp_configuration(
        &self,
        username: &str,
    ) -> StorageResult<Option<TotpConfigurationRecord>> {
        Ok(self.lock().totp.get(username).cloned())
    }

    async fn save_totp_configuration(&self, record: &TotpConfigurationRecord) -> StorageResult<()> {
        self.lock()
            .totp
            .insert(record.username.clone(), record.clone());
        Ok(())
    }

    async fn consume_totp_step(&self, username: &str, step: i64) -> StorageResult<bool> {
        let mut tables = self.lock();
        let Some(record) = tables.totp.get_mut(username) else {
            return Ok(false);
        };
        if record.last_step.is_some_and(|last| step <= last) {
            return Ok(false);
        }
        record.last_step = Some(step);
        Ok(true)
    }

    async fn load_webauthn_credentials(
        &self,
        username: &str,
    ) -> StorageResult<Vec<WebauthnCredentialRecord>> {
        Ok(self
            .lock()
            .webauthn
            .iter()
            .filter(|credential| credential.username == username)
            .cloned()
            .collect())
    }

    async fn save_webauthn_credential(
        &self,
        record: &WebauthnCredentialRecord,
    ) -> StorageResult<()> {
        let mut tables = self.lock();
        if let Some(existing) = tables
            .webauthn
            .iter_mut()
            .find(|candidate| candidate.credential_id == record.credential_id)
        {
            *existing = record.clone();
        } else {
            tables.webauthn.push(record.clone());
        }
        Ok(())
    }

    async fn update_webauthn_credential_counter(
        &self,
        credential_id: &[u8],
        sign_count: i64,
    ) -> StorageResult<()> {
        let mut tables = self.lock();
        if let Some(credential) = tables
            .webauthn
            .iter_mut()
            .find(|candidate| candidate.credential_id == credential_id)
        {
            credential.sign_count = sign_count;
        }
        Ok(())
    }

    async fn save_identity_token(&self, record: &IdentityTokenRecord) -> StorageResult<()> {
        self.lock().identity_tokens.push(record.clone());
        Ok(())
    }

    async fn consume_identity_token(
        &self,
        token_hash: &[u8],
        purpose: TokenPurpose,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<String>> {
        let mut tables = self.lock();
        let Some(token) = tables
            .identity_tokens
            .iter_mut()
            .find(|candidate| candidate.token_hash == token_hash)
        else {
            return Ok(None);
        };
        if token.purpose != purpose || token.consumed_at.is_some() || token.expires_at <= now {
            return Ok(None);
        }
        token.consumed_at = Some(now);
        Ok(Some(token.username.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::AttemptKind;
    use chrono::Duration;
    use uuid::Uuid;

    fn log_row(username: &str, time: DateTime<Utc>, successful: bool) -> AuthenticationLogRow {
        AuthenticationLogRow {
            id: Uuid::new_v4(),
            time,
            successful,
            username: username.to_string(),
            kind: AttemptKind::OneFactor,
            remote_ip: Some("203.0.113.1".to_string()),
            request_uri: "https://app.example.com/".to_string(),
            request_method: "POST".to_string(),
        }
    }

    #[tokio::test]
    async fn recent_authentications_filter_and_sort() {
        let repository = MemoryRepository::new();
        let now = Utc::now();
        for minutes in [10, 5, 1] {
            repository
                .insert_authentication_log(&log_row("bob", now - Duration::minutes(minutes), false))
                .await
                .expect("insert");
        }
        repository
            .insert_authentication_log(&log_row("alice", now, false))
            .await
            .expect("insert");

        let rows = repository
            .list_recent_authentications("bob", now - Duration::minutes(6))
            .await
            .expect("list");
        assert_eq!(rows.len(), 2);
        assert!(rows[0].time > rows[1].time, "rows must be newest first");
        assert!(rows.iter().all(|row| row.username == "bob"));
    }

    #[tokio::test]
    async fn totp_step_is_consumed_once() {
        let repository = MemoryRepository::new();
        repository
            .save_totp_configuration(&TotpConfigurationRecord {
                username: "alice".to_string(),
                secret_base32: "JBSWY3DPEHPK3PXP".to_string(),
                period: 30,
                digits: 6,
                algorithm: "SHA1".to_string(),
                last_step: None,
            })
            .await
            .expect("save");

        assert!(repository.consume_totp_step("alice", 100).await.expect("first"));
        assert!(!repository.consume_totp_step("alice", 100).await.expect("replay"));
        // An earlier step is also burned once a later one was accepted.
        assert!(!repository.consume_totp_step("alice", 99).await.expect("previous"));
        assert!(repository.consume_totp_step("alice", 101).await.expect("next"));
    }

    #[tokio::test]
    async fn totp_step_without_enrolment_fails() {
        let repository = MemoryRepository::new();
        assert!(!repository.consume_totp_step("ghost", 1).await.expect("consume"));
    }

    #[tokio::test]
    async fn identity_token_single_use_and_purpose_bound() {
        let repository = MemoryRepository::new();
        let now = Utc::now();
        let hash = vec![7u8; 32];
        repository
            .save_identity_token(&IdentityTokenRecord {
                token_hash: hash.clone(),
                username: "alice".to_string(),
                purpose: TokenPurpose::ResetPassword,
                issued_at: now,
                expires_at: now + Duration::minutes(5),
                consumed_at: None,
            })
            .await
            .expect("save");

        // Wrong purpose fails closed without consuming.
        assert_eq!(
            repository
                .consume_identity_token(&hash, TokenPurpose::RegisterDevice, now)
                .await
                .expect("wrong purpose"),
            None
        );
        assert_eq!(
            repository
                .consume_identity_token(&hash, TokenPurpose::ResetPassword, now)
                .await
                .expect("consume"),
            Some("alice".to_string())
        );
        assert_eq!(
            repository
                .consume_identity_token(&hash, TokenPurpose::ResetPassword, now)
                .await
                .expect("replay"),
            None
        );
    }

    #[tokio::test]
    async fn expired_identity_token_fails_closed() {
        let repository = MemoryRepository::new();
        let now = Utc::now();
        let hash = vec![9u8; 32];
        repository
            .save_identity_token(&IdentityTokenRecord {
                token_hash: hash.clone(),
                username: "alice".to_string(),
                purpose: TokenPurpose::ResetPassword,
                issued_at: now - Duration::minutes(10),
                expires_at: now - Duration::minutes(1),
                consumed_at: None,
            })
            .await
            .expect("save");
        assert_eq!(
            repository
                .consume_identity_token(&hash, TokenPurpose::ResetPassword, now)
                .await
                .expect("consume"),
            None
        );
    }

    #[tokio::test]
    async fn webauthn_counter_update() {
        let repository = MemoryRepository::new();
        let record = WebauthnCredentialRecord {
            username: "alice".to_string(),
            credential_id: vec![1, 2, 3],
            credential: serde_json::json!({"stub": true}),
            sign_count: 1,
            description: "yubikey".to_string(),
            created_at: Utc::now(),
        };
        repository.save_webauthn_credential(&record).await.expect("save");
        repository
            .update_webauthn_credential_counter(&[1, 2, 3], 7)
            .await
            .expect("update");
        let credentials = repository
            .load_webauthn_credentials("alice")
            .await
            .expect("load");
        assert_eq!(credentials.len(), 1);
        assert_eq!(credentials[0].sign_count, 7);
    }
}
