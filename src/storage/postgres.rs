//! Postgres repository.
//!
//! Queries are wrapped in `db.query` spans so traces show the statement and
//! operation. Session records travel as JSONB: the session layout evolves
//! faster than a column-per-field schema would tolerate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgPoolOptions};
use std::time::Duration;
use tracing::Instrument;
use uuid::Uuid;

use super::{
    AttemptKind, AuthenticationLogRow, IdentityTokenRecord, Repository, StorageError,
    StorageResult, TotpConfigurationRecord, WebauthnCredentialRecord,
};
use crate::session::SessionRecord;
use crate::verification::TokenPurpose;

pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    /// Connect with the pool settings used across the service.
    ///
    /// # Errors
    /// Returns an error when the database is unreachable.
    pub async fn connect(dsn: &str) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .max_lifetime(Duration::from_secs(60 * 2))
            .test_before_acquire(true)
            .connect(dsn)
            .await?;
        Ok(Self { pool })
    }

    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn query_span(operation: &'static str, statement: &str) -> tracing::Span {
    tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

fn decode_session(value: serde_json::Value) -> StorageResult<SessionRecord> {
    serde_json::from_value(value)
        .map_err(|err| StorageError(format!("malformed session record: {err}")))
}

#[async_trait]
impl Repository for PostgresRepository {
    async fn save_session(&self, key: &str, record: &SessionRecord) -> StorageResult<()> {
        let data = serde_json::to_value(record)
            .map_err(|err| StorageError(format!("failed to encode session record: {err}")))?;
        let query = r"
            INSERT INTO sessions (session_key, data, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (session_key) DO UPDATE
            SET data = EXCLUDED.data, expires_at = EXCLUDED.expires_at
        ";
        sqlx::query(query)
            .bind(key)
            .bind(data)
            .bind(record.expires_at)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await?;
        Ok(())
    }

    async fn load_session(&self, key: &str) -> StorageResult<Option<SessionRecord>> {
        let query = "SELECT data FROM sessions WHERE session_key = $1";
        let row = sqlx::query(query)
            .bind(key)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await?;
        row.map(|row| decode_session(row.get("data"))).transpose()
    }

    async fn delete_session(&self, key: &str) -> StorageResult<()> {
        // Destroy is idempotent; zero rows deleted is fine.
        let query = "DELETE FROM sessions WHERE session_key = $1";
        sqlx::query(query)
            .bind(key)
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await?;
        Ok(())
    }

    async fn insert_authentication_log(&self, row: &AuthenticationLogRow) -> StorageResult<()> {
        let query = r"
            INSERT INTO authentication_logs
                (id, time, successful, username, auth_type, remote_ip, request_uri, request_method)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ";
        sqlx::query(query)
            .bind(row.id)
            .bind(row.time)
            .bind(row.successful)
            .bind(&row.username)
            .bind(row.kind.as_str())
            .bind(row.remote_ip.as_deref())
            .bind(&row.request_uri)
            .bind(&row.request_method)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await?;
        Ok(())
    }

    async fn list_recent_authentications(
        &self,
        username: &str,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<AuthenticationLogRow>> {
        let query = r"
            SELECT id, time, successful, username, auth_type, remote_ip, request_uri, request_method
            FROM authentication_logs
            WHERE username = $1 AND time >= $2
            ORDER BY time DESC
        ";
        let rows = sqlx::query(query)
            .bind(username)
            .bind(since)
            .fetch_all(&self.pool)
            .instrument(query_span("SELECT", query))
            .await?;

        rows.into_iter()
            .map(|row| {
                let auth_type: String = row.get("auth_type");
                let kind = AttemptKind::parse(&auth_type)
                    .ok_or_else(|| StorageError(format!("unknown auth_type: {auth_type}")))?;
                Ok(AuthenticationLogRow {
                    id: row.get::<Uuid, _>("id"),
                    time: row.get("time"),
                    successful: row.get("successful"),
                    username: row.get("username"),
                    kind,
                    remote_ip: row.get("remote_ip"),
                    request_uri: row.get("request_uri"),
                    request_method: row.get("request_method"),
                })
            })
            .collect()
    }

    async fn load_totp_configuration(
        &self,
        username: &str,
    ) -> StorageResult<Option<TotpConfigurationRecord>> {
        let query = r"
            SELECT username, secret, period, digits, algorithm, last_step
            FROM totp_configurations
            WHERE username = $1
        ";
        let row = sqlx::query(query)
            .bind(username)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await?;
        Ok(row.map(|row| TotpConfigurationRecord {
            username: row.get("username"),
            secret_base32: row.get("secret"),
            period: row.get::<i32, _>("period").unsigned_abs(),
            digits: row.get::<i32, _>("digits").unsigned_abs(),
            algorithm: row.get("algorithm"),
            last_step: row.get("last_step"),
        }))
    }

    async fn save_totp_configuration(&self, record: &TotpConfigurationRecord) -> StorageResult<()> {
        let query = r"
            INSERT INTO totp_configurations (username, secret, period, digits, algorithm, last_step)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (username) DO UPDATE
            SET secret = EXCLUDED.secret,
                period = EXCLUDED.period,
                digits = EXCLUDED.digits,
                algorithm = EXCLUDED.algorithm,
                last_step = EXCLUDED.last_step
        ";
        sqlx::query(query)
            .bind(&record.username)
            .bind(&record.secret_base32)
            .bind(i32::try_from(record.period).unwrap_or(30))
            .bind(i32::try_from(record.digits).unwrap_or(6))
            .bind(&record.algorithm)
            .bind(record.last_step)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await?;
        Ok(())
    }

    async fn consume_totp_step(&self, username: &str, step: i64) -> StorageResult<bool> {
        // The guard in the WHERE clause makes the consume atomic: a concurrent
        // submit of the same step loses the race and updates zero rows.
        let query = r"
            UPDATE totp_configurations
            SET last_step = $2
            WHERE username = $1 AND (last_step IS NULL OR last_step < $2)
        ";
        let result = sqlx::query(query)
            .bind(username)
            .bind(step)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn load_webauthn_credentials(
        &self,
        username: &str,
    ) -> StorageResult<Vec<WebauthnCredentialRecord>> {
        let query = r"
            SELECT username, credential_id, credential, sign_count, description, created_at
            FROM webauthn_credentials
            WHERE username = $1
        ";
        let rows = sqlx::query(query)
            .bind(username)
            .fetch_all(&self.pool)
            .instrument(query_span("SELECT", query))
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| WebauthnCredentialRecord {
                username: row.get("username"),
                credential_id: row.get("credential_id"),
                credential: row.get("credential"),
                sign_count: row.get("sign_count"),
                description: row.get("description"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    async fn save_webauthn_credential(
        &self,
        record: &WebauthnCredentialRecord,
    ) -> StorageResult<()> {
        let query = r"
            INSERT INTO webauthn_credentials
                (username, credential_id, credential, sign_count, description, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (credential_id) DO UPDATE
            SET credential = EXCLUDED.credential,
                sign_count = EXCLUDED.sign_count,
                description = EXCLUDED.description
        ";
        sqlx::query(query)
            .bind(&record.username)
            .bind(&record.credential_id)
            .bind(&record.credential)
            .bind(record.sign_count)
            .bind(&record.description)
            .bind(record.created_at)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await?;
        Ok(())
    }

    async fn update_webauthn_credential_counter(
        &self,
        credential_id: &[u8],
        sign_count: i64,
    ) -> StorageResult<()> {
        let query = r"
            UPDATE webauthn_credentials
            SET sign_count = $2, last_used_at = NOW()
            WHERE credential_id = $1
        ";
        sqlx::query(query)
            .bind(credential_id)
            .bind(sign_count)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await?;
        Ok(())
    }

    async fn save_identity_token(&self, record: &IdentityTokenRecord) -> StorageResult<()> {
        let query = r"
            INSERT INTO identity_verification_tokens
                (token_hash, username, purpose, issued_at, expires_at)
            VALUES ($1, $2, $3, $4, $5)
        ";
        sqlx::query(query)
            .bind(&record.token_hash)
            .bind(&record.username)
            .bind(record.purpose.as_str())
            .bind(record.issued_at)
            .bind(record.expires_at)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await?;
        Ok(())
    }

    async fn consume_identity_token(
        &self,
        token_hash: &[u8],
        purpose: TokenPurpose,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<String>> {
        // Single-use enforcement lives in the WHERE clause; the second caller
        // sees consumed_at already set and gets no row back.
        let query = r"
            UPDATE identity_verification_tokens
            SET consumed_at = $3
            WHERE token_hash = $1
              AND purpose = $2
              AND consumed_at IS NULL
              AND expires_at > $3
            RETURNING username
        ";
        let row = sqlx::query(query)
            .bind(token_hash)
            .bind(purpose.as_str())
            .bind(now)
            .fetch_optional(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await?;
        Ok(row.map(|row| row.get("username")))
    }
}
