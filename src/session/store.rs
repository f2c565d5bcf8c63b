//! Cookie-indexed session persistence with HMAC integrity.
//!
//! The cookie value is `<identifier>.<signature>`: an opaque 256-bit random
//! identifier plus an HMAC-SHA256 over it. Only a digest of the identifier is
//! used as the storage key, so raw identifiers never touch the backend.
//! Identifier rotation on level transitions doubles as optimistic concurrency
//! control: a parallel request holding the old identifier downgrades to
//! anonymous on its next load.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::warn;

use super::record::SessionRecord;
use crate::storage::{Repository, StorageError};

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_COOKIE_NAME: &str = "gardi_session";
const DEFAULT_INACTIVITY_SECONDS: i64 = 5 * 60;
const DEFAULT_EXPIRATION_SECONDS: i64 = 60 * 60;
const DEFAULT_REMEMBER_ME_SECONDS: i64 = 30 * 24 * 60 * 60;
const DEFAULT_ELEVATION_TTL_SECONDS: i64 = 10 * 60;

#[derive(Clone, Debug)]
pub struct SessionConfig {
    cookie_name: String,
    cookie_domain: String,
    secret: SecretString,
    cookie_secure: bool,
    inactivity_seconds: i64,
    expiration_seconds: i64,
    remember_me_seconds: i64,
    remember_me_skips_inactivity: bool,
    elevation_ttl_seconds: i64,
}

impl SessionConfig {
    #[must_use]
    pub fn new(cookie_domain: String, secret: SecretString) -> Self {
        Self {
            cookie_name: DEFAULT_COOKIE_NAME.to_string(),
            cookie_domain,
            secret,
            cookie_secure: true,
            inactivity_seconds: DEFAULT_INACTIVITY_SECONDS,
            expiration_seconds: DEFAULT_EXPIRATION_SECONDS,
            remember_me_seconds: DEFAULT_REMEMBER_ME_SECONDS,
            remember_me_skips_inactivity: false,
            elevation_ttl_seconds: DEFAULT_ELEVATION_TTL_SECONDS,
        }
    }

    #[must_use]
    pub fn with_cookie_name(mut self, name: String) -> Self {
        self.cookie_name = name;
        self
    }

    #[must_use]
    pub fn with_cookie_secure(mut self, secure: bool) -> Self {
        self.cookie_secure = secure;
        self
    }

    #[must_use]
    pub fn with_inactivity_seconds(mut self, seconds: i64) -> Self {
        self.inactivity_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_expiration_seconds(mut self, seconds: i64) -> Self {
        self.expiration_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_remember_me_seconds(mut self, seconds: i64) -> Self {
        self.remember_me_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_remember_me_skips_inactivity(mut self, skips: bool) -> Self {
        self.remember_me_skips_inactivity = skips;
        self
    }

    #[must_use]
    pub fn with_elevation_ttl_seconds(mut self, seconds: i64) -> Self {
        self.elevation_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    #[must_use]
    pub fn cookie_domain(&self) -> &str {
        &self.cookie_domain
    }

    #[must_use]
    pub fn elevation_ttl_seconds(&self) -> i64 {
        self.elevation_ttl_seconds
    }

    #[must_use]
    pub fn expiration_seconds(&self) -> i64 {
        self.expiration_seconds
    }

    #[must_use]
    pub fn remember_me_seconds(&self) -> i64 {
        self.remember_me_seconds
    }
}

/// Result of resolving an incoming cookie.
#[derive(Debug)]
pub struct LoadedSession {
    /// Identifier backing the record, when one is persisted.
    pub id: Option<String>,
    pub record: SessionRecord,
    /// Signature or decode failure: the response must clear the cookie.
    pub tampered: bool,
}

#[derive(Clone)]
pub struct SessionStore {
    repository: Arc<dyn Repository>,
    config: SessionConfig,
}

impl SessionStore {
    #[must_use]
    pub fn new(repository: Arc<dyn Repository>, config: SessionConfig) -> Self {
        Self { repository, config }
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Resolve a cookie value to a session.
    ///
    /// Tampered cookies and unknown or expired identifiers all resolve to an
    /// anonymous record; only backend failures surface as errors. No storage
    /// lookup happens for a cookie that fails signature validation.
    ///
    /// # Errors
    /// Returns an error when the storage backend is unavailable.
    pub async fn load(
        &self,
        cookie: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<LoadedSession, StorageError> {
        let Some(cookie) = cookie else {
            return Ok(self.anonymous(now));
        };

        let Some(id) = self.verify_cookie(cookie) else {
            warn!("session cookie failed integrity validation");
            let mut loaded = self.anonymous(now);
            loaded.tampered = true;
            return Ok(loaded);
        };

        let key = storage_key(&id);
        let Some(mut record) = self.repository.load_session(&key).await? else {
            return Ok(self.anonymous(now));
        };

        if self.is_expired(&record, now) {
            self.repository.delete_session(&key).await?;
            return Ok(self.anonymous(now));
        }

        // Record activity; the absolute expiry is never extended.
        record.last_activity_at = now;
        self.repository.save_session(&key, &record).await?;

        Ok(LoadedSession {
            id: Some(id),
            record,
            tampered: false,
        })
    }

    /// Persist `record` under a fresh identifier, invalidating `old_id`.
    ///
    /// Called on every authentication level transition and on elevation
    /// changes. Returns the new identifier.
    ///
    /// # Errors
    /// Returns an error when the storage backend is unavailable.
    pub async fn regenerate(
        &self,
        old_id: Option<&str>,
        record: &mut SessionRecord,
        now: DateTime<Utc>,
    ) -> Result<String, StorageError> {
        record.csrf_token = generate_token();
        record.expires_at = now + Duration::seconds(if record.remember_me {
            self.config.remember_me_seconds
        } else {
            self.config.expiration_seconds
        });
        record.last_activity_at = now;

        let id = generate_token();
        self.repository.save_session(&storage_key(&id), record).await?;
        if let Some(old_id) = old_id {
            self.repository.delete_session(&storage_key(old_id)).await?;
        }
        Ok(id)
    }

    /// Persist in place, without rotation. For mutations that do not change
    /// the authentication level (pending challenges, redirect target).
    ///
    /// # Errors
    /// Returns an error when the storage backend is unavailable.
    pub async fn save(&self, id: &str, record: &SessionRecord) -> Result<(), StorageError> {
        self.repository.save_session(&storage_key(id), record).await
    }

    /// # Errors
    /// Returns an error when the storage backend is unavailable.
    pub async fn destroy(&self, id: &str) -> Result<(), StorageError> {
        self.repository.delete_session(&storage_key(id)).await
    }

    /// Fresh anonymous record with a new CSRF token.
    #[must_use]
    pub fn anonymous(&self, now: DateTime<Utc>) -> LoadedSession {
        let expires_at = now + Duration::seconds(self.config.expiration_seconds);
        LoadedSession {
            id: None,
            record: SessionRecord::anonymous(now, expires_at, generate_token()),
            tampered: false,
        }
    }

    /// `Set-Cookie` value carrying the signed identifier.
    #[must_use]
    pub fn cookie(&self, id: &str, remember_me: bool) -> String {
        let value = format!("{id}.{}", self.sign(id));
        let mut cookie = format!(
            "{}={value}; Path=/; Domain={}; HttpOnly; SameSite=Lax",
            self.config.cookie_name, self.config.cookie_domain
        );
        if remember_me {
            cookie.push_str(&format!("; Max-Age={}", self.config.remember_me_seconds));
        }
        if self.config.cookie_secure {
            cookie.push_str("; Secure");
        }
        cookie
    }

    /// `Set-Cookie` value that removes the session cookie.
    #[must_use]
    pub fn clear_cookie(&self) -> String {
        let mut cookie = format!(
            "{}=; Path=/; Domain={}; HttpOnly; SameSite=Lax; Max-Age=0",
            self.config.cookie_name, self.config.cookie_domain
        );
        if self.config.cookie_secure {
            cookie.push_str("; Secure");
        }
        cookie
    }

    fn is_expired(&self, record: &SessionRecord, now: DateTime<Utc>) -> bool {
        if now >= record.expires_at {
            return true;
        }
        if record.remember_me && self.config.remember_me_skips_inactivity {
            return false;
        }
        now >= record.last_activity_at + Duration::seconds(self.config.inactivity_seconds)
    }

    fn sign(&self, id: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.config.secret.expose_secret().as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(id.as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }

    /// Split and authenticate a cookie value; `None` on any mismatch.
    fn verify_cookie(&self, cookie: &str) -> Option<String> {
        let (id, signature) = cookie.rsplit_once('.')?;
        if id.is_empty() {
            return None;
        }
        let signature = URL_SAFE_NO_PAD.decode(signature.as_bytes()).ok()?;
        let mut mac = HmacSha256::new_from_slice(self.config.secret.expose_secret().as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(id.as_bytes());
        mac.verify_slice(&signature).ok()?;
        Some(id.to_string())
    }
}

/// 256-bit random identifier, URL-safe encoded.
fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Digest of the identifier used as the storage key; raw identifiers never
/// reach the backend.
fn storage_key(id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::UserProfile;
    use crate::storage::memory::MemoryRepository;

    fn store() -> SessionStore {
        let config = SessionConfig::new(
            "example.com".to_string(),
            SecretString::new("0123456789abcdef0123456789abcdef".to_string()),
        )
        .with_inactivity_seconds(300)
        .with_expiration_seconds(3600);
        SessionStore::new(Arc::new(MemoryRepository::new()), config)
    }

    fn profile() -> UserProfile {
        UserProfile {
            username: "alice".to_string(),
            display_name: "Alice Doe".to_string(),
            emails: vec!["alice@example.com".to_string()],
            groups: vec!["dev".to_string()],
        }
    }

    fn signed_cookie(store: &SessionStore, id: &str) -> String {
        format!("{id}.{}", store.sign(id))
    }

    #[tokio::test]
    async fn missing_cookie_is_anonymous() {
        let store = store();
        let loaded = store.load(None, Utc::now()).await.expect("load");
        assert!(loaded.id.is_none());
        assert!(!loaded.tampered);
        assert!(loaded.record.profile.is_none());
    }

    #[tokio::test]
    async fn tampered_cookie_is_anonymous_and_flagged() {
        let store = store();
        let cookie = format!("forged-id.{}", URL_SAFE_NO_PAD.encode([0u8; 32]));
        let loaded = store.load(Some(&cookie), Utc::now()).await.expect("load");
        assert!(loaded.tampered);
        assert!(loaded.id.is_none());
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let store = store();
        let now = Utc::now();
        let mut anonymous = store.anonymous(now);
        anonymous.record.promote_one_factor(profile(), now);

        let id = store
            .regenerate(None, &mut anonymous.record, now)
            .await
            .expect("regenerate");
        let loaded = store
            .load(Some(&signed_cookie(&store, &id)), now)
            .await
            .expect("load");
        assert_eq!(loaded.id.as_deref(), Some(id.as_str()));
        assert_eq!(loaded.record.username(), Some("alice"));
    }

    #[tokio::test]
    async fn regenerate_invalidates_the_old_identifier() {
        let store = store();
        let now = Utc::now();
        let mut record = store.anonymous(now).record;
        record.promote_one_factor(profile(), now);

        let first = store.regenerate(None, &mut record, now).await.expect("first");
        record.promote_two_factor(now);
        let second = store
            .regenerate(Some(&first), &mut record, now)
            .await
            .expect("second");
        assert_ne!(first, second);

        let stale = store
            .load(Some(&signed_cookie(&store, &first)), now)
            .await
            .expect("load stale");
        assert!(stale.id.is_none(), "old identifier must resolve to anonymous");

        let fresh = store
            .load(Some(&signed_cookie(&store, &second)), now)
            .await
            .expect("load fresh");
        assert_eq!(fresh.record.level, crate::authorization::AuthenticationLevel::TwoFactor);
    }

    #[tokio::test]
    async fn regeneration_rotates_the_csrf_token() {
        let store = store();
        let now = Utc::now();
        let mut record = store.anonymous(now).record;
        let before = record.csrf_token.clone();
        record.promote_one_factor(profile(), now);
        store.regenerate(None, &mut record, now).await.expect("regenerate");
        assert_ne!(record.csrf_token, before);
    }

    #[tokio::test]
    async fn idle_timeout_destroys_the_session() {
        let store = store();
        let now = Utc::now();
        let mut record = store.anonymous(now).record;
        record.promote_one_factor(profile(), now);
        let id = store.regenerate(None, &mut record, now).await.expect("regenerate");

        let later = now + Duration::seconds(301);
        let loaded = store
            .load(Some(&signed_cookie(&store, &id)), later)
            .await
            .expect("load");
        assert!(loaded.id.is_none(), "idle session must be destroyed");

        // The destroy is persistent: a retry inside the window still misses.
        let retry = store
            .load(Some(&signed_cookie(&store, &id)), now + Duration::seconds(10))
            .await
            .expect("retry");
        assert!(retry.id.is_none());
    }

    #[tokio::test]
    async fn absolute_expiry_is_not_extended_by_activity() {
        // Idle timeout longer than the absolute lifetime, so only the
        // absolute expiry is in play here.
        let config = SessionConfig::new(
            "example.com".to_string(),
            SecretString::new("0123456789abcdef0123456789abcdef".to_string()),
        )
        .with_inactivity_seconds(7200)
        .with_expiration_seconds(3600);
        let store = SessionStore::new(Arc::new(MemoryRepository::new()), config);

        let now = Utc::now();
        let mut record = store.anonymous(now).record;
        record.promote_one_factor(profile(), now);
        let id = store.regenerate(None, &mut record, now).await.expect("regenerate");
        let expires_at = record.expires_at;

        // Activity just before expiry refreshes last_activity_at only.
        let almost = expires_at - Duration::seconds(1);
        let loaded = store
            .load(Some(&signed_cookie(&store, &id)), almost)
            .await
            .expect("load");
        assert_eq!(loaded.record.expires_at, expires_at);

        let after = expires_at + Duration::seconds(1);
        let expired = store
            .load(Some(&signed_cookie(&store, &id)), after)
            .await
            .expect("load expired");
        assert!(expired.id.is_none());
    }

    #[tokio::test]
    async fn remember_me_extends_absolute_expiry() {
        let store = store();
        let now = Utc::now();
        let mut record = store.anonymous(now).record;
        record.remember_me = true;
        record.promote_one_factor(profile(), now);
        store.regenerate(None, &mut record, now).await.expect("regenerate");
        assert_eq!(
            record.expires_at,
            now + Duration::seconds(store.config().remember_me_seconds())
        );
    }

    #[test]
    fn cookie_attributes() {
        let store = store();
        let cookie = store.cookie("abc", false);
        assert!(cookie.starts_with("gardi_session=abc."));
        assert!(cookie.contains("Domain=example.com"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("Secure"));
        assert!(!cookie.contains("Max-Age"));

        let remembered = store.cookie("abc", true);
        assert!(remembered.contains("Max-Age="));

        let cleared = store.clear_cookie();
        assert!(cleared.contains("Max-Age=0"));
    }

    #[test]
    fn verify_cookie_rejects_garbage() {
        let store = store();
        assert!(store.verify_cookie("no-signature").is_none());
        assert!(store.verify_cookie(".sig-without-id").is_none());
        let valid = signed_cookie(&store, "some-id");
        assert_eq!(store.verify_cookie(&valid).as_deref(), Some("some-id"));
        // Signature over a different identifier must not validate.
        let swapped = format!("other-id.{}", store.sign("some-id"));
        assert!(store.verify_cookie(&swapped).is_none());
    }
}
