//! SessionManager - the single process-wide vault session.
//!
//! The session moves through three states:
//! - no session (`NotAuthenticated`)
//! - identity only (`Locked`): after a restart the persisted record restores
//!   who is logged in, but no secrets
//! - identity + secrets (`Unlocked`): the master password is cached and the
//!   vault key is derived from it on first use
//!
//! Secrets live behind an `Arc` that is swapped out wholesale on lock, so a
//! reader either sees the full set or nothing.

use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::auth::AuthLedger;
use crate::clock::{Clock, SystemClock};
use crate::error::{AppError, Result};
use crate::security::{
    decrypt_field, derive_vault_key, device_fingerprint, generate_salt, hash_password,
    verify_password, KdfParams, VaultKey,
};
use crate::storage::{AppSettings, AppStore, NewUser, PersistedSessionRecord, User, VaultStore};

/// Minimum master password length accepted at signup.
pub const MIN_PASSWORD_LEN: usize = 8;
/// Maximum username length accepted at signup.
pub const MAX_USERNAME_LEN: usize = 64;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    pub user_id: i64,
    pub username: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginOutcome {
    pub session_id: String,
    pub user: UserIdentity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum VaultStatus {
    NotAuthenticated,
    Locked,
    Unlocked,
}

/// Tunables taken from [`AppSettings`].
///
/// `kdf` and `hash_iterations` only apply to accounts created from now on;
/// existing users keep the costs recorded on their row.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub kdf: KdfParams,
    pub hash_iterations: u32,
    pub session_ttl: Duration,
}

impl From<&AppSettings> for SessionConfig {
    fn from(settings: &AppSettings) -> Self {
        Self {
            kdf: settings.kdf,
            hash_iterations: settings.password_hash_iterations,
            session_ttl: Duration::days(settings.session_ttl_days),
        }
    }
}

/// Master password plus the lazily derived vault key.
struct VaultSecrets {
    master_password: Zeroizing<String>,
    key: OnceCell<VaultKey>,
}

struct ActiveSession {
    session_id: String,
    user_id: i64,
    username: String,
    salt: Vec<u8>,
    kdf: KdfParams,
    secrets: Option<Arc<VaultSecrets>>,
}

impl ActiveSession {
    fn identity(&self) -> UserIdentity {
        UserIdentity {
            user_id: self.user_id,
            username: self.username.clone(),
        }
    }
}

pub struct SessionManager {
    store: Arc<dyn VaultStore>,
    app_store: Arc<AppStore>,
    ledger: Arc<AuthLedger>,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
    fingerprint: String,
    active: RwLock<Option<ActiveSession>>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn VaultStore>,
        app_store: Arc<AppStore>,
        ledger: Arc<AuthLedger>,
        config: SessionConfig,
    ) -> Self {
        Self {
            store,
            app_store,
            ledger,
            clock: Arc::new(SystemClock),
            config,
            fingerprint: device_fingerprint(),
            active: RwLock::new(None),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Override the device fingerprint (used to simulate another machine).
    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = fingerprint.into();
        self
    }

    pub fn store(&self) -> &Arc<dyn VaultStore> {
        &self.store
    }

    /// Create an account. Only the salted hash is stored.
    pub async fn signup(&self, username: &str, password: &str) -> Result<i64> {
        let username = username.trim();
        if username.is_empty() || username.len() > MAX_USERNAME_LEN {
            return Err(AppError::InvalidInput(format!(
                "username must be 1-{} characters",
                MAX_USERNAME_LEN
            )));
        }
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AppError::InvalidInput(format!(
                "password must be at least {} characters",
                MIN_PASSWORD_LEN
            )));
        }
        if self.store.get_user_by_username(username)?.is_some() {
            return Err(AppError::UsernameTaken);
        }

        let salt = generate_salt();
        let hash = self.hash_off_thread(password, salt.to_vec()).await?;
        let user = self.store.create_user(NewUser {
            username: username.to_string(),
            password_hash: hash,
            password_salt: hex::encode(salt),
            kdf: self.config.kdf,
            hash_iterations: self.config.hash_iterations,
        })?;

        info!("Created user {} (id {})", user.username, user.id);
        Ok(user.id)
    }

    /// Authenticate and open a session with the master password cached.
    ///
    /// The rate limiter is consulted before any hashing happens.
    pub async fn login(&self, username: &str, password: &str) -> Result<LoginOutcome> {
        let username = username.trim();
        self.ledger.ensure_allowed(username)?;

        let user = match self.store.get_user_by_username(username)? {
            Some(user) => user,
            None => return Err(self.login_failed(username)),
        };

        if !self.verify_off_thread(&user, password).await? {
            return Err(self.login_failed(username));
        }
        self.ledger.record_success(username);

        let salt = decode_salt(&user)?;
        let session_id = Uuid::new_v4().to_string();
        let session = ActiveSession {
            session_id: session_id.clone(),
            user_id: user.id,
            username: user.username.clone(),
            salt,
            kdf: user.kdf,
            secrets: Some(Arc::new(VaultSecrets {
                master_password: Zeroizing::new(password.to_string()),
                key: OnceCell::new(),
            })),
        };
        let identity = session.identity();
        *self.active.write().await = Some(session);

        let record = PersistedSessionRecord {
            user_id: user.id,
            username: user.username.clone(),
            salt: user.password_salt.clone(),
            expires_at: self.clock.now() + self.config.session_ttl,
            device_fingerprint: self.fingerprint.clone(),
        };
        if let Err(e) = self.app_store.save_session(record) {
            // The in-memory session is still valid; only restore-after-restart is lost
            warn!("Failed to persist session: {}", e);
        }

        info!("User {} logged in", user.username);
        Ok(LoginOutcome {
            session_id,
            user: identity,
        })
    }

    /// Resolve the current identity, restoring it from the persisted record
    /// when there is no in-memory session.
    pub async fn verify(&self) -> Result<UserIdentity> {
        if let Some(session) = self.active.read().await.as_ref() {
            return Ok(session.identity());
        }

        let mut active = self.active.write().await;
        // Another task may have restored while we waited for the write lock
        if let Some(session) = active.as_ref() {
            return Ok(session.identity());
        }

        let Some(record) = self.app_store.load_session() else {
            return Err(AppError::NotAuthenticated);
        };

        // A failed read keeps the record for the next attempt
        let user = match self.check_persisted(&record)? {
            Ok(user) => user,
            Err(reason) => {
                info!("Discarding persisted session: {}", reason);
                self.app_store.clear_session()?;
                return Err(AppError::NotAuthenticated);
            }
        };

        let session = ActiveSession {
            session_id: Uuid::new_v4().to_string(),
            user_id: user.id,
            username: user.username.clone(),
            salt: decode_salt(&user)?,
            kdf: user.kdf,
            secrets: None,
        };
        let identity = session.identity();
        *active = Some(session);

        info!("Restored session for {} (vault locked)", identity.username);
        Ok(identity)
    }

    /// The inner `Err` is a reason to discard the record; the outer one is
    /// a storage failure.
    fn check_persisted(
        &self,
        record: &PersistedSessionRecord,
    ) -> Result<std::result::Result<User, String>> {
        if record.expires_at <= self.clock.now() {
            return Ok(Err("expired".into()));
        }
        if record.device_fingerprint != self.fingerprint {
            return Ok(Err("device fingerprint mismatch".into()));
        }
        let Some(user) = self.store.get_user(record.user_id)? else {
            return Ok(Err("user no longer exists".into()));
        };
        if user.username != record.username || user.password_salt != record.salt {
            return Ok(Err("record does not match stored user".into()));
        }
        Ok(Ok(user))
    }

    /// Drop the session and its persisted record.
    pub async fn logout(&self) -> Result<()> {
        let previous = self.active.write().await.take();
        self.app_store.clear_session()?;
        if let Some(session) = previous {
            info!("User {} logged out", session.username);
        }
        Ok(())
    }

    /// Verify the master password, derive the vault key and cache both.
    ///
    /// Attempts count against the same per-username budget as login. The
    /// newest stored credential is decrypted as a probe so a corrupted vault
    /// is reported here rather than on first read.
    pub async fn unlock(&self, master_password: &str) -> Result<VaultKey> {
        let (user_id, username, salt) = {
            self.verify().await?;
            let active = self.active.read().await;
            let session = active.as_ref().ok_or(AppError::NotAuthenticated)?;
            (session.user_id, session.username.clone(), session.salt.clone())
        };

        self.ledger.ensure_allowed(&username)?;
        let user = self
            .store
            .get_user(user_id)?
            .ok_or(AppError::NotAuthenticated)?;
        if !self.verify_off_thread(&user, master_password).await? {
            return Err(self.login_failed(&username));
        }
        self.ledger.record_success(&username);

        let key = self.derive_off_thread(master_password, salt, user.kdf).await?;

        if let Some(newest) = self
            .store
            .get_credentials_by_user(user_id, None, None)?
            .into_iter()
            .next()
        {
            decrypt_field(&newest.password, &key).inspect_err(|e| {
                warn!("Vault probe failed for credential {}: {}", newest.id, e);
            })?;
        }

        let secrets = Arc::new(VaultSecrets {
            master_password: Zeroizing::new(master_password.to_string()),
            key: OnceCell::new_with(Some(key.clone())),
        });

        let mut active = self.active.write().await;
        match active.as_mut() {
            Some(session) if session.user_id == user_id => {
                session.secrets = Some(secrets);
            }
            // Logged out (or switched user) while we were deriving
            _ => return Err(AppError::NotAuthenticated),
        }

        info!("Vault unlocked for {}", username);
        Ok(key)
    }

    /// Wipe cached secrets. The persisted record stays, so identity survives.
    /// Returns whether the vault was unlocked.
    pub async fn lock(&self) -> bool {
        let mut active = self.active.write().await;
        let was_unlocked = active
            .as_mut()
            .and_then(|session| session.secrets.take())
            .is_some();
        if was_unlocked {
            info!("Vault locked");
        }
        was_unlocked
    }

    /// The vault key, deriving and caching it on first use.
    pub async fn vault_key(&self) -> Result<VaultKey> {
        let (secrets, salt, kdf) = {
            let active = self.active.read().await;
            let session = active.as_ref().ok_or(AppError::NotAuthenticated)?;
            let secrets = session.secrets.clone().ok_or(AppError::VaultLocked)?;
            (secrets, session.salt.clone(), session.kdf)
        };

        let key = secrets
            .key
            .get_or_try_init(|| {
                debug!("Deriving vault key on first use");
                self.derive_off_thread(&secrets.master_password, salt, kdf)
            })
            .await?;
        Ok(key.clone())
    }

    /// Identity and key together, for callers that must fail with
    /// `NotAuthenticated` before `VaultLocked`.
    pub async fn unlocked_user(&self) -> Result<(UserIdentity, VaultKey)> {
        let identity = self.current_identity().await?;
        let key = self.vault_key().await?;
        Ok((identity, key))
    }

    /// In-memory identity only; never touches the persisted record.
    pub async fn identity(&self) -> Option<UserIdentity> {
        self.active.read().await.as_ref().map(ActiveSession::identity)
    }

    /// Identity, restoring from disk if needed.
    pub async fn current_identity(&self) -> Result<UserIdentity> {
        self.verify().await
    }

    pub async fn session_id(&self) -> Option<String> {
        self.active
            .read()
            .await
            .as_ref()
            .map(|s| s.session_id.clone())
    }

    pub async fn status(&self) -> VaultStatus {
        if self.verify().await.is_err() {
            return VaultStatus::NotAuthenticated;
        }
        match self.active.read().await.as_ref() {
            Some(session) if session.secrets.is_some() => VaultStatus::Unlocked,
            Some(_) => VaultStatus::Locked,
            None => VaultStatus::NotAuthenticated,
        }
    }

    /// Record a failed password check and build the error to return.
    /// The failure that triggers a block reports the block directly.
    fn login_failed(&self, username: &str) -> AppError {
        let status = self.ledger.record_failure(username);
        if status.blocked {
            AppError::RateLimited {
                wait_seconds: status.wait_seconds,
            }
        } else {
            debug!(
                "Failed password check for {}, {} attempts remaining",
                username, status.attempts_remaining
            );
            AppError::InvalidCredentials
        }
    }

    async fn hash_off_thread(&self, password: &str, salt: Vec<u8>) -> Result<String> {
        let password = Zeroizing::new(password.to_string());
        let iterations = self.config.hash_iterations;
        tokio::task::spawn_blocking(move || hash_password(&password, &salt, iterations))
            .await
            .map_err(|e| AppError::Encryption(format!("Hash task failed: {}", e)))?
    }

    async fn verify_off_thread(&self, user: &User, password: &str) -> Result<bool> {
        let password = Zeroizing::new(password.to_string());
        let salt = decode_salt(user)?;
        let stored = user.password_hash.clone();
        let iterations = user.hash_iterations;
        tokio::task::spawn_blocking(move || {
            verify_password(&password, &salt, iterations, &stored)
        })
        .await
        .map_err(|e| AppError::Encryption(format!("Verify task failed: {}", e)))?
    }

    async fn derive_off_thread(
        &self,
        master_password: &str,
        salt: Vec<u8>,
        kdf: KdfParams,
    ) -> Result<VaultKey> {
        let password = Zeroizing::new(master_password.to_string());
        tokio::task::spawn_blocking(move || derive_vault_key(&password, &salt, &kdf))
            .await
            .map_err(|e| AppError::Encryption(format!("Key derivation task failed: {}", e)))?
    }
}

fn decode_salt(user: &User) -> Result<Vec<u8>> {
    hex::decode(&user.password_salt)
        .map_err(|_| AppError::Storage(format!("Invalid salt for user {}", user.id)))
}
