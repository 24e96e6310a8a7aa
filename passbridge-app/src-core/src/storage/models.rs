use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::security::{KdfParams, MIN_ITERATIONS};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    /// Hex-encoded per-user salt, shared by the login hash and the vault key.
    pub password_salt: String,
    /// Argon2 costs the vault key was derived with. Fixed at signup.
    #[serde(default)]
    pub kdf: KdfParams,
    /// PBKDF2 iterations of `password_hash`. Fixed at signup.
    #[serde(default = "default_hash_iterations")]
    pub hash_iterations: u32,
    pub created_at: DateTime<Utc>,
}

fn default_hash_iterations() -> u32 {
    MIN_ITERATIONS
}

/// Insert payload for [`super::VaultStore::create_user`].
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub password_hash: String,
    pub password_salt: String,
    pub kdf: KdfParams,
    pub hash_iterations: u32,
}

/// A stored credential. `username` and `password` hold ciphertext, never plaintext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: i64,
    pub user_id: i64,
    pub category_id: Option<i64>,
    pub title: String,
    pub site_link: Option<String>,
    pub username: Option<String>,
    pub password: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub color: String,
}

/// Insert payload for [`super::VaultStore::create_credential`]; secret fields already sealed.
#[derive(Debug, Clone)]
pub struct NewCredential {
    pub category_id: Option<i64>,
    pub title: String,
    pub site_link: Option<String>,
    pub username_ciphertext: Option<String>,
    pub password_ciphertext: String,
    pub description: Option<String>,
}

/// Per-field update instruction.
///
/// JSON: an absent field is `Keep`, `null` is `Clear`, a value is `Set`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FieldUpdate<T> {
    #[default]
    Keep,
    Clear,
    Set(T),
}

impl<T> FieldUpdate<T> {
    /// Apply to an optional column.
    pub fn apply_to(self, target: &mut Option<T>) {
        match self {
            FieldUpdate::Keep => {}
            FieldUpdate::Clear => *target = None,
            FieldUpdate::Set(v) => *target = Some(v),
        }
    }

    pub fn is_keep(&self) -> bool {
        matches!(self, FieldUpdate::Keep)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> FieldUpdate<U> {
        match self {
            FieldUpdate::Keep => FieldUpdate::Keep,
            FieldUpdate::Clear => FieldUpdate::Clear,
            FieldUpdate::Set(v) => FieldUpdate::Set(f(v)),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for FieldUpdate<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        // Only reached when the field is present; absence is handled by #[serde(default)]
        Ok(match Option::<T>::deserialize(deserializer)? {
            Some(v) => FieldUpdate::Set(v),
            None => FieldUpdate::Clear,
        })
    }
}

/// Partial credential update. Secret fields are ciphertext by the time they reach the store.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CredentialPatch {
    pub category_id: FieldUpdate<i64>,
    pub title: FieldUpdate<String>,
    pub site_link: FieldUpdate<String>,
    pub username: FieldUpdate<String>,
    pub password: FieldUpdate<String>,
    pub description: FieldUpdate<String>,
}

impl CredentialPatch {
    pub fn is_empty(&self) -> bool {
        self.category_id.is_keep()
            && self.title.is_keep()
            && self.site_link.is_keep()
            && self.username.is_keep()
            && self.password.is_keep()
            && self.description.is_keep()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CategoryPatch {
    pub name: Option<String>,
    pub color: Option<String>,
}
