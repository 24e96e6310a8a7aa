//! VaultManager - credential and category operations on top of the session.
//!
//! Secret fields (`username`, `password`) are sealed with the session's vault
//! key before they reach the store and opened again on the way out. Every
//! read or write of a secret needs an unlocked vault; categories only need an
//! authenticated session.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::lookup::extract_hostname;
use crate::error::{AppError, Result};
use crate::security::{decrypt_field, encrypt_field, VaultKey};
use crate::session::{SessionManager, UserIdentity};
use crate::storage::{
    Category, CategoryPatch, Credential, CredentialPatch, FieldUpdate, NewCredential, VaultStore,
};

/// Default color for categories created without one.
pub const DEFAULT_CATEGORY_COLOR: &str = "#6b7280";

/// Plaintext input for a new credential.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialInput {
    #[serde(default)]
    pub category_id: Option<i64>,
    pub title: String,
    #[serde(default)]
    pub site_link: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    pub password: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Credential with the username opened; the password stays sealed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialSummary {
    pub id: i64,
    pub category_id: Option<i64>,
    pub title: String,
    pub site_link: Option<String>,
    pub username: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevealedCredential {
    #[serde(flatten)]
    pub summary: CredentialSummary,
    pub password: String,
}

/// Result of a hostname lookup, ready to hand to the companion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCredential {
    pub credential_id: i64,
    pub url: String,
    pub username: String,
    pub password: String,
}

pub struct VaultManager {
    sessions: Arc<SessionManager>,
}

impl VaultManager {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }

    fn store(&self) -> &Arc<dyn VaultStore> {
        self.sessions.store()
    }

    pub async fn create_credential(&self, input: CredentialInput) -> Result<i64> {
        let (user, key) = self.sessions.unlocked_user().await?;

        let title = input.title.trim().to_string();
        if title.is_empty() {
            return Err(AppError::InvalidInput("title is required".into()));
        }
        if input.password.is_empty() {
            return Err(AppError::InvalidInput("password is required".into()));
        }

        let username_ciphertext = match non_empty(input.username) {
            Some(username) => Some(encrypt_field(&username, &key)?),
            None => None,
        };
        let new = NewCredential {
            category_id: input.category_id,
            title,
            site_link: non_empty(input.site_link),
            username_ciphertext,
            password_ciphertext: encrypt_field(&input.password, &key)?,
            description: non_empty(input.description),
        };

        let id = self.store().create_credential(user.user_id, new)?;
        info!("Created credential {} for user {}", id, user.user_id);
        Ok(id)
    }

    pub async fn list_credentials(
        &self,
        category_id: Option<i64>,
        search: Option<&str>,
    ) -> Result<Vec<CredentialSummary>> {
        let (user, key) = self.sessions.unlocked_user().await?;
        self.store()
            .get_credentials_by_user(user.user_id, category_id, search)?
            .iter()
            .map(|c| summarize(c, &key))
            .collect()
    }

    pub async fn reveal_credential(&self, id: i64) -> Result<RevealedCredential> {
        let (user, key) = self.sessions.unlocked_user().await?;
        let credential = self.load(id, &user)?;
        debug!("Revealing credential {}", id);
        Ok(RevealedCredential {
            summary: summarize(&credential, &key)?,
            password: decrypt_field(&credential.password, &key)?,
        })
    }

    /// Apply a patch whose `username`/`password` carry plaintext.
    pub async fn update_credential(&self, id: i64, patch: CredentialPatch) -> Result<()> {
        let (user, key) = self.sessions.unlocked_user().await?;
        if patch.is_empty() {
            // Still report a missing id
            self.load(id, &user)?;
            return Ok(());
        }

        let sealed = CredentialPatch {
            username: seal(patch.username, &key)?,
            password: seal(patch.password, &key)?,
            title: patch.title.map(|t| t.trim().to_string()),
            ..patch
        };
        if matches!(&sealed.title, FieldUpdate::Set(t) if t.is_empty()) {
            return Err(AppError::InvalidInput("title is required".into()));
        }

        if !self.store().update_credential(id, user.user_id, sealed)? {
            return Err(AppError::NotFound(format!("credential {}", id)));
        }
        info!("Updated credential {}", id);
        Ok(())
    }

    pub async fn delete_credential(&self, id: i64) -> Result<()> {
        let (user, _) = self.sessions.unlocked_user().await?;
        if !self.store().delete_credential(id, user.user_id)? {
            return Err(AppError::NotFound(format!("credential {}", id)));
        }
        info!("Deleted credential {}", id);
        Ok(())
    }

    /// Newest credential whose site link contains the URL's hostname.
    ///
    /// Checks run in a fixed order: session, lock, URL, match.
    pub async fn find_for_url(&self, url: &str) -> Result<ResolvedCredential> {
        let (user, key) = self.sessions.unlocked_user().await?;
        let hostname = extract_hostname(url)?;

        let matches = self
            .store()
            .get_credentials_by_hostname_pattern(user.user_id, &hostname)?;
        if matches.len() > 1 {
            debug!(
                "{} credentials match {}, using the newest",
                matches.len(),
                hostname
            );
        }
        let credential = matches
            .into_iter()
            .next()
            .ok_or_else(|| AppError::NotFound(format!("No credentials found for {}", hostname)))?;

        let mut resolved = resolve(&credential, &key)?;
        resolved.url = url.trim().to_string();
        Ok(resolved)
    }

    /// Open one credential by id for push delivery.
    pub async fn resolve_credential(&self, id: i64) -> Result<ResolvedCredential> {
        let (user, key) = self.sessions.unlocked_user().await?;
        let credential = self.load(id, &user)?;
        resolve(&credential, &key)
    }

    pub async fn create_category(&self, name: &str, color: Option<&str>) -> Result<i64> {
        let user = self.sessions.current_identity().await?;
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::InvalidInput("category name is required".into()));
        }
        let color = color.unwrap_or(DEFAULT_CATEGORY_COLOR);
        let id = self.store().create_category(user.user_id, name, color)?;
        info!("Created category {:?} ({})", name, id);
        Ok(id)
    }

    pub async fn list_categories(&self) -> Result<Vec<Category>> {
        let user = self.sessions.current_identity().await?;
        self.store().get_categories(user.user_id)
    }

    pub async fn update_category(&self, id: i64, patch: CategoryPatch) -> Result<()> {
        let user = self.sessions.current_identity().await?;
        let patch = CategoryPatch {
            name: patch.name.map(|n| n.trim().to_string()),
            ..patch
        };
        if patch.name.as_deref() == Some("") {
            return Err(AppError::InvalidInput("category name is required".into()));
        }
        if !self.store().update_category(id, user.user_id, patch)? {
            return Err(AppError::NotFound(format!("category {}", id)));
        }
        Ok(())
    }

    pub async fn delete_category(&self, id: i64) -> Result<()> {
        let user = self.sessions.current_identity().await?;
        if !self.store().delete_category(id, user.user_id)? {
            return Err(AppError::NotFound(format!("category {}", id)));
        }
        info!("Deleted category {}", id);
        Ok(())
    }

    fn load(&self, id: i64, user: &UserIdentity) -> Result<Credential> {
        self.store()
            .get_credential(id, user.user_id)?
            .ok_or_else(|| AppError::NotFound(format!("credential {}", id)))
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn seal(update: FieldUpdate<String>, key: &VaultKey) -> Result<FieldUpdate<String>> {
    Ok(match update {
        FieldUpdate::Set(plaintext) => FieldUpdate::Set(encrypt_field(&plaintext, key)?),
        other => other,
    })
}

fn summarize(credential: &Credential, key: &VaultKey) -> Result<CredentialSummary> {
    let username = match &credential.username {
        Some(sealed) => Some(decrypt_field(sealed, key)?),
        None => None,
    };
    Ok(CredentialSummary {
        id: credential.id,
        category_id: credential.category_id,
        title: credential.title.clone(),
        site_link: credential.site_link.clone(),
        username,
        description: credential.description.clone(),
        created_at: credential.created_at,
        updated_at: credential.updated_at,
    })
}

fn resolve(credential: &Credential, key: &VaultKey) -> Result<ResolvedCredential> {
    let username = match &credential.username {
        Some(sealed) => decrypt_field(sealed, key)?,
        None => String::new(),
    };
    Ok(ResolvedCredential {
        credential_id: credential.id,
        url: credential.site_link.clone().unwrap_or_default(),
        username,
        password: decrypt_field(&credential.password, key)?,
    })
}
