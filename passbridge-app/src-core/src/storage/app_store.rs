//! Small state blob kept next to the vault: the pairing App ID and the
//! "stay logged in" session record.
//!
//! Neither field is secret-bearing in the vault sense. A missing or malformed
//! file is treated as empty.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::write_private_file;
use crate::error::Result;
use crate::security::{generate_app_id, is_legacy_app_id, needs_migration};

/// File name for app state.
const APP_STATE_FILE: &str = "app-state.json";

/// Device-bound, expiring login record used to restore identity after restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSessionRecord {
    pub user_id: i64,
    pub username: String,
    /// Hex-encoded user salt.
    pub salt: String,
    pub expires_at: DateTime<Utc>,
    pub device_fingerprint: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppStoreData {
    pub app_id: Option<String>,
    pub session: Option<PersistedSessionRecord>,
}

pub struct AppStore {
    /// `None` keeps everything in memory.
    path: Option<PathBuf>,
    data: Mutex<AppStoreData>,
}

impl AppStore {
    /// Load the state blob from `data_dir`.
    pub fn open(data_dir: &Path) -> Self {
        let path = data_dir.join(APP_STATE_FILE);
        let data = Self::load(&path);
        Self {
            path: Some(path),
            data: Mutex::new(data),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: Mutex::new(AppStoreData::default()),
        }
    }

    fn load(path: &Path) -> AppStoreData {
        if !path.exists() {
            return AppStoreData::default();
        }

        match std::fs::read_to_string(path)
            .map_err(crate::error::AppError::from)
            .and_then(|content| serde_json::from_str(&content).map_err(Into::into))
        {
            Ok(data) => data,
            Err(e) => {
                warn!("Ignoring malformed app state {:?}: {}", path, e);
                AppStoreData::default()
            }
        }
    }

    fn save(&self, data: &AppStoreData) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let content = serde_json::to_string_pretty(data)?;
        write_private_file(path, content.as_bytes())
    }

    /// Apply `f` and persist; the in-memory copy only changes if the write succeeds.
    fn update<R>(&self, f: impl FnOnce(&mut AppStoreData) -> R) -> Result<R> {
        let mut data = self.data.lock();
        let mut next = data.clone();
        let result = f(&mut next);
        self.save(&next)?;
        *data = next;
        Ok(result)
    }

    /// Return the App ID, generating one on first run and replacing legacy
    /// or malformed values.
    pub fn get_or_create_app_id(&self) -> Result<String> {
        if let Some(id) = self.data.lock().app_id.clone() {
            if !needs_migration(&id) {
                return Ok(id);
            }
        }

        self.update(|data| {
            // Re-check under the lock; another caller may have migrated already
            match &data.app_id {
                Some(id) if !needs_migration(id) => id.clone(),
                existing => {
                    match existing {
                        Some(old) if is_legacy_app_id(old) => {
                            warn!("Replacing legacy 48-bit App ID with a 256-bit one")
                        }
                        Some(_) => warn!("Replacing malformed App ID"),
                        None => info!("Generated new App ID"),
                    }
                    let id = generate_app_id();
                    data.app_id = Some(id.clone());
                    id
                }
            }
        })
    }

    /// Replace the App ID unconditionally. Existing pairings stop working.
    pub fn rotate_app_id(&self) -> Result<String> {
        let id = generate_app_id();
        self.update(|data| data.app_id = Some(id.clone()))?;
        info!("App ID rotated");
        Ok(id)
    }

    pub fn save_session(&self, record: PersistedSessionRecord) -> Result<()> {
        debug!("Persisting session for user {}", record.user_id);
        self.update(|data| data.session = Some(record))
    }

    pub fn load_session(&self) -> Option<PersistedSessionRecord> {
        self.data.lock().session.clone()
    }

    pub fn clear_session(&self) -> Result<()> {
        if self.data.lock().session.is_none() {
            return Ok(());
        }
        self.update(|data| data.session = None)?;
        debug!("Persisted session cleared");
        Ok(())
    }

    pub fn snapshot(&self) -> AppStoreData {
        self.data.lock().clone()
    }
}
