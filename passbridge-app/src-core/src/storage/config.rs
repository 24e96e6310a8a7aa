use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

use super::write_private_file;
use crate::error::Result;
use crate::security::{KdfParams, MIN_ITERATIONS};

/// Well-known loopback port the companion extension connects to.
pub const DEFAULT_GATEWAY_PORT: u16 = 19456;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub gateway_host: String,
    pub gateway_port: u16,
    pub gateway_enabled: bool,
    /// "Stay logged in" lifetime.
    pub session_ttl_days: i64,
    pub kdf: KdfParams,
    pub password_hash_iterations: u32,
    /// XOR-obfuscate credential fields sent to the companion.
    pub transport_obfuscation: bool,
    pub sweep_interval_secs: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            gateway_host: "127.0.0.1".to_string(),
            gateway_port: DEFAULT_GATEWAY_PORT,
            gateway_enabled: true,
            session_ttl_days: 30,
            kdf: KdfParams::default(),
            password_hash_iterations: MIN_ITERATIONS,
            transport_obfuscation: true,
            sweep_interval_secs: 300,
        }
    }
}

impl AppSettings {
    /// Log settings that weaken the defaults.
    pub fn warn_if_weak(&self) {
        if self.password_hash_iterations < MIN_ITERATIONS {
            warn!(
                "password_hash_iterations={} is below the recommended minimum of {}",
                self.password_hash_iterations, MIN_ITERATIONS
            );
        }
        if self.kdf.memory_kib < KdfParams::default().memory_kib {
            warn!("Argon2 memory cost {} KiB is below the default", self.kdf.memory_kib);
        }
        if !self.transport_obfuscation {
            warn!("Companion transport obfuscation is disabled");
        }
    }
}

fn get_settings_path(data_dir: &Path) -> PathBuf {
    data_dir.join("settings.json")
}

/// Load settings, falling back to defaults when the file is absent or unreadable.
pub fn load_settings(data_dir: &Path) -> AppSettings {
    let path = get_settings_path(data_dir);

    if !path.exists() {
        return AppSettings::default();
    }

    match std::fs::read_to_string(&path)
        .map_err(crate::error::AppError::from)
        .and_then(|content| serde_json::from_str(&content).map_err(Into::into))
    {
        Ok(settings) => settings,
        Err(e) => {
            warn!("Ignoring unreadable settings file {:?}: {}", path, e);
            AppSettings::default()
        }
    }
}

pub fn save_settings(data_dir: &Path, settings: &AppSettings) -> Result<()> {
    let path = get_settings_path(data_dir);
    let content = serde_json::to_string_pretty(settings)?;
    write_private_file(&path, content.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_settings_use_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings(dir.path());
        assert_eq!(settings.gateway_port, DEFAULT_GATEWAY_PORT);
        assert_eq!(settings.session_ttl_days, 30);
        assert!(settings.password_hash_iterations >= MIN_ITERATIONS);
    }

    #[test]
    fn test_partial_settings_fill_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("settings.json"), r#"{"gateway_port": 4000}"#).unwrap();
        let settings = load_settings(dir.path());
        assert_eq!(settings.gateway_port, 4000);
        assert_eq!(settings.gateway_host, "127.0.0.1");
    }

    #[test]
    fn test_corrupt_settings_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("settings.json"), "{not json").unwrap();
        assert_eq!(load_settings(dir.path()).gateway_port, DEFAULT_GATEWAY_PORT);
    }

    #[test]
    fn test_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = AppSettings::default();
        settings.session_ttl_days = 7;
        save_settings(dir.path(), &settings).unwrap();
        assert_eq!(load_settings(dir.path()).session_ttl_days, 7);
    }
}
