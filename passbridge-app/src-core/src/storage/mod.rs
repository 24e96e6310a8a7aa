mod app_store;
mod config;
mod models;
mod vault_store;

use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};

pub use app_store::{AppStore, AppStoreData, PersistedSessionRecord};
pub use config::{load_settings, save_settings, AppSettings};
pub use models::{
    Category, CategoryPatch, Credential, CredentialPatch, FieldUpdate, NewCredential, NewUser,
    User,
};
pub use vault_store::{FileVaultStore, VaultStore, VAULT_FILE_NAME};

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "PASSBRIDGE_DATA_DIR";

/// Resolve and create the data directory.
/// Called once at app startup before any storage operations.
pub fn init_data_dir() -> Result<PathBuf> {
    let data_dir = match std::env::var_os(DATA_DIR_ENV) {
        Some(dir) => PathBuf::from(dir),
        None => directories::ProjectDirs::from("dev", "Passbridge", "Passbridge")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .ok_or_else(|| {
                AppError::Storage("Could not determine data directory".into())
            })?,
    };

    std::fs::create_dir_all(&data_dir)?;
    Ok(data_dir)
}

/// Write a file atomically (temp file, then rename) with owner-only permissions.
pub(crate) fn write_private_file(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp_path = PathBuf::from(temp_name);

    std::fs::write(&temp_path, contents)?;

    // Set restrictive permissions on Unix before the file becomes visible
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&temp_path)?.permissions();
        perms.set_mode(0o600);
        std::fs::set_permissions(&temp_path, perms)?;
    }

    std::fs::rename(&temp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_private_file_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("file.json");
        write_private_file(&path, b"one").unwrap();
        write_private_file(&path, b"two").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"two");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
