//! Keyed credential storage.
//!
//! [`VaultStore`] is the contract the core consumes; every operation is
//! scoped by `user_id` and never returns another user's rows. Secret columns
//! arrive already sealed, so the store never sees plaintext.
//!
//! [`FileVaultStore`] keeps the tables in memory and flushes them to a JSON
//! file on every write (temp file + rename). A failed flush rolls the
//! in-memory tables back so readers never observe an unpersisted change.

use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::models::{
    Category, CategoryPatch, Credential, CredentialPatch, NewCredential, NewUser, User,
};
use super::write_private_file;
use crate::error::{AppError, Result};

/// Vault file name
pub const VAULT_FILE_NAME: &str = "vault.json";

pub trait VaultStore: Send + Sync {
    // Users
    /// Usernames are unique ignoring case.
    fn create_user(&self, new: NewUser) -> Result<User>;
    fn get_user(&self, id: i64) -> Result<Option<User>>;
    /// Case-insensitive, matching the login rate limiter's keying.
    fn get_user_by_username(&self, username: &str) -> Result<Option<User>>;
    fn delete_user(&self, id: i64) -> Result<bool>;

    // Credentials
    fn create_credential(&self, user_id: i64, new: NewCredential) -> Result<i64>;
    fn get_credential(&self, id: i64, user_id: i64) -> Result<Option<Credential>>;
    /// Search matches title, description and site link substrings. Newest first.
    fn get_credentials_by_user(
        &self,
        user_id: i64,
        category_id: Option<i64>,
        search: Option<&str>,
    ) -> Result<Vec<Credential>>;
    /// Credentials whose site link contains `hostname`, newest first.
    fn get_credentials_by_hostname_pattern(
        &self,
        user_id: i64,
        hostname: &str,
    ) -> Result<Vec<Credential>>;
    fn update_credential(&self, id: i64, user_id: i64, patch: CredentialPatch) -> Result<bool>;
    fn delete_credential(&self, id: i64, user_id: i64) -> Result<bool>;

    // Categories
    fn create_category(&self, user_id: i64, name: &str, color: &str) -> Result<i64>;
    fn get_categories(&self, user_id: i64) -> Result<Vec<Category>>;
    fn update_category(&self, id: i64, user_id: i64, patch: CategoryPatch) -> Result<bool>;
    /// Deleting a category detaches its credentials.
    fn delete_category(&self, id: i64, user_id: i64) -> Result<bool>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct VaultTables {
    next_user_id: i64,
    next_credential_id: i64,
    next_category_id: i64,
    users: Vec<User>,
    credentials: Vec<Credential>,
    categories: Vec<Category>,
}

impl VaultTables {
    fn next_id(counter: &mut i64) -> i64 {
        *counter += 1;
        *counter
    }

    fn owns_category(&self, user_id: i64, category_id: i64) -> bool {
        self.categories
            .iter()
            .any(|c| c.id == category_id && c.user_id == user_id)
    }
}

pub struct FileVaultStore {
    path: Option<PathBuf>,
    tables: RwLock<VaultTables>,
}

impl FileVaultStore {
    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            tables: RwLock::new(VaultTables::default()),
        }
    }

    /// Open (or start) the vault file in `data_dir`.
    ///
    /// A missing file is a first run. An unreadable file is an error: the
    /// vault is never silently replaced.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(VAULT_FILE_NAME);

        let tables = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let tables: VaultTables = serde_json::from_str(&content)
                .map_err(|e| AppError::Storage(format!("Vault data corrupted: {}", e)))?;
            info!(
                "Opened vault at {:?} ({} users, {} credentials)",
                path,
                tables.users.len(),
                tables.credentials.len()
            );
            tables
        } else {
            info!("No vault at {:?}, starting empty", path);
            VaultTables::default()
        };

        Ok(Self {
            path: Some(path),
            tables: RwLock::new(tables),
        })
    }

    fn flush(&self, tables: &VaultTables) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let content = serde_json::to_vec_pretty(tables)?;
        write_private_file(path, &content)?;
        debug!("Vault flushed to disk");
        Ok(())
    }

    /// Apply a mutation and persist it. Nothing changes if either step fails.
    fn mutate<R>(&self, f: impl FnOnce(&mut VaultTables) -> Result<R>) -> Result<R> {
        let mut tables = self.tables.write();
        let snapshot = tables.clone();
        match f(&mut tables).and_then(|result| self.flush(&tables).map(|()| result)) {
            Ok(result) => Ok(result),
            Err(e) => {
                *tables = snapshot;
                Err(e)
            }
        }
    }
}

fn newest_first(credentials: &mut [Credential]) {
    credentials.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
}

fn same_username(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

fn contains_ci(haystack: Option<&str>, needle_lower: &str) -> bool {
    haystack.is_some_and(|h| h.to_lowercase().contains(needle_lower))
}

impl VaultStore for FileVaultStore {
    fn create_user(&self, new: NewUser) -> Result<User> {
        self.mutate(|t| {
            if t.users.iter().any(|u| same_username(&u.username, &new.username)) {
                return Err(AppError::UsernameTaken);
            }
            let user = User {
                id: VaultTables::next_id(&mut t.next_user_id),
                username: new.username,
                password_hash: new.password_hash,
                password_salt: new.password_salt,
                kdf: new.kdf,
                hash_iterations: new.hash_iterations,
                created_at: Utc::now(),
            };
            t.users.push(user.clone());
            Ok(user)
        })
    }

    fn get_user(&self, id: i64) -> Result<Option<User>> {
        Ok(self.tables.read().users.iter().find(|u| u.id == id).cloned())
    }

    fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        Ok(self
            .tables
            .read()
            .users
            .iter()
            .find(|u| same_username(&u.username, username))
            .cloned())
    }

    fn delete_user(&self, id: i64) -> Result<bool> {
        self.mutate(|t| {
            let before = t.users.len();
            t.users.retain(|u| u.id != id);
            if t.users.len() == before {
                return Ok(false);
            }
            t.credentials.retain(|c| c.user_id != id);
            t.categories.retain(|c| c.user_id != id);
            Ok(true)
        })
    }

    fn create_credential(&self, user_id: i64, new: NewCredential) -> Result<i64> {
        self.mutate(|t| {
            if let Some(category_id) = new.category_id {
                if !t.owns_category(user_id, category_id) {
                    return Err(AppError::InvalidInput(format!(
                        "unknown category {}",
                        category_id
                    )));
                }
            }
            let now = Utc::now();
            let id = VaultTables::next_id(&mut t.next_credential_id);
            t.credentials.push(Credential {
                id,
                user_id,
                category_id: new.category_id,
                title: new.title,
                site_link: new.site_link,
                username: new.username_ciphertext,
                password: new.password_ciphertext,
                description: new.description,
                created_at: now,
                updated_at: now,
            });
            Ok(id)
        })
    }

    fn get_credential(&self, id: i64, user_id: i64) -> Result<Option<Credential>> {
        Ok(self
            .tables
            .read()
            .credentials
            .iter()
            .find(|c| c.id == id && c.user_id == user_id)
            .cloned())
    }

    fn get_credentials_by_user(
        &self,
        user_id: i64,
        category_id: Option<i64>,
        search: Option<&str>,
    ) -> Result<Vec<Credential>> {
        let search = search
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty());
        let tables = self.tables.read();
        let mut found: Vec<Credential> = tables
            .credentials
            .iter()
            .filter(|c| c.user_id == user_id)
            .filter(|c| category_id.is_none() || c.category_id == category_id)
            .filter(|c| match &search {
                None => true,
                Some(s) => {
                    c.title.to_lowercase().contains(s)
                        || contains_ci(c.description.as_deref(), s)
                        || contains_ci(c.site_link.as_deref(), s)
                }
            })
            .cloned()
            .collect();
        newest_first(&mut found);
        Ok(found)
    }

    fn get_credentials_by_hostname_pattern(
        &self,
        user_id: i64,
        hostname: &str,
    ) -> Result<Vec<Credential>> {
        let needle = hostname.to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        let tables = self.tables.read();
        let mut found: Vec<Credential> = tables
            .credentials
            .iter()
            .filter(|c| c.user_id == user_id && contains_ci(c.site_link.as_deref(), &needle))
            .cloned()
            .collect();
        newest_first(&mut found);
        Ok(found)
    }

    fn update_credential(&self, id: i64, user_id: i64, patch: CredentialPatch) -> Result<bool> {
        self.mutate(|t| {
            if let super::FieldUpdate::Set(category_id) = patch.category_id {
                if !t.owns_category(user_id, category_id) {
                    return Err(AppError::InvalidInput(format!(
                        "unknown category {}",
                        category_id
                    )));
                }
            }
            let Some(credential) = t
                .credentials
                .iter_mut()
                .find(|c| c.id == id && c.user_id == user_id)
            else {
                return Ok(false);
            };

            patch.category_id.apply_to(&mut credential.category_id);
            patch.site_link.apply_to(&mut credential.site_link);
            patch.username.apply_to(&mut credential.username);
            patch.description.apply_to(&mut credential.description);
            match patch.title {
                super::FieldUpdate::Set(title) => credential.title = title,
                super::FieldUpdate::Clear => {
                    return Err(AppError::InvalidInput("title cannot be cleared".into()))
                }
                super::FieldUpdate::Keep => {}
            }
            match patch.password {
                super::FieldUpdate::Set(password) => credential.password = password,
                super::FieldUpdate::Clear => {
                    return Err(AppError::InvalidInput("password cannot be cleared".into()))
                }
                super::FieldUpdate::Keep => {}
            }
            credential.updated_at = Utc::now();
            Ok(true)
        })
    }

    fn delete_credential(&self, id: i64, user_id: i64) -> Result<bool> {
        self.mutate(|t| {
            let before = t.credentials.len();
            t.credentials
                .retain(|c| !(c.id == id && c.user_id == user_id));
            Ok(t.credentials.len() < before)
        })
    }

    fn create_category(&self, user_id: i64, name: &str, color: &str) -> Result<i64> {
        self.mutate(|t| {
            if t
                .categories
                .iter()
                .any(|c| c.user_id == user_id && c.name == name)
            {
                return Err(AppError::AlreadyExists(format!("category {:?}", name)));
            }
            let id = VaultTables::next_id(&mut t.next_category_id);
            t.categories.push(Category {
                id,
                user_id,
                name: name.to_string(),
                color: color.to_string(),
            });
            Ok(id)
        })
    }

    fn get_categories(&self, user_id: i64) -> Result<Vec<Category>> {
        let tables = self.tables.read();
        let mut categories: Vec<Category> = tables
            .categories
            .iter()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        categories.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        Ok(categories)
    }

    fn update_category(&self, id: i64, user_id: i64, patch: CategoryPatch) -> Result<bool> {
        self.mutate(|t| {
            if let Some(name) = &patch.name {
                if t
                    .categories
                    .iter()
                    .any(|c| c.user_id == user_id && c.id != id && &c.name == name)
                {
                    return Err(AppError::AlreadyExists(format!("category {:?}", name)));
                }
            }
            let Some(category) = t
                .categories
                .iter_mut()
                .find(|c| c.id == id && c.user_id == user_id)
            else {
                return Ok(false);
            };
            if let Some(name) = patch.name {
                category.name = name;
            }
            if let Some(color) = patch.color {
                category.color = color;
            }
            Ok(true)
        })
    }

    fn delete_category(&self, id: i64, user_id: i64) -> Result<bool> {
        self.mutate(|t| {
            let before = t.categories.len();
            t.categories
                .retain(|c| !(c.id == id && c.user_id == user_id));
            if t.categories.len() == before {
                return Ok(false);
            }
            for credential in t
                .credentials
                .iter_mut()
                .filter(|c| c.user_id == user_id && c.category_id == Some(id))
            {
                credential.category_id = None;
            }
            Ok(true)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::KdfParams;
    use crate::storage::FieldUpdate;

    fn new_user(username: &str) -> NewUser {
        NewUser {
            username: username.to_string(),
            password_hash: "hash".to_string(),
            password_salt: "salt".to_string(),
            kdf: KdfParams::default(),
            hash_iterations: 1_000,
        }
    }

    fn new_credential(title: &str, site: &str) -> NewCredential {
        NewCredential {
            category_id: None,
            title: title.to_string(),
            site_link: Some(site.to_string()),
            username_ciphertext: Some("v1:user".to_string()),
            password_ciphertext: "v1:pass".to_string(),
            description: None,
        }
    }

    #[test]
    fn test_usernames_unique() {
        let store = FileVaultStore::in_memory();
        store.create_user(new_user("alice")).unwrap();
        assert!(matches!(
            store.create_user(new_user("alice")),
            Err(AppError::UsernameTaken)
        ));
    }

    #[test]
    fn test_usernames_compare_ignoring_case() {
        let store = FileVaultStore::in_memory();
        let alice = store.create_user(new_user("Alice")).unwrap();
        assert!(matches!(
            store.create_user(new_user("alice")),
            Err(AppError::UsernameTaken)
        ));
        let found = store.get_user_by_username("ALICE").unwrap().unwrap();
        assert_eq!(found.id, alice.id);
        assert_eq!(found.username, "Alice");
    }

    #[test]
    fn test_rows_scoped_by_user() {
        let store = FileVaultStore::in_memory();
        let alice = store.create_user(new_user("alice")).unwrap();
        let bob = store.create_user(new_user("bob")).unwrap();
        let id = store
            .create_credential(alice.id, new_credential("Mail", "https://mail.example.com"))
            .unwrap();

        assert!(store.get_credential(id, bob.id).unwrap().is_none());
        assert!(store
            .get_credentials_by_hostname_pattern(bob.id, "example.com")
            .unwrap()
            .is_empty());
        assert!(!store.delete_credential(id, bob.id).unwrap());
        assert!(!store
            .update_credential(id, bob.id, CredentialPatch::default())
            .unwrap());
        assert!(store.get_credential(id, alice.id).unwrap().is_some());
    }

    #[test]
    fn test_hostname_pattern_newest_first() {
        let store = FileVaultStore::in_memory();
        let user = store.create_user(new_user("alice")).unwrap();
        let older = store
            .create_credential(user.id, new_credential("Old", "https://mail.example.com/login"))
            .unwrap();
        let newer = store
            .create_credential(user.id, new_credential("New", "https://EXAMPLE.com"))
            .unwrap();
        store
            .create_credential(user.id, new_credential("Other", "https://other.org"))
            .unwrap();

        let found = store
            .get_credentials_by_hostname_pattern(user.id, "example.com")
            .unwrap();
        let ids: Vec<i64> = found.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![newer, older]);
        assert!(store
            .get_credentials_by_hostname_pattern(user.id, "notexample.com")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_search_and_category_filter() {
        let store = FileVaultStore::in_memory();
        let user = store.create_user(new_user("alice")).unwrap();
        let work = store.create_category(user.id, "Work", "#ff0000").unwrap();
        let mut gitlab = new_credential("GitLab", "https://gitlab.com");
        gitlab.category_id = Some(work);
        gitlab.description = Some("company account".into());
        store.create_credential(user.id, gitlab).unwrap();
        store
            .create_credential(user.id, new_credential("Bank", "https://bank.com"))
            .unwrap();

        assert_eq!(
            store
                .get_credentials_by_user(user.id, Some(work), None)
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            store
                .get_credentials_by_user(user.id, None, Some("COMPANY"))
                .unwrap()[0]
                .title,
            "GitLab"
        );
        assert_eq!(
            store
                .get_credentials_by_user(user.id, None, Some("bank.com"))
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            store.get_credentials_by_user(user.id, None, Some("  ")).unwrap().len(),
            2
        );
    }

    #[test]
    fn test_patch_semantics() {
        let store = FileVaultStore::in_memory();
        let user = store.create_user(new_user("alice")).unwrap();
        let mut new = new_credential("Mail", "https://mail.example.com");
        new.description = Some("notes".into());
        let id = store.create_credential(user.id, new).unwrap();

        let patch = CredentialPatch {
            description: FieldUpdate::Clear,
            title: FieldUpdate::Set("Mail (personal)".into()),
            ..Default::default()
        };
        assert!(store.update_credential(id, user.id, patch).unwrap());

        let c = store.get_credential(id, user.id).unwrap().unwrap();
        assert_eq!(c.title, "Mail (personal)");
        assert_eq!(c.description, None);
        assert_eq!(c.site_link.as_deref(), Some("https://mail.example.com"));

        let clear_password = CredentialPatch {
            password: FieldUpdate::Clear,
            ..Default::default()
        };
        assert!(store.update_credential(id, user.id, clear_password).is_err());
        assert_eq!(
            store.get_credential(id, user.id).unwrap().unwrap().password,
            "v1:pass"
        );
    }

    #[test]
    fn test_delete_category_detaches() {
        let store = FileVaultStore::in_memory();
        let user = store.create_user(new_user("alice")).unwrap();
        let cat = store.create_category(user.id, "Work", "#fff").unwrap();
        let mut new = new_credential("Jira", "https://jira.example.com");
        new.category_id = Some(cat);
        let id = store.create_credential(user.id, new).unwrap();

        assert!(store.delete_category(cat, user.id).unwrap());
        let c = store.get_credential(id, user.id).unwrap().unwrap();
        assert_eq!(c.category_id, None);
        assert!(store.get_categories(user.id).unwrap().is_empty());
    }

    #[test]
    fn test_category_names_unique_per_user() {
        let store = FileVaultStore::in_memory();
        let alice = store.create_user(new_user("alice")).unwrap();
        let bob = store.create_user(new_user("bob")).unwrap();
        store.create_category(alice.id, "Work", "#fff").unwrap();
        assert!(matches!(
            store.create_category(alice.id, "Work", "#000"),
            Err(AppError::AlreadyExists(_))
        ));
        store.create_category(bob.id, "Work", "#fff").unwrap();
    }

    #[test]
    fn test_foreign_category_rejected() {
        let store = FileVaultStore::in_memory();
        let alice = store.create_user(new_user("alice")).unwrap();
        let bob = store.create_user(new_user("bob")).unwrap();
        let bobs = store.create_category(bob.id, "Bob's", "#fff").unwrap();
        let mut new = new_credential("X", "https://x.com");
        new.category_id = Some(bobs);
        assert!(store.create_credential(alice.id, new).is_err());
    }

    #[test]
    fn test_file_store_persists_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let user_id = {
            let store = FileVaultStore::open(dir.path()).unwrap();
            let user = store.create_user(new_user("alice")).unwrap();
            store
                .create_credential(user.id, new_credential("Mail", "https://mail.example.com"))
                .unwrap();
            user.id
        };

        let reopened = FileVaultStore::open(dir.path()).unwrap();
        assert_eq!(
            reopened.get_user_by_username("alice").unwrap().unwrap().id,
            user_id
        );
        assert_eq!(
            reopened
                .get_credentials_by_user(user_id, None, None)
                .unwrap()
                .len(),
            1
        );
        // ids keep increasing after reopen
        let next = reopened
            .create_credential(user_id, new_credential("Two", "https://two.com"))
            .unwrap();
        assert_eq!(next, 2);
    }

    #[test]
    fn test_corrupt_vault_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(VAULT_FILE_NAME), "{{{").unwrap();
        assert!(matches!(
            FileVaultStore::open(dir.path()),
            Err(AppError::Storage(_))
        ));
    }

    #[test]
    fn test_delete_user_cascades() {
        let store = FileVaultStore::in_memory();
        let user = store.create_user(new_user("alice")).unwrap();
        let id = store
            .create_credential(user.id, new_credential("Mail", "https://mail.example.com"))
            .unwrap();
        assert!(store.delete_user(user.id).unwrap());
        assert!(store.get_user(user.id).unwrap().is_none());
        assert!(store.get_credential(id, user.id).unwrap().is_none());
    }
}
