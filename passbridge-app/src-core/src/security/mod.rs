mod crypto;
mod identity;
mod pairing;
mod password;
mod transport;

pub use crypto::{
    decrypt_field, derive_vault_key, encrypt_field, generate_salt, KdfParams, VaultKey, KEY_SIZE,
    SALT_SIZE,
};
pub use identity::{device_fingerprint, HostAttributes};
pub use pairing::{
    codes_match, generate_app_id, generate_session_key, is_legacy_app_id, needs_migration,
};
pub use password::{hash_password, verify_password, MIN_ITERATIONS};
pub use transport::{deobfuscate, obfuscate};
