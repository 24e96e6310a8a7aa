use rand::RngCore;
use subtle::ConstantTimeEq;

/// App ID entropy in bytes (256 bits, 64 hex chars)
pub const APP_ID_BYTES: usize = 32;
/// Legacy identifiers were 48 bits (12 hex chars)
pub const LEGACY_APP_ID_LEN: usize = 12;
/// Per-connection session key size in bytes
pub const SESSION_KEY_BYTES: usize = 32;

/// Generate a fresh 256-bit App ID, hex encoded.
pub fn generate_app_id() -> String {
    random_hex(APP_ID_BYTES)
}

/// Generate a fresh per-connection session key, hex encoded.
pub fn generate_session_key() -> String {
    random_hex(SESSION_KEY_BYTES)
}

/// True for anything that is not a well-formed 256-bit App ID.
///
/// Legacy 12-char identifiers and corrupted values are both replaced.
pub fn needs_migration(app_id: &str) -> bool {
    app_id.len() != APP_ID_BYTES * 2 || !app_id.chars().all(|c| c.is_ascii_hexdigit())
}

pub fn is_legacy_app_id(app_id: &str) -> bool {
    app_id.len() == LEGACY_APP_ID_LEN
}

/// Compare a presented pairing code against the App ID in constant time.
pub fn codes_match(presented: &str, app_id: &str) -> bool {
    presented.as_bytes().ct_eq(app_id.as_bytes()).into()
}

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
