//! Vault key derivation and per-field authenticated encryption.
//!
//! Fields are sealed with AES-256-GCM under a key derived from the master
//! password via Argon2id. The stored form is a colon-delimited hex string:
//!
//! ```text
//! v1:<12-byte nonce>:<16-byte tag>:<ciphertext>
//! ```
//!
//! The unversioned three-part form `<nonce>:<tag>:<ciphertext>` is accepted
//! on decrypt as well.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{AppError, Result};

/// Nonce size for AES-GCM (96 bits = 12 bytes)
const NONCE_SIZE: usize = 12;
/// GCM authentication tag size
const TAG_SIZE: usize = 16;
/// 256-bit key for AES-256
pub const KEY_SIZE: usize = 32;
/// Per-user salt size in bytes
pub const SALT_SIZE: usize = 16;

const FORMAT_VERSION: &str = "v1";

/// A 256-bit vault key with automatic zeroization on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct VaultKey {
    key: [u8; KEY_SIZE],
}

impl VaultKey {
    pub fn from_bytes(key: [u8; KEY_SIZE]) -> Self {
        Self { key }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }
}

impl std::fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log the actual key material
        f.debug_struct("VaultKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Argon2id cost parameters.
///
/// Defaults: 64 MiB memory, 3 passes, 4 lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 65536,
            iterations: 3,
            parallelism: 4,
        }
    }
}

/// Generate a random per-user salt.
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::rng().fill_bytes(&mut salt);
    salt
}

/// Derive the vault key from the master password and the user's salt.
///
/// Deterministic for the same inputs, so the key never has to be stored.
/// Intentionally slow; callers on the async runtime should run this on a
/// blocking thread.
pub fn derive_vault_key(master_password: &str, salt: &[u8], params: &KdfParams) -> Result<VaultKey> {
    let params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| AppError::Encryption(format!("Invalid Argon2 params: {}", e)))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key_bytes = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(master_password.as_bytes(), salt, &mut key_bytes)
        .map_err(|e| AppError::Encryption(format!("Key derivation failed: {}", e)))?;

    let key = VaultKey::from_bytes(key_bytes);
    key_bytes.zeroize();
    debug!("Derived {}-byte vault key", KEY_SIZE);
    Ok(key)
}

/// Encrypt a single field under the vault key with a fresh random nonce.
pub fn encrypt_field(plaintext: &str, key: &VaultKey) -> Result<String> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| AppError::Encryption(format!("Invalid key: {}", e)))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    // aes-gcm appends the tag to the ciphertext
    let sealed = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| AppError::Encryption(format!("Encryption failed: {}", e)))?;
    let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_SIZE);

    Ok(format!(
        "{}:{}:{}:{}",
        FORMAT_VERSION,
        hex::encode(nonce_bytes),
        hex::encode(tag),
        hex::encode(ciphertext)
    ))
}

/// Decrypt a field produced by [`encrypt_field`].
///
/// Shape problems yield `MalformedCiphertext` before any decryption is
/// attempted; a tag mismatch yields `AuthenticationFailed`.
pub fn decrypt_field(encoded: &str, key: &VaultKey) -> Result<String> {
    let (nonce, tag, ciphertext) = parse_field(encoded)?;

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| AppError::Encryption(format!("Invalid key: {}", e)))?;

    let mut sealed = ciphertext;
    sealed.extend_from_slice(&tag);

    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce), sealed.as_ref())
        .map_err(|_| AppError::AuthenticationFailed)?;

    String::from_utf8(plaintext)
        .map_err(|_| AppError::MalformedCiphertext("plaintext is not valid UTF-8".into()))
}

fn parse_field(encoded: &str) -> Result<([u8; NONCE_SIZE], [u8; TAG_SIZE], Vec<u8>)> {
    let parts: Vec<&str> = encoded.split(':').collect();
    let parts = match parts.as_slice() {
        [version, rest @ ..] if rest.len() == 3 => {
            if *version != FORMAT_VERSION {
                return Err(AppError::MalformedCiphertext(format!(
                    "unsupported format version {:?}",
                    version
                )));
            }
            rest
        }
        all if all.len() == 3 => all,
        other => {
            return Err(AppError::MalformedCiphertext(format!(
                "expected 3 components, got {}",
                other.len()
            )))
        }
    };

    let nonce = decode_fixed::<NONCE_SIZE>(parts[0], "nonce")?;
    let tag = decode_fixed::<TAG_SIZE>(parts[1], "tag")?;
    let ciphertext = hex::decode(parts[2])
        .map_err(|_| AppError::MalformedCiphertext("ciphertext is not valid hex".into()))?;

    Ok((nonce, tag, ciphertext))
}

fn decode_fixed<const N: usize>(component: &str, name: &str) -> Result<[u8; N]> {
    let bytes = hex::decode(component)
        .map_err(|_| AppError::MalformedCiphertext(format!("{} is not valid hex", name)))?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        AppError::MalformedCiphertext(format!(
            "{} must be {} bytes, got {}",
            name,
            N,
            b.len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_params() -> KdfParams {
        KdfParams {
            memory_kib: 1024,
            iterations: 1,
            parallelism: 1,
        }
    }

    fn test_key(password: &str) -> VaultKey {
        derive_vault_key(password, &[7u8; SALT_SIZE], &fast_params()).unwrap()
    }

    #[test]
    fn test_derive_key_deterministic() {
        let key1 = test_key("correct horse");
        let key2 = test_key("correct horse");
        assert_eq!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_derive_key_different_salts() {
        let key1 = derive_vault_key("pw", &[1u8; SALT_SIZE], &fast_params()).unwrap();
        let key2 = derive_vault_key("pw", &[2u8; SALT_SIZE], &fast_params()).unwrap();
        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_round_trip() {
        let key = test_key("master");
        for plaintext in ["", "hunter2", "pässwörd with ünïcode 🔑", &"x".repeat(4096)] {
            let sealed = encrypt_field(plaintext, &key).unwrap();
            assert_eq!(decrypt_field(&sealed, &key).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_encryption_is_not_deterministic() {
        let key = test_key("master");
        let a = encrypt_field("same", &key).unwrap();
        let b = encrypt_field("same", &key).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_format_shape() {
        let key = test_key("master");
        let sealed = encrypt_field("abc", &key).unwrap();
        let parts: Vec<&str> = sealed.split(':').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "v1");
        assert_eq!(parts[1].len(), NONCE_SIZE * 2);
        assert_eq!(parts[2].len(), TAG_SIZE * 2);
        assert_eq!(parts[3].len(), 6);
    }

    #[test]
    fn test_unversioned_form_accepted() {
        let key = test_key("master");
        let sealed = encrypt_field("legacy", &key).unwrap();
        let bare = sealed.trim_start_matches("v1:");
        assert_eq!(decrypt_field(bare, &key).unwrap(), "legacy");
    }

    #[test]
    fn test_tamper_detection_every_bit() {
        let key = test_key("master");
        let sealed = encrypt_field("secret", &key).unwrap();
        let (nonce, tag, ciphertext) = parse_field(&sealed).unwrap();

        let mut blob: Vec<u8> = Vec::new();
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&tag);
        blob.extend_from_slice(&ciphertext);

        for byte in 0..blob.len() {
            for bit in 0..8 {
                let mut flipped = blob.clone();
                flipped[byte] ^= 1 << bit;
                let encoded = format!(
                    "v1:{}:{}:{}",
                    hex::encode(&flipped[..NONCE_SIZE]),
                    hex::encode(&flipped[NONCE_SIZE..NONCE_SIZE + TAG_SIZE]),
                    hex::encode(&flipped[NONCE_SIZE + TAG_SIZE..])
                );
                assert!(matches!(
                    decrypt_field(&encoded, &key),
                    Err(AppError::AuthenticationFailed)
                ));
            }
        }
    }

    #[test]
    fn test_wrong_key_rejected() {
        let right = test_key("right password");
        let wrong = test_key("wrong password");
        let sealed = encrypt_field("secret", &right).unwrap();
        assert!(matches!(
            decrypt_field(&sealed, &wrong),
            Err(AppError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_malformed_input_distinct_from_auth_failure() {
        let key = test_key("master");
        let cases = [
            "",
            "deadbeef",
            "aa:bb",
            "v1:aa:bb:cc:dd",
            "v2:000000000000000000000000:00000000000000000000000000000000:00",
            // nonce too short
            "v1:0000:00000000000000000000000000000000:00",
            // tag too short
            "v1:000000000000000000000000:0000:00",
            // not hex
            "v1:zz0000000000000000000000:00000000000000000000000000000000:00",
        ];
        for case in cases {
            assert!(
                matches!(
                    decrypt_field(case, &key),
                    Err(AppError::MalformedCiphertext(_))
                ),
                "expected malformed for {:?}",
                case
            );
        }
    }

    #[test]
    fn test_key_debug_redacted() {
        let key = VaultKey::from_bytes([0xAB; KEY_SIZE]);
        let debug = format!("{:?}", key);
        assert!(debug.contains("REDACTED"));
        assert!(!debug.to_lowercase().contains("ab, ab"));
    }
}
