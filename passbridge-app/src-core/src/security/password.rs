//! Login password hashing.
//!
//! Kept separate from vault key derivation: the stored hash only proves
//! knowledge of the password and is never usable as an encryption key.

use sha2::Sha512;
use subtle::ConstantTimeEq;

use crate::error::{AppError, Result};

/// PBKDF2-HMAC-SHA512 output length in bytes
pub const HASH_SIZE: usize = 64;
/// Minimum iteration count accepted for production settings
pub const MIN_ITERATIONS: u32 = 100_000;

/// Hash a password with the given salt, returning the hex-encoded digest.
pub fn hash_password(password: &str, salt: &[u8], iterations: u32) -> Result<String> {
    if iterations == 0 {
        return Err(AppError::InvalidInput("iterations must be non-zero".into()));
    }
    let mut out = [0u8; HASH_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha512>(password.as_bytes(), salt, iterations, &mut out);
    Ok(hex::encode(out))
}

/// Verify a password against a stored hex digest.
///
/// The comparison runs over the full digest regardless of where the first
/// mismatch is. An undecodable stored hash verifies as false.
pub fn verify_password(password: &str, salt: &[u8], iterations: u32, stored_hash: &str) -> Result<bool> {
    let Ok(expected) = hex::decode(stored_hash) else {
        return Ok(false);
    };
    let candidate = hash_password(password, salt, iterations)?;
    let candidate = hex::decode(candidate)
        .map_err(|e| AppError::Encryption(format!("hash encoding: {}", e)))?;
    Ok(candidate.ct_eq(&expected).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ITER: u32 = 1_000;

    #[test]
    fn test_hash_length_and_determinism() {
        let h1 = hash_password("pw", b"salt-salt-salt", ITER).unwrap();
        let h2 = hash_password("pw", b"salt-salt-salt", ITER).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), HASH_SIZE * 2);
    }

    #[test]
    fn test_salt_changes_hash() {
        let h1 = hash_password("pw", b"salt-one", ITER).unwrap();
        let h2 = hash_password("pw", b"salt-two", ITER).unwrap();
        assert_ne!(h1, h2);
    }

    #[test]
    fn test_verify() {
        let salt = b"0123456789abcdef";
        let stored = hash_password("correct", salt, ITER).unwrap();
        assert!(verify_password("correct", salt, ITER, &stored).unwrap());
        assert!(!verify_password("incorrect", salt, ITER, &stored).unwrap());
        assert!(!verify_password("correct", salt, ITER + 1, &stored).unwrap());
    }

    #[test]
    fn test_verify_garbage_hash() {
        assert!(!verify_password("pw", b"salt", ITER, "not-hex").unwrap());
        assert!(!verify_password("pw", b"salt", ITER, "abcd").unwrap());
    }

    #[test]
    fn test_zero_iterations_rejected() {
        assert!(hash_password("pw", b"salt", 0).is_err());
    }
}
