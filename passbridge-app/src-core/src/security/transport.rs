//! Obfuscation of credential fields sent to a paired companion.
//!
//! This is a repeating-key XOR with the per-connection session key, hex
//! encoded. It is NOT encryption: the key travels in the clear in the
//! `pair-success` frame. Confidentiality rests on the socket being loopback
//! only and on the pairing code being secret. Do not reuse this anywhere
//! data leaves the host.

use crate::error::{AppError, Result};

pub fn obfuscate(plaintext: &str, session_key_hex: &str) -> Result<String> {
    let key = decode_key(session_key_hex)?;
    Ok(hex::encode(xor(plaintext.as_bytes(), &key)))
}

pub fn deobfuscate(encoded: &str, session_key_hex: &str) -> Result<String> {
    let key = decode_key(session_key_hex)?;
    let bytes = hex::decode(encoded)
        .map_err(|_| AppError::InvalidInput("obfuscated payload is not hex".into()))?;
    String::from_utf8(xor(&bytes, &key))
        .map_err(|_| AppError::InvalidInput("obfuscated payload is not UTF-8".into()))
}

fn decode_key(session_key_hex: &str) -> Result<Vec<u8>> {
    let key = hex::decode(session_key_hex)
        .map_err(|_| AppError::Encryption("session key is not hex".into()))?;
    if key.is_empty() {
        return Err(AppError::Encryption("empty session key".into()));
    }
    Ok(key)
}

fn xor(data: &[u8], key: &[u8]) -> Vec<u8> {
    data.iter()
        .zip(key.iter().cycle())
        .map(|(d, k)| d ^ k)
        .collect()
}
