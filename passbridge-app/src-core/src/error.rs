//! Error taxonomy shared by every component.
//!
//! Variants above the `Internal` marker are user-actionable and may be shown
//! verbatim to the UI or the paired companion. Internal variants carry
//! implementation detail and are collapsed by [`AppError::public_message`]
//! before crossing the pairing boundary.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Username is already taken")]
    UsernameTaken,

    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("Too many failed attempts. Try again in {wait_seconds} seconds")]
    RateLimited { wait_seconds: u64 },

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Vault is locked. Unlock it in the Passbridge app")]
    VaultLocked,

    /// Stored ciphertext does not have the expected shape.
    #[error("Malformed ciphertext: {0}")]
    MalformedCiphertext(String),

    /// AEAD tag mismatch: wrong key or tampered data.
    #[error("Decryption failed: wrong password or corrupted data")]
    AuthenticationFailed,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid pairing code")]
    PairingRejected,

    #[error("Not paired")]
    Unauthorized,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    // Internal
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    /// Stable machine-readable code for programmatic handling.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::UsernameTaken => "USERNAME_TAKEN",
            AppError::InvalidCredentials => "INVALID_CREDENTIALS",
            AppError::RateLimited { .. } => "RATE_LIMITED",
            AppError::NotAuthenticated => "NOT_AUTHENTICATED",
            AppError::VaultLocked => "VAULT_LOCKED",
            AppError::MalformedCiphertext(_) => "MALFORMED_CIPHERTEXT",
            AppError::AuthenticationFailed => "AUTHENTICATION_FAILED",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::InvalidUrl(_) => "INVALID_URL",
            AppError::PairingRejected => "PAIRING_REJECTED",
            AppError::Unauthorized => "UNAUTHORIZED",
            AppError::InvalidInput(_) => "INVALID_INPUT",
            AppError::AlreadyExists(_) => "ALREADY_EXISTS",
            AppError::Storage(_) => "STORAGE_ERROR",
            AppError::Encryption(_) => "ENCRYPTION_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::Io(_) => "IO_ERROR",
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            AppError::Storage(_)
                | AppError::Encryption(_)
                | AppError::Serialization(_)
                | AppError::Io(_)
        )
    }

    /// Message safe to hand to the companion or the UI.
    pub fn public_message(&self) -> String {
        match self {
            AppError::MalformedCiphertext(_) => "Stored credential data is corrupted".to_string(),
            e if e.is_internal() => "Internal error".to_string(),
            e => e.to_string(),
        }
    }

    pub fn wait_seconds(&self) -> Option<u64> {
        match self {
            AppError::RateLimited { wait_seconds } => Some(*wait_seconds),
            _ => None,
        }
    }
}

impl serde::Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;

        let wait = self.wait_seconds();
        let len = if wait.is_some() { 3 } else { 2 };
        let mut state = serializer.serialize_struct("AppError", len)?;
        state.serialize_field("code", self.code())?;
        state.serialize_field("message", &self.public_message())?;
        if let Some(wait) = wait {
            state.serialize_field("waitSeconds", &wait)?;
        }
        state.end()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_serialization_carries_wait() {
        let err = AppError::RateLimited { wait_seconds: 300 };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "RATE_LIMITED");
        assert_eq!(json["waitSeconds"], 300);
    }

    #[test]
    fn test_internal_errors_are_redacted() {
        let err = AppError::Storage("disk /home/alice/vault.json unreadable".into());
        assert_eq!(err.public_message(), "Internal error");
        let json = serde_json::to_string(&err).unwrap();
        assert!(!json.contains("alice"));
        assert!(json.contains("STORAGE_ERROR"));
    }

    #[test]
    fn test_locked_and_unauthenticated_are_distinct() {
        assert_ne!(AppError::VaultLocked.code(), AppError::NotAuthenticated.code());
        assert_ne!(
            AppError::NotFound("x".into()).code(),
            AppError::VaultLocked.code()
        );
    }
}
