//! Credential vault operations.
//!
//! Secret fields are sealed per field with the session's vault key (see
//! [`crate::security`]). The vault is only readable while the session is
//! unlocked; a locked vault fails with `VaultLocked` rather than returning
//! empty data.

mod lookup;
mod manager;

pub use crate::session::VaultStatus;
pub use lookup::extract_hostname;
pub use manager::{
    CredentialInput, CredentialSummary, ResolvedCredential, RevealedCredential, VaultManager,
    DEFAULT_CATEGORY_COLOR,
};

#[cfg(test)]
pub(crate) use manager::tests::{input as test_input, unlocked_vault};
