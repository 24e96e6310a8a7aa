mod manager;

pub use manager::{
    LoginOutcome, SessionConfig, SessionManager, UserIdentity, VaultStatus, MIN_PASSWORD_LEN,
};

#[cfg(test)]
pub(crate) use manager::tests::test_config;
