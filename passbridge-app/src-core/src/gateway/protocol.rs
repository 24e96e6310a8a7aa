use serde::{Deserialize, Serialize};

/// Frames sent by the companion extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Present the App ID to pair this connection.
    Pair { code: String },
    /// Look up credentials for the page the companion is on.
    RequestCredentials { url: String },
    /// Any well-formed frame with a type we do not handle.
    #[serde(other)]
    Unknown,
}

/// Frames sent to the companion extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    PairSuccess { session_key: String, message: String },
    PairFailed { message: String },
    CredentialsResponse(CredentialsResponse),
    Error { message: String },
    /// Server-initiated delivery (push).
    #[serde(rename_all = "camelCase")]
    Credentials {
        url: String,
        username: String,
        password: String,
        auto_click: bool,
        encrypted: bool,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_seconds: Option<u64>,
    /// Whether `username`/`password` are obfuscated with the session key.
    #[serde(default)]
    pub encrypted: bool,
}

impl CredentialsResponse {
    pub fn failure(url: Option<String>, error: &crate::error::AppError) -> Self {
        Self {
            success: false,
            url,
            error: Some(error.public_message()),
            error_code: Some(error.code().to_string()),
            wait_seconds: error.wait_seconds(),
            ..Default::default()
        }
    }
}
