//! Request/response command surface.
//!
//! Every core operation is reachable by name with a JSON payload. Results
//! come back as `{"success": true, "data": ...}` or
//! `{"success": false, "error": {"code", "message", "waitSeconds"?}}`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error};

use crate::error::{AppError, Result};
use crate::gateway::GatewayStatus;
use crate::session::{LoginOutcome, UserIdentity, VaultStatus};
use crate::state::AppState;
use crate::storage::{AppSettings, Category, CategoryPatch, CredentialPatch};
use crate::vault::{CredentialInput, CredentialSummary, RevealedCredential};

#[derive(Debug, Deserialize)]
pub struct AccountArgs {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnlockArgs {
    pub master_password: String,
}

#[derive(Debug, Deserialize)]
pub struct IdArgs {
    pub id: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ListCredentialsArgs {
    pub category_id: Option<i64>,
    pub search: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateCredentialArgs {
    pub id: i64,
    #[serde(default)]
    pub changes: CredentialPatch,
}

#[derive(Debug, Deserialize)]
pub struct CreateCategoryArgs {
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateCategoryArgs {
    pub id: i64,
    #[serde(flatten)]
    pub changes: CategoryPatch,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenInBrowserArgs {
    pub credential_id: i64,
    #[serde(default = "default_auto_click")]
    pub auto_click: bool,
}

fn default_auto_click() -> bool {
    true
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: VaultStatus,
    pub user: Option<UserIdentity>,
}

// Account commands
pub async fn signup(state: &AppState, args: AccountArgs) -> Result<Value> {
    let user_id = state.sessions.signup(&args.username, &args.password).await?;
    Ok(json!({ "userId": user_id }))
}

pub async fn login(state: &AppState, args: AccountArgs) -> Result<LoginOutcome> {
    state.sessions.login(&args.username, &args.password).await
}

pub async fn logout(state: &AppState) -> Result<()> {
    state.sessions.logout().await
}

pub async fn verify_session(state: &AppState) -> Result<UserIdentity> {
    state.sessions.verify().await
}

// Vault lock commands
pub async fn unlock(state: &AppState, args: UnlockArgs) -> Result<StatusResponse> {
    state.sessions.unlock(&args.master_password).await?;
    get_vault_status(state).await
}

pub async fn lock(state: &AppState) -> Result<Value> {
    let was_unlocked = state.sessions.lock().await;
    Ok(json!({ "wasUnlocked": was_unlocked }))
}

pub async fn get_vault_status(state: &AppState) -> Result<StatusResponse> {
    let status = state.sessions.status().await;
    Ok(StatusResponse {
        status,
        user: state.sessions.identity().await,
    })
}

// Credential commands
pub async fn create_credential(state: &AppState, args: CredentialInput) -> Result<Value> {
    let id = state.vault.create_credential(args).await?;
    Ok(json!({ "id": id }))
}

pub async fn list_credentials(
    state: &AppState,
    args: ListCredentialsArgs,
) -> Result<Vec<CredentialSummary>> {
    state
        .vault
        .list_credentials(args.category_id, args.search.as_deref())
        .await
}

pub async fn get_credential(state: &AppState, args: IdArgs) -> Result<RevealedCredential> {
    state.vault.reveal_credential(args.id).await
}

pub async fn update_credential(state: &AppState, args: UpdateCredentialArgs) -> Result<()> {
    state.vault.update_credential(args.id, args.changes).await
}

pub async fn delete_credential(state: &AppState, args: IdArgs) -> Result<()> {
    state.vault.delete_credential(args.id).await
}

// Category commands
pub async fn create_category(state: &AppState, args: CreateCategoryArgs) -> Result<Value> {
    let id = state
        .vault
        .create_category(&args.name, args.color.as_deref())
        .await?;
    Ok(json!({ "id": id }))
}

pub async fn list_categories(state: &AppState) -> Result<Vec<Category>> {
    state.vault.list_categories().await
}

pub async fn update_category(state: &AppState, args: UpdateCategoryArgs) -> Result<()> {
    state.vault.update_category(args.id, args.changes).await
}

pub async fn delete_category(state: &AppState, args: IdArgs) -> Result<()> {
    state.vault.delete_category(args.id).await
}

// Companion commands
pub async fn open_in_browser(state: &AppState, args: OpenInBrowserArgs) -> Result<Value> {
    let delivered = state
        .gateway
        .push_credentials(args.credential_id, args.auto_click)
        .await?;
    Ok(json!({ "delivered": delivered }))
}

/// The App ID is the pairing code the user copies into the extension.
pub async fn get_app_id(state: &AppState) -> Result<Value> {
    state.sessions.verify().await?;
    let app_id = state.app_store.get_or_create_app_id()?;
    Ok(json!({ "appId": app_id }))
}

/// Replace the App ID; every companion must pair again.
pub async fn regenerate_app_id(state: &AppState) -> Result<Value> {
    state.sessions.verify().await?;
    let app_id = state.app_store.rotate_app_id()?;
    Ok(json!({ "appId": app_id }))
}

pub async fn get_gateway_status(state: &AppState) -> Result<GatewayStatus> {
    Ok(state.gateway.status())
}

pub async fn get_settings(state: &AppState) -> Result<AppSettings> {
    Ok(state.settings.clone())
}

fn args<T: DeserializeOwned>(payload: Value) -> Result<T> {
    let payload = match payload {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    serde_json::from_value(payload).map_err(|e| AppError::InvalidInput(e.to_string()))
}

fn to_value<T: Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

async fn run_command(state: &AppState, command: &str, payload: Value) -> Result<Value> {
    match command {
        "signup" => signup(state, args(payload)?).await,
        "login" => to_value(login(state, args(payload)?).await?),
        "logout" => to_value(logout(state).await?),
        "verify_session" => to_value(verify_session(state).await?),
        "unlock" => to_value(unlock(state, args(payload)?).await?),
        "lock" => lock(state).await,
        "get_vault_status" => to_value(get_vault_status(state).await?),
        "create_credential" => create_credential(state, args(payload)?).await,
        "list_credentials" => to_value(list_credentials(state, args(payload)?).await?),
        "get_credential" => to_value(get_credential(state, args(payload)?).await?),
        "update_credential" => to_value(update_credential(state, args(payload)?).await?),
        "delete_credential" => to_value(delete_credential(state, args(payload)?).await?),
        "create_category" => create_category(state, args(payload)?).await,
        "list_categories" => to_value(list_categories(state).await?),
        "update_category" => to_value(update_category(state, args(payload)?).await?),
        "delete_category" => to_value(delete_category(state, args(payload)?).await?),
        "open_in_browser" => open_in_browser(state, args(payload)?).await,
        "get_app_id" => get_app_id(state).await,
        "regenerate_app_id" => regenerate_app_id(state).await,
        "get_gateway_status" => to_value(get_gateway_status(state).await?),
        "get_settings" => to_value(get_settings(state).await?),
        other => Err(AppError::InvalidInput(format!("unknown command {:?}", other))),
    }
}

/// Run a command by name and wrap the outcome in the response envelope.
pub async fn dispatch(state: &AppState, command: &str, payload: Value) -> Value {
    match run_command(state, command, payload).await {
        Ok(data) => json!({ "success": true, "data": data }),
        Err(e) => {
            if e.is_internal() {
                error!("Command {} failed: {}", command, e);
            } else {
                debug!("Command {} rejected: {}", command, e);
            }
            json!({ "success": false, "error": e })
        }
    }
}
