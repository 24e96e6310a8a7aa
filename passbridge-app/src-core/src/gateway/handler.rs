//! PairingGateway - the per-connection protocol state machine.
//!
//! A connection starts unpaired and only accepts `pair`. Presenting the App
//! ID pairs it and issues a fresh session key; after that it may ask for
//! credentials by URL. The gateway never touches a socket: the server feeds
//! it text frames and forwards the replies, which keeps it testable with
//! plain channels.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::limiter::{ConnectionLimiter, LimitKind};
use super::protocol::{ClientMessage, CredentialsResponse, ServerMessage};
use super::registry::{ConnectionId, ConnectionRegistry};
use crate::error::{AppError, Result};
use crate::security::{codes_match, generate_session_key, obfuscate};
use crate::storage::AppStore;
use crate::vault::{ResolvedCredential, VaultManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatus {
    pub listening: bool,
    pub port: Option<u16>,
    pub connections: usize,
    pub paired: usize,
}

pub struct PairingGateway {
    registry: ConnectionRegistry,
    limiter: ConnectionLimiter,
    vault: Arc<VaultManager>,
    app_store: Arc<AppStore>,
    obfuscate_transport: bool,
    /// 0 while not listening.
    port: AtomicU16,
}

impl PairingGateway {
    pub fn new(vault: Arc<VaultManager>, app_store: Arc<AppStore>, obfuscate_transport: bool) -> Self {
        Self::with_limiter(vault, app_store, obfuscate_transport, ConnectionLimiter::new())
    }

    pub fn with_limiter(
        vault: Arc<VaultManager>,
        app_store: Arc<AppStore>,
        obfuscate_transport: bool,
        limiter: ConnectionLimiter,
    ) -> Self {
        if !obfuscate_transport {
            warn!("Credentials will be sent to the companion in plaintext");
        }
        Self {
            registry: ConnectionRegistry::new(),
            limiter,
            vault,
            app_store,
            obfuscate_transport,
            port: AtomicU16::new(0),
        }
    }

    pub fn register(
        &self,
        outbound: mpsc::Sender<ServerMessage>,
        peer: Option<SocketAddr>,
    ) -> ConnectionId {
        self.registry.register(outbound, peer)
    }

    /// Drop all state for a connection.
    pub fn disconnect(&self, id: ConnectionId) {
        let removed = self.registry.remove(id);
        self.limiter.remove_connection(id);
        if let Some(conn) = removed {
            info!(
                "{} disconnected (paired: {}, connected since {})",
                id,
                conn.is_paired(),
                conn.connected_at
            );
        }
    }

    /// Process one text frame. Returns the reply to send, if any.
    pub async fn handle_frame(&self, id: ConnectionId, text: &str) -> Option<ServerMessage> {
        if !self.registry.contains(id) {
            debug!("Frame for unknown connection {}", id);
            return None;
        }

        let message: ClientMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Ignoring malformed frame from {}: {}", id, e);
                return None;
            }
        };

        match message {
            ClientMessage::Pair { code } => Some(self.handle_pair(id, &code)),
            ClientMessage::RequestCredentials { url } => {
                if !self.registry.is_paired(id) {
                    return Some(not_paired());
                }
                Some(self.handle_request(id, url).await)
            }
            ClientMessage::Unknown => {
                if !self.registry.is_paired(id) {
                    return Some(not_paired());
                }
                Some(ServerMessage::Error {
                    message: "Unknown message type".to_string(),
                })
            }
        }
    }

    fn handle_pair(&self, id: ConnectionId, code: &str) -> ServerMessage {
        if let Err(wait_seconds) = self.limiter.check(id, LimitKind::Pair) {
            return ServerMessage::PairFailed {
                message: format!(
                    "Too many pairing attempts. Try again in {} seconds",
                    wait_seconds
                ),
            };
        }

        let app_id = match self.app_store.get_or_create_app_id() {
            Ok(app_id) => app_id,
            Err(e) => {
                error!("Failed to load App ID: {}", e);
                return ServerMessage::PairFailed {
                    message: e.public_message(),
                };
            }
        };

        if !codes_match(code.trim(), &app_id) {
            warn!("{} presented an invalid pairing code", id);
            return ServerMessage::PairFailed {
                message: AppError::PairingRejected.to_string(),
            };
        }

        let session_key = generate_session_key();
        if !self.registry.set_paired(id, session_key.clone()) {
            return ServerMessage::PairFailed {
                message: "Connection closed".to_string(),
            };
        }
        self.limiter.clear(id, LimitKind::Pair);
        info!("{} paired", id);

        ServerMessage::PairSuccess {
            session_key,
            message: "Paired with Passbridge".to_string(),
        }
    }

    async fn handle_request(&self, id: ConnectionId, url: String) -> ServerMessage {
        if let Err(wait_seconds) = self.limiter.check(id, LimitKind::Request) {
            return ServerMessage::CredentialsResponse(CredentialsResponse::failure(
                Some(url),
                &AppError::RateLimited { wait_seconds },
            ));
        }

        let result = match self.vault.find_for_url(&url).await {
            Ok(resolved) => self.seal_for(id, resolved),
            Err(e) => Err(e),
        };

        match result {
            Ok((resolved, encrypted)) => {
                debug!("{}: served credential {}", id, resolved.credential_id);
                ServerMessage::CredentialsResponse(CredentialsResponse {
                    success: true,
                    url: Some(url),
                    username: Some(resolved.username),
                    password: Some(resolved.password),
                    encrypted,
                    ..Default::default()
                })
            }
            Err(e) => {
                if e.is_internal() {
                    error!("{}: credential lookup failed: {}", id, e);
                } else {
                    debug!("{}: credential lookup: {}", id, e);
                }
                ServerMessage::CredentialsResponse(CredentialsResponse::failure(Some(url), &e))
            }
        }
    }

    /// Obfuscate secret fields with the connection's session key.
    fn seal_for(
        &self,
        id: ConnectionId,
        resolved: ResolvedCredential,
    ) -> Result<(ResolvedCredential, bool)> {
        let key = self
            .registry
            .session_key(id)
            .ok_or(AppError::Unauthorized)?;
        seal_with(&key, resolved, self.obfuscate_transport)
    }

    /// Deliver a credential to every paired connection. Skips the lookup
    /// rate limit; still requires an authenticated, unlocked session.
    /// Returns how many connections it was queued for.
    pub async fn push_credentials(&self, credential_id: i64, auto_click: bool) -> Result<usize> {
        let resolved = self.vault.resolve_credential(credential_id).await?;

        let mut delivered = 0;
        for target in self.registry.push_targets() {
            let (sealed, encrypted) =
                seal_with(&target.session_key, resolved.clone(), self.obfuscate_transport)?;
            let message = ServerMessage::Credentials {
                url: sealed.url,
                username: sealed.username,
                password: sealed.password,
                auto_click,
                encrypted,
            };
            if ConnectionRegistry::try_send(&target.outbound, target.id, message) {
                delivered += 1;
            }
        }

        info!(
            "Pushed credential {} to {} companion connection(s)",
            credential_id, delivered
        );
        Ok(delivered)
    }

    pub fn set_listening_port(&self, port: Option<u16>) {
        self.port.store(port.unwrap_or(0), Ordering::Relaxed);
    }

    pub fn status(&self) -> GatewayStatus {
        let (connections, paired) = self.registry.counts();
        let port = match self.port.load(Ordering::Relaxed) {
            0 => None,
            p => Some(p),
        };
        GatewayStatus {
            listening: port.is_some(),
            port,
            connections,
            paired,
        }
    }

    /// Prune idle rate-limit windows.
    pub fn sweep(&self) -> usize {
        self.limiter.sweep()
    }
}

fn not_paired() -> ServerMessage {
    ServerMessage::Error {
        message: AppError::Unauthorized.to_string(),
    }
}

fn seal_with(
    session_key: &str,
    mut resolved: ResolvedCredential,
    enabled: bool,
) -> Result<(ResolvedCredential, bool)> {
    if !enabled {
        return Ok((resolved, false));
    }
    resolved.username = obfuscate(&resolved.username, session_key)?;
    resolved.password = obfuscate(&resolved.password, session_key)?;
    Ok((resolved, true))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::security::deobfuscate;
    use crate::session::SessionManager;
    use crate::vault::{test_input, unlocked_vault};

    pub(crate) struct Harness {
        pub sessions: Arc<SessionManager>,
        pub vault: Arc<VaultManager>,
        pub app_store: Arc<AppStore>,
        pub gateway: PairingGateway,
    }

    pub(crate) async fn harness() -> Harness {
        let (sessions, vault) = unlocked_vault().await;
        let vault = Arc::new(vault);
        let app_store = Arc::new(AppStore::in_memory());
        let gateway = PairingGateway::new(vault.clone(), app_store.clone(), true);
        Harness {
            sessions,
            vault,
            app_store,
            gateway,
        }
    }

    fn connect(gateway: &PairingGateway) -> (ConnectionId, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(16);
        (gateway.register(tx, None), rx)
    }

    async fn pair(h: &Harness, id: ConnectionId) -> String {
        let code = h.app_store.get_or_create_app_id().unwrap();
        let frame = serde_json::json!({"type": "pair", "code": code}).to_string();
        match h.gateway.handle_frame(id, &frame).await {
            Some(ServerMessage::PairSuccess { session_key, .. }) => session_key,
            other => panic!("expected pair-success, got {:?}", other),
        }
    }

    async fn request(h: &Harness, id: ConnectionId, url: &str) -> ServerMessage {
        let frame = serde_json::json!({"type": "request-credentials", "url": url}).to_string();
        h.gateway.handle_frame(id, &frame).await.unwrap()
    }

    fn response(msg: ServerMessage) -> CredentialsResponse {
        match msg {
            ServerMessage::CredentialsResponse(r) => r,
            other => panic!("expected credentials-response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unpaired_connection_is_refused() {
        let h = harness().await;
        let (id, _rx) = connect(&h.gateway);
        let reply = request(&h, id, "https://example.com").await;
        assert_eq!(
            reply,
            ServerMessage::Error {
                message: "Not paired".into()
            }
        );
        assert!(!h.gateway.registry.is_paired(id));
    }

    #[tokio::test]
    async fn test_wrong_code_keeps_connection_unpaired() {
        let h = harness().await;
        let (id, _rx) = connect(&h.gateway);
        let reply = h
            .gateway
            .handle_frame(id, r#"{"type":"pair","code":"nope"}"#)
            .await;
        assert!(matches!(reply, Some(ServerMessage::PairFailed { .. })));
        assert!(!h.gateway.registry.is_paired(id));

        pair(&h, id).await;
        assert!(h.gateway.registry.is_paired(id));
    }

    #[tokio::test]
    async fn test_successful_pair_resets_attempt_budget() {
        let h = harness().await;
        let (id, _rx) = connect(&h.gateway);
        let wrong = r#"{"type":"pair","code":"nope"}"#;
        let rejected = ServerMessage::PairFailed {
            message: AppError::PairingRejected.to_string(),
        };

        for _ in 0..4 {
            assert_eq!(h.gateway.handle_frame(id, wrong).await, Some(rejected.clone()));
        }
        pair(&h, id).await;

        // A fresh budget of five, none of them rate limited
        for _ in 0..5 {
            assert_eq!(h.gateway.handle_frame(id, wrong).await, Some(rejected.clone()));
        }
    }

    #[tokio::test]
    async fn test_pairing_isolation() {
        let h = harness().await;
        let (a, _ra) = connect(&h.gateway);
        let (b, _rb) = connect(&h.gateway);

        let key_a = pair(&h, a).await;
        assert_eq!(key_a.len(), 64);
        assert!(!h.gateway.registry.is_paired(b));
        assert!(matches!(
            request(&h, b, "example.com").await,
            ServerMessage::Error { .. }
        ));

        let key_b = pair(&h, b).await;
        assert_ne!(key_a, key_b);
        assert_eq!(h.gateway.status().paired, 2);
    }

    #[tokio::test]
    async fn test_lookup_unlock_then_lock() {
        let h = harness().await;
        h.vault
            .create_credential(test_input(
                "Mail",
                "https://mail.example.com/login",
                "alice@example.com",
                "hunter2",
            ))
            .await
            .unwrap();

        let (id, _rx) = connect(&h.gateway);
        let key = pair(&h, id).await;

        let ok = response(request(&h, id, "example.com/inbox").await);
        assert!(ok.success);
        assert!(ok.encrypted);
        assert_eq!(deobfuscate(&ok.username.unwrap(), &key).unwrap(), "alice@example.com");
        assert_eq!(deobfuscate(&ok.password.unwrap(), &key).unwrap(), "hunter2");

        let miss = response(request(&h, id, "https://notexample.com").await);
        assert!(!miss.success);
        assert_eq!(miss.error_code.as_deref(), Some("NOT_FOUND"));

        h.sessions.lock().await;
        let locked = response(request(&h, id, "example.com").await);
        assert!(!locked.success);
        assert_eq!(locked.error_code.as_deref(), Some("VAULT_LOCKED"));
        assert!(locked.password.is_none());

        h.sessions.logout().await.unwrap();
        let anon = response(request(&h, id, "example.com").await);
        assert_eq!(anon.error_code.as_deref(), Some("NOT_AUTHENTICATED"));
    }

    #[tokio::test]
    async fn test_invalid_url_reply() {
        let h = harness().await;
        let (id, _rx) = connect(&h.gateway);
        pair(&h, id).await;
        let reply = response(request(&h, id, "http://exa mple.com").await);
        assert_eq!(reply.error_code.as_deref(), Some("INVALID_URL"));
    }

    #[tokio::test]
    async fn test_malformed_frames_ignored() {
        let h = harness().await;
        let (id, _rx) = connect(&h.gateway);
        assert_eq!(h.gateway.handle_frame(id, "{oops").await, None);
        assert_eq!(h.gateway.handle_frame(id, r#"{"no":"type"}"#).await, None);
        assert!(matches!(
            h.gateway.handle_frame(id, r#"{"type":"hello"}"#).await,
            Some(ServerMessage::Error { .. })
        ));
    }

    #[tokio::test]
    async fn test_pair_rate_limit() {
        let h = harness().await;
        let (id, _rx) = connect(&h.gateway);
        for _ in 0..5 {
            let reply = h
                .gateway
                .handle_frame(id, r#"{"type":"pair","code":"bad"}"#)
                .await;
            assert_eq!(
                reply,
                Some(ServerMessage::PairFailed {
                    message: "Invalid pairing code".into()
                })
            );
        }
        // Even the right code is refused while blocked
        let code = h.app_store.get_or_create_app_id().unwrap();
        let frame = serde_json::json!({"type": "pair", "code": code}).to_string();
        match h.gateway.handle_frame(id, &frame).await {
            Some(ServerMessage::PairFailed { message }) => {
                assert!(message.contains("Too many pairing attempts"))
            }
            other => panic!("expected rate-limited pair-failed, got {:?}", other),
        }

        // Other connections are unaffected
        let (other, _rx2) = connect(&h.gateway);
        pair(&h, other).await;
    }

    #[tokio::test]
    async fn test_request_rate_limit() {
        let h = harness().await;
        let (id, _rx) = connect(&h.gateway);
        pair(&h, id).await;
        for _ in 0..20 {
            let reply = response(request(&h, id, "https://nothing.example").await);
            assert_eq!(reply.error_code.as_deref(), Some("NOT_FOUND"));
        }
        let limited = response(request(&h, id, "https://nothing.example").await);
        assert_eq!(limited.error_code.as_deref(), Some("RATE_LIMITED"));
        assert_eq!(limited.wait_seconds, Some(300));
    }

    #[tokio::test]
    async fn test_disconnect_removes_state() {
        let h = harness().await;
        let (id, _rx) = connect(&h.gateway);
        pair(&h, id).await;
        request(&h, id, "example.com").await;

        h.gateway.disconnect(id);
        assert_eq!(h.gateway.status().connections, 0);
        assert!(h.gateway.limiter.is_empty());
        assert_eq!(h.gateway.handle_frame(id, r#"{"type":"pair","code":"x"}"#).await, None);
    }

    #[tokio::test]
    async fn test_old_app_id_rejected_after_migration() {
        let h = harness().await;
        // Simulate an install that still carries a legacy 48-bit App ID
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("app-state.json"),
            r#"{"appId":"a1b2c3d4e5f6"}"#,
        )
        .unwrap();
        let app_store = Arc::new(AppStore::open(dir.path()));
        let gateway = PairingGateway::new(h.vault.clone(), app_store.clone(), true);

        let new_id = app_store.get_or_create_app_id().unwrap();
        assert_eq!(new_id.len(), 64);

        let (tx, _rx) = mpsc::channel(4);
        let id = gateway.register(tx, None);
        let reply = gateway
            .handle_frame(id, r#"{"type":"pair","code":"a1b2c3d4e5f6"}"#)
            .await;
        assert!(matches!(reply, Some(ServerMessage::PairFailed { .. })));

        let frame = serde_json::json!({"type": "pair", "code": new_id}).to_string();
        assert!(matches!(
            gateway.handle_frame(id, &frame).await,
            Some(ServerMessage::PairSuccess { .. })
        ));
    }

    #[tokio::test]
    async fn test_push_reaches_paired_connections_only() {
        let h = harness().await;
        let cred = h
            .vault
            .create_credential(test_input("Mail", "https://mail.example.com", "alice", "pw"))
            .await
            .unwrap();

        let (paired, mut paired_rx) = connect(&h.gateway);
        let (_unpaired, mut unpaired_rx) = connect(&h.gateway);
        let key = pair(&h, paired).await;

        assert_eq!(h.gateway.push_credentials(cred, true).await.unwrap(), 1);
        match paired_rx.try_recv().unwrap() {
            ServerMessage::Credentials {
                url,
                password,
                auto_click,
                ..
            } => {
                assert_eq!(url, "https://mail.example.com");
                assert_eq!(deobfuscate(&password, &key).unwrap(), "pw");
                assert!(auto_click);
            }
            other => panic!("expected credentials push, got {:?}", other),
        }
        assert!(unpaired_rx.try_recv().is_err());

        h.sessions.lock().await;
        assert!(matches!(
            h.gateway.push_credentials(cred, false).await,
            Err(AppError::VaultLocked)
        ));
    }

    #[tokio::test]
    async fn test_plaintext_transport_when_disabled() {
        let h = harness().await;
        h.vault
            .create_credential(test_input("Mail", "https://mail.example.com", "alice", "pw"))
            .await
            .unwrap();
        let gateway = PairingGateway::new(h.vault.clone(), h.app_store.clone(), false);
        let (tx, _rx) = mpsc::channel(4);
        let id = gateway.register(tx, None);
        let code = h.app_store.get_or_create_app_id().unwrap();
        gateway
            .handle_frame(id, &serde_json::json!({"type":"pair","code":code}).to_string())
            .await;
        let reply = gateway
            .handle_frame(
                id,
                r#"{"type":"request-credentials","url":"mail.example.com"}"#,
            )
            .await
            .unwrap();
        let reply = response(reply);
        assert!(!reply.encrypted);
        assert_eq!(reply.password.as_deref(), Some("pw"));
    }
}
