use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::protocol::ServerMessage;

/// Opaque id assigned when a connection is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Per-connection record. `outbound` is the transport handle.
#[derive(Debug)]
pub struct PairedConnection {
    pub id: ConnectionId,
    pub peer: Option<SocketAddr>,
    pub outbound: mpsc::Sender<ServerMessage>,
    pub session_key: Option<String>,
    pub connected_at: DateTime<Utc>,
}

impl PairedConnection {
    pub fn is_paired(&self) -> bool {
        self.session_key.is_some()
    }
}

/// A paired connection's key and queue, captured for push delivery.
pub struct PushTarget {
    pub id: ConnectionId,
    pub session_key: String,
    pub outbound: mpsc::Sender<ServerMessage>,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    connections: RwLock<HashMap<ConnectionId, PairedConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        outbound: mpsc::Sender<ServerMessage>,
        peer: Option<SocketAddr>,
    ) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.connections.write().insert(
            id,
            PairedConnection {
                id,
                peer,
                outbound,
                session_key: None,
                connected_at: Utc::now(),
            },
        );
        debug!("Registered {} from {:?}", id, peer);
        id
    }

    pub fn remove(&self, id: ConnectionId) -> Option<PairedConnection> {
        self.connections.write().remove(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.read().contains_key(&id)
    }

    /// Mark paired with a fresh session key. False if the connection is gone.
    pub fn set_paired(&self, id: ConnectionId, session_key: String) -> bool {
        match self.connections.write().get_mut(&id) {
            Some(conn) => {
                conn.session_key = Some(session_key);
                true
            }
            None => false,
        }
    }

    /// The session key, present only once paired.
    pub fn session_key(&self, id: ConnectionId) -> Option<String> {
        self.connections
            .read()
            .get(&id)
            .and_then(|c| c.session_key.clone())
    }

    pub fn is_paired(&self, id: ConnectionId) -> bool {
        self.connections
            .read()
            .get(&id)
            .is_some_and(PairedConnection::is_paired)
    }

    pub fn push_targets(&self) -> Vec<PushTarget> {
        self.connections
            .read()
            .values()
            .filter_map(|c| {
                c.session_key.clone().map(|session_key| PushTarget {
                    id: c.id,
                    session_key,
                    outbound: c.outbound.clone(),
                })
            })
            .collect()
    }

    /// Queue a message without waiting. False if the queue is full or closed.
    pub fn try_send(target: &mpsc::Sender<ServerMessage>, id: ConnectionId, msg: ServerMessage) -> bool {
        match target.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Outbound queue full for {}, dropping message", id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// (total connections, paired connections)
    pub fn counts(&self) -> (usize, usize) {
        let connections = self.connections.read();
        let paired = connections.values().filter(|c| c.is_paired()).count();
        (connections.len(), paired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_pair_remove() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        let a = registry.register(tx.clone(), None);
        let b = registry.register(tx, None);
        assert_ne!(a, b);
        assert_eq!(registry.counts(), (2, 0));

        assert!(registry.set_paired(a, "key-a".into()));
        assert!(registry.is_paired(a));
        assert!(!registry.is_paired(b));
        assert_eq!(registry.session_key(b), None);
        assert_eq!(registry.push_targets().len(), 1);

        assert!(registry.remove(a).is_some());
        assert!(!registry.set_paired(a, "key".into()));
        assert_eq!(registry.counts(), (1, 0));
    }

    #[test]
    fn test_try_send_reports_full_queue() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        let id = registry.register(tx.clone(), None);
        let msg = ServerMessage::Error {
            message: "x".into(),
        };
        assert!(ConnectionRegistry::try_send(&tx, id, msg.clone()));
        assert!(!ConnectionRegistry::try_send(&tx, id, msg));
    }
}
