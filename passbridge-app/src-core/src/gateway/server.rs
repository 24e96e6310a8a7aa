//! Loopback WebSocket listener for the companion extension.
//!
//! Each accepted connection gets its own task: the read half feeds frames
//! to [`PairingGateway::handle_frame`] one at a time, and a writer task
//! drains the connection's outbound queue (replies and pushes alike).

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::handler::PairingGateway;
use super::protocol::ServerMessage;
use crate::error::{AppError, Result};

/// Per-connection outbound queue depth.
const OUTBOUND_QUEUE: usize = 64;

pub struct GatewayServer {
    gateway: Arc<PairingGateway>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl GatewayServer {
    /// Bind the listener. Only loopback addresses are accepted.
    pub async fn bind(gateway: Arc<PairingGateway>, addr: SocketAddr) -> Result<Self> {
        if !addr.ip().is_loopback() {
            return Err(AppError::InvalidInput(format!(
                "gateway must bind to a loopback address, got {}",
                addr.ip()
            )));
        }

        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        gateway.set_listening_port(Some(local_addr.port()));
        info!("Companion gateway listening on ws://{}", local_addr);

        Ok(Self {
            gateway,
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Accept connections until the task is dropped.
    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    if !peer.ip().is_loopback() {
                        warn!("Refusing non-loopback connection from {}", peer);
                        continue;
                    }
                    let gateway = self.gateway.clone();
                    tokio::spawn(async move {
                        handle_connection(gateway, stream, peer).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept companion connection: {}", e);
                }
            }
        }
    }
}

impl Drop for GatewayServer {
    fn drop(&mut self) {
        self.gateway.set_listening_port(None);
    }
}

async fn handle_connection(gateway: Arc<PairingGateway>, stream: TcpStream, peer: SocketAddr) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("WebSocket handshake with {} failed: {}", peer, e);
            return;
        }
    };

    let (mut sink, mut source) = ws.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(OUTBOUND_QUEUE);
    let id = gateway.register(tx.clone(), Some(peer));
    info!("Companion connected: {} ({})", id, peer);

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to encode frame for {}: {}", id, e);
                    continue;
                }
            };
            if sink.send(Message::text(json)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if let Some(reply) = gateway.handle_frame(id, text.as_str()).await {
                    if tx.send(reply).await.is_err() {
                        break;
                    }
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(_)) => debug!("Ignoring binary frame from {}", id),
            // ping/pong are answered by tungstenite
            Ok(_) => {}
            Err(e) => {
                debug!("{} read error: {}", id, e);
                break;
            }
        }
    }

    // Removing the registry entry drops its sender; with ours gone the writer ends
    gateway.disconnect(id);
    drop(tx);
    let _ = writer.await;
}
