//! Local companion gateway.
//!
//! A browser extension connects over a loopback WebSocket, pairs by
//! presenting the App ID, and then asks for credentials by page URL. The
//! protocol logic lives in [`PairingGateway`]; [`GatewayServer`] only moves
//! frames between sockets and the gateway.

mod handler;
mod limiter;
mod protocol;
mod registry;
mod server;

pub use handler::{GatewayStatus, PairingGateway};
pub use limiter::{ConnectionLimiter, LimitKind};
pub use protocol::{ClientMessage, CredentialsResponse, ServerMessage};
pub use registry::{ConnectionId, ConnectionRegistry};
pub use server::GatewayServer;
