//! Transport abstraction owned by the connection manager.
//!
//! A [`Connector`] opens one [`TransportLink`] per session: an outbound queue of
//! encoded frames and an inbound stream of [`TransportFrame`]s. Implementations:
//!
//! - [`WebSocketConnector`] over tokio-tungstenite, for real deployments;
//! - [`MemoryConnector`] wired to an in-process [`MemoryServer`], for tests and
//!   embedders that host the room service themselves.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::model::RoomId;

pub mod memory;
pub mod websocket;

pub use memory::{memory_transport, MemoryConnector, MemoryPeer, MemoryPeerSender, MemoryServer};
pub use websocket::WebSocketConnector;

/// Inbound unit delivered by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportFrame {
    Binary(Vec<u8>),
    /// Clean close by the remote end.
    Closed,
    /// The connection failed.
    Failed(String),
}

/// Parameters of one connection attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectRequest {
    /// Transport endpoint, e.g. `wss://collab.example.com/ws`.
    pub endpoint: String,
    pub room_id: RoomId,
    /// Bearer token attached once, at connection time.
    pub token: String,
}

/// An open connection. Dropping `outbound` closes the link.
#[derive(Debug)]
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<Vec<u8>>,
    pub inbound: mpsc::UnboundedReceiver<TransportFrame>,
}

/// Opens transport links.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Resolve once the transport reports open, or fail on an establishment
    /// error.
    async fn open(&self, request: &ConnectRequest) -> Result<TransportLink, TransportError>;
}
