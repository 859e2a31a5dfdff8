//! In-process transport.
//!
//! [`memory_transport`] returns a connector and the server half that accepts
//! its links. Each accepted [`MemoryPeer`] speaks the same bincode protocol as
//! the WebSocket transport, so a session cannot tell the difference.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{ConnectRequest, Connector, TransportFrame, TransportLink};
use crate::error::{ProtocolError, TransportError};
use crate::protocol::{ClientMessage, ServerMessage};

/// Create a connected connector/server pair.
pub fn memory_transport() -> (MemoryConnector, MemoryServer) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    let refuse = Arc::new(AtomicBool::new(false));
    (
        MemoryConnector {
            accept_tx,
            refuse: refuse.clone(),
        },
        MemoryServer { accept_rx, refuse },
    )
}

/// Client half: opens links to the paired [`MemoryServer`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
    refuse: Arc<AtomicBool>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, request: &ConnectRequest) -> Result<TransportLink, TransportError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed("connection refused".into()));
        }
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let peer = MemoryPeer {
            request: request.clone(),
            from_client: out_rx,
            to_client: in_tx,
        };
        self.accept_tx
            .send(peer)
            .map_err(|_| TransportError::ConnectionFailed("server gone".into()))?;
        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Server half: yields one [`MemoryPeer`] per opened link.
#[derive(Debug)]
pub struct MemoryServer {
    accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
    refuse: Arc<AtomicBool>,
}

impl MemoryServer {
    /// Wait for the next client link.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.recv().await
    }

    /// Make subsequent `open` calls fail as if the endpoint refused them.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

/// Server-side view of one client link.
#[derive(Debug)]
pub struct MemoryPeer {
    request: ConnectRequest,
    from_client: mpsc::UnboundedReceiver<Vec<u8>>,
    to_client: mpsc::UnboundedSender<TransportFrame>,
}

impl MemoryPeer {
    /// The request the client connected with (room and token).
    pub fn request(&self) -> &ConnectRequest {
        &self.request
    }

    /// Next decoded client message. `None` once the client dropped the link.
    pub async fn recv(&mut self) -> Option<Result<ClientMessage, ProtocolError>> {
        let bytes = self.from_client.recv().await?;
        Some(ClientMessage::decode(&bytes))
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Result<ClientMessage, ProtocolError>> {
        let bytes = self.from_client.try_recv().ok()?;
        Some(ClientMessage::decode(&bytes))
    }

    /// Send a message to the client. Returns `false` if the client is gone.
    pub fn send(&self, msg: &ServerMessage) -> bool {
        match msg.encode() {
            Ok(bytes) => self.send_raw(bytes),
            Err(e) => {
                log::error!("Failed to encode server message: {e}");
                false
            }
        }
    }

    /// Send arbitrary bytes, including malformed frames.
    pub fn send_raw(&self, bytes: Vec<u8>) -> bool {
        self.to_client.send(TransportFrame::Binary(bytes)).is_ok()
    }

    /// Close the link cleanly.
    pub fn close(&self) {
        let _ = self.to_client.send(TransportFrame::Closed);
    }

    /// Fail the link with a transport error.
    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self.to_client.send(TransportFrame::Failed(reason.into()));
    }

    /// A cloneable sender for scripting delayed server traffic.
    pub fn sender(&self) -> MemoryPeerSender {
        MemoryPeerSender {
            to_client: self.to_client.clone(),
        }
    }
}

/// Cloneable handle to push server messages to one client.
#[derive(Debug, Clone)]
pub struct MemoryPeerSender {
    to_client: mpsc::UnboundedSender<TransportFrame>,
}

impl MemoryPeerSender {
    pub fn send(&self, msg: &ServerMessage) -> bool {
        match msg.encode() {
            Ok(bytes) => self.to_client.send(TransportFrame::Binary(bytes)).is_ok(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ConnectRequest {
        ConnectRequest {
            endpoint: "memory://".into(),
            room_id: "room-1".into(),
            token: "secret".into(),
        }
    }

    #[tokio::test]
    async fn test_link_carries_frames_both_ways() {
        let (connector, mut server) = memory_transport();
        let mut link = connector.open(&request()).await.unwrap();
        let mut peer = server.accept().await.unwrap();
        assert_eq!(peer.request().token, "secret");

        link.outbound.send(ClientMessage::Ping.encode().unwrap()).unwrap();
        assert_eq!(peer.recv().await.unwrap().unwrap(), ClientMessage::Ping);

        assert!(peer.send(&ServerMessage::Pong));
        let frame = link.inbound.recv().await.unwrap();
        let TransportFrame::Binary(bytes) = frame else {
            panic!("expected binary frame");
        };
        assert_eq!(ServerMessage::decode(&bytes).unwrap(), ServerMessage::Pong);
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let (connector, server) = memory_transport();
        server.refuse_connections(true);
        let err = connector.open(&request()).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed(_)));
    }

    #[tokio::test]
    async fn test_peer_sees_client_drop() {
        let (connector, mut server) = memory_transport();
        let link = connector.open(&request()).await.unwrap();
        let mut peer = server.accept().await.unwrap();
        drop(link);
        assert!(peer.recv().await.is_none());
    }
}
