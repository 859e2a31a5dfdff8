//! Binary wire protocol between a session and the room service.
//!
//! Every WebSocket binary frame carries exactly one bincode-encoded message:
//!
//! ```text
//! client ──► server   ClientMessage { JoinRoom | LeaveRoom | DocumentUpdate
//!                                    | StateRequest | PresencePublish | Ping }
//! server ──► client   ServerMessage { JoinAck | Room | Notebook | Block
//!                                    | Document | Presence | Error | Pong }
//! ```
//!
//! Document updates carry raw yrs v1 update bytes, never full state, except
//! for the `StateResponse` that answers a `StateRequest`.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::events::{
    BlockEvent, DocumentEvent, ErrorEvent, NotebookEvent, PresenceEvent, RoomEvent, SessionEvent,
};
use crate::model::{NotebookId, RoomId};
use crate::presence::PresenceRecord;

/// Messages sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Ask to join a room. The server may answer with `JoinAck` carrying the
    /// same `request_id`, with a `Room(Joined)` broadcast, with both, or with
    /// neither.
    JoinRoom { request_id: u64, room_id: RoomId },
    LeaveRoom { room_id: RoomId },
    /// Minimal delta produced by one local transaction.
    DocumentUpdate { notebook_id: NotebookId, update: Vec<u8> },
    /// Hydration request. `state_vector` lets the server send only what is missing.
    StateRequest { notebook_id: NotebookId, state_vector: Vec<u8> },
    PresencePublish { notebook_id: NotebookId, state: PresenceRecord },
    Ping,
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Direct acknowledgment of a `JoinRoom` request.
    JoinAck { request_id: u64, room_id: RoomId },
    Room(RoomEvent),
    Notebook(NotebookEvent),
    Block(BlockEvent),
    Document(DocumentEvent),
    Presence(PresenceEvent),
    Error(ErrorEvent),
    Pong,
}

impl ServerMessage {
    /// Convert to the event published on the bus. `JoinAck` and `Pong` are
    /// consumed by the connection manager and never published.
    pub fn into_event(self) -> Option<SessionEvent> {
        match self {
            ServerMessage::Room(e) => Some(SessionEvent::Room(e)),
            ServerMessage::Notebook(e) => Some(SessionEvent::Notebook(e)),
            ServerMessage::Block(e) => Some(SessionEvent::Block(e)),
            ServerMessage::Document(e) => Some(SessionEvent::Document(e)),
            ServerMessage::Presence(e) => Some(SessionEvent::Presence(e)),
            ServerMessage::Error(e) => Some(SessionEvent::Error(e)),
            ServerMessage::JoinAck { .. } | ServerMessage::Pong => None,
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

impl ClientMessage {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl ServerMessage {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{DisconnectReason, ErrorKind};
    use crate::model::{BlockRecord, BlockType};
    use uuid::Uuid;

    #[test]
    fn test_document_update_roundtrip() {
        let notebook_id = Uuid::new_v4();
        let msg = ClientMessage::DocumentUpdate {
            notebook_id,
            update: vec![1, 2, 3, 4, 5],
        };
        let decoded = ClientMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_block_event_roundtrip() {
        let block = BlockRecord::new(Uuid::new_v4(), BlockType::Code, "python", 4);
        let msg = ServerMessage::Block(BlockEvent::Created { block: block.clone() });
        let decoded = ServerMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, ServerMessage::Block(BlockEvent::Created { block }));
    }

    #[test]
    fn test_join_ack_is_not_published() {
        let ack = ServerMessage::JoinAck {
            request_id: 7,
            room_id: "room".into(),
        };
        assert!(ack.into_event().is_none());
        assert!(ServerMessage::Pong.into_event().is_none());
    }

    #[test]
    fn test_into_event_preserves_channel() {
        let msg = ServerMessage::Error(ErrorEvent::new(ErrorKind::Server, "quota"));
        let event = msg.into_event().unwrap();
        assert_eq!(event.kind(), crate::events::EventKind::Error);

        let msg = ServerMessage::Room(RoomEvent::Disconnected {
            reason: DisconnectReason::ServerClosed,
        });
        assert_eq!(msg.into_event().unwrap().kind(), crate::events::EventKind::Room);
    }

    #[test]
    fn test_delta_size_efficient() {
        let msg = ClientMessage::DocumentUpdate {
            notebook_id: Uuid::new_v4(),
            update: vec![0u8; 50],
        };
        let encoded = msg.encode().unwrap();
        // tag + uuid + length prefix + payload
        assert!(encoded.len() < 100, "Encoded size {} too large", encoded.len());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(ServerMessage::decode(&garbage).is_err());
        assert!(ClientMessage::decode(&[]).is_err());
    }
}
