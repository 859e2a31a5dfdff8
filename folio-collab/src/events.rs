//! Closed, tagged event types published on a session's event bus.
//!
//! One enum per channel (room, notebook, block, document, presence, error),
//! wrapped by [`SessionEvent`]. Subscribers register per [`EventKind`].

use serde::{Deserialize, Serialize};

use crate::model::{BlockId, BlockRecord, NotebookId, NotebookRecord, RoomId, UserId};
use crate::presence::PresenceRecord;

/// Channel key used for bus subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Room,
    Notebook,
    Block,
    Document,
    Presence,
    Error,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::Room,
        EventKind::Notebook,
        EventKind::Block,
        EventKind::Document,
        EventKind::Presence,
        EventKind::Error,
    ];
}

/// Why the transport went away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// Explicit teardown by the owning session.
    ClientRequested,
    /// The server closed the connection.
    ServerClosed,
    /// The transport failed.
    TransportError(String),
}

/// Room membership lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RoomEvent {
    /// Broadcast confirmation that a user (possibly us) joined the room.
    Joined { room_id: RoomId, user_id: Option<UserId> },
    /// A user left the room.
    Left { room_id: RoomId, user_id: UserId },
    /// Local only: the transport is gone and the session is `Disconnected`.
    Disconnected { reason: DisconnectReason },
}

/// Notebook lifecycle broadcast by the room service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NotebookEvent {
    Created(NotebookRecord),
    Updated(NotebookRecord),
    Deleted { notebook_id: NotebookId },
}

/// Block lifecycle broadcast by the room service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BlockEvent {
    Created { block: BlockRecord },
    /// Metadata only (language, type). Content travels as document updates.
    Updated { block: BlockRecord },
    Deleted { notebook_id: NotebookId, block_id: BlockId },
    Moved { notebook_id: NotebookId, block_id: BlockId, position: u32 },
}

impl BlockEvent {
    pub fn notebook_id(&self) -> NotebookId {
        match self {
            BlockEvent::Created { block } | BlockEvent::Updated { block } => block.notebook_id,
            BlockEvent::Deleted { notebook_id, .. } | BlockEvent::Moved { notebook_id, .. } => {
                *notebook_id
            }
        }
    }
}

/// Replicated-document traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DocumentEvent {
    /// Incremental update from another participant.
    Update { notebook_id: NotebookId, update: Vec<u8> },
    /// Authoritative state answering our state request (hydration).
    StateResponse { notebook_id: NotebookId, update: Vec<u8> },
}

/// Presence/awareness traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PresenceEvent {
    /// Full set of participants currently viewing a notebook.
    Snapshot { notebook_id: NotebookId, participants: Vec<PresenceRecord> },
    /// One participant's record changed.
    Updated { notebook_id: NotebookId, participant: PresenceRecord },
    /// A participant stopped viewing the notebook.
    Left { notebook_id: NotebookId, user_id: UserId },
}

/// Error category carried by [`ErrorEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Connection refused or lost.
    Transport,
    /// A frame could not be decoded.
    MalformedFrame,
    /// A replicated update could not be applied.
    Replication,
    /// Error reported by the server.
    Server,
}

/// Non-fatal error notification. Retrying is the caller's decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorEvent {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Every event a session can publish.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Room(RoomEvent),
    Notebook(NotebookEvent),
    Block(BlockEvent),
    Document(DocumentEvent),
    Presence(PresenceEvent),
    Error(ErrorEvent),
}

impl SessionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SessionEvent::Room(_) => EventKind::Room,
            SessionEvent::Notebook(_) => EventKind::Notebook,
            SessionEvent::Block(_) => EventKind::Block,
            SessionEvent::Document(_) => EventKind::Document,
            SessionEvent::Presence(_) => EventKind::Presence,
            SessionEvent::Error(_) => EventKind::Error,
        }
    }
}
