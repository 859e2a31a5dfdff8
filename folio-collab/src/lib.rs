//! # folio-collab — Real-time sync core for collaborative notebooks
//!
//! Keeps a client's view of a shared notebook room consistent: block text is
//! replicated through per-notebook CRDT documents, block metadata is mirrored
//! from the REST backend and patched by room events, and participants'
//! cursors travel as presence records.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   binary frames   ┌────────────────┐
//! │ ConnectionManager│ ◄───────────────► │  room service  │
//! │  + Outbox        │                   └────────────────┘
//! └────────┬─────────┘
//!          │ SessionEvent
//!          ▼
//! ┌──────────────────┐      ┌──────────────────┐      ┌─────────────┐
//! │     EventBus     │ ───► │ DocumentRegistry │ ───► │ Yrs Doc per │
//! └────────┬─────────┘      └──────────────────┘      │  notebook   │
//!          │                                          └──────┬──────┘
//!          ├──► BlockReconciler ◄── NotebookService (REST)   │ text observers
//!          │                                                 ▼
//!          └──► PresenceBridge ──► CursorDecorations   BufferCache (≤50)
//! ```
//!
//! Everything is owned by a [`Session`]; tearing it down with
//! [`Session::close`] releases observers, documents, buffers and the
//! transport in that order.
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded client/server messages)
//! - [`connection`] — Connection state machine and join handshake
//! - [`bus`] — Typed publish/subscribe for session events
//! - [`document`] — Per-notebook replicated documents
//! - [`reconciler`] — Block mirror and text-to-buffer propagation
//! - [`buffer`] — Bounded editor buffer cache
//! - [`presence`] — Cursor and typing awareness
//! - [`rest`] — Notebook/block REST client

pub mod buffer;
pub mod bus;
pub mod config;
pub mod connection;
pub mod document;
pub mod error;
pub mod events;
pub mod model;
pub mod outbox;
pub mod presence;
pub mod protocol;
pub mod reconciler;
pub mod rest;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use buffer::{BufferCache, EditorEngine, MemoryEngine, TextBuffer, MAX_CACHED_BUFFERS};
pub use bus::{EventBus, SubscriptionId};
pub use config::CollabConfig;
pub use connection::{ConnectionManager, ConnectionSettings, ConnectionState, JoinSignal};
pub use document::{DocumentHandle, DocumentRegistry};
pub use error::{
    CollabError, ConfigError, ConnectionError, DocumentError, ProtocolError, RestError,
    TransportError,
};
pub use events::{
    BlockEvent, DisconnectReason, DocumentEvent, ErrorEvent, ErrorKind, EventKind, NotebookEvent,
    PresenceEvent, RoomEvent, SessionEvent,
};
pub use model::{BlockId, BlockRecord, BlockType, NewBlock, NotebookId, NotebookRecord, RoomId, UserId};
pub use outbox::{Delivery, OfflineQueue, Outbox};
pub use presence::{
    CursorDecorations, CursorPosition, CursorRange, Identity, NoopDecorations, PresenceBridge,
    PresenceRecord,
};
pub use protocol::{ClientMessage, ServerMessage};
pub use reconciler::{BlockReconciler, ContentChange};
pub use rest::{HttpNotebookService, MemoryNotebookService, NotebookService};
pub use session::Session;
pub use transport::{Connector, MemoryConnector, MemoryServer, WebSocketConnector};
