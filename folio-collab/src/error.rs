//! Error taxonomy for the collaboration core.
//!
//! Transport and replication failures are non-fatal: they surface as
//! `SessionEvent::Error` values and state transitions. REST failures are
//! returned to the caller. Resource-contract violations panic instead of
//! appearing here.

use thiserror::Error;

use crate::connection::ConnectionState;
use crate::model::{BlockId, NotebookId};

/// Wire codec failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

/// Failures reported by a transport implementation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Transport closed")]
    Closed,
}

/// Connection lifecycle failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Not connected (state: {0:?})")]
    NotConnected(ConnectionState),
    #[error("Connected to room {connected}, cannot join {requested}")]
    RoomMismatch { connected: String, requested: String },
    #[error("Disconnected while joining room {0}")]
    DisconnectedDuringJoin(String),
    #[error("Offline queue full, dropped update for notebook {0}")]
    OfflineQueueFull(NotebookId),
}

/// Replicated-document failures. Per-update and non-fatal.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DocumentError {
    #[error("Malformed update for notebook {notebook_id}: {reason}")]
    MalformedUpdate { notebook_id: NotebookId, reason: String },
    #[error("Failed to apply update for notebook {notebook_id}: {reason}")]
    ApplyFailed { notebook_id: NotebookId, reason: String },
    #[error("Notebook {0} is not open")]
    NotOpen(NotebookId),
    #[error("Failed to observe notebook {notebook_id}: {reason}")]
    Observe { notebook_id: NotebookId, reason: String },
    #[error("Text range {index}..{end} out of bounds for block {block_id}")]
    OutOfBounds { block_id: BlockId, index: u32, end: u32 },
    #[error("Local change to notebook {notebook_id} kept but not delivered: {source}")]
    Undelivered {
        notebook_id: NotebookId,
        source: ConnectionError,
    },
}

/// Cursor decoration adapter failure. Cosmetic only; never propagated.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Decoration error: {0}")]
pub struct DecorationError(pub String);

/// Authoritative-state (REST) failures, surfaced to the caller.
#[derive(Error, Debug)]
pub enum RestError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("Server returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Configuration resolution failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid URL in {var}: {reason}")]
    InvalidUrl { var: &'static str, reason: String },
    #[error("Invalid value for {var}: {value}")]
    InvalidNumber { var: &'static str, value: String },
}

/// Umbrella error for `Session` operations.
#[derive(Error, Debug)]
pub enum CollabError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Rest(#[from] RestError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
