//! Records shared between the REST backend, the wire protocol and the
//! reconciled client mirror.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Notebook identifier (one replicated document per notebook).
pub type NotebookId = Uuid;

/// Content block identifier (one text buffer per block).
pub type BlockId = Uuid;

/// Collaboration room identifier, as issued by the room service.
pub type RoomId = String;

/// Stable user identifier from the auth collaborator.
pub type UserId = String;

/// Kind of content a block holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Code,
    Markdown,
    Output,
}

/// One content block of a notebook.
///
/// The server holds the authoritative copy; clients keep a reconciled mirror
/// ordered by `position`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub id: BlockId,
    pub notebook_id: NotebookId,
    pub block_type: BlockType,
    pub language: String,
    /// Dense, unique ordinal within the notebook.
    pub position: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BlockRecord {
    pub fn new(
        notebook_id: NotebookId,
        block_type: BlockType,
        language: impl Into<String>,
        position: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            notebook_id,
            block_type,
            language: language.into(),
            position,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Notebook metadata as returned by the REST backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotebookRecord {
    pub id: NotebookId,
    pub room_id: RoomId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Payload for creating a block through the REST backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBlock {
    pub block_type: BlockType,
    pub language: String,
    /// Requested position; `None` appends.
    pub position: Option<u32>,
}

impl NewBlock {
    pub fn code(language: impl Into<String>) -> Self {
        Self {
            block_type: BlockType::Code,
            language: language.into(),
            position: None,
        }
    }

    pub fn markdown() -> Self {
        Self {
            block_type: BlockType::Markdown,
            language: "markdown".to_string(),
            position: None,
        }
    }

    pub fn at(mut self, position: u32) -> Self {
        self.position = Some(position);
        self
    }
}
