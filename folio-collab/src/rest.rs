//! Authoritative notebook and block metadata over REST.
//!
//! The room service's REST API is the only source of block ordering and
//! metadata; the realtime channel carries deltas on top of it.
//!
//! | Operation        | Method | Path                                     |
//! |------------------|--------|------------------------------------------|
//! | list notebooks   | GET    | `rooms/{room}/notebooks`                 |
//! | create notebook  | POST   | `rooms/{room}/notebooks`                 |
//! | rename notebook  | PATCH  | `notebooks/{id}`                         |
//! | delete notebook  | DELETE | `notebooks/{id}`                         |
//! | list blocks      | GET    | `notebooks/{id}/blocks`                  |
//! | create block     | POST   | `notebooks/{id}/blocks`                  |
//! | delete block     | DELETE | `notebooks/{id}/blocks/{block}`          |
//! | reposition block | PATCH  | `notebooks/{id}/blocks/{block}/position` |

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use url::Url;
use uuid::Uuid;

use crate::error::RestError;
use crate::model::{BlockId, BlockRecord, NewBlock, NotebookId, NotebookRecord};

/// Notebook and block operations against the room service.
#[async_trait]
pub trait NotebookService: Send + Sync {
    async fn list_notebooks(&self, room_id: &str) -> Result<Vec<NotebookRecord>, RestError>;
    async fn create_notebook(&self, room_id: &str, name: &str) -> Result<NotebookRecord, RestError>;
    async fn rename_notebook(
        &self,
        notebook_id: NotebookId,
        name: &str,
    ) -> Result<NotebookRecord, RestError>;
    async fn delete_notebook(&self, notebook_id: NotebookId) -> Result<(), RestError>;

    /// Blocks in server order.
    async fn list_blocks(&self, notebook_id: NotebookId) -> Result<Vec<BlockRecord>, RestError>;
    async fn create_block(
        &self,
        notebook_id: NotebookId,
        block: &NewBlock,
    ) -> Result<BlockRecord, RestError>;
    async fn delete_block(&self, notebook_id: NotebookId, block_id: BlockId)
        -> Result<(), RestError>;
    async fn move_block(
        &self,
        notebook_id: NotebookId,
        block_id: BlockId,
        position: u32,
    ) -> Result<(), RestError>;
}

// ───────────────────────────────────────────────────────────────────
// HTTP
// ───────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct NameBody<'a> {
    name: &'a str,
}

#[derive(Serialize)]
struct PositionBody {
    position: u32,
}

/// JSON-over-HTTPS client with bearer authentication.
#[derive(Debug, Clone)]
pub struct HttpNotebookService {
    base_url: Url,
    token: String,
    client: reqwest::Client,
}

impl HttpNotebookService {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, RestError> {
        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(RestError::Url(url::ParseError::RelativeUrlWithCannotBeABaseBase));
        }
        Ok(Self {
            base_url,
            token: token.into(),
            client: reqwest::Client::new(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, RestError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let path = resp.url().path().to_string();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(RestError::NotFound(path));
        }
        let body = resp.text().await.unwrap_or_default();
        log::warn!("{path} failed: {status} {body}");
        Err(RestError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T, RestError> {
        let resp = self.client.get(url).bearer_auth(&self.token).send().await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    async fn send_json<B: Serialize + ?Sized, T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        url: Url,
        body: &B,
    ) -> Result<T, RestError> {
        let resp = self
            .client
            .request(method, url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    async fn delete(&self, url: Url) -> Result<(), RestError> {
        let resp = self.client.delete(url).bearer_auth(&self.token).send().await?;
        Self::check(resp).await?;
        Ok(())
    }
}

#[async_trait]
impl NotebookService for HttpNotebookService {
    async fn list_notebooks(&self, room_id: &str) -> Result<Vec<NotebookRecord>, RestError> {
        self.get_json(self.endpoint(&["rooms", room_id, "notebooks"]))
            .await
    }

    async fn create_notebook(&self, room_id: &str, name: &str) -> Result<NotebookRecord, RestError> {
        let url = self.endpoint(&["rooms", room_id, "notebooks"]);
        self.send_json(reqwest::Method::POST, url, &NameBody { name })
            .await
    }

    async fn rename_notebook(
        &self,
        notebook_id: NotebookId,
        name: &str,
    ) -> Result<NotebookRecord, RestError> {
        let url = self.endpoint(&["notebooks", &notebook_id.to_string()]);
        self.send_json(reqwest::Method::PATCH, url, &NameBody { name })
            .await
    }

    async fn delete_notebook(&self, notebook_id: NotebookId) -> Result<(), RestError> {
        self.delete(self.endpoint(&["notebooks", &notebook_id.to_string()]))
            .await
    }

    async fn list_blocks(&self, notebook_id: NotebookId) -> Result<Vec<BlockRecord>, RestError> {
        let mut blocks: Vec<BlockRecord> = self
            .get_json(self.endpoint(&["notebooks", &notebook_id.to_string(), "blocks"]))
            .await?;
        blocks.sort_by_key(|b| b.position);
        Ok(blocks)
    }

    async fn create_block(
        &self,
        notebook_id: NotebookId,
        block: &NewBlock,
    ) -> Result<BlockRecord, RestError> {
        let url = self.endpoint(&["notebooks", &notebook_id.to_string(), "blocks"]);
        self.send_json(reqwest::Method::POST, url, block).await
    }

    async fn delete_block(
        &self,
        notebook_id: NotebookId,
        block_id: BlockId,
    ) -> Result<(), RestError> {
        self.delete(self.endpoint(&[
            "notebooks",
            &notebook_id.to_string(),
            "blocks",
            &block_id.to_string(),
        ]))
        .await
    }

    async fn move_block(
        &self,
        notebook_id: NotebookId,
        block_id: BlockId,
        position: u32,
    ) -> Result<(), RestError> {
        let url = self.endpoint(&[
            "notebooks",
            &notebook_id.to_string(),
            "blocks",
            &block_id.to_string(),
            "position",
        ]);
        let resp = self
            .client
            .patch(url)
            .bearer_auth(&self.token)
            .json(&PositionBody { position })
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────────────
// In-memory
// ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryState {
    notebooks: Vec<NotebookRecord>,
    /// Blocks per notebook, in order. Positions always equal indices.
    blocks: HashMap<NotebookId, Vec<BlockRecord>>,
}

/// In-process room service state, for tests and offline embedding.
#[derive(Default)]
pub struct MemoryNotebookService {
    state: Mutex<MemoryState>,
    list_block_calls: AtomicUsize,
}

fn renumber(blocks: &mut [BlockRecord]) {
    for (i, block) in blocks.iter_mut().enumerate() {
        block.position = i as u32;
    }
}

impl MemoryNotebookService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a notebook directly.
    pub fn seed_notebook(&self, room_id: &str, name: &str) -> NotebookRecord {
        let now = Utc::now();
        let record = NotebookRecord {
            id: Uuid::new_v4(),
            room_id: room_id.to_string(),
            name: name.to_string(),
            created_at: now,
            updated_at: now,
        };
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.notebooks.push(record.clone());
        state.blocks.entry(record.id).or_default();
        record
    }

    /// Add a block directly, honoring `block.position`.
    pub fn seed_block(&self, block: BlockRecord) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let blocks = state.blocks.entry(block.notebook_id).or_default();
        let index = (block.position as usize).min(blocks.len());
        blocks.insert(index, block);
        renumber(blocks);
    }

    /// Current server order, without counting as a list call.
    pub fn blocks(&self, notebook_id: NotebookId) -> Vec<BlockRecord> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.blocks.get(&notebook_id).cloned().unwrap_or_default()
    }

    /// How many times `list_blocks` was called.
    pub fn list_block_calls(&self) -> usize {
        self.list_block_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotebookService for MemoryNotebookService {
    async fn list_notebooks(&self, room_id: &str) -> Result<Vec<NotebookRecord>, RestError> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(state
            .notebooks
            .iter()
            .filter(|n| n.room_id == room_id)
            .cloned()
            .collect())
    }

    async fn create_notebook(&self, room_id: &str, name: &str) -> Result<NotebookRecord, RestError> {
        Ok(self.seed_notebook(room_id, name))
    }

    async fn rename_notebook(
        &self,
        notebook_id: NotebookId,
        name: &str,
    ) -> Result<NotebookRecord, RestError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let notebook = state
            .notebooks
            .iter_mut()
            .find(|n| n.id == notebook_id)
            .ok_or_else(|| RestError::NotFound(format!("notebook {notebook_id}")))?;
        notebook.name = name.to_string();
        notebook.updated_at = Utc::now();
        Ok(notebook.clone())
    }

    async fn delete_notebook(&self, notebook_id: NotebookId) -> Result<(), RestError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let before = state.notebooks.len();
        state.notebooks.retain(|n| n.id != notebook_id);
        state.blocks.remove(&notebook_id);
        if state.notebooks.len() == before {
            return Err(RestError::NotFound(format!("notebook {notebook_id}")));
        }
        Ok(())
    }

    async fn list_blocks(&self, notebook_id: NotebookId) -> Result<Vec<BlockRecord>, RestError> {
        self.list_block_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .blocks
            .get(&notebook_id)
            .cloned()
            .ok_or_else(|| RestError::NotFound(format!("notebook {notebook_id}")))
    }

    async fn create_block(
        &self,
        notebook_id: NotebookId,
        block: &NewBlock,
    ) -> Result<BlockRecord, RestError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let blocks = state
            .blocks
            .get_mut(&notebook_id)
            .ok_or_else(|| RestError::NotFound(format!("notebook {notebook_id}")))?;
        let index = block
            .position
            .map_or(blocks.len(), |p| (p as usize).min(blocks.len()));
        let record = BlockRecord::new(notebook_id, block.block_type, &block.language, index as u32);
        blocks.insert(index, record.clone());
        renumber(blocks);
        Ok(record)
    }

    async fn delete_block(
        &self,
        notebook_id: NotebookId,
        block_id: BlockId,
    ) -> Result<(), RestError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let blocks = state
            .blocks
            .get_mut(&notebook_id)
            .ok_or_else(|| RestError::NotFound(format!("notebook {notebook_id}")))?;
        let index = blocks
            .iter()
            .position(|b| b.id == block_id)
            .ok_or_else(|| RestError::NotFound(format!("block {block_id}")))?;
        blocks.remove(index);
        renumber(blocks);
        Ok(())
    }

    async fn move_block(
        &self,
        notebook_id: NotebookId,
        block_id: BlockId,
        position: u32,
    ) -> Result<(), RestError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let blocks = state
            .blocks
            .get_mut(&notebook_id)
            .ok_or_else(|| RestError::NotFound(format!("notebook {notebook_id}")))?;
        let index = blocks
            .iter()
            .position(|b| b.id == block_id)
            .ok_or_else(|| RestError::NotFound(format!("block {block_id}")))?;
        let mut block = blocks.remove(index);
        block.updated_at = Utc::now();
        let target = (position as usize).min(blocks.len());
        blocks.insert(target, block);
        renumber(blocks);
        Ok(())
    }
}
