//! Ordered block mirrors and per-block content observers.
//!
//! Each loaded notebook keeps a mirror of its `BlockRecord`s in server order.
//! Block events from the room keep it current; a move discards local order and
//! re-fetches the list from the [`NotebookService`], one round trip per move.
//!
//! Content observers watch a block's replicated text and emit
//! [`ContentChange`]s, which the session applies to the buffer cache.

use std::collections::HashMap;

use tokio::sync::mpsc;
use yrs::{GetString, Observable, Subscription};

use crate::buffer::BufferCache;
use crate::document::DocumentRegistry;
use crate::error::RestError;
use crate::events::BlockEvent;
use crate::model::{BlockId, BlockRecord, NotebookId};
use crate::rest::NotebookService;

/// A block's replicated text changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentChange {
    pub notebook_id: NotebookId,
    pub block_id: BlockId,
    pub content: String,
}

struct ContentObserver {
    notebook_id: NotebookId,
    _subscription: Subscription,
}

pub struct BlockReconciler {
    mirrors: HashMap<NotebookId, Vec<BlockRecord>>,
    observers: HashMap<BlockId, ContentObserver>,
    changes: mpsc::UnboundedSender<ContentChange>,
}

impl BlockReconciler {
    /// Create a reconciler and the receiving end of its content changes.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ContentChange>) {
        let (changes, rx) = mpsc::unbounded_channel();
        (
            Self {
                mirrors: HashMap::new(),
                observers: HashMap::new(),
                changes,
            },
            rx,
        )
    }

    /// Fetch the authoritative block list and replace the mirror with it.
    pub async fn load(
        &mut self,
        notebook_id: NotebookId,
        service: &dyn NotebookService,
    ) -> Result<&[BlockRecord], RestError> {
        let blocks = service.list_blocks(notebook_id).await?;
        log::debug!("Loaded {} blocks for notebook {notebook_id}", blocks.len());
        self.set_mirror(notebook_id, blocks);
        Ok(self.blocks(notebook_id))
    }

    /// Replace a notebook's mirror, ordering it by position.
    pub fn set_mirror(&mut self, notebook_id: NotebookId, mut blocks: Vec<BlockRecord>) {
        blocks.sort_by_key(|b| b.position);
        self.mirrors.insert(notebook_id, blocks);
    }

    /// Mirrored blocks in order. Empty if the notebook is not loaded.
    pub fn blocks(&self, notebook_id: NotebookId) -> &[BlockRecord] {
        self.mirrors
            .get(&notebook_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn block(&self, notebook_id: NotebookId, block_id: BlockId) -> Option<&BlockRecord> {
        self.blocks(notebook_id).iter().find(|b| b.id == block_id)
    }

    pub fn is_loaded(&self, notebook_id: NotebookId) -> bool {
        self.mirrors.contains_key(&notebook_id)
    }

    /// Insert or replace a record, keeping order and unique positions.
    pub fn upsert(&mut self, block: BlockRecord) {
        let blocks = self.mirrors.entry(block.notebook_id).or_default();
        blocks.retain(|b| b.id != block.id);
        let index = blocks.partition_point(|b| b.position < block.position);
        blocks.insert(index, block);
        for i in index + 1..blocks.len() {
            if blocks[i].position <= blocks[i - 1].position {
                blocks[i].position = blocks[i - 1].position + 1;
            }
        }
    }

    /// Remove a record and close the gap it leaves in the positions.
    /// Returns whether it was mirrored.
    pub fn remove(&mut self, notebook_id: NotebookId, block_id: BlockId) -> bool {
        let Some(blocks) = self.mirrors.get_mut(&notebook_id) else {
            return false;
        };
        let Some(index) = blocks.iter().position(|b| b.id == block_id) else {
            return false;
        };
        let removed = blocks.remove(index);
        for block in &mut blocks[index..] {
            if block.position > removed.position {
                block.position -= 1;
            }
        }
        true
    }

    // ───────────────────────────────────────────────────────────────
    // Content observers
    // ───────────────────────────────────────────────────────────────

    /// Observe a block's replicated text. No-op if already observed or the
    /// notebook's document is not open.
    pub fn attach_observer(
        &mut self,
        registry: &DocumentRegistry,
        notebook_id: NotebookId,
        block_id: BlockId,
    ) -> bool {
        if self.observers.contains_key(&block_id) {
            return false;
        }
        let Some(handle) = registry.get(notebook_id) else {
            return false;
        };

        let changes = self.changes.clone();
        let subscription = handle.text_ref(block_id).observe(move |txn, event| {
            let content = event.target().get_string(txn);
            let _ = changes.send(ContentChange {
                notebook_id,
                block_id,
                content,
            });
        });
        self.observers.insert(
            block_id,
            ContentObserver {
                notebook_id,
                _subscription: subscription,
            },
        );
        log::trace!("Observing block {block_id}");
        true
    }

    /// Observe every mirrored block of a notebook. Returns how many were new.
    pub fn attach_all(&mut self, registry: &DocumentRegistry, notebook_id: NotebookId) -> usize {
        let ids: Vec<BlockId> = self.blocks(notebook_id).iter().map(|b| b.id).collect();
        ids.into_iter()
            .filter(|id| self.attach_observer(registry, notebook_id, *id))
            .count()
    }

    pub fn detach_observer(&mut self, block_id: BlockId) -> bool {
        self.observers.remove(&block_id).is_some()
    }

    pub fn is_observed(&self, block_id: BlockId) -> bool {
        self.observers.contains_key(&block_id)
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Drop a notebook's observers and mirror. Returns the detached block ids.
    pub fn detach_notebook(&mut self, notebook_id: NotebookId) -> Vec<BlockId> {
        let detached: Vec<BlockId> = self
            .observers
            .iter()
            .filter(|(_, o)| o.notebook_id == notebook_id)
            .map(|(id, _)| *id)
            .collect();
        for id in &detached {
            self.observers.remove(id);
        }
        self.mirrors.remove(&notebook_id);
        detached
    }

    /// Drop every observer and mirror.
    pub fn detach_all(&mut self) {
        self.observers.clear();
        self.mirrors.clear();
    }

    // ───────────────────────────────────────────────────────────────
    // Block events
    // ───────────────────────────────────────────────────────────────

    /// Apply a block event from the room.
    ///
    /// Events for notebooks that are not loaded are ignored. Only `Moved`
    /// suspends (to re-fetch) and only it can fail.
    pub async fn handle_event(
        &mut self,
        event: &BlockEvent,
        registry: &DocumentRegistry,
        cache: &mut BufferCache,
        service: &dyn NotebookService,
    ) -> Result<(), RestError> {
        let notebook_id = event.notebook_id();
        if !self.is_loaded(notebook_id) {
            log::debug!("Ignoring block event for unloaded notebook {notebook_id}");
            return Ok(());
        }

        match event {
            BlockEvent::Created { block } => {
                self.upsert(block.clone());
                if let Some(content) = registry.block_text(notebook_id, block.id) {
                    self.attach_observer(registry, notebook_id, block.id);
                    cache.update_content(block.id, &content);
                }
            }
            BlockEvent::Updated { block } => {
                self.upsert(block.clone());
                cache.set_language(block.id, &block.language);
            }
            BlockEvent::Deleted { block_id, .. } => {
                self.remove(notebook_id, *block_id);
                self.detach_observer(*block_id);
                cache.dispose(*block_id);
            }
            BlockEvent::Moved {
                block_id, position, ..
            } => {
                log::debug!("Block {block_id} moved to {position}, re-fetching order");
                self.load(notebook_id, service).await?;
                if registry.is_open(notebook_id) {
                    self.attach_all(registry, notebook_id);
                }
            }
        }
        Ok(())
    }
}
