//! Replicated notebook documents.
//!
//! One [`yrs::Doc`] per open notebook, holding one root text per block
//! (`block:<uuid>`). Every local transaction's v1 delta is forwarded through
//! the [`Outbox`]; updates applied from the network are fenced by an
//! `applying_remote` flag so they are never echoed back.
//!
//! A delta the outbox can neither send nor queue fails the edit that produced
//! it and marks the document for a full-state push after the next join.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Doc, GetString, ReadTxn, StateVector, Subscription, Text, TextRef, Transact, TransactionMut,
    Update,
};

use crate::error::{ConnectionError, DocumentError};
use crate::model::{BlockId, NotebookId};
use crate::outbox::Outbox;
use crate::protocol::ClientMessage;

/// Root text name for a block.
pub fn block_text_name(block_id: BlockId) -> String {
    format!("block:{block_id}")
}

/// An open notebook's replicated document.
pub struct DocumentHandle {
    notebook_id: NotebookId,
    doc: Doc,
    applying_remote: Arc<AtomicBool>,
    /// Outbox failure for the local transaction being committed.
    undelivered: Arc<Mutex<Option<ConnectionError>>>,
    /// Some local delta was lost; full state must be pushed on rejoin.
    needs_resync: Arc<AtomicBool>,
    _updates: Subscription,
}

impl std::fmt::Debug for DocumentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentHandle")
            .field("notebook_id", &self.notebook_id)
            .field("client_id", &self.doc.client_id())
            .finish()
    }
}

impl DocumentHandle {
    fn new(notebook_id: NotebookId, outbox: Outbox) -> Result<Self, DocumentError> {
        let doc = Doc::new();
        let applying_remote = Arc::new(AtomicBool::new(false));
        let guard = applying_remote.clone();
        let undelivered = Arc::new(Mutex::new(None));
        let needs_resync = Arc::new(AtomicBool::new(false));
        let failure = undelivered.clone();
        let resync = needs_resync.clone();

        let subscription = doc
            .observe_update_v1(move |_, event| {
                if guard.load(Ordering::SeqCst) {
                    return;
                }
                log::trace!(
                    "Local update for notebook {notebook_id} ({} bytes)",
                    event.update.len()
                );
                let msg = ClientMessage::DocumentUpdate {
                    notebook_id,
                    update: event.update.clone(),
                };
                if let Err(e) = outbox.send(msg) {
                    log::warn!("Local update for notebook {notebook_id} not delivered: {e}");
                    resync.store(true, Ordering::SeqCst);
                    *failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(e);
                }
            })
            .map_err(|e| DocumentError::Observe {
                notebook_id,
                reason: format!("{e:?}"),
            })?;

        Ok(Self {
            notebook_id,
            doc,
            applying_remote,
            undelivered,
            needs_resync,
            _updates: subscription,
        })
    }

    pub fn notebook_id(&self) -> NotebookId {
        self.notebook_id
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Shared text of a block. Must not be called from inside an observer.
    pub fn text_ref(&self, block_id: BlockId) -> TextRef {
        self.doc.get_or_insert_text(block_text_name(block_id).as_str())
    }

    /// Current text of a block (empty if never written).
    pub fn block_text(&self, block_id: BlockId) -> String {
        let text = self.text_ref(block_id);
        let txn = self.doc.transact();
        text.get_string(&txn)
    }

    /// Encoded state vector, sent with state requests.
    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Full document state as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    /// Whether a local delta was lost and not yet re-sent as full state.
    pub fn needs_resync(&self) -> bool {
        self.needs_resync.load(Ordering::SeqCst)
    }

    fn apply_remote(&self, bytes: &[u8]) -> Result<(), DocumentError> {
        let update = Update::decode_v1(bytes).map_err(|e| DocumentError::MalformedUpdate {
            notebook_id: self.notebook_id,
            reason: e.to_string(),
        })?;

        self.applying_remote.store(true, Ordering::SeqCst);
        let result = {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
        };
        self.applying_remote.store(false, Ordering::SeqCst);

        result.map_err(|e| DocumentError::ApplyFailed {
            notebook_id: self.notebook_id,
            reason: e.to_string(),
        })
    }

    /// Run one local transaction. The change stays applied locally, but the
    /// call fails when its delta could not be sent or queued.
    fn edit_local<R>(
        &self,
        edit: impl FnOnce(&mut TransactionMut<'_>) -> Result<R, DocumentError>,
    ) -> Result<R, DocumentError> {
        let slot = || self.undelivered.lock().unwrap_or_else(PoisonError::into_inner).take();
        let _ = slot();
        let result = {
            let mut txn = self.doc.transact_mut();
            edit(&mut txn)?
        };
        match slot() {
            Some(source) => Err(DocumentError::Undelivered {
                notebook_id: self.notebook_id,
                source,
            }),
            None => Ok(result),
        }
    }

    /// Replace a block's text with the smallest single splice.
    fn splice_to(&self, block_id: BlockId, content: &str) -> Result<bool, DocumentError> {
        let text = self.text_ref(block_id);
        self.edit_local(|txn| {
            let current = text.get_string(&*txn);
            let Some(splice) = Splice::between(&current, content) else {
                return Ok(false);
            };
            if splice.delete_len > 0 {
                text.remove_range(txn, splice.start, splice.delete_len);
            }
            if !splice.insert.is_empty() {
                text.insert(txn, splice.start, splice.insert);
            }
            Ok(true)
        })
    }

    fn check_range(
        &self,
        block_id: BlockId,
        current: &str,
        index: u32,
        len: u32,
    ) -> Result<(), DocumentError> {
        let end = index.saturating_add(len);
        let in_bounds = (end as usize) <= current.len()
            && current.is_char_boundary(index as usize)
            && current.is_char_boundary(end as usize);
        if in_bounds {
            Ok(())
        } else {
            Err(DocumentError::OutOfBounds {
                block_id,
                index,
                end,
            })
        }
    }
}

/// Byte-offset splice turning one string into another.
#[derive(Debug, PartialEq, Eq)]
struct Splice<'a> {
    start: u32,
    delete_len: u32,
    insert: &'a str,
}

impl<'a> Splice<'a> {
    /// Common prefix/suffix diff, aligned to char boundaries. `None` when equal.
    fn between(current: &str, target: &'a str) -> Option<Self> {
        if current == target {
            return None;
        }
        let prefix: usize = current
            .chars()
            .zip(target.chars())
            .take_while(|(a, b)| a == b)
            .map(|(a, _)| a.len_utf8())
            .sum();
        let suffix: usize = current[prefix..]
            .chars()
            .rev()
            .zip(target[prefix..].chars().rev())
            .take_while(|(a, b)| a == b)
            .map(|(a, _)| a.len_utf8())
            .sum();

        Some(Self {
            start: prefix as u32,
            delete_len: (current.len() - suffix - prefix) as u32,
            insert: &target[prefix..target.len() - suffix],
        })
    }
}

/// Open documents keyed by notebook. At most one handle per notebook.
pub struct DocumentRegistry {
    outbox: Outbox,
    docs: HashMap<NotebookId, DocumentHandle>,
}

impl DocumentRegistry {
    pub fn new(outbox: Outbox) -> Self {
        Self {
            outbox,
            docs: HashMap::new(),
        }
    }

    /// Open a notebook's document, or return the one already open.
    ///
    /// A new document asks the server for its state. While not joined the
    /// request is dropped and re-issued by [`request_state_all`](Self::request_state_all)
    /// after the next join.
    pub fn open(&mut self, notebook_id: NotebookId) -> Result<&DocumentHandle, DocumentError> {
        if !self.docs.contains_key(&notebook_id) {
            let handle = DocumentHandle::new(notebook_id, self.outbox.clone())?;
            log::info!("Opened document for notebook {notebook_id}");
            self.send_state_request(&handle);
            self.docs.insert(notebook_id, handle);
        }
        self.docs
            .get(&notebook_id)
            .ok_or(DocumentError::NotOpen(notebook_id))
    }

    fn send_state_request(&self, handle: &DocumentHandle) {
        let msg = ClientMessage::StateRequest {
            notebook_id: handle.notebook_id,
            state_vector: handle.state_vector(),
        };
        match self.outbox.send(msg) {
            Ok(delivery) => log::debug!(
                "State request for notebook {}: {delivery:?}",
                handle.notebook_id
            ),
            Err(e) => log::warn!("State request failed: {e}"),
        }
    }

    /// Re-request state for every open notebook, e.g. after a rejoin.
    pub fn request_state_all(&self) -> usize {
        for handle in self.docs.values() {
            self.send_state_request(handle);
        }
        self.docs.len()
    }

    /// Push the full state of every document that lost a local delta. Call
    /// once joined. Returns how many documents were pushed.
    pub fn resync_undelivered(&self) -> usize {
        let mut pushed = 0;
        for handle in self.docs.values() {
            if !handle.needs_resync.swap(false, Ordering::SeqCst) {
                continue;
            }
            let msg = ClientMessage::DocumentUpdate {
                notebook_id: handle.notebook_id,
                update: handle.encode_state(),
            };
            match self.outbox.send(msg) {
                Ok(delivery) => {
                    log::info!(
                        "Re-sent full state for notebook {}: {delivery:?}",
                        handle.notebook_id
                    );
                    pushed += 1;
                }
                Err(e) => {
                    log::warn!("Full-state push failed: {e}");
                    handle.needs_resync.store(true, Ordering::SeqCst);
                }
            }
        }
        pushed
    }

    pub fn get(&self, notebook_id: NotebookId) -> Option<&DocumentHandle> {
        self.docs.get(&notebook_id)
    }

    pub fn is_open(&self, notebook_id: NotebookId) -> bool {
        self.docs.contains_key(&notebook_id)
    }

    pub fn open_notebooks(&self) -> Vec<NotebookId> {
        self.docs.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Apply an update (incremental or hydration) received from the network.
    ///
    /// Returns `Ok(false)` when the notebook is not open; the update is
    /// dropped. Never produces outbound traffic.
    pub fn apply_remote_update(
        &self,
        notebook_id: NotebookId,
        bytes: &[u8],
    ) -> Result<bool, DocumentError> {
        let Some(handle) = self.docs.get(&notebook_id) else {
            log::debug!("Dropping update for unopened notebook {notebook_id}");
            return Ok(false);
        };
        handle.apply_remote(bytes)?;
        log::trace!("Applied remote update to {notebook_id} ({} bytes)", bytes.len());
        Ok(true)
    }

    fn handle(&self, notebook_id: NotebookId) -> Result<&DocumentHandle, DocumentError> {
        self.docs
            .get(&notebook_id)
            .ok_or(DocumentError::NotOpen(notebook_id))
    }

    /// Current text of a block, if the notebook is open.
    pub fn block_text(&self, notebook_id: NotebookId, block_id: BlockId) -> Option<String> {
        self.docs.get(&notebook_id).map(|h| h.block_text(block_id))
    }

    /// Replace a block's text. Emits one minimal delta, or nothing when the
    /// text is unchanged. Returns whether anything changed.
    pub fn set_block_content(
        &self,
        notebook_id: NotebookId,
        block_id: BlockId,
        content: &str,
    ) -> Result<bool, DocumentError> {
        self.handle(notebook_id)?.splice_to(block_id, content)
    }

    /// Insert `text` at byte offset `index` of a block.
    pub fn insert_text(
        &self,
        notebook_id: NotebookId,
        block_id: BlockId,
        index: u32,
        text: &str,
    ) -> Result<(), DocumentError> {
        let handle = self.handle(notebook_id)?;
        let block = handle.text_ref(block_id);
        handle.edit_local(|txn| {
            let current = block.get_string(&*txn);
            handle.check_range(block_id, &current, index, 0)?;
            if !text.is_empty() {
                block.insert(txn, index, text);
            }
            Ok(())
        })
    }

    /// Remove `len` bytes starting at byte offset `index` of a block.
    pub fn remove_text(
        &self,
        notebook_id: NotebookId,
        block_id: BlockId,
        index: u32,
        len: u32,
    ) -> Result<(), DocumentError> {
        let handle = self.handle(notebook_id)?;
        let block = handle.text_ref(block_id);
        handle.edit_local(|txn| {
            let current = block.get_string(&*txn);
            handle.check_range(block_id, &current, index, len)?;
            if len > 0 {
                block.remove_range(txn, index, len);
            }
            Ok(())
        })
    }

    /// Drop a notebook's document and its update subscription.
    pub fn close(&mut self, notebook_id: NotebookId) -> bool {
        let closed = self.docs.remove(&notebook_id).is_some();
        if closed {
            log::info!("Closed document for notebook {notebook_id}");
        }
        closed
    }

    pub fn close_all(&mut self) {
        for notebook_id in self.open_notebooks() {
            self.close(notebook_id);
        }
    }
}
