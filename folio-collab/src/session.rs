//! The collaboration session: one room connection and everything hanging off it.
//!
//! ```text
//!             ┌──────────────────────── Session ─────────────────────────┐
//! transport ─►│ ConnectionManager ─► EventBus ─► inbox ─► next_event()   │
//!             │                                   │                      │
//!             │        ┌──────────────┬───────────┼──────────────┐       │
//!             │        ▼              ▼           ▼              ▼       │
//!             │ DocumentRegistry  BlockReconciler PresenceBridge  (caller)│
//!             │        │              │                                  │
//!             │        └─ text observers ─► ContentChange ─► BufferCache │
//!             └──────────────────────────────────────────────────────────┘
//! ```
//!
//! A session is driven by its owner: [`Session::next_event`] routes inbound
//! events to the components, keeps buffers in sync with replicated text and
//! runs the periodic eviction sweep. Independent sessions share nothing.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::buffer::{BufferCache, EditorEngine, TextBuffer};
use crate::bus::{EventBus, SubscriptionId};
use crate::config::CollabConfig;
use crate::connection::{ConnectionManager, ConnectionState, JoinSignal};
use crate::document::DocumentRegistry;
use crate::error::{CollabError, DocumentError};
use crate::events::{
    DocumentEvent, ErrorEvent, ErrorKind, EventKind, NotebookEvent, RoomEvent, SessionEvent,
};
use crate::model::{BlockId, BlockRecord, NewBlock, NotebookId, NotebookRecord, UserId};
use crate::outbox::Outbox;
use crate::presence::{
    CursorDecorations, CursorRange, Identity, NoopDecorations, PresenceBridge, PresenceRecord,
};
use crate::reconciler::{BlockReconciler, ContentChange};
use crate::rest::{HttpNotebookService, NotebookService};
use crate::transport::{Connector, WebSocketConnector};

pub struct Session {
    config: CollabConfig,
    bus: Arc<EventBus>,
    forwarders: Vec<(EventKind, SubscriptionId)>,
    inbox: mpsc::UnboundedReceiver<SessionEvent>,
    connection: ConnectionManager,
    registry: DocumentRegistry,
    reconciler: BlockReconciler,
    content_changes: mpsc::UnboundedReceiver<ContentChange>,
    presence: PresenceBridge,
    cache: BufferCache,
    service: Arc<dyn NotebookService>,
    sweep: Option<Interval>,
    closed: bool,
}

impl Session {
    pub fn new(
        config: CollabConfig,
        connector: Arc<dyn Connector>,
        service: Arc<dyn NotebookService>,
    ) -> Self {
        let bus = Arc::new(EventBus::new());
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let forwarders = EventKind::ALL
            .into_iter()
            .map(|kind| {
                let tx = inbox_tx.clone();
                let id = bus.subscribe(kind, move |event| {
                    let _ = tx.send(event.clone());
                });
                (kind, id)
            })
            .collect();

        let outbox = Outbox::new(config.offline_queue_capacity);
        let connection = ConnectionManager::new(
            connector,
            bus.clone(),
            outbox.clone(),
            config.connection_settings(),
        );
        let (reconciler, content_changes) = BlockReconciler::new();

        Self {
            bus,
            forwarders,
            inbox,
            connection,
            registry: DocumentRegistry::new(outbox.clone()),
            reconciler,
            content_changes,
            presence: PresenceBridge::new(outbox, Box::new(NoopDecorations)),
            cache: BufferCache::new(config.max_buffers),
            service,
            sweep: None,
            closed: false,
            config,
        }
    }

    /// Session over WebSocket and the HTTP notebook API, both authenticated
    /// with `token`.
    pub fn with_websocket(config: CollabConfig, token: &str) -> Result<Self, CollabError> {
        config.validate()?;
        let service = HttpNotebookService::new(&config.api_url, token)?;
        Ok(Self::new(
            config,
            Arc::new(WebSocketConnector::new()),
            Arc::new(service),
        ))
    }

    /// Install the editor engine backing the buffer cache.
    pub fn attach_engine(&mut self, engine: Box<dyn EditorEngine>) {
        self.cache.attach_engine(engine);
    }

    pub fn set_decorations(&mut self, decorations: Box<dyn CursorDecorations>) {
        self.presence.set_decorations(decorations);
    }

    pub fn config(&self) -> &CollabConfig {
        &self.config
    }

    /// The session's event bus, for additional subscribers.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub async fn state(&self) -> ConnectionState {
        self.connection.state().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    // ───────────────────────────────────────────────────────────────
    // Connection
    // ───────────────────────────────────────────────────────────────

    /// Our user id. Join broadcasts naming another user then no longer
    /// confirm our own join. Publishing presence sets it too.
    pub fn set_local_user(&mut self, user_id: impl Into<UserId>) {
        self.connection.set_local_user(user_id);
    }

    pub async fn connect(&mut self, room_id: &str, token: &str) -> Result<(), CollabError> {
        self.connection.connect(room_id, token).await?;
        Ok(())
    }

    /// Join the connected room, then replay queued updates, push full state
    /// for notebooks that lost a local delta, re-request state for open
    /// notebooks and republish presence.
    pub async fn join(&mut self, room_id: &str) -> Result<JoinSignal, CollabError> {
        let signal = self.connection.join_room(room_id).await?;
        let pushed = self.registry.resync_undelivered();
        if pushed > 0 {
            log::info!("Pushed full state for {pushed} notebooks with undelivered edits");
        }
        let notebooks = self.registry.request_state_all();
        let presence = self.presence.republish_all()?;
        log::debug!("Rehydrating {notebooks} notebooks, republished {presence} presence records");
        Ok(signal)
    }

    pub async fn connect_and_join(
        &mut self,
        room_id: &str,
        token: &str,
    ) -> Result<JoinSignal, CollabError> {
        self.connect(room_id, token).await?;
        self.join(room_id).await
    }

    pub async fn disconnect(&mut self) {
        self.connection.disconnect().await;
    }

    // ───────────────────────────────────────────────────────────────
    // Notebooks
    // ───────────────────────────────────────────────────────────────

    /// Open a notebook's document, load its blocks and observe their text.
    pub async fn open_notebook(
        &mut self,
        notebook_id: NotebookId,
    ) -> Result<&[BlockRecord], CollabError> {
        self.registry.open(notebook_id)?;
        self.reconciler
            .load(notebook_id, self.service.as_ref())
            .await?;
        self.reconciler.attach_all(&self.registry, notebook_id);
        Ok(self.reconciler.blocks(notebook_id))
    }

    /// Tear down one notebook: observers, document, buffers, presence.
    pub fn close_notebook(&mut self, notebook_id: NotebookId) -> bool {
        let blocks: Vec<BlockId> = self
            .reconciler
            .blocks(notebook_id)
            .iter()
            .map(|b| b.id)
            .collect();
        let observed = self.reconciler.detach_notebook(notebook_id);
        let closed = self.registry.close(notebook_id);
        for block_id in blocks.iter().chain(observed.iter()) {
            self.cache.dispose(*block_id);
        }
        self.presence.forget_notebook(notebook_id);
        closed
    }

    pub fn is_open(&self, notebook_id: NotebookId) -> bool {
        self.registry.is_open(notebook_id)
    }

    pub fn blocks(&self, notebook_id: NotebookId) -> &[BlockRecord] {
        self.reconciler.blocks(notebook_id)
    }

    pub async fn list_notebooks(&self, room_id: &str) -> Result<Vec<NotebookRecord>, CollabError> {
        Ok(self.service.list_notebooks(room_id).await?)
    }

    pub async fn create_notebook(
        &self,
        room_id: &str,
        name: &str,
    ) -> Result<NotebookRecord, CollabError> {
        Ok(self.service.create_notebook(room_id, name).await?)
    }

    pub async fn rename_notebook(
        &self,
        notebook_id: NotebookId,
        name: &str,
    ) -> Result<NotebookRecord, CollabError> {
        Ok(self.service.rename_notebook(notebook_id, name).await?)
    }

    /// Delete on the server, closing the notebook locally if open.
    pub async fn delete_notebook(&mut self, notebook_id: NotebookId) -> Result<(), CollabError> {
        self.service.delete_notebook(notebook_id).await?;
        self.close_notebook(notebook_id);
        Ok(())
    }

    // ───────────────────────────────────────────────────────────────
    // Blocks
    // ───────────────────────────────────────────────────────────────

    pub async fn create_block(
        &mut self,
        notebook_id: NotebookId,
        block: NewBlock,
    ) -> Result<BlockRecord, CollabError> {
        let record = self.service.create_block(notebook_id, &block).await?;
        if self.reconciler.is_loaded(notebook_id) {
            self.reconciler.upsert(record.clone());
            self.reconciler
                .attach_observer(&self.registry, notebook_id, record.id);
        }
        Ok(record)
    }

    pub async fn delete_block(
        &mut self,
        notebook_id: NotebookId,
        block_id: BlockId,
    ) -> Result<(), CollabError> {
        self.service.delete_block(notebook_id, block_id).await?;
        self.reconciler.remove(notebook_id, block_id);
        self.reconciler.detach_observer(block_id);
        self.cache.dispose(block_id);
        Ok(())
    }

    /// Reposition on the server, then re-fetch the authoritative order.
    pub async fn move_block(
        &mut self,
        notebook_id: NotebookId,
        block_id: BlockId,
        position: u32,
    ) -> Result<&[BlockRecord], CollabError> {
        self.service
            .move_block(notebook_id, block_id, position)
            .await?;
        Ok(self
            .reconciler
            .load(notebook_id, self.service.as_ref())
            .await?)
    }

    /// Give a block editing focus: its buffer is created (or refreshed) from
    /// the replicated text and kept in sync from then on.
    ///
    /// # Panics
    ///
    /// Panics if no editor engine has been attached.
    pub fn focus_block(
        &mut self,
        notebook_id: NotebookId,
        block_id: BlockId,
    ) -> Result<&mut dyn TextBuffer, CollabError> {
        let content = self
            .registry
            .block_text(notebook_id, block_id)
            .ok_or(DocumentError::NotOpen(notebook_id))?;
        let language = self
            .reconciler
            .block(notebook_id, block_id)
            .map(|b| b.language.clone())
            .unwrap_or_default();
        self.reconciler
            .attach_observer(&self.registry, notebook_id, block_id);
        Ok(self.cache.get_or_create(block_id, &content, &language))
    }

    pub fn block_text(&self, notebook_id: NotebookId, block_id: BlockId) -> Option<String> {
        self.registry.block_text(notebook_id, block_id)
    }

    /// Replace a block's text. Returns whether anything changed.
    pub fn edit_block(
        &mut self,
        notebook_id: NotebookId,
        block_id: BlockId,
        content: &str,
    ) -> Result<bool, CollabError> {
        let result = self
            .registry
            .set_block_content(notebook_id, block_id, content);
        self.finish_local_edit(result)
    }

    pub fn insert_text(
        &mut self,
        notebook_id: NotebookId,
        block_id: BlockId,
        index: u32,
        text: &str,
    ) -> Result<(), CollabError> {
        let result = self
            .registry
            .insert_text(notebook_id, block_id, index, text);
        self.finish_local_edit(result)
    }

    pub fn remove_text(
        &mut self,
        notebook_id: NotebookId,
        block_id: BlockId,
        index: u32,
        len: u32,
    ) -> Result<(), CollabError> {
        let result = self
            .registry
            .remove_text(notebook_id, block_id, index, len);
        self.finish_local_edit(result)
    }

    /// Sync buffers after a local edit. An undelivered edit is also reported
    /// as a replication error event.
    fn finish_local_edit<T>(&mut self, result: Result<T, DocumentError>) -> Result<T, CollabError> {
        self.apply_content_changes();
        if let Err(e @ DocumentError::Undelivered { .. }) = &result {
            self.bus.publish(&SessionEvent::Error(ErrorEvent::new(
                ErrorKind::Replication,
                e.to_string(),
            )));
        }
        Ok(result?)
    }

    pub fn cache(&self) -> &BufferCache {
        &self.cache
    }

    pub fn registry(&self) -> &DocumentRegistry {
        &self.registry
    }

    /// Run an eviction sweep now. Evicted blocks stay observed; their
    /// observers are released only when the block or notebook goes away.
    pub fn sweep_now(&mut self) -> Vec<BlockId> {
        self.cache.sweep()
    }

    // ───────────────────────────────────────────────────────────────
    // Presence
    // ───────────────────────────────────────────────────────────────

    pub fn publish_presence(
        &mut self,
        notebook_id: NotebookId,
        identity: &Identity,
        cursor: Option<CursorRange>,
        focused_block: Option<BlockId>,
    ) -> Result<PresenceRecord, CollabError> {
        if self.connection.local_user() != Some(identity.user_id.as_str()) {
            self.connection.set_local_user(identity.user_id.clone());
        }
        Ok(self
            .presence
            .publish_local_state(notebook_id, identity, cursor, focused_block)?)
    }

    pub fn set_typing(&mut self, notebook_id: NotebookId, typing: bool) -> Result<bool, CollabError> {
        Ok(self.presence.set_typing(notebook_id, typing)?)
    }

    pub fn participants(&self, notebook_id: NotebookId) -> Vec<PresenceRecord> {
        self.presence.participants(notebook_id)
    }

    // ───────────────────────────────────────────────────────────────
    // Event loop
    // ───────────────────────────────────────────────────────────────

    /// Wait for the next inbound event, route it, and return it.
    ///
    /// Between events this applies replicated-text changes to buffers and
    /// runs the eviction sweep on schedule. Returns `None` once closed.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        loop {
            if self.closed {
                return None;
            }
            if self.sweep.is_none() {
                let period = self.config.sweep_interval;
                let mut timer = tokio::time::interval_at(Instant::now() + period, period);
                timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.sweep = Some(timer);
            }
            let sweep = self.sweep.as_mut()?;

            tokio::select! {
                Some(event) = self.inbox.recv() => {
                    self.route(&event).await;
                    self.apply_content_changes();
                    return Some(event);
                }
                Some(change) = self.content_changes.recv() => {
                    self.cache.update_content(change.block_id, &change.content);
                }
                _ = sweep.tick() => {
                    let evicted = self.sweep_now();
                    if !evicted.is_empty() {
                        log::debug!("Periodic sweep evicted {} buffers", evicted.len());
                    }
                }
            }
        }
    }

    fn apply_content_changes(&mut self) {
        while let Ok(change) = self.content_changes.try_recv() {
            self.cache.update_content(change.block_id, &change.content);
        }
    }

    async fn route(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::Room(RoomEvent::Disconnected { reason }) => {
                log::info!("Session disconnected: {reason:?}");
                self.presence.clear_remote();
            }
            SessionEvent::Room(_) => {}
            SessionEvent::Notebook(NotebookEvent::Deleted { notebook_id }) => {
                if self.close_notebook(*notebook_id) {
                    log::info!("Notebook {notebook_id} was deleted remotely");
                }
            }
            SessionEvent::Notebook(_) => {}
            SessionEvent::Block(block_event) => {
                let result = self
                    .reconciler
                    .handle_event(
                        block_event,
                        &self.registry,
                        &mut self.cache,
                        self.service.as_ref(),
                    )
                    .await;
                if let Err(e) = result {
                    log::warn!("Failed to reconcile block event: {e}");
                    self.bus.publish(&SessionEvent::Error(ErrorEvent::new(
                        ErrorKind::Server,
                        e.to_string(),
                    )));
                }
            }
            SessionEvent::Document(
                DocumentEvent::Update {
                    notebook_id,
                    update,
                }
                | DocumentEvent::StateResponse {
                    notebook_id,
                    update,
                },
            ) => {
                if let Err(e) = self.registry.apply_remote_update(*notebook_id, update) {
                    log::warn!("Skipping update: {e}");
                    self.bus.publish(&SessionEvent::Error(ErrorEvent::new(
                        ErrorKind::Replication,
                        e.to_string(),
                    )));
                }
            }
            SessionEvent::Presence(presence_event) => {
                self.presence.handle_event(presence_event);
            }
            SessionEvent::Error(error) => {
                log::warn!("{:?} error: {}", error.kind, error.message);
            }
        }
    }

    /// Tear everything down: observers, documents, buffers, transport, timers.
    /// Safe to call more than once.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.reconciler.detach_all();
        self.registry.close_all();
        self.cache.dispose_all();
        self.connection.disconnect().await;
        self.presence.clear_remote();
        self.sweep = None;
        for (kind, id) in self.forwarders.drain(..) {
            self.bus.unsubscribe(kind, id);
        }
        self.closed = true;
        log::info!("Session closed");
    }
}
