//! Presence for notebook participants: identity, cursor, focused block.
//!
//! ## Architecture
//!
//! ```text
//! Local cursor / focus change
//!       │
//!       ▼
//! PresenceBridge::publish_local_state()   (fields merged over the local record)
//!       │
//!       ▼
//! ClientMessage::PresencePublish  ──►  room  ──►  PresenceEvent::{Snapshot, Updated, Left}
//!                                                        │
//!                                                        ▼
//!                                        PresenceBridge::handle_event()
//!                                                        │
//!                                                        ▼
//!                                        CursorDecorations::render()
//! ```
//!
//! Presence is ephemeral. It is dropped while offline, republished after a
//! join, and remote tables are cleared when the connection goes away.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{ConnectionError, DecorationError};
use crate::events::PresenceEvent;
use crate::model::{BlockId, NotebookId, UserId};
use crate::outbox::{Delivery, Outbox};
use crate::protocol::ClientMessage;

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// Fixed participant palette.
pub const PALETTE: [&str; 12] = [
    "#e6194b", "#3cb44b", "#4363d8", "#f58231", "#911eb4", "#42d4f4",
    "#f032e6", "#469990", "#9a6324", "#800000", "#808000", "#000075",
];

/// Stable color for a user id: FNV-1a hash into [`PALETTE`].
///
/// Needs no coordination; every participant computes the same color.
pub fn color_for(user_id: &str) -> &'static str {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in user_id.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    PALETTE[hash as usize % PALETTE.len()]
}

/// Who the local participant is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    pub display_name: String,
}

impl Identity {
    pub fn new(user_id: impl Into<UserId>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Zero-based line/column inside a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub line: u32,
    pub column: u32,
}

impl CursorPosition {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

/// Cursor or selection. `anchor == head` for a caret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRange {
    pub block_id: BlockId,
    pub anchor: CursorPosition,
    pub head: CursorPosition,
}

impl CursorRange {
    pub fn caret(block_id: BlockId, position: CursorPosition) -> Self {
        Self {
            block_id,
            anchor: position,
            head: position,
        }
    }

    /// Same range with the head moved one column right.
    fn nudged(&self) -> Self {
        let mut moved = *self;
        moved.head.column = moved.head.column.saturating_add(1);
        moved
    }
}

/// One participant's presence in a notebook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub display_name: String,
    pub color: String,
    pub cursor: Option<CursorRange>,
    pub focused_block: Option<BlockId>,
    pub is_typing: bool,
}

impl PresenceRecord {
    pub fn new(identity: &Identity) -> Self {
        Self {
            user_id: identity.user_id.clone(),
            display_name: identity.display_name.clone(),
            color: color_for(&identity.user_id).to_string(),
            cursor: None,
            focused_block: None,
            is_typing: false,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Decoration adapter
// ───────────────────────────────────────────────────────────────────

/// Renders remote cursors in the editor.
///
/// Some decoration layers only refresh on cursor movement, so after presence
/// is first established the bridge calls [`cursor_moved`](Self::cursor_moved)
/// twice: one column right, then back.
pub trait CursorDecorations: Send {
    fn render(
        &mut self,
        notebook_id: NotebookId,
        participants: &[PresenceRecord],
    ) -> Result<(), DecorationError>;

    fn cursor_moved(
        &mut self,
        notebook_id: NotebookId,
        cursor: &CursorRange,
    ) -> Result<(), DecorationError>;
}

/// Decorations for headless sessions.
#[derive(Debug, Default)]
pub struct NoopDecorations;

impl CursorDecorations for NoopDecorations {
    fn render(&mut self, _: NotebookId, _: &[PresenceRecord]) -> Result<(), DecorationError> {
        Ok(())
    }

    fn cursor_moved(&mut self, _: NotebookId, _: &CursorRange) -> Result<(), DecorationError> {
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────────────
// Bridge
// ───────────────────────────────────────────────────────────────────

/// Local presence publishing and remote participant tables, per notebook.
pub struct PresenceBridge {
    outbox: Outbox,
    decorations: Box<dyn CursorDecorations>,
    local: HashMap<NotebookId, PresenceRecord>,
    remote: HashMap<NotebookId, HashMap<UserId, PresenceRecord>>,
    /// Notebooks whose decorations have had the post-publish nudge.
    nudged: HashSet<NotebookId>,
    local_user: Option<UserId>,
}

impl PresenceBridge {
    pub fn new(outbox: Outbox, decorations: Box<dyn CursorDecorations>) -> Self {
        Self {
            outbox,
            decorations,
            local: HashMap::new(),
            remote: HashMap::new(),
            nudged: HashSet::new(),
            local_user: None,
        }
    }

    pub fn set_decorations(&mut self, decorations: Box<dyn CursorDecorations>) {
        self.decorations = decorations;
        self.nudged.clear();
    }

    /// Merge the supplied fields over the local record and broadcast it.
    /// `None` leaves the existing field untouched.
    pub fn publish_local_state(
        &mut self,
        notebook_id: NotebookId,
        identity: &Identity,
        cursor: Option<CursorRange>,
        focused_block: Option<BlockId>,
    ) -> Result<PresenceRecord, ConnectionError> {
        self.local_user = Some(identity.user_id.clone());
        let record = self
            .local
            .entry(notebook_id)
            .or_insert_with(|| PresenceRecord::new(identity));
        if record.user_id != identity.user_id {
            *record = PresenceRecord::new(identity);
        }
        record.display_name.clone_from(&identity.display_name);
        if cursor.is_some() {
            record.cursor = cursor;
        }
        if focused_block.is_some() {
            record.focused_block = focused_block;
        }

        let snapshot = record.clone();
        self.broadcast(notebook_id)?;
        Ok(snapshot)
    }

    /// Toggle the typing flag and republish. `Ok(false)` when nothing has
    /// been published for the notebook yet.
    pub fn set_typing(
        &mut self,
        notebook_id: NotebookId,
        typing: bool,
    ) -> Result<bool, ConnectionError> {
        let Some(record) = self.local.get_mut(&notebook_id) else {
            return Ok(false);
        };
        if record.is_typing == typing {
            return Ok(true);
        }
        record.is_typing = typing;
        self.broadcast(notebook_id)?;
        Ok(true)
    }

    /// Resend every local record, e.g. after a rejoin.
    pub fn republish_all(&mut self) -> Result<usize, ConnectionError> {
        let notebooks: Vec<NotebookId> = self.local.keys().copied().collect();
        for notebook_id in &notebooks {
            self.broadcast(*notebook_id)?;
        }
        Ok(notebooks.len())
    }

    fn broadcast(&mut self, notebook_id: NotebookId) -> Result<(), ConnectionError> {
        let Some(record) = self.local.get(&notebook_id) else {
            return Ok(());
        };
        let cursor = record.cursor;
        let delivery = self.outbox.send(ClientMessage::PresencePublish {
            notebook_id,
            state: record.clone(),
        })?;
        log::trace!("Presence for {notebook_id}: {delivery:?}");

        if delivery == Delivery::Sent {
            if let Some(cursor) = cursor {
                if self.nudged.insert(notebook_id) {
                    self.nudge(notebook_id, &cursor);
                }
            }
        }
        Ok(())
    }

    fn nudge(&mut self, notebook_id: NotebookId, cursor: &CursorRange) {
        let result = self
            .decorations
            .cursor_moved(notebook_id, &cursor.nudged())
            .and_then(|()| self.decorations.cursor_moved(notebook_id, cursor));
        if let Err(e) = result {
            log::debug!("Cursor nudge failed for {notebook_id}: {e}");
        }
    }

    pub fn local_state(&self, notebook_id: NotebookId) -> Option<&PresenceRecord> {
        self.local.get(&notebook_id)
    }

    /// Apply a presence event from the room and refresh decorations.
    pub fn handle_event(&mut self, event: &PresenceEvent) {
        let notebook_id = match event {
            PresenceEvent::Snapshot {
                notebook_id,
                participants,
            } => {
                let table = self.remote.entry(*notebook_id).or_default();
                table.clear();
                for p in participants {
                    if Some(&p.user_id) != self.local_user.as_ref() {
                        table.insert(p.user_id.clone(), p.clone());
                    }
                }
                *notebook_id
            }
            PresenceEvent::Updated {
                notebook_id,
                participant,
            } => {
                if Some(&participant.user_id) == self.local_user.as_ref() {
                    return;
                }
                self.remote
                    .entry(*notebook_id)
                    .or_default()
                    .insert(participant.user_id.clone(), participant.clone());
                *notebook_id
            }
            PresenceEvent::Left {
                notebook_id,
                user_id,
            } => {
                let removed = self
                    .remote
                    .get_mut(notebook_id)
                    .and_then(|table| table.remove(user_id));
                if removed.is_none() {
                    return;
                }
                *notebook_id
            }
        };
        self.render(notebook_id);
    }

    fn render(&mut self, notebook_id: NotebookId) {
        let participants = self.participants(notebook_id);
        if let Err(e) = self.decorations.render(notebook_id, &participants) {
            log::debug!("Decoration render failed for {notebook_id}: {e}");
        }
    }

    /// Remote participants of a notebook, ordered by user id.
    pub fn participants(&self, notebook_id: NotebookId) -> Vec<PresenceRecord> {
        let mut participants: Vec<PresenceRecord> = self
            .remote
            .get(&notebook_id)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default();
        participants.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        participants
    }

    /// Drop every remote participant, e.g. when the connection is lost.
    pub fn clear_remote(&mut self) {
        let notebooks: Vec<NotebookId> = self
            .remote
            .iter()
            .filter(|(_, table)| !table.is_empty())
            .map(|(id, _)| *id)
            .collect();
        self.remote.clear();
        self.nudged.clear();
        for notebook_id in notebooks {
            self.render(notebook_id);
        }
    }

    /// Forget all presence for a closed notebook.
    pub fn forget_notebook(&mut self, notebook_id: NotebookId) {
        self.local.remove(&notebook_id);
        self.nudged.remove(&notebook_id);
        if self.remote.remove(&notebook_id).is_some() {
            if let Err(e) = self.decorations.render(notebook_id, &[]) {
                log::debug!("Decoration render failed for {notebook_id}: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Render(usize),
        Moved(CursorRange),
    }

    #[derive(Clone, Default)]
    struct Recording {
        calls: Arc<Mutex<Vec<Call>>>,
        fail: bool,
    }

    impl CursorDecorations for Recording {
        fn render(&mut self, _: NotebookId, p: &[PresenceRecord]) -> Result<(), DecorationError> {
            self.calls.lock().unwrap().push(Call::Render(p.len()));
            if self.fail {
                return Err(DecorationError("render".into()));
            }
            Ok(())
        }

        fn cursor_moved(&mut self, _: NotebookId, c: &CursorRange) -> Result<(), DecorationError> {
            self.calls.lock().unwrap().push(Call::Moved(*c));
            if self.fail {
                return Err(DecorationError("moved".into()));
            }
            Ok(())
        }
    }

    fn joined_bridge(decorations: Recording) -> (PresenceBridge, mpsc::UnboundedReceiver<Vec<u8>>) {
        let outbox = Outbox::new(8);
        let (tx, rx) = mpsc::unbounded_channel();
        outbox.attach(tx);
        outbox.mark_joined().unwrap();
        (PresenceBridge::new(outbox, Box::new(decorations)), rx)
    }

    fn remote(user: &str) -> PresenceRecord {
        PresenceRecord::new(&Identity::new(user, user.to_uppercase()))
    }

    #[test]
    fn test_color_is_stable_and_from_palette() {
        let a = color_for("user-42");
        assert_eq!(a, color_for("user-42"));
        assert!(PALETTE.contains(&a));
        assert!(PALETTE.contains(&color_for("")));
    }

    #[test]
    fn test_colors_spread_across_palette() {
        let distinct: HashSet<&str> = (0..100).map(|i| color_for(&format!("user-{i}"))).collect();
        assert!(distinct.len() > PALETTE.len() / 2);
    }

    #[test]
    fn test_publish_merges_fields() {
        let (mut bridge, mut rx) = joined_bridge(Recording::default());
        let notebook = Uuid::new_v4();
        let block = Uuid::new_v4();
        let me = Identity::new("me", "Me");
        let cursor = CursorRange::caret(block, CursorPosition::new(1, 2));

        bridge.publish_local_state(notebook, &me, Some(cursor), Some(block)).unwrap();
        let record = bridge.publish_local_state(notebook, &me, None, None).unwrap();
        assert_eq!(record.cursor, Some(cursor));
        assert_eq!(record.focused_block, Some(block));
        assert_eq!(record.color, color_for("me"));

        let mut published = 0;
        while let Ok(bytes) = rx.try_recv() {
            let msg = ClientMessage::decode(&bytes).unwrap();
            assert!(matches!(msg, ClientMessage::PresencePublish { .. }));
            published += 1;
        }
        assert_eq!(published, 2);
    }

    #[test]
    fn test_nudge_runs_once_per_notebook() {
        let decorations = Recording::default();
        let calls = decorations.calls.clone();
        let (mut bridge, _rx) = joined_bridge(decorations);
        let notebook = Uuid::new_v4();
        let cursor = CursorRange::caret(Uuid::new_v4(), CursorPosition::new(0, 4));
        let me = Identity::new("me", "Me");

        bridge.publish_local_state(notebook, &me, Some(cursor), None).unwrap();
        bridge.publish_local_state(notebook, &me, Some(cursor), None).unwrap();

        let calls = calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![Call::Moved(cursor.nudged()), Call::Moved(cursor)]
        );
        assert_eq!(cursor.nudged().head.column, 5);
    }

    #[test]
    fn test_decoration_errors_are_swallowed() {
        let decorations = Recording {
            fail: true,
            ..Default::default()
        };
        let (mut bridge, _rx) = joined_bridge(decorations);
        let notebook = Uuid::new_v4();
        let cursor = CursorRange::caret(Uuid::new_v4(), CursorPosition::new(0, 0));

        bridge
            .publish_local_state(notebook, &Identity::new("me", "Me"), Some(cursor), None)
            .unwrap();
        bridge.handle_event(&PresenceEvent::Updated {
            notebook_id: notebook,
            participant: remote("ana"),
        });
        assert_eq!(bridge.participants(notebook).len(), 1);
    }

    #[test]
    fn test_offline_publish_is_dropped_without_nudge() {
        let decorations = Recording::default();
        let calls = decorations.calls.clone();
        let mut bridge = PresenceBridge::new(Outbox::new(8), Box::new(decorations));
        let cursor = CursorRange::caret(Uuid::new_v4(), CursorPosition::new(0, 0));

        bridge
            .publish_local_state(Uuid::new_v4(), &Identity::new("me", "Me"), Some(cursor), None)
            .unwrap();
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_remote_tables() {
        let decorations = Recording::default();
        let calls = decorations.calls.clone();
        let (mut bridge, _rx) = joined_bridge(decorations);
        let notebook = Uuid::new_v4();
        bridge
            .publish_local_state(notebook, &Identity::new("me", "Me"), None, None)
            .unwrap();

        bridge.handle_event(&PresenceEvent::Snapshot {
            notebook_id: notebook,
            participants: vec![remote("me"), remote("zoe"), remote("ana")],
        });
        let users: Vec<String> = bridge.participants(notebook).into_iter().map(|p| p.user_id).collect();
        assert_eq!(users, vec!["ana", "zoe"]);

        // Our own echo is ignored.
        bridge.handle_event(&PresenceEvent::Updated {
            notebook_id: notebook,
            participant: remote("me"),
        });
        bridge.handle_event(&PresenceEvent::Left {
            notebook_id: notebook,
            user_id: "zoe".into(),
        });
        assert_eq!(bridge.participants(notebook).len(), 1);

        bridge.clear_remote();
        assert!(bridge.participants(notebook).is_empty());
        assert_eq!(
            *calls.lock().unwrap(),
            vec![Call::Render(2), Call::Render(1), Call::Render(0)]
        );
    }

    #[test]
    fn test_set_typing() {
        let (mut bridge, mut rx) = joined_bridge(Recording::default());
        let notebook = Uuid::new_v4();
        assert!(!bridge.set_typing(notebook, true).unwrap());

        bridge
            .publish_local_state(notebook, &Identity::new("me", "Me"), None, None)
            .unwrap();
        assert!(bridge.set_typing(notebook, true).unwrap());
        assert!(bridge.local_state(notebook).unwrap().is_typing);

        let last = std::iter::from_fn(|| rx.try_recv().ok()).last().unwrap();
        let ClientMessage::PresencePublish { state, .. } = ClientMessage::decode(&last).unwrap()
        else {
            panic!("expected presence publish");
        };
        assert!(state.is_typing);
    }

    #[test]
    fn test_forget_notebook() {
        let (mut bridge, _rx) = joined_bridge(Recording::default());
        let notebook = Uuid::new_v4();
        bridge
            .publish_local_state(notebook, &Identity::new("me", "Me"), None, None)
            .unwrap();
        bridge.handle_event(&PresenceEvent::Updated {
            notebook_id: notebook,
            participant: remote("ana"),
        });
        bridge.forget_notebook(notebook);
        assert!(bridge.local_state(notebook).is_none());
        assert!(bridge.participants(notebook).is_empty());
        assert_eq!(bridge.republish_all().unwrap(), 0);
    }
}
