//! Integration tests for presence between two sessions sharing a room.

mod common;

use std::sync::{Arc, Mutex};

use common::{client, join_via_relay, wait_for, RoomRelay};
use folio_collab::error::DecorationError;
use folio_collab::presence::color_for;
use folio_collab::{
    BlockRecord, BlockType, CursorDecorations, CursorPosition, CursorRange, EventKind, Identity,
    MemoryNotebookService, NotebookId, PresenceRecord, RoomEvent, SessionEvent,
};

/// Records the user ids passed to each render call.
#[derive(Clone, Default)]
struct RenderLog(Arc<Mutex<Vec<Vec<String>>>>);

impl RenderLog {
    fn last(&self) -> Option<Vec<String>> {
        self.0.lock().unwrap().last().cloned()
    }
}

impl CursorDecorations for RenderLog {
    fn render(
        &mut self,
        _: NotebookId,
        participants: &[PresenceRecord],
    ) -> Result<(), DecorationError> {
        self.0
            .lock()
            .unwrap()
            .push(participants.iter().map(|p| p.user_id.clone()).collect());
        Ok(())
    }

    fn cursor_moved(&mut self, _: NotebookId, _: &CursorRange) -> Result<(), DecorationError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_cursor_reaches_other_participant() {
    let service = Arc::new(MemoryNotebookService::new());
    let notebook = service.seed_notebook("room-1", "nb");
    let block = BlockRecord::new(notebook.id, BlockType::Code, "python", 0);
    service.seed_block(block.clone());
    let relay = RoomRelay::new();

    let mut alice = client(service.clone());
    let mut bob = client(service);
    let renders = RenderLog::default();
    bob.session.set_decorations(Box::new(renders.clone()));
    join_via_relay(&mut alice, &relay, "room-1").await;
    join_via_relay(&mut bob, &relay, "room-1").await;
    alice.session.open_notebook(notebook.id).await.unwrap();
    bob.session.open_notebook(notebook.id).await.unwrap();

    let identity = Identity::new("alice", "Alice");
    let cursor = CursorRange::caret(block.id, CursorPosition::new(2, 4));
    alice
        .session
        .publish_presence(notebook.id, &identity, Some(cursor), Some(block.id))
        .unwrap();

    wait_for(&mut bob.session, |e| e.kind() == EventKind::Presence).await;
    let participants = bob.session.participants(notebook.id);
    assert_eq!(participants.len(), 1);
    let alice_seen = &participants[0];
    assert_eq!(alice_seen.display_name, "Alice");
    assert_eq!(alice_seen.color, color_for("alice"));
    assert_eq!(alice_seen.cursor, Some(cursor));
    assert_eq!(alice_seen.focused_block, Some(block.id));
    assert_eq!(renders.last(), Some(vec!["alice".to_string()]));

    alice.session.set_typing(notebook.id, true).unwrap();
    wait_for(&mut bob.session, |e| e.kind() == EventKind::Presence).await;
    assert!(bob.session.participants(notebook.id)[0].is_typing);
}

#[tokio::test]
async fn test_presence_cleared_on_disconnect() {
    let service = Arc::new(MemoryNotebookService::new());
    let notebook = service.seed_notebook("room-1", "nb");
    let relay = RoomRelay::new();

    let mut alice = client(service.clone());
    let mut bob = client(service);
    join_via_relay(&mut alice, &relay, "room-1").await;
    join_via_relay(&mut bob, &relay, "room-1").await;
    alice.session.open_notebook(notebook.id).await.unwrap();

    alice
        .session
        .publish_presence(notebook.id, &Identity::new("alice", "Alice"), None, None)
        .unwrap();
    wait_for(&mut bob.session, |e| e.kind() == EventKind::Presence).await;
    assert_eq!(bob.session.participants(notebook.id).len(), 1);

    bob.session.disconnect().await;
    wait_for(&mut bob.session, |e| {
        matches!(e, SessionEvent::Room(RoomEvent::Disconnected { .. }))
    })
    .await;
    assert!(bob.session.participants(notebook.id).is_empty());
}

#[tokio::test]
async fn test_offline_presence_published_on_join() {
    let service = Arc::new(MemoryNotebookService::new());
    let notebook = service.seed_notebook("room-1", "nb");
    let relay = RoomRelay::new();

    let mut alice = client(service.clone());
    let mut bob = client(service);
    join_via_relay(&mut bob, &relay, "room-1").await;

    // Published while offline: kept locally, sent on join.
    alice
        .session
        .publish_presence(notebook.id, &Identity::new("alice", "Alice"), None, None)
        .unwrap();
    join_via_relay(&mut alice, &relay, "room-1").await;

    wait_for(&mut bob.session, |e| e.kind() == EventKind::Presence).await;
    assert_eq!(bob.session.participants(notebook.id)[0].user_id, "alice");
}
