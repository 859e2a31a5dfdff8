//! Shared fixtures: an in-process room relay standing in for the room service.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use folio_collab::protocol::{ClientMessage, ServerMessage};
use folio_collab::transport::{memory_transport, MemoryPeer, MemoryPeerSender, MemoryServer};
use folio_collab::{
    CollabConfig, DocumentEvent, MemoryEngine, MemoryNotebookService, NotebookId, PresenceEvent,
    RoomEvent, Session,
};
use tokio::sync::Mutex;
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update};

pub fn test_config() -> CollabConfig {
    CollabConfig {
        join_fallback: Duration::from_millis(600),
        heartbeat_interval: Duration::ZERO,
        ..Default::default()
    }
}

/// A session wired to an in-memory transport and notebook service.
pub struct Client {
    pub session: Session,
    pub server: MemoryServer,
    pub engine: Arc<folio_collab::buffer::EngineStats>,
}

pub fn client(service: Arc<MemoryNotebookService>) -> Client {
    client_with_config(service, test_config())
}

pub fn client_with_config(service: Arc<MemoryNotebookService>, config: CollabConfig) -> Client {
    let (connector, server) = memory_transport();
    let mut session = Session::new(config, Arc::new(connector), service);
    let engine = MemoryEngine::new();
    let stats = engine.stats();
    session.attach_engine(Box::new(engine));
    Client {
        session,
        server,
        engine: stats,
    }
}

#[derive(Default)]
struct RelayState {
    docs: HashMap<NotebookId, Doc>,
    peers: Vec<(usize, MemoryPeerSender)>,
    next_id: usize,
}

/// Minimal room service: acks joins, keeps an authoritative document per
/// notebook, answers state requests and fans out updates and presence.
#[derive(Clone, Default)]
pub struct RoomRelay {
    state: Arc<Mutex<RelayState>>,
}

impl RoomRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the authoritative text of one block.
    pub async fn seed_text(&self, notebook_id: NotebookId, block_name: &str, content: &str) {
        let mut state = self.state.lock().await;
        let doc = state.docs.entry(notebook_id).or_insert_with(Doc::new);
        let text = doc.get_or_insert_text(block_name);
        let mut txn = doc.transact_mut();
        text.push(&mut txn, content);
    }

    pub async fn text(&self, notebook_id: NotebookId, block_name: &str) -> String {
        let mut state = self.state.lock().await;
        let doc = state.docs.entry(notebook_id).or_insert_with(Doc::new);
        let text = doc.get_or_insert_text(block_name);
        let txn = doc.transact();
        text.get_string(&txn)
    }

    /// Serve one accepted peer until it disconnects.
    pub async fn serve(&self, mut peer: MemoryPeer) {
        let sender = peer.sender();
        let id = {
            let mut state = self.state.lock().await;
            let id = state.next_id;
            state.next_id += 1;
            state.peers.push((id, sender.clone()));
            id
        };
        let relay = self.clone();
        tokio::spawn(async move {
            while let Some(msg) = peer.recv().await {
                let Ok(msg) = msg else { continue };
                relay.handle(id, &sender, msg).await;
            }
            let mut state = relay.state.lock().await;
            state.peers.retain(|(peer_id, _)| *peer_id != id);
        });
    }

    async fn handle(&self, from: usize, sender: &MemoryPeerSender, msg: ClientMessage) {
        let mut state = self.state.lock().await;
        match msg {
            ClientMessage::JoinRoom {
                request_id,
                room_id,
            } => {
                sender.send(&ServerMessage::JoinAck {
                    request_id,
                    room_id: room_id.clone(),
                });
                sender.send(&ServerMessage::Room(RoomEvent::Joined {
                    room_id,
                    user_id: None,
                }));
            }
            ClientMessage::DocumentUpdate {
                notebook_id,
                update,
            } => {
                let doc = state.docs.entry(notebook_id).or_insert_with(Doc::new);
                if let Ok(decoded) = Update::decode_v1(&update) {
                    let _ = doc.transact_mut().apply_update(decoded);
                }
                let out = ServerMessage::Document(DocumentEvent::Update {
                    notebook_id,
                    update,
                });
                for (id, peer) in &state.peers {
                    if *id != from {
                        peer.send(&out);
                    }
                }
            }
            ClientMessage::StateRequest {
                notebook_id,
                state_vector,
            } => {
                let doc = state.docs.entry(notebook_id).or_insert_with(Doc::new);
                let sv = StateVector::decode_v1(&state_vector).unwrap_or_default();
                let update = doc.transact().encode_state_as_update_v1(&sv);
                sender.send(&ServerMessage::Document(DocumentEvent::StateResponse {
                    notebook_id,
                    update,
                }));
            }
            ClientMessage::PresencePublish {
                notebook_id,
                state: participant,
            } => {
                let out = ServerMessage::Presence(PresenceEvent::Updated {
                    notebook_id,
                    participant,
                });
                for (id, peer) in &state.peers {
                    if *id != from {
                        peer.send(&out);
                    }
                }
            }
            ClientMessage::Ping => {
                sender.send(&ServerMessage::Pong);
            }
            ClientMessage::LeaveRoom { .. } => {}
        }
    }
}

/// Connect and join `client` to `room` through `relay`.
pub async fn join_via_relay(client: &mut Client, relay: &RoomRelay, room: &str) {
    client.session.connect(room, "token").await.unwrap();
    let peer = client.server.accept().await.unwrap();
    relay.serve(peer).await;
    client.session.join(room).await.unwrap();
}

/// Pump events until `pred` matches one, failing after two seconds.
pub async fn wait_for<F>(session: &mut Session, mut pred: F) -> folio_collab::SessionEvent
where
    F: FnMut(&folio_collab::SessionEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = session.next_event().await.expect("session closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
