//! Outbound message path shared by the registry, the presence bridge and the
//! connection manager.
//!
//! The connection manager attaches the live link and flips the outbox to
//! "joined" once room membership is established. Until then:
//!
//! - document updates are queued in an [`OfflineQueue`] and replayed, in
//!   order, right after the next join;
//! - state requests and presence publishes are dropped (they are re-issued
//!   after the join);
//! - join/leave/ping go out as soon as a link exists.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;

use crate::error::ConnectionError;
use crate::model::NotebookId;
use crate::protocol::ClientMessage;

/// Offline queue for document updates produced while not joined.
///
/// Bounded: once full, further updates are rejected and reported as errors
/// instead of being silently lost.
#[derive(Debug)]
pub struct OfflineQueue {
    queue: VecDeque<QueuedUpdate>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedUpdate {
    notebook_id: NotebookId,
    payload: Vec<u8>,
}

impl OfflineQueue {
    /// Create a new offline queue with max capacity.
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an update for later replay. Returns `false` when full.
    pub fn enqueue(&mut self, notebook_id: NotebookId, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedUpdate {
            notebook_id,
            payload,
        });
        true
    }

    /// Drain all queued updates in enqueue order.
    pub fn drain(&mut self) -> Vec<(NotebookId, Vec<u8>)> {
        self.queue
            .drain(..)
            .map(|u| (u.notebook_id, u.payload))
            .collect()
    }

    /// Put updates back at the front, preserving their order.
    fn requeue_front(&mut self, updates: Vec<(NotebookId, Vec<u8>)>) {
        for (notebook_id, payload) in updates.into_iter().rev() {
            self.queue.push_front(QueuedUpdate {
                notebook_id,
                payload,
            });
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Total bytes queued.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|u| u.payload.len()).sum()
    }
}

/// What happened to a message handed to [`Outbox::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written to the live link.
    Sent,
    /// Held in the offline queue until the next join.
    Queued,
    /// Not deliverable now and not worth keeping.
    Dropped,
}

#[derive(Debug)]
struct OutboxState {
    link: Option<mpsc::UnboundedSender<Vec<u8>>>,
    joined: bool,
    offline: OfflineQueue,
}

/// Cloneable handle onto the session's single outbound path.
#[derive(Debug, Clone)]
pub struct Outbox {
    state: Arc<Mutex<OutboxState>>,
}

fn needs_membership(msg: &ClientMessage) -> bool {
    !matches!(
        msg,
        ClientMessage::JoinRoom { .. } | ClientMessage::LeaveRoom { .. } | ClientMessage::Ping
    )
}

impl Outbox {
    pub fn new(offline_capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(OutboxState {
                link: None,
                joined: false,
                offline: OfflineQueue::new(offline_capacity),
            })),
        }
    }

    /// Route `msg` to the link, the offline queue, or nowhere.
    pub fn send(&self, msg: ClientMessage) -> Result<Delivery, ConnectionError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let ready = state.link.is_some() && (state.joined || !needs_membership(&msg));

        if ready {
            let bytes = msg.encode()?;
            let sent = state
                .link
                .as_ref()
                .is_some_and(|link| link.send(bytes).is_ok());
            if sent {
                return Ok(Delivery::Sent);
            }
            log::debug!("Outbound link closed, detaching");
            state.link = None;
            state.joined = false;
        }

        match msg {
            ClientMessage::DocumentUpdate {
                notebook_id,
                update,
            } => {
                if state.offline.enqueue(notebook_id, update) {
                    log::trace!(
                        "Queued offline update for {notebook_id} ({} pending)",
                        state.offline.len()
                    );
                    Ok(Delivery::Queued)
                } else {
                    Err(ConnectionError::OfflineQueueFull(notebook_id))
                }
            }
            _ => Ok(Delivery::Dropped),
        }
    }

    /// Attach a freshly opened link. Membership must be re-established.
    pub fn attach(&self, link: mpsc::UnboundedSender<Vec<u8>>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.link = Some(link);
        state.joined = false;
    }

    /// Drop the link. Queued updates are kept.
    pub fn detach(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.link = None;
        state.joined = false;
    }

    /// Mark room membership established and replay queued updates in order.
    /// Returns how many were replayed.
    pub fn mark_joined(&self) -> Result<usize, ConnectionError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(link) = state.link.clone() else {
            return Ok(0);
        };
        state.joined = true;

        let queued = state.offline.drain();
        let mut replayed = 0;
        let mut pending = queued.into_iter();
        while let Some((notebook_id, update)) = pending.next() {
            let bytes = ClientMessage::DocumentUpdate {
                notebook_id,
                update: update.clone(),
            }
            .encode()?;
            if link.send(bytes).is_err() {
                let mut rest = vec![(notebook_id, update)];
                rest.extend(pending);
                state.offline.requeue_front(rest);
                state.link = None;
                state.joined = false;
                break;
            }
            replayed += 1;
        }
        if replayed > 0 {
            log::info!("Replayed {replayed} queued updates");
        }
        Ok(replayed)
    }

    pub fn is_joined(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .joined
    }

    /// Number of updates waiting for the next join.
    pub fn offline_len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .offline
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn update(notebook_id: NotebookId, byte: u8) -> ClientMessage {
        ClientMessage::DocumentUpdate {
            notebook_id,
            update: vec![byte],
        }
    }

    fn decode_all(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<ClientMessage> {
        let mut out = Vec::new();
        while let Ok(bytes) = rx.try_recv() {
            out.push(ClientMessage::decode(&bytes).unwrap());
        }
        out
    }

    #[test]
    fn test_offline_queue() {
        let mut queue = OfflineQueue::new(100);
        assert!(queue.is_empty());

        let id = Uuid::new_v4();
        queue.enqueue(id, vec![1, 2, 3]);
        queue.enqueue(id, vec![4, 5, 6, 7]);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.total_bytes(), 7);

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].1, vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_offline_queue_capacity() {
        let mut queue = OfflineQueue::new(2);
        let id = Uuid::new_v4();
        assert!(queue.enqueue(id, vec![1]));
        assert!(queue.enqueue(id, vec![2]));
        assert!(!queue.enqueue(id, vec![3]));
        assert_eq!(queue.len(), 2);
        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_updates_queue_until_joined_then_replay_in_order() {
        let outbox = Outbox::new(16);
        let id = Uuid::new_v4();

        assert_eq!(outbox.send(update(id, 1)).unwrap(), Delivery::Queued);
        assert_eq!(outbox.send(update(id, 2)).unwrap(), Delivery::Queued);

        let (tx, mut rx) = mpsc::unbounded_channel();
        outbox.attach(tx);
        // Linked but not joined: still queued.
        assert_eq!(outbox.send(update(id, 3)).unwrap(), Delivery::Queued);
        assert!(decode_all(&mut rx).is_empty());

        assert_eq!(outbox.mark_joined().unwrap(), 3);
        assert_eq!(outbox.send(update(id, 4)).unwrap(), Delivery::Sent);

        let sent = decode_all(&mut rx);
        let bytes: Vec<u8> = sent
            .iter()
            .map(|m| match m {
                ClientMessage::DocumentUpdate { update, .. } => update[0],
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(bytes, vec![1, 2, 3, 4]);
        assert_eq!(outbox.offline_len(), 0);
    }

    #[test]
    fn test_join_and_ping_need_only_a_link() {
        let outbox = Outbox::new(4);
        assert_eq!(outbox.send(ClientMessage::Ping).unwrap(), Delivery::Dropped);

        let (tx, mut rx) = mpsc::unbounded_channel();
        outbox.attach(tx);
        let join = ClientMessage::JoinRoom {
            request_id: 1,
            room_id: "r".into(),
        };
        assert_eq!(outbox.send(join.clone()).unwrap(), Delivery::Sent);
        assert_eq!(decode_all(&mut rx), vec![join]);
    }

    #[test]
    fn test_presence_and_state_requests_dropped_offline() {
        let outbox = Outbox::new(4);
        let msg = ClientMessage::StateRequest {
            notebook_id: Uuid::new_v4(),
            state_vector: vec![0],
        };
        assert_eq!(outbox.send(msg).unwrap(), Delivery::Dropped);
        assert_eq!(outbox.offline_len(), 0);
    }

    #[test]
    fn test_full_queue_is_an_error() {
        let outbox = Outbox::new(1);
        let id = Uuid::new_v4();
        outbox.send(update(id, 1)).unwrap();
        let err = outbox.send(update(id, 2)).unwrap_err();
        assert_eq!(err, ConnectionError::OfflineQueueFull(id));
    }

    #[test]
    fn test_closed_link_falls_back_to_queue() {
        let outbox = Outbox::new(4);
        let (tx, rx) = mpsc::unbounded_channel();
        outbox.attach(tx);
        outbox.mark_joined().unwrap();
        drop(rx);

        let id = Uuid::new_v4();
        assert_eq!(outbox.send(update(id, 9)).unwrap(), Delivery::Queued);
        assert!(!outbox.is_joined());
        assert_eq!(outbox.offline_len(), 1);
    }
}
