//! Connection lifecycle for one session.
//!
//! ```text
//! Disconnected ──connect──► Connecting ──open──► Connected ──join_room──► Joining ──► Joined
//!       ▲                                                                          │
//!       └──────────────── disconnect / server close / transport failure ◄──────────┘
//! ```
//!
//! A reader task decodes inbound frames and publishes them on the session's
//! [`EventBus`]. Join acknowledgments are consumed here and never published.
//! There is no automatic reconnection: losing the transport only moves the
//! state to `Disconnected` and publishes `RoomEvent::Disconnected`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;

use crate::bus::EventBus;
use crate::error::ConnectionError;
use crate::events::{DisconnectReason, ErrorEvent, ErrorKind, EventKind, RoomEvent, SessionEvent};
use crate::model::{RoomId, UserId};
use crate::outbox::Outbox;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::transport::{ConnectRequest, Connector, TransportFrame};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Joining,
    Joined,
}

/// Which signal settled a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinSignal {
    /// The server acknowledged our request directly.
    Acknowledged,
    /// The room broadcast a join for us.
    Broadcast,
    /// Neither arrived in time; assumed joined.
    Fallback,
}

/// Race the direct acknowledgment against the broadcast confirmation.
///
/// Settles on whichever fires first. After `fallback` without either, or once
/// both senders are gone, resolves to [`JoinSignal::Fallback`].
pub async fn race_join(
    ack: oneshot::Receiver<()>,
    confirm: oneshot::Receiver<()>,
    fallback: Duration,
) -> JoinSignal {
    tokio::time::timeout(fallback, async {
        tokio::select! {
            Ok(()) = ack => JoinSignal::Acknowledged,
            Ok(()) = confirm => JoinSignal::Broadcast,
            else => JoinSignal::Fallback,
        }
    })
    .await
    .unwrap_or(JoinSignal::Fallback)
}

/// A join broadcast confirms our join when it names no user, when we do not
/// know our own id yet, or when it names us.
fn confirms_own_join(joined: Option<&str>, local: Option<&str>) -> bool {
    match (joined, local) {
        (Some(joined), Some(local)) => joined == local,
        _ => true,
    }
}

/// Timing knobs for a [`ConnectionManager`].
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Transport endpoint, e.g. `wss://collab.example.com/ws`.
    pub endpoint: String,
    pub join_fallback: Duration,
    /// Zero disables the heartbeat.
    pub heartbeat_interval: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:8080/ws".to_string(),
            join_fallback: Duration::from_millis(600),
            heartbeat_interval: Duration::from_secs(25),
        }
    }
}

type PendingAcks = Arc<Mutex<HashMap<u64, oneshot::Sender<()>>>>;

/// Owns the transport, the connection state and room membership.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    bus: Arc<EventBus>,
    outbox: Outbox,
    settings: ConnectionSettings,

    state: Arc<RwLock<ConnectionState>>,
    room: Option<RoomId>,
    /// Our user id, when known. Join broadcasts for other users are ignored.
    local_user: Option<UserId>,
    pending_acks: PendingAcks,
    next_request_id: u64,
    /// Bumped on every connect and teardown so a stale reader cannot clobber
    /// the state of a newer connection.
    generation: Arc<AtomicU64>,

    reader: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        bus: Arc<EventBus>,
        outbox: Outbox,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            connector,
            bus,
            outbox,
            settings,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            room: None,
            local_user: None,
            pending_acks: Arc::new(Mutex::new(HashMap::new())),
            next_request_id: 0,
            generation: Arc::new(AtomicU64::new(0)),
            reader: None,
            heartbeat: None,
        }
    }

    /// Current connection state.
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Set the user id a join broadcast must carry to confirm our own join.
    pub fn set_local_user(&mut self, user_id: impl Into<UserId>) {
        self.local_user = Some(user_id.into());
    }

    pub fn local_user(&self) -> Option<&str> {
        self.local_user.as_deref()
    }

    /// Room of the current (or last attempted) connection.
    pub fn room_id(&self) -> Option<&str> {
        self.room.as_deref()
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }

    /// Open the transport for `room_id`, authenticating with `token`.
    ///
    /// Idempotent while already connected to the same room. Connecting to a
    /// different room tears the current connection down first.
    pub async fn connect(&mut self, room_id: &str, token: &str) -> Result<(), ConnectionError> {
        let current = self.state().await;
        if current != ConnectionState::Disconnected {
            if self.room.as_deref() == Some(room_id) {
                log::debug!("Already connected to room {room_id}");
                return Ok(());
            }
            self.disconnect().await;
        }

        self.set_state(ConnectionState::Connecting).await;
        self.room = Some(room_id.to_string());
        let request = ConnectRequest {
            endpoint: self.settings.endpoint.clone(),
            room_id: room_id.to_string(),
            token: token.to_string(),
        };

        let link = match self.connector.open(&request).await {
            Ok(link) => link,
            Err(e) => {
                log::error!("Failed to connect to room {room_id}: {e}");
                self.set_state(ConnectionState::Disconnected).await;
                self.bus.publish(&SessionEvent::Error(ErrorEvent::new(
                    ErrorKind::Transport,
                    e.to_string(),
                )));
                return Err(e.into());
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.outbox.attach(link.outbound);
        self.set_state(ConnectionState::Connected).await;
        log::info!("Connected to room {room_id}");

        let reader = ReaderContext {
            bus: self.bus.clone(),
            outbox: self.outbox.clone(),
            state: self.state.clone(),
            pending_acks: self.pending_acks.clone(),
            generation: self.generation.clone(),
            own_generation: generation,
        };
        self.reader = Some(tokio::spawn(reader.run(link.inbound)));
        self.heartbeat = self.spawn_heartbeat();
        Ok(())
    }

    fn spawn_heartbeat(&self) -> Option<JoinHandle<()>> {
        let period = self.settings.heartbeat_interval;
        if period.is_zero() {
            return None;
        }
        let outbox = self.outbox.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if let Err(e) = outbox.send(ClientMessage::Ping) {
                    log::warn!("Heartbeat failed: {e}");
                }
            }
        }))
    }

    /// Join the connected room.
    ///
    /// Sends a join request and settles on the first of: direct ack,
    /// broadcast confirmation, or the fallback delay. On success the offline
    /// queue is replayed.
    pub async fn join_room(&mut self, room_id: &str) -> Result<JoinSignal, ConnectionError> {
        let state = self.state().await;
        if !matches!(state, ConnectionState::Connected | ConnectionState::Joined) {
            return Err(ConnectionError::NotConnected(state));
        }
        if let Some(connected) = self.room.as_deref().filter(|r| *r != room_id) {
            return Err(ConnectionError::RoomMismatch {
                connected: connected.to_string(),
                requested: room_id.to_string(),
            });
        }

        self.set_state(ConnectionState::Joining).await;
        self.next_request_id += 1;
        let request_id = self.next_request_id;

        let (ack_tx, ack_rx) = oneshot::channel();
        self.pending_acks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request_id, ack_tx);

        let (confirm_tx, confirm_rx) = oneshot::channel();
        let confirm_slot = Mutex::new(Some(confirm_tx));
        let room = room_id.to_string();
        let local_user = self.local_user.clone();
        let subscription = self.bus.subscribe(EventKind::Room, move |event| match event {
            SessionEvent::Room(RoomEvent::Joined { room_id, user_id })
                if *room_id == room
                    && confirms_own_join(user_id.as_deref(), local_user.as_deref()) =>
            {
                if let Some(tx) = confirm_slot.lock().unwrap_or_else(PoisonError::into_inner).take() {
                    let _ = tx.send(());
                }
            }
            SessionEvent::Room(RoomEvent::Disconnected { .. }) => {
                confirm_slot
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
            }
            _ => {}
        });

        let sent = self.outbox.send(ClientMessage::JoinRoom {
            request_id,
            room_id: room_id.to_string(),
        });
        let signal = match sent {
            Ok(_) => Some(race_join(ack_rx, confirm_rx, self.settings.join_fallback).await),
            Err(e) => {
                log::error!("Failed to send join request: {e}");
                None
            }
        };

        self.bus.unsubscribe(EventKind::Room, subscription);
        self.pending_acks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&request_id);

        let Some(signal) = signal else {
            return Err(ConnectionError::DisconnectedDuringJoin(room_id.to_string()));
        };
        if self.state().await == ConnectionState::Disconnected {
            log::warn!("Lost connection while joining room {room_id}");
            return Err(ConnectionError::DisconnectedDuringJoin(room_id.to_string()));
        }

        self.set_state(ConnectionState::Joined).await;
        log::info!("Joined room {room_id} ({signal:?})");
        self.outbox.mark_joined()?;
        Ok(signal)
    }

    /// Leave the room (when joined) and close the transport.
    pub async fn disconnect(&mut self) {
        let state = self.state().await;
        if state == ConnectionState::Joined {
            if let Some(room_id) = self.room.clone() {
                if let Err(e) = self.outbox.send(ClientMessage::LeaveRoom { room_id }) {
                    log::debug!("Failed to send leave: {e}");
                }
            }
        }
        self.teardown(state).await;
    }

    async fn teardown(&mut self, previous: ConnectionState) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.abort_tasks();
        self.outbox.detach();
        self.pending_acks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.set_state(ConnectionState::Disconnected).await;

        if previous != ConnectionState::Disconnected {
            log::info!(
                "Disconnected from room {}",
                self.room.as_deref().unwrap_or("<none>")
            );
            self.bus.publish(&SessionEvent::Room(RoomEvent::Disconnected {
                reason: DisconnectReason::ClientRequested,
            }));
        }
    }

    fn abort_tasks(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

struct ReaderContext {
    bus: Arc<EventBus>,
    outbox: Outbox,
    state: Arc<RwLock<ConnectionState>>,
    pending_acks: PendingAcks,
    generation: Arc<AtomicU64>,
    own_generation: u64,
}

impl ReaderContext {
    async fn run(self, mut inbound: mpsc::UnboundedReceiver<TransportFrame>) {
        let reason = loop {
            match inbound.recv().await {
                Some(TransportFrame::Binary(bytes)) => self.dispatch(&bytes),
                Some(TransportFrame::Closed) | None => break DisconnectReason::ServerClosed,
                Some(TransportFrame::Failed(message)) => {
                    log::error!("Transport failed: {message}");
                    self.bus.publish(&SessionEvent::Error(ErrorEvent::new(
                        ErrorKind::Transport,
                        message.clone(),
                    )));
                    break DisconnectReason::TransportError(message);
                }
            }
        };

        if self.generation.load(Ordering::SeqCst) != self.own_generation {
            return;
        }
        *self.state.write().await = ConnectionState::Disconnected;
        self.outbox.detach();
        self.pending_acks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        log::info!("Connection lost: {reason:?}");
        self.bus
            .publish(&SessionEvent::Room(RoomEvent::Disconnected { reason }));
    }

    fn dispatch(&self, bytes: &[u8]) {
        let msg = match ServerMessage::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Dropping malformed frame ({} bytes): {e}", bytes.len());
                self.bus.publish(&SessionEvent::Error(ErrorEvent::new(
                    ErrorKind::MalformedFrame,
                    e.to_string(),
                )));
                return;
            }
        };

        match msg {
            ServerMessage::JoinAck { request_id, room_id } => {
                let waiter = self
                    .pending_acks
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&request_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(());
                    }
                    None => log::debug!("Late join ack {request_id} for room {room_id}"),
                }
            }
            ServerMessage::Pong => log::trace!("Pong"),
            other => {
                if let Some(event) = other.into_event() {
                    self.bus.publish(&event);
                }
            }
        }
    }
}
