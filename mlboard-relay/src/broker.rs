//! Connection-facing coordinator.
//!
//! Each connection gets a [`Session`] that routes its inbound frames:
//! ```text
//!   Join ───────► RoomDirectory::join ──► forwarder task per room ──┐
//!   Event ──────► Room::publish (domain types)                      │
//!             └─► EntityCache (checkpoint type)                     ├─► outbound mpsc ──► socket
//!   Checkpoint ─► EntityCache                                       │
//!   Ping ───────► Pong ─────────────────────────────────────────────┘
//!   Leave ──────► leave all rooms, session closed
//! ```
//!
//! Forwarders push into the connection's bounded outbound queue, so a slow
//! observer only stalls its own forwarders. Session states move
//! `Connected → Active → Closed`; nothing is accepted after `Closed`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use mlboard_core::{ChunkMessage, ConnectionId, Event, EventType};

use crate::entity_cache::{CheckpointError, ChunkOutcome, EntityCache};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::rooms::{RoomDirectory, Subscription};
use crate::storage::StoreError;

/// Errors from handling one inbound message. None of them affect other
/// sessions, rooms or checkpoint keys.
#[derive(Debug)]
pub enum BrokerError {
    /// The log of a room could not be opened
    UnknownRoom { room_id: String, source: StoreError },
    /// Event type outside the recognized set; the event was dropped
    UnrecognizedEventType(String),
    /// Payload lacks required fields
    MalformedEvent(String),
    /// Appending to a room log failed
    Storage(StoreError),
    /// Checkpoint persistence failed; retryable failures stay cached
    Persistence(CheckpointError),
    /// Message received after the session ended
    SessionClosed,
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownRoom { room_id, source } => write!(f, "Room {room_id} unavailable: {source}"),
            Self::UnrecognizedEventType(ty) => write!(f, "Unrecognized event type: {ty}"),
            Self::MalformedEvent(reason) => write!(f, "Malformed event: {reason}"),
            Self::Storage(e) => write!(f, "Event storage error: {e}"),
            Self::Persistence(e) => write!(f, "{e}"),
            Self::SessionClosed => write!(f, "Session closed"),
        }
    }
}

impl std::error::Error for BrokerError {}

impl From<CheckpointError> for BrokerError {
    fn from(e: CheckpointError) -> Self {
        Self::Persistence(e)
    }
}

/// What the connection loop should do after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, no room joined yet
    Connected,
    /// Joined at least once
    Active,
    /// Left or disconnected
    Closed,
}

/// Broker statistics.
#[derive(Debug, Clone, Default)]
pub struct BrokerStats {
    pub sessions_opened: u64,
    pub events_published: u64,
    pub events_dropped: u64,
    pub chunks_received: u64,
    pub checkpoints_persisted: u64,
    pub checkpoints_deleted: u64,
}

#[derive(Default)]
struct AtomicBrokerStats {
    sessions_opened: AtomicU64,
    events_published: AtomicU64,
    events_dropped: AtomicU64,
    chunks_received: AtomicU64,
    checkpoints_persisted: AtomicU64,
    checkpoints_deleted: AtomicU64,
}

/// Shared routing state for all sessions.
pub struct Broker {
    directory: Arc<RoomDirectory>,
    cache: Arc<EntityCache>,
    outbound_capacity: usize,
    stats: Arc<AtomicBrokerStats>,
}

impl Broker {
    pub fn new(directory: Arc<RoomDirectory>, cache: Arc<EntityCache>, outbound_capacity: usize) -> Self {
        Self {
            directory,
            cache,
            outbound_capacity: outbound_capacity.max(1),
            stats: Arc::new(AtomicBrokerStats::default()),
        }
    }

    /// Start a session; the receiver yields everything to send to the peer.
    pub fn open_session(&self) -> (Session, mpsc::Receiver<ServerMessage>) {
        let (outbound, rx) = mpsc::channel(self.outbound_capacity);
        self.stats.sessions_opened.fetch_add(1, Ordering::Relaxed);
        let session = Session {
            id: ConnectionId::new(),
            client_id: None,
            state: SessionState::Connected,
            directory: self.directory.clone(),
            cache: self.cache.clone(),
            outbound,
            forwarders: HashMap::new(),
            stats: self.stats.clone(),
        };
        (session, rx)
    }

    pub fn directory(&self) -> &Arc<RoomDirectory> {
        &self.directory
    }

    pub fn cache(&self) -> &Arc<EntityCache> {
        &self.cache
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            sessions_opened: self.stats.sessions_opened.load(Ordering::Relaxed),
            events_published: self.stats.events_published.load(Ordering::Relaxed),
            events_dropped: self.stats.events_dropped.load(Ordering::Relaxed),
            chunks_received: self.stats.chunks_received.load(Ordering::Relaxed),
            checkpoints_persisted: self.stats.checkpoints_persisted.load(Ordering::Relaxed),
            checkpoints_deleted: self.stats.checkpoints_deleted.load(Ordering::Relaxed),
        }
    }
}

/// One connection's view of the broker.
pub struct Session {
    id: ConnectionId,
    client_id: Option<String>,
    state: SessionState,
    directory: Arc<RoomDirectory>,
    cache: Arc<EntityCache>,
    outbound: mpsc::Sender<ServerMessage>,
    /// room id → task forwarding that room's events to `outbound`
    forwarders: HashMap<String, JoinHandle<()>>,
    stats: Arc<AtomicBrokerStats>,
}

impl Session {
    /// Handle one inbound message.
    pub async fn handle(&mut self, msg: ClientMessage) -> Result<Flow, BrokerError> {
        if self.state == SessionState::Closed {
            return Err(BrokerError::SessionClosed);
        }
        log::trace!("Session {} received {}", self.id, msg.kind());

        match msg {
            ClientMessage::Join { client_id, rooms } => {
                self.join(client_id, rooms).await;
                Ok(Flow::Continue)
            }
            ClientMessage::Leave => {
                self.send(ServerMessage::ServerLog("You are now disconnected.".to_string())).await;
                self.close().await;
                Ok(Flow::Close)
            }
            ClientMessage::Event(event) => {
                self.event(event).await?;
                Ok(Flow::Continue)
            }
            ClientMessage::Checkpoint(chunk) => {
                self.checkpoint(chunk).await?;
                Ok(Flow::Continue)
            }
            ClientMessage::Ping => {
                self.send(ServerMessage::Pong).await;
                Ok(Flow::Continue)
            }
        }
    }

    /// Join each room; a failing room is reported and skipped.
    async fn join(&mut self, client_id: Option<String>, rooms: Vec<String>) {
        if client_id.is_some() {
            self.client_id = client_id;
        }
        let client = self.display_name();

        let mut joined = Vec::new();
        for room_id in rooms {
            match self.directory.join(self.id, self.client_id.clone(), &room_id).await {
                Ok(Some(subscription)) => {
                    let handle = spawn_forwarder(subscription, self.outbound.clone());
                    self.forwarders.insert(room_id.clone(), handle);
                    joined.push(room_id);
                }
                Ok(None) => log::debug!("Client {client} already in room {room_id}"),
                Err(e) => {
                    log::error!("Client {client} could not join room {room_id}: {e}");
                    self.send(ServerMessage::JoinFailed {
                        room_id,
                        reason: e.to_string(),
                    })
                    .await;
                }
            }
        }

        self.state = SessionState::Active;
        if !joined.is_empty() {
            let text = format!("Client {client} joined rooms: {}", joined.join(", "));
            log::info!("{text}");
            self.send(ServerMessage::ServerLog(text)).await;
        }
    }

    async fn event(&mut self, event: Event) -> Result<(), BrokerError> {
        match &event.event_type {
            EventType::Unknown(name) => {
                self.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Dropping event of unrecognized type {name:?} from {}", self.display_name());
                Err(BrokerError::UnrecognizedEventType(name.clone()))
            }
            EventType::Checkpoint => {
                let chunk = ChunkMessage::from_payload(&event.payload)
                    .map_err(|e| BrokerError::MalformedEvent(format!("checkpoint payload: {e}")))?;
                self.checkpoint(chunk).await
            }
            _ => {
                let room_id = event.room_id().ok_or_else(|| {
                    self.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
                    BrokerError::MalformedEvent(format!("{} event without grid_search_id", event.event_type))
                })?;
                let room = self
                    .directory
                    .get_or_create(&room_id)
                    .await
                    .map_err(|source| BrokerError::UnknownRoom {
                        room_id: room_id.clone(),
                        source,
                    })?;
                let (event_id, receivers) = room.publish(event).await.map_err(BrokerError::Storage)?;
                self.stats.events_published.fetch_add(1, Ordering::Relaxed);
                log::debug!("Room {room_id} event {event_id} sent to {receivers} subscribers");
                Ok(())
            }
        }
    }

    async fn checkpoint(&mut self, chunk: ChunkMessage) -> Result<(), BrokerError> {
        self.stats.chunks_received.fetch_add(1, Ordering::Relaxed);
        match self.cache.handle(chunk).await? {
            ChunkOutcome::Buffered { received, expected } => {
                log::trace!("Checkpoint chunk buffered ({received}/{expected})");
            }
            ChunkOutcome::Persisted { .. } => {
                self.stats.checkpoints_persisted.fetch_add(1, Ordering::Relaxed);
            }
            ChunkOutcome::Deleted { .. } => {
                self.stats.checkpoints_deleted.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Leave every room and stop forwarding. Idempotent.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        for (_, handle) in self.forwarders.drain() {
            handle.abort();
        }
        let left = self.directory.leave_all(self.id).await;
        if !left.is_empty() {
            log::info!("Client {} left rooms: {}", self.display_name(), left.join(", "));
        }
    }

    async fn send(&self, msg: ServerMessage) {
        if self.outbound.send(msg).await.is_err() {
            log::debug!("Session {} outbound queue closed", self.id);
        }
    }

    fn display_name(&self) -> String {
        self.client_id.clone().unwrap_or_else(|| self.id.to_string())
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn joined_rooms(&self) -> Vec<String> {
        self.forwarders.keys().cloned().collect()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for (_, handle) in self.forwarders.drain() {
            handle.abort();
        }
    }
}

/// Forward one room's events, replay first, into the outbound queue.
fn spawn_forwarder(mut subscription: Subscription, outbound: mpsc::Sender<ServerMessage>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let room_id = subscription.room_id().to_string();
        loop {
            match subscription.recv().await {
                Ok(Some(logged)) => {
                    if outbound.send(ServerMessage::event(room_id.clone(), logged)).await.is_err() {
                        // Connection gone
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log::error!("Delivery from room {room_id} stopped at id {}: {e}", subscription.next_id());
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{CheckpointStore, CheckpointStoreError, MemoryEventStorage};
    use mlboard_core::CheckpointEntityKey;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct MemoryCheckpoints(StdMutex<HashMap<CheckpointEntityKey, Vec<u8>>>);

    impl CheckpointStore for MemoryCheckpoints {
        fn persist(&self, key: &CheckpointEntityKey, bytes: &[u8]) -> Result<(), CheckpointStoreError> {
            self.0.lock().unwrap().insert(key.clone(), bytes.to_vec());
            Ok(())
        }

        fn delete(&self, key: &CheckpointEntityKey) -> Result<bool, CheckpointStoreError> {
            Ok(self.0.lock().unwrap().remove(key).is_some())
        }
    }

    fn broker() -> (Broker, Arc<MemoryCheckpoints>) {
        let checkpoints = Arc::new(MemoryCheckpoints::default());
        let directory = Arc::new(RoomDirectory::new(Arc::new(MemoryEventStorage::new()), 64, 8));
        let cache = Arc::new(EntityCache::new(checkpoints.clone()));
        (Broker::new(directory, cache, 64), checkpoints)
    }

    fn status(room: &str, n: u64) -> ClientMessage {
        ClientMessage::event(EventType::JobStatus, json!({"grid_search_id": room, "n": n}))
    }

    async fn recv(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    async fn recv_event_id(rx: &mut mpsc::Receiver<ServerMessage>) -> u64 {
        loop {
            if let ServerMessage::Event { event_id, .. } = recv(rx).await {
                return event_id;
            }
        }
    }

    #[tokio::test]
    async fn test_late_joiner_gets_replay_then_live() {
        let (broker, _) = broker();
        let (mut producer, _producer_rx) = broker.open_session();
        for n in 0..3 {
            producer.handle(status("gs1", n)).await.unwrap();
        }

        let (mut observer, mut rx) = broker.open_session();
        observer
            .handle(ClientMessage::join(Some("dash".into()), vec!["gs1".into()]))
            .await
            .unwrap();
        assert_eq!(observer.state(), SessionState::Active);
        producer.handle(status("gs1", 3)).await.unwrap();

        let ids = [
            recv_event_id(&mut rx).await,
            recv_event_id(&mut rx).await,
            recv_event_id(&mut rx).await,
            recv_event_id(&mut rx).await,
        ];
        assert_eq!(ids, [0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_join_announces_server_log() {
        let (broker, _) = broker();
        let (mut session, mut rx) = broker.open_session();
        session
            .handle(ClientMessage::join(Some("w1".into()), vec!["gs1".into()]))
            .await
            .unwrap();
        match recv(&mut rx).await {
            ServerMessage::ServerLog(text) => assert!(text.contains("w1") && text.contains("gs1")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sender_receives_own_event_when_joined() {
        let (broker, _) = broker();
        let (mut session, mut rx) = broker.open_session();
        session.handle(ClientMessage::join(None, vec!["gs1".into()])).await.unwrap();
        session.handle(status("gs1", 0)).await.unwrap();
        assert_eq!(recv_event_id(&mut rx).await, 0);
    }

    #[tokio::test]
    async fn test_unknown_event_type_dropped() {
        let (broker, _) = broker();
        let (mut session, _rx) = broker.open_session();
        let msg = ClientMessage::event(EventType::parse("gpu_temp"), json!({"grid_search_id": "gs1"}));
        let err = session.handle(msg).await.unwrap_err();
        assert!(matches!(err, BrokerError::UnrecognizedEventType(ref t) if t == "gpu_temp"));
        // Non-fatal and nothing logged
        assert!(session.handle(ClientMessage::Ping).await.is_ok());
        assert_eq!(broker.directory().room_count().await, 0);
        assert_eq!(broker.stats().events_dropped, 1);
    }

    #[tokio::test]
    async fn test_event_without_room_is_malformed() {
        let (broker, _) = broker();
        let (mut session, _rx) = broker.open_session();
        let msg = ClientMessage::event(EventType::JobStatus, json!({"status": "RUNNING"}));
        assert!(matches!(
            session.handle(msg).await,
            Err(BrokerError::MalformedEvent(_))
        ));
    }

    #[tokio::test]
    async fn test_checkpoint_event_is_routed_not_logged() {
        let (broker, checkpoints) = broker();
        let (mut session, _rx) = broker.open_session();
        for (id, bytes) in [(2u32, "b2"), (0, "b0"), (1, "b1")] {
            let payload = json!({
                "grid_search_id": "gs1", "experiment_id": 0, "checkpoint_id": 5,
                "entity_id": "model", "chunk_id": id, "chunk_bytes": bytes.as_bytes(),
                "final_num_chunks": 3
            });
            session
                .handle(ClientMessage::event(EventType::Checkpoint, payload))
                .await
                .unwrap();
        }
        let key = CheckpointEntityKey::new("gs1", "0", "5", "model");
        assert_eq!(checkpoints.0.lock().unwrap()[&key], b"b0b1b2".to_vec());
        assert_eq!(broker.directory().room_count().await, 0);
        assert_eq!(broker.stats().checkpoints_persisted, 1);
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let (broker, _) = broker();
        let (mut session, mut rx) = broker.open_session();
        assert_eq!(session.handle(ClientMessage::Ping).await.unwrap(), Flow::Continue);
        assert_eq!(recv(&mut rx).await, ServerMessage::Pong);
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_leave_closes_session() {
        let (broker, _) = broker();
        let (mut session, mut rx) = broker.open_session();
        session.handle(ClientMessage::join(None, vec!["gs1".into()])).await.unwrap();
        let _ = recv(&mut rx).await;

        assert_eq!(session.handle(ClientMessage::Leave).await.unwrap(), Flow::Close);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(broker.directory().rooms_of(session.id()).await.is_empty());
        assert!(matches!(
            session.handle(ClientMessage::Ping).await,
            Err(BrokerError::SessionClosed)
        ));
        assert_eq!(broker.directory().room_count().await, 1);
    }

    #[tokio::test]
    async fn test_rejoin_same_room_is_noop() {
        let (broker, _) = broker();
        let (mut producer, _prx) = broker.open_session();
        producer.handle(status("gs1", 0)).await.unwrap();

        let (mut session, mut rx) = broker.open_session();
        session.handle(ClientMessage::join(None, vec!["gs1".into()])).await.unwrap();
        session.handle(ClientMessage::join(None, vec!["gs1".into()])).await.unwrap();
        assert_eq!(session.joined_rooms(), vec!["gs1".to_string()]);

        assert_eq!(recv_event_id(&mut rx).await, 0);
        producer.handle(status("gs1", 1)).await.unwrap();
        // A second replay would deliver id 0 again
        assert_eq!(recv_event_id(&mut rx).await, 1);
    }
}
