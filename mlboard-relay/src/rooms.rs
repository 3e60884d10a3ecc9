//! Rooms: one event log plus one broadcast group per room id.
//!
//! ```text
//!                    ┌──────────── Room "gs1" ─────────────┐
//!  publish(event) ──►│ EventLog ──on_commit──► broadcast tx │──► Subscription (conn A)
//!                    │                                     │──► Subscription (conn B)
//!                    └─────────────────────────────────────┘
//! ```
//!
//! A joining connection subscribes to the broadcast channel and snapshots the
//! log length under the log's append lock, so every event is either in its
//! replay or on its receiver. The subscription also tracks the next expected
//! id: duplicates are skipped and gaps (a lagging receiver) are back-filled
//! from the log.
//!
//! Reference: Patterson & Hennessy, Section 6.4: Interconnection Networks

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};

use mlboard_core::{ConnectionId, Event, LoggedEvent};

use crate::event_log::{EventLog, Replay};
use crate::storage::{EventStorage, StoreError};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub events_sent: u64,
    pub lagged_receivers: u64,
    pub backfilled_events: u64,
    pub active_members: usize,
}

/// Atomic broadcast stats: lock-free on the hot path.
#[derive(Default)]
struct AtomicBroadcastStats {
    events_sent: AtomicU64,
    lagged_receivers: AtomicU64,
    backfilled_events: AtomicU64,
}

/// A connection joined to a room.
#[derive(Debug, Clone)]
pub struct Member {
    pub client_id: Option<String>,
    pub joined_at: Instant,
}

/// Fan-out of committed events to every member of a room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<LoggedEvent>>,
    members: RwLock<HashMap<ConnectionId, Member>>,
    /// Events buffered per receiver before it lags
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// Create a new broadcast group with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            members: RwLock::new(HashMap::new()),
            capacity,
            atomic_stats: AtomicBroadcastStats::default(),
        }
    }

    async fn add_member(&self, conn: ConnectionId, client_id: Option<String>) {
        let member = Member {
            client_id,
            joined_at: Instant::now(),
        };
        self.members.write().await.insert(conn, member);
    }

    async fn remove_member(&self, conn: &ConnectionId) -> Option<Member> {
        self.members.write().await.remove(conn)
    }

    /// Send a committed event to every receiver. Returns the receiver count.
    fn broadcast(&self, event: Arc<LoggedEvent>) -> usize {
        let count = self.sender.send(event).unwrap_or(0);
        self.atomic_stats.events_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn has_member(&self, conn: &ConnectionId) -> bool {
        self.members.read().await.contains_key(conn)
    }

    pub async fn members(&self) -> Vec<(ConnectionId, Member)> {
        self.members
            .read()
            .await
            .iter()
            .map(|(id, m)| (*id, m.clone()))
            .collect()
    }

    /// Get broadcast statistics (lock-free snapshot, plus member count).
    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            events_sent: self.atomic_stats.events_sent.load(Ordering::Relaxed),
            lagged_receivers: self.atomic_stats.lagged_receivers.load(Ordering::Relaxed),
            backfilled_events: self.atomic_stats.backfilled_events.load(Ordering::Relaxed),
            active_members: self.member_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A room: its log and its live fan-out.
pub struct Room {
    id: String,
    log: EventLog,
    group: BroadcastGroup,
}

impl Room {
    pub fn new(id: impl Into<String>, log: EventLog, broadcast_capacity: usize) -> Self {
        Self {
            id: id.into(),
            log,
            group: BroadcastGroup::new(broadcast_capacity),
        }
    }

    /// Append `event` and broadcast it to current subscribers.
    ///
    /// Returns the assigned id and the number of live receivers.
    pub async fn publish(&self, event: Event) -> Result<(u64, usize), StoreError> {
        self.log
            .append_with(event, |logged| self.group.broadcast(Arc::new(logged)))
            .await
    }

    /// Subscribe `conn`: full replay first, then live events.
    pub async fn subscribe(self: &Arc<Self>, conn: ConnectionId, client_id: Option<String>) -> Subscription {
        self.group.add_member(conn, client_id).await;
        let (receiver, length) = self
            .log
            .snapshot_with(|length| (self.group.sender.subscribe(), length))
            .await;
        log::debug!("Connection {conn} subscribed to room {} at length {length}", self.id);
        Subscription {
            room: self.clone(),
            replay: Some(self.log.replay_range(0, length)),
            receiver,
            next_id: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn group(&self) -> &BroadcastGroup {
        &self.group
    }
}

/// Ordered per-connection view of a room: replay, then live.
pub struct Subscription {
    room: Arc<Room>,
    /// Pending replay or backfill
    replay: Option<Replay>,
    receiver: broadcast::Receiver<Arc<LoggedEvent>>,
    /// Next id this subscriber must see
    next_id: u64,
}

impl Subscription {
    /// Next event in log order. `Ok(None)` once the room is gone.
    pub async fn recv(&mut self) -> Result<Option<LoggedEvent>, StoreError> {
        loop {
            if let Some(replay) = self.replay.as_mut() {
                match replay.next() {
                    Some(Ok(event)) => {
                        if event.event_id < self.next_id {
                            continue;
                        }
                        self.next_id = event.event_id + 1;
                        return Ok(Some(event));
                    }
                    Some(Err(e)) => {
                        self.replay = None;
                        return Err(e);
                    }
                    None => self.replay = None,
                }
            }

            match self.receiver.recv().await {
                Ok(event) => {
                    if event.event_id < self.next_id {
                        // Already delivered by the replay
                        continue;
                    }
                    if event.event_id > self.next_id {
                        self.backfill(event.event_id + 1);
                        continue;
                    }
                    self.next_id += 1;
                    return Ok(Some(LoggedEvent::clone(&event)));
                }
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!(
                        "Subscriber of room {} lagged by {skipped} events, back-filling from log",
                        self.room.id
                    );
                    self.room.group.atomic_stats.lagged_receivers.fetch_add(1, Ordering::Relaxed);
                    self.backfill(self.room.log.length());
                }
                Err(RecvError::Closed) => return Ok(None),
            }
        }
    }

    fn backfill(&mut self, to: u64) {
        let replay = self.room.log.replay_range(self.next_id, to);
        self.room
            .group
            .atomic_stats
            .backfilled_events
            .fetch_add(replay.remaining(), Ordering::Relaxed);
        self.replay = Some(replay);
    }

    pub fn room_id(&self) -> &str {
        &self.room.id
    }

    pub fn next_id(&self) -> u64 {
        self.next_id
    }
}

/// Room directory: room ids to rooms, connections to joined rooms.
pub struct RoomDirectory {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    memberships: RwLock<HashMap<ConnectionId, HashSet<String>>>,
    storage: Arc<dyn EventStorage>,
    broadcast_capacity: usize,
    replay_batch_size: usize,
}

impl RoomDirectory {
    pub fn new(storage: Arc<dyn EventStorage>, broadcast_capacity: usize, replay_batch_size: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            memberships: RwLock::new(HashMap::new()),
            storage,
            broadcast_capacity,
            replay_batch_size,
        }
    }

    /// Get or create the room (and its log) for `room_id`.
    pub async fn get_or_create(&self, room_id: &str) -> Result<Arc<Room>, StoreError> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_id) {
                return Ok(room.clone());
            }
        }

        // Slow path: write lock to create
        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(room_id) {
            return Ok(room.clone());
        }

        let log = EventLog::open(room_id, self.storage.clone(), self.replay_batch_size)?;
        let room = Arc::new(Room::new(room_id, log, self.broadcast_capacity));
        rooms.insert(room_id.to_string(), room.clone());
        log::info!("Room {room_id} created");
        Ok(room)
    }

    pub async fn get(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Join `conn` to `room_id`.
    ///
    /// Returns `None` if the connection already joined the room.
    pub async fn join(
        &self,
        conn: ConnectionId,
        client_id: Option<String>,
        room_id: &str,
    ) -> Result<Option<Subscription>, StoreError> {
        let room = self.get_or_create(room_id).await?;
        {
            let mut memberships = self.memberships.write().await;
            if !memberships.entry(conn).or_default().insert(room_id.to_string()) {
                return Ok(None);
            }
        }
        Ok(Some(room.subscribe(conn, client_id).await))
    }

    /// Remove `conn` from `room_id`. The room and its log stay.
    pub async fn leave(&self, conn: ConnectionId, room_id: &str) -> bool {
        let removed = {
            let mut memberships = self.memberships.write().await;
            match memberships.get_mut(&conn) {
                Some(rooms) => {
                    let removed = rooms.remove(room_id);
                    if rooms.is_empty() {
                        memberships.remove(&conn);
                    }
                    removed
                }
                None => false,
            }
        };
        if removed {
            if let Some(room) = self.get(room_id).await {
                room.group.remove_member(&conn).await;
            }
        }
        removed
    }

    /// Remove every membership of `conn`; returns the rooms it left.
    pub async fn leave_all(&self, conn: ConnectionId) -> Vec<String> {
        let left: Vec<String> = self
            .memberships
            .write()
            .await
            .remove(&conn)
            .map(|rooms| rooms.into_iter().collect())
            .unwrap_or_default();
        for room_id in &left {
            if let Some(room) = self.get(room_id).await {
                room.group.remove_member(&conn).await;
            }
        }
        left
    }

    pub async fn rooms_of(&self, conn: ConnectionId) -> Vec<String> {
        self.memberships
            .read()
            .await
            .get(&conn)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn room_ids(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Open every room the storage backend already knows.
    pub async fn recover(&self) -> Result<usize, StoreError> {
        let room_ids = self.storage.list_rooms()?;
        for room_id in &room_ids {
            self.get_or_create(room_id).await?;
        }
        Ok(room_ids.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryEventStorage;
    use mlboard_core::EventType;
    use serde_json::json;

    fn directory(capacity: usize) -> RoomDirectory {
        RoomDirectory::new(Arc::new(MemoryEventStorage::new()), capacity, 4)
    }

    fn event(room: &str, n: u64) -> Event {
        Event::new(EventType::JobStatus, json!({"grid_search_id": room, "n": n}))
    }

    async fn next_id(sub: &mut Subscription) -> u64 {
        sub.recv().await.unwrap().unwrap().event_id
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let dir = directory(16);
        let a = dir.get_or_create("gs1").await.unwrap();
        let b = dir.get_or_create("gs1").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(dir.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_join_replays_then_follows_live() {
        let dir = directory(16);
        let room = dir.get_or_create("gs1").await.unwrap();
        for n in 0..3 {
            room.publish(event("gs1", n)).await.unwrap();
        }

        let conn = ConnectionId::new();
        let mut sub = dir.join(conn, None, "gs1").await.unwrap().unwrap();
        room.publish(event("gs1", 3)).await.unwrap();
        room.publish(event("gs1", 4)).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(next_id(&mut sub).await);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_rejoin_is_noop() {
        let dir = directory(16);
        let conn = ConnectionId::new();
        assert!(dir.join(conn, None, "gs1").await.unwrap().is_some());
        assert!(dir.join(conn, None, "gs1").await.unwrap().is_none());
        assert_eq!(dir.rooms_of(conn).await, vec!["gs1".to_string()]);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_is_backfilled() {
        // Capacity 2: the receiver overflows and must fall back to the log
        let dir = directory(2);
        let conn = ConnectionId::new();
        let mut sub = dir.join(conn, None, "gs1").await.unwrap().unwrap();
        let room = dir.get("gs1").await.unwrap();
        for n in 0..20 {
            room.publish(event("gs1", n)).await.unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..20 {
            seen.push(next_id(&mut sub).await);
        }
        assert_eq!(seen, (0..20).collect::<Vec<u64>>());
        let stats = room.group().stats().await;
        assert!(stats.lagged_receivers >= 1);
        assert!(stats.backfilled_events > 0);
    }

    #[tokio::test]
    async fn test_concurrent_publish_during_join_has_no_gaps_or_duplicates() {
        let dir = Arc::new(directory(1024));
        let room = dir.get_or_create("gs1").await.unwrap();
        for n in 0..50 {
            room.publish(event("gs1", n)).await.unwrap();
        }

        let publisher = {
            let room = room.clone();
            tokio::spawn(async move {
                for n in 50..150 {
                    room.publish(event("gs1", n)).await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        let mut sub = dir.join(ConnectionId::new(), None, "gs1").await.unwrap().unwrap();
        publisher.await.unwrap();

        for expected in 0..150 {
            assert_eq!(next_id(&mut sub).await, expected);
        }
    }

    #[tokio::test]
    async fn test_leave_keeps_room() {
        let dir = directory(16);
        let conn = ConnectionId::new();
        let _sub = dir.join(conn, Some("worker-1".into()), "gs1").await.unwrap();
        let room = dir.get("gs1").await.unwrap();
        assert!(room.group().has_member(&conn).await);

        assert!(dir.leave(conn, "gs1").await);
        assert!(!dir.leave(conn, "gs1").await);
        assert!(!room.group().has_member(&conn).await);
        assert_eq!(dir.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_leave_all() {
        let dir = directory(16);
        let conn = ConnectionId::new();
        dir.join(conn, None, "a").await.unwrap();
        dir.join(conn, None, "b").await.unwrap();
        let mut left = dir.leave_all(conn).await;
        left.sort();
        assert_eq!(left, vec!["a".to_string(), "b".to_string()]);
        assert!(dir.rooms_of(conn).await.is_empty());
        assert_eq!(dir.room_count().await, 2);
    }

    #[tokio::test]
    async fn test_recover_opens_stored_rooms() {
        let storage: Arc<dyn EventStorage> = Arc::new(MemoryEventStorage::new());
        storage.open_room("gs1").unwrap();
        storage.append("gs1", 0, &event("gs1", 0)).unwrap();
        storage.open_room("gs2").unwrap();

        let dir = RoomDirectory::new(storage, 16, 4);
        assert_eq!(dir.recover().await.unwrap(), 2);
        let room = dir.get("gs1").await.unwrap();
        assert_eq!(room.log().length(), 1);
        assert_eq!(room.publish(event("gs1", 1)).await.unwrap().0, 1);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_member() {
        let dir = directory(16);
        let mut subs = Vec::new();
        for _ in 0..3 {
            subs.push(dir.join(ConnectionId::new(), None, "gs1").await.unwrap().unwrap());
        }
        let room = dir.get("gs1").await.unwrap();
        let (id, receivers) = room.publish(event("gs1", 0)).await.unwrap();
        assert_eq!(id, 0);
        assert_eq!(receivers, 3);
        for sub in subs.iter_mut() {
            assert_eq!(next_id(sub).await, 0);
        }
    }
}
