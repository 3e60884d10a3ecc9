//! Storage seam behind the per-room event logs.
//!
//! Backends only store and read; id assignment and ordering belong to
//! [`EventLog`](crate::event_log::EventLog), which calls `append` with
//! contiguous ids starting at the count returned by `open_room`.

use std::collections::HashMap;
use std::sync::RwLock;

use mlboard_core::{Event, LoggedEvent};

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Room not found
    NotFound(String),
    /// Append out of sequence for a room
    OutOfOrder { room_id: String, expected: u64, got: u64 },
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
    /// In-memory backend lock poisoned
    Poisoned,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(room) => write!(f, "Room not found: {room}"),
            StoreError::OutOfOrder { room_id, expected, got } => {
                write!(f, "Out-of-order append to room {room_id}: expected id {expected}, got {got}")
            }
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::Poisoned => write!(f, "Event storage lock poisoned"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Durable (or process-lifetime) home of room event logs.
pub trait EventStorage: Send + Sync {
    /// Open or create the log of `room_id`; returns the number of events stored.
    fn open_room(&self, room_id: &str) -> Result<u64, StoreError>;

    /// Store `event` under `event_id`, which must equal the current count.
    fn append(&self, room_id: &str, event_id: u64, event: &Event) -> Result<(), StoreError>;

    /// Events with ids in `from..to`, ascending.
    fn read_range(&self, room_id: &str, from: u64, to: u64) -> Result<Vec<LoggedEvent>, StoreError>;

    /// Ids of every room that has been opened.
    fn list_rooms(&self) -> Result<Vec<String>, StoreError>;
}

/// Process-lifetime event storage.
#[derive(Default)]
pub struct MemoryEventStorage {
    rooms: RwLock<HashMap<String, Vec<Event>>>,
}

impl MemoryEventStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventStorage for MemoryEventStorage {
    fn open_room(&self, room_id: &str) -> Result<u64, StoreError> {
        let mut rooms = self.rooms.write().map_err(|_| StoreError::Poisoned)?;
        Ok(rooms.entry(room_id.to_string()).or_default().len() as u64)
    }

    fn append(&self, room_id: &str, event_id: u64, event: &Event) -> Result<(), StoreError> {
        let mut rooms = self.rooms.write().map_err(|_| StoreError::Poisoned)?;
        let events = rooms
            .get_mut(room_id)
            .ok_or_else(|| StoreError::NotFound(room_id.to_string()))?;
        let expected = events.len() as u64;
        if event_id != expected {
            return Err(StoreError::OutOfOrder {
                room_id: room_id.to_string(),
                expected,
                got: event_id,
            });
        }
        events.push(event.clone());
        Ok(())
    }

    fn read_range(&self, room_id: &str, from: u64, to: u64) -> Result<Vec<LoggedEvent>, StoreError> {
        let rooms = self.rooms.read().map_err(|_| StoreError::Poisoned)?;
        let events = rooms
            .get(room_id)
            .ok_or_else(|| StoreError::NotFound(room_id.to_string()))?;
        let end = to.min(events.len() as u64);
        if from >= end {
            return Ok(Vec::new());
        }
        Ok(events[from as usize..end as usize]
            .iter()
            .enumerate()
            .map(|(offset, event)| LoggedEvent::new(from + offset as u64, event.clone()))
            .collect())
    }

    fn list_rooms(&self) -> Result<Vec<String>, StoreError> {
        let rooms = self.rooms.read().map_err(|_| StoreError::Poisoned)?;
        Ok(rooms.keys().cloned().collect())
    }
}
