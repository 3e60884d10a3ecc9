//! Append-only, replayable event log of one room.
//!
//! ```text
//!            append (serialized by next_id lock)
//!   event ──────────────► storage.append(room, id, event) ──► on_commit(logged)
//!                                   │
//!   replay() ◄── batches of read_range(next, next + batch) ◄┘
//! ```
//!
//! Ids start at 0 (or at the persisted count when reopened) and increase by
//! one per append. Replays read lazily in batches and hold no lock, so they
//! never block appends; each replay stops at the length observed when it was
//! created.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

use mlboard_core::{Event, LoggedEvent};

use crate::storage::{EventStorage, StoreError};

/// Default number of events fetched per replay batch.
pub const DEFAULT_REPLAY_BATCH: usize = 256;

/// Ordered event log of one room.
pub struct EventLog {
    room_id: String,
    storage: Arc<dyn EventStorage>,
    /// Next id to assign; the lock serializes appends of this room
    next_id: Mutex<u64>,
    /// Committed length, readable without the lock
    length: AtomicU64,
    replay_batch_size: usize,
}

impl EventLog {
    /// Open (or create) the log of `room_id` on `storage`.
    pub fn open(
        room_id: impl Into<String>,
        storage: Arc<dyn EventStorage>,
        replay_batch_size: usize,
    ) -> Result<Self, StoreError> {
        let room_id = room_id.into();
        let length = storage.open_room(&room_id)?;
        if length > 0 {
            log::info!("Reopened log of room {room_id} with {length} events");
        }
        Ok(Self {
            room_id,
            storage,
            next_id: Mutex::new(length),
            length: AtomicU64::new(length),
            replay_batch_size: replay_batch_size.max(1),
        })
    }

    /// Append `event` and return its id.
    pub async fn append(&self, event: Event) -> Result<u64, StoreError> {
        let (event_id, ()) = self.append_with(event, |_| ()).await?;
        Ok(event_id)
    }

    /// Append `event`, then run `on_commit` before the next append can start.
    ///
    /// Anything `on_commit` does (typically a broadcast) is ordered exactly
    /// like the appends themselves.
    pub async fn append_with<F, R>(&self, event: Event, on_commit: F) -> Result<(u64, R), StoreError>
    where
        F: FnOnce(LoggedEvent) -> R,
    {
        let mut next_id = self.next_id.lock().await;
        let event_id = *next_id;
        self.storage.append(&self.room_id, event_id, &event)?;
        *next_id += 1;
        self.length.store(*next_id, Ordering::Release);
        log::trace!("Room {} appended event {event_id} ({})", self.room_id, event.event_type);

        let result = on_commit(LoggedEvent::new(event_id, event));
        Ok((event_id, result))
    }

    /// Run `f` with the current length while no append is in progress.
    pub async fn snapshot_with<F, R>(&self, f: F) -> R
    where
        F: FnOnce(u64) -> R,
    {
        let next_id = self.next_id.lock().await;
        f(*next_id)
    }

    /// Number of committed events.
    pub fn length(&self) -> u64 {
        self.length.load(Ordering::Acquire)
    }

    /// All events committed so far, in append order.
    pub fn replay(&self) -> Replay {
        self.replay_range(0, u64::MAX)
    }

    /// Events with ids in `from..to`, capped at the current length.
    pub fn replay_range(&self, from: u64, to: u64) -> Replay {
        Replay {
            room_id: self.room_id.clone(),
            storage: self.storage.clone(),
            next: from,
            end: to.min(self.length()),
            batch_size: self.replay_batch_size as u64,
            buffer: VecDeque::new(),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }
}

/// Lazy, finite iterator over a range of a room log.
///
/// Calling [`EventLog::replay`] again restarts from the beginning.
pub struct Replay {
    room_id: String,
    storage: Arc<dyn EventStorage>,
    next: u64,
    end: u64,
    batch_size: u64,
    buffer: VecDeque<LoggedEvent>,
}

impl Replay {
    /// Events not yielded yet.
    pub fn remaining(&self) -> u64 {
        self.end.saturating_sub(self.next) + self.buffer.len() as u64
    }

    fn fill(&mut self) -> Result<(), StoreError> {
        let to = self.end.min(self.next.saturating_add(self.batch_size));
        let batch = self.storage.read_range(&self.room_id, self.next, to)?;
        if batch.len() as u64 != to - self.next {
            // Committed events must be readable; a short read means lost data
            return Err(StoreError::NotFound(format!(
                "{}: events {}..{to} (got {})",
                self.room_id,
                self.next,
                batch.len()
            )));
        }
        self.next = to;
        self.buffer.extend(batch);
        Ok(())
    }
}

impl Iterator for Replay {
    type Item = Result<LoggedEvent, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && self.next < self.end {
            if let Err(e) = self.fill() {
                // Fuse after an error
                self.next = self.end;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}
