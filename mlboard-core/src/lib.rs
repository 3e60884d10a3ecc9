//! # mlboard-core: Data model for the mlboard telemetry relay
//!
//! Shared types used by the relay server and its clients:
//!
//! ```text
//! ┌──────────────┐  domain events   ┌──────────────┐
//! │ Event        │ ───────────────► │ EventLog     │  (per room)
//! │ (type+json)  │                  │ LoggedEvent  │
//! └──────────────┘                  └──────────────┘
//!
//! ┌──────────────┐  chunk messages  ┌──────────────┐
//! │ ChunkMessage │ ───────────────► │ChunkAssembler│  (per entity key)
//! └──────────────┘                  └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`event`]: Event types, payloads and logged events
//! - [`checkpoint`]: Checkpoint entity keys, chunk messages, reassembly
//! - [`json_text`]: Serde adapter carrying JSON values as text

pub mod checkpoint;
pub mod event;
pub mod json_text;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use checkpoint::{CheckpointEntityKey, ChunkAssembler, ChunkMessage, TransferStatus};
pub use event::{Event, EventType, LoggedEvent, ROOM_FIELD};

/// Identity of one client session on the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Allocate a fresh random connection id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_ids_are_unique() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string(), a.0.to_string());
    }
}
