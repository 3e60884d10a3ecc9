//! # mlboard-relay: Real-time telemetry relay for experiment runs
//!
//! Workers stream status events, metrics and checkpoints over WebSocket;
//! the relay logs events per room (grid search), fans them out to observers
//! and reassembles chunked checkpoints before persisting them.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐     WebSocket      ┌─────────────┐
//! │ TelemetryClient│ ◄─────────────────► │ RelayServer │
//! │ (worker/viewer)│     Binary Proto    │ (central)   │
//! └────────────────┘                     └──────┬──────┘
//!                                               │ Session per connection
//!                                        ┌──────┴──────┐
//!                                        │   Broker    │
//!                                        └──┬───────┬──┘
//!                                           ▼       ▼
//!                                 ┌──────────────┐ ┌─────────────┐
//!                                 │RoomDirectory │ │ EntityCache │
//!                                 │ EventLog +   │ │ChunkAssembler│
//!                                 │ Broadcast    │ └──────┬──────┘
//!                                 └──────┬───────┘        ▼
//!                                        ▼         CheckpointStore
//!                                   EventStorage
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded frames)
//! - [`event_log`]: Ordered, replayable per-room event log
//! - [`rooms`]: Rooms, fan-out and replay-then-live subscriptions
//! - [`entity_cache`]: Checkpoint chunk reassembly and persistence
//! - [`broker`]: Per-connection message routing
//! - [`server`]: WebSocket relay server
//! - [`client`]: WebSocket telemetry client with offline queue
//! - [`storage`]: Event storage backends and checkpoint store

pub mod protocol;
pub mod event_log;
pub mod rooms;
pub mod entity_cache;
pub mod broker;
pub mod server;
pub mod client;
pub mod storage;

// Re-exports for convenience
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
pub use event_log::{EventLog, Replay};
pub use rooms::{BroadcastGroup, BroadcastStats, Room, RoomDirectory, Subscription};
pub use entity_cache::{CheckpointError, ChunkOutcome, EntityCache};
pub use broker::{Broker, BrokerError, BrokerStats, Flow, Session, SessionState};
pub use server::{ConfigError, RelayServer, ServerConfig, ServerStats};
pub use client::{ClientConfig, ClientEvent, ConnectionState, OfflineQueue, TelemetryClient};
pub use storage::{
    CheckpointStore, CheckpointStoreError, EventStorage, FsCheckpointStore,
    MemoryEventStorage, RocksEventStorage, RoomMetadata, StoreConfig, StoreError,
};
