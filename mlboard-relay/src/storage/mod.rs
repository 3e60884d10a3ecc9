//! Persistence for room event logs and reassembled checkpoints.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐   append/read    ┌──────────────────────────────────┐
//! │ EventLog    │ ───────────────► │ EventStorage                     │
//! │ (per room)  │                  │  ├─ MemoryEventStorage           │
//! └─────────────┘                  │  └─ RocksEventStorage            │
//!                                  │       CF "events": LZ4 events   │
//!                                  │       CF "rooms" : room meta    │
//!                                  └──────────────────────────────────┘
//! ┌─────────────┐  persist/delete  ┌──────────────────────────────────┐
//! │ EntityCache │ ───────────────► │ CheckpointStore                  │
//! └─────────────┘                  │  └─ FsCheckpointStore            │
//!                                  │     <root>/gs/exp/ck/entity.ext  │
//!                                  └──────────────────────────────────┘
//! ```

pub mod checkpoints;
pub mod events;
pub mod rocks;

pub use checkpoints::{CheckpointStore, CheckpointStoreError, FsCheckpointStore};
pub use events::{EventStorage, MemoryEventStorage, StoreError};
pub use rocks::{RocksEventStorage, RoomMetadata, StoreConfig};
