//! RocksDB-backed persistent event storage.
//!
//! Column families:
//! - `events`: Logged events (bincode + LZ4, keyed by room:event_id)
//! - `rooms` : Room metadata (bincode: event_count, created_at, updated_at)
//!
//! Event key layout: `<room_len:4 BE><room_id bytes><event_id:8 BE>`, so a
//! forward scan from `(room, from)` visits one room's events in id order.
//! Reopening the database restores each room's `event_count`, which is where
//! id numbering resumes.
//!
//! Reference: Kleppmann: DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use mlboard_core::{Event, LoggedEvent};

use super::events::{EventStorage, StoreError};

/// Column family names.
const CF_EVENTS: &str = "events";
const CF_ROOMS: &str = "rooms";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_EVENTS, CF_ROOMS];

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("mlboard_data/events"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Per-room metadata stored in the `rooms` column family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomMetadata {
    pub room_id: String,
    /// Number of events stored; also the next event id
    pub event_count: u64,
    /// On-disk (LZ4-compressed) bytes of all stored event values
    pub stored_bytes: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last append timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl RoomMetadata {
    fn new(room_id: &str) -> Self {
        let now = now_secs();
        Self {
            room_id: room_id.to_string(),
            event_count: 0,
            stored_bytes: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// RocksDB-backed event storage.
pub struct RocksEventStorage {
    /// RocksDB instance (single-threaded mode: concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksEventStorage {
    /// Open the event store at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_EVENTS => {
                // Values are LZ4 compressed already
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            CF_ROOMS => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Load room metadata.
    pub fn room_metadata(&self, room_id: &str) -> Result<RoomMetadata, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        match self.db.get_cf(cf, room_id.as_bytes())? {
            Some(bytes) => RoomMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(room_id.to_string())),
        }
    }

    /// Force memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    /// Key prefix shared by all events of a room.
    fn room_prefix(room_id: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(4 + room_id.len() + 8);
        prefix.extend_from_slice(&(room_id.len() as u32).to_be_bytes());
        prefix.extend_from_slice(room_id.as_bytes());
        prefix
    }

    /// Build an event key: room prefix + event_id (8 bytes big-endian).
    fn event_key(room_id: &str, event_id: u64) -> Vec<u8> {
        let mut key = Self::room_prefix(room_id);
        key.extend_from_slice(&event_id.to_be_bytes());
        key
    }

    fn encode_event(event: &Event) -> Result<Vec<u8>, StoreError> {
        let raw = bincode::serde::encode_to_vec(event, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    fn decode_event(value: &[u8]) -> Result<Event, StoreError> {
        let raw = lz4_flex::decompress_size_prepended(value)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        let (event, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(event)
    }
}

impl EventStorage for RocksEventStorage {
    fn open_room(&self, room_id: &str) -> Result<u64, StoreError> {
        match self.room_metadata(room_id) {
            Ok(meta) => Ok(meta.event_count),
            Err(StoreError::NotFound(_)) => {
                let meta = RoomMetadata::new(room_id);
                let cf = self.cf(CF_ROOMS)?;
                self.db
                    .put_cf_opt(cf, room_id.as_bytes(), meta.encode()?, &self.write_options())?;
                log::debug!("Created persistent log for room {room_id}");
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    fn append(&self, room_id: &str, event_id: u64, event: &Event) -> Result<(), StoreError> {
        let cf_events = self.cf(CF_EVENTS)?;
        let cf_rooms = self.cf(CF_ROOMS)?;

        let mut meta = self.room_metadata(room_id)?;
        if event_id != meta.event_count {
            return Err(StoreError::OutOfOrder {
                room_id: room_id.to_string(),
                expected: meta.event_count,
                got: event_id,
            });
        }

        let value = Self::encode_event(event)?;
        meta.event_count += 1;
        meta.stored_bytes += value.len() as u64;
        meta.updated_at = now_secs();

        // Event and metadata land together or not at all
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_events, Self::event_key(room_id, event_id), &value);
        batch.put_cf(cf_rooms, room_id.as_bytes(), meta.encode()?);
        self.db.write_opt(batch, &self.write_options())?;

        Ok(())
    }

    fn read_range(&self, room_id: &str, from: u64, to: u64) -> Result<Vec<LoggedEvent>, StoreError> {
        let cf = self.cf(CF_EVENTS)?;
        let prefix = Self::room_prefix(room_id);
        let start_key = Self::event_key(room_id, from);

        let mut events = Vec::new();
        if from >= to {
            return Ok(events);
        }

        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start_key, Direction::Forward));
        for item in iter {
            let (key, value) = item?;

            // Stop once we've left this room's key range
            if key.len() != prefix.len() + 8 || !key.starts_with(&prefix) {
                break;
            }

            let mut id_buf = [0u8; 8];
            id_buf.copy_from_slice(&key[prefix.len()..]);
            let event_id = u64::from_be_bytes(id_buf);
            if event_id >= to {
                break;
            }

            events.push(LoggedEvent::new(event_id, Self::decode_event(&value)?));
        }

        Ok(events)
    }

    fn list_rooms(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        let mut rooms = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let room_id = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            rooms.push(room_id);
        }
        Ok(rooms)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
