//! Checkpoint reassembly cache.
//!
//! Maps each [`CheckpointEntityKey`] to a [`ChunkAssembler`] behind its own
//! mutex, so transfers of different entities never contend. Once an entity is
//! complete it is handed to the [`CheckpointStore`] on the blocking pool; on
//! success the buffer is released and the entry evicted. After a retryable
//! failure the entry stays (bytes intact) until [`EntityCache::retry_pending`]
//! or a later chunk persists it; any other failure drops it.
//!
//! Lock order is entry, then map. A chunk that acquires an entry which was
//! evicted while it waited starts a fresh transfer.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use mlboard_core::{CheckpointEntityKey, ChunkAssembler, ChunkMessage, TransferStatus};

use crate::storage::{CheckpointStore, CheckpointStoreError};

/// Checkpoint transfer errors.
#[derive(Debug)]
pub enum CheckpointError {
    /// The store rejected the artifact; retained for retry when retryable
    Persistence {
        key: CheckpointEntityKey,
        source: CheckpointStoreError,
    },
    /// The blocking store task panicked or was cancelled
    TaskFailed { key: CheckpointEntityKey, reason: String },
}

impl CheckpointError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Persistence { source, .. } => source.is_retryable(),
            Self::TaskFailed { .. } => false,
        }
    }
}

impl std::fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Persistence { key, source } => {
                write!(f, "Failed to persist checkpoint {key}: {source}")
            }
            Self::TaskFailed { key, reason } => write!(f, "Checkpoint {key} store task failed: {reason}"),
        }
    }
}

impl std::error::Error for CheckpointError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Persistence { source, .. } => Some(source),
            Self::TaskFailed { .. } => None,
        }
    }
}

/// What happened to one chunk message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Stored; the entity is still incomplete
    Buffered { received: usize, expected: u32 },
    /// Completed and handed to the store
    Persisted { bytes: usize },
    /// Delete request processed
    Deleted { cached: bool, stored: bool },
}

struct CacheEntry {
    assembler: ChunkAssembler,
    evicted: bool,
}

/// Shared map of in-flight checkpoint transfers.
pub struct EntityCache {
    entries: RwLock<HashMap<CheckpointEntityKey, Arc<Mutex<CacheEntry>>>>,
    store: Arc<dyn CheckpointStore>,
}

impl EntityCache {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Route a chunk message: delete request or data chunk.
    pub async fn handle(&self, msg: ChunkMessage) -> Result<ChunkOutcome, CheckpointError> {
        if msg.is_delete() {
            self.delete(&msg.key).await
        } else {
            self.add_chunk(msg).await
        }
    }

    /// Record one chunk; persist and evict the entity once it is complete.
    pub async fn add_chunk(&self, msg: ChunkMessage) -> Result<ChunkOutcome, CheckpointError> {
        let ChunkMessage {
            key,
            chunk_id,
            chunk_bytes,
            final_num_chunks,
        } = msg;

        loop {
            let entry = self.entry(&key).await;
            let mut guard = entry.lock().await;
            if guard.evicted {
                // Completed or deleted while we waited; start over
                continue;
            }

            let status = guard.assembler.add_chunk(chunk_id, chunk_bytes, final_num_chunks);
            return match status {
                TransferStatus::InProgress => {
                    if log::log_enabled!(log::Level::Trace) {
                        log::trace!("Checkpoint {key} missing chunks {:?}", guard.assembler.missing_chunks());
                    }
                    Ok(ChunkOutcome::Buffered {
                        received: guard.assembler.received_chunks(),
                        expected: guard.assembler.final_num_chunks(),
                    })
                }
                TransferStatus::Transferred => self.complete(&key, &entry, &mut guard).await,
            };
        }
    }

    /// Drop any in-flight transfer of `key` and remove its stored artifact.
    pub async fn delete(&self, key: &CheckpointEntityKey) -> Result<ChunkOutcome, CheckpointError> {
        let removed = self.entries.write().await.remove(key);
        let cached = match removed {
            Some(entry) => {
                let mut guard = entry.lock().await;
                guard.evicted = true;
                guard.assembler.release();
                true
            }
            None => false,
        };

        let owned = key.clone();
        let stored = self.run_store(key, move |store| store.delete(&owned)).await?;
        log::info!("Checkpoint {key} deleted (cached: {cached}, stored: {stored})");
        Ok(ChunkOutcome::Deleted { cached, stored })
    }

    /// Retry persisting complete entities whose earlier persist failed.
    ///
    /// Returns how many were persisted now.
    pub async fn retry_pending(&self) -> usize {
        let entries: Vec<(CheckpointEntityKey, Arc<Mutex<CacheEntry>>)> = self
            .entries
            .read()
            .await
            .iter()
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect();

        let mut persisted = 0;
        for (key, entry) in entries {
            let mut guard = entry.lock().await;
            if guard.evicted || guard.assembler.status() != TransferStatus::Transferred {
                continue;
            }
            match self.complete(&key, &entry, &mut guard).await {
                Ok(_) => persisted += 1,
                Err(e) => log::warn!("Retry failed: {e}"),
            }
        }
        persisted
    }

    /// Number of cached (in-flight or unpersisted) entities.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn contains(&self, key: &CheckpointEntityKey) -> bool {
        self.entries.read().await.contains_key(key)
    }

    /// Transfer status of a cached entity.
    pub async fn status(&self, key: &CheckpointEntityKey) -> Option<TransferStatus> {
        let entry = self.entries.read().await.get(key).cloned()?;
        let guard = entry.lock().await;
        Some(guard.assembler.status())
    }

    /// Get or create the entry for `key`.
    async fn entry(&self, key: &CheckpointEntityKey) -> Arc<Mutex<CacheEntry>> {
        // Fast path: read lock
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(key) {
                return entry.clone();
            }
        }

        let mut entries = self.entries.write().await;
        entries
            .entry(key.clone())
            .or_insert_with(|| {
                log::debug!("New checkpoint transfer {key}");
                Arc::new(Mutex::new(CacheEntry {
                    assembler: ChunkAssembler::new(key.clone()),
                    evicted: false,
                }))
            })
            .clone()
    }

    /// Persist a complete entity; on success release and evict it.
    ///
    /// A failure that retrying cannot fix also releases and evicts it.
    async fn complete(
        &self,
        key: &CheckpointEntityKey,
        entry: &Arc<Mutex<CacheEntry>>,
        guard: &mut CacheEntry,
    ) -> Result<ChunkOutcome, CheckpointError> {
        let bytes = guard.assembler.assemble();
        let len = bytes.len();
        let owned = key.clone();
        if let Err(e) = self.run_store(key, move |store| store.persist(&owned, &bytes)).await {
            if e.is_retryable() {
                log::error!("Persisting checkpoint {key} failed, keeping it cached: {e}");
            } else {
                log::error!("Persisting checkpoint {key} failed permanently, dropping it: {e}");
                self.evict(key, entry, guard).await;
            }
            return Err(e);
        }

        self.evict(key, entry, guard).await;
        log::info!("Checkpoint {key} transferred ({len} bytes)");
        Ok(ChunkOutcome::Persisted { bytes: len })
    }

    /// Release the entity's buffer and remove it from the map if still current.
    async fn evict(&self, key: &CheckpointEntityKey, entry: &Arc<Mutex<CacheEntry>>, guard: &mut CacheEntry) {
        guard.assembler.release();
        guard.evicted = true;
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|current| Arc::ptr_eq(current, entry)) {
            entries.remove(key);
        }
    }

    /// Run a store operation on the blocking pool.
    async fn run_store<T, F>(&self, key: &CheckpointEntityKey, op: F) -> Result<T, CheckpointError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn CheckpointStore) -> Result<T, CheckpointStoreError> + Send + 'static,
    {
        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || op(store.as_ref())).await {
            Ok(result) => result.map_err(|source| CheckpointError::Persistence {
                key: key.clone(),
                source,
            }),
            Err(e) => Err(CheckpointError::TaskFailed {
                key: key.clone(),
                reason: e.to_string(),
            }),
        }
    }
}
