//! Chunked checkpoint transfer: entity keys, chunk messages, reassembly.
//!
//! Large artifacts travel as independently sized chunks over the same
//! connection as telemetry events:
//! ```text
//! ┌────────────────────┬──────────┬─────────────┬──────────────────┐
//! │ key (gs/exp/ck/ent)│ chunk_id │ chunk_bytes │ final_num_chunks │
//! └────────────────────┴──────────┴─────────────┴──────────────────┘
//! ```
//! `final_num_chunks == 0` is a delete request, not data. Chunks may arrive
//! in any order, with gaps or duplicates; reassembly is always by ascending
//! `chunk_id`.

use std::collections::BTreeMap;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Identity of one artifact undergoing chunked transfer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CheckpointEntityKey {
    pub grid_search_id: String,
    pub experiment_id: String,
    pub checkpoint_id: String,
    pub entity_id: String,
}

impl CheckpointEntityKey {
    pub fn new(
        grid_search_id: impl Into<String>,
        experiment_id: impl Into<String>,
        checkpoint_id: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        Self {
            grid_search_id: grid_search_id.into(),
            experiment_id: experiment_id.into(),
            checkpoint_id: checkpoint_id.into(),
            entity_id: entity_id.into(),
        }
    }

    /// The four components, outermost first.
    pub fn components(&self) -> [&str; 4] {
        [
            &self.grid_search_id,
            &self.experiment_id,
            &self.checkpoint_id,
            &self.entity_id,
        ]
    }
}

impl std::fmt::Display for CheckpointEntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.grid_search_id, self.experiment_id, self.checkpoint_id, self.entity_id
        )
    }
}

/// One fragment of a checkpoint entity, or a delete request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMessage {
    pub key: CheckpointEntityKey,
    pub chunk_id: u32,
    pub chunk_bytes: Vec<u8>,
    /// Announced total; `0` means "delete this entity".
    pub final_num_chunks: u32,
}

impl ChunkMessage {
    /// Create a data chunk.
    pub fn chunk(
        key: CheckpointEntityKey,
        chunk_id: u32,
        chunk_bytes: Vec<u8>,
        final_num_chunks: u32,
    ) -> Self {
        Self {
            key,
            chunk_id,
            chunk_bytes,
            final_num_chunks,
        }
    }

    /// Create a delete request for `key`.
    pub fn delete(key: CheckpointEntityKey) -> Self {
        Self {
            key,
            chunk_id: 0,
            chunk_bytes: Vec::new(),
            final_num_chunks: 0,
        }
    }

    pub fn is_delete(&self) -> bool {
        self.final_num_chunks == 0
    }

    /// Parse the flat JSON payload of a `checkpoint` event:
    /// `{grid_search_id, experiment_id, checkpoint_id, entity_id, chunk_id,
    /// chunk_bytes, final_num_chunks}`. Ids may be strings or integers.
    pub fn from_payload(payload: &Value) -> Result<Self, serde_json::Error> {
        let flat = FlatChunk::deserialize(payload)?;
        Ok(Self {
            key: CheckpointEntityKey {
                grid_search_id: flat.grid_search_id,
                experiment_id: flat.experiment_id,
                checkpoint_id: flat.checkpoint_id,
                entity_id: flat.entity_id,
            },
            chunk_id: flat.chunk_id,
            chunk_bytes: flat.chunk_bytes,
            final_num_chunks: flat.final_num_chunks,
        })
    }
}

#[derive(Deserialize)]
struct FlatChunk {
    #[serde(deserialize_with = "id_string")]
    grid_search_id: String,
    #[serde(deserialize_with = "id_string")]
    experiment_id: String,
    #[serde(deserialize_with = "id_string")]
    checkpoint_id: String,
    #[serde(deserialize_with = "id_string")]
    entity_id: String,
    #[serde(default)]
    chunk_id: u32,
    #[serde(default)]
    chunk_bytes: Vec<u8>,
    final_num_chunks: u32,
}

fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(D::Error::custom(format!("expected string or integer id, got {other}"))),
    }
}

/// Transfer status of one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    InProgress,
    Transferred,
}

/// Accumulates the chunks of a single checkpoint entity.
#[derive(Debug)]
pub struct ChunkAssembler {
    key: CheckpointEntityKey,
    /// chunk_id → bytes; ordered so reassembly is a plain in-order walk
    chunks: BTreeMap<u32, Vec<u8>>,
    final_num_chunks: u32,
    buffered_bytes: usize,
}

impl ChunkAssembler {
    pub fn new(key: CheckpointEntityKey) -> Self {
        Self {
            key,
            chunks: BTreeMap::new(),
            final_num_chunks: 0,
            buffered_bytes: 0,
        }
    }

    /// Record a chunk. A repeated `chunk_id` overwrites the earlier bytes.
    ///
    /// The announced total is the maximum seen across chunks.
    pub fn add_chunk(&mut self, chunk_id: u32, chunk_bytes: Vec<u8>, final_num_chunks: u32) -> TransferStatus {
        self.final_num_chunks = self.final_num_chunks.max(final_num_chunks);
        self.buffered_bytes += chunk_bytes.len();
        if let Some(previous) = self.chunks.insert(chunk_id, chunk_bytes) {
            self.buffered_bytes -= previous.len();
            log::debug!("Chunk {chunk_id} of entity {} overwritten", self.key);
        }
        self.status()
    }

    pub fn status(&self) -> TransferStatus {
        if self.final_num_chunks > 0 && self.chunks.len() == self.final_num_chunks as usize {
            TransferStatus::Transferred
        } else {
            TransferStatus::InProgress
        }
    }

    /// Concatenate all held chunks in ascending `chunk_id` order.
    pub fn assemble(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.buffered_bytes);
        for chunk in self.chunks.values() {
            bytes.extend_from_slice(chunk);
        }
        bytes
    }

    /// Drop all buffered chunk bytes.
    pub fn release(&mut self) {
        self.chunks.clear();
        self.buffered_bytes = 0;
    }

    /// Ids in `0..final_num_chunks` not received yet.
    pub fn missing_chunks(&self) -> Vec<u32> {
        (0..self.final_num_chunks)
            .filter(|id| !self.chunks.contains_key(id))
            .collect()
    }

    pub fn key(&self) -> &CheckpointEntityKey {
        &self.key
    }

    pub fn received_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn final_num_chunks(&self) -> u32 {
        self.final_num_chunks
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }
}
