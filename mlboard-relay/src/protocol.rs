//! Binary wire protocol between relay clients and the relay server.
//!
//! Every WebSocket binary message carries exactly one bincode-encoded frame:
//! ```text
//! client → server                      server → client
//! ┌───────────────────────────┐        ┌──────────────────────────────────┐
//! │ Join { client_id, rooms } │        │ Event { room_id, event_id, data }│
//! │ Leave                     │        │ Pong                             │
//! │ Event { type, payload }   │        │ JoinFailed { room_id, reason }   │
//! │ Checkpoint(ChunkMessage)  │        │ ServerLog(text)                  │
//! │ Ping                      │        └──────────────────────────────────┘
//! └───────────────────────────┘
//! ```
//!
//! Structured payloads are JSON text inside the frame, chunk bytes are raw.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use mlboard_core::{ChunkMessage, Event, EventType, LoggedEvent};

/// Frames sent by producers (workers) and observers to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Join rooms; each joined room is replayed, then followed live.
    Join {
        client_id: Option<String>,
        rooms: Vec<String>,
    },
    /// Leave all rooms and end the session.
    Leave,
    /// A telemetry event, addressed by `payload.grid_search_id`.
    Event(Event),
    /// A checkpoint chunk (or delete request) with raw bytes.
    Checkpoint(ChunkMessage),
    /// Liveness check.
    Ping,
}

impl ClientMessage {
    pub fn join(client_id: Option<String>, rooms: Vec<String>) -> Self {
        Self::Join { client_id, rooms }
    }

    pub fn event(event_type: EventType, payload: Value) -> Self {
        Self::Event(Event::new(event_type, payload))
    }

    /// Short label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Leave => "leave",
            Self::Event(_) => "event",
            Self::Checkpoint(_) => "checkpoint",
            Self::Ping => "ping",
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// A logged event of a joined room, replayed or live.
    Event {
        room_id: String,
        event_id: u64,
        data: Event,
    },
    /// Reply to `Ping`.
    Pong,
    /// A room of a join request could not be opened.
    JoinFailed { room_id: String, reason: String },
    /// Informational text for the operator console.
    ServerLog(String),
}

impl ServerMessage {
    pub fn event(room_id: impl Into<String>, logged: LoggedEvent) -> Self {
        Self::Event {
            room_id: room_id.into(),
            event_id: logged.event_id,
            data: logged.event,
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    /// Text frame or other non-binary payload
    UnexpectedFrame,
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::UnexpectedFrame => write!(f, "Unexpected non-binary frame"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use mlboard_core::CheckpointEntityKey;
    use serde_json::json;

    #[test]
    fn test_join_roundtrip() {
        let msg = ClientMessage::join(Some("dashboard".into()), vec!["gs1".into(), "gs2".into()]);
        let decoded = ClientMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.kind(), "join");
    }

    #[test]
    fn test_event_payload_survives_encoding() {
        let payload = json!({
            "grid_search_id": "gs1",
            "experiment_id": 4,
            "metrics": {"loss": 0.125, "acc": [0.5, 0.75]},
        });
        let msg = ClientMessage::event(EventType::EvaluationResult, payload.clone());
        match ClientMessage::decode(&msg.encode().unwrap()).unwrap() {
            ClientMessage::Event(ev) => {
                assert_eq!(ev.event_type, EventType::EvaluationResult);
                assert_eq!(ev.payload, payload);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_unknown_event_type_decodes() {
        let msg = ClientMessage::event(EventType::parse("gpu_temp"), json!({"grid_search_id": "g"}));
        let decoded = ClientMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_checkpoint_chunk_is_compact() {
        let key = CheckpointEntityKey::new("g", "e", "1", "m");
        let chunk = ClientMessage::Checkpoint(ChunkMessage::chunk(key, 0, vec![7u8; 65536], 1));
        let encoded = chunk.encode().unwrap();
        // Raw bytes plus a small header, no per-byte expansion
        assert!(encoded.len() < 65536 + 64, "encoded size {}", encoded.len());
        assert_eq!(ClientMessage::decode(&encoded).unwrap(), chunk);
    }

    #[test]
    fn test_server_event_roundtrip() {
        let logged = LoggedEvent::new(
            7,
            Event::new(EventType::JobStatus, json!({"grid_search_id": "gs1", "status": "DONE"})),
        );
        let msg = ServerMessage::event("gs1", logged.clone());
        let decoded = ServerMessage::decode(&msg.encode().unwrap()).unwrap();
        match decoded {
            ServerMessage::Event { room_id, event_id, data } => {
                assert_eq!(room_id, "gs1");
                assert_eq!(event_id, 7);
                assert_eq!(data, logged.event);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(ClientMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
        assert!(ServerMessage::decode(&[]).is_err());
    }

    #[test]
    fn test_protocol_error_display() {
        assert!(ProtocolError::UnexpectedFrame.to_string().contains("non-binary"));
        assert!(ProtocolError::DeserializationError("eof".into()).to_string().contains("eof"));
    }
}
