//! Telemetry events emitted by workers and logged per room.
//!
//! Event types arrive as strings on the wire. They are parsed into a closed
//! enum so the recognized set is explicit; anything else lands in
//! [`EventType::Unknown`] and is dropped by the broker.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Payload field naming the room (grid search) an event belongs to.
pub const ROOM_FIELD: &str = "grid_search_id";

/// Kind of a telemetry event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Experiment lifecycle change
    ExperimentStatus,
    /// Worker job status change
    JobStatus,
    /// Experiment configuration announcement
    ExperimentConfig,
    /// Metric / evaluation result
    EvaluationResult,
    /// Checkpoint chunk transfer (never logged)
    Checkpoint,
    /// Anything not in the recognized set
    Unknown(String),
}

impl EventType {
    /// Event types that are appended to the room log and broadcast.
    pub const DOMAIN: [EventType; 4] = [
        EventType::ExperimentStatus,
        EventType::JobStatus,
        EventType::ExperimentConfig,
        EventType::EvaluationResult,
    ];

    /// Parse a wire name. Never fails: unrecognized names map to `Unknown`.
    pub fn parse(name: &str) -> Self {
        match name {
            "experiment_status" => Self::ExperimentStatus,
            "job_status" => Self::JobStatus,
            "experiment_config" => Self::ExperimentConfig,
            "evaluation_result" => Self::EvaluationResult,
            "checkpoint" => Self::Checkpoint,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Wire name of this event type.
    pub fn as_str(&self) -> &str {
        match self {
            Self::ExperimentStatus => "experiment_status",
            Self::JobStatus => "job_status",
            Self::ExperimentConfig => "experiment_config",
            Self::EvaluationResult => "evaluation_result",
            Self::Checkpoint => "checkpoint",
            Self::Unknown(name) => name,
        }
    }

    /// Whether events of this type go to the room log.
    pub fn is_domain(&self) -> bool {
        matches!(
            self,
            Self::ExperimentStatus | Self::JobStatus | Self::ExperimentConfig | Self::EvaluationResult
        )
    }

    pub fn is_checkpoint(&self) -> bool {
        matches!(self, Self::Checkpoint)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for EventType {
    fn from(name: &str) -> Self {
        Self::parse(name)
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Self::parse(&name))
    }
}

/// A telemetry event as produced by a worker: type tag plus structured payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    #[serde(with = "crate::json_text")]
    pub payload: Value,
}

impl Event {
    pub fn new(event_type: EventType, payload: Value) -> Self {
        Self { event_type, payload }
    }

    /// Room this event is addressed to (`payload.grid_search_id`).
    ///
    /// Numeric ids are accepted and rendered in decimal.
    pub fn room_id(&self) -> Option<String> {
        match self.payload.get(ROOM_FIELD)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// An event after it was appended to a room log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedEvent {
    pub event_id: u64,
    pub event: Event,
}

impl LoggedEvent {
    pub fn new(event_id: u64, event: Event) -> Self {
        Self { event_id, event }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_recognized_types() {
        for ty in EventType::DOMAIN.iter() {
            assert_eq!(&EventType::parse(ty.as_str()), ty);
            assert!(ty.is_domain());
            assert!(!ty.is_checkpoint());
        }
        assert_eq!(EventType::parse("checkpoint"), EventType::Checkpoint);
        assert!(!EventType::Checkpoint.is_domain());
    }

    #[test]
    fn test_parse_unknown_type() {
        let ty = EventType::parse("gpu_temperature");
        assert_eq!(ty, EventType::Unknown("gpu_temperature".to_string()));
        assert_eq!(ty.as_str(), "gpu_temperature");
        assert!(!ty.is_domain());
    }

    #[test]
    fn test_event_type_serializes_as_wire_name() {
        let json = serde_json::to_string(&EventType::JobStatus).unwrap();
        assert_eq!(json, "\"job_status\"");
        let back: EventType = serde_json::from_str("\"evaluation_result\"").unwrap();
        assert_eq!(back, EventType::EvaluationResult);
    }

    #[test]
    fn test_room_id_from_payload() {
        let ev = Event::new(EventType::JobStatus, json!({"grid_search_id": "gs1"}));
        assert_eq!(ev.room_id().as_deref(), Some("gs1"));

        let numeric = Event::new(EventType::JobStatus, json!({"grid_search_id": 42}));
        assert_eq!(numeric.room_id().as_deref(), Some("42"));

        let missing = Event::new(EventType::JobStatus, json!({"status": "RUNNING"}));
        assert!(missing.room_id().is_none());
    }
}
