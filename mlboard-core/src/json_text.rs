//! Serde adapter that carries a [`serde_json::Value`] as compact JSON text.
//!
//! Binary formats such as bincode cannot deserialize self-describing values,
//! so structured payloads cross them as a string and are re-parsed on the
//! other side. Use with `#[serde(with = "mlboard_core::json_text")]`.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serializer};
use serde_json::Value;

pub fn serialize<S>(value: &Value, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&value.to_string())
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Value, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    serde_json::from_str(&text).map_err(D::Error::custom)
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use serde_json::{json, Value};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Carrier {
        #[serde(with = "super")]
        payload: Value,
    }

    #[test]
    fn test_json_text_through_bincode() {
        let carrier = Carrier {
            payload: json!({"grid_search_id": "gs1", "loss": 0.25, "tags": ["a", "b"]}),
        };
        let bytes = bincode::serde::encode_to_vec(&carrier, bincode::config::standard()).unwrap();
        let (decoded, _): (Carrier, _) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        assert_eq!(decoded, carrier);
    }

    #[test]
    fn test_json_text_rejects_invalid_json() {
        #[derive(Serialize)]
        struct Raw {
            payload: String,
        }
        let raw = Raw { payload: "{not json".to_string() };
        let bytes = bincode::serde::encode_to_vec(&raw, bincode::config::standard()).unwrap();
        let decoded: Result<(Carrier, usize), _> =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard());
        assert!(decoded.is_err());
    }
}
