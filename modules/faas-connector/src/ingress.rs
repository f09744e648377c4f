//! Decoding of raw broker records into envelopes.
//!
//! A record that cannot be decoded never stops consumption: it becomes a
//! [`PoisonSignal`] the dispatcher reports on.

use event_bus::{validate_envelope_fields, BusMessage, EventEnvelope};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed JSON: {0}")]
    Json(String),

    #[error("envelope schema violation: {0}")]
    Schema(String),
}

/// A record that failed to decode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoisonSignal {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub raw: Vec<u8>,
    pub error: DecodeError,
}

impl std::fmt::Display for PoisonSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "poison record at {}[{}]@{}: {}",
            self.topic, self.partition, self.offset, self.error
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Ingress {
    Envelope(EventEnvelope),
    Poison(PoisonSignal),
}

/// Decode one consumed record
pub fn decode(message: &BusMessage) -> Ingress {
    match decode_envelope(&message.payload) {
        Ok(envelope) => Ingress::Envelope(envelope),
        Err(error) => Ingress::Poison(PoisonSignal {
            topic: message.subject.clone(),
            partition: message.partition,
            offset: message.offset,
            raw: message.payload.clone(),
            error,
        }),
    }
}

fn decode_envelope(payload: &[u8]) -> Result<EventEnvelope, DecodeError> {
    let value: Value =
        serde_json::from_slice(payload).map_err(|e| DecodeError::Json(e.to_string()))?;

    validate_envelope_fields(&value).map_err(DecodeError::Schema)?;

    serde_json::from_value(value).map_err(|e| DecodeError::Schema(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(payload: &[u8]) -> BusMessage {
        BusMessage::new("fn.in".to_string(), payload.to_vec()).with_position(3, 41)
    }

    #[test]
    fn test_valid_record_decodes() {
        let payload = serde_json::to_vec(&json!({
            "id": "evt-1",
            "source": "svc",
            "type": "t",
            "tenant": "acme",
            "data": [1, 2]
        }))
        .unwrap();

        match decode(&record(&payload)) {
            Ingress::Envelope(env) => {
                assert_eq!(env.id, "evt-1");
                assert_eq!(env.extension("tenant"), Some(&json!("acme")));
                assert_eq!(env.data, Some(json!([1, 2])));
            }
            Ingress::Poison(p) => panic!("unexpected poison: {}", p),
        }
    }

    #[test]
    fn test_null_identity_attributes_decode() {
        let payload = br#"{"id":null,"time":null,"source":"svc","type":"t","data":null}"#;

        match decode(&record(payload)) {
            Ingress::Envelope(env) => {
                assert!(env.id.is_empty());
                assert!(env.time.is_none());
                assert_eq!(env.data, Some(serde_json::Value::Null));
            }
            Ingress::Poison(p) => panic!("unexpected poison: {}", p),
        }
    }

    #[test]
    fn test_malformed_json_is_poison() {
        match decode(&record(b"{not json")) {
            Ingress::Poison(signal) => {
                assert!(matches!(signal.error, DecodeError::Json(_)));
                assert_eq!(signal.raw, b"{not json");
                assert_eq!((signal.partition, signal.offset), (3, 41));
                assert_eq!(signal.topic, "fn.in");
            }
            other => panic!("expected poison, got {:?}", other),
        }
    }

    #[test]
    fn test_schema_violations_are_poison() {
        let cases = [
            json!({"type": "t"}),
            json!({"source": "svc", "type": ""}),
            json!({"source": "svc", "type": "t", "time": "yesterday"}),
            json!({"source": "svc", "type": "t", "route": [{"id": "x"}]}),
            json!("just a string"),
        ];

        for case in cases {
            let payload = serde_json::to_vec(&case).unwrap();
            match decode(&record(&payload)) {
                Ingress::Poison(signal) => {
                    assert!(
                        matches!(signal.error, DecodeError::Schema(_)),
                        "case {} gave {:?}",
                        case,
                        signal.error
                    );
                }
                Ingress::Envelope(_) => panic!("case {} decoded", case),
            }
        }
    }
}
