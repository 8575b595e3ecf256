//! JSON text frames: outbound requests and inbound text replies.
//!
//! ```text
//! Client ──{"type":"request_slice","file_id":…,"slice_index":…}──► Server
//! Client ──{"type":"request_metadata","file_id":…}──────────────► Server
//! Client ──{"type":"ping"}─────────────────────────────────────► Server
//! Server ──{"type":"pong","timestamp":…}  (or bare "pong")──────► Client
//! ```
//!
//! METADATA and ERROR binary payloads are also JSON; they are kept as
//! `serde_json::Value` and read with the field helpers below.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Structured message sent by the client as a text frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    RequestSlice { file_id: String, slice_index: u32 },
    RequestMetadata { file_id: String },
    Ping,
}

impl ClientRequest {
    pub fn slice(file_id: impl Into<String>, slice_index: u32) -> Self {
        ClientRequest::RequestSlice {
            file_id: file_id.into(),
            slice_index,
        }
    }

    pub fn metadata(file_id: impl Into<String>) -> Self {
        ClientRequest::RequestMetadata {
            file_id: file_id.into(),
        }
    }
}

/// Text frame received from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerText {
    Pong { timestamp: Option<u64> },
    Other(Value),
    Unparsed(String),
}

impl ServerText {
    pub fn parse(text: &str) -> Self {
        let trimmed = text.trim();
        if trimmed.eq_ignore_ascii_case("pong") {
            return ServerText::Pong { timestamp: None };
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(value) if value.get("type").and_then(Value::as_str) == Some("pong") => {
                ServerText::Pong {
                    timestamp: value.get("timestamp").and_then(Value::as_u64),
                }
            }
            Ok(value) => ServerText::Other(value),
            Err(_) => ServerText::Unparsed(text.to_owned()),
        }
    }

    pub fn is_pong(&self) -> bool {
        matches!(self, ServerText::Pong { .. })
    }
}

/// `file_id` of a METADATA or ERROR payload, if present.
pub fn file_id_of(value: &Value) -> Option<&str> {
    value.get("file_id").and_then(Value::as_str)
}

/// `slice_index` of an ERROR payload, if present.
pub fn slice_index_of(value: &Value) -> Option<u32> {
    value
        .get("slice_index")
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
}

/// Human-readable message of an ERROR payload.
pub fn error_message_of(value: &Value) -> String {
    value
        .get("message")
        .or_else(|| value.get("error"))
        .and_then(Value::as_str)
        .map(str::to_owned)
        .unwrap_or_else(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_shapes_match_wire() {
        let v = serde_json::to_value(ClientRequest::slice("vol-1", 25)).unwrap();
        assert_eq!(v, json!({"type": "request_slice", "file_id": "vol-1", "slice_index": 25}));

        let v = serde_json::to_value(ClientRequest::metadata("vol-1")).unwrap();
        assert_eq!(v, json!({"type": "request_metadata", "file_id": "vol-1"}));

        let v = serde_json::to_value(ClientRequest::Ping).unwrap();
        assert_eq!(v, json!({"type": "ping"}));
    }

    #[test]
    fn pong_forms() {
        assert_eq!(ServerText::parse("pong"), ServerText::Pong { timestamp: None });
        assert_eq!(
            ServerText::parse(r#"{"type":"pong","timestamp":1700000000000}"#),
            ServerText::Pong {
                timestamp: Some(1_700_000_000_000)
            }
        );
        assert!(!ServerText::parse(r#"{"type":"hello"}"#).is_pong());
        assert!(matches!(ServerText::parse("not json"), ServerText::Unparsed(_)));
    }

    #[test]
    fn error_payload_fields() {
        let v = json!({"file_id": "vol-1", "slice_index": 4, "message": "slice out of range"});
        assert_eq!(file_id_of(&v), Some("vol-1"));
        assert_eq!(slice_index_of(&v), Some(4));
        assert_eq!(error_message_of(&v), "slice out of range");
    }
}
