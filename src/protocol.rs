//! Wire protocol for the persistent frame-streaming connection.
//!
//! Messages are JSON objects discriminated by a `type` field, carried over a
//! message-framed bidirectional transport. Frame payloads travel as base64
//! text inside the JSON envelope.
//!
//! A malformed payload is answered with an [`WireMessage::Error`] to that
//! client; it does not close the connection unless the transport itself is
//! broken.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{RelayError, Result};

/// Action carried by a `control` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    /// Begin streaming for this session.
    Start,
    /// Advance to the next step of the interactive exercise.
    Next,
    /// Terminate the session.
    Stop,
    /// Server-initiated quality/target-rate update. Only ever appears in a
    /// `control_response`, never in a client `control`.
    Quality,
}

/// Aggregate summary sent with `session_complete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummaryPayload {
    pub message: String,
    /// Aggregate score over the session, in [0, 1].
    pub score: f64,
    pub elapsed_ms: u64,
}

/// One message on the wire, either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Client -> server: one encoded camera frame.
    RawFrame {
        timestamp_ms: u64,
        /// Base64-encoded compressed image bytes.
        #[serde(with = "frame_bytes")]
        data: Vec<u8>,
        /// Client-assigned, monotonically increasing frame number.
        frame_number: u64,
        /// Free-form metadata, e.g. which exercise step this frame belongs to.
        #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
        metadata: serde_json::Value,
    },

    /// Server -> client: the processed, annotated frame.
    ProcessedFrame {
        timestamp_ms: u64,
        /// Annotated frame, absent when encoding was skipped or failed.
        #[serde(default, with = "opt_frame_bytes")]
        data: Option<Vec<u8>>,
        server_frame_number: u64,
        client_frame_number: u64,
        processing_time_ms: u64,
        /// Named detection categories, e.g. `"hands" -> true`.
        detections: BTreeMap<String, bool>,
        /// Confidence in [0, 1]; `None` when no detection was attempted.
        confidence: Option<f64>,
        success: bool,
    },

    /// Client -> server: out-of-band session control.
    Control {
        action: ControlAction,
        #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
        payload: serde_json::Value,
    },

    /// Server -> client: acknowledgement of a control message.
    ControlResponse {
        action: ControlAction,
        #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
        payload: serde_json::Value,
        success: bool,
    },

    /// Server -> client: terminal summary for a completed session.
    SessionComplete { summary: SessionSummaryPayload },

    /// Server -> client: a recoverable or fatal error report.
    Error { code: String, message: String },
}

impl WireMessage {
    /// Parse one framed message from its JSON text.
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| RelayError::protocol(format!("unparseable message: {e}")))
    }

    /// Serialize for the wire.
    pub fn to_json(&self) -> String {
        // The enum contains no non-serializable types, so this cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Build an `error` message from a pipeline error.
    pub fn from_error(err: &RelayError) -> Self {
        WireMessage::Error { code: err.code().to_string(), message: err.to_string() }
    }

    /// Whether the backpressure valve may evict this message from a full
    /// outbound queue. Only processed frames are expendable; control
    /// responses, summaries and errors must reach the client.
    pub fn is_droppable(&self) -> bool {
        matches!(self, WireMessage::ProcessedFrame { .. })
    }
}

/// One inbound frame, immutable once received.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub client_number: u64,
    pub captured_at_ms: u64,
    pub metadata: serde_json::Value,
}

mod frame_bytes {
    use super::*;
    use serde::{Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> std::result::Result<S::Ok, S::Error> {
        ser.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        de: D,
    ) -> std::result::Result<Vec<u8>, D::Error> {
        let text = String::deserialize(de)?;
        BASE64.decode(text.as_bytes()).map_err(D::Error::custom)
    }
}

mod opt_frame_bytes {
    use super::*;
    use serde::{Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        ser: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => ser.serialize_some(&BASE64.encode(b)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        de: D,
    ) -> std::result::Result<Option<Vec<u8>>, D::Error> {
        let text: Option<String> = Option::deserialize(de)?;
        match text {
            Some(t) => BASE64.decode(t.as_bytes()).map(Some).map_err(D::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_frame_roundtrips_with_base64_payload() {
        let msg = WireMessage::RawFrame {
            timestamp_ms: 1234,
            data: vec![0xff, 0xd8, 0xff, 0xe0],
            frame_number: 7,
            metadata: serde_json::json!({"step": 2}),
        };
        let text = msg.to_json();
        // The payload must be text on the wire, not a JSON byte array.
        assert!(text.contains("\"/9j/4A==\""));
        assert_eq!(WireMessage::parse(&text).unwrap(), msg);
    }

    #[test]
    fn type_tag_uses_snake_case() {
        let msg = WireMessage::Control { action: ControlAction::Start, payload: serde_json::Value::Null };
        let value: serde_json::Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(value["type"], "control");
        assert_eq!(value["action"], "start");
    }

    #[test]
    fn unparseable_payload_is_a_protocol_error() {
        let err = WireMessage::parse("{not json").unwrap_err();
        assert!(matches!(err, RelayError::Protocol { .. }));
    }

    #[test]
    fn unknown_type_is_a_protocol_error() {
        let err = WireMessage::parse(r#"{"type": "teleport"}"#).unwrap_err();
        assert!(matches!(err, RelayError::Protocol { .. }));
    }

    #[test]
    fn only_processed_frames_are_droppable() {
        let processed = WireMessage::ProcessedFrame {
            timestamp_ms: 0,
            data: None,
            server_frame_number: 1,
            client_frame_number: 1,
            processing_time_ms: 10,
            detections: BTreeMap::new(),
            confidence: None,
            success: true,
        };
        assert!(processed.is_droppable());

        let complete = WireMessage::SessionComplete {
            summary: SessionSummaryPayload { message: "done".into(), score: 0.8, elapsed_ms: 60_000 },
        };
        assert!(!complete.is_droppable());
        assert!(
            !WireMessage::Error { code: "decode_error".into(), message: "bad".into() }
                .is_droppable()
        );
    }

    #[test]
    fn missing_processed_data_deserializes_as_none() {
        let text = r#"{"type":"processed_frame","timestamp_ms":1,"server_frame_number":1,
            "client_frame_number":1,"processing_time_ms":5,"detections":{},"confidence":null,
            "success":false}"#;
        match WireMessage::parse(text).unwrap() {
            WireMessage::ProcessedFrame { data, success, .. } => {
                assert!(data.is_none());
                assert!(!success);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
