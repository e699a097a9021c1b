// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Event encode/decode.
//!
//! Two encodings live side by side and are chosen by configuration, never by
//! inspecting the data:
//!
//! | Encoding | Form |
//! |----------|------|
//! | `json`   | Human-inspectable JSON, byte payloads as base64 |
//! | `proto`  | Compact protobuf [`EventEnvelope`] |
//!
//! # Schema version tag
//!
//! Versioned blobs are framed as:
//! - 1 byte: marker `0xFE`
//! - 2 bytes: schema version (big-endian)
//! - N bytes: encoded event
//!
//! Blobs without the marker predate tagging and decode as the current schema,
//! as do blobs tagged with version 0. `0xFE` can start neither a JSON document
//! nor a valid protobuf field key, so the check is unambiguous.

use std::str::FromStr;

use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, Utc};
use prost::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::wire::EventEnvelope;
use super::{EventAttributes, EventType, HistoryEvent};
use crate::error::{CoreError, Result};

/// Schema version written by this build.
pub const CURRENT_SCHEMA_VERSION: u16 = 1;

/// First byte of a version-tagged blob.
pub const VERSION_MARKER: u8 = 0xFE;

/// Marker + u16 version.
pub const VERSION_HEADER_SIZE: usize = 3;

/// Encoding used for persisted events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventEncoding {
    /// Structured JSON.
    #[default]
    Json,
    /// Protobuf envelope.
    Proto,
}

impl EventEncoding {
    /// Name used in configuration and persisted rows.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Proto => "proto",
        }
    }
}

impl FromStr for EventEncoding {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "proto" | "protobuf" => Ok(Self::Proto),
            other => Err(CoreError::ValidationError {
                field: "encoding".to_string(),
                message: format!("unknown event encoding '{}'", other),
            }),
        }
    }
}

/// Encodes and decodes [`HistoryEvent`]s in the configured encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventSerializer {
    encoding: EventEncoding,
}

impl EventSerializer {
    /// Create a serializer for the given encoding.
    pub fn new(encoding: EventEncoding) -> Self {
        Self { encoding }
    }

    /// The configured encoding.
    pub fn encoding(&self) -> EventEncoding {
        self.encoding
    }

    /// Encode one event without a version tag.
    pub fn serialize(&self, event: &HistoryEvent) -> Result<Vec<u8>> {
        match self.encoding {
            EventEncoding::Json => encode_json(event),
            EventEncoding::Proto => Ok(encode_proto(event)),
        }
    }

    /// Decode one untagged event.
    pub fn deserialize(&self, data: &[u8]) -> Result<HistoryEvent> {
        match self.encoding {
            EventEncoding::Json => decode_json(data),
            EventEncoding::Proto => decode_proto(data),
        }
    }

    /// Encode one event behind a schema-version tag.
    pub fn serialize_versioned(&self, event: &HistoryEvent) -> Result<Vec<u8>> {
        let payload = self.serialize(event)?;
        let mut buf = BytesMut::with_capacity(VERSION_HEADER_SIZE + payload.len());
        buf.put_u8(VERSION_MARKER);
        buf.put_u16(CURRENT_SCHEMA_VERSION);
        buf.put_slice(&payload);
        Ok(buf.to_vec())
    }

    /// Decode a tagged (or legacy untagged) event.
    pub fn deserialize_versioned(&self, data: &[u8]) -> Result<HistoryEvent> {
        let (version, payload) = split_version_tag(data)?;
        match version {
            0 | CURRENT_SCHEMA_VERSION => self.deserialize(payload),
            other => Err(CoreError::serialization(format!(
                "unsupported schema version {} (current is {})",
                other, CURRENT_SCHEMA_VERSION
            ))),
        }
    }
}

/// Split a blob into its schema version and payload.
///
/// Untagged blobs report version 0.
pub fn split_version_tag(data: &[u8]) -> Result<(u16, &[u8])> {
    match data.first() {
        Some(&VERSION_MARKER) => {
            if data.len() < VERSION_HEADER_SIZE {
                return Err(CoreError::serialization(format!(
                    "truncated version header: {} bytes",
                    data.len()
                )));
            }
            let mut header = &data[1..VERSION_HEADER_SIZE];
            let version = header.get_u16();
            Ok((version, &data[VERSION_HEADER_SIZE..]))
        }
        Some(_) => Ok((0, data)),
        None => Err(CoreError::serialization("empty event payload")),
    }
}

// ============================================================================
// JSON
// ============================================================================

#[derive(Serialize, Deserialize)]
struct JsonEvent {
    event_id: i64,
    event_type: EventType,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    version: i64,
    #[serde(default)]
    task_id: i64,
    attributes: Value,
}

fn encode_json(event: &HistoryEvent) -> Result<Vec<u8>> {
    let json = JsonEvent {
        event_id: event.event_id,
        event_type: event.event_type,
        timestamp: event.timestamp,
        version: event.version,
        task_id: event.task_id,
        attributes: attributes_to_json(&event.attributes)?,
    };
    Ok(serde_json::to_vec(&json)?)
}

fn decode_json(data: &[u8]) -> Result<HistoryEvent> {
    let json: JsonEvent = serde_json::from_slice(data)?;
    let attributes = attributes_from_json(json.event_type, json.attributes)?;
    Ok(HistoryEvent {
        event_id: json.event_id,
        event_type: json.event_type,
        timestamp: json.timestamp,
        version: json.version,
        task_id: json.task_id,
        attributes,
    })
}

fn attributes_to_json(attributes: &EventAttributes) -> Result<Value> {
    let value = match attributes {
        EventAttributes::ExecutionStarted(a) => serde_json::to_value(a),
        EventAttributes::ExecutionCompleted(a) => serde_json::to_value(a),
        EventAttributes::ExecutionFailed(a) => serde_json::to_value(a),
        EventAttributes::ExecutionTerminated(a) => serde_json::to_value(a),
        EventAttributes::ExecutionTimedOut(a) => serde_json::to_value(a),
        EventAttributes::WorkflowTaskScheduled(a) => serde_json::to_value(a),
        EventAttributes::WorkflowTaskStarted(a) => serde_json::to_value(a),
        EventAttributes::WorkflowTaskCompleted(a) => serde_json::to_value(a),
        EventAttributes::NodeScheduled(a) => serde_json::to_value(a),
        EventAttributes::NodeStarted(a) => serde_json::to_value(a),
        EventAttributes::NodeCompleted(a) => serde_json::to_value(a),
        EventAttributes::NodeFailed(a) => serde_json::to_value(a),
        EventAttributes::TimerStarted(a) => serde_json::to_value(a),
        EventAttributes::TimerFired(a) => serde_json::to_value(a),
        EventAttributes::TimerCanceled(a) => serde_json::to_value(a),
        EventAttributes::SignalReceived(a) => serde_json::to_value(a),
        EventAttributes::MarkerRecorded(a) => serde_json::to_value(a),
        EventAttributes::ChildExecutionInitiated(a) => serde_json::to_value(a),
        EventAttributes::ChildExecutionClosed(a) => serde_json::to_value(a),
    };
    Ok(value?)
}

fn attributes_from_json(event_type: EventType, value: Value) -> Result<EventAttributes> {
    let attributes = match event_type {
        EventType::ExecutionStarted => {
            EventAttributes::ExecutionStarted(serde_json::from_value(value)?)
        }
        EventType::ExecutionCompleted => {
            EventAttributes::ExecutionCompleted(serde_json::from_value(value)?)
        }
        EventType::ExecutionFailed => EventAttributes::ExecutionFailed(serde_json::from_value(value)?),
        EventType::ExecutionTerminated => {
            EventAttributes::ExecutionTerminated(serde_json::from_value(value)?)
        }
        EventType::ExecutionTimedOut => {
            EventAttributes::ExecutionTimedOut(serde_json::from_value(value)?)
        }
        EventType::WorkflowTaskScheduled => {
            EventAttributes::WorkflowTaskScheduled(serde_json::from_value(value)?)
        }
        EventType::WorkflowTaskStarted => {
            EventAttributes::WorkflowTaskStarted(serde_json::from_value(value)?)
        }
        EventType::WorkflowTaskCompleted => {
            EventAttributes::WorkflowTaskCompleted(serde_json::from_value(value)?)
        }
        EventType::NodeScheduled => EventAttributes::NodeScheduled(serde_json::from_value(value)?),
        EventType::NodeStarted => EventAttributes::NodeStarted(serde_json::from_value(value)?),
        EventType::NodeCompleted => EventAttributes::NodeCompleted(serde_json::from_value(value)?),
        EventType::NodeFailed => EventAttributes::NodeFailed(serde_json::from_value(value)?),
        EventType::TimerStarted => EventAttributes::TimerStarted(serde_json::from_value(value)?),
        EventType::TimerFired => EventAttributes::TimerFired(serde_json::from_value(value)?),
        EventType::TimerCanceled => EventAttributes::TimerCanceled(serde_json::from_value(value)?),
        EventType::SignalReceived => {
            EventAttributes::SignalReceived(serde_json::from_value(value)?)
        }
        EventType::MarkerRecorded => {
            EventAttributes::MarkerRecorded(serde_json::from_value(value)?)
        }
        EventType::ChildExecutionInitiated => {
            EventAttributes::ChildExecutionInitiated(serde_json::from_value(value)?)
        }
        EventType::ChildExecutionClosed => {
            EventAttributes::ChildExecutionClosed(serde_json::from_value(value)?)
        }
    };
    Ok(attributes)
}

// ============================================================================
// Protobuf
// ============================================================================

fn encode_proto(event: &HistoryEvent) -> Vec<u8> {
    EventEnvelope {
        event_id: event.event_id,
        event_type: event.event_type.code(),
        timestamp_micros: event.timestamp.timestamp_micros(),
        version: event.version,
        task_id: event.task_id,
        attributes: Some(event.attributes.clone()),
    }
    .encode_to_vec()
}

fn decode_proto(data: &[u8]) -> Result<HistoryEvent> {
    let envelope = EventEnvelope::decode(data)?;

    let event_type = EventType::from_code(envelope.event_type).ok_or_else(|| {
        CoreError::serialization(format!("unknown event type code {}", envelope.event_type))
    })?;

    let attributes = envelope.attributes.ok_or_else(|| {
        CoreError::serialization(format!(
            "event {} ({}) has no attributes",
            envelope.event_id, event_type
        ))
    })?;

    if attributes.event_type() != event_type {
        return Err(CoreError::serialization(format!(
            "event {} declares type {} but carries {} attributes",
            envelope.event_id,
            event_type,
            attributes.event_type()
        )));
    }

    let timestamp = DateTime::from_timestamp_micros(envelope.timestamp_micros).ok_or_else(|| {
        CoreError::serialization(format!(
            "timestamp {} out of range",
            envelope.timestamp_micros
        ))
    })?;

    Ok(HistoryEvent {
        event_id: envelope.event_id,
        event_type,
        timestamp,
        version: envelope.version,
        task_id: envelope.task_id,
        attributes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{NodeScheduledAttributes, TimerFiredAttributes};

    fn sample_event() -> HistoryEvent {
        HistoryEvent::new(
            2,
            DateTime::from_timestamp_micros(1_750_000_000_123_456).unwrap(),
            1,
            42,
            EventAttributes::NodeScheduled(NodeScheduledAttributes {
                node_id: "send-email".to_string(),
                node_type: "http".to_string(),
                task_queue: "default".to_string(),
                input: vec![0, 1, 2, 255],
                priority: Some(3),
                start_to_close_timeout_ms: 30_000,
            }),
        )
    }

    #[test]
    fn test_json_round_trip() {
        let serializer = EventSerializer::new(EventEncoding::Json);
        let event = sample_event();

        let bytes = serializer.serialize(&event).unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.contains("\"event_type\":\"NodeScheduled\""));
        assert!(text.contains("AAEC/w=="), "input should be base64: {}", text);

        assert_eq!(serializer.deserialize(&bytes).unwrap(), event);
    }

    #[test]
    fn test_proto_round_trip() {
        let serializer = EventSerializer::new(EventEncoding::Proto);
        let event = sample_event();

        let bytes = serializer.serialize(&event).unwrap();
        assert_eq!(serializer.deserialize(&bytes).unwrap(), event);

        let json_len = EventSerializer::new(EventEncoding::Json)
            .serialize(&event)
            .unwrap()
            .len();
        assert!(bytes.len() < json_len);
    }

    #[test]
    fn test_versioned_round_trip_both_encodings() {
        for encoding in [EventEncoding::Json, EventEncoding::Proto] {
            let serializer = EventSerializer::new(encoding);
            let event = sample_event();
            let bytes = serializer.serialize_versioned(&event).unwrap();
            assert_eq!(bytes[0], VERSION_MARKER);
            assert_eq!(
                split_version_tag(&bytes).unwrap().0,
                CURRENT_SCHEMA_VERSION
            );
            assert_eq!(serializer.deserialize_versioned(&bytes).unwrap(), event);
        }
    }

    #[test]
    fn test_untagged_legacy_data_reads_as_current() {
        for encoding in [EventEncoding::Json, EventEncoding::Proto] {
            let serializer = EventSerializer::new(encoding);
            let event = sample_event();
            let legacy = serializer.serialize(&event).unwrap();
            assert_eq!(serializer.deserialize_versioned(&legacy).unwrap(), event);
        }
    }

    #[test]
    fn test_version_zero_reads_as_current() {
        let serializer = EventSerializer::new(EventEncoding::Proto);
        let event = sample_event();
        let mut bytes = vec![VERSION_MARKER, 0, 0];
        bytes.extend(serializer.serialize(&event).unwrap());
        assert_eq!(serializer.deserialize_versioned(&bytes).unwrap(), event);
    }

    #[test]
    fn test_unsupported_version_is_rejected() {
        let serializer = EventSerializer::new(EventEncoding::Json);
        let mut bytes = vec![VERSION_MARKER, 0, 7];
        bytes.extend(serializer.serialize(&sample_event()).unwrap());

        let err = serializer.deserialize_versioned(&bytes).unwrap_err();
        assert_eq!(err.error_code(), "SERIALIZATION_ERROR");
        assert!(err.to_string().contains("unsupported schema version 7"));
    }

    #[test]
    fn test_truncated_header_and_empty_payload() {
        let serializer = EventSerializer::new(EventEncoding::Json);
        assert!(serializer.deserialize_versioned(&[VERSION_MARKER, 0]).is_err());
        assert!(serializer.deserialize_versioned(&[]).is_err());
    }

    #[test]
    fn test_malformed_bytes_are_errors() {
        let json = EventSerializer::new(EventEncoding::Json);
        assert!(matches!(
            json.deserialize(b"{not json").unwrap_err(),
            CoreError::SerializationError { .. }
        ));

        let proto = EventSerializer::new(EventEncoding::Proto);
        assert!(matches!(
            proto.deserialize(&[0x0a, 0xff, 0xff]).unwrap_err(),
            CoreError::SerializationError { .. }
        ));
    }

    #[test]
    fn test_json_unknown_event_type_is_rejected() {
        let data = br#"{"event_id":1,"event_type":"Teleported","timestamp":"2025-01-01T00:00:00Z","attributes":{}}"#;
        let err = EventSerializer::new(EventEncoding::Json)
            .deserialize(data)
            .unwrap_err();
        assert_eq!(err.error_code(), "SERIALIZATION_ERROR");
    }

    #[test]
    fn test_json_attributes_must_match_event_type() {
        let data = br#"{"event_id":1,"event_type":"TimerFired","timestamp":"2025-01-01T00:00:00Z","attributes":{"node_id":"n","node_type":"x","task_queue":"q"}}"#;
        assert!(
            EventSerializer::new(EventEncoding::Json)
                .deserialize(data)
                .is_err()
        );
    }

    #[test]
    fn test_proto_type_mismatch_and_unknown_code() {
        let proto = EventSerializer::new(EventEncoding::Proto);

        let mismatched = EventEnvelope {
            event_id: 1,
            event_type: EventType::TimerFired.code(),
            timestamp_micros: 0,
            version: 0,
            task_id: 0,
            attributes: sample_event().attributes.into(),
        }
        .encode_to_vec();
        let err = proto.deserialize(&mismatched).unwrap_err();
        assert!(err.to_string().contains("declares type TimerFired"));

        let unknown = EventEnvelope {
            event_id: 1,
            event_type: 99,
            timestamp_micros: 0,
            version: 0,
            task_id: 0,
            attributes: Some(EventAttributes::TimerFired(TimerFiredAttributes {
                timer_id: "t".to_string(),
                started_event_id: 1,
            })),
        }
        .encode_to_vec();
        let err = proto.deserialize(&unknown).unwrap_err();
        assert!(err.to_string().contains("unknown event type code 99"));

        let missing = EventEnvelope {
            event_id: 1,
            event_type: EventType::TimerFired.code(),
            ..Default::default()
        }
        .encode_to_vec();
        assert!(proto.deserialize(&missing).is_err());
    }

    #[test]
    fn test_encoding_from_str() {
        assert_eq!("json".parse::<EventEncoding>().unwrap(), EventEncoding::Json);
        assert_eq!("PROTO".parse::<EventEncoding>().unwrap(), EventEncoding::Proto);
        assert!("xml".parse::<EventEncoding>().is_err());
    }
}
