// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! History event model.
//!
//! A [`HistoryEvent`] is one immutable entry in an execution's log. Its
//! `attributes` are a closed sum type: one struct per [`EventType`], dispatched
//! explicitly by the codecs in [`codec`].
//!
//! The attribute structs carry both `prost` and `serde` derives so the same
//! types back the compact protobuf encoding and the JSON encoding.

pub mod attributes;
pub mod codec;
pub mod wire;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use attributes::*;
pub use codec::{EventEncoding, EventSerializer};

/// Discriminant of a history event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// Execution started.
    ExecutionStarted,
    /// Execution completed successfully.
    ExecutionCompleted,
    /// Execution failed.
    ExecutionFailed,
    /// Execution terminated by an operator.
    ExecutionTerminated,
    /// Execution exceeded its timeout.
    ExecutionTimedOut,
    /// Workflow task handed to matching.
    WorkflowTaskScheduled,
    /// Workflow task picked up by a worker.
    WorkflowTaskStarted,
    /// Workflow task finished.
    WorkflowTaskCompleted,
    /// Node (activity) scheduled.
    NodeScheduled,
    /// Node picked up by a worker.
    NodeStarted,
    /// Node completed.
    NodeCompleted,
    /// Node failed.
    NodeFailed,
    /// Timer started.
    TimerStarted,
    /// Timer fired.
    TimerFired,
    /// Timer canceled.
    TimerCanceled,
    /// External signal received.
    SignalReceived,
    /// Marker recorded by the workflow.
    MarkerRecorded,
    /// Child execution initiated.
    ChildExecutionInitiated,
    /// Child execution reached a terminal state.
    ChildExecutionClosed,
}

impl EventType {
    /// Every event type, in wire-code order.
    pub const ALL: [EventType; 19] = [
        EventType::ExecutionStarted,
        EventType::ExecutionCompleted,
        EventType::ExecutionFailed,
        EventType::ExecutionTerminated,
        EventType::ExecutionTimedOut,
        EventType::WorkflowTaskScheduled,
        EventType::WorkflowTaskStarted,
        EventType::WorkflowTaskCompleted,
        EventType::NodeScheduled,
        EventType::NodeStarted,
        EventType::NodeCompleted,
        EventType::NodeFailed,
        EventType::TimerStarted,
        EventType::TimerFired,
        EventType::TimerCanceled,
        EventType::SignalReceived,
        EventType::MarkerRecorded,
        EventType::ChildExecutionInitiated,
        EventType::ChildExecutionClosed,
    ];

    /// Stable numeric code used by the protobuf encoding. Codes are never reused.
    pub fn code(self) -> i32 {
        match self {
            Self::ExecutionStarted => 1,
            Self::ExecutionCompleted => 2,
            Self::ExecutionFailed => 3,
            Self::ExecutionTerminated => 4,
            Self::ExecutionTimedOut => 5,
            Self::WorkflowTaskScheduled => 6,
            Self::WorkflowTaskStarted => 7,
            Self::WorkflowTaskCompleted => 8,
            Self::NodeScheduled => 9,
            Self::NodeStarted => 10,
            Self::NodeCompleted => 11,
            Self::NodeFailed => 12,
            Self::TimerStarted => 13,
            Self::TimerFired => 14,
            Self::TimerCanceled => 15,
            Self::SignalReceived => 16,
            Self::MarkerRecorded => 17,
            Self::ChildExecutionInitiated => 18,
            Self::ChildExecutionClosed => 19,
        }
    }

    /// Inverse of [`code`](Self::code). Unknown codes yield `None`.
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.code() == code)
    }

    /// Whether this event closes the execution.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::ExecutionCompleted
                | Self::ExecutionFailed
                | Self::ExecutionTerminated
                | Self::ExecutionTimedOut
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Serde adapter storing byte payloads as base64 strings in JSON.
pub(crate) mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// One immutable entry in an execution's history.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEvent {
    /// Position in the log, starting at 1. Never reused.
    pub event_id: i64,
    /// Discriminant; always equals `attributes.event_type()`.
    pub event_type: EventType,
    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,
    /// Failover version of the writer.
    pub version: i64,
    /// Task sequence number assigned by the writer.
    pub task_id: i64,
    /// Type-specific payload.
    pub attributes: EventAttributes,
}

impl HistoryEvent {
    /// Build an event whose `event_type` is derived from its attributes.
    pub fn new(
        event_id: i64,
        timestamp: DateTime<Utc>,
        version: i64,
        task_id: i64,
        attributes: EventAttributes,
    ) -> Self {
        Self {
            event_id,
            event_type: attributes.event_type(),
            timestamp,
            version,
            task_id,
            attributes,
        }
    }

    /// Whether this event closes the execution.
    pub fn is_terminal(&self) -> bool {
        self.event_type.is_terminal()
    }
}
