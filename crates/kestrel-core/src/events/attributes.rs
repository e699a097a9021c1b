// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Attribute payloads, one struct per [`EventType`].
//!
//! Field tags are part of the persisted format: add fields with new tags, never
//! renumber or reuse one.

#![allow(missing_docs)]

use serde::{Deserialize, Serialize};

use super::EventType;
use super::base64_bytes;

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct ExecutionStartedAttributes {
    #[prost(string, tag = "1")]
    pub workflow_type: String,
    #[prost(string, tag = "2")]
    pub task_queue: String,
    #[prost(bytes = "vec", tag = "3")]
    #[serde(with = "base64_bytes", default)]
    pub input: Vec<u8>,
    /// Zero means no execution timeout.
    #[prost(int64, tag = "4")]
    #[serde(default)]
    pub execution_timeout_ms: i64,
    /// Parent execution key (`namespace/workflow/run`) for child executions.
    #[prost(string, optional, tag = "5")]
    #[serde(default)]
    pub parent_execution: Option<String>,
    #[prost(string, tag = "6")]
    #[serde(default)]
    pub identity: String,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct ExecutionCompletedAttributes {
    #[prost(bytes = "vec", tag = "1")]
    #[serde(with = "base64_bytes", default)]
    pub result: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct ExecutionFailedAttributes {
    #[prost(string, tag = "1")]
    pub reason: String,
    #[prost(bytes = "vec", tag = "2")]
    #[serde(with = "base64_bytes", default)]
    pub details: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct ExecutionTerminatedAttributes {
    #[prost(string, tag = "1")]
    pub reason: String,
    #[prost(string, tag = "2")]
    #[serde(default)]
    pub identity: String,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct ExecutionTimedOutAttributes {
    #[prost(int64, tag = "1")]
    pub timeout_ms: i64,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct WorkflowTaskScheduledAttributes {
    #[prost(string, tag = "1")]
    pub task_queue: String,
    #[prost(int64, tag = "2")]
    #[serde(default)]
    pub start_to_close_timeout_ms: i64,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct WorkflowTaskStartedAttributes {
    #[prost(int64, tag = "1")]
    pub scheduled_event_id: i64,
    #[prost(string, tag = "2")]
    #[serde(default)]
    pub identity: String,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct WorkflowTaskCompletedAttributes {
    #[prost(int64, tag = "1")]
    pub scheduled_event_id: i64,
    #[prost(int64, tag = "2")]
    pub started_event_id: i64,
    #[prost(string, tag = "3")]
    #[serde(default)]
    pub identity: String,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct NodeScheduledAttributes {
    #[prost(string, tag = "1")]
    pub node_id: String,
    #[prost(string, tag = "2")]
    pub node_type: String,
    #[prost(string, tag = "3")]
    pub task_queue: String,
    #[prost(bytes = "vec", tag = "4")]
    #[serde(with = "base64_bytes", default)]
    pub input: Vec<u8>,
    /// 0 is the highest priority.
    #[prost(uint32, optional, tag = "5")]
    #[serde(default)]
    pub priority: Option<u32>,
    /// Zero means the matching default applies.
    #[prost(int64, tag = "6")]
    #[serde(default)]
    pub start_to_close_timeout_ms: i64,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct NodeStartedAttributes {
    #[prost(int64, tag = "1")]
    pub scheduled_event_id: i64,
    #[prost(string, tag = "2")]
    #[serde(default)]
    pub identity: String,
    #[prost(int32, tag = "3")]
    #[serde(default)]
    pub attempt: i32,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct NodeCompletedAttributes {
    #[prost(int64, tag = "1")]
    pub scheduled_event_id: i64,
    #[prost(int64, tag = "2")]
    pub started_event_id: i64,
    #[prost(bytes = "vec", tag = "3")]
    #[serde(with = "base64_bytes", default)]
    pub result: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct NodeFailedAttributes {
    #[prost(int64, tag = "1")]
    pub scheduled_event_id: i64,
    /// Zero when the node failed before it was started (e.g. deadline reaped).
    #[prost(int64, tag = "2")]
    #[serde(default)]
    pub started_event_id: i64,
    #[prost(string, tag = "3")]
    pub reason: String,
    #[prost(bytes = "vec", tag = "4")]
    #[serde(with = "base64_bytes", default)]
    pub details: Vec<u8>,
    #[prost(bool, tag = "5")]
    #[serde(default)]
    pub retryable: bool,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct TimerStartedAttributes {
    #[prost(string, tag = "1")]
    pub timer_id: String,
    /// Absolute fire time, unix milliseconds.
    #[prost(int64, tag = "2")]
    pub fire_at_ms: i64,
    #[prost(int64, tag = "3")]
    pub start_to_fire_timeout_ms: i64,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct TimerFiredAttributes {
    #[prost(string, tag = "1")]
    pub timer_id: String,
    #[prost(int64, tag = "2")]
    pub started_event_id: i64,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct TimerCanceledAttributes {
    #[prost(string, tag = "1")]
    pub timer_id: String,
    #[prost(int64, tag = "2")]
    pub started_event_id: i64,
    #[prost(string, tag = "3")]
    #[serde(default)]
    pub identity: String,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct SignalReceivedAttributes {
    #[prost(string, tag = "1")]
    pub signal_name: String,
    #[prost(bytes = "vec", tag = "2")]
    #[serde(with = "base64_bytes", default)]
    pub input: Vec<u8>,
    #[prost(string, tag = "3")]
    #[serde(default)]
    pub identity: String,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct MarkerRecordedAttributes {
    #[prost(string, tag = "1")]
    pub marker_name: String,
    #[prost(bytes = "vec", tag = "2")]
    #[serde(with = "base64_bytes", default)]
    pub details: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct ChildExecutionInitiatedAttributes {
    #[prost(string, tag = "1")]
    pub namespace_id: String,
    #[prost(string, tag = "2")]
    pub workflow_id: String,
    #[prost(string, tag = "3")]
    pub run_id: String,
    #[prost(string, tag = "4")]
    pub workflow_type: String,
    #[prost(bytes = "vec", tag = "5")]
    #[serde(with = "base64_bytes", default)]
    pub input: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct ChildExecutionClosedAttributes {
    #[prost(int64, tag = "1")]
    pub initiated_event_id: i64,
    /// Terminal status of the child (`completed`, `failed`, ...).
    #[prost(string, tag = "2")]
    pub status: String,
    #[prost(bytes = "vec", tag = "3")]
    #[serde(with = "base64_bytes", default)]
    pub result: Vec<u8>,
}

/// Per-type payload of a history event.
///
/// Protobuf field tags are fixed per variant and must never be reused.
#[derive(Clone, PartialEq, prost::Oneof)]
pub enum EventAttributes {
    #[prost(message, tag = "10")]
    ExecutionStarted(ExecutionStartedAttributes),
    #[prost(message, tag = "11")]
    ExecutionCompleted(ExecutionCompletedAttributes),
    #[prost(message, tag = "12")]
    ExecutionFailed(ExecutionFailedAttributes),
    #[prost(message, tag = "13")]
    ExecutionTerminated(ExecutionTerminatedAttributes),
    #[prost(message, tag = "14")]
    ExecutionTimedOut(ExecutionTimedOutAttributes),
    #[prost(message, tag = "15")]
    WorkflowTaskScheduled(WorkflowTaskScheduledAttributes),
    #[prost(message, tag = "16")]
    WorkflowTaskStarted(WorkflowTaskStartedAttributes),
    #[prost(message, tag = "17")]
    WorkflowTaskCompleted(WorkflowTaskCompletedAttributes),
    #[prost(message, tag = "18")]
    NodeScheduled(NodeScheduledAttributes),
    #[prost(message, tag = "19")]
    NodeStarted(NodeStartedAttributes),
    #[prost(message, tag = "20")]
    NodeCompleted(NodeCompletedAttributes),
    #[prost(message, tag = "21")]
    NodeFailed(NodeFailedAttributes),
    #[prost(message, tag = "22")]
    TimerStarted(TimerStartedAttributes),
    #[prost(message, tag = "23")]
    TimerFired(TimerFiredAttributes),
    #[prost(message, tag = "24")]
    TimerCanceled(TimerCanceledAttributes),
    #[prost(message, tag = "25")]
    SignalReceived(SignalReceivedAttributes),
    #[prost(message, tag = "26")]
    MarkerRecorded(MarkerRecordedAttributes),
    #[prost(message, tag = "27")]
    ChildExecutionInitiated(ChildExecutionInitiatedAttributes),
    #[prost(message, tag = "28")]
    ChildExecutionClosed(ChildExecutionClosedAttributes),
}

impl EventAttributes {
    /// The event type this payload belongs to.
    pub fn event_type(&self) -> EventType {
        match self {
            Self::ExecutionStarted(_) => EventType::ExecutionStarted,
            Self::ExecutionCompleted(_) => EventType::ExecutionCompleted,
            Self::ExecutionFailed(_) => EventType::ExecutionFailed,
            Self::ExecutionTerminated(_) => EventType::ExecutionTerminated,
            Self::ExecutionTimedOut(_) => EventType::ExecutionTimedOut,
            Self::WorkflowTaskScheduled(_) => EventType::WorkflowTaskScheduled,
            Self::WorkflowTaskStarted(_) => EventType::WorkflowTaskStarted,
            Self::WorkflowTaskCompleted(_) => EventType::WorkflowTaskCompleted,
            Self::NodeScheduled(_) => EventType::NodeScheduled,
            Self::NodeStarted(_) => EventType::NodeStarted,
            Self::NodeCompleted(_) => EventType::NodeCompleted,
            Self::NodeFailed(_) => EventType::NodeFailed,
            Self::TimerStarted(_) => EventType::TimerStarted,
            Self::TimerFired(_) => EventType::TimerFired,
            Self::TimerCanceled(_) => EventType::TimerCanceled,
            Self::SignalReceived(_) => EventType::SignalReceived,
            Self::MarkerRecorded(_) => EventType::MarkerRecorded,
            Self::ChildExecutionInitiated(_) => EventType::ChildExecutionInitiated,
            Self::ChildExecutionClosed(_) => EventType::ChildExecutionClosed,
        }
    }
}

