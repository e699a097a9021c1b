// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Protobuf envelope for the compact event encoding.
//!
//! Layout (field tags):
//! - 1: event_id
//! - 2: event_type code ([`EventType::code`](super::EventType::code))
//! - 3: timestamp, unix microseconds
//! - 4: version
//! - 5: task_id
//! - 10..: attributes, one `oneof` arm per event type

use super::EventAttributes;

/// Wire form of a [`HistoryEvent`](super::HistoryEvent).
#[derive(Clone, PartialEq, prost::Message)]
pub struct EventEnvelope {
    /// Event ID.
    #[prost(int64, tag = "1")]
    pub event_id: i64,
    /// Event type code.
    #[prost(int32, tag = "2")]
    pub event_type: i32,
    /// Unix timestamp in microseconds.
    #[prost(int64, tag = "3")]
    pub timestamp_micros: i64,
    /// Writer version.
    #[prost(int64, tag = "4")]
    pub version: i64,
    /// Writer task ID.
    #[prost(int64, tag = "5")]
    pub task_id: i64,
    /// Attribute payload.
    #[prost(
        oneof = "EventAttributes",
        tags = "10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27, 28"
    )]
    pub attributes: Option<EventAttributes>,
}
