// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kestrel Core - Execution Plane
//!
//! This crate is the execution plane of a durable workflow system. Every
//! workflow run is an append-only event log plus a derived mutable state;
//! work is handed to workers through partitioned priority task queues; durable
//! timers fire back into the log.
//!
//! # Architecture
//!
//! ```text
//!            record ops                          poll / ack
//!  clients ───────────────┐            ┌──────────────────────── workers
//!                         ▼            │
//!               ┌──────────────────┐   │   ┌──────────────────────────┐
//!               │  HistoryEngine   │───┼──►│     MatchingEngine       │
//!               │ events + state   │ tasks │ ring → partitions →      │
//!               └──┬────────────▲──┘       │ priority task queues     │
//!                  │            │          └──────────────────────────┘
//!     timer cmds   │            │ timer fired
//!                  ▼            │
//!               ┌──────────────────┐
//!               │  TimerService    │ scanner → bounded channel → processors
//!               └────────┬─────────┘
//!                        │
//!                        ▼
//!               ┌──────────────────┐
//!               │   Persistence    │ in-memory or SQLite
//!               └──────────────────┘
//! ```
//!
//! # Execution Model
//!
//! | Operation | Events appended | Side effects |
//! |-----------|-----------------|--------------|
//! | `start_execution` | `ExecutionStarted`, `WorkflowTaskScheduled` | workflow task queued |
//! | `schedule_node` | `NodeScheduled` | activity task queued |
//! | `record_node_completed` / `_failed` | `NodeCompleted` / `NodeFailed` (+ `WorkflowTaskScheduled`) | workflow task queued if none pending |
//! | `start_timer` | `TimerStarted` | durable timer created |
//! | timer fires | `TimerFired` (+ `WorkflowTaskScheduled`) | |
//! | `record_signal_received` | `SignalReceived`, or buffered while a workflow task runs | |
//! | `complete_execution` etc. | terminal event | timers canceled, parent notified |
//!
//! All writes are optimistic: a stale writer gets
//! [`error::CoreError::OptimisticLockConflict`] and nothing is written.
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `KESTREL_DATABASE_URL` | No | in-memory | SQLite connection string |
//! | `KESTREL_EVENT_ENCODING` | No | `json` | `json` or `proto` |
//! | `KESTREL_NUM_PARTITIONS` | No | `8` | Matching partitions |
//! | `KESTREL_RING_REPLICAS` | No | `64` | Ring points per partition |
//! | `KESTREL_PRIORITY_LEVELS` | No | `10` | Priority levels per queue |
//! | `KESTREL_TIMER_SHARDS` | No | `16` | Timer shards |
//! | `KESTREL_TIMER_SCAN_INTERVAL_MS` | No | `1000` | Timer scan interval |
//! | `KESTREL_TIMER_BATCH_SIZE` | No | `100` | Due timers per shard and scan |
//! | `KESTREL_TIMER_CONCURRENCY` | No | `4` | Timer processors |
//! | `KESTREL_TIMER_MAX_FIRE_DELAY_MS` | No | `5000` | Lateness warning threshold |
//! | `KESTREL_TASK_DEFAULT_TIMEOUT_SECS` | No | `300` | Default in-flight task deadline |
//!
//! # Modules
//!
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Error types with stable error codes
//! - [`events`]: History event model and JSON/protobuf serializer
//! - [`state`]: Execution keys and mutable state
//! - [`persistence`]: Store traits with in-memory and SQLite backends
//! - [`history`]: History engine
//! - [`matching`]: Hash ring, partitions and priority task queues
//! - [`timer`]: Durable timer registry and service
//! - [`runtime`]: Embeddable runtime wiring everything together

#![deny(missing_docs)]

/// Configuration loaded from environment variables.
pub mod config;

/// Error types for Core operations with stable error codes.
pub mod error;

/// History events and their serializer.
pub mod events;

/// Stable hashing for rings and shards.
pub mod hash;

/// History engine: record operations and queries.
pub mod history;

/// Partitioned task matching.
pub mod matching;

/// Persistence traits and backends.
pub mod persistence;

/// Embeddable runtime.
pub mod runtime;

/// Execution identity and mutable state.
pub mod state;

/// Durable timers.
pub mod timer;

pub use error::{CoreError, Result};
pub use history::HistoryEngine;
pub use matching::MatchingEngine;
pub use runtime::CoreRuntime;
pub use state::{ExecutionKey, MutableState};
pub use timer::TimerService;
