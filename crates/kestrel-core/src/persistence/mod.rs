// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for kestrel-core.
//!
//! The history engine and timer service only see these traits. Two backends
//! implement all of them:
//!
//! | Backend | Use |
//! |---------|-----|
//! | [`InMemoryPersistence`] | Tests and single-process embedding |
//! | [`SqlitePersistence`] | Durable single-node deployments |
//!
//! # Optimistic concurrency
//!
//! Every write carries the version the caller read:
//!
//! - [`EventStore::append_events`]: the last event ID the caller saw
//!   (`next_event_id - 1`, 0 for a new execution).
//! - [`MutableStateStore::update_mutable_state`]: the `db_version` the caller
//!   read (0 creates the record).
//! - [`TimerStore::update_timer`]: the timer `version` the caller read.
//!
//! A mismatch is [`CoreError::OptimisticLockConflict`]. Stores never retry and
//! never overwrite.

pub mod memory;
pub mod sqlite;

pub use self::memory::InMemoryPersistence;
pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::events::HistoryEvent;
use crate::state::{ExecutionKey, MutableState};
use crate::timer::{Timer, TimerKey};

/// Append-only, per-execution event log.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append events atomically: all are persisted or none are.
    ///
    /// `events` must carry contiguous IDs starting at
    /// `expected_last_event_id + 1`.
    async fn append_events(
        &self,
        key: &ExecutionKey,
        events: &[HistoryEvent],
        expected_last_event_id: i64,
    ) -> Result<(), CoreError>;

    /// Events with `first_event_id <= event_id <= last_event_id`, in order.
    ///
    /// Unknown executions yield an empty list.
    async fn get_events(
        &self,
        key: &ExecutionKey,
        first_event_id: i64,
        last_event_id: i64,
    ) -> Result<Vec<HistoryEvent>, CoreError>;

    /// Number of events in the log.
    async fn get_event_count(&self, key: &ExecutionKey) -> Result<i64, CoreError>;
}

/// Derived state per execution, versioned by `db_version`.
#[async_trait]
pub trait MutableStateStore: Send + Sync {
    /// Isolated copy of the current state.
    ///
    /// Returns [`CoreError::ExecutionNotFound`] if the execution does not exist.
    async fn get_mutable_state(&self, key: &ExecutionKey) -> Result<MutableState, CoreError>;

    /// Replace the state if the stored `db_version` equals `expected_version`.
    ///
    /// `expected_version = 0` creates the record. Returns the new version
    /// (`expected_version + 1`).
    async fn update_mutable_state(
        &self,
        key: &ExecutionKey,
        state: &MutableState,
        expected_version: i64,
    ) -> Result<i64, CoreError>;

    /// Keys of all executions whose status is running.
    async fn list_running_executions(&self) -> Result<Vec<ExecutionKey>, CoreError>;
}

/// Event log and mutable state written together.
#[async_trait]
pub trait ExecutionStore: EventStore + MutableStateStore {
    /// Append events and update state as one unit.
    ///
    /// The default runs the two writes in sequence. Both are version-checked,
    /// so a racing writer fails on the append before touching state.
    /// Backends with transactions override this to make the pair atomic.
    async fn commit_transition(
        &self,
        key: &ExecutionKey,
        events: &[HistoryEvent],
        expected_last_event_id: i64,
        state: &MutableState,
        expected_version: i64,
    ) -> Result<i64, CoreError> {
        if !events.is_empty() {
            self.append_events(key, events, expected_last_event_id)
                .await?;
        }
        self.update_mutable_state(key, state, expected_version)
            .await
    }
}

/// Durable timers, sharded by `(namespace, workflow)`.
#[async_trait]
pub trait TimerStore: Send + Sync {
    /// Insert a new timer.
    ///
    /// Returns [`CoreError::TimerAlreadyExists`] if the key is taken.
    async fn create_timer(&self, timer: &Timer) -> Result<(), CoreError>;

    /// Current record, if any.
    async fn get_timer(&self, key: &TimerKey) -> Result<Option<Timer>, CoreError>;

    /// Overwrite the timer if its stored version equals `expected_version`.
    ///
    /// The stored version becomes `expected_version + 1`, which is returned.
    async fn update_timer(&self, timer: &Timer, expected_version: i64) -> Result<i64, CoreError>;

    /// Pending timers of a shard with `fire_time <= now`, earliest first.
    async fn get_due_timers(
        &self,
        shard_id: u32,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Timer>, CoreError>;

    /// All timers of one execution, any status.
    async fn list_timers_for_execution(
        &self,
        key: &ExecutionKey,
    ) -> Result<Vec<Timer>, CoreError>;
}

/// A backend implementing every store.
#[async_trait]
pub trait Persistence: ExecutionStore + TimerStore {
    /// Whether the backend is reachable.
    async fn health_check(&self) -> Result<bool, CoreError> {
        Ok(true)
    }
}

/// Validate that `events` continue the log after `expected_last_event_id`.
pub(crate) fn check_contiguous(
    key: &ExecutionKey,
    events: &[HistoryEvent],
    expected_last_event_id: i64,
) -> Result<(), CoreError> {
    for (offset, event) in events.iter().enumerate() {
        let want = expected_last_event_id + 1 + offset as i64;
        if event.event_id != want {
            return Err(CoreError::ValidationError {
                field: "event_id".to_string(),
                message: format!(
                    "execution '{}': expected event {}, got {}",
                    key, want, event.event_id
                ),
            });
        }
    }
    Ok(())
}
