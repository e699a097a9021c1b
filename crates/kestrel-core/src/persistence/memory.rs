// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory persistence.
//!
//! Every execution has its own lock, so writers to different executions never
//! contend. Reads hand out clones; nothing stored is ever shared with callers.
//!
//! Fired and canceled timers are dropped once their execution is closed, so
//! the timer map only holds timers that can still matter.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use super::{
    EventStore, ExecutionStore, MutableStateStore, Persistence, TimerStore, check_contiguous,
};
use crate::error::CoreError;
use crate::events::HistoryEvent;
use crate::state::{ExecutionKey, MutableState};
use crate::timer::{Timer, TimerKey, TimerStatus};

#[derive(Default)]
struct ExecutionEntry {
    events: Vec<HistoryEvent>,
    state: Option<MutableState>,
}

impl ExecutionEntry {
    fn last_event_id(&self) -> i64 {
        self.events.last().map_or(0, |e| e.event_id)
    }

    fn check_append(
        &self,
        key: &ExecutionKey,
        events: &[HistoryEvent],
        expected_last_event_id: i64,
    ) -> Result<(), CoreError> {
        let actual = self.last_event_id();
        if actual != expected_last_event_id {
            return Err(CoreError::conflict(
                format!("history:{}", key),
                expected_last_event_id,
                actual,
            ));
        }
        check_contiguous(key, events, expected_last_event_id)
    }

    fn check_state_version(&self, key: &ExecutionKey, expected: i64) -> Result<(), CoreError> {
        let actual = self.state.as_ref().map_or(0, |s| s.db_version);
        if actual != expected {
            return Err(CoreError::conflict(format!("state:{}", key), expected, actual));
        }
        Ok(())
    }

    fn store_state(&mut self, state: &MutableState, expected: i64) -> i64 {
        let mut stored = state.clone();
        stored.db_version = expected + 1;
        self.state = Some(stored);
        expected + 1
    }
}

/// Map-backed implementation of every store trait.
#[derive(Default)]
pub struct InMemoryPersistence {
    executions: RwLock<HashMap<ExecutionKey, Arc<Mutex<ExecutionEntry>>>>,
    timers: RwLock<HashMap<TimerKey, Timer>>,
}

impl InMemoryPersistence {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &ExecutionKey) -> Option<Arc<Mutex<ExecutionEntry>>> {
        self.executions.read().get(key).cloned()
    }

    fn is_closed(&self, key: &ExecutionKey) -> bool {
        self.entry(key).is_some_and(|entry| {
            entry
                .lock()
                .state
                .as_ref()
                .is_some_and(|s| s.status().is_terminal())
        })
    }

    /// Drop fired and canceled timers of `key`.
    fn prune_timers(&self, key: &ExecutionKey) {
        self.timers.write().retain(|timer_key, timer| {
            timer.status == TimerStatus::Pending || &timer_key.execution() != key
        });
    }

    fn entry_or_create(&self, key: &ExecutionKey) -> Arc<Mutex<ExecutionEntry>> {
        if let Some(entry) = self.entry(key) {
            return entry;
        }
        self.executions
            .write()
            .entry(key.clone())
            .or_default()
            .clone()
    }
}

#[async_trait]
impl EventStore for InMemoryPersistence {
    async fn append_events(
        &self,
        key: &ExecutionKey,
        events: &[HistoryEvent],
        expected_last_event_id: i64,
    ) -> Result<(), CoreError> {
        let entry = self.entry_or_create(key);
        let mut entry = entry.lock();
        entry.check_append(key, events, expected_last_event_id)?;
        entry.events.extend_from_slice(events);
        Ok(())
    }

    async fn get_events(
        &self,
        key: &ExecutionKey,
        first_event_id: i64,
        last_event_id: i64,
    ) -> Result<Vec<HistoryEvent>, CoreError> {
        let Some(entry) = self.entry(key) else {
            return Ok(Vec::new());
        };
        let entry = entry.lock();
        Ok(entry
            .events
            .iter()
            .filter(|e| e.event_id >= first_event_id && e.event_id <= last_event_id)
            .cloned()
            .collect())
    }

    async fn get_event_count(&self, key: &ExecutionKey) -> Result<i64, CoreError> {
        Ok(self
            .entry(key)
            .map_or(0, |entry| entry.lock().events.len() as i64))
    }
}

#[async_trait]
impl MutableStateStore for InMemoryPersistence {
    async fn get_mutable_state(&self, key: &ExecutionKey) -> Result<MutableState, CoreError> {
        self.entry(key)
            .and_then(|entry| entry.lock().state.clone())
            .ok_or_else(|| CoreError::ExecutionNotFound {
                execution: key.to_string(),
            })
    }

    async fn update_mutable_state(
        &self,
        key: &ExecutionKey,
        state: &MutableState,
        expected_version: i64,
    ) -> Result<i64, CoreError> {
        let version = {
            let entry = self.entry_or_create(key);
            let mut entry = entry.lock();
            entry.check_state_version(key, expected_version)?;
            entry.store_state(state, expected_version)
        };
        if state.status().is_terminal() {
            self.prune_timers(key);
        }
        Ok(version)
    }

    async fn list_running_executions(&self) -> Result<Vec<ExecutionKey>, CoreError> {
        let entries: Vec<_> = self.executions.read().values().cloned().collect();
        let mut keys: Vec<ExecutionKey> = entries
            .iter()
            .filter_map(|entry| {
                let entry = entry.lock();
                entry
                    .state
                    .as_ref()
                    .filter(|s| s.is_running())
                    .map(|s| s.key.clone())
            })
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl ExecutionStore for InMemoryPersistence {
    async fn commit_transition(
        &self,
        key: &ExecutionKey,
        events: &[HistoryEvent],
        expected_last_event_id: i64,
        state: &MutableState,
        expected_version: i64,
    ) -> Result<i64, CoreError> {
        let version = {
            let entry = self.entry_or_create(key);
            let mut entry = entry.lock();
            entry.check_append(key, events, expected_last_event_id)?;
            entry.check_state_version(key, expected_version)?;
            entry.events.extend_from_slice(events);
            entry.store_state(state, expected_version)
        };
        if state.status().is_terminal() {
            self.prune_timers(key);
        }
        Ok(version)
    }
}

#[async_trait]
impl TimerStore for InMemoryPersistence {
    async fn create_timer(&self, timer: &Timer) -> Result<(), CoreError> {
        let key = timer.key();
        let mut timers = self.timers.write();
        if timers.contains_key(&key) {
            return Err(CoreError::TimerAlreadyExists {
                execution: key.execution().to_string(),
                timer_id: key.timer_id,
            });
        }
        timers.insert(key, timer.clone());
        Ok(())
    }

    async fn get_timer(&self, key: &TimerKey) -> Result<Option<Timer>, CoreError> {
        Ok(self.timers.read().get(key).cloned())
    }

    async fn update_timer(&self, timer: &Timer, expected_version: i64) -> Result<i64, CoreError> {
        let key = timer.key();
        let prune = timer.status != TimerStatus::Pending && self.is_closed(&timer.execution());
        let mut timers = self.timers.write();
        let Some(stored) = timers.get_mut(&key) else {
            return Err(CoreError::TimerNotFound {
                execution: key.execution().to_string(),
                timer_id: key.timer_id,
            });
        };
        if stored.version != expected_version {
            return Err(CoreError::conflict(
                format!("timer:{}", key),
                expected_version,
                stored.version,
            ));
        }
        *stored = timer.clone();
        stored.version = expected_version + 1;
        let version = stored.version;
        if prune {
            timers.remove(&key);
        }
        Ok(version)
    }

    async fn get_due_timers(
        &self,
        shard_id: u32,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Timer>, CoreError> {
        let mut due: Vec<Timer> = self
            .timers
            .read()
            .values()
            .filter(|t| t.shard_id == shard_id && t.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.fire_time
                .cmp(&b.fire_time)
                .then_with(|| a.key().cmp(&b.key()))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn list_timers_for_execution(
        &self,
        key: &ExecutionKey,
    ) -> Result<Vec<Timer>, CoreError> {
        let mut timers: Vec<Timer> = self
            .timers
            .read()
            .values()
            .filter(|t| {
                t.namespace_id == key.namespace_id
                    && t.workflow_id == key.workflow_id
                    && t.run_id == key.run_id
            })
            .cloned()
            .collect();
        timers.sort_by(|a, b| a.timer_id.cmp(&b.timer_id));
        Ok(timers)
    }
}

#[async_trait]
impl Persistence for InMemoryPersistence {}
