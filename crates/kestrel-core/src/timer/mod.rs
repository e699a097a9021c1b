// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable timers.
//!
//! Timers are persisted through a [`TimerStore`] and fired by the
//! [`TimerService`], which scans owned shards and hands due timers to
//! processors through a bounded channel.
//!
//! # Timer Status State Machine
//!
//! ```text
//!  ┌─────────┐  claim (version+1)  ┌───────┐
//!  │ PENDING │────────────────────►│ FIRED │
//!  └─┬─────▲─┘◄────────────────────└───────┘
//!    │     │    rollback after exhausted
//!    │     │    retries, or re-arm
//!    │     │ re-arm
//!    ▼     │
//!  ┌──────────┐
//!  │ CANCELED │
//!  └──────────┘
//! ```
//!
//! Re-arming reuses the row of a fired or canceled timer when a run starts a
//! timer with the same ID again.
//!
//! Every transition bumps `version`; writers pass the version they read, so
//! of several racing processors exactly one claims a timer.

mod service;

pub use self::service::{FireOutcome, TimerService};

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CoreError, Result};
use crate::hash;
use crate::persistence::TimerStore;
use crate::state::ExecutionKey;

/// Timer lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerStatus {
    /// Waiting to fire.
    Pending,
    /// Claimed by a processor and reported.
    Fired,
    /// Canceled before firing.
    Canceled,
}

impl TimerStatus {
    /// Status name as persisted.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Fired => "fired",
            Self::Canceled => "canceled",
        }
    }

    /// Parse a persisted status name.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "fired" => Ok(Self::Fired),
            "canceled" => Ok(Self::Canceled),
            other => Err(CoreError::serialization(format!(
                "unknown timer status '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for TimerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a timer: unique per execution and timer ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerKey {
    /// Namespace.
    pub namespace_id: String,
    /// Workflow ID.
    pub workflow_id: String,
    /// Run ID.
    pub run_id: String,
    /// Timer ID within the run.
    pub timer_id: String,
}

impl TimerKey {
    /// Create a timer key.
    pub fn new(
        namespace_id: impl Into<String>,
        workflow_id: impl Into<String>,
        run_id: impl Into<String>,
        timer_id: impl Into<String>,
    ) -> Self {
        Self {
            namespace_id: namespace_id.into(),
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
            timer_id: timer_id.into(),
        }
    }

    /// Key of the execution owning this timer.
    pub fn execution(&self) -> ExecutionKey {
        ExecutionKey::new(&self.namespace_id, &self.workflow_id, &self.run_id)
    }
}

impl fmt::Display for TimerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}#{}",
            self.namespace_id, self.workflow_id, self.run_id, self.timer_id
        )
    }
}

/// A persisted timer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timer {
    /// Shard, derived from namespace and workflow.
    pub shard_id: u32,
    /// Namespace.
    pub namespace_id: String,
    /// Workflow ID.
    pub workflow_id: String,
    /// Run ID.
    pub run_id: String,
    /// Timer ID within the run.
    pub timer_id: String,
    /// When the timer is due (millisecond precision).
    pub fire_time: DateTime<Utc>,
    /// Lifecycle status.
    pub status: TimerStatus,
    /// Optimistic-concurrency counter, starts at 1.
    pub version: i64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When a processor claimed it.
    pub fired_at: Option<DateTime<Utc>>,
}

impl Timer {
    /// Key of this timer.
    pub fn key(&self) -> TimerKey {
        TimerKey::new(
            &self.namespace_id,
            &self.workflow_id,
            &self.run_id,
            &self.timer_id,
        )
    }

    /// Key of the owning execution.
    pub fn execution(&self) -> ExecutionKey {
        ExecutionKey::new(&self.namespace_id, &self.workflow_id, &self.run_id)
    }

    /// Whether the timer is pending and due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TimerStatus::Pending && self.fire_time <= now
    }
}

/// Truncate to millisecond precision, the resolution timers are stored at.
pub(crate) fn truncate_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(TimeDelta::milliseconds(1)).unwrap_or(ts)
}

/// Timer service tuning.
#[derive(Debug, Clone)]
pub struct TimerServiceConfig {
    /// Number of timer shards.
    pub num_shards: u32,
    /// Time between scans.
    pub scan_interval: Duration,
    /// Maximum due timers fetched per shard and scan.
    pub batch_size: usize,
    /// Number of processor tasks.
    pub processor_concurrency: usize,
    /// Capacity of the scanner-to-processor channel.
    pub queue_capacity: usize,
    /// Upper bound for one callback attempt while a timer is claimed.
    pub claim_lock_duration: Duration,
    /// Firing later than this after `fire_time` logs a warning.
    pub max_fire_delay: Duration,
    /// Callback attempts before a claim is rolled back.
    pub callback_max_attempts: u32,
    /// Base delay between callback attempts (grows linearly).
    pub callback_backoff: Duration,
    /// Shards this instance scans. Empty means all.
    pub owned_shards: HashSet<u32>,
}

impl Default for TimerServiceConfig {
    fn default() -> Self {
        Self {
            num_shards: 16,
            scan_interval: Duration::from_secs(1),
            batch_size: 100,
            processor_concurrency: 4,
            queue_capacity: 256,
            claim_lock_duration: Duration::from_secs(30),
            max_fire_delay: Duration::from_secs(5),
            callback_max_attempts: 3,
            callback_backoff: Duration::from_millis(100),
            owned_shards: HashSet::new(),
        }
    }
}

/// Receives fired timers. Implemented by the history engine.
///
/// Must be idempotent: a timer may be reported again after a rollback.
#[async_trait]
pub trait TimerFiredCallback: Send + Sync {
    /// Record that a timer fired.
    async fn record_timer_fired(
        &self,
        namespace_id: &str,
        workflow_id: &str,
        run_id: &str,
        timer_id: &str,
    ) -> Result<()>;
}

/// Create, cancel and look up timers.
///
/// Holds only the store, so the history engine can schedule timers through it
/// without depending on the running service.
#[derive(Clone)]
pub struct TimerRegistry {
    store: Arc<dyn TimerStore>,
    num_shards: u32,
}

impl TimerRegistry {
    /// Create a registry over `store` with `num_shards` shards.
    pub fn new(store: Arc<dyn TimerStore>, num_shards: u32) -> Self {
        Self {
            store,
            num_shards: num_shards.max(1),
        }
    }

    /// Underlying store.
    pub fn store(&self) -> &Arc<dyn TimerStore> {
        &self.store
    }

    /// Number of shards.
    pub fn num_shards(&self) -> u32 {
        self.num_shards
    }

    /// Shard owning timers of `(namespace, workflow)`.
    pub fn shard_for(&self, namespace_id: &str, workflow_id: &str) -> u32 {
        hash::shard_for(namespace_id, workflow_id, self.num_shards)
    }

    /// Create a pending timer.
    ///
    /// A fired or canceled timer with the same ID is re-armed in place.
    /// Returns [`CoreError::TimerAlreadyExists`] if the ID is pending.
    pub async fn create_timer(
        &self,
        namespace_id: &str,
        workflow_id: &str,
        run_id: &str,
        timer_id: &str,
        fire_time: DateTime<Utc>,
    ) -> Result<Timer> {
        for (field, value) in [
            ("namespace_id", namespace_id),
            ("workflow_id", workflow_id),
            ("run_id", run_id),
            ("timer_id", timer_id),
        ] {
            if value.is_empty() {
                return Err(CoreError::ValidationError {
                    field: field.to_string(),
                    message: "must not be empty".to_string(),
                });
            }
        }

        let timer = Timer {
            shard_id: self.shard_for(namespace_id, workflow_id),
            namespace_id: namespace_id.to_string(),
            workflow_id: workflow_id.to_string(),
            run_id: run_id.to_string(),
            timer_id: timer_id.to_string(),
            fire_time: truncate_millis(fire_time),
            status: TimerStatus::Pending,
            version: 1,
            created_at: truncate_millis(Utc::now()),
            fired_at: None,
        };
        match self.store.create_timer(&timer).await {
            Ok(()) => {}
            Err(CoreError::TimerAlreadyExists { .. }) => {
                let existing = self.get_timer(namespace_id, workflow_id, run_id, timer_id).await?;
                if existing.status == TimerStatus::Pending {
                    return Err(CoreError::TimerAlreadyExists {
                        execution: existing.execution().to_string(),
                        timer_id: timer_id.to_string(),
                    });
                }
                return self.rearm(existing, timer.fire_time).await;
            }
            Err(e) => return Err(e),
        }

        debug!(
            timer = %timer.key(),
            shard_id = timer.shard_id,
            fire_time = %timer.fire_time,
            "Timer created"
        );
        Ok(timer)
    }

    /// Make sure a timer history still waits for is pending.
    ///
    /// Creates a missing timer and puts a fired or canceled one back to
    /// pending. Returns whether anything changed.
    pub async fn restore_timer(
        &self,
        key: &ExecutionKey,
        timer_id: &str,
        fire_time: DateTime<Utc>,
    ) -> Result<bool> {
        let timer_key = TimerKey::new(&key.namespace_id, &key.workflow_id, &key.run_id, timer_id);
        match self.store.get_timer(&timer_key).await? {
            Some(timer) if timer.status == TimerStatus::Pending => Ok(false),
            Some(timer) => {
                let previous = timer.status;
                let timer = self.rearm(timer, truncate_millis(fire_time)).await?;
                info!(timer = %timer.key(), previous = %previous, "Timer restored");
                Ok(true)
            }
            None => {
                self.create_timer(
                    &key.namespace_id,
                    &key.workflow_id,
                    &key.run_id,
                    timer_id,
                    fire_time,
                )
                .await?;
                info!(timer = %timer_key, "Missing timer recreated");
                Ok(true)
            }
        }
    }

    async fn rearm(&self, mut timer: Timer, fire_time: DateTime<Utc>) -> Result<Timer> {
        let expected = timer.version;
        timer.status = TimerStatus::Pending;
        timer.fire_time = fire_time;
        timer.fired_at = None;
        timer.version = self.store.update_timer(&timer, expected).await?;

        debug!(
            timer = %timer.key(),
            fire_time = %timer.fire_time,
            version = timer.version,
            "Timer re-armed"
        );
        Ok(timer)
    }

    /// Cancel a pending timer.
    ///
    /// Returns `false` (and changes nothing) when the timer already fired or
    /// was canceled. A concurrent claim surfaces as a version conflict.
    pub async fn cancel_timer(
        &self,
        namespace_id: &str,
        workflow_id: &str,
        run_id: &str,
        timer_id: &str,
    ) -> Result<bool> {
        let mut timer = self
            .get_timer(namespace_id, workflow_id, run_id, timer_id)
            .await?;
        if timer.status != TimerStatus::Pending {
            return Ok(false);
        }

        let expected = timer.version;
        timer.status = TimerStatus::Canceled;
        timer.version = expected + 1;
        self.store.update_timer(&timer, expected).await?;

        info!(timer = %timer.key(), "Timer canceled");
        Ok(true)
    }

    /// Look up a timer.
    ///
    /// Returns [`CoreError::TimerNotFound`] if it does not exist.
    pub async fn get_timer(
        &self,
        namespace_id: &str,
        workflow_id: &str,
        run_id: &str,
        timer_id: &str,
    ) -> Result<Timer> {
        let key = TimerKey::new(namespace_id, workflow_id, run_id, timer_id);
        self.store
            .get_timer(&key)
            .await?
            .ok_or_else(|| CoreError::TimerNotFound {
                execution: key.execution().to_string(),
                timer_id: timer_id.to_string(),
            })
    }

    /// Cancel every pending timer of an execution. Returns how many were canceled.
    pub async fn cancel_all_for_execution(&self, key: &ExecutionKey) -> Result<usize> {
        let mut canceled = 0;
        for timer in self.store.list_timers_for_execution(key).await? {
            if timer.status == TimerStatus::Pending
                && self
                    .cancel_timer(
                        &timer.namespace_id,
                        &timer.workflow_id,
                        &timer.run_id,
                        &timer.timer_id,
                    )
                    .await?
            {
                canceled += 1;
            }
        }
        Ok(canceled)
    }
}
