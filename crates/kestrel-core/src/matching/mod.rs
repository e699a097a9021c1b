// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task matching.
//!
//! Tasks scheduled by the history engine are queued per `(namespace, queue)`
//! and handed to polling workers. Queues are spread over partitions with a
//! consistent hash ring so partitions can be added or removed with bounded
//! queue movement.
//!
//! A polled task stays in flight until it is acked. When its deadline (its
//! start-to-close timeout, or the configured default) passes first,
//! [`MatchingEngine::reap_expired_tasks`] returns it so the caller can record
//! the failure.

pub mod partition;
pub mod priority;
pub mod ring;
pub mod task_queue;

pub use self::partition::{Partition, PartitionManager};
pub use self::priority::PriorityTaskStore;
pub use self::ring::HashRing;
pub use self::task_queue::TaskQueue;

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::state::ExecutionKey;

/// Kind of work a task carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Run the workflow's decision logic.
    Workflow,
    /// Run one node.
    Activity,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Workflow => "workflow",
            Self::Activity => "activity",
        })
    }
}

/// A unit of work handed to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    /// Unique task ID.
    pub task_id: String,
    /// Namespace.
    pub namespace_id: String,
    /// Queue name.
    pub task_queue: String,
    /// Workflow or activity.
    pub task_type: TaskType,
    /// Execution the task belongs to, if any.
    pub execution: Option<ExecutionKey>,
    /// Event ID of the scheduling event.
    pub scheduled_event_id: i64,
    /// Opaque input.
    pub payload: Vec<u8>,
    /// 0 is highest; `None` uses the queue default.
    pub priority: Option<u32>,
    /// Deadline once polled; `None` uses the engine default.
    pub start_to_close_timeout: Option<Duration>,
    /// When the task was queued.
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Create a task with default options.
    pub fn new(
        task_id: impl Into<String>,
        namespace_id: impl Into<String>,
        task_queue: impl Into<String>,
        task_type: TaskType,
        scheduled_event_id: i64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            namespace_id: namespace_id.into(),
            task_queue: task_queue.into(),
            task_type,
            execution: None,
            scheduled_event_id,
            payload,
            priority: None,
            start_to_close_timeout: None,
            created_at: Utc::now(),
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: Option<u32>) -> Self {
        self.priority = priority;
        self
    }
}

/// Full set of options for queuing a task.
#[derive(Debug, Clone, PartialEq)]
pub struct AddTaskRequest {
    /// Task ID; generated when `None`.
    pub task_id: Option<String>,
    /// Namespace.
    pub namespace_id: String,
    /// Queue name.
    pub task_queue: String,
    /// Workflow or activity.
    pub task_type: TaskType,
    /// Execution the task belongs to.
    pub execution: Option<ExecutionKey>,
    /// Event ID of the scheduling event.
    pub scheduled_event_id: i64,
    /// Opaque input.
    pub payload: Vec<u8>,
    /// 0 is highest.
    pub priority: Option<u32>,
    /// Deadline once polled.
    pub start_to_close_timeout: Option<Duration>,
}

impl AddTaskRequest {
    /// Request with only the required fields set.
    pub fn new(
        namespace_id: impl Into<String>,
        task_queue: impl Into<String>,
        task_type: TaskType,
        scheduled_event_id: i64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            task_id: None,
            namespace_id: namespace_id.into(),
            task_queue: task_queue.into(),
            task_type,
            execution: None,
            scheduled_event_id,
            payload,
            priority: None,
            start_to_close_timeout: None,
        }
    }

    fn into_task(self) -> Task {
        Task {
            task_id: self
                .task_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            namespace_id: self.namespace_id,
            task_queue: self.task_queue,
            task_type: self.task_type,
            execution: self.execution,
            scheduled_event_id: self.scheduled_event_id,
            payload: self.payload,
            priority: self.priority,
            start_to_close_timeout: self.start_to_close_timeout,
            created_at: Utc::now(),
        }
    }
}

/// Receives tasks produced by history transitions.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    /// Queue a task.
    async fn dispatch(&self, request: AddTaskRequest) -> Result<String>;
}

/// Matching tuning.
#[derive(Debug, Clone)]
pub struct MatchingConfig {
    /// Initial partitions.
    pub num_partitions: u32,
    /// Ring points per partition.
    pub ring_replicas: u32,
    /// Priority levels per queue.
    pub priority_levels: u32,
    /// Level for tasks without a priority.
    pub default_priority: u32,
    /// In-flight deadline for tasks without a start-to-close timeout.
    pub default_task_timeout: Duration,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            num_partitions: 8,
            ring_replicas: 64,
            priority_levels: 10,
            default_priority: 5,
            default_task_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
struct InflightTask {
    task: Task,
    identity: String,
    deadline: DateTime<Utc>,
}

/// Matching façade: queues tasks, serves polls, tracks in-flight work.
pub struct MatchingEngine {
    partitions: PartitionManager,
    inflight: Mutex<HashMap<String, InflightTask>>,
    default_task_timeout: Duration,
    shutdown: CancellationToken,
}

impl MatchingEngine {
    /// Create an engine with `config.num_partitions` partitions.
    pub fn new(config: MatchingConfig) -> Self {
        Self {
            partitions: PartitionManager::new(
                config.num_partitions,
                config.ring_replicas,
                config.priority_levels,
                config.default_priority,
            ),
            inflight: Mutex::new(HashMap::new()),
            default_task_timeout: config.default_task_timeout,
            shutdown: CancellationToken::new(),
        }
    }

    /// Partition manager, for ownership changes.
    pub fn partitions(&self) -> &PartitionManager {
        &self.partitions
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(CoreError::ServiceNotRunning {
                service: "matching".to_string(),
            });
        }
        Ok(())
    }

    /// Queue a task with default options. Returns its generated ID.
    pub fn add_task(
        &self,
        namespace_id: &str,
        task_queue: &str,
        task_type: TaskType,
        payload: Vec<u8>,
        scheduled_event_id: i64,
    ) -> Result<String> {
        self.add_task_with_options(AddTaskRequest::new(
            namespace_id,
            task_queue,
            task_type,
            scheduled_event_id,
            payload,
        ))
    }

    /// Queue a task.
    ///
    /// Returns [`CoreError::TaskExists`] if a task with the same ID is queued
    /// or in flight.
    pub fn add_task_with_options(&self, request: AddTaskRequest) -> Result<String> {
        self.ensure_running()?;
        if request.task_queue.is_empty() {
            return Err(CoreError::ValidationError {
                field: "task_queue".to_string(),
                message: "must not be empty".to_string(),
            });
        }

        let task = request.into_task();
        if self.inflight.lock().contains_key(&task.task_id) {
            return Err(CoreError::TaskExists {
                task_id: task.task_id,
            });
        }

        let queue = self
            .partitions
            .get_or_create_task_queue(&task.namespace_id, &task.task_queue)?;
        let task_id = task.task_id.clone();
        debug!(
            task_id = %task_id,
            namespace = %task.namespace_id,
            task_queue = %task.task_queue,
            task_type = %task.task_type,
            "Task queued"
        );
        queue.add(task)?;
        Ok(task_id)
    }

    /// Wait up to `timeout` for a task on a queue.
    ///
    /// A returned task is in flight until [`MatchingEngine::ack_task`].
    /// Returns `Ok(None)` on timeout and [`CoreError::ServiceNotRunning`] if the
    /// engine shuts down while waiting.
    #[instrument(skip(self), fields(identity = %identity))]
    pub async fn poll_task(
        &self,
        namespace_id: &str,
        task_queue: &str,
        identity: &str,
        timeout: Duration,
    ) -> Result<Option<Task>> {
        self.ensure_running()?;
        let queue = self
            .partitions
            .get_or_create_task_queue(namespace_id, task_queue)?;

        let polled = tokio::select! {
            _ = self.shutdown.cancelled() => None,
            task = queue.poll(timeout) => task,
        };
        let Some(task) = polled else {
            self.ensure_running()?;
            return Ok(None);
        };

        let timeout = task
            .start_to_close_timeout
            .unwrap_or(self.default_task_timeout);
        let deadline = Utc::now()
            .checked_add_signed(TimeDelta::from_std(timeout).unwrap_or(TimeDelta::MAX))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        debug!(task_id = %task.task_id, deadline = %deadline, "Task dispatched");
        self.inflight.lock().insert(
            task.task_id.clone(),
            InflightTask {
                task: task.clone(),
                identity: identity.to_string(),
                deadline,
            },
        );
        Ok(Some(task))
    }

    /// Mark an in-flight task done. Returns whether it was in flight.
    pub fn ack_task(&self, task_id: &str) -> bool {
        self.inflight.lock().remove(task_id).is_some()
    }

    /// Drop a task, queued or in flight. Returns whether it was found.
    pub fn cancel_task(&self, namespace_id: &str, task_queue: &str, task_id: &str) -> bool {
        if self.inflight.lock().remove(task_id).is_some() {
            return true;
        }
        self.partitions
            .get_task_queue(namespace_id, task_queue)
            .is_some_and(|queue| queue.remove(task_id))
    }

    /// Remove and return in-flight tasks whose deadline is at or before `now`.
    pub fn reap_expired_tasks(&self, now: DateTime<Utc>) -> Vec<Task> {
        let mut inflight = self.inflight.lock();
        let expired: Vec<String> = inflight
            .iter()
            .filter(|(_, t)| t.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        let mut reaped = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(entry) = inflight.remove(&id) {
                warn!(
                    task_id = %id,
                    identity = %entry.identity,
                    deadline = %entry.deadline,
                    "In-flight task expired"
                );
                reaped.push(entry.task);
            }
        }
        reaped
    }

    /// Limit a queue to `rate` dispatches per second; `None` removes the limit.
    pub fn set_rate_limit(
        &self,
        namespace_id: &str,
        task_queue: &str,
        rate: Option<f64>,
    ) -> Result<()> {
        self.ensure_running()?;
        self.partitions
            .get_or_create_task_queue(namespace_id, task_queue)?
            .set_rate_limit(rate);
        Ok(())
    }

    /// Queued (not in-flight) tasks of a queue.
    pub fn queue_depth(&self, namespace_id: &str, task_queue: &str) -> usize {
        self.partitions
            .get_task_queue(namespace_id, task_queue)
            .map_or(0, |queue| queue.len())
    }

    /// Tasks currently in flight.
    pub fn inflight_count(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Whether [`MatchingEngine::shutdown`] was called.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop accepting work and release waiting pollers.
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        for queue in self.partitions.all_queues() {
            queue.wake_all();
        }
        info!(inflight = self.inflight_count(), "Matching engine shut down");
    }
}

#[async_trait]
impl TaskDispatcher for MatchingEngine {
    async fn dispatch(&self, request: AddTaskRequest) -> Result<String> {
        self.add_task_with_options(request)
    }
}
