// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution identity and mutable state.
//!
//! [`MutableState`] is derived purely from the event log: [`MutableState::apply`]
//! is the only way state changes, and both the history engine (incrementally)
//! and [`MutableState::replay`] (from scratch) go through it. That shared path
//! is what keeps replay deterministic.
//!
//! # Execution Status State Machine
//!
//! ```text
//!  ┌─────────┐  ExecutionStarted  ┌─────────┐
//!  │ PENDING │───────────────────►│ RUNNING │
//!  └─────────┘                    └────┬────┘
//!                                      │
//!          ┌────────────┬──────────────┼──────────────┐
//!          ▼            ▼              ▼              ▼
//!    ┌───────────┐ ┌────────┐ ┌────────────┐ ┌───────────┐
//!    │ COMPLETED │ │ FAILED │ │ TERMINATED │ │ TIMED_OUT │
//!    └───────────┘ └────────┘ └────────────┘ └───────────┘
//! ```

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::events::{EventAttributes, HistoryEvent};

/// Addresses one workflow run. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionKey {
    /// Namespace the workflow belongs to.
    pub namespace_id: String,
    /// Workflow ID, stable across runs.
    pub workflow_id: String,
    /// Run ID, unique per run.
    pub run_id: String,
}

impl ExecutionKey {
    /// Create a new execution key.
    pub fn new(
        namespace_id: impl Into<String>,
        workflow_id: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            namespace_id: namespace_id.into(),
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
        }
    }

    /// Parse the `namespace/workflow/run` display form.
    ///
    /// The namespace ends at the first `/` and the run ID starts after the
    /// last one, so workflow IDs may contain slashes.
    pub fn parse(value: &str) -> Option<Self> {
        let (namespace_id, rest) = value.split_once('/')?;
        let (workflow_id, run_id) = rest.rsplit_once('/')?;
        if namespace_id.is_empty() || workflow_id.is_empty() || run_id.is_empty() {
            return None;
        }
        Some(Self::new(namespace_id, workflow_id, run_id))
    }
}

impl fmt::Display for ExecutionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace_id, self.workflow_id, self.run_id)
    }
}

/// Lifecycle status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// No `ExecutionStarted` event applied yet.
    #[default]
    Pending,
    /// Started and not closed.
    Running,
    /// Closed successfully.
    Completed,
    /// Closed with a failure.
    Failed,
    /// Closed by an operator.
    Terminated,
    /// Closed by its execution timeout.
    TimedOut,
}

impl ExecutionStatus {
    /// Status name as persisted.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
            Self::TimedOut => "timed_out",
        }
    }

    /// Whether the execution is closed.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Terminated | Self::TimedOut
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution-level facts.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutionInfo {
    /// Current status.
    pub status: ExecutionStatus,
    /// Workflow type name.
    pub workflow_type: String,
    /// Task queue for workflow tasks.
    pub task_queue: String,
    /// Execution timeout in milliseconds (0 = none).
    pub execution_timeout_ms: i64,
    /// Parent execution key for child runs.
    pub parent_execution: Option<String>,
    /// When `ExecutionStarted` was recorded.
    pub start_time: Option<DateTime<Utc>>,
    /// When the terminal event was recorded.
    pub close_time: Option<DateTime<Utc>>,
    /// Timestamp of the last applied event.
    pub last_update_time: Option<DateTime<Utc>>,
    /// Task ID of the last applied event.
    pub last_event_task_id: i64,
    /// Signals received so far.
    pub signal_count: i64,
}

/// A scheduled node (activity) that has not completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingActivityInfo {
    /// Event ID of `NodeScheduled`.
    pub scheduled_event_id: i64,
    /// Node ID from the workflow definition.
    pub node_id: String,
    /// Node type.
    pub node_type: String,
    /// Queue the task was dispatched to.
    pub task_queue: String,
    /// Requested priority.
    pub priority: Option<u32>,
    /// Requested start-to-close timeout (0 = matching default).
    pub start_to_close_timeout_ms: i64,
    /// When it was scheduled.
    pub scheduled_time: DateTime<Utc>,
    /// Event ID of `NodeStarted`, once started.
    pub started_event_id: Option<i64>,
    /// Worker identity that started it.
    pub started_identity: Option<String>,
    /// Attempt number reported at start.
    pub attempt: i32,
}

/// A started timer that has neither fired nor been canceled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTimerInfo {
    /// Timer ID, unique within the execution.
    pub timer_id: String,
    /// Event ID of `TimerStarted`.
    pub started_event_id: i64,
    /// When the timer is due.
    pub fire_time: DateTime<Utc>,
}

/// A child execution that has not closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChildExecutionInfo {
    /// Event ID of `ChildExecutionInitiated`.
    pub initiated_event_id: i64,
    /// Child execution key.
    pub execution: ExecutionKey,
    /// Child workflow type.
    pub workflow_type: String,
}

/// The outstanding workflow task, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTaskInfo {
    /// Event ID of `WorkflowTaskScheduled`.
    pub scheduled_event_id: i64,
    /// Event ID of `WorkflowTaskStarted`, once started.
    pub started_event_id: Option<i64>,
    /// Queue it was dispatched to.
    pub task_queue: String,
    /// Worker identity that started it.
    pub identity: Option<String>,
}

/// A signal held back while a workflow task is in flight.
///
/// Buffered signals have no event ID until they are flushed into the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedSignal {
    /// Signal name.
    pub signal_name: String,
    /// Signal payload.
    pub input: Vec<u8>,
    /// Sender identity.
    pub identity: String,
    /// When it arrived.
    pub received_at: DateTime<Utc>,
}

/// Derived current state of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutableState {
    /// The execution this state belongs to.
    pub key: ExecutionKey,
    /// Execution-level facts.
    pub execution_info: ExecutionInfo,
    /// ID the next appended event must use.
    pub next_event_id: i64,
    /// Optimistic-concurrency counter, owned by the state store.
    pub db_version: i64,
    /// Pending nodes keyed by scheduled event ID.
    pub pending_activities: BTreeMap<i64, PendingActivityInfo>,
    /// Pending timers keyed by timer ID.
    pub pending_timers: BTreeMap<String, PendingTimerInfo>,
    /// Pending children keyed by initiated event ID.
    pub pending_child_executions: BTreeMap<i64, PendingChildExecutionInfo>,
    /// Outstanding workflow task.
    pub pending_workflow_task: Option<WorkflowTaskInfo>,
    /// Signals waiting for the in-flight workflow task to complete.
    pub buffered_events: Vec<BufferedSignal>,
}

impl MutableState {
    /// Empty state for an execution with no events.
    pub fn new(key: ExecutionKey) -> Self {
        Self {
            key,
            execution_info: ExecutionInfo::default(),
            next_event_id: 1,
            db_version: 0,
            pending_activities: BTreeMap::new(),
            pending_timers: BTreeMap::new(),
            pending_child_executions: BTreeMap::new(),
            pending_workflow_task: None,
            buffered_events: Vec::new(),
        }
    }

    /// Rebuild state from a complete event log.
    pub fn replay<'a>(
        key: ExecutionKey,
        events: impl IntoIterator<Item = &'a HistoryEvent>,
    ) -> Result<Self> {
        let mut state = Self::new(key);
        for event in events {
            state.apply(event)?;
        }
        Ok(state)
    }

    /// Current status.
    pub fn status(&self) -> ExecutionStatus {
        self.execution_info.status
    }

    /// Whether the execution is running.
    pub fn is_running(&self) -> bool {
        self.execution_info.status == ExecutionStatus::Running
    }

    /// ID of the last appended event (0 when the log is empty).
    pub fn last_event_id(&self) -> i64 {
        self.next_event_id - 1
    }

    /// Whether a workflow task has been started and not yet completed.
    pub fn workflow_task_in_flight(&self) -> bool {
        self.pending_workflow_task
            .as_ref()
            .is_some_and(|task| task.started_event_id.is_some())
    }

    /// Compare everything the event log determines.
    ///
    /// `db_version` and `buffered_events` are store-side bookkeeping and are
    /// not reconstructed by replay.
    pub fn equivalent(&self, other: &MutableState) -> bool {
        self.key == other.key
            && self.execution_info == other.execution_info
            && self.next_event_id == other.next_event_id
            && self.pending_activities == other.pending_activities
            && self.pending_timers == other.pending_timers
            && self.pending_child_executions == other.pending_child_executions
            && self.pending_workflow_task == other.pending_workflow_task
    }

    /// Apply one event. Events must arrive in log order.
    pub fn apply(&mut self, event: &HistoryEvent) -> Result<()> {
        if event.event_id != self.next_event_id {
            return Err(CoreError::ValidationError {
                field: "event_id".to_string(),
                message: format!(
                    "execution '{}' expected event {}, got {}",
                    self.key, self.next_event_id, event.event_id
                ),
            });
        }

        let ts = event.timestamp;
        match &event.attributes {
            EventAttributes::ExecutionStarted(a) => {
                let info = &mut self.execution_info;
                info.status = ExecutionStatus::Running;
                info.workflow_type = a.workflow_type.clone();
                info.task_queue = a.task_queue.clone();
                info.execution_timeout_ms = a.execution_timeout_ms;
                info.parent_execution = a.parent_execution.clone();
                info.start_time = Some(ts);
            }
            EventAttributes::ExecutionCompleted(_) => self.close(ExecutionStatus::Completed, ts),
            EventAttributes::ExecutionFailed(_) => self.close(ExecutionStatus::Failed, ts),
            EventAttributes::ExecutionTerminated(_) => self.close(ExecutionStatus::Terminated, ts),
            EventAttributes::ExecutionTimedOut(_) => self.close(ExecutionStatus::TimedOut, ts),
            EventAttributes::WorkflowTaskScheduled(a) => {
                self.pending_workflow_task = Some(WorkflowTaskInfo {
                    scheduled_event_id: event.event_id,
                    started_event_id: None,
                    task_queue: a.task_queue.clone(),
                    identity: None,
                });
            }
            EventAttributes::WorkflowTaskStarted(a) => {
                if let Some(task) = self.pending_workflow_task.as_mut()
                    && task.scheduled_event_id == a.scheduled_event_id
                {
                    task.started_event_id = Some(event.event_id);
                    task.identity = Some(a.identity.clone());
                }
            }
            EventAttributes::WorkflowTaskCompleted(_) => {
                self.pending_workflow_task = None;
            }
            EventAttributes::NodeScheduled(a) => {
                self.pending_activities.insert(
                    event.event_id,
                    PendingActivityInfo {
                        scheduled_event_id: event.event_id,
                        node_id: a.node_id.clone(),
                        node_type: a.node_type.clone(),
                        task_queue: a.task_queue.clone(),
                        priority: a.priority,
                        start_to_close_timeout_ms: a.start_to_close_timeout_ms,
                        scheduled_time: ts,
                        started_event_id: None,
                        started_identity: None,
                        attempt: 0,
                    },
                );
            }
            EventAttributes::NodeStarted(a) => {
                if let Some(activity) = self.pending_activities.get_mut(&a.scheduled_event_id) {
                    activity.started_event_id = Some(event.event_id);
                    activity.started_identity = Some(a.identity.clone());
                    activity.attempt = a.attempt;
                }
            }
            EventAttributes::NodeCompleted(a) => {
                self.pending_activities.remove(&a.scheduled_event_id);
            }
            EventAttributes::NodeFailed(a) => {
                self.pending_activities.remove(&a.scheduled_event_id);
            }
            EventAttributes::TimerStarted(a) => {
                let fire_time = DateTime::from_timestamp_millis(a.fire_at_ms).unwrap_or(ts);
                self.pending_timers.insert(
                    a.timer_id.clone(),
                    PendingTimerInfo {
                        timer_id: a.timer_id.clone(),
                        started_event_id: event.event_id,
                        fire_time,
                    },
                );
            }
            EventAttributes::TimerFired(a) => {
                self.pending_timers.remove(&a.timer_id);
            }
            EventAttributes::TimerCanceled(a) => {
                self.pending_timers.remove(&a.timer_id);
            }
            EventAttributes::SignalReceived(_) => {
                self.execution_info.signal_count += 1;
            }
            EventAttributes::MarkerRecorded(_) => {}
            EventAttributes::ChildExecutionInitiated(a) => {
                self.pending_child_executions.insert(
                    event.event_id,
                    PendingChildExecutionInfo {
                        initiated_event_id: event.event_id,
                        execution: ExecutionKey::new(&a.namespace_id, &a.workflow_id, &a.run_id),
                        workflow_type: a.workflow_type.clone(),
                    },
                );
            }
            EventAttributes::ChildExecutionClosed(a) => {
                self.pending_child_executions.remove(&a.initiated_event_id);
            }
        }

        self.execution_info.last_update_time = Some(ts);
        self.execution_info.last_event_task_id = event.task_id;
        self.next_event_id = event.event_id + 1;
        Ok(())
    }

    fn close(&mut self, status: ExecutionStatus, at: DateTime<Utc>) {
        self.execution_info.status = status;
        self.execution_info.close_time = Some(at);
        self.pending_activities.clear();
        self.pending_timers.clear();
        self.pending_child_executions.clear();
        self.pending_workflow_task = None;
    }
}
