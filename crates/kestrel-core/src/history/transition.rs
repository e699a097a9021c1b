// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! One state transition: events built against a working copy of the state,
//! plus the side effects to hand off once the transition commits.

use chrono::{DateTime, SubsecRound, Utc};

use crate::error::{CoreError, Result};
use crate::events::{EventAttributes, HistoryEvent, WorkflowTaskScheduledAttributes};
use crate::matching::{AddTaskRequest, TaskType};
use crate::state::{BufferedSignal, ExecutionKey, MutableState};

use std::time::Duration;

/// Timer work produced by a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum TimerCommand {
    /// Persist a durable timer.
    Create {
        /// Timer ID within the run.
        timer_id: String,
        /// When it is due.
        fire_time: DateTime<Utc>,
    },
    /// Cancel one pending timer.
    Cancel {
        /// Timer ID within the run.
        timer_id: String,
    },
    /// Cancel every pending timer of the execution.
    CancelAll,
}

/// Result of a record operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordOutcome {
    /// Events appended, in order. Empty for no-ops and buffered signals.
    pub events: Vec<HistoryEvent>,
    /// Tasks handed to matching.
    pub tasks: Vec<AddTaskRequest>,
    /// Timer commands handed to the timer registry.
    pub timers: Vec<TimerCommand>,
    /// State version after the commit (unchanged for no-ops).
    pub db_version: i64,
}

impl RecordOutcome {
    /// Whether the operation changed nothing.
    pub fn is_noop(&self) -> bool {
        self.events.is_empty() && self.tasks.is_empty() && self.timers.is_empty()
    }

    /// IDs of the appended events.
    pub fn event_ids(&self) -> Vec<i64> {
        self.events.iter().map(|e| e.event_id).collect()
    }
}

/// Work that needs another execution's transition.
#[derive(Debug, Clone)]
pub(crate) enum FollowUp {
    StartChild {
        child: ExecutionKey,
        parent: ExecutionKey,
        workflow_type: String,
        task_queue: String,
        input: Vec<u8>,
    },
    NotifyParent {
        parent: ExecutionKey,
        child: ExecutionKey,
        status: String,
        result: Vec<u8>,
    },
}

pub(crate) struct Transition {
    pub state: MutableState,
    pub events: Vec<HistoryEvent>,
    pub tasks: Vec<AddTaskRequest>,
    pub timers: Vec<TimerCommand>,
    pub follow_ups: Vec<FollowUp>,
    pub now: DateTime<Utc>,
    dirty: bool,
    event_version: i64,
    task_id: i64,
    workflow_task_timeout: Duration,
}

impl Transition {
    pub fn new(
        state: MutableState,
        event_version: i64,
        task_id: i64,
        workflow_task_timeout: Duration,
    ) -> Self {
        Self {
            state,
            events: Vec::new(),
            tasks: Vec::new(),
            timers: Vec::new(),
            follow_ups: Vec::new(),
            // Microseconds survive both encodings unchanged.
            now: Utc::now().trunc_subsecs(6),
            dirty: false,
            event_version,
            task_id,
            workflow_task_timeout,
        }
    }

    pub fn key(&self) -> &ExecutionKey {
        &self.state.key
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn require_running(&self) -> Result<()> {
        if self.state.is_running() {
            return Ok(());
        }
        Err(CoreError::InvalidExecutionState {
            execution: self.state.key.to_string(),
            expected: "running".to_string(),
            actual: self.state.status().to_string(),
        })
    }

    /// Append one event to the working state. Returns its ID.
    pub fn record(&mut self, attributes: EventAttributes) -> Result<i64> {
        let event = HistoryEvent::new(
            self.state.next_event_id,
            self.now,
            self.event_version,
            self.task_id,
            attributes,
        );
        self.state.apply(&event)?;
        let id = event.event_id;
        self.events.push(event);
        self.dirty = true;
        Ok(id)
    }

    /// Hold a signal until the in-flight workflow task completes.
    pub fn buffer_signal(&mut self, signal: BufferedSignal) {
        self.state.buffered_events.push(signal);
        self.dirty = true;
    }

    /// Schedule a workflow task unless one is already pending.
    pub fn schedule_workflow_task_if_idle(&mut self) -> Result<Option<i64>> {
        if self.state.pending_workflow_task.is_some() || !self.state.is_running() {
            return Ok(None);
        }
        let task_queue = self.state.execution_info.task_queue.clone();
        let timeout_ms = self.workflow_task_timeout.as_millis() as i64;
        let scheduled_event_id = self.record(EventAttributes::WorkflowTaskScheduled(
            WorkflowTaskScheduledAttributes {
                task_queue: task_queue.clone(),
                start_to_close_timeout_ms: timeout_ms,
            },
        ))?;
        self.tasks.push(workflow_task_request(
            self.key(),
            &task_queue,
            scheduled_event_id,
            self.workflow_task_timeout,
        ));
        Ok(Some(scheduled_event_id))
    }
}

/// Deterministic task ID: re-dispatching the same scheduled event is rejected
/// as a duplicate instead of queuing twice.
pub(crate) fn task_id_for(key: &ExecutionKey, scheduled_event_id: i64) -> String {
    format!("{}:{}", key, scheduled_event_id)
}

pub(crate) fn workflow_task_request(
    key: &ExecutionKey,
    task_queue: &str,
    scheduled_event_id: i64,
    timeout: Duration,
) -> AddTaskRequest {
    AddTaskRequest {
        task_id: Some(task_id_for(key, scheduled_event_id)),
        namespace_id: key.namespace_id.clone(),
        task_queue: task_queue.to_string(),
        task_type: TaskType::Workflow,
        execution: Some(key.clone()),
        scheduled_event_id,
        payload: Vec::new(),
        priority: None,
        start_to_close_timeout: Some(timeout).filter(|t| !t.is_zero()),
    }
}

pub(crate) fn activity_task_request(
    key: &ExecutionKey,
    task_queue: &str,
    scheduled_event_id: i64,
    input: Vec<u8>,
    priority: Option<u32>,
    start_to_close_timeout_ms: i64,
) -> AddTaskRequest {
    AddTaskRequest {
        task_id: Some(task_id_for(key, scheduled_event_id)),
        namespace_id: key.namespace_id.clone(),
        task_queue: task_queue.to_string(),
        task_type: TaskType::Activity,
        execution: Some(key.clone()),
        scheduled_event_id,
        payload: input,
        priority,
        start_to_close_timeout: u64::try_from(start_to_close_timeout_ms)
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis),
    }
}
