// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! History engine.
//!
//! Every record operation is one optimistic transaction:
//!
//! 1. read the mutable state at version `v`
//! 2. build events starting at `next_event_id` and apply them to a copy
//! 3. commit events and state with `v` as the expected version
//!
//! A concurrent writer makes step 3 fail with
//! [`CoreError::OptimisticLockConflict`]. The engine never retries: the caller
//! re-reads and decides again.
//!
//! Tasks and timers produced by a transition are handed to the configured
//! [`TaskDispatcher`] and [`TimerScheduler`] only after the commit. Hand-off
//! failures are logged; the committed history stays as is and the runtime's
//! recovery re-dispatches pending work.

mod transition;

pub use self::transition::{RecordOutcome, TimerCommand};

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, error, info, instrument, warn};

use self::transition::{FollowUp, Transition, activity_task_request, workflow_task_request};
use crate::error::{CoreError, Result};
use crate::events::*;
use crate::matching::{AddTaskRequest, TaskDispatcher};
use crate::persistence::{EventStore, ExecutionStore, MutableStateStore};
use crate::state::{BufferedSignal, ExecutionKey, MutableState};
use crate::timer::{TimerFiredCallback, TimerRegistry};

/// Timer ID of the timer enforcing an execution's timeout.
pub const EXECUTION_TIMEOUT_TIMER_ID: &str = "__execution_timeout";

/// Default start-to-close timeout of workflow tasks.
pub const DEFAULT_WORKFLOW_TASK_TIMEOUT: Duration = Duration::from_secs(10);

type BoxFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Applies timer commands produced by history transitions.
#[async_trait]
pub trait TimerScheduler: Send + Sync {
    /// Persist a timer for `key`.
    async fn schedule_timer(
        &self,
        key: &ExecutionKey,
        timer_id: &str,
        fire_time: DateTime<Utc>,
    ) -> Result<()>;

    /// Cancel one timer of `key`.
    async fn cancel_timer(&self, key: &ExecutionKey, timer_id: &str) -> Result<()>;

    /// Cancel every pending timer of `key`.
    async fn cancel_all_timers(&self, key: &ExecutionKey) -> Result<()>;
}

#[async_trait]
impl TimerScheduler for TimerRegistry {
    async fn schedule_timer(
        &self,
        key: &ExecutionKey,
        timer_id: &str,
        fire_time: DateTime<Utc>,
    ) -> Result<()> {
        self.create_timer(
            &key.namespace_id,
            &key.workflow_id,
            &key.run_id,
            timer_id,
            fire_time,
        )
        .await
        .map(|_| ())
    }

    async fn cancel_timer(&self, key: &ExecutionKey, timer_id: &str) -> Result<()> {
        TimerRegistry::cancel_timer(
            self,
            &key.namespace_id,
            &key.workflow_id,
            &key.run_id,
            timer_id,
        )
        .await
        .map(|_| ())
    }

    async fn cancel_all_timers(&self, key: &ExecutionKey) -> Result<()> {
        self.cancel_all_for_execution(key).await.map(|_| ())
    }
}

/// Input of [`HistoryEngine::start_execution`].
#[derive(Debug, Clone, Default)]
pub struct StartExecutionRequest {
    /// Workflow type name.
    pub workflow_type: String,
    /// Queue for workflow tasks.
    pub task_queue: String,
    /// Workflow input.
    pub input: Vec<u8>,
    /// Close the execution as timed out after this long.
    pub execution_timeout: Option<Duration>,
    /// Parent of a child execution.
    pub parent_execution: Option<ExecutionKey>,
    /// Caller identity.
    pub identity: String,
}

/// Input of [`HistoryEngine::schedule_node`].
#[derive(Debug, Clone, Default)]
pub struct ScheduleNodeRequest {
    /// Node ID from the workflow definition.
    pub node_id: String,
    /// Node type.
    pub node_type: String,
    /// Queue; empty uses the execution's queue.
    pub task_queue: String,
    /// Node input.
    pub input: Vec<u8>,
    /// 0 is highest.
    pub priority: Option<u32>,
    /// Deadline once a worker picks it up.
    pub start_to_close_timeout: Option<Duration>,
}

/// Input of [`HistoryEngine::initiate_child_execution`].
#[derive(Debug, Clone, Default)]
pub struct StartChildRequest {
    /// Child workflow ID (same namespace as the parent).
    pub workflow_id: String,
    /// Child run ID.
    pub run_id: String,
    /// Child workflow type.
    pub workflow_type: String,
    /// Queue; empty uses the parent's queue.
    pub task_queue: String,
    /// Child input.
    pub input: Vec<u8>,
}

/// One page of history.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryPage {
    /// Events in order.
    pub events: Vec<HistoryEvent>,
    /// First event ID of the next page, `None` on the last page.
    pub next_page_first_event_id: Option<i64>,
}

/// Records events and maintains mutable state for all executions.
pub struct HistoryEngine {
    store: Arc<dyn ExecutionStore>,
    dispatcher: Option<Arc<dyn TaskDispatcher>>,
    timers: Option<Arc<dyn TimerScheduler>>,
    workflow_task_timeout: Duration,
    event_version: i64,
    next_task_id: AtomicI64,
}

impl HistoryEngine {
    /// Create an engine without hand-off targets.
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self {
            store,
            dispatcher: None,
            timers: None,
            workflow_task_timeout: DEFAULT_WORKFLOW_TASK_TIMEOUT,
            event_version: 1,
            next_task_id: AtomicI64::new(Utc::now().timestamp_micros()),
        }
    }

    /// Hand produced tasks to `dispatcher`.
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn TaskDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Hand produced timer commands to `timers`.
    pub fn with_timer_scheduler(mut self, timers: Arc<dyn TimerScheduler>) -> Self {
        self.timers = Some(timers);
        self
    }

    /// Start-to-close timeout of workflow tasks.
    pub fn with_workflow_task_timeout(mut self, timeout: Duration) -> Self {
        self.workflow_task_timeout = timeout;
        self
    }

    /// Backing store.
    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    fn begin(&self, state: MutableState) -> Transition {
        Transition::new(
            state,
            self.event_version,
            self.next_task_id.fetch_add(1, Ordering::Relaxed),
            self.workflow_task_timeout,
        )
    }

    /// Read, transform, commit. `build` sees the state as read.
    async fn update<F>(&self, key: &ExecutionKey, build: F) -> Result<RecordOutcome>
    where
        F: FnOnce(&mut Transition) -> Result<()> + Send,
    {
        let state = self.store.get_mutable_state(key).await?;
        let mut tx = self.begin(state);
        build(&mut tx)?;
        self.commit(tx).await
    }

    async fn commit(&self, tx: Transition) -> Result<RecordOutcome> {
        if !tx.is_dirty() {
            return Ok(RecordOutcome {
                db_version: tx.state.db_version,
                ..Default::default()
            });
        }

        let key = tx.state.key.clone();
        let expected_version = tx.state.db_version;
        let expected_last_event_id = tx
            .events
            .first()
            .map_or(tx.state.last_event_id(), |e| e.event_id - 1);

        let db_version = self
            .store
            .commit_transition(
                &key,
                &tx.events,
                expected_last_event_id,
                &tx.state,
                expected_version,
            )
            .await?;

        debug!(
            execution = %key,
            events = tx.events.len(),
            db_version,
            "Transition committed"
        );

        let outcome = RecordOutcome {
            events: tx.events,
            tasks: tx.tasks,
            timers: tx.timers,
            db_version,
        };
        self.hand_off(&key, &outcome).await;
        self.run_follow_ups(tx.follow_ups).await;
        Ok(outcome)
    }

    async fn hand_off(&self, key: &ExecutionKey, outcome: &RecordOutcome) {
        if let Some(dispatcher) = &self.dispatcher {
            for task in &outcome.tasks {
                match dispatcher.dispatch(task.clone()).await {
                    Ok(task_id) => debug!(execution = %key, task_id = %task_id, "Task handed off"),
                    Err(CoreError::TaskExists { task_id }) => {
                        debug!(execution = %key, task_id = %task_id, "Task already queued")
                    }
                    Err(e) => error!(
                        execution = %key,
                        scheduled_event_id = task.scheduled_event_id,
                        error = %e,
                        "Failed to hand off task"
                    ),
                }
            }
        }

        if let Some(timers) = &self.timers {
            for command in &outcome.timers {
                let result = match command {
                    TimerCommand::Create {
                        timer_id,
                        fire_time,
                    } => timers.schedule_timer(key, timer_id, *fire_time).await,
                    TimerCommand::Cancel { timer_id } => timers.cancel_timer(key, timer_id).await,
                    TimerCommand::CancelAll => timers.cancel_all_timers(key).await,
                };
                if let Err(e) = result {
                    error!(execution = %key, command = ?command, error = %e, "Failed to hand off timer");
                }
            }
        }
    }

    fn run_follow_ups(&self, follow_ups: Vec<FollowUp>) -> BoxFuture<'_> {
        Box::pin(async move {
            for follow_up in follow_ups {
                match follow_up {
                    FollowUp::StartChild {
                        child,
                        parent,
                        workflow_type,
                        task_queue,
                        input,
                    } => {
                        let request = StartExecutionRequest {
                            workflow_type,
                            task_queue,
                            input,
                            execution_timeout: None,
                            parent_execution: Some(parent.clone()),
                            identity: parent.to_string(),
                        };
                        if let Err(e) = self.start_execution(&child, request).await {
                            error!(parent = %parent, child = %child, error = %e, "Failed to start child execution");
                        }
                    }
                    FollowUp::NotifyParent {
                        parent,
                        child,
                        status,
                        result,
                    } => {
                        if let Err(e) = self.notify_parent(&parent, &child, status, result).await {
                            error!(parent = %parent, child = %child, error = %e, "Failed to notify parent execution");
                        }
                    }
                }
            }
        })
    }

    async fn notify_parent(
        &self,
        parent: &ExecutionKey,
        child: &ExecutionKey,
        status: String,
        result: Vec<u8>,
    ) -> Result<()> {
        let state = self.store.get_mutable_state(parent).await?;
        let initiated = state
            .pending_child_executions
            .values()
            .find(|c| &c.execution == child)
            .map(|c| c.initiated_event_id);
        match initiated {
            Some(initiated_event_id) => self
                .record_child_execution_closed(parent, initiated_event_id, &status, result)
                .await
                .map(|_| ()),
            None => {
                debug!(parent = %parent, child = %child, "Parent no longer waits for child");
                Ok(())
            }
        }
    }

    /// Close with a terminal event, cancel timers, notify the parent.
    fn close(tx: &mut Transition, attributes: EventAttributes) -> Result<()> {
        tx.require_running()?;
        let event_type = attributes.event_type();
        let result = match &attributes {
            EventAttributes::ExecutionCompleted(a) => a.result.clone(),
            _ => Vec::new(),
        };
        let parent = tx.state.execution_info.parent_execution.clone();
        tx.state.buffered_events.clear();
        tx.record(attributes)?;
        tx.timers.push(TimerCommand::CancelAll);

        if let Some(parent) = parent.as_deref().and_then(ExecutionKey::parse) {
            let child = tx.key().clone();
            let status = tx.state.status().to_string();
            tx.follow_ups.push(FollowUp::NotifyParent {
                parent,
                child,
                status,
                result,
            });
        }
        debug!(execution = %tx.key(), event_type = %event_type, "Execution closed");
        Ok(())
    }

    // ---- execution lifecycle ----

    /// Start a new execution: `ExecutionStarted` then `WorkflowTaskScheduled`.
    ///
    /// Returns [`CoreError::ExecutionAlreadyExists`] if the run exists.
    #[instrument(skip(self, request), fields(execution = %key, workflow_type = %request.workflow_type))]
    pub async fn start_execution(
        &self,
        key: &ExecutionKey,
        request: StartExecutionRequest,
    ) -> Result<RecordOutcome> {
        if request.task_queue.is_empty() {
            return Err(CoreError::ValidationError {
                field: "task_queue".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        match self.store.get_mutable_state(key).await {
            Ok(_) => {
                return Err(CoreError::ExecutionAlreadyExists {
                    execution: key.to_string(),
                });
            }
            Err(CoreError::ExecutionNotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        let mut tx = self.begin(MutableState::new(key.clone()));
        let timeout_ms = request
            .execution_timeout
            .map_or(0, |t| t.as_millis() as i64);
        tx.record(EventAttributes::ExecutionStarted(ExecutionStartedAttributes {
            workflow_type: request.workflow_type,
            task_queue: request.task_queue,
            input: request.input,
            execution_timeout_ms: timeout_ms,
            parent_execution: request.parent_execution.map(|p| p.to_string()),
            identity: request.identity,
        }))?;
        tx.schedule_workflow_task_if_idle()?;
        if timeout_ms > 0 {
            tx.timers.push(TimerCommand::Create {
                timer_id: EXECUTION_TIMEOUT_TIMER_ID.to_string(),
                fire_time: tx.now + TimeDelta::milliseconds(timeout_ms),
            });
        }

        let outcome = self.commit(tx).await.map_err(|e| match e {
            // Lost the creation race.
            CoreError::OptimisticLockConflict { .. } => CoreError::ExecutionAlreadyExists {
                execution: key.to_string(),
            },
            other => other,
        })?;
        info!("Execution started");
        Ok(outcome)
    }

    /// Close the execution as completed.
    #[instrument(skip(self, result), fields(execution = %key))]
    pub async fn complete_execution(
        &self,
        key: &ExecutionKey,
        result: Vec<u8>,
    ) -> Result<RecordOutcome> {
        self.update(key, |tx| {
            Self::close(
                tx,
                EventAttributes::ExecutionCompleted(ExecutionCompletedAttributes { result }),
            )
        })
        .await
    }

    /// Close the execution as failed.
    #[instrument(skip(self, details), fields(execution = %key))]
    pub async fn fail_execution(
        &self,
        key: &ExecutionKey,
        reason: &str,
        details: Vec<u8>,
    ) -> Result<RecordOutcome> {
        let reason = reason.to_string();
        self.update(key, |tx| {
            Self::close(
                tx,
                EventAttributes::ExecutionFailed(ExecutionFailedAttributes { reason, details }),
            )
        })
        .await
    }

    /// Close the execution as terminated by `identity`.
    #[instrument(skip(self), fields(execution = %key))]
    pub async fn terminate_execution(
        &self,
        key: &ExecutionKey,
        reason: &str,
        identity: &str,
    ) -> Result<RecordOutcome> {
        let attributes = EventAttributes::ExecutionTerminated(ExecutionTerminatedAttributes {
            reason: reason.to_string(),
            identity: identity.to_string(),
        });
        let outcome = self.update(key, |tx| Self::close(tx, attributes)).await?;
        info!(reason, "Execution terminated");
        Ok(outcome)
    }

    /// Close the execution as timed out.
    #[instrument(skip(self), fields(execution = %key))]
    pub async fn time_out_execution(&self, key: &ExecutionKey) -> Result<RecordOutcome> {
        self.update(key, |tx| {
            let timeout_ms = tx.state.execution_info.execution_timeout_ms;
            Self::close(
                tx,
                EventAttributes::ExecutionTimedOut(ExecutionTimedOutAttributes { timeout_ms }),
            )
        })
        .await
    }

    // ---- workflow tasks ----

    /// Schedule a workflow task. No-op if one is already pending.
    #[instrument(skip(self), fields(execution = %key))]
    pub async fn schedule_workflow_task(&self, key: &ExecutionKey) -> Result<RecordOutcome> {
        self.update(key, |tx| {
            tx.require_running()?;
            tx.schedule_workflow_task_if_idle().map(|_| ())
        })
        .await
    }

    /// A worker picked up the pending workflow task.
    #[instrument(skip(self), fields(execution = %key))]
    pub async fn record_workflow_task_started(
        &self,
        key: &ExecutionKey,
        scheduled_event_id: i64,
        identity: &str,
    ) -> Result<RecordOutcome> {
        let identity = identity.to_string();
        self.update(key, |tx| {
            tx.require_running()?;
            check_workflow_task(tx, scheduled_event_id)?;
            tx.record(EventAttributes::WorkflowTaskStarted(WorkflowTaskStartedAttributes {
                scheduled_event_id,
                identity,
            }))
            .map(|_| ())
        })
        .await
    }

    /// The worker finished the workflow task.
    ///
    /// Signals buffered meanwhile are appended afterwards, followed by a new
    /// workflow task so the workflow sees them.
    #[instrument(skip(self), fields(execution = %key))]
    pub async fn record_workflow_task_completed(
        &self,
        key: &ExecutionKey,
        scheduled_event_id: i64,
        identity: &str,
    ) -> Result<RecordOutcome> {
        let identity = identity.to_string();
        self.update(key, |tx| {
            tx.require_running()?;
            let started_event_id = check_workflow_task(tx, scheduled_event_id)?
                .ok_or_else(|| CoreError::ValidationError {
                    field: "scheduled_event_id".to_string(),
                    message: format!("workflow task {} was not started", scheduled_event_id),
                })?;
            tx.record(EventAttributes::WorkflowTaskCompleted(
                WorkflowTaskCompletedAttributes {
                    scheduled_event_id,
                    started_event_id,
                    identity,
                },
            ))?;

            let buffered = std::mem::take(&mut tx.state.buffered_events);
            if !buffered.is_empty() {
                for signal in buffered {
                    tx.record(EventAttributes::SignalReceived(SignalReceivedAttributes {
                        signal_name: signal.signal_name,
                        input: signal.input,
                        identity: signal.identity,
                    }))?;
                }
                tx.schedule_workflow_task_if_idle()?;
            }
            Ok(())
        })
        .await
    }

    // ---- nodes ----

    /// Schedule a node and hand its task to matching.
    #[instrument(skip(self, request), fields(execution = %key, node_id = %request.node_id))]
    pub async fn schedule_node(
        &self,
        key: &ExecutionKey,
        request: ScheduleNodeRequest,
    ) -> Result<RecordOutcome> {
        self.update(key, |tx| {
            tx.require_running()?;
            let task_queue = if request.task_queue.is_empty() {
                tx.state.execution_info.task_queue.clone()
            } else {
                request.task_queue
            };
            let timeout_ms = request
                .start_to_close_timeout
                .map_or(0, |t| t.as_millis() as i64);
            let scheduled_event_id =
                tx.record(EventAttributes::NodeScheduled(NodeScheduledAttributes {
                    node_id: request.node_id,
                    node_type: request.node_type,
                    task_queue: task_queue.clone(),
                    input: request.input.clone(),
                    priority: request.priority,
                    start_to_close_timeout_ms: timeout_ms,
                }))?;
            let task = activity_task_request(
                tx.key(),
                &task_queue,
                scheduled_event_id,
                request.input,
                request.priority,
                timeout_ms,
            );
            tx.tasks.push(task);
            Ok(())
        })
        .await
    }

    /// A worker picked up a node. Repeated starts (redelivery) are recorded.
    #[instrument(skip(self), fields(execution = %key))]
    pub async fn record_node_started(
        &self,
        key: &ExecutionKey,
        scheduled_event_id: i64,
        identity: &str,
        attempt: i32,
    ) -> Result<RecordOutcome> {
        let identity = identity.to_string();
        self.update(key, |tx| {
            tx.require_running()?;
            check_activity(tx, scheduled_event_id)?;
            tx.record(EventAttributes::NodeStarted(NodeStartedAttributes {
                scheduled_event_id,
                identity,
                attempt,
            }))
            .map(|_| ())
        })
        .await
    }

    /// A node finished. Schedules a workflow task if none is pending.
    #[instrument(skip(self, result), fields(execution = %key))]
    pub async fn record_node_completed(
        &self,
        key: &ExecutionKey,
        scheduled_event_id: i64,
        result: Vec<u8>,
    ) -> Result<RecordOutcome> {
        self.update(key, |tx| {
            tx.require_running()?;
            let started_event_id = check_activity(tx, scheduled_event_id)?.unwrap_or(0);
            tx.record(EventAttributes::NodeCompleted(NodeCompletedAttributes {
                scheduled_event_id,
                started_event_id,
                result,
            }))?;
            tx.schedule_workflow_task_if_idle().map(|_| ())
        })
        .await
    }

    /// A node failed. Schedules a workflow task if none is pending.
    #[instrument(skip(self, details), fields(execution = %key))]
    pub async fn record_node_failed(
        &self,
        key: &ExecutionKey,
        scheduled_event_id: i64,
        reason: &str,
        details: Vec<u8>,
        retryable: bool,
    ) -> Result<RecordOutcome> {
        let reason = reason.to_string();
        self.update(key, |tx| {
            tx.require_running()?;
            let started_event_id = check_activity(tx, scheduled_event_id)?.unwrap_or(0);
            tx.record(EventAttributes::NodeFailed(NodeFailedAttributes {
                scheduled_event_id,
                started_event_id,
                reason,
                details,
                retryable,
            }))?;
            tx.schedule_workflow_task_if_idle().map(|_| ())
        })
        .await
    }

    // ---- timers ----

    /// Start a durable timer due `fire_after` from now.
    ///
    /// Returns [`CoreError::TimerAlreadyExists`] if a timer with this ID is
    /// pending. The ID of a fired or canceled timer can be started again.
    #[instrument(skip(self), fields(execution = %key))]
    pub async fn start_timer(
        &self,
        key: &ExecutionKey,
        timer_id: &str,
        fire_after: Duration,
    ) -> Result<RecordOutcome> {
        let timer_id = timer_id.to_string();
        self.update(key, |tx| {
            tx.require_running()?;
            if timer_id.is_empty() || timer_id == EXECUTION_TIMEOUT_TIMER_ID {
                return Err(CoreError::ValidationError {
                    field: "timer_id".to_string(),
                    message: format!("invalid timer id '{}'", timer_id),
                });
            }
            if tx.state.pending_timers.contains_key(&timer_id) {
                return Err(CoreError::TimerAlreadyExists {
                    execution: tx.key().to_string(),
                    timer_id,
                });
            }
            let delay = TimeDelta::from_std(fire_after).map_err(|_| CoreError::ValidationError {
                field: "fire_after".to_string(),
                message: "out of range".to_string(),
            })?;
            let fire_time = tx.now + delay;
            tx.record(EventAttributes::TimerStarted(TimerStartedAttributes {
                timer_id: timer_id.clone(),
                fire_at_ms: fire_time.timestamp_millis(),
                start_to_fire_timeout_ms: delay.num_milliseconds(),
            }))?;
            tx.timers.push(TimerCommand::Create {
                timer_id,
                fire_time,
            });
            Ok(())
        })
        .await
    }

    /// A timer fired.
    ///
    /// Idempotent: a timer that is no longer pending, or an execution that
    /// is closed or gone, records nothing.
    #[instrument(skip(self), fields(execution = %key))]
    pub async fn record_timer_fired(
        &self,
        key: &ExecutionKey,
        timer_id: &str,
    ) -> Result<RecordOutcome> {
        let state = match self.store.get_mutable_state(key).await {
            Ok(state) => state,
            Err(CoreError::ExecutionNotFound { .. }) => {
                warn!(timer_id, "Timer fired for unknown execution");
                return Ok(RecordOutcome::default());
            }
            Err(e) => return Err(e),
        };
        if !state.is_running() {
            debug!(timer_id, status = %state.status(), "Timer fired for closed execution");
            return Ok(RecordOutcome {
                db_version: state.db_version,
                ..Default::default()
            });
        }

        let mut tx = self.begin(state);
        if timer_id == EXECUTION_TIMEOUT_TIMER_ID {
            let timeout_ms = tx.state.execution_info.execution_timeout_ms;
            Self::close(
                &mut tx,
                EventAttributes::ExecutionTimedOut(ExecutionTimedOutAttributes { timeout_ms }),
            )?;
            info!("Execution timed out");
        } else if let Some(timer) = tx.state.pending_timers.get(timer_id).cloned() {
            tx.record(EventAttributes::TimerFired(TimerFiredAttributes {
                timer_id: timer.timer_id,
                started_event_id: timer.started_event_id,
            }))?;
            tx.schedule_workflow_task_if_idle()?;
        } else {
            debug!(timer_id, "Timer no longer pending");
        }
        self.commit(tx).await
    }

    /// Cancel a pending timer.
    #[instrument(skip(self), fields(execution = %key))]
    pub async fn cancel_timer(
        &self,
        key: &ExecutionKey,
        timer_id: &str,
        identity: &str,
    ) -> Result<RecordOutcome> {
        let timer_id = timer_id.to_string();
        let identity = identity.to_string();
        self.update(key, |tx| {
            tx.require_running()?;
            let started_event_id = tx
                .state
                .pending_timers
                .get(&timer_id)
                .map(|t| t.started_event_id)
                .ok_or_else(|| CoreError::TimerNotFound {
                    execution: tx.key().to_string(),
                    timer_id: timer_id.clone(),
                })?;
            tx.record(EventAttributes::TimerCanceled(TimerCanceledAttributes {
                timer_id: timer_id.clone(),
                started_event_id,
                identity,
            }))?;
            tx.timers.push(TimerCommand::Cancel { timer_id });
            Ok(())
        })
        .await
    }

    // ---- signals, markers, children ----

    /// Deliver a signal.
    ///
    /// While a workflow task is started the signal is buffered (no event
    /// yet); otherwise it is appended and a workflow task is scheduled.
    #[instrument(skip(self, input), fields(execution = %key))]
    pub async fn record_signal_received(
        &self,
        key: &ExecutionKey,
        signal_name: &str,
        input: Vec<u8>,
        identity: &str,
    ) -> Result<RecordOutcome> {
        let signal_name = signal_name.to_string();
        let identity = identity.to_string();
        self.update(key, |tx| {
            tx.require_running()?;
            if tx.state.workflow_task_in_flight() {
                debug!(signal_name = %signal_name, "Signal buffered");
                tx.buffer_signal(BufferedSignal {
                    signal_name,
                    input,
                    identity,
                    received_at: tx.now,
                });
                return Ok(());
            }
            tx.record(EventAttributes::SignalReceived(SignalReceivedAttributes {
                signal_name,
                input,
                identity,
            }))?;
            tx.schedule_workflow_task_if_idle().map(|_| ())
        })
        .await
    }

    /// Record a marker (side-effect result, version marker, ...).
    #[instrument(skip(self, details), fields(execution = %key))]
    pub async fn record_marker(
        &self,
        key: &ExecutionKey,
        marker_name: &str,
        details: Vec<u8>,
    ) -> Result<RecordOutcome> {
        let marker_name = marker_name.to_string();
        self.update(key, |tx| {
            tx.require_running()?;
            tx.record(EventAttributes::MarkerRecorded(MarkerRecordedAttributes {
                marker_name,
                details,
            }))
            .map(|_| ())
        })
        .await
    }

    /// Initiate a child execution in the parent's namespace and start it.
    #[instrument(skip(self, request), fields(execution = %key, child = %request.workflow_id))]
    pub async fn initiate_child_execution(
        &self,
        key: &ExecutionKey,
        request: StartChildRequest,
    ) -> Result<RecordOutcome> {
        self.update(key, |tx| {
            tx.require_running()?;
            let child = ExecutionKey::new(&key.namespace_id, &request.workflow_id, &request.run_id);
            // The parent link is stored in display form and must parse back.
            if ExecutionKey::parse(&child.to_string()).as_ref() != Some(&child) {
                return Err(CoreError::ValidationError {
                    field: "workflow_id".to_string(),
                    message: format!("invalid child execution '{}'", child),
                });
            }
            let task_queue = if request.task_queue.is_empty() {
                tx.state.execution_info.task_queue.clone()
            } else {
                request.task_queue
            };
            tx.record(EventAttributes::ChildExecutionInitiated(
                ChildExecutionInitiatedAttributes {
                    namespace_id: child.namespace_id.clone(),
                    workflow_id: child.workflow_id.clone(),
                    run_id: child.run_id.clone(),
                    workflow_type: request.workflow_type.clone(),
                    input: request.input.clone(),
                },
            ))?;
            tx.follow_ups.push(FollowUp::StartChild {
                child,
                parent: key.clone(),
                workflow_type: request.workflow_type,
                task_queue,
                input: request.input,
            });
            Ok(())
        })
        .await
    }

    /// A child execution closed. Schedules a workflow task if none is pending.
    #[instrument(skip(self, result), fields(execution = %key))]
    pub async fn record_child_execution_closed(
        &self,
        key: &ExecutionKey,
        initiated_event_id: i64,
        status: &str,
        result: Vec<u8>,
    ) -> Result<RecordOutcome> {
        let status = status.to_string();
        self.update(key, |tx| {
            tx.require_running()?;
            if !tx
                .state
                .pending_child_executions
                .contains_key(&initiated_event_id)
            {
                return Err(CoreError::ValidationError {
                    field: "initiated_event_id".to_string(),
                    message: format!("no pending child initiated by event {}", initiated_event_id),
                });
            }
            tx.record(EventAttributes::ChildExecutionClosed(
                ChildExecutionClosedAttributes {
                    initiated_event_id,
                    status,
                    result,
                },
            ))?;
            tx.schedule_workflow_task_if_idle().map(|_| ())
        })
        .await
    }

    // ---- queries ----

    /// Current mutable state.
    pub async fn get_mutable_state(&self, key: &ExecutionKey) -> Result<MutableState> {
        self.store.get_mutable_state(key).await
    }

    /// Up to `page_size` events starting at `first_event_id`.
    pub async fn get_history_page(
        &self,
        key: &ExecutionKey,
        first_event_id: i64,
        page_size: usize,
    ) -> Result<HistoryPage> {
        if page_size == 0 || first_event_id < 1 {
            return Err(CoreError::ValidationError {
                field: "page_size".to_string(),
                message: "page_size and first_event_id must be positive".to_string(),
            });
        }
        let last = first_event_id.saturating_add(page_size as i64 - 1);
        let events = self.store.get_events(key, first_event_id, last).await?;
        let total = self.store.get_event_count(key).await?;
        let next_page_first_event_id = events
            .last()
            .map(|e| e.event_id + 1)
            .filter(|next| *next <= total);
        Ok(HistoryPage {
            events,
            next_page_first_event_id,
        })
    }

    /// Number of events recorded for an execution.
    pub async fn get_event_count(&self, key: &ExecutionKey) -> Result<i64> {
        self.store.get_event_count(key).await
    }

    /// Keys of running executions.
    pub async fn list_running_executions(&self) -> Result<Vec<ExecutionKey>> {
        self.store.list_running_executions().await
    }

    /// Replay the full log and overwrite the stored state with the result.
    ///
    /// Buffered signals are carried over; they are not part of the log.
    #[instrument(skip(self), fields(execution = %key))]
    pub async fn rebuild_mutable_state(&self, key: &ExecutionKey) -> Result<MutableState> {
        let events = self.store.get_events(key, 1, i64::MAX).await?;
        if events.is_empty() {
            return Err(CoreError::ExecutionNotFound {
                execution: key.to_string(),
            });
        }
        let mut rebuilt = MutableState::replay(key.clone(), &events)?;

        let expected_version = match self.store.get_mutable_state(key).await {
            Ok(stored) => {
                rebuilt.buffered_events = stored.buffered_events;
                stored.db_version
            }
            Err(CoreError::ExecutionNotFound { .. }) => 0,
            Err(e) => return Err(e),
        };
        rebuilt.db_version = self
            .store
            .update_mutable_state(key, &rebuilt, expected_version)
            .await?;

        info!(events = events.len(), db_version = rebuilt.db_version, "Mutable state rebuilt");
        Ok(rebuilt)
    }

    /// Tasks for the pending work of one execution.
    ///
    /// Covers every pending node and the workflow task unless a worker
    /// already started it. Used on startup: matching is in memory, so queued
    /// work of running executions must be re-dispatched.
    pub async fn pending_tasks(&self, key: &ExecutionKey) -> Result<Vec<AddTaskRequest>> {
        let state = self.store.get_mutable_state(key).await?;
        if !state.is_running() {
            return Ok(Vec::new());
        }

        let mut tasks = Vec::new();
        if let Some(task) = state
            .pending_workflow_task
            .as_ref()
            .filter(|t| t.started_event_id.is_none())
        {
            tasks.push(workflow_task_request(
                key,
                &task.task_queue,
                task.scheduled_event_id,
                self.workflow_task_timeout,
            ));
        }
        for activity in state.pending_activities.values() {
            let id = activity.scheduled_event_id;
            let input = self
                .store
                .get_events(key, id, id)
                .await?
                .into_iter()
                .find_map(|e| match e.attributes {
                    EventAttributes::NodeScheduled(a) => Some(a.input),
                    _ => None,
                })
                .unwrap_or_default();
            tasks.push(activity_task_request(
                key,
                &activity.task_queue,
                id,
                input,
                activity.priority,
                activity.start_to_close_timeout_ms,
            ));
        }
        Ok(tasks)
    }

    /// Timers history still waits for, with their fire times.
    ///
    /// Includes the execution timeout timer. Used on startup to put the
    /// timer store back in line with history.
    pub async fn pending_timers(
        &self,
        key: &ExecutionKey,
    ) -> Result<Vec<(String, DateTime<Utc>)>> {
        let state = self.store.get_mutable_state(key).await?;
        if !state.is_running() {
            return Ok(Vec::new());
        }

        let mut timers: Vec<(String, DateTime<Utc>)> = state
            .pending_timers
            .values()
            .map(|t| (t.timer_id.clone(), t.fire_time))
            .collect();
        let info = &state.execution_info;
        if let Some(start) = info.start_time.filter(|_| info.execution_timeout_ms > 0) {
            timers.push((
                EXECUTION_TIMEOUT_TIMER_ID.to_string(),
                start + TimeDelta::milliseconds(info.execution_timeout_ms),
            ));
        }
        Ok(timers)
    }
}

/// Validate the pending workflow task; returns its started event ID.
fn check_workflow_task(tx: &Transition, scheduled_event_id: i64) -> Result<Option<i64>> {
    match &tx.state.pending_workflow_task {
        Some(task) if task.scheduled_event_id == scheduled_event_id => Ok(task.started_event_id),
        _ => Err(CoreError::ValidationError {
            field: "scheduled_event_id".to_string(),
            message: format!(
                "no pending workflow task scheduled by event {}",
                scheduled_event_id
            ),
        }),
    }
}

/// Validate a pending node; returns its started event ID.
fn check_activity(tx: &Transition, scheduled_event_id: i64) -> Result<Option<i64>> {
    tx.state
        .pending_activities
        .get(&scheduled_event_id)
        .map(|a| a.started_event_id)
        .ok_or_else(|| CoreError::ValidationError {
            field: "scheduled_event_id".to_string(),
            message: format!("no pending node scheduled by event {}", scheduled_event_id),
        })
}

#[async_trait]
impl TimerFiredCallback for HistoryEngine {
    async fn record_timer_fired(
        &self,
        namespace_id: &str,
        workflow_id: &str,
        run_id: &str,
        timer_id: &str,
    ) -> Result<()> {
        let key = ExecutionKey::new(namespace_id, workflow_id, run_id);
        HistoryEngine::record_timer_fired(self, &key, timer_id)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests;
