// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for kestrel-core.
//!
//! [`CoreRuntime`] wires the history engine, matching and the timer service
//! over one persistence backend and runs their background work inside an
//! existing tokio application.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use kestrel_core::config::Config;
//! use kestrel_core::persistence::SqlitePersistence;
//! use kestrel_core::runtime::CoreRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let persistence = Arc::new(SqlitePersistence::connect("sqlite:kestrel.db").await?);
//!
//!     let runtime = CoreRuntime::builder()
//!         .persistence(persistence)
//!         .config(Config::from_env()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... record events, poll tasks ...
//!
//!     // Graceful shutdown
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Startup
//!
//! Matching keeps queues in memory only. On start the runtime re-dispatches
//! pending nodes and unstarted workflow tasks of every running execution.
//! Task IDs derive from the scheduling event, so work that is still queued is
//! not duplicated.
//!
//! Timers are then checked against history. A timer history waits for that
//! is missing from the timer store is created again. One left fired or
//! canceled (a claim whose report never reached history) goes back to
//! pending. Reporting a timer twice records it once.
//!
//! # Expired tasks
//!
//! A reaper removes in-flight tasks whose start-to-close deadline passed.
//! An expired node is recorded as a retryable `NodeFailed`; an expired
//! workflow task goes back to its queue if history still waits for it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::CoreError;
use crate::history::HistoryEngine;
use crate::matching::{AddTaskRequest, MatchingEngine, Task, TaskType};
use crate::persistence::{ExecutionStore, Persistence, TimerStore};
use crate::timer::{TimerRegistry, TimerService};

/// Reason recorded for nodes whose in-flight deadline passed.
pub const START_TO_CLOSE_TIMEOUT_REASON: &str = "start_to_close timeout";

struct Backend {
    persistence: Arc<dyn Persistence>,
    executions: Arc<dyn ExecutionStore>,
    timers: Arc<dyn TimerStore>,
}

/// Builder for creating a [`CoreRuntime`].
pub struct CoreRuntimeBuilder {
    backend: Option<Backend>,
    config: Config,
    reaper_interval: Duration,
}

impl std::fmt::Debug for CoreRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreRuntimeBuilder")
            .field("persistence", &self.backend.as_ref().map(|_| "..."))
            .field("config", &self.config)
            .field("reaper_interval", &self.reaper_interval)
            .finish()
    }
}

impl Default for CoreRuntimeBuilder {
    fn default() -> Self {
        Self {
            backend: None,
            config: Config::default(),
            reaper_interval: Duration::from_secs(1),
        }
    }
}

impl CoreRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence layer (required).
    pub fn persistence<P: Persistence + 'static>(mut self, persistence: Arc<P>) -> Self {
        self.backend = Some(Backend {
            persistence: persistence.clone(),
            executions: persistence.clone(),
            timers: persistence,
        });
        self
    }

    /// Set matching and timer settings.
    ///
    /// Default: [`Config::default`]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// How often expired in-flight tasks are reaped.
    ///
    /// Default: 1s
    pub fn reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<CoreRuntimeConfig> {
        let backend = self
            .backend
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        if self.reaper_interval.is_zero() {
            anyhow::bail!("reaper_interval must be positive");
        }

        Ok(CoreRuntimeConfig {
            backend,
            config: self.config,
            reaper_interval: self.reaper_interval,
        })
    }
}

/// Configuration for a [`CoreRuntime`].
pub struct CoreRuntimeConfig {
    backend: Backend,
    config: Config,
    reaper_interval: Duration,
}

impl std::fmt::Debug for CoreRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreRuntimeConfig")
            .field("persistence", &"...")
            .field("config", &self.config)
            .field("reaper_interval", &self.reaper_interval)
            .finish()
    }
}

impl CoreRuntimeConfig {
    /// Wire the services, recover dispatch state and spawn background tasks.
    pub async fn start(self) -> Result<CoreRuntime> {
        let Backend {
            persistence,
            executions,
            timers,
        } = self.backend;

        let matching = Arc::new(MatchingEngine::new(self.config.matching.clone()));
        let registry = TimerRegistry::new(timers, self.config.timer.num_shards);
        let history = Arc::new(
            HistoryEngine::new(executions)
                .with_dispatcher(matching.clone())
                .with_timer_scheduler(Arc::new(registry.clone())),
        );
        let timer_service = Arc::new(TimerService::new(
            registry,
            history.clone(),
            self.config.timer.clone(),
        ));

        let recovered = recover_dispatch_state(&history, &matching).await?;
        let restored_timers = recover_timers(&history, timer_service.registry()).await?;
        timer_service.start()?;

        let shutdown = CancellationToken::new();
        let reaper_handle = tokio::spawn(run_task_reaper(
            history.clone(),
            matching.clone(),
            self.reaper_interval,
            shutdown.clone(),
        ));

        info!(
            partitions = self.config.matching.num_partitions,
            timer_shards = self.config.timer.num_shards,
            recovered_tasks = recovered,
            restored_timers,
            "CoreRuntime started"
        );

        Ok(CoreRuntime {
            persistence,
            history,
            matching,
            timers: timer_service,
            shutdown,
            reaper_handle,
        })
    }
}

/// A running kestrel-core instance that can be embedded in an application.
///
/// The runtime manages:
/// - the history engine (event log and mutable state)
/// - matching (task queues, polling, in-flight deadlines)
/// - the timer service (scanner and processors)
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct CoreRuntime {
    persistence: Arc<dyn Persistence>,
    history: Arc<HistoryEngine>,
    matching: Arc<MatchingEngine>,
    timers: Arc<TimerService>,
    shutdown: CancellationToken,
    reaper_handle: JoinHandle<()>,
}

impl CoreRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> CoreRuntimeBuilder {
        CoreRuntimeBuilder::new()
    }

    /// History engine.
    pub fn history(&self) -> &Arc<HistoryEngine> {
        &self.history
    }

    /// Matching engine.
    pub fn matching(&self) -> &Arc<MatchingEngine> {
        &self.matching
    }

    /// Timer service.
    pub fn timers(&self) -> &Arc<TimerService> {
        &self.timers
    }

    /// Get a reference to the persistence layer.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.reaper_handle.is_finished() && self.timers.is_running()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops the reaper, drains the timer service and releases waiting
    /// pollers.
    pub async fn shutdown(self) -> Result<()> {
        info!("CoreRuntime shutting down...");

        self.shutdown.cancel();
        if let Err(e) = self.reaper_handle.await {
            error!("Task reaper panicked: {}", e);
        }

        match self.timers.stop().await {
            Ok(()) | Err(CoreError::ServiceNotRunning { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        self.matching.shutdown();

        info!("CoreRuntime shutdown complete");
        Ok(())
    }
}

/// Re-dispatch pending work of running executions. Returns how many tasks
/// were queued.
async fn recover_dispatch_state(
    history: &HistoryEngine,
    matching: &MatchingEngine,
) -> Result<usize> {
    let mut queued = 0;
    for key in history.list_running_executions().await? {
        for request in history.pending_tasks(&key).await? {
            match matching.add_task_with_options(request) {
                Ok(_) => queued += 1,
                Err(CoreError::TaskExists { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(queued)
}

/// Put timers history waits for back in the timer store. Returns how many
/// were created or reset to pending.
async fn recover_timers(history: &HistoryEngine, registry: &TimerRegistry) -> Result<usize> {
    let mut restored = 0;
    for key in history.list_running_executions().await? {
        for (timer_id, fire_time) in history.pending_timers(&key).await? {
            if registry.restore_timer(&key, &timer_id, fire_time).await? {
                restored += 1;
            }
        }
    }
    Ok(restored)
}

async fn run_task_reaper(
    history: Arc<HistoryEngine>,
    matching: Arc<MatchingEngine>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                debug!("Task reaper received shutdown signal");
                break;
            }

            _ = ticker.tick() => {
                for task in matching.reap_expired_tasks(Utc::now()) {
                    handle_expired_task(&history, &matching, task).await;
                }
            }
        }
    }
}

async fn handle_expired_task(history: &HistoryEngine, matching: &MatchingEngine, task: Task) {
    match task.task_type {
        TaskType::Activity => {
            let Some(execution) = task.execution.as_ref() else {
                debug!(task_id = %task.task_id, "Expired task has no execution");
                return;
            };
            match history
                .record_node_failed(
                    execution,
                    task.scheduled_event_id,
                    START_TO_CLOSE_TIMEOUT_REASON,
                    Vec::new(),
                    true,
                )
                .await
            {
                Ok(_) => info!(
                    execution = %execution,
                    scheduled_event_id = task.scheduled_event_id,
                    "Expired node recorded as failed"
                ),
                // Completed or closed meanwhile.
                Err(CoreError::ValidationError { .. } | CoreError::InvalidExecutionState { .. }) => {
                    debug!(execution = %execution, "Expired node no longer pending")
                }
                Err(e) => warn!(
                    execution = %execution,
                    error = %e,
                    "Failed to record expired node"
                ),
            }
        }
        TaskType::Workflow => {
            let Some(execution) = task.execution.as_ref() else {
                debug!(task_id = %task.task_id, "Expired task has no execution");
                return;
            };
            let pending = match history.get_mutable_state(execution).await {
                Ok(state) => {
                    state.is_running()
                        && state
                            .pending_workflow_task
                            .is_some_and(|t| t.scheduled_event_id == task.scheduled_event_id)
                }
                Err(CoreError::ExecutionNotFound { .. }) => false,
                Err(e) => {
                    // Keep the task when history cannot be read.
                    warn!(
                        execution = %execution,
                        error = %e,
                        "Failed to check expired workflow task"
                    );
                    true
                }
            };
            if !pending {
                debug!(
                    execution = %execution,
                    scheduled_event_id = task.scheduled_event_id,
                    "Expired workflow task no longer pending"
                );
                return;
            }
            let request = AddTaskRequest {
                task_id: Some(task.task_id),
                namespace_id: task.namespace_id,
                task_queue: task.task_queue,
                task_type: task.task_type,
                execution: task.execution,
                scheduled_event_id: task.scheduled_event_id,
                payload: task.payload,
                priority: task.priority,
                start_to_close_timeout: task.start_to_close_timeout,
            };
            match matching.add_task_with_options(request) {
                Ok(task_id) => info!(task_id = %task_id, "Expired workflow task re-dispatched"),
                Err(e) => warn!(error = %e, "Failed to re-dispatch expired workflow task"),
            }
        }
    }
}
