// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scanner and processors firing due timers.
//!
//! ```text
//!  scanner ──(bounded mpsc)──► processor × N ──► TimerFiredCallback
//! ```
//!
//! The scanner polls owned shards every `scan_interval` and blocks on the
//! channel when processors fall behind. A processor re-reads the timer and
//! claims it with a version-checked write before calling back, so a timer is
//! reported by at most one processor at a time. A callback that keeps failing
//! rolls the claim back and the timer is picked up by a later scan.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::{
    Timer, TimerFiredCallback, TimerKey, TimerRegistry, TimerServiceConfig, TimerStatus,
    truncate_millis,
};
use crate::error::{CoreError, Result};
use crate::persistence::TimerStore;

/// What [`TimerService::process_timer`] did with a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    /// Claimed and reported.
    Fired,
    /// Already fired, canceled, not due or gone.
    Skipped,
    /// Claimed, but the callback failed; back to pending.
    RolledBack,
}

enum Lifecycle {
    Idle,
    Running {
        cancel: CancellationToken,
        handles: Vec<JoinHandle<()>>,
    },
    Stopped,
}

struct Inner {
    registry: TimerRegistry,
    callback: Arc<dyn TimerFiredCallback>,
    config: TimerServiceConfig,
    owned_shards: RwLock<HashSet<u32>>,
    /// Timers handed to processors and not yet finished.
    inflight: Mutex<HashSet<TimerKey>>,
}

/// Fires durable timers of the shards this instance owns.
pub struct TimerService {
    inner: Arc<Inner>,
    lifecycle: Mutex<Lifecycle>,
}

impl TimerService {
    /// Create a stopped service. `registry` decides the shard count.
    pub fn new(
        registry: TimerRegistry,
        callback: Arc<dyn TimerFiredCallback>,
        config: TimerServiceConfig,
    ) -> Self {
        let owned_shards = RwLock::new(config.owned_shards.clone());
        Self {
            inner: Arc::new(Inner {
                registry,
                callback,
                config,
                owned_shards,
                inflight: Mutex::new(HashSet::new()),
            }),
            lifecycle: Mutex::new(Lifecycle::Idle),
        }
    }

    /// Registry used for timer CRUD.
    pub fn registry(&self) -> &TimerRegistry {
        &self.inner.registry
    }

    /// Service configuration.
    pub fn config(&self) -> &TimerServiceConfig {
        &self.inner.config
    }

    /// Create a pending timer. See [`TimerRegistry::create_timer`].
    pub async fn create_timer(
        &self,
        namespace_id: &str,
        workflow_id: &str,
        run_id: &str,
        timer_id: &str,
        fire_time: DateTime<Utc>,
    ) -> Result<Timer> {
        self.inner
            .registry
            .create_timer(namespace_id, workflow_id, run_id, timer_id, fire_time)
            .await
    }

    /// Cancel a pending timer. See [`TimerRegistry::cancel_timer`].
    pub async fn cancel_timer(
        &self,
        namespace_id: &str,
        workflow_id: &str,
        run_id: &str,
        timer_id: &str,
    ) -> Result<bool> {
        self.inner
            .registry
            .cancel_timer(namespace_id, workflow_id, run_id, timer_id)
            .await
    }

    /// Look up a timer. See [`TimerRegistry::get_timer`].
    pub async fn get_timer(
        &self,
        namespace_id: &str,
        workflow_id: &str,
        run_id: &str,
        timer_id: &str,
    ) -> Result<Timer> {
        self.inner
            .registry
            .get_timer(namespace_id, workflow_id, run_id, timer_id)
            .await
    }

    /// Shard owning timers of `(namespace, workflow)`.
    pub fn shard_for(&self, namespace_id: &str, workflow_id: &str) -> u32 {
        self.inner.registry.shard_for(namespace_id, workflow_id)
    }

    /// Restrict scanning to `shards`. An empty set means all shards.
    pub fn set_owned_shards(&self, shards: HashSet<u32>) {
        info!(shards = ?shards, "Timer shard ownership changed");
        *self.inner.owned_shards.write() = shards;
    }

    /// Shards scanned by this instance, ascending.
    pub fn owned_shards(&self) -> Vec<u32> {
        self.inner.owned_shards()
    }

    /// Whether the background tasks are running.
    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock(), Lifecycle::Running { .. })
    }

    /// Spawn the scanner and processors.
    ///
    /// Starting a running service is a no-op. A stopped service cannot be
    /// restarted and returns [`CoreError::ServiceNotRunning`].
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Running { .. } => return Ok(()),
            Lifecycle::Stopped => {
                return Err(CoreError::ServiceNotRunning {
                    service: "timer service (stopped)".to_string(),
                });
            }
            Lifecycle::Idle => {}
        }

        let config = &self.inner.config;
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut handles = Vec::with_capacity(config.processor_concurrency + 1);
        handles.push(tokio::spawn(scan_loop(
            self.inner.clone(),
            tx,
            cancel.clone(),
        )));
        for worker in 0..config.processor_concurrency.max(1) {
            handles.push(tokio::spawn(process_loop(
                self.inner.clone(),
                rx.clone(),
                worker,
            )));
        }

        info!(
            num_shards = self.inner.registry.num_shards(),
            processors = config.processor_concurrency.max(1),
            scan_interval_ms = config.scan_interval.as_millis() as u64,
            "Timer service started"
        );
        *lifecycle = Lifecycle::Running { cancel, handles };
        Ok(())
    }

    /// Stop scanning, let processors drain queued timers, and wait for them.
    ///
    /// Returns [`CoreError::ServiceNotRunning`] if the service is not running.
    pub async fn stop(&self) -> Result<()> {
        let previous = {
            let mut lifecycle = self.lifecycle.lock();
            match *lifecycle {
                Lifecycle::Running { .. } => std::mem::replace(&mut *lifecycle, Lifecycle::Stopped),
                _ => {
                    return Err(CoreError::ServiceNotRunning {
                        service: "timer service".to_string(),
                    });
                }
            }
        };
        let Lifecycle::Running { cancel, handles } = previous else {
            return Ok(());
        };

        cancel.cancel();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Timer service task panicked");
            }
        }
        info!("Timer service stopped");
        Ok(())
    }

    /// Due pending timers of the owned shards, earliest first per shard.
    pub async fn scan_once(&self) -> Result<Vec<Timer>> {
        self.inner.scan(Utc::now()).await
    }

    /// Scan once and process every due timer inline. Returns how many fired.
    pub async fn fire_due_timers(&self) -> Result<usize> {
        let mut fired = 0;
        for timer in self.scan_once().await? {
            if self.process_timer(timer).await? == FireOutcome::Fired {
                fired += 1;
            }
        }
        Ok(fired)
    }

    /// Claim a timer, report it, and roll back if reporting keeps failing.
    pub async fn process_timer(&self, timer: Timer) -> Result<FireOutcome> {
        self.inner.process_timer(timer).await
    }
}

impl Inner {
    fn owned_shards(&self) -> Vec<u32> {
        let owned = self.owned_shards.read();
        let mut shards: Vec<u32> = if owned.is_empty() {
            (0..self.registry.num_shards()).collect()
        } else {
            owned.iter().copied().collect()
        };
        shards.sort_unstable();
        shards
    }

    async fn scan(&self, now: DateTime<Utc>) -> Result<Vec<Timer>> {
        let mut due = Vec::new();
        for shard_id in self.owned_shards() {
            let timers = self
                .registry
                .store()
                .get_due_timers(shard_id, now, self.config.batch_size)
                .await?;
            due.extend(timers);
        }
        Ok(due)
    }

    #[instrument(skip(self, scanned), fields(timer = %scanned.key(), shard_id = scanned.shard_id))]
    async fn process_timer(&self, scanned: Timer) -> Result<FireOutcome> {
        let now = Utc::now();
        // The scanned copy may be stale; claim against the current record.
        let Some(timer) = self.registry.store().get_timer(&scanned.key()).await? else {
            debug!("Timer gone");
            return Ok(FireOutcome::Skipped);
        };
        match timer.status {
            TimerStatus::Canceled => {
                debug!("Timer canceled");
                return Ok(FireOutcome::Skipped);
            }
            TimerStatus::Fired => {
                debug!(version = timer.version, "Timer already fired");
                return Ok(FireOutcome::Skipped);
            }
            TimerStatus::Pending if timer.fire_time > now => {
                debug!(fire_time = %timer.fire_time, "Timer not due yet");
                return Ok(FireOutcome::Skipped);
            }
            TimerStatus::Pending => {}
        }

        let delay = now - timer.fire_time;
        let max_delay = TimeDelta::from_std(self.config.max_fire_delay).unwrap_or(TimeDelta::MAX);
        if delay > max_delay {
            warn!(
                delay_ms = delay.num_milliseconds(),
                "Timer fired later than max_fire_delay"
            );
        }

        let expected = timer.version;
        let mut claimed = timer;
        claimed.status = TimerStatus::Fired;
        claimed.fired_at = Some(truncate_millis(now));
        claimed.version = expected + 1;
        match self.registry.store().update_timer(&claimed, expected).await {
            Ok(_) => {}
            Err(CoreError::OptimisticLockConflict { .. }) => {
                debug!("Timer claimed by another processor");
                return Ok(FireOutcome::Skipped);
            }
            Err(CoreError::TimerNotFound { .. }) => {
                debug!("Timer gone");
                return Ok(FireOutcome::Skipped);
            }
            Err(e) => return Err(e),
        }

        let attempts = self.config.callback_max_attempts.max(1);
        for attempt in 1..=attempts {
            let call = self.callback.record_timer_fired(
                &claimed.namespace_id,
                &claimed.workflow_id,
                &claimed.run_id,
                &claimed.timer_id,
            );
            match tokio::time::timeout(self.config.claim_lock_duration, call).await {
                Ok(Ok(())) => {
                    info!(attempt, "Timer fired");
                    return Ok(FireOutcome::Fired);
                }
                Ok(Err(e)) => warn!(attempt, error = %e, "Timer callback failed"),
                Err(_) => warn!(attempt, "Timer callback timed out"),
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.callback_backoff * attempt).await;
            }
        }

        let claimed_version = claimed.version;
        let mut rolled_back = claimed;
        rolled_back.status = TimerStatus::Pending;
        rolled_back.fired_at = None;
        rolled_back.version = claimed_version + 1;
        if let Err(e) = self
            .registry
            .store()
            .update_timer(&rolled_back, claimed_version)
            .await
        {
            error!(error = %e, "Failed to roll back timer claim");
            return Err(e);
        }
        warn!(attempts, "Timer claim rolled back");
        Ok(FireOutcome::RolledBack)
    }
}

async fn scan_loop(inner: Arc<Inner>, tx: mpsc::Sender<Timer>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(inner.config.scan_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let due = match inner.scan(Utc::now()).await {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "Timer scan failed");
                continue;
            }
        };

        let mut queued = 0;
        for timer in due {
            let key = timer.key();
            if !inner.inflight.lock().insert(key.clone()) {
                continue;
            }
            // Blocks while processors are saturated.
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                sent = tx.send(timer) => sent.is_ok(),
            };
            if !sent {
                inner.inflight.lock().remove(&key);
                debug!("Timer scanner stopping");
                return;
            }
            queued += 1;
        }
        if queued > 0 {
            debug!(queued, "Due timers queued");
        }
    }
    debug!("Timer scanner stopping");
}

async fn process_loop(
    inner: Arc<Inner>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Timer>>>,
    worker: usize,
) {
    loop {
        // Closed once the scanner exits and the queue is drained.
        let next = rx.lock().await.recv().await;
        let Some(timer) = next else { break };
        let key = timer.key();
        if let Err(e) = inner.process_timer(timer).await {
            error!(worker, timer = %key, error = %e, "Timer processing failed");
        }
        inner.inflight.lock().remove(&key);
    }
    debug!(worker, "Timer processor stopping");
}
