// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Timer service tests against SQLite with several services sharing one store.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use common::{WAIT, wait_until};
use kestrel_core::error::{CoreError, Result};
use kestrel_core::persistence::{SqlitePersistence, TimerStore};
use kestrel_core::timer::{
    FireOutcome, TimerFiredCallback, TimerKey, TimerRegistry, TimerService, TimerServiceConfig,
    TimerStatus,
};

/// Counts fires per timer and optionally fails the first calls.
#[derive(Default)]
struct CountingCallback {
    fired: Mutex<HashMap<String, u32>>,
    failures_left: AtomicU32,
}

impl CountingCallback {
    fn failing(times: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(times),
            ..Default::default()
        }
    }

    fn count(&self, timer_id: &str) -> u32 {
        self.fired.lock().get(timer_id).copied().unwrap_or(0)
    }

    fn total(&self) -> u32 {
        self.fired.lock().values().sum()
    }
}

#[async_trait]
impl TimerFiredCallback for CountingCallback {
    async fn record_timer_fired(
        &self,
        _namespace_id: &str,
        _workflow_id: &str,
        _run_id: &str,
        timer_id: &str,
    ) -> Result<()> {
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(CoreError::DatabaseError {
                operation: "record_timer_fired".to_string(),
                details: "history unavailable".to_string(),
            });
        }
        *self.fired.lock().entry(timer_id.to_string()).or_default() += 1;
        Ok(())
    }
}

fn config() -> TimerServiceConfig {
    TimerServiceConfig {
        num_shards: 4,
        scan_interval: Duration::from_millis(20),
        callback_max_attempts: 2,
        callback_backoff: Duration::from_millis(5),
        ..Default::default()
    }
}

async fn open_store(dir: &tempfile::TempDir) -> Arc<SqlitePersistence> {
    let store = SqlitePersistence::from_path(dir.path().join("timers.db"))
        .await
        .expect("open store");
    Arc::new(store)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_services_fire_each_timer_exactly_once() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = open_store(&dir).await;
    let registry = TimerRegistry::new(store.clone(), 4);
    let callback = Arc::new(CountingCallback::default());

    let services: Vec<TimerService> = (0..2)
        .map(|_| TimerService::new(registry.clone(), callback.clone(), config()))
        .collect();

    let now = Utc::now();
    let creates = (0..20).map(|i| {
        let registry = registry.clone();
        async move {
            registry
                .create_timer(
                    "acme",
                    &format!("wf-{}", i % 5),
                    "r-1",
                    &format!("t-{}", i),
                    now + chrono::Duration::milliseconds(50),
                )
                .await
        }
    });
    for result in futures::future::join_all(creates).await {
        result.expect("create timer");
    }

    for service in &services {
        service.start().expect("start");
    }

    let all_fired = wait_until(WAIT, || async { callback.total() >= 20 }).await;
    assert!(all_fired, "only {} timers fired", callback.total());
    tokio::time::sleep(Duration::from_millis(150)).await;

    for i in 0..20 {
        assert_eq!(callback.count(&format!("t-{}", i)), 1, "timer t-{}", i);
        let key = TimerKey::new("acme", format!("wf-{}", i % 5), "r-1", format!("t-{}", i));
        let timer = store.get_timer(&key).await.expect("get").expect("exists");
        assert_eq!(timer.status, TimerStatus::Fired);
        assert!(timer.fired_at.is_some());
    }

    for service in &services {
        service.stop().await.expect("stop");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rolled_back_timer_is_fired_by_running_service() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = open_store(&dir).await;
    let registry = TimerRegistry::new(store.clone(), 4);
    // Two attempts per processing; the first processing rolls back
    let callback = Arc::new(CountingCallback::failing(2));
    let service = TimerService::new(registry.clone(), callback.clone(), config());

    let timer = registry
        .create_timer("acme", "wf-1", "r-1", "retry", Utc::now())
        .await
        .expect("create");

    assert_eq!(
        service.process_timer(timer.clone()).await.expect("process"),
        FireOutcome::RolledBack
    );
    let current = store
        .get_timer(&timer.key())
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(current.status, TimerStatus::Pending);
    assert_eq!(callback.count("retry"), 0);

    service.start().expect("start");
    let fired = wait_until(WAIT, || async { callback.count("retry") == 1 }).await;
    assert!(fired, "rolled back timer was not picked up again");
    service.stop().await.expect("stop");

    let current = store
        .get_timer(&timer.key())
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(current.status, TimerStatus::Fired);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_canceled_timer_never_fires() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = open_store(&dir).await;
    let registry = TimerRegistry::new(store.clone(), 4);
    let callback = Arc::new(CountingCallback::default());
    let service = TimerService::new(registry.clone(), callback.clone(), config());

    let fire_time = Utc::now() + chrono::Duration::milliseconds(100);
    service
        .create_timer("acme", "wf-1", "r-1", "keep", fire_time)
        .await
        .expect("create");
    service
        .create_timer("acme", "wf-1", "r-1", "drop", fire_time)
        .await
        .expect("create");
    assert!(
        service
            .cancel_timer("acme", "wf-1", "r-1", "drop")
            .await
            .expect("cancel")
    );

    service.start().expect("start");
    let fired = wait_until(WAIT, || async { callback.count("keep") == 1 }).await;
    assert!(fired);
    tokio::time::sleep(Duration::from_millis(100)).await;
    service.stop().await.expect("stop");

    assert_eq!(callback.count("drop"), 0);
    let dropped = service
        .get_timer("acme", "wf-1", "r-1", "drop")
        .await
        .expect("get");
    assert_eq!(dropped.status, TimerStatus::Canceled);
}
