// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for kestrel-core E2E tests.
//!
//! Provides TestContext for setting up persistence and a running runtime.

#![allow(dead_code)]

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use kestrel_core::config::Config;
use kestrel_core::events::{EventAttributes, EventType, HistoryEvent};
use kestrel_core::history::{HistoryEngine, StartExecutionRequest};
use kestrel_core::matching::{MatchingEngine, Task};
use kestrel_core::persistence::{InMemoryPersistence, SqlitePersistence};
use kestrel_core::runtime::CoreRuntime;
use kestrel_core::state::ExecutionKey;

/// How long tests wait for background work.
pub const WAIT: Duration = Duration::from_secs(5);

/// Test context owning a running runtime and, for SQLite, its database file.
pub struct TestContext {
    pub runtime: CoreRuntime,
    pub db_path: Option<PathBuf>,
    _dir: Option<TempDir>,
}

impl TestContext {
    /// Runtime over in-memory persistence.
    pub async fn in_memory() -> Self {
        let runtime = start_runtime(Arc::new(InMemoryPersistence::new()), test_config()).await;
        Self {
            runtime,
            db_path: None,
            _dir: None,
        }
    }

    /// Runtime over a fresh SQLite file in a temporary directory.
    pub async fn sqlite() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("kestrel.db");
        let store = SqlitePersistence::from_path(&path)
            .await
            .expect("Failed to open SQLite database");
        let runtime = start_runtime(Arc::new(store), test_config()).await;
        Self {
            runtime,
            db_path: Some(path),
            _dir: Some(dir),
        }
    }

    pub fn history(&self) -> &HistoryEngine {
        self.runtime.history()
    }

    pub fn matching(&self) -> &MatchingEngine {
        self.runtime.matching()
    }

    /// Poll one task, failing the test if none arrives.
    pub async fn poll(&self, queue: &str, identity: &str) -> Task {
        self.matching()
            .poll_task("acme", queue, identity, Duration::from_secs(1))
            .await
            .expect("poll failed")
            .unwrap_or_else(|| panic!("no task on queue {}", queue))
    }

    /// Full history of an execution.
    pub async fn events(&self, key: &ExecutionKey) -> Vec<HistoryEvent> {
        let mut events = Vec::new();
        let mut next = Some(1);
        while let Some(first) = next {
            let page = self
                .history()
                .get_history_page(key, first, 100)
                .await
                .expect("history page");
            events.extend(page.events);
            next = page.next_page_first_event_id;
        }
        events
    }

    pub async fn shutdown(self) {
        self.runtime.shutdown().await.expect("shutdown failed");
    }
}

/// Fast scanning and short in-flight deadlines for tests.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.timer.scan_interval = Duration::from_millis(20);
    config.timer.callback_backoff = Duration::from_millis(5);
    config.matching.num_partitions = 4;
    config
}

pub async fn start_runtime<P>(persistence: Arc<P>, config: Config) -> CoreRuntime
where
    P: kestrel_core::persistence::Persistence + 'static,
{
    CoreRuntime::builder()
        .persistence(persistence)
        .config(config)
        .reaper_interval(Duration::from_millis(20))
        .build()
        .expect("Failed to build runtime")
        .start()
        .await
        .expect("Failed to start runtime")
}

pub fn key(workflow_id: &str) -> ExecutionKey {
    ExecutionKey::new("acme", workflow_id, "r-1")
}

pub fn start_request(task_queue: &str) -> StartExecutionRequest {
    StartExecutionRequest {
        workflow_type: "order".to_string(),
        task_queue: task_queue.to_string(),
        input: br#"{"order":42}"#.to_vec(),
        identity: "e2e".to_string(),
        ..Default::default()
    }
}

pub fn event_types(events: &[HistoryEvent]) -> Vec<EventType> {
    events.iter().map(|e| e.attributes.event_type()).collect()
}

pub fn count_of(events: &[HistoryEvent], event_type: EventType) -> usize {
    events
        .iter()
        .filter(|e| e.attributes.event_type() == event_type)
        .count()
}

pub fn timer_fired_ids(events: &[HistoryEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match &e.attributes {
            EventAttributes::TimerFired(a) => Some(a.timer_id.clone()),
            _ => None,
        })
        .collect()
}

/// Poll `check` until it returns true or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
