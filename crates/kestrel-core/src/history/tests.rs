// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use super::*;
use crate::events::EventType;
use crate::matching::{MatchingConfig, MatchingEngine, TaskType};
use crate::persistence::{InMemoryPersistence, TimerStore};
use crate::state::ExecutionStatus;
use crate::timer::TimerStatus;

struct Harness {
    engine: Arc<HistoryEngine>,
    matching: Arc<MatchingEngine>,
    registry: Arc<TimerRegistry>,
    store: Arc<InMemoryPersistence>,
}

fn harness() -> Harness {
    let store = Arc::new(InMemoryPersistence::new());
    let matching = Arc::new(MatchingEngine::new(MatchingConfig::default()));
    let registry = Arc::new(TimerRegistry::new(store.clone(), 16));
    let engine = Arc::new(
        HistoryEngine::new(store.clone())
            .with_dispatcher(matching.clone())
            .with_timer_scheduler(registry.clone()),
    );
    Harness {
        engine,
        matching,
        registry,
        store,
    }
}

fn key() -> ExecutionKey {
    ExecutionKey::new("acme", "wf-1", "r-1")
}

fn start_request() -> StartExecutionRequest {
    StartExecutionRequest {
        workflow_type: "order".to_string(),
        task_queue: "orders".to_string(),
        input: b"{}".to_vec(),
        identity: "test".to_string(),
        ..Default::default()
    }
}

fn event_types(events: &[HistoryEvent]) -> Vec<EventType> {
    events.iter().map(|e| e.attributes.event_type()).collect()
}

async fn all_events(h: &Harness, key: &ExecutionKey) -> Vec<HistoryEvent> {
    h.engine.store().get_events(key, 1, i64::MAX).await.unwrap()
}

/// Start and pick up the first workflow task.
async fn started_with_task_in_flight(h: &Harness) -> i64 {
    h.engine.start_execution(&key(), start_request()).await.unwrap();
    h.engine
        .record_workflow_task_started(&key(), 2, "worker-1")
        .await
        .unwrap();
    2
}

#[tokio::test]
async fn test_start_execution_records_started_and_workflow_task() {
    let h = harness();
    let outcome = h.engine.start_execution(&key(), start_request()).await.unwrap();

    assert_eq!(outcome.event_ids(), vec![1, 2]);
    assert_eq!(
        event_types(&outcome.events),
        vec![EventType::ExecutionStarted, EventType::WorkflowTaskScheduled]
    );
    assert_eq!(outcome.db_version, 1);

    let state = h.engine.get_mutable_state(&key()).await.unwrap();
    assert_eq!(state.status(), ExecutionStatus::Running);
    assert_eq!(state.next_event_id, 3);
    assert_eq!(state.pending_workflow_task.as_ref().unwrap().scheduled_event_id, 2);

    assert_eq!(h.matching.queue_depth("acme", "orders"), 1);
    let task = h
        .matching
        .poll_task("acme", "orders", "worker-1", Duration::from_millis(10))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.task_type, TaskType::Workflow);
    assert_eq!(task.execution, Some(key()));
    assert_eq!(task.scheduled_event_id, 2);
}

#[tokio::test]
async fn test_start_execution_twice_fails() {
    let h = harness();
    h.engine.start_execution(&key(), start_request()).await.unwrap();

    let err = h
        .engine
        .start_execution(&key(), start_request())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ExecutionAlreadyExists { .. }));
    assert_eq!(h.engine.get_event_count(&key()).await.unwrap(), 2);
}

#[tokio::test]
async fn test_start_execution_requires_task_queue() {
    let h = harness();
    let mut request = start_request();
    request.task_queue.clear();
    let err = h.engine.start_execution(&key(), request).await.unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_node_lifecycle_schedules_next_workflow_task() {
    let h = harness();
    started_with_task_in_flight(&h).await;

    let outcome = h
        .engine
        .schedule_node(
            &key(),
            ScheduleNodeRequest {
                node_id: "charge".to_string(),
                node_type: "http".to_string(),
                input: b"amount=10".to_vec(),
                priority: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let node_event = outcome.event_ids()[0];
    assert_eq!(node_event, 4);
    assert_eq!(outcome.tasks.len(), 1);
    assert_eq!(outcome.tasks[0].task_queue, "orders");
    assert_eq!(outcome.tasks[0].priority, Some(1));

    h.engine
        .record_workflow_task_completed(&key(), 2, "worker-1")
        .await
        .unwrap();
    h.engine
        .record_node_started(&key(), node_event, "worker-2", 1)
        .await
        .unwrap();
    let outcome = h
        .engine
        .record_node_completed(&key(), node_event, b"ok".to_vec())
        .await
        .unwrap();
    assert_eq!(
        event_types(&outcome.events),
        vec![EventType::NodeCompleted, EventType::WorkflowTaskScheduled]
    );
    match &outcome.events[0].attributes {
        EventAttributes::NodeCompleted(a) => assert_eq!(a.started_event_id, 6),
        other => panic!("unexpected attributes: {:?}", other.event_type()),
    }

    let state = h.engine.get_mutable_state(&key()).await.unwrap();
    assert!(state.pending_activities.is_empty());
    assert!(state.pending_workflow_task.is_some());
}

#[tokio::test]
async fn test_node_completion_for_unknown_node_is_rejected() {
    let h = harness();
    h.engine.start_execution(&key(), start_request()).await.unwrap();
    let err = h
        .engine
        .record_node_completed(&key(), 42, vec![])
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION_ERROR");
    assert_eq!(h.engine.get_event_count(&key()).await.unwrap(), 2);
}

#[tokio::test]
async fn test_node_failure_without_start_records_zero_started_id() {
    let h = harness();
    h.engine.start_execution(&key(), start_request()).await.unwrap();
    let scheduled = h
        .engine
        .schedule_node(
            &key(),
            ScheduleNodeRequest {
                node_id: "a".to_string(),
                node_type: "http".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .event_ids()[0];

    let outcome = h
        .engine
        .record_node_failed(&key(), scheduled, "start_to_close timeout", vec![], true)
        .await
        .unwrap();
    match &outcome.events[0].attributes {
        EventAttributes::NodeFailed(a) => {
            assert_eq!(a.started_event_id, 0);
            assert!(a.retryable);
        }
        other => panic!("unexpected attributes: {:?}", other.event_type()),
    }
    // A workflow task was already pending, so none is added.
    assert_eq!(outcome.events.len(), 1);
}

#[tokio::test]
async fn test_signal_is_buffered_while_workflow_task_in_flight() {
    let h = harness();
    started_with_task_in_flight(&h).await;

    let outcome = h
        .engine
        .record_signal_received(&key(), "approve", b"yes".to_vec(), "ops")
        .await
        .unwrap();
    assert!(outcome.events.is_empty());
    assert_eq!(h.engine.get_event_count(&key()).await.unwrap(), 3);
    let state = h.engine.get_mutable_state(&key()).await.unwrap();
    assert_eq!(state.buffered_events.len(), 1);

    let outcome = h
        .engine
        .record_workflow_task_completed(&key(), 2, "worker-1")
        .await
        .unwrap();
    assert_eq!(
        event_types(&outcome.events),
        vec![
            EventType::WorkflowTaskCompleted,
            EventType::SignalReceived,
            EventType::WorkflowTaskScheduled,
        ]
    );
    let state = h.engine.get_mutable_state(&key()).await.unwrap();
    assert!(state.buffered_events.is_empty());
    assert_eq!(state.execution_info.signal_count, 1);
}

#[tokio::test]
async fn test_signal_without_workflow_task_in_flight_is_recorded() {
    let h = harness();
    h.engine.start_execution(&key(), start_request()).await.unwrap();

    let outcome = h
        .engine
        .record_signal_received(&key(), "approve", vec![], "ops")
        .await
        .unwrap();
    // The scheduled (not started) workflow task will observe it.
    assert_eq!(event_types(&outcome.events), vec![EventType::SignalReceived]);
}

#[tokio::test]
async fn test_timer_start_fire_and_idempotent_refire() {
    let h = harness();
    h.engine.start_execution(&key(), start_request()).await.unwrap();

    let outcome = h
        .engine
        .start_timer(&key(), "t-1", Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(event_types(&outcome.events), vec![EventType::TimerStarted]);
    assert!(matches!(&outcome.timers[..], [TimerCommand::Create { timer_id, .. }] if timer_id == "t-1"));

    let timer = h.registry.get_timer("acme", "wf-1", "r-1", "t-1").await.unwrap();
    assert_eq!(timer.status, TimerStatus::Pending);
    assert!(timer.fire_time > Utc::now());

    let err = h
        .engine
        .start_timer(&key(), "t-1", Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::TimerAlreadyExists { .. }));

    let fired = h.engine.record_timer_fired(&key(), "t-1").await.unwrap();
    assert_eq!(event_types(&fired.events), vec![EventType::TimerFired]);

    let again = h.engine.record_timer_fired(&key(), "t-1").await.unwrap();
    assert!(again.is_noop());
    assert_eq!(h.engine.get_event_count(&key()).await.unwrap(), 4);
}

#[tokio::test]
async fn test_cancel_timer() {
    let h = harness();
    h.engine.start_execution(&key(), start_request()).await.unwrap();

    let err = h
        .engine
        .cancel_timer(&key(), "missing", "ops")
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::TimerNotFound { .. }));

    h.engine
        .start_timer(&key(), "t-1", Duration::from_secs(60))
        .await
        .unwrap();
    let outcome = h.engine.cancel_timer(&key(), "t-1", "ops").await.unwrap();
    assert_eq!(event_types(&outcome.events), vec![EventType::TimerCanceled]);

    let timer = h.registry.get_timer("acme", "wf-1", "r-1", "t-1").await.unwrap();
    assert_eq!(timer.status, TimerStatus::Canceled);
}

#[tokio::test]
async fn test_timer_id_can_be_started_again_after_cancel_or_fire() {
    let h = harness();
    h.engine.start_execution(&key(), start_request()).await.unwrap();

    h.engine
        .start_timer(&key(), "t-1", Duration::from_secs(60))
        .await
        .unwrap();
    h.engine.cancel_timer(&key(), "t-1", "ops").await.unwrap();
    h.engine
        .start_timer(&key(), "t-1", Duration::from_secs(1))
        .await
        .unwrap();

    let timer = h.registry.get_timer("acme", "wf-1", "r-1", "t-1").await.unwrap();
    assert_eq!(timer.status, TimerStatus::Pending);
    assert_eq!(timer.version, 3);
    assert!(timer.fire_time <= Utc::now() + chrono::TimeDelta::seconds(1));

    // Claimed and reported, then started once more.
    let mut claimed = timer.clone();
    claimed.status = TimerStatus::Fired;
    claimed.fired_at = Some(Utc::now());
    h.store.update_timer(&claimed, 3).await.unwrap();
    h.engine.record_timer_fired(&key(), "t-1").await.unwrap();
    h.engine
        .start_timer(&key(), "t-1", Duration::from_secs(5))
        .await
        .unwrap();

    let timer = h.registry.get_timer("acme", "wf-1", "r-1", "t-1").await.unwrap();
    assert_eq!(timer.status, TimerStatus::Pending);
    assert!(timer.fired_at.is_none());
    let state = h.engine.get_mutable_state(&key()).await.unwrap();
    assert!(state.pending_timers.contains_key("t-1"));
}

#[tokio::test]
async fn test_timer_fired_for_unknown_execution_is_noop() {
    let h = harness();
    let outcome = h
        .engine
        .record_timer_fired(&ExecutionKey::new("acme", "ghost", "r-1"), "t-1")
        .await
        .unwrap();
    assert!(outcome.is_noop());
}

#[tokio::test]
async fn test_closed_execution_rejects_records_and_cancels_timers() {
    let h = harness();
    h.engine.start_execution(&key(), start_request()).await.unwrap();
    h.engine
        .start_timer(&key(), "t-1", Duration::from_secs(60))
        .await
        .unwrap();

    let outcome = h
        .engine
        .complete_execution(&key(), b"done".to_vec())
        .await
        .unwrap();
    assert_eq!(event_types(&outcome.events), vec![EventType::ExecutionCompleted]);
    assert_eq!(outcome.timers, vec![TimerCommand::CancelAll]);

    // Canceled on close, then dropped with the closed execution.
    assert!(h.store.list_timers_for_execution(&key()).await.unwrap().is_empty());

    let err = h
        .engine
        .record_marker(&key(), "late", vec![])
        .await
        .unwrap_err();
    match err {
        CoreError::InvalidExecutionState { actual, .. } => assert_eq!(actual, "completed"),
        other => panic!("unexpected error: {}", other),
    }
    let err = h
        .engine
        .terminate_execution(&key(), "again", "ops")
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidExecutionState { .. }));

    // Firing after close changes nothing.
    let fired = h.engine.record_timer_fired(&key(), "t-1").await.unwrap();
    assert!(fired.is_noop());
    assert!(h.engine.list_running_executions().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_execution_timeout_timer_times_out_execution() {
    let h = harness();
    let mut request = start_request();
    request.execution_timeout = Some(Duration::from_secs(30));
    let outcome = h.engine.start_execution(&key(), request).await.unwrap();
    assert!(matches!(
        &outcome.timers[..],
        [TimerCommand::Create { timer_id, .. }] if timer_id == EXECUTION_TIMEOUT_TIMER_ID
    ));

    let timers = h.store.list_timers_for_execution(&key()).await.unwrap();
    assert_eq!(timers.len(), 1);

    let outcome = h
        .engine
        .record_timer_fired(&key(), EXECUTION_TIMEOUT_TIMER_ID)
        .await
        .unwrap();
    assert_eq!(event_types(&outcome.events), vec![EventType::ExecutionTimedOut]);
    let state = h.engine.get_mutable_state(&key()).await.unwrap();
    assert_eq!(state.status(), ExecutionStatus::TimedOut);
    assert_eq!(state.execution_info.execution_timeout_ms, 30_000);
}

#[tokio::test]
async fn test_terminal_operations_set_status() {
    let cases: Vec<(&str, ExecutionStatus)> = vec![
        ("fail", ExecutionStatus::Failed),
        ("terminate", ExecutionStatus::Terminated),
        ("time_out", ExecutionStatus::TimedOut),
    ];
    for (op, expected) in cases {
        let h = harness();
        h.engine.start_execution(&key(), start_request()).await.unwrap();
        match op {
            "fail" => h.engine.fail_execution(&key(), "boom", vec![]).await,
            "terminate" => h.engine.terminate_execution(&key(), "stop", "ops").await,
            _ => h.engine.time_out_execution(&key()).await,
        }
        .unwrap();
        let state = h.engine.get_mutable_state(&key()).await.unwrap();
        assert_eq!(state.status(), expected, "{}", op);
        assert!(state.pending_workflow_task.is_none());
    }
}

#[tokio::test]
async fn test_schedule_workflow_task_is_noop_when_pending() {
    let h = harness();
    h.engine.start_execution(&key(), start_request()).await.unwrap();
    let outcome = h.engine.schedule_workflow_task(&key()).await.unwrap();
    assert!(outcome.is_noop());
    assert_eq!(outcome.db_version, 1);
}

#[tokio::test]
async fn test_workflow_task_must_match_pending() {
    let h = harness();
    h.engine.start_execution(&key(), start_request()).await.unwrap();

    let err = h
        .engine
        .record_workflow_task_started(&key(), 7, "worker-1")
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION_ERROR");

    // Completing a task that was never started is refused too.
    let err = h
        .engine
        .record_workflow_task_completed(&key(), 2, "worker-1")
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION_ERROR");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_records_never_corrupt_history() {
    let h = harness();
    h.engine.start_execution(&key(), start_request()).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = h.engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .record_marker(&key(), &format!("m-{}", i), vec![])
                .await
        }));
    }

    let mut committed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => committed += 1,
            Err(e) => assert!(matches!(e, CoreError::OptimisticLockConflict { .. })),
        }
    }
    assert!(committed >= 1);

    let events = all_events(&h, &key()).await;
    assert_eq!(events.len(), 2 + committed);
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.event_id, i as i64 + 1);
    }
    let state = h.engine.get_mutable_state(&key()).await.unwrap();
    assert_eq!(state.next_event_id, events.len() as i64 + 1);
}

#[tokio::test]
async fn test_history_paging() {
    let h = harness();
    h.engine.start_execution(&key(), start_request()).await.unwrap();
    for i in 0..5 {
        h.engine
            .record_marker(&key(), &format!("m-{}", i), vec![])
            .await
            .unwrap();
    }

    let first = h.engine.get_history_page(&key(), 1, 3).await.unwrap();
    assert_eq!(first.events.len(), 3);
    assert_eq!(first.next_page_first_event_id, Some(4));

    let last = h.engine.get_history_page(&key(), 4, 10).await.unwrap();
    assert_eq!(last.events.len(), 4);
    assert_eq!(last.next_page_first_event_id, None);

    let exact = h.engine.get_history_page(&key(), 5, 3).await.unwrap();
    assert_eq!(exact.events.last().unwrap().event_id, 7);
    assert_eq!(exact.next_page_first_event_id, None);

    let err = h.engine.get_history_page(&key(), 1, 0).await.unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_rebuild_mutable_state_matches_incremental() {
    let h = harness();
    started_with_task_in_flight(&h).await;
    h.engine
        .schedule_node(
            &key(),
            ScheduleNodeRequest {
                node_id: "a".to_string(),
                node_type: "http".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    h.engine
        .start_timer(&key(), "t-1", Duration::from_secs(60))
        .await
        .unwrap();
    h.engine
        .record_signal_received(&key(), "approve", vec![], "ops")
        .await
        .unwrap();

    let before = h.engine.get_mutable_state(&key()).await.unwrap();
    let rebuilt = h.engine.rebuild_mutable_state(&key()).await.unwrap();
    assert!(rebuilt.equivalent(&before));
    assert_eq!(rebuilt.buffered_events, before.buffered_events);
    assert_eq!(rebuilt.db_version, before.db_version + 1);

    let err = h
        .engine
        .rebuild_mutable_state(&ExecutionKey::new("acme", "ghost", "r-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ExecutionNotFound { .. }));
}

#[tokio::test]
async fn test_child_execution_reports_back_to_parent() {
    let h = harness();
    h.engine.start_execution(&key(), start_request()).await.unwrap();

    let outcome = h
        .engine
        .initiate_child_execution(
            &key(),
            StartChildRequest {
                workflow_id: "child-1".to_string(),
                run_id: "c-1".to_string(),
                workflow_type: "sub".to_string(),
                input: b"x".to_vec(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let initiated = outcome.event_ids()[0];

    let child = ExecutionKey::new("acme", "child-1", "c-1");
    let child_state = h.engine.get_mutable_state(&child).await.unwrap();
    assert!(child_state.is_running());
    assert_eq!(child_state.execution_info.task_queue, "orders");
    assert_eq!(
        child_state.execution_info.parent_execution.as_deref(),
        Some("acme/wf-1/r-1")
    );

    h.engine
        .complete_execution(&child, b"child-result".to_vec())
        .await
        .unwrap();

    let parent = h.engine.get_mutable_state(&key()).await.unwrap();
    assert!(parent.pending_child_executions.is_empty());
    let events = all_events(&h, &key()).await;
    let closed = events
        .iter()
        .find_map(|e| match &e.attributes {
            EventAttributes::ChildExecutionClosed(a) => Some(a.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(closed.initiated_event_id, initiated);
    assert_eq!(closed.status, "completed");
    assert_eq!(closed.result, b"child-result".to_vec());
}

#[tokio::test]
async fn test_pending_tasks_cover_workflow_task_and_nodes() {
    let h = harness();
    h.engine.start_execution(&key(), start_request()).await.unwrap();
    h.engine
        .schedule_node(
            &key(),
            ScheduleNodeRequest {
                node_id: "a".to_string(),
                node_type: "http".to_string(),
                task_queue: "http-workers".to_string(),
                input: b"payload".to_vec(),
                start_to_close_timeout: Some(Duration::from_secs(5)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let tasks = h.engine.pending_tasks(&key()).await.unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].task_type, TaskType::Workflow);
    assert_eq!(tasks[1].task_type, TaskType::Activity);
    assert_eq!(tasks[1].task_queue, "http-workers");
    assert_eq!(tasks[1].payload, b"payload".to_vec());
    assert_eq!(tasks[1].start_to_close_timeout, Some(Duration::from_secs(5)));

    // Same IDs as the original dispatch, so matching rejects duplicates.
    let err = h.matching.add_task_with_options(tasks[1].clone()).unwrap_err();
    assert!(matches!(err, CoreError::TaskExists { .. }));
}
