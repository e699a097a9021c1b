// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fixed-level priority buckets for pending tasks.
//!
//! Level 0 is served first; within a level tasks are FIFO.
//!
//! Acknowledging a queued task only drops its index entry. The bucket slot
//! becomes stale and is discarded when it reaches the front, so removal by ID
//! does not scan the bucket.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use super::Task;
use crate::error::{CoreError, Result};

struct Buckets {
    levels: Vec<VecDeque<Slot>>,
    /// task_id -> (level, sequence) of the live slot
    index: HashMap<String, (usize, u64)>,
    next_seq: u64,
}

struct Slot {
    seq: u64,
    task: Task,
}

impl Buckets {
    fn is_live(&self, level: usize, slot: &Slot) -> bool {
        self.index.get(&slot.task.task_id) == Some(&(level, slot.seq))
    }
}

/// Pending tasks bucketed by priority, guarded by one store-wide lock.
pub struct PriorityTaskStore {
    num_levels: usize,
    default_priority: u32,
    inner: Mutex<Buckets>,
}

impl PriorityTaskStore {
    /// Create a store with `levels` buckets (at least one).
    ///
    /// Tasks without a priority go to `default_priority`, clamped like any
    /// other priority.
    pub fn new(levels: u32, default_priority: u32) -> Self {
        let levels = levels.max(1);
        Self {
            num_levels: levels as usize,
            default_priority: default_priority.min(levels - 1),
            inner: Mutex::new(Buckets {
                levels: (0..levels).map(|_| VecDeque::new()).collect(),
                index: HashMap::new(),
                next_seq: 0,
            }),
        }
    }

    /// Number of priority levels.
    pub fn levels(&self) -> u32 {
        self.num_levels as u32
    }

    /// Bucket a priority maps to.
    pub fn level_for(&self, priority: Option<u32>) -> usize {
        (priority.unwrap_or(self.default_priority) as usize).min(self.num_levels - 1)
    }

    /// Queue a task. Returns [`CoreError::TaskExists`] if its ID is queued.
    pub fn add_task(&self, task: Task) -> Result<()> {
        let level = self.level_for(task.priority);
        let mut inner = self.inner.lock();
        if inner.index.contains_key(&task.task_id) {
            return Err(CoreError::TaskExists {
                task_id: task.task_id,
            });
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.index.insert(task.task_id.clone(), (level, seq));
        inner.levels[level].push_back(Slot { seq, task });
        Ok(())
    }

    /// Pop the oldest task of the highest non-empty priority.
    pub fn poll_task(&self) -> Option<Task> {
        let mut inner = self.inner.lock();
        for level in 0..inner.levels.len() {
            while let Some(slot) = inner.levels[level].pop_front() {
                if inner.is_live(level, &slot) {
                    inner.index.remove(&slot.task.task_id);
                    return Some(slot.task);
                }
            }
        }
        None
    }

    /// Remove a queued task by ID. Returns whether it was queued.
    pub fn ack_task(&self, task_id: &str) -> bool {
        self.inner.lock().index.remove(task_id).is_some()
    }

    /// Whether a task ID is queued.
    pub fn contains(&self, task_id: &str) -> bool {
        self.inner.lock().index.contains_key(task_id)
    }

    /// Queued tasks across all levels.
    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    /// Whether no task is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slots held across all levels, stale ones included.
    #[cfg(test)]
    fn slots(&self) -> usize {
        self.inner.lock().levels.iter().map(VecDeque::len).sum()
    }

    /// Remove and return every queued task, highest priority first.
    pub fn drain(&self) -> Vec<Task> {
        let mut inner = self.inner.lock();
        let mut tasks = Vec::with_capacity(inner.index.len());
        for level in 0..inner.levels.len() {
            let slots: Vec<Slot> = inner.levels[level].drain(..).collect();
            tasks.extend(
                slots
                    .into_iter()
                    .filter(|slot| inner.is_live(level, slot))
                    .map(|slot| slot.task),
            );
        }
        inner.index.clear();
        tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::TaskType;

    fn task(id: &str, priority: Option<u32>) -> Task {
        Task::new(id, "acme", "orders", TaskType::Activity, 1, vec![]).with_priority(priority)
    }

    #[test]
    fn test_poll_order_by_priority_then_fifo() {
        let store = PriorityTaskStore::new(10, 5);
        store.add_task(task("a", Some(9))).unwrap();
        store.add_task(task("b", Some(0))).unwrap();
        store.add_task(task("c", Some(5))).unwrap();
        store.add_task(task("d", Some(0))).unwrap();

        let order: Vec<String> = std::iter::from_fn(|| store.poll_task())
            .map(|t| t.task_id)
            .collect();
        assert_eq!(order, vec!["b", "d", "c", "a"]);
        assert!(store.is_empty());
    }

    #[test]
    fn test_duplicate_task_rejected() {
        let store = PriorityTaskStore::new(10, 5);
        store.add_task(task("a", Some(1))).unwrap();

        let err = store.add_task(task("a", Some(7))).unwrap_err();
        assert_eq!(err.error_code(), "TASK_EXISTS");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_default_and_clamped_priority() {
        let store = PriorityTaskStore::new(3, 1);
        assert_eq!(store.level_for(None), 1);
        assert_eq!(store.level_for(Some(42)), 2);

        store.add_task(task("low", Some(42))).unwrap();
        store.add_task(task("default", None)).unwrap();
        store.add_task(task("high", Some(0))).unwrap();

        assert_eq!(store.poll_task().unwrap().task_id, "high");
        assert_eq!(store.poll_task().unwrap().task_id, "default");
        assert_eq!(store.poll_task().unwrap().task_id, "low");
    }

    #[test]
    fn test_ack_removes_from_any_bucket() {
        let store = PriorityTaskStore::new(10, 5);
        store.add_task(task("a", Some(0))).unwrap();
        store.add_task(task("b", Some(8))).unwrap();

        assert!(store.ack_task("b"));
        assert!(!store.ack_task("b"));
        assert!(!store.contains("b"));
        assert_eq!(store.len(), 1);

        // The ID is free again once removed.
        store.add_task(task("b", Some(2))).unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_acked_slot_is_skipped_and_reused_id_keeps_new_position() {
        let store = PriorityTaskStore::new(4, 1);
        store.add_task(task("a", Some(1))).unwrap();
        store.add_task(task("b", Some(1))).unwrap();
        store.add_task(task("c", Some(1))).unwrap();

        assert!(store.ack_task("a"));
        // Re-queued after the ack: goes behind "c", not into the old slot.
        store.add_task(task("a", Some(1))).unwrap();
        assert_eq!(store.len(), 3);
        assert_eq!(store.slots(), 4);

        let order: Vec<String> = std::iter::from_fn(|| store.poll_task())
            .map(|t| t.task_id)
            .collect();
        assert_eq!(order, vec!["b", "c", "a"]);
        assert_eq!(store.slots(), 0);
    }

    #[test]
    fn test_drain_skips_acked_tasks() {
        let store = PriorityTaskStore::new(4, 1);
        store.add_task(task("a", Some(0))).unwrap();
        store.add_task(task("b", Some(3))).unwrap();
        store.ack_task("a");

        let drained: Vec<String> = store.drain().into_iter().map(|t| t.task_id).collect();
        assert_eq!(drained, vec!["b"]);
        assert!(store.is_empty());
    }

    #[test]
    fn test_zero_levels_is_one_level() {
        let store = PriorityTaskStore::new(0, 9);
        assert_eq!(store.levels(), 1);
        store.add_task(task("a", Some(3))).unwrap();
        assert_eq!(store.poll_task().unwrap().task_id, "a");
    }
}
