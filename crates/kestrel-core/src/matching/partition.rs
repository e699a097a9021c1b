// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Partitions and the manager routing task queues to them.
//!
//! A queue lives in exactly one partition: the ring owner of its routing key.
//! Adding or removing a partition moves the affected queues, tasks included,
//! to their new owner.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::info;

use super::ring::HashRing;
use super::task_queue::{TaskQueue, queue_key};
use crate::error::{CoreError, Result};

/// A shard of the matching service holding a set of task queues.
pub struct Partition {
    id: u32,
    queues: Mutex<HashMap<String, Arc<TaskQueue>>>,
}

impl Partition {
    fn new(id: u32) -> Self {
        Self {
            id,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Partition ID.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Queues hosted here.
    pub fn queues(&self) -> Vec<Arc<TaskQueue>> {
        self.queues.lock().values().cloned().collect()
    }

    /// Number of queues hosted here.
    pub fn queue_count(&self) -> usize {
        self.queues.lock().len()
    }
}

/// Routes queues to partitions through a [`HashRing`].
pub struct PartitionManager {
    ring: HashRing,
    partitions: RwLock<BTreeMap<u32, Arc<Partition>>>,
    priority_levels: u32,
    default_priority: u32,
}

impl PartitionManager {
    /// Create partitions `0..num_partitions`.
    pub fn new(
        num_partitions: u32,
        replicas: u32,
        priority_levels: u32,
        default_priority: u32,
    ) -> Self {
        let ring = HashRing::new(replicas);
        let mut partitions = BTreeMap::new();
        for id in 0..num_partitions {
            ring.add(id);
            partitions.insert(id, Arc::new(Partition::new(id)));
        }
        Self {
            ring,
            partitions: RwLock::new(partitions),
            priority_levels,
            default_priority,
        }
    }

    /// Partition owning a queue.
    pub fn partition_for(&self, namespace_id: &str, queue_name: &str) -> Option<u32> {
        self.ring.get(&queue_key(namespace_id, queue_name))
    }

    /// Member partition IDs.
    pub fn partitions(&self) -> Vec<u32> {
        self.partitions.read().keys().copied().collect()
    }

    /// A partition by ID.
    pub fn partition(&self, id: u32) -> Option<Arc<Partition>> {
        self.partitions.read().get(&id).cloned()
    }

    /// Existing queue, if any.
    pub fn get_task_queue(&self, namespace_id: &str, queue_name: &str) -> Option<Arc<TaskQueue>> {
        let key = queue_key(namespace_id, queue_name);
        let partitions = self.partitions.read();
        let owner = self.ring.get(&key)?;
        let partition = partitions.get(&owner)?;
        let queues = partition.queues.lock();
        queues.get(&key).cloned()
    }

    /// Existing queue, or a new empty one in its owning partition.
    ///
    /// Concurrent callers for the same queue get the same instance.
    pub fn get_or_create_task_queue(
        &self,
        namespace_id: &str,
        queue_name: &str,
    ) -> Result<Arc<TaskQueue>> {
        let key = queue_key(namespace_id, queue_name);
        let partitions = self.partitions.read();
        let partition = self
            .ring
            .get(&key)
            .and_then(|owner| partitions.get(&owner))
            .ok_or_else(|| CoreError::ServiceNotRunning {
                service: "matching: no partitions".to_string(),
            })?;

        let mut queues = partition.queues.lock();
        let queue = queues.entry(key).or_insert_with(|| {
            Arc::new(TaskQueue::new(
                namespace_id,
                queue_name,
                self.priority_levels,
                self.default_priority,
            ))
        });
        Ok(queue.clone())
    }

    /// Every queue in every partition.
    pub fn all_queues(&self) -> Vec<Arc<TaskQueue>> {
        self.partitions
            .read()
            .values()
            .flat_map(|p| p.queues())
            .collect()
    }

    /// Add a partition and move the queues it now owns. Returns `false` if present.
    pub fn add_partition(&self, id: u32) -> bool {
        let mut partitions = self.partitions.write();
        if !self.ring.add(id) {
            return false;
        }
        partitions.insert(id, Arc::new(Partition::new(id)));
        let moved = self.rebalance(&partitions);
        info!(partition_id = id, moved_queues = moved, "Partition added");
        true
    }

    /// Remove a partition and hand its queues to their new owners.
    ///
    /// Returns `false` if absent. Removing the last partition is refused so
    /// queued tasks are never orphaned.
    pub fn remove_partition(&self, id: u32) -> Result<bool> {
        let mut partitions = self.partitions.write();
        if !partitions.contains_key(&id) {
            return Ok(false);
        }
        if partitions.len() == 1 {
            return Err(CoreError::ValidationError {
                field: "partition_id".to_string(),
                message: "cannot remove the last partition".to_string(),
            });
        }

        self.ring.remove(id);
        let removed = partitions.remove(&id);
        let orphans = removed
            .map(|p| std::mem::take(&mut *p.queues.lock()))
            .unwrap_or_default();
        let moved = orphans.len();
        for (key, queue) in orphans {
            if let Some(owner) = self.ring.get(&key).and_then(|o| partitions.get(&o)) {
                owner.queues.lock().insert(key, queue);
            }
        }

        info!(partition_id = id, moved_queues = moved, "Partition removed");
        Ok(true)
    }

    /// Move every queue not hosted by its ring owner. Caller holds the write lock.
    fn rebalance(&self, partitions: &BTreeMap<u32, Arc<Partition>>) -> usize {
        let mut misplaced = Vec::new();
        for (id, partition) in partitions {
            let mut queues = partition.queues.lock();
            let keys: Vec<String> = queues
                .keys()
                .filter(|k| self.ring.get(k) != Some(*id))
                .cloned()
                .collect();
            for key in keys {
                if let Some(queue) = queues.remove(&key) {
                    misplaced.push((key, queue));
                }
            }
        }

        let moved = misplaced.len();
        for (key, queue) in misplaced {
            if let Some(owner) = self.ring.get(&key).and_then(|o| partitions.get(&o)) {
                owner.queues.lock().insert(key, queue);
            }
        }
        moved
    }
}
