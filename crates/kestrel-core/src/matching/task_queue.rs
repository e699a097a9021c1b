// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! A single task queue: priority buckets, long-poll wakeups and an optional
//! dispatch rate limit.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::Task;
use super::priority::PriorityTaskStore;
use crate::error::Result;

/// Token bucket: `rate` tokens per second, burst of `max(1, ceil(rate))`.
#[derive(Debug)]
struct TokenBucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: f64) -> Self {
        let burst = rate.ceil().max(1.0);
        Self {
            rate,
            burst,
            tokens: burst,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last_refill = now;
    }

    /// Time until one token is available, zero if one is now.
    fn wait_time(&mut self, now: Instant) -> Duration {
        self.refill(now);
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.rate)
        }
    }
}

enum Attempt {
    Task(Task),
    Empty,
    Throttled(Duration),
}

/// Pending tasks of one `(namespace, queue)`.
pub struct TaskQueue {
    namespace_id: String,
    name: String,
    tasks: PriorityTaskStore,
    notify: Notify,
    limiter: Mutex<Option<TokenBucket>>,
}

impl TaskQueue {
    /// Create an empty queue.
    pub fn new(
        namespace_id: impl Into<String>,
        name: impl Into<String>,
        priority_levels: u32,
        default_priority: u32,
    ) -> Self {
        Self {
            namespace_id: namespace_id.into(),
            name: name.into(),
            tasks: PriorityTaskStore::new(priority_levels, default_priority),
            notify: Notify::new(),
            limiter: Mutex::new(None),
        }
    }

    /// Namespace.
    pub fn namespace_id(&self) -> &str {
        &self.namespace_id
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Routing key on the partition ring.
    pub fn key(&self) -> String {
        queue_key(&self.namespace_id, &self.name)
    }

    /// Queue a task and wake one waiting poller.
    pub fn add(&self, task: Task) -> Result<()> {
        self.tasks.add_task(task)?;
        self.notify.notify_one();
        Ok(())
    }

    /// Remove a queued task. Returns whether it was queued.
    pub fn remove(&self, task_id: &str) -> bool {
        self.tasks.ack_task(task_id)
    }

    /// Whether a task ID is queued.
    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks.contains(task_id)
    }

    /// Queued tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Limit dispatch to `rate` tasks per second; `None` removes the limit.
    pub fn set_rate_limit(&self, rate: Option<f64>) {
        *self.limiter.lock() = rate
            .filter(|r| r.is_finite() && *r > 0.0)
            .map(TokenBucket::new);
    }

    /// Current limit in tasks per second.
    pub fn rate_limit(&self) -> Option<f64> {
        self.limiter.lock().as_ref().map(|b| b.rate)
    }

    /// Wake every waiting poller (used on shutdown).
    pub fn wake_all(&self) {
        self.notify.notify_waiters();
    }

    /// Remove every queued task.
    pub fn drain(&self) -> Vec<Task> {
        self.tasks.drain()
    }

    fn try_take(&self) -> Attempt {
        let mut limiter = self.limiter.lock();
        if self.tasks.is_empty() {
            return Attempt::Empty;
        }
        if let Some(bucket) = limiter.as_mut() {
            let wait = bucket.wait_time(Instant::now());
            if !wait.is_zero() {
                return Attempt::Throttled(wait);
            }
        }
        match self.tasks.poll_task() {
            Some(task) => {
                if let Some(bucket) = limiter.as_mut() {
                    bucket.tokens -= 1.0;
                }
                Attempt::Task(task)
            }
            None => Attempt::Empty,
        }
    }

    /// Take the next task without waiting.
    pub fn try_poll(&self) -> Option<Task> {
        match self.try_take() {
            Attempt::Task(task) => Some(task),
            Attempt::Empty | Attempt::Throttled(_) => None,
        }
    }

    /// Wait up to `timeout` for a task.
    ///
    /// Woken by [`TaskQueue::add`]; a throttled queue sleeps until its next
    /// token or the deadline, whichever comes first.
    pub async fn poll(&self, timeout: Duration) -> Option<Task> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = match self.try_take() {
                Attempt::Task(task) => {
                    // Pass the wakeup on if more work is waiting.
                    if !self.tasks.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(task);
                }
                Attempt::Empty => deadline,
                Attempt::Throttled(wait) => deadline.min(Instant::now() + wait),
            };
            if Instant::now() >= deadline {
                return None;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }
}

/// Routing key of a queue.
pub fn queue_key(namespace_id: &str, name: &str) -> String {
    format!("{}/{}", namespace_id, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::TaskType;
    use std::sync::Arc;

    fn task(id: &str) -> Task {
        Task::new(id, "acme", "orders", TaskType::Activity, 1, vec![])
    }

    #[tokio::test]
    async fn test_poll_returns_queued_task() {
        let queue = TaskQueue::new("acme", "orders", 10, 5);
        queue.add(task("a")).unwrap();
        let polled = queue.poll(Duration::from_millis(10)).await.unwrap();
        assert_eq!(polled.task_id, "a");
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_times_out_when_empty() {
        let queue = TaskQueue::new("acme", "orders", 10, 5);
        let started = Instant::now();
        assert!(queue.poll(Duration::from_secs(2)).await.is_none());
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_woken_by_add() {
        let queue = Arc::new(TaskQueue::new("acme", "orders", 10, 5));
        let poller = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.poll(Duration::from_secs(30)).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        queue.add(task("late")).unwrap();

        let polled = poller.await.unwrap().unwrap();
        assert_eq!(polled.task_id, "late");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_spaces_dispatch() {
        let queue = TaskQueue::new("acme", "orders", 10, 5);
        queue.set_rate_limit(Some(1.0));
        assert_eq!(queue.rate_limit(), Some(1.0));
        for id in ["a", "b", "c"] {
            queue.add(task(id)).unwrap();
        }

        let started = Instant::now();
        assert!(queue.try_poll().is_some());
        assert!(queue.try_poll().is_none());

        let second = queue.poll(Duration::from_secs(5)).await.unwrap();
        assert_eq!(second.task_id, "b");
        assert!(started.elapsed() >= Duration::from_millis(900));

        queue.set_rate_limit(None);
        assert_eq!(queue.try_poll().unwrap().task_id, "c");
    }

    #[test]
    fn test_non_positive_rate_disables_limit() {
        let queue = TaskQueue::new("acme", "orders", 10, 5);
        queue.set_rate_limit(Some(0.0));
        assert_eq!(queue.rate_limit(), None);
        queue.set_rate_limit(Some(f64::NAN));
        assert_eq!(queue.rate_limit(), None);
    }

    #[test]
    fn test_queue_key() {
        let queue = TaskQueue::new("acme", "orders", 10, 5);
        assert_eq!(queue.key(), "acme/orders");
    }
}
