//! Pending-task queue: priority tiers, FIFO within a tier, aging.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::envelope::{Priority, TaskEnvelope, TaskOutput};
use crate::error::Result;

/// Channel over which a submission's single terminal result is delivered.
pub(crate) type ReplySender = oneshot::Sender<Result<TaskOutput>>;

/// A task waiting for an idle worker.
pub(crate) struct QueuedTask {
    pub envelope: TaskEnvelope,
    pub reply: ReplySender,
    pub enqueued_at: Instant,
}

/// Priority-ordered pending queue.
///
/// Selection is highest tier first, FIFO within a tier. A lower-tier head
/// that has waited beyond the aging threshold is picked ahead of higher
/// tiers, so batch work is delayed under load but never starved.
pub(crate) struct TaskQueue {
    tiers: [VecDeque<QueuedTask>; Priority::TIERS],
    aging_threshold: Duration,
}

impl TaskQueue {
    pub fn new(aging_threshold: Duration) -> Self {
        Self {
            tiers: Default::default(),
            aging_threshold,
        }
    }

    pub fn len(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.iter().all(VecDeque::is_empty)
    }

    pub fn push(&mut self, task: QueuedTask) {
        let tier = task.envelope.priority.tier_index();
        self.tiers[tier].push_back(task);
    }

    /// Remove every task whose deadline has passed, anywhere in the queue.
    /// The caller delivers `DeadlineExceeded` to each.
    pub fn expire(&mut self, now: Instant) -> Vec<QueuedTask> {
        let mut expired = Vec::new();
        for tier in &mut self.tiers {
            let mut keep = VecDeque::with_capacity(tier.len());
            while let Some(task) = tier.pop_front() {
                if task.envelope.is_expired(now) {
                    expired.push(task);
                } else {
                    keep.push_back(task);
                }
            }
            *tier = keep;
        }
        expired
    }

    /// Pick the next task to assign, or `None` if the queue is empty.
    pub fn pop_next(&mut self, now: Instant) -> Option<QueuedTask> {
        let top = self.tiers.iter().rposition(|tier| !tier.is_empty())?;

        // Aging: a lower-tier head that has waited past the threshold wins
        // over the top tier; among several, the longest-waiting one.
        let mut aged: Option<(usize, Duration)> = None;
        for tier_index in 0..top {
            if let Some(head) = self.tiers[tier_index].front() {
                let age = now.duration_since(head.enqueued_at);
                if age > self.aging_threshold && aged.map_or(true, |(_, best)| age > best) {
                    aged = Some((tier_index, age));
                }
            }
        }

        let tier = aged.map(|(tier_index, _)| tier_index).unwrap_or(top);
        self.tiers[tier].pop_front()
    }

    /// Drain everything, e.g. at shutdown.
    pub fn drain(&mut self) -> Vec<QueuedTask> {
        let mut all = Vec::with_capacity(self.len());
        for tier in &mut self.tiers {
            all.extend(tier.drain(..));
        }
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Capability, TaskEnvelope};

    fn task(priority: Priority, enqueued_at: Instant) -> QueuedTask {
        let mut envelope =
            TaskEnvelope::new(Capability::Synthesis, serde_json::json!({"text": "x"}));
        envelope.priority = priority;
        let (reply, _rx) = oneshot::channel();
        QueuedTask {
            envelope,
            reply,
            enqueued_at,
        }
    }

    fn task_with_deadline(deadline: Instant, enqueued_at: Instant) -> QueuedTask {
        let mut queued = task(Priority::Normal, enqueued_at);
        queued.envelope.deadline = Some(deadline);
        queued
    }

    #[test]
    fn test_fifo_within_tier() {
        let now = Instant::now();
        let mut queue = TaskQueue::new(Duration::from_secs(5));
        let first = task(Priority::Normal, now);
        let first_id = first.envelope.id.clone();
        queue.push(first);
        queue.push(task(Priority::Normal, now));

        let popped = queue.pop_next(now).unwrap();
        assert_eq!(popped.envelope.id, first_id);
    }

    #[test]
    fn test_higher_tier_first() {
        let now = Instant::now();
        let mut queue = TaskQueue::new(Duration::from_secs(5));
        queue.push(task(Priority::Batch, now));
        let interactive = task(Priority::Interactive, now);
        let interactive_id = interactive.envelope.id.clone();
        queue.push(interactive);
        queue.push(task(Priority::Normal, now));

        let popped = queue.pop_next(now).unwrap();
        assert_eq!(popped.envelope.id, interactive_id);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_aged_batch_beats_interactive() {
        let start = Instant::now();
        let mut queue = TaskQueue::new(Duration::from_secs(5));
        let batch = task(Priority::Batch, start);
        let batch_id = batch.envelope.id.clone();
        queue.push(batch);
        queue.push(task(Priority::Interactive, start));

        // Not yet aged: interactive wins.
        let popped = queue.pop_next(start + Duration::from_secs(1)).unwrap();
        assert_ne!(popped.envelope.id, batch_id);

        // Past the threshold the batch head is picked first.
        let popped = queue.pop_next(start + Duration::from_secs(10)).unwrap();
        assert_eq!(popped.envelope.id, batch_id);
    }

    #[test]
    fn test_expire_removes_past_deadline() {
        let now = Instant::now();
        let later = now + Duration::from_secs(60);
        let mut queue = TaskQueue::new(Duration::from_secs(5));
        queue.push(task_with_deadline(now + Duration::from_secs(1), now));
        queue.push(task_with_deadline(now + Duration::from_secs(120), now));
        queue.push(task(Priority::Normal, now));

        let expired = queue.expire(later);
        assert_eq!(expired.len(), 1);
        assert_eq!(queue.len(), 2);

        // Expired tasks are gone for good; the rest keep FIFO order.
        assert!(queue.pop_next(later).is_some());
        assert!(queue.pop_next(later).is_some());
        assert!(queue.pop_next(later).is_none());
    }

    #[test]
    fn test_drain_empties_queue() {
        let now = Instant::now();
        let mut queue = TaskQueue::new(Duration::from_secs(5));
        queue.push(task(Priority::Batch, now));
        queue.push(task(Priority::Interactive, now));

        assert_eq!(queue.drain().len(), 2);
        assert!(queue.is_empty());
    }
}
