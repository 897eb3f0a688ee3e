//! Run Queue Management
//!
//! The ready queue is a plain FIFO of task ids. Round-robin is the only
//! policy: a yielding task goes to the tail and the head runs next, so
//! arrival order is preserved across block/wake cycles.

use heapless::Deque;

use crate::config::MAX_TASKS;
use crate::types::TaskId;

/// FIFO of ready tasks
#[derive(Debug)]
pub struct ReadyQueue {
    queue: Deque<TaskId, MAX_TASKS>,
}

impl ReadyQueue {
    /// Create an empty queue
    pub const fn new() -> Self {
        Self {
            queue: Deque::new(),
        }
    }

    /// Append a task at the tail
    ///
    /// A task id is queued at most once, so the queue never overflows.
    pub fn push(&mut self, id: TaskId) {
        debug_assert!(!self.contains(id), "{id} queued twice");
        let pushed = self.queue.push_back(id);
        debug_assert!(pushed.is_ok());
    }

    /// Take the head task
    pub fn pop(&mut self) -> Option<TaskId> {
        self.queue.pop_front()
    }

    /// Whether `id` is queued
    pub fn contains(&self, id: TaskId) -> bool {
        self.queue.iter().any(|&queued| queued == id)
    }

    /// Number of queued tasks
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if queue is empty
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queued ids, head first
    pub fn iter(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.queue.iter().copied()
    }
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}
