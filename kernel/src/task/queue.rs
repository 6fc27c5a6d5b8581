//! Per-priority scheduler queues
//!
//! One queue per populated priority, kept in the ordered map so selection
//! can walk priorities descending. Each queue carries a FIFO of thread
//! references, the round-robin cursor (`last_handled`) and the thread it
//! currently runs.

use super::{TaskManager, ThreadRef};
use crate::collection::List;

/// Scheduling queue of one priority level.
pub struct PriorityQueue {
    pub priority: usize,
    pub threads: List<ThreadRef>,
    pub last_handled: Option<ThreadRef>,
    pub current: Option<ThreadRef>,
}

impl PriorityQueue {
    pub fn new(priority: usize) -> Self {
        Self {
            priority,
            threads: List::new(),
            last_handled: None,
            current: None,
        }
    }
}

impl TaskManager {
    /// Append a thread to its priority queue, creating the level on first
    /// use.
    pub(crate) fn enqueue_thread(&mut self, priority: usize, reference: ThreadRef) {
        match self.queues.find_mut(&priority) {
            Some(queue) => queue.threads.push_back(reference),
            None => {
                let mut queue = PriorityQueue::new(priority);
                queue.threads.push_back(reference);
                self.queues.insert(priority, queue);
            }
        }
    }

    /// Drop a thread from its priority queue and clear stale cursors.
    pub(crate) fn dequeue_thread(&mut self, priority: usize, reference: ThreadRef) {
        if let Some(queue) = self.queues.find_mut(&priority) {
            let _ = queue.threads.remove_first_match(|r| *r == reference);
            if queue.last_handled == Some(reference) {
                queue.last_handled = None;
            }
            if queue.current == Some(reference) {
                queue.current = None;
            }
        }
    }

    /// Record `reference` as the running thread of its queue and globally.
    pub fn set_current(&mut self, reference: ThreadRef, priority: usize) {
        if let Some(queue) = self.queues.find_mut(&priority) {
            queue.current = Some(reference);
        }
        self.set_current_ref(Some(reference));
    }

    /// Clear the running thread, both per-queue and globally.
    pub fn reset_current(&mut self) {
        if let Some(reference) = self.current() {
            if let Some(priority) = self.thread(reference).map(|t| t.priority) {
                if let Some(queue) = self.queues.find_mut(&priority) {
                    queue.current = None;
                }
            }
        }
        self.set_current_ref(None);
    }

    /// Clear every round-robin cursor; used when a full descent found no
    /// candidate.
    pub(crate) fn queue_reset(&mut self) {
        let priorities: alloc::vec::Vec<usize> =
            self.queues.iter().map(|(priority, _)| *priority).collect();
        for priority in priorities {
            if let Some(queue) = self.queues.find_mut(&priority) {
                queue.last_handled = None;
            }
        }
    }
}
