//! Task Queues
//!
//! Two queue flavours share one doorbell per consuming loop:
//!
//! - [`OnceTasker`] hands the consumer everything queued since the last ring.
//! - [`EachTasker`] hands out one task per ring, coalescing adjacent
//!   mergeable tasks, and can be paused without losing work.

use crate::task::Task;
use crate::wake::{lock, Wake};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Consumer side of a queue.
pub trait Dispatch {
    fn dispatch(&mut self, task: Task);
}

// ============================================================================
// ONCE QUEUE
// ============================================================================

/// FIFO drained in full on every doorbell ring.
#[derive(Debug)]
pub struct OnceTasker {
    queue: Mutex<VecDeque<Task>>,
    bell: Arc<Wake>,
}

impl OnceTasker {
    pub fn new(bell: Arc<Wake>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            bell,
        }
    }

    /// Enqueues `task` and rings the doorbell. Never blocks on the consumer.
    pub fn give(&self, task: Task) {
        lock(&self.queue).push_back(task);
        self.bell.signal();
    }

    /// Detaches the whole queue in one step.
    pub fn take_all(&self) -> VecDeque<Task> {
        std::mem::take(&mut *lock(&self.queue))
    }

    /// Drains the queue through `dispatch`. Returns the number of tasks run.
    pub fn run<D: Dispatch + ?Sized>(&self, dispatch: &mut D) -> usize {
        let batch = self.take_all();
        let count = batch.len();
        for task in batch {
            dispatch.dispatch(task);
        }
        count
    }

    pub fn len(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// EACH QUEUE
// ============================================================================

#[derive(Debug, Default)]
struct EachState {
    queue: VecDeque<Task>,
    stopped: bool,
}

/// FIFO that delivers one (possibly merged) task per poll and can be paused.
#[derive(Debug)]
pub struct EachTasker {
    state: Mutex<EachState>,
    bell: Arc<Wake>,
}

impl EachTasker {
    pub fn new(bell: Arc<Wake>) -> Self {
        Self {
            state: Mutex::new(EachState::default()),
            bell,
        }
    }

    /// Enqueues `task`; rings the doorbell unless the queue is stopped.
    pub fn give(&self, task: Task) {
        let ring = {
            let mut state = lock(&self.state);
            state.queue.push_back(task);
            !state.stopped
        };
        if ring {
            self.bell.signal();
        }
    }

    /// Takes the head task, with every directly following task it can absorb
    /// attached to it. Returns `None` while stopped or empty.
    ///
    /// Re-rings the doorbell if more tasks remain deliverable, so one poll
    /// per loop iteration eventually drains the queue.
    pub fn poll(&self) -> Option<Task> {
        let (task, more) = {
            let mut state = lock(&self.state);
            if state.stopped {
                return None;
            }
            let mut head = state.queue.pop_front()?;
            if head.is_mergeable() {
                while state.queue.front().is_some_and(|next| head.can_absorb(next)) {
                    if let Some(next) = state.queue.pop_front() {
                        head.absorb(next);
                    }
                }
            }
            (head, !state.queue.is_empty())
        };
        if more {
            self.bell.signal();
        }
        Some(task)
    }

    /// Pauses delivery. Queued and newly given tasks are kept.
    pub fn stop(&self) {
        lock(&self.state).stopped = true;
    }

    /// Resumes delivery and rings the doorbell if work piled up.
    pub fn resume(&self) {
        let ring = {
            let mut state = lock(&self.state);
            state.stopped = false;
            !state.queue.is_empty()
        };
        if ring {
            self.bell.signal();
        }
    }

    pub fn is_stopped(&self) -> bool {
        lock(&self.state).stopped
    }

    pub fn len(&self) -> usize {
        lock(&self.state).queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every queued task, for teardown.
    pub fn drain(&self) -> Vec<Task> {
        lock(&self.state).queue.drain(..).collect()
    }
}
