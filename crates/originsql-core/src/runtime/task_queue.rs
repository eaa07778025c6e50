// crates/originsql-core/src/runtime/task_queue.rs
// ============================================================================
// Module: OriginSQL Task Queue
// Description: Blocking FIFO with priority insertion and a kill switch.
// Purpose: Feed work to a database worker thread.
// Dependencies: std
// ============================================================================

//! ## Overview
//! [`TaskQueue`] is a mutex-and-condvar queue. Producers append to the back
//! or, for synchronous calls, push to the front. The consumer blocks in
//! [`TaskQueue::take`] until a task arrives or the queue is killed.
//!
//! # Invariants
//! - Once killed, no further task is accepted and `take` returns `None`.
//! - Tasks removed by [`TaskQueue::remove_matching`] or [`TaskQueue::drain`]
//!   are handed back to the caller rather than dropped silently.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::VecDeque;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

// ============================================================================
// SECTION: Queue
// ============================================================================

/// Mutable queue state guarded by one mutex.
struct QueueState<T> {
    /// Pending tasks in execution order.
    tasks: VecDeque<T>,
    /// Set once the queue stops accepting work.
    killed: bool,
}

/// Blocking task queue shared between producers and one consumer.
pub struct TaskQueue<T> {
    /// Guarded queue state.
    state: Mutex<QueueState<T>>,
    /// Signalled when a task arrives or the queue is killed.
    available: Condvar,
}

impl<T> TaskQueue<T> {
    /// Creates an empty, live queue.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(QueueState { tasks: VecDeque::new(), killed: false }),
            available: Condvar::new(),
        }
    }

    /// Appends `task`.
    ///
    /// # Errors
    ///
    /// Returns the task back when the queue has been killed.
    pub fn submit(&self, task: T) -> Result<(), T> {
        let mut state = self.lock();
        if state.killed {
            return Err(task);
        }
        state.tasks.push_back(task);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Places `task` ahead of all queued work.
    ///
    /// # Errors
    ///
    /// Returns the task back when the queue has been killed.
    pub fn submit_priority(&self, task: T) -> Result<(), T> {
        let mut state = self.lock();
        if state.killed {
            return Err(task);
        }
        state.tasks.push_front(task);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Blocks until a task is available; returns `None` once killed.
    pub fn take(&self) -> Option<T> {
        let mut state = self.lock();
        loop {
            if state.killed {
                return None;
            }
            if let Some(task) = state.tasks.pop_front() {
                return Some(task);
            }
            state = self.available.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Stops the queue and wakes every waiter.
    pub fn kill(&self) {
        self.lock().killed = true;
        self.available.notify_all();
    }

    /// Returns true once [`Self::kill`] has been called.
    #[must_use]
    pub fn is_killed(&self) -> bool {
        self.lock().killed
    }

    /// Removes and returns every queued task matching `predicate`, preserving order.
    pub fn remove_matching(&self, mut predicate: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut state = self.lock();
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(state.tasks.len());
        for task in state.tasks.drain(..) {
            if predicate(&task) {
                removed.push(task);
            } else {
                kept.push_back(task);
            }
        }
        state.tasks = kept;
        removed
    }

    /// Removes and returns all queued tasks.
    pub fn drain(&self) -> Vec<T> {
        self.lock().tasks.drain(..).collect()
    }

    /// Returns the number of queued tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    /// Returns true when no task is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().tasks.is_empty()
    }

    /// Locks the queue state, recovering from poisoning.
    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
