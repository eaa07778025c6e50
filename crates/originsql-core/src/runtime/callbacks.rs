// crates/originsql-core/src/runtime/callbacks.rs
// ============================================================================
// Module: OriginSQL Caller Queue
// Description: Channel-backed callback scheduler pumped by the caller thread.
// Purpose: Run transaction callbacks on the thread that owns the context.
// Dependencies: crate::interfaces
// ============================================================================

//! ## Overview
//! [`CallerQueue`] is the stock [`CallbackScheduler`]: the worker posts
//! closures into a channel and the caller drains it from its own loop with
//! [`CallerQueue::run_pending`] or [`CallerQueue::run_until`]. Embedders with
//! their own event loop implement [`CallbackScheduler`] directly instead.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::mpsc;
use std::time::Duration;
use std::time::Instant;

use crate::interfaces::CallbackScheduler;
use crate::interfaces::CallerTask;

// ============================================================================
// SECTION: Caller Queue
// ============================================================================

/// Callback scheduler backed by an in-process channel.
pub struct CallerQueue {
    /// Producer side used by [`CallbackScheduler::post`].
    sender: mpsc::Sender<CallerTask>,
    /// Consumer side drained by the caller thread.
    receiver: Mutex<mpsc::Receiver<CallerTask>>,
}

impl CallerQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self { sender, receiver: Mutex::new(receiver) }
    }

    /// Runs every task already queued and returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Some(task) = self.try_next() {
            task();
            ran += 1;
        }
        ran
    }

    /// Runs tasks as they arrive until `done` returns true or `timeout` elapses.
    ///
    /// Returns the final value of `done`.
    pub fn run_until(&self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.run_pending();
            if done() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            if let Some(task) = self.next_before(deadline - now) {
                task();
            }
        }
    }

    /// Pops one task without blocking.
    fn try_next(&self) -> Option<CallerTask> {
        self.receiver.lock().unwrap_or_else(PoisonError::into_inner).try_recv().ok()
    }

    /// Waits up to `wait` for one task.
    fn next_before(&self, wait: Duration) -> Option<CallerTask> {
        self.receiver.lock().unwrap_or_else(PoisonError::into_inner).recv_timeout(wait).ok()
    }
}

impl Default for CallerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackScheduler for CallerQueue {
    fn post(&self, task: CallerTask) -> bool {
        self.sender.send(task).is_ok()
    }
}
