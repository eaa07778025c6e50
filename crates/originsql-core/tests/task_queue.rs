// crates/originsql-core/tests/task_queue.rs
// ============================================================================
// Module: Task Queue Tests
// Description: Ordering, priority, removal, and kill semantics of the worker queue.
// Purpose: Ensure queued work is never silently lost.
// ============================================================================

//! ## Overview
//! Exercises [`TaskQueue`] from one and several threads.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_docs_in_private_items,
    reason = "Test-only assertions and helpers are permitted."
)]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use originsql_core::TaskQueue;

#[test]
fn tasks_are_taken_in_submission_order() {
    let queue = TaskQueue::new();
    queue.submit(1).unwrap();
    queue.submit(2).unwrap();
    queue.submit(3).unwrap();
    assert_eq!(queue.len(), 3);
    assert_eq!(queue.take(), Some(1));
    assert_eq!(queue.take(), Some(2));
    assert_eq!(queue.take(), Some(3));
    assert!(queue.is_empty());
}

#[test]
fn priority_tasks_jump_the_queue() {
    let queue = TaskQueue::new();
    queue.submit("normal").unwrap();
    queue.submit_priority("urgent").unwrap();
    assert_eq!(queue.take(), Some("urgent"));
    assert_eq!(queue.take(), Some("normal"));
}

#[test]
fn killed_queue_rejects_and_returns_work() {
    let queue = TaskQueue::new();
    queue.submit(7).unwrap();
    queue.kill();
    assert!(queue.is_killed());
    assert_eq!(queue.submit(8), Err(8));
    assert_eq!(queue.submit_priority(9), Err(9));
    assert_eq!(queue.take(), None);
    assert_eq!(queue.drain(), vec![7]);
}

#[test]
fn remove_matching_returns_removed_tasks_in_order() {
    let queue = TaskQueue::new();
    for value in 1..=6 {
        queue.submit(value).unwrap();
    }
    let removed = queue.remove_matching(|value| value % 2 == 0);
    assert_eq!(removed, vec![2, 4, 6]);
    assert_eq!(queue.drain(), vec![1, 3, 5]);
}

#[test]
fn kill_wakes_a_blocked_consumer() {
    let queue: Arc<TaskQueue<u32>> = Arc::new(TaskQueue::new());
    let consumer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || queue.take())
    };
    thread::sleep(Duration::from_millis(20));
    queue.kill();
    assert_eq!(consumer.join().unwrap(), None);
}

#[test]
fn producer_on_another_thread_wakes_consumer() {
    let queue: Arc<TaskQueue<u32>> = Arc::new(TaskQueue::new());
    let producer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            queue.submit(42).unwrap();
        })
    };
    assert_eq!(queue.take(), Some(42));
    producer.join().unwrap();
}
