// crates/originsql-core/tests/lock_coordinator.rs
// ============================================================================
// Module: Lock Coordinator Tests
// Description: Reader/writer admission ordering per database identity.
// Purpose: Ensure readers share, writers exclude, and release re-admits in order.
// ============================================================================

//! ## Overview
//! Exercises [`LockCoordinator`] directly: grouped reader admission, writer
//! exclusion, cancellation of pending requests, shutdown draining, and a
//! randomized check of the exclusion invariant.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::missing_docs_in_private_items,
    reason = "Test-only assertions and helpers are permitted."
)]

use originsql_core::DatabaseIdentity;
use originsql_core::DatabaseKey;
use originsql_core::LockCoordinator;
use originsql_core::LockRequest;
use originsql_core::OriginId;
use originsql_core::TransactionId;
use proptest::prelude::*;

// ============================================================================
// SECTION: Helpers
// ============================================================================

fn identity(name: &str) -> DatabaseIdentity {
    DatabaseIdentity::new(OriginId::new("https_example.com_443").unwrap(), name)
}

fn request(id: u64, name: &str, read_only: bool) -> LockRequest {
    LockRequest {
        database: DatabaseKey::new(id),
        transaction: TransactionId::new(id),
        identity: identity(name),
        read_only,
    }
}

fn ids(requests: &[LockRequest]) -> Vec<u64> {
    requests.iter().map(|request| request.transaction.get()).collect()
}

// ============================================================================
// SECTION: Admission
// ============================================================================

#[test]
fn readers_queued_behind_a_writer_are_admitted_together() {
    let mut coordinator = LockCoordinator::new();
    let writer = request(1, "app_db", false);
    assert_eq!(ids(&coordinator.acquire(writer.clone())), vec![1]);

    assert!(coordinator.acquire(request(2, "app_db", true)).is_empty());
    assert!(coordinator.acquire(request(3, "app_db", true)).is_empty());

    let granted = coordinator.release(&writer);
    assert_eq!(ids(&granted), vec![2, 3]);
    let mut active = coordinator.active_reads(&identity("app_db"));
    active.sort();
    assert_eq!(active, vec![TransactionId::new(2), TransactionId::new(3)]);
}

#[test]
fn writer_waits_for_active_reader_to_release() {
    let mut coordinator = LockCoordinator::new();
    let reader = request(1, "app_db", true);
    assert_eq!(ids(&coordinator.acquire(reader.clone())), vec![1]);

    let writer = request(2, "app_db", false);
    assert!(coordinator.acquire(writer).is_empty());
    assert_eq!(coordinator.active_write(&identity("app_db")), None);
    assert_eq!(coordinator.pending(&identity("app_db")), vec![TransactionId::new(2)]);

    assert_eq!(ids(&coordinator.release(&reader)), vec![2]);
    assert_eq!(coordinator.active_write(&identity("app_db")), Some(TransactionId::new(2)));
}

#[test]
fn reads_after_a_queued_writer_wait_their_turn() {
    let mut coordinator = LockCoordinator::new();
    let first = request(1, "app_db", true);
    coordinator.acquire(first.clone());
    coordinator.acquire(request(2, "app_db", false));
    coordinator.acquire(request(3, "app_db", true));

    assert_eq!(ids(&coordinator.release(&first)), vec![2]);
    assert_eq!(coordinator.pending(&identity("app_db")), vec![TransactionId::new(3)]);
}

#[test]
fn identities_are_coordinated_independently() {
    let mut coordinator = LockCoordinator::new();
    assert_eq!(ids(&coordinator.acquire(request(1, "alpha", false))), vec![1]);
    assert_eq!(ids(&coordinator.acquire(request(2, "beta", false))), vec![2]);
}

#[test]
fn releasing_a_pending_request_cancels_it() {
    let mut coordinator = LockCoordinator::new();
    let writer = request(1, "app_db", false);
    coordinator.acquire(writer.clone());
    let queued = request(2, "app_db", false);
    coordinator.acquire(queued.clone());

    assert!(coordinator.release(&queued).is_empty());
    assert!(coordinator.pending(&identity("app_db")).is_empty());
    assert!(coordinator.release(&writer).is_empty());
    assert_eq!(coordinator.active_write(&identity("app_db")), None);
}

#[test]
fn shutdown_returns_active_and_pending_requests() {
    let mut coordinator = LockCoordinator::new();
    coordinator.acquire(request(1, "app_db", false));
    coordinator.acquire(request(2, "app_db", true));
    coordinator.acquire(request(3, "other", true));

    let mut drained = ids(&coordinator.shutdown());
    drained.sort_unstable();
    assert_eq!(drained, vec![1, 2, 3]);
    assert!(coordinator.active_reads(&identity("other")).is_empty());
    assert_eq!(coordinator.active_write(&identity("app_db")), None);
}

// ============================================================================
// SECTION: Properties
// ============================================================================

proptest! {
    #[test]
    fn writer_never_overlaps_other_holders(ops in prop::collection::vec((any::<bool>(), any::<bool>()), 1..64)) {
        let mut coordinator = LockCoordinator::new();
        let target = identity("app_db");
        let mut held: Vec<LockRequest> = Vec::new();
        let mut next = 1_u64;

        for (acquire, read_only) in ops {
            if acquire || held.is_empty() {
                let granted = coordinator.acquire(request(next, "app_db", read_only));
                held.extend(granted);
                next += 1;
            } else {
                let released = held.remove(0);
                held.extend(coordinator.release(&released));
            }

            let writer = coordinator.active_write(&target);
            let readers = coordinator.active_reads(&target);
            prop_assert!(writer.is_none() || readers.is_empty());
            prop_assert_eq!(held.len(), readers.len() + usize::from(writer.is_some()));
        }
    }
}
