// crates/originsql-core/src/runtime/coordinator.rs
// ============================================================================
// Module: OriginSQL Transaction Coordinator
// Description: Per-database reader/writer admission for transactions.
// Purpose: Decide which transactions may hold their database lock.
// Dependencies: crate::core
// ============================================================================

//! ## Overview
//! One [`LockCoordinator`] lives on each worker thread and is only touched
//! from that thread. Requests for the same database identity queue in FIFO
//! order; a run of consecutive read requests is admitted together, and a
//! write request is admitted alone once all readers have released.
//!
//! Readers keep being admitted while they keep arriving at the head of the
//! queue, so a steady stream of reads can delay a queued write indefinitely.
//!
//! # Invariants
//! - Per identity, at most one active writer, and never a writer alongside readers.
//! - No request is both pending and active.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::collections::VecDeque;

use crate::core::DatabaseIdentity;
use crate::core::DatabaseKey;
use crate::core::TransactionId;

// ============================================================================
// SECTION: Types
// ============================================================================

/// A transaction's request for its database lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    /// Handle that owns the transaction.
    pub database: DatabaseKey,
    /// Requesting transaction.
    pub transaction: TransactionId,
    /// Identity whose lock is requested.
    pub identity: DatabaseIdentity,
    /// True for read-only transactions.
    pub read_only: bool,
}

/// Queue and active sets for one identity.
#[derive(Debug, Default)]
struct CoordinationInfo {
    /// Requests waiting for admission in arrival order.
    pending: VecDeque<LockRequest>,
    /// Admitted writer, if any.
    active_write: Option<LockRequest>,
    /// Admitted readers.
    active_reads: Vec<LockRequest>,
}

impl CoordinationInfo {
    /// Returns true when nothing is pending or active.
    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.active_write.is_none() && self.active_reads.is_empty()
    }

    /// Admits whatever the head of the queue allows.
    fn process_pending(&mut self) -> Vec<LockRequest> {
        let mut granted = Vec::new();
        if self.active_write.is_some() {
            return granted;
        }
        while let Some(front) = self.pending.front() {
            if front.read_only {
                if let Some(request) = self.pending.pop_front() {
                    self.active_reads.push(request.clone());
                    granted.push(request);
                }
                continue;
            }
            if self.active_reads.is_empty()
                && let Some(request) = self.pending.pop_front()
            {
                self.active_write = Some(request.clone());
                granted.push(request);
            }
            break;
        }
        granted
    }
}

// ============================================================================
// SECTION: Coordinator
// ============================================================================

/// Reader/writer admission across every database on one worker.
#[derive(Debug, Default)]
pub struct LockCoordinator {
    /// Coordination state keyed by identity.
    databases: HashMap<DatabaseIdentity, CoordinationInfo>,
}

impl LockCoordinator {
    /// Creates an empty coordinator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `request` and returns every request admitted as a result.
    pub fn acquire(&mut self, request: LockRequest) -> Vec<LockRequest> {
        let info = self.databases.entry(request.identity.clone()).or_default();
        info.pending.push_back(request);
        info.process_pending()
    }

    /// Releases `request`, whether active or still pending, and returns every
    /// request admitted as a result.
    pub fn release(&mut self, request: &LockRequest) -> Vec<LockRequest> {
        let Some(info) = self.databases.get_mut(&request.identity) else {
            return Vec::new();
        };
        if info.active_write.as_ref().is_some_and(|active| active.transaction == request.transaction) {
            info.active_write = None;
        } else if let Some(index) =
            info.active_reads.iter().position(|active| active.transaction == request.transaction)
        {
            info.active_reads.swap_remove(index);
        } else {
            info.pending.retain(|pending| pending.transaction != request.transaction);
        }
        let granted = info.process_pending();
        if info.is_idle() {
            self.databases.remove(&request.identity);
        }
        granted
    }

    /// Clears all state and returns every pending and active request.
    pub fn shutdown(&mut self) -> Vec<LockRequest> {
        let mut requests = Vec::new();
        for (_, info) in self.databases.drain() {
            requests.extend(info.active_write);
            requests.extend(info.active_reads);
            requests.extend(info.pending);
        }
        requests
    }

    /// Returns the admitted readers for `identity`.
    #[must_use]
    pub fn active_reads(&self, identity: &DatabaseIdentity) -> Vec<TransactionId> {
        self.databases.get(identity).map_or_else(Vec::new, |info| {
            info.active_reads.iter().map(|request| request.transaction).collect()
        })
    }

    /// Returns the admitted writer for `identity`.
    #[must_use]
    pub fn active_write(&self, identity: &DatabaseIdentity) -> Option<TransactionId> {
        self.databases.get(identity)?.active_write.as_ref().map(|request| request.transaction)
    }

    /// Returns the queued requests for `identity` in admission order.
    #[must_use]
    pub fn pending(&self, identity: &DatabaseIdentity) -> Vec<TransactionId> {
        self.databases.get(identity).map_or_else(Vec::new, |info| {
            info.pending.iter().map(|request| request.transaction).collect()
        })
    }
}
