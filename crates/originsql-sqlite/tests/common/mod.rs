// crates/originsql-sqlite/tests/common/mod.rs
// ============================================================================
// Module: Test Harness
// Description: Shared setup for runtime tests against SQLite.
// Purpose: Build a tracker, caller queue, and context in a temp directory.
// ============================================================================

//! ## Overview
//! Builds a [`Harness`] around a temporary tracker directory and provides
//! helpers to wait for transaction outcomes on the test thread.

#![allow(
    dead_code,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::unwrap_in_result,
    clippy::panic_in_result_fn,
    reason = "Test-only assertions and helpers are permitted."
)]

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use originsql_core::CallbackResult;
use originsql_core::CallbackScheduler;
use originsql_core::CallerQueue;
use originsql_core::ContextOptions;
use originsql_core::DatabaseClient;
use originsql_core::DatabaseContext;
use originsql_core::DatabaseEventSink;
use originsql_core::NoopDatabaseClient;
use originsql_core::NoopEventSink;
use originsql_core::OriginId;
use originsql_core::SqlError;
use originsql_core::TransactionRequest;
use originsql_core::TransactionScope;
use originsql_sqlite::SqliteConnectionFactory;
use originsql_sqlite::SqliteDatabaseTracker;
use originsql_sqlite::SqliteEngineConfig;
use originsql_sqlite::TrackerConfig;
use tempfile::TempDir;

/// Upper bound for waiting on callbacks.
pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Final outcome of one transaction.
pub type Outcome = Arc<Mutex<Option<Result<(), SqlError>>>>;

/// Context plus collaborators; fields drop in declaration order.
pub struct Harness {
    pub context: DatabaseContext,
    pub queue: Arc<CallerQueue>,
    pub tracker: Arc<SqliteDatabaseTracker>,
    pub origin: OriginId,
    pub dir: TempDir,
}

/// Harness with a client that never grants more space.
pub fn harness() -> Harness {
    harness_with(|_| Arc::new(NoopDatabaseClient))
}

/// Harness whose client is built from the tracker.
pub fn harness_with(
    client: impl FnOnce(&Arc<SqliteDatabaseTracker>) -> Arc<dyn DatabaseClient>,
) -> Harness {
    build(client, |queue| Arc::clone(queue) as Arc<dyn CallbackScheduler>, Arc::new(NoopEventSink))
}

/// Harness whose deliveries go through `scheduler` and whose events go to `events`.
pub fn harness_observed(
    scheduler: impl FnOnce(&Arc<CallerQueue>) -> Arc<dyn CallbackScheduler>,
    events: Arc<dyn DatabaseEventSink>,
) -> Harness {
    build(|_| Arc::new(NoopDatabaseClient), scheduler, events)
}

/// Wires a tracker, caller queue, and context in a fresh directory.
fn build(
    client: impl FnOnce(&Arc<SqliteDatabaseTracker>) -> Arc<dyn DatabaseClient>,
    scheduler: impl FnOnce(&Arc<CallerQueue>) -> Arc<dyn CallbackScheduler>,
    events: Arc<dyn DatabaseEventSink>,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let tracker = Arc::new(SqliteDatabaseTracker::open(TrackerConfig::new(dir.path())).unwrap());
    let queue = Arc::new(CallerQueue::new());
    let origin = OriginId::from_parts("https", "example.com", 443).unwrap();
    let options = ContextOptions::new(
        origin.clone(),
        tracker.clone(),
        Arc::new(SqliteConnectionFactory::new(SqliteEngineConfig::default())),
        scheduler(&queue),
    )
    .client(client(&tracker))
    .events(events)
    .thread_name("originsql-test");
    let context = DatabaseContext::new(options).unwrap();
    Harness { context, queue, tracker, origin, dir }
}

/// Builds a request recording its outcome.
pub fn request(
    outcome: &Outcome,
    body: impl FnOnce(&mut TransactionScope) -> CallbackResult + Send + 'static,
) -> TransactionRequest {
    let failed = Arc::clone(outcome);
    let succeeded = Arc::clone(outcome);
    TransactionRequest::new(body)
        .on_error(move |error| *failed.lock().unwrap() = Some(Err(error.clone())))
        .on_success(move || *succeeded.lock().unwrap() = Some(Ok(())))
}

/// Creates an empty outcome slot.
pub fn outcome() -> Outcome {
    Arc::new(Mutex::new(None))
}

/// Pumps caller callbacks until `outcome` is filled.
pub fn wait(queue: &CallerQueue, outcome: &Outcome) -> Result<(), SqlError> {
    assert!(queue.run_until(TIMEOUT, || outcome.lock().unwrap().is_some()), "transaction timed out");
    outcome.lock().unwrap().clone().unwrap()
}
