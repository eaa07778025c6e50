// crates/originsql-sqlite/tests/database_runtime.rs
// ============================================================================
// Module: Database Runtime Tests
// Description: End-to-end transactions against SQLite databases.
// Purpose: Validate open, versioning, quota, commit, and shutdown behavior.
// ============================================================================

//! ## Overview
//! Drives the full runtime: a tracker directory, the worker thread, and a
//! caller queue pumped on the test thread.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::missing_docs_in_private_items,
    reason = "Test-only assertions and helpers are permitted."
)]

mod common;

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use common::TIMEOUT;
use common::harness;
use common::harness_observed;
use common::harness_with;
use common::outcome;
use common::request;
use common::wait;
use originsql_core::CallbackScheduler;
use originsql_core::CallerQueue;
use originsql_core::CallerTask;
use originsql_core::DatabaseClient;
use originsql_core::DatabaseDetails;
use originsql_core::DatabaseError;
use originsql_core::DatabaseEvent;
use originsql_core::DatabaseEventKind;
use originsql_core::DatabaseEventSink;
use originsql_core::DatabaseIdentity;
use originsql_core::OpenRequest;
use originsql_core::SqlErrorCode;
use originsql_core::SqlValue;
use originsql_core::Statement;
use originsql_core::TransactionScope;
use originsql_sqlite::SqliteDatabaseTracker;

/// Client that raises the origin quota when asked.
struct GrantingClient {
    tracker: Arc<SqliteDatabaseTracker>,
    quota: u64,
    calls: Arc<AtomicUsize>,
}

impl DatabaseClient for GrantingClient {
    fn exceeded_database_quota(&self, identity: &DatabaseIdentity, _details: &DatabaseDetails) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.tracker.set_quota(&identity.origin, self.quota).unwrap();
    }
}

/// Client that raises the origin quota by a fixed step on every call.
struct SteppingClient {
    tracker: Arc<SqliteDatabaseTracker>,
    step: u64,
    calls: Arc<AtomicUsize>,
}

impl DatabaseClient for SteppingClient {
    fn exceeded_database_quota(&self, identity: &DatabaseIdentity, _details: &DatabaseDetails) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let quota = self.tracker.quota_for_origin(&identity.origin).unwrap();
        self.tracker.set_quota(&identity.origin, quota + self.step).unwrap();
    }
}

/// Scheduler that runs its first `inline` deliveries on the posting thread,
/// queues the rest for the caller, and counts every post.
struct GatedScheduler {
    queue: Arc<CallerQueue>,
    inline: AtomicUsize,
    posted: Arc<AtomicUsize>,
}

impl GatedScheduler {
    /// Builds a scheduler over `queue`.
    fn shared(
        queue: &Arc<CallerQueue>,
        inline: usize,
        posted: Arc<AtomicUsize>,
    ) -> Arc<dyn CallbackScheduler> {
        Arc::new(Self { queue: Arc::clone(queue), inline: AtomicUsize::new(inline), posted })
    }
}

impl CallbackScheduler for GatedScheduler {
    fn post(&self, task: CallerTask) -> bool {
        self.posted.fetch_add(1, Ordering::SeqCst);
        if self.inline.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
        {
            task();
            return true;
        }
        self.queue.post(task)
    }
}

/// Event sink keeping every event in memory.
#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<DatabaseEvent>>,
}

impl RecordingSink {
    /// Counts recorded events of `kind`.
    fn count(&self, kind: DatabaseEventKind) -> usize {
        self.events.lock().unwrap().iter().filter(|event| event.event == kind).count()
    }
}

impl DatabaseEventSink for RecordingSink {
    fn record(&self, event: &DatabaseEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Waits until `counter` reaches `target` without pumping the caller queue.
fn wait_for_count(counter: &AtomicUsize, target: usize) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while counter.load(Ordering::SeqCst) < target {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
    true
}

// ============================================================================
// SECTION: Open
// ============================================================================

#[test]
fn new_database_reports_is_new_and_writes_expected_version() {
    let h = harness();
    let db = h.context.open_database(OpenRequest::new("notes").expected_version("1.0")).unwrap();
    assert!(db.is_new());
    assert_eq!(db.version(), "1.0");
    db.close().unwrap();

    let reopened =
        h.context.open_database(OpenRequest::new("notes").expected_version("1.0")).unwrap();
    assert!(!reopened.is_new());
    assert_eq!(reopened.version(), "1.0");
}

#[test]
fn open_with_a_different_expected_version_is_rejected() {
    let h = harness();
    let db = h.context.open_database(OpenRequest::new("notes").expected_version("1.0")).unwrap();
    db.close().unwrap();

    let error = h
        .context
        .open_database(OpenRequest::new("notes").expected_version("2.0"))
        .unwrap_err();
    assert_eq!(error, DatabaseError::VersionMismatch {
        expected: "2.0".to_string(),
        actual: "1.0".to_string(),
    });
}

#[test]
fn creation_callback_runs_only_for_new_databases() {
    let h = harness();
    let created = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&created);
    let db = h
        .context
        .open_database(OpenRequest::new("notes").creation_callback(move |_db| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
    assert!(h.queue.run_until(TIMEOUT, || created.load(Ordering::SeqCst) == 1));
    db.close().unwrap();

    let counter = Arc::clone(&created);
    let _reopened = h
        .context
        .open_database(OpenRequest::new("notes").creation_callback(move |_db| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
    h.queue.run_pending();
    assert_eq!(created.load(Ordering::SeqCst), 1);
}

#[test]
fn creation_callback_leaves_the_version_to_the_callback() {
    let h = harness();
    let db = h
        .context
        .open_database(
            OpenRequest::new("notes").expected_version("1.0").creation_callback(|_db| {}),
        )
        .unwrap();
    assert!(db.is_new());
    assert_eq!(db.version(), "");
    assert_eq!(db.expected_version(), "");

    let upgraded = outcome();
    db.change_version("", "1.0", request(&upgraded, |_scope| Ok(())));
    wait(&h.queue, &upgraded).unwrap();
    assert_eq!(db.version(), "1.0");
    db.close().unwrap();

    let reopened =
        h.context.open_database(OpenRequest::new("notes").expected_version("1.0")).unwrap();
    assert!(!reopened.is_new());
    assert_eq!(reopened.version(), "1.0");
}

// ============================================================================
// SECTION: Statements
// ============================================================================

#[test]
fn statements_run_in_order_and_deliver_rows() {
    let h = harness();
    let db = h.context.open_database(OpenRequest::new("notes")).unwrap();
    let rows = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&rows);
    let done = outcome();
    db.transaction(request(&done, move |scope| {
        scope.execute_sql("CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT)", []);
        scope.execute(Statement::new("INSERT INTO notes (body) VALUES (?)").bind("first").on_success(
            |_scope, result| {
                assert_eq!(result.rows_affected, 1);
                assert_eq!(result.insert_id, Some(1));
                Ok(())
            },
        ));
        scope.execute_sql("INSERT INTO notes (body) VALUES (?)", [SqlValue::from("second")]);
        scope.execute(Statement::new("SELECT body FROM notes ORDER BY id").on_success(
            move |_scope, result| {
                let mut seen = seen.lock().unwrap();
                for row in 0..result.len() {
                    seen.push(result.value(row, "body").cloned());
                }
                Ok(())
            },
        ));
        Ok(())
    }));
    wait(&h.queue, &done).unwrap();
    assert_eq!(*rows.lock().unwrap(), vec![
        Some(SqlValue::Text("first".to_string())),
        Some(SqlValue::Text("second".to_string())),
    ]);
    assert_eq!(db.table_names().unwrap(), vec!["notes".to_string()]);
}

#[test]
fn transactions_on_one_handle_complete_in_submission_order() {
    let h = harness();
    let db = h.context.open_database(OpenRequest::new("notes")).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));
    let outcomes: Vec<_> = (0..3).map(|_| outcome()).collect();
    for (index, done) in outcomes.iter().enumerate() {
        let order = Arc::clone(&order);
        db.transaction(request(done, move |scope| {
            order.lock().unwrap().push(index);
            scope.execute_sql("CREATE TABLE IF NOT EXISTS log (n INTEGER)", []);
            Ok(())
        }));
    }
    for done in &outcomes {
        wait(&h.queue, done).unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
}

#[test]
fn statement_error_callback_returning_false_keeps_the_transaction() {
    let h = harness();
    let db = h.context.open_database(OpenRequest::new("notes")).unwrap();
    let done = outcome();
    db.transaction(request(&done, |scope| {
        scope.execute(Statement::new("SELECT * FROM missing").on_error(|_scope, error| {
            assert_eq!(error.code, SqlErrorCode::Syntax);
            false
        }));
        scope.execute_sql("CREATE TABLE kept (n INTEGER)", []);
        Ok(())
    }));
    wait(&h.queue, &done).unwrap();
    assert_eq!(db.table_names().unwrap(), vec!["kept".to_string()]);
}

#[test]
fn argument_count_mismatch_fails_the_transaction() {
    let h = harness();
    let db = h.context.open_database(OpenRequest::new("notes")).unwrap();
    let done = outcome();
    db.transaction(request(&done, |scope| {
        scope.execute_sql("CREATE TABLE t (a INTEGER, b INTEGER)", []);
        scope.execute_sql("INSERT INTO t VALUES (?, ?)", [SqlValue::Integer(1)]);
        Ok(())
    }));
    let error = wait(&h.queue, &done).unwrap_err();
    assert_eq!(error.code, SqlErrorCode::Syntax);
    assert!(db.table_names().unwrap().is_empty());
}

#[test]
fn failing_transaction_callback_reports_unknown_error() {
    let h = harness();
    let db = h.context.open_database(OpenRequest::new("notes")).unwrap();
    let done = outcome();
    db.transaction(request(&done, |_scope| Err(originsql_core::CallbackError::new("boom"))));
    let error = wait(&h.queue, &done).unwrap_err();
    assert_eq!(error.code, SqlErrorCode::Unknown);
}

// ============================================================================
// SECTION: Authorization
// ============================================================================

#[test]
fn read_transactions_cannot_write() {
    let h = harness();
    let db = h.context.open_database(OpenRequest::new("notes")).unwrap();
    let setup = outcome();
    db.transaction(request(&setup, |scope| {
        scope.execute_sql("CREATE TABLE t (n INTEGER)", []);
        Ok(())
    }));
    wait(&h.queue, &setup).unwrap();

    let done = outcome();
    db.read_transaction(request(&done, |scope| {
        assert!(scope.is_read_only());
        scope.execute_sql("INSERT INTO t VALUES (1)", []);
        Ok(())
    }));
    let error = wait(&h.queue, &done).unwrap_err();
    assert_eq!(error.code, SqlErrorCode::Syntax);
}

#[test]
fn caller_sql_cannot_touch_the_info_table_or_transactions() {
    let h = harness();
    let db = h.context.open_database(OpenRequest::new("notes")).unwrap();
    for sql in [
        format!("SELECT * FROM {}", originsql_core::DATABASE_INFO_TABLE),
        "COMMIT".to_string(),
        "PRAGMA user_version = 3".to_string(),
    ] {
        let done = outcome();
        db.transaction(request(&done, move |scope| {
            scope.execute_sql(sql, []);
            Ok(())
        }));
        let error = wait(&h.queue, &done).unwrap_err();
        assert_eq!(error.code, SqlErrorCode::Syntax, "{error:?}");
    }
    assert!(db.table_names().unwrap().is_empty());
}

// ============================================================================
// SECTION: Versioning
// ============================================================================

#[test]
fn change_version_on_a_stale_handle_reports_mismatch() {
    let h = harness();
    let first = h.context.open_database(OpenRequest::new("notes").expected_version("1.0")).unwrap();
    let second = h.context.open_database(OpenRequest::new("notes").expected_version("1.0")).unwrap();

    let moved = outcome();
    second.change_version("1.0", "0.9", request(&moved, |_scope| Ok(())));
    wait(&h.queue, &moved).unwrap();
    assert_eq!(second.version(), "0.9");
    assert_eq!(second.expected_version(), "0.9");

    let stale = outcome();
    first.change_version("1.0", "2.0", request(&stale, |_scope| Ok(())));
    let error = wait(&h.queue, &stale).unwrap_err();
    assert_eq!(error.code, SqlErrorCode::VersionMismatch);
    assert_eq!(first.version(), "1.0");
}

#[test]
fn statements_on_a_mismatched_handle_are_blocked() {
    let h = harness();
    let first = h.context.open_database(OpenRequest::new("notes").expected_version("1.0")).unwrap();
    let second = h.context.open_database(OpenRequest::new("notes").expected_version("1.0")).unwrap();
    let moved = outcome();
    second.change_version("1.0", "1.1", request(&moved, |_scope| Ok(())));
    wait(&h.queue, &moved).unwrap();

    let done = outcome();
    first.transaction(request(&done, |scope| {
        scope.execute_sql("CREATE TABLE t (n INTEGER)", []);
        Ok(())
    }));
    let error = wait(&h.queue, &done).unwrap_err();
    assert_eq!(error.code, SqlErrorCode::VersionMismatch);
}

#[test]
fn change_version_keeps_the_old_version_when_commit_fails() {
    let h = harness();
    let db = h.context.open_database(OpenRequest::new("notes").expected_version("1.0")).unwrap();
    let setup = outcome();
    db.transaction(request(&setup, |scope| {
        scope.execute_sql("CREATE TABLE parent (id INTEGER PRIMARY KEY)", []);
        scope.execute_sql(
            "CREATE TABLE child (pid INTEGER REFERENCES parent(id) DEFERRABLE INITIALLY DEFERRED)",
            [],
        );
        Ok(())
    }));
    wait(&h.queue, &setup).unwrap();

    let upgrade = outcome();
    db.change_version("1.0", "2.0", request(&upgrade, |scope| {
        scope.execute_sql("INSERT INTO child (pid) VALUES (42)", []);
        Ok(())
    }));
    let error = wait(&h.queue, &upgrade).unwrap_err();
    assert_eq!(error.code, SqlErrorCode::Database);
    assert_eq!(db.version(), "1.0");
    assert_eq!(db.expected_version(), "1.0");
    db.close().unwrap();

    let reopened =
        h.context.open_database(OpenRequest::new("notes").expected_version("1.0")).unwrap();
    assert_eq!(reopened.version(), "1.0");
}

// ============================================================================
// SECTION: Locking
// ============================================================================

/// Queues `SELECT 1` hops until `other` has started or `remaining` runs out.
fn poll_until_started(
    scope: &mut TransactionScope,
    other: Arc<AtomicBool>,
    overlapped: Arc<AtomicBool>,
    remaining: usize,
) {
    scope.execute(Statement::new("SELECT 1").on_success(move |scope, _rows| {
        if other.load(Ordering::SeqCst) {
            overlapped.store(true, Ordering::SeqCst);
        } else if remaining > 0 {
            poll_until_started(scope, other, overlapped, remaining - 1);
        }
        Ok(())
    }));
}

#[test]
fn concurrent_reads_share_the_lock_and_a_write_waits_for_both() {
    let h = harness();
    let first_reader = h.context.open_database(OpenRequest::new("notes")).unwrap();
    let second_reader = h.context.open_database(OpenRequest::new("notes")).unwrap();
    let writer = h.context.open_database(OpenRequest::new("notes")).unwrap();

    let second_started = Arc::new(AtomicBool::new(false));
    let overlapped = Arc::new(AtomicBool::new(false));
    let write_saw_reads_done = Arc::new(AtomicBool::new(false));

    let first = outcome();
    let (other, seen) = (Arc::clone(&second_started), Arc::clone(&overlapped));
    first_reader.read_transaction(request(&first, move |scope| {
        poll_until_started(scope, other, seen, 500);
        Ok(())
    }));

    let second = outcome();
    let started = Arc::clone(&second_started);
    second_reader.read_transaction(request(&second, move |scope| {
        started.store(true, Ordering::SeqCst);
        scope.execute_sql("SELECT 1", []);
        Ok(())
    }));

    let write = outcome();
    let (first_done, second_done) = (Arc::clone(&first), Arc::clone(&second));
    let saw = Arc::clone(&write_saw_reads_done);
    writer.transaction(request(&write, move |scope| {
        let reads_done =
            first_done.lock().unwrap().is_some() && second_done.lock().unwrap().is_some();
        saw.store(reads_done, Ordering::SeqCst);
        scope.execute_sql("CREATE TABLE t (n INTEGER)", []);
        Ok(())
    }));

    wait(&h.queue, &first).unwrap();
    wait(&h.queue, &second).unwrap();
    wait(&h.queue, &write).unwrap();
    assert!(overlapped.load(Ordering::SeqCst), "second read never ran alongside the first");
    assert!(write_saw_reads_done.load(Ordering::SeqCst), "write started before reads finished");
}

// ============================================================================
// SECTION: Commit and Quota
// ============================================================================

#[test]
fn deferred_constraint_failure_at_commit_rolls_back() {
    let h = harness();
    let db = h.context.open_database(OpenRequest::new("notes")).unwrap();
    let setup = outcome();
    db.transaction(request(&setup, |scope| {
        scope.execute_sql("CREATE TABLE parent (id INTEGER PRIMARY KEY)", []);
        scope.execute_sql(
            "CREATE TABLE child (pid INTEGER REFERENCES parent(id) DEFERRABLE INITIALLY DEFERRED)",
            [],
        );
        Ok(())
    }));
    wait(&h.queue, &setup).unwrap();

    let done = outcome();
    db.transaction(request(&done, |scope| {
        scope.execute_sql("INSERT INTO child (pid) VALUES (42)", []);
        Ok(())
    }));
    let error = wait(&h.queue, &done).unwrap_err();
    assert_eq!(error.code, SqlErrorCode::Database);

    let count = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&count);
    let check = outcome();
    db.read_transaction(request(&check, move |scope| {
        scope.execute(Statement::new("SELECT COUNT(*) AS n FROM child").on_success(
            move |_scope, result| {
                *seen.lock().unwrap() = result.value(0, "n").cloned();
                Ok(())
            },
        ));
        Ok(())
    }));
    wait(&h.queue, &check).unwrap();
    assert_eq!(*count.lock().unwrap(), Some(SqlValue::Integer(0)));
}

/// Creates a blob table under the default quota, then shrinks the quota.
fn blob_table_over_quota(h: &common::Harness, db: &originsql_core::Database) {
    let setup = outcome();
    db.transaction(request(&setup, |scope| {
        scope.execute_sql("CREATE TABLE blobs (body BLOB NOT NULL)", []);
        Ok(())
    }));
    wait(&h.queue, &setup).unwrap();
    h.tracker.set_quota(&h.origin, 1).unwrap();
}

/// Counts the rows of `blobs`.
fn blob_count(h: &common::Harness, db: &originsql_core::Database) -> Option<SqlValue> {
    let count = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&count);
    let check = outcome();
    db.read_transaction(request(&check, move |scope| {
        scope.execute(Statement::new("SELECT COUNT(*) AS n FROM blobs").on_success(
            move |_scope, result| {
                *seen.lock().unwrap() = result.value(0, "n").cloned();
                Ok(())
            },
        ));
        Ok(())
    }));
    wait(&h.queue, &check).unwrap();
    count.lock().unwrap().clone()
}

#[test]
fn quota_exhaustion_without_a_grant_rolls_back() {
    let h = harness();
    let db = h.context.open_database(OpenRequest::new("notes")).unwrap();
    blob_table_over_quota(&h, &db);

    let done = outcome();
    db.transaction(request(&done, |scope| {
        scope.execute_sql("INSERT INTO blobs (body) SELECT zeroblob(65536)", []);
        Ok(())
    }));
    let error = wait(&h.queue, &done).unwrap_err();
    assert_eq!(error.code, SqlErrorCode::QuotaExceeded);
    assert_eq!(blob_count(&h, &db), Some(SqlValue::Integer(0)));
}

#[test]
fn quota_grant_retries_the_failed_statement() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let h = harness_with(move |tracker| {
        Arc::new(GrantingClient {
            tracker: Arc::clone(tracker),
            quota: 10 * 1024 * 1024,
            calls: counter,
        })
    });
    let db = h.context.open_database(OpenRequest::new("notes")).unwrap();
    blob_table_over_quota(&h, &db);

    let done = outcome();
    db.transaction(request(&done, |scope| {
        scope.execute_sql("INSERT INTO blobs (body) SELECT zeroblob(65536)", []);
        Ok(())
    }));
    wait(&h.queue, &done).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(blob_count(&h, &db), Some(SqlValue::Integer(1)));
}

#[test]
fn quota_shortfall_retries_a_statement_only_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let h = harness_with(move |tracker| {
        Arc::new(SteppingClient { tracker: Arc::clone(tracker), step: 8 * 1024, calls: counter })
    });
    let db = h.context.open_database(OpenRequest::new("notes")).unwrap();
    blob_table_over_quota(&h, &db);
    let usage = h.tracker.usage_for_origin(&h.origin).unwrap();
    h.tracker.set_quota(&h.origin, usage).unwrap();

    let done = outcome();
    db.transaction(request(&done, |scope| {
        scope.execute_sql("INSERT INTO blobs (body) SELECT zeroblob(262144)", []);
        Ok(())
    }));
    let error = wait(&h.queue, &done).unwrap_err();
    assert_eq!(error.code, SqlErrorCode::QuotaExceeded);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(blob_count(&h, &db), Some(SqlValue::Integer(0)));
}

#[test]
fn declined_quota_statement_error_callback_can_continue() {
    let h = harness();
    let db = h.context.open_database(OpenRequest::new("notes")).unwrap();
    blob_table_over_quota(&h, &db);

    let reported = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&reported);
    let done = outcome();
    db.transaction(request(&done, move |scope| {
        scope.execute(Statement::new("INSERT INTO blobs (body) SELECT zeroblob(65536)").on_error(
            move |_scope, error| {
                *seen.lock().unwrap() = Some(error.code);
                false
            },
        ));
        Ok(())
    }));
    wait(&h.queue, &done).unwrap();
    assert_eq!(*reported.lock().unwrap(), Some(SqlErrorCode::QuotaExceeded));
}

#[test]
fn open_beyond_quota_consults_the_client_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let h = harness_with(move |tracker| {
        Arc::new(GrantingClient { tracker: Arc::clone(tracker), quota: 1024, calls: counter })
    });
    h.tracker.set_quota(&h.origin, 1024).unwrap();
    let error =
        h.context.open_database(OpenRequest::new("big").estimated_size(1024 * 1024)).unwrap_err();
    assert_eq!(error, DatabaseError::QuotaExceeded);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let identity = DatabaseIdentity::new(h.origin.clone(), "big");
    assert!(!h.tracker.is_being_created(&identity));
}

// ============================================================================
// SECTION: Close and Shutdown
// ============================================================================

#[test]
fn transactions_after_close_fail_with_invalid_state() {
    let h = harness();
    let db = h.context.open_database(OpenRequest::new("notes")).unwrap();
    db.close().unwrap();
    assert!(db.is_closed());

    let done = outcome();
    db.transaction(request(&done, |_scope| Ok(())));
    let error = wait(&h.queue, &done).unwrap_err();
    assert_eq!(error.code, SqlErrorCode::InvalidState);
    assert!(matches!(db.table_names(), Err(DatabaseError::InvalidState(_))));
}

#[test]
fn shutdown_fails_pending_work_and_refuses_new_opens() {
    let h = harness();
    let db = h.context.open_database(OpenRequest::new("notes")).unwrap();
    let pending = outcome();
    db.transaction(request(&pending, |scope| {
        scope.execute_sql("CREATE TABLE t (n INTEGER)", []);
        Ok(())
    }));
    h.context.stop();
    assert!(h.context.is_stopping());

    let error = wait(&h.queue, &pending).unwrap_err();
    assert_eq!(error.code, SqlErrorCode::ShutdownInterrupted);

    assert!(db.is_closed());
    let late = outcome();
    db.transaction(request(&late, |_scope| Ok(())));
    let error = wait(&h.queue, &late).unwrap_err();
    assert_eq!(error.code, SqlErrorCode::InvalidState);

    let refused = h.context.open_database(OpenRequest::new("other")).unwrap_err();
    assert_eq!(refused, DatabaseError::ShutdownInterrupted);
}

#[test]
fn shutdown_fails_the_lock_holder_and_the_write_queued_behind_it() {
    let posted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&posted);
    let sink = Arc::new(RecordingSink::default());
    let h = harness_observed(move |queue| GatedScheduler::shared(queue, 0, counter), sink.clone());
    let holder = h.context.open_database(OpenRequest::new("notes")).unwrap();
    let waiter = h.context.open_database(OpenRequest::new("notes")).unwrap();

    let held = outcome();
    holder.transaction(request(&held, |scope| {
        scope.execute_sql("CREATE TABLE a (n INTEGER)", []);
        Ok(())
    }));
    // The holder's callback delivery is parked on the caller queue with the lock held.
    assert!(wait_for_count(&posted, 1));
    let queued = outcome();
    waiter.transaction(request(&queued, |scope| {
        scope.execute_sql("CREATE TABLE b (n INTEGER)", []);
        Ok(())
    }));

    h.context.stop();
    assert_eq!(wait(&h.queue, &held).unwrap_err().code, SqlErrorCode::ShutdownInterrupted);
    assert_eq!(wait(&h.queue, &queued).unwrap_err().code, SqlErrorCode::ShutdownInterrupted);
    assert_eq!(sink.count(DatabaseEventKind::TransactionCommitted), 0);
}

#[test]
fn shutdown_after_commit_does_not_report_a_failure() {
    let posted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&posted);
    let sink = Arc::new(RecordingSink::default());
    let h = harness_observed(move |queue| GatedScheduler::shared(queue, 1, counter), sink.clone());
    let db = h.context.open_database(OpenRequest::new("notes")).unwrap();

    let done = outcome();
    db.transaction(request(&done, |scope| {
        scope.execute_sql("CREATE TABLE t (n INTEGER)", []);
        Ok(())
    }));
    // The transaction callback runs inline; the success delivery stays queued.
    assert!(wait_for_count(&posted, 2));
    h.context.stop();

    assert_eq!(sink.count(DatabaseEventKind::TransactionCommitted), 1);
    assert_eq!(sink.count(DatabaseEventKind::TransactionFailed), 0);
    assert!(done.lock().unwrap().is_none());
}
