// crates/originsql-core/src/runtime/transaction.rs
// ============================================================================
// Module: OriginSQL Transaction State Machine
// Description: Worker-side transaction lifecycle with caller-side callback delivery.
// Purpose: Run queued statements atomically and report outcomes through callbacks.
// Dependencies: crate::{core, interfaces, runtime}, tracing
// ============================================================================

//! ## Overview
//! A transaction walks a fixed state machine on its database's worker thread:
//! acquire the database lock, begin the engine transaction and preflight, run
//! statements, postflight and commit, then clean up. Every state whose name
//! starts with `Deliver` runs on the caller's thread instead: the worker moves
//! the relevant callback into a caller task, goes idle, and the caller task
//! resubmits a resume task carrying the next state the callback chose.
//!
//! # Invariants
//! - Caller callbacks never run on the worker thread.
//! - Two delivery states never run back to back on the worker without an idle
//!   hop through the caller.
//! - Statements run in the order they were queued.
//! - A transaction releases its lock request exactly once.
//! - Once the engine rolled a transaction back on its own, no statement error
//!   callback runs for it.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::PoisonError;

use tracing::debug;
use tracing::warn;

use crate::core::AuthorizerBypass;
use crate::core::DatabaseEvent;
use crate::core::DatabaseEventKind;
use crate::core::DatabaseIdentity;
use crate::core::DatabaseKey;
use crate::core::SharedAuthorizer;
use crate::core::SqlError;
use crate::core::SqlErrorCode;
use crate::core::TransactionId;
use crate::interfaces::CallbackScheduler;
use crate::interfaces::CallerTask;
use crate::interfaces::SqlConnection;
use crate::runtime::context::DatabaseServices;
use crate::runtime::coordinator::LockCoordinator;
use crate::runtime::coordinator::LockRequest;
use crate::runtime::database::DatabaseShared;
use crate::runtime::statement::CallbackResult;
use crate::runtime::statement::ExecutionOutcome;
use crate::runtime::statement::QueuedStatement;
use crate::runtime::statement::Statement;
use crate::runtime::statement::StatementDelivery;
use crate::runtime::statement::TransactionScope;
use crate::runtime::thread::Task;
use crate::runtime::thread::TaskKind;
use crate::runtime::thread::WorkerControl;
use crate::runtime::version::TransactionWrapper;
use crate::runtime::version::VersionAccess;
use crate::runtime::version::read_stored_version;

// ============================================================================
// SECTION: States
// ============================================================================

/// States of the transaction state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    /// Waiting for the lock coordinator.
    AcquireLock,
    /// Begin the engine transaction and run the preflight checks.
    OpenAndPreflight,
    /// Execute queued statements.
    RunStatements,
    /// Run the postflight step and commit.
    PostflightAndCommit,
    /// Release resources after success.
    CleanupAndTerminate,
    /// Roll back and release resources after failure.
    CleanupAfterError,
    /// Run the transaction callback on the caller thread.
    DeliverTransactionCallback,
    /// Run the transaction error callback on the caller thread.
    DeliverTransactionErrorCallback,
    /// Run a statement callback on the caller thread.
    DeliverStatementCallback,
    /// Ask the client for more space on the caller thread.
    DeliverQuotaIncreaseCallback,
    /// Run the transaction success callback on the caller thread.
    DeliverSuccessCallback,
    /// Waiting for a task from the caller or the coordinator.
    Idle,
    /// Finished.
    End,
}

impl TransactionState {
    /// Returns true for states that run on the caller thread.
    #[must_use]
    pub const fn is_delivery(self) -> bool {
        matches!(
            self,
            Self::DeliverTransactionCallback
                | Self::DeliverTransactionErrorCallback
                | Self::DeliverStatementCallback
                | Self::DeliverQuotaIncreaseCallback
                | Self::DeliverSuccessCallback
        )
    }

    /// Returns a stable label for the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AcquireLock => "acquire_lock",
            Self::OpenAndPreflight => "open_and_preflight",
            Self::RunStatements => "run_statements",
            Self::PostflightAndCommit => "postflight_and_commit",
            Self::CleanupAndTerminate => "cleanup_and_terminate",
            Self::CleanupAfterError => "cleanup_after_error",
            Self::DeliverTransactionCallback => "deliver_transaction_callback",
            Self::DeliverTransactionErrorCallback => "deliver_transaction_error_callback",
            Self::DeliverStatementCallback => "deliver_statement_callback",
            Self::DeliverQuotaIncreaseCallback => "deliver_quota_increase_callback",
            Self::DeliverSuccessCallback => "deliver_success_callback",
            Self::Idle => "idle",
            Self::End => "end",
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// SECTION: Requests
// ============================================================================

/// Callback that queues the transaction's statements.
pub type TransactionCallback = Box<dyn FnOnce(&mut TransactionScope) -> CallbackResult + Send>;

/// Callback receiving the error that failed the transaction.
pub type TransactionErrorCallback = Box<dyn FnOnce(&SqlError) + Send>;

/// Callback run after a successful commit.
pub type TransactionSuccessCallback = Box<dyn FnOnce() + Send>;

/// A transaction as submitted by a caller.
pub struct TransactionRequest {
    /// Statement-queuing callback.
    callback: Option<TransactionCallback>,
    /// Error callback.
    on_error: Option<TransactionErrorCallback>,
    /// Success callback.
    on_success: Option<TransactionSuccessCallback>,
}

impl TransactionRequest {
    /// Creates a request whose callback queues statements.
    #[must_use]
    pub fn new(
        callback: impl FnOnce(&mut TransactionScope) -> CallbackResult + Send + 'static,
    ) -> Self {
        Self { callback: Some(Box::new(callback)), on_error: None, on_success: None }
    }

    /// Sets the error callback.
    #[must_use]
    pub fn on_error(mut self, callback: impl FnOnce(&SqlError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(callback));
        self
    }

    /// Sets the success callback.
    #[must_use]
    pub fn on_success(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_success = Some(Box::new(callback));
        self
    }

    /// Reports `error` through the error callback without running anything.
    pub(crate) fn fail(self, scheduler: &dyn CallbackScheduler, error: SqlError) {
        if let Some(callback) = self.on_error {
            let _ = scheduler.post(Box::new(move || callback(&error)));
        }
    }
}

/// A request plus the worker-side options chosen by the handle.
pub(crate) struct TransactionSeed {
    /// Caller request.
    pub(crate) request: TransactionRequest,
    /// True for read-only transactions.
    pub(crate) read_only: bool,
    /// Optional preflight and postflight hooks.
    pub(crate) wrapper: Option<Box<dyn TransactionWrapper>>,
}

impl TransactionSeed {
    /// Reports `error` for a transaction that never started.
    pub(crate) fn fail(self, scheduler: &dyn CallbackScheduler, error: SqlError) {
        self.request.fail(scheduler, error);
    }
}

// ============================================================================
// SECTION: Resume Messages
// ============================================================================

/// Decision computed on the caller thread and carried back to the worker.
pub(crate) struct Resume {
    /// State to re-enter.
    next: TransactionState,
    /// Statements queued by the callback.
    statements: Vec<Statement>,
    /// Error that failed the transaction, if any.
    error: Option<SqlError>,
    /// Retry the current statement after a quota increase.
    retry_statement: bool,
}

impl Resume {
    /// Resume at `next` with no side data.
    const fn at(next: TransactionState) -> Self {
        Self { next, statements: Vec::new(), error: None, retry_statement: false }
    }

    /// Fail the transaction with `error`.
    const fn fail(error: SqlError, has_error_callback: bool) -> Self {
        let next = if has_error_callback {
            TransactionState::DeliverTransactionErrorCallback
        } else {
            TransactionState::CleanupAfterError
        };
        Self { next, statements: Vec::new(), error: Some(error), retry_statement: false }
    }
}

/// Work moved to the caller thread for one delivery state.
enum Delivery {
    /// Run the transaction callback.
    Transaction {
        /// Callback, absent when the caller supplied none.
        callback: Option<TransactionCallback>,
        /// True for read-only transactions.
        read_only: bool,
        /// Whether an error callback is waiting on the worker.
        has_error_callback: bool,
    },
    /// Run a statement callback.
    Statement {
        /// Outcome and callbacks.
        statement: StatementDelivery,
        /// True for read-only transactions.
        read_only: bool,
        /// Whether an error callback is waiting on the worker.
        has_error_callback: bool,
    },
    /// Ask the client for more space.
    QuotaIncrease,
    /// Run the error callback.
    TransactionError {
        /// Error callback.
        callback: Option<TransactionErrorCallback>,
        /// Error to report.
        error: SqlError,
    },
    /// Run the success callback.
    Success {
        /// Success callback.
        callback: Option<TransactionSuccessCallback>,
    },
}

impl Delivery {
    /// Runs the callback on the caller thread and computes the next state.
    fn run(self, services: &DatabaseServices, identity: &DatabaseIdentity) -> Resume {
        match self {
            Self::Transaction { callback, read_only, has_error_callback } => {
                let mut scope = TransactionScope::new(read_only);
                let failed = callback.is_some_and(|callback| callback(&mut scope).is_err());
                if failed {
                    return Resume::fail(
                        SqlError::new(
                            SqlErrorCode::Unknown,
                            "the transaction callback failed",
                        ),
                        has_error_callback,
                    );
                }
                let mut resume = Resume::at(TransactionState::RunStatements);
                resume.statements = scope.into_statements();
                resume
            }
            Self::Statement { statement, read_only, has_error_callback } => {
                let mut scope = TransactionScope::new(read_only);
                let failed = match statement.outcome {
                    Some(Ok(rows)) => statement
                        .on_success
                        .is_some_and(|callback| callback(&mut scope, &rows).is_err()),
                    Some(Err(error)) => {
                        statement.on_error.is_none_or(|callback| callback(&mut scope, &error))
                    }
                    None => false,
                };
                if failed {
                    return Resume::fail(
                        SqlError::new(
                            SqlErrorCode::Unknown,
                            "the statement callback failed or the statement error callback \
                             did not return false",
                        ),
                        has_error_callback,
                    );
                }
                let mut resume = Resume::at(TransactionState::RunStatements);
                resume.statements = scope.into_statements();
                resume
            }
            Self::QuotaIncrease => {
                let before = services.tracker.maximum_size_for_database(identity);
                let details = services.tracker.details_for_database(identity);
                services.client.exceeded_database_quota(identity, &details);
                let after = services.tracker.maximum_size_for_database(identity);
                let mut resume = Resume::at(TransactionState::RunStatements);
                resume.retry_statement = after > before;
                resume
            }
            Self::TransactionError { callback, error } => {
                if let Some(callback) = callback {
                    callback(&error);
                }
                Resume::at(TransactionState::CleanupAfterError)
            }
            Self::Success { callback } => {
                if let Some(callback) = callback {
                    callback();
                }
                Resume::at(TransactionState::CleanupAndTerminate)
            }
        }
    }
}

// ============================================================================
// SECTION: Step Context
// ============================================================================

/// Worker-owned resources a transaction needs while it runs.
pub(crate) struct StepContext<'a> {
    /// Engine connection of the owning handle.
    pub(crate) connection: &'a mut dyn SqlConnection,
    /// Authorizer installed on the connection.
    pub(crate) authorizer: &'a SharedAuthorizer,
    /// Shared handle state.
    pub(crate) database: &'a Arc<DatabaseShared>,
    /// Worker lock coordinator.
    pub(crate) coordinator: &'a mut LockCoordinator,
    /// Worker queue and control block.
    pub(crate) worker: &'a Arc<WorkerControl>,
    /// Context collaborators.
    pub(crate) services: &'a Arc<DatabaseServices>,
}

impl StepContext<'_> {
    /// Schedules lock-acquired tasks for newly admitted requests.
    pub(crate) fn dispatch_grants(&self, granted: Vec<LockRequest>) {
        dispatch_grants(self.worker, granted);
    }
}

/// Schedules lock-acquired tasks for newly admitted requests.
pub(crate) fn dispatch_grants(worker: &WorkerControl, granted: Vec<LockRequest>) {
    for request in granted {
        let task = Task::new(request.database, TaskKind::LockAcquired {
            transaction: request.transaction,
        });
        if worker.queue.submit(task).is_err() {
            debug!(transaction = %request.transaction, "lock grant dropped during shutdown");
        }
    }
}

// ============================================================================
// SECTION: Transaction
// ============================================================================

/// A transaction owned by the worker thread.
pub(crate) struct Transaction {
    /// Worker-assigned identifier.
    id: TransactionId,
    /// Owning handle.
    key: DatabaseKey,
    /// Database identity.
    identity: DatabaseIdentity,
    /// True for read-only transactions.
    read_only: bool,
    /// State the machine enters next.
    next_state: TransactionState,
    /// Statement-queuing callback.
    callback: Option<TransactionCallback>,
    /// Error callback.
    error_callback: Option<TransactionErrorCallback>,
    /// Success callback.
    success_callback: Option<TransactionSuccessCallback>,
    /// Preflight and postflight hooks.
    wrapper: Option<Box<dyn TransactionWrapper>>,
    /// Statements not yet started.
    statements: VecDeque<QueuedStatement>,
    /// Statement being executed or delivered.
    current: Option<QueuedStatement>,
    /// Error that failed the transaction.
    error: Option<SqlError>,
    /// The lock request is queued or admitted.
    holds_lock_request: bool,
    /// Retry the current statement on the next run.
    retry_current_statement: bool,
    /// A statement changed the database.
    modified_database: bool,
    /// The stored version differed from the expected version at preflight.
    version_mismatch: bool,
    /// The engine transaction committed.
    committed: bool,
}

impl Transaction {
    /// Creates a transaction waiting to acquire its lock.
    pub(crate) fn new(
        id: TransactionId,
        key: DatabaseKey,
        identity: DatabaseIdentity,
        seed: TransactionSeed,
    ) -> Self {
        Self {
            id,
            key,
            identity,
            read_only: seed.read_only,
            next_state: TransactionState::AcquireLock,
            callback: seed.request.callback,
            error_callback: seed.request.on_error,
            success_callback: seed.request.on_success,
            wrapper: seed.wrapper,
            statements: VecDeque::new(),
            current: None,
            error: None,
            holds_lock_request: false,
            retry_current_statement: false,
            modified_database: false,
            version_mismatch: false,
            committed: false,
        }
    }

    /// Returns the transaction identifier.
    pub(crate) const fn id(&self) -> TransactionId {
        self.id
    }

    /// Returns the state the machine enters next.
    pub(crate) const fn state(&self) -> TransactionState {
        self.next_state
    }

    /// Returns true once the machine reached [`TransactionState::End`].
    pub(crate) fn is_finished(&self) -> bool {
        self.next_state == TransactionState::End
    }

    /// Runs worker states until the machine idles or ends.
    pub(crate) fn run(&mut self, ctx: &mut StepContext<'_>) {
        loop {
            let state = self.next_state;
            let next = match state {
                TransactionState::AcquireLock => self.acquire_lock(ctx),
                TransactionState::OpenAndPreflight => self.open_and_preflight(ctx),
                TransactionState::RunStatements => self.run_statements(ctx),
                TransactionState::PostflightAndCommit => self.postflight_and_commit(ctx),
                TransactionState::CleanupAndTerminate => self.cleanup_and_terminate(ctx),
                TransactionState::CleanupAfterError => self.cleanup_after_error(ctx),
                TransactionState::DeliverTransactionCallback
                | TransactionState::DeliverTransactionErrorCallback
                | TransactionState::DeliverStatementCallback
                | TransactionState::DeliverQuotaIncreaseCallback
                | TransactionState::DeliverSuccessCallback => self.schedule_delivery(state, ctx),
                TransactionState::Idle | TransactionState::End => return,
            };
            debug!(transaction = %self.id, from = %state, to = %next, "transaction step");
            self.next_state = next;
        }
    }

    /// Records that the coordinator admitted the lock request.
    pub(crate) fn lock_acquired(&mut self) {
        if self.next_state == TransactionState::Idle && self.holds_lock_request {
            self.next_state = TransactionState::OpenAndPreflight;
        }
    }

    /// Applies a caller-side decision.
    pub(crate) fn resume(&mut self, resume: Resume) {
        if self.next_state != TransactionState::Idle {
            warn!(transaction = %self.id, state = %self.next_state, "unexpected resume ignored");
            return;
        }
        self.statements.extend(resume.statements.into_iter().map(QueuedStatement::new));
        if let Some(error) = resume.error {
            self.error = Some(error);
        }
        self.retry_current_statement = resume.retry_statement;
        self.next_state = resume.next;
    }

    /// Rolls back, fails the transaction with `error`, and ends it.
    ///
    /// The error callback is posted without waiting for it. The lock request
    /// is released only when `release_lock` is set; coordinator shutdown has
    /// already discarded it otherwise.
    pub(crate) fn terminate(&mut self, ctx: &mut StepContext<'_>, error: SqlError, release_lock: bool) {
        self.rollback_if_open(ctx);
        self.statements.clear();
        self.current = None;
        if release_lock {
            self.release_lock(ctx);
        }
        self.holds_lock_request = false;
        self.callback = None;
        self.success_callback = None;
        self.wrapper = None;
        if !self.committed {
            ctx.services.events.record(
                &DatabaseEvent::new(DatabaseEventKind::TransactionFailed)
                    .with_identity(&self.identity)
                    .with_transaction(self.id)
                    .with_message(error.message.clone()),
            );
        }
        if let Some(callback) = self.error_callback.take() {
            let _ = ctx.services.scheduler.post(Box::new(move || callback(&error)));
        }
        self.next_state = TransactionState::End;
    }

    /// Reports `error` for a transaction that never left the handle queue.
    pub(crate) fn fail_unstarted(self, scheduler: &dyn CallbackScheduler, error: SqlError) {
        if let Some(callback) = self.error_callback {
            let _ = scheduler.post(Box::new(move || callback(&error)));
        }
    }

    // ------------------------------------------------------------------------
    // Worker states
    // ------------------------------------------------------------------------

    /// Queues the lock request; grants arrive as separate tasks.
    fn acquire_lock(&mut self, ctx: &mut StepContext<'_>) -> TransactionState {
        self.holds_lock_request = true;
        let granted = ctx.coordinator.acquire(self.lock_request());
        ctx.dispatch_grants(granted);
        TransactionState::Idle
    }

    /// Begins the engine transaction and checks versions.
    fn open_and_preflight(&mut self, ctx: &mut StepContext<'_>) -> TransactionState {
        if ctx.database.is_deleted() {
            self.error = Some(SqlError::new(
                SqlErrorCode::Unknown,
                "unable to open a transaction, because the user deleted the database",
            ));
            return self.handle_transaction_error();
        }
        if ctx.database.is_interrupted() {
            self.error = Some(SqlError::new(
                SqlErrorCode::Database,
                "unable to open a transaction, because the database was interrupted",
            ));
            return self.handle_transaction_error();
        }

        if !self.read_only {
            let maximum = ctx.services.tracker.maximum_size_for_database(&self.identity);
            let _bypass = AuthorizerBypass::new(ctx.authorizer);
            if let Err(error) = ctx.connection.set_maximum_size(maximum) {
                warn!(database = %self.identity, error = %error, "unable to apply maximum size");
            }
        }

        ctx.authorizer.lock().unwrap_or_else(PoisonError::into_inner).reset_deletes();
        let begun = {
            let _bypass = AuthorizerBypass::new(ctx.authorizer);
            ctx.connection.begin(self.read_only)
        };
        if let Err(error) = begun {
            self.error = Some(SqlError::with_engine(
                SqlErrorCode::Database,
                "unable to begin transaction",
                &error,
            ));
            return self.handle_transaction_error();
        }

        let actual = match read_stored_version(ctx.connection, ctx.authorizer) {
            Ok(version) => version,
            Err(error) => {
                self.error = Some(SqlError::with_engine(
                    SqlErrorCode::Database,
                    "unable to read version",
                    &error,
                ));
                self.rollback_if_open(ctx);
                return self.handle_transaction_error();
            }
        };
        let expected = ctx.database.expected_version();
        self.version_mismatch = !expected.is_empty() && expected != actual;

        if let Some(wrapper) = self.wrapper.as_mut() {
            let mut access = VersionAccess::new(ctx.connection, ctx.authorizer, ctx.database);
            if let Err(error) = wrapper.perform_preflight(&mut access) {
                self.error = Some(error);
                self.rollback_if_open(ctx);
                return self.handle_transaction_error();
            }
        }

        TransactionState::DeliverTransactionCallback
    }

    /// Executes statements until one needs the caller or the queue empties.
    fn run_statements(&mut self, ctx: &mut StepContext<'_>) -> TransactionState {
        loop {
            if self.retry_current_statement && ctx.connection.in_transaction() {
                self.retry_current_statement = false;
                if let Some(current) = self.current.as_mut() {
                    current.retried_after_quota = true;
                }
                let maximum = ctx.services.tracker.maximum_size_for_database(&self.identity);
                let _bypass = AuthorizerBypass::new(ctx.authorizer);
                if let Err(error) = ctx.connection.set_maximum_size(maximum) {
                    warn!(database = %self.identity, error = %error, "unable to apply maximum size");
                }
            } else {
                self.retry_current_statement = false;
                if self
                    .current
                    .as_mut()
                    .is_some_and(|current| std::mem::take(&mut current.failed_due_to_quota))
                {
                    return self.handle_current_statement_error(ctx);
                }
                self.current = self.statements.pop_front();
            }

            let blocked = self.statement_block(ctx);
            let read_only = self.read_only;
            let Some(current) = self.current.as_mut() else {
                return TransactionState::PostflightAndCommit;
            };
            match current.execute(ctx.connection, ctx.authorizer, read_only, blocked) {
                ExecutionOutcome::Succeeded { modified } => {
                    self.modified_database |= modified;
                    if current.has_success_callback() {
                        return TransactionState::DeliverStatementCallback;
                    }
                }
                ExecutionOutcome::Failed => {
                    if current.may_request_quota() {
                        ctx.services.events.record(
                            &DatabaseEvent::new(DatabaseEventKind::QuotaExceeded)
                                .with_identity(&self.identity)
                                .with_transaction(self.id),
                        );
                        return TransactionState::DeliverQuotaIncreaseCallback;
                    }
                    current.failed_due_to_quota = false;
                    return self.handle_current_statement_error(ctx);
                }
            }
        }
    }

    /// Runs the postflight step and commits.
    fn postflight_and_commit(&mut self, ctx: &mut StepContext<'_>) -> TransactionState {
        if let Some(wrapper) = self.wrapper.as_mut() {
            let mut access = VersionAccess::new(ctx.connection, ctx.authorizer, ctx.database);
            if let Err(error) = wrapper.perform_postflight(&mut access) {
                self.error = Some(error);
                return self.handle_transaction_error();
            }
        }

        let committed = {
            let _bypass = AuthorizerBypass::new(ctx.authorizer);
            ctx.connection.commit()
        };
        let failure = match committed {
            Err(error) => Some(SqlError::with_engine(
                SqlErrorCode::Database,
                "unable to commit transaction",
                &error,
            )),
            Ok(()) if ctx.connection.in_transaction() => {
                Some(SqlError::new(SqlErrorCode::Database, "unable to commit transaction"))
            }
            Ok(()) => None,
        };
        if let Some(error) = failure {
            if let Some(wrapper) = self.wrapper.as_mut() {
                let mut access = VersionAccess::new(ctx.connection, ctx.authorizer, ctx.database);
                wrapper.handle_commit_failed_after_postflight(&mut access);
            }
            self.success_callback = None;
            self.error = Some(error);
            return self.handle_transaction_error();
        }

        let had_deletes =
            ctx.authorizer.lock().unwrap_or_else(PoisonError::into_inner).had_deletes();
        if had_deletes {
            let _bypass = AuthorizerBypass::new(ctx.authorizer);
            if let Err(error) = ctx.connection.incremental_vacuum_if_needed() {
                warn!(database = %self.identity, error = %error, "incremental vacuum failed");
            }
        }
        if self.modified_database {
            ctx.services.tracker.database_changed(&self.identity);
        }
        ctx.services.events.record(
            &DatabaseEvent::new(DatabaseEventKind::TransactionCommitted)
                .with_identity(&self.identity)
                .with_transaction(self.id),
        );

        self.committed = true;
        self.error_callback = None;
        if self.success_callback.is_some() {
            TransactionState::DeliverSuccessCallback
        } else {
            TransactionState::CleanupAndTerminate
        }
    }

    /// Releases resources after a successful commit.
    fn cleanup_and_terminate(&mut self, ctx: &mut StepContext<'_>) -> TransactionState {
        self.release_lock(ctx);
        self.clear_callbacks();
        TransactionState::End
    }

    /// Rolls back and releases resources after a failure.
    fn cleanup_after_error(&mut self, ctx: &mut StepContext<'_>) -> TransactionState {
        self.rollback_if_open(ctx);
        self.statements.clear();
        self.current = None;
        self.release_lock(ctx);
        let message = self.error.as_ref().map_or_else(String::new, |error| error.message.clone());
        ctx.services.events.record(
            &DatabaseEvent::new(DatabaseEventKind::TransactionFailed)
                .with_identity(&self.identity)
                .with_transaction(self.id)
                .with_message(message),
        );
        self.clear_callbacks();
        TransactionState::End
    }

    // ------------------------------------------------------------------------
    // Delivery
    // ------------------------------------------------------------------------

    /// Moves the callback for `state` to the caller thread and idles.
    fn schedule_delivery(
        &mut self,
        state: TransactionState,
        ctx: &mut StepContext<'_>,
    ) -> TransactionState {
        let has_error_callback = self.error_callback.is_some();
        let delivery = match state {
            TransactionState::DeliverTransactionCallback => Delivery::Transaction {
                callback: self.callback.take(),
                read_only: self.read_only,
                has_error_callback,
            },
            TransactionState::DeliverStatementCallback => {
                let Some(current) = self.current.as_mut() else {
                    return TransactionState::RunStatements;
                };
                Delivery::Statement {
                    statement: current.take_for_delivery(),
                    read_only: self.read_only,
                    has_error_callback,
                }
            }
            TransactionState::DeliverQuotaIncreaseCallback => Delivery::QuotaIncrease,
            TransactionState::DeliverTransactionErrorCallback => Delivery::TransactionError {
                callback: self.error_callback.take(),
                error: self.error.clone().unwrap_or_else(|| {
                    SqlError::new(SqlErrorCode::Unknown, "the transaction failed")
                }),
            },
            _ => Delivery::Success { callback: self.success_callback.take() },
        };

        let worker = Arc::clone(ctx.worker);
        let services = Arc::clone(ctx.services);
        let identity = self.identity.clone();
        let key = self.key;
        let transaction = self.id;
        let task: CallerTask = Box::new(move || {
            let resume = delivery.run(&services, &identity);
            let task = Task::new(key, TaskKind::Resume { transaction, resume });
            if worker.queue.submit(task).is_err() {
                debug!(transaction = %transaction, "resume dropped during shutdown");
            }
        });
        if ctx.services.scheduler.post(task) {
            return TransactionState::Idle;
        }

        warn!(transaction = %self.id, state = %state, "caller scheduler rejected delivery");
        match state {
            TransactionState::DeliverQuotaIncreaseCallback => TransactionState::RunStatements,
            TransactionState::DeliverSuccessCallback => TransactionState::CleanupAndTerminate,
            _ => {
                self.error_callback = None;
                self.error = Some(SqlError::new(
                    SqlErrorCode::ShutdownInterrupted,
                    "the caller can no longer receive callbacks",
                ));
                TransactionState::CleanupAfterError
            }
        }
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    /// Builds this transaction's lock request.
    fn lock_request(&self) -> LockRequest {
        LockRequest {
            database: self.key,
            transaction: self.id,
            identity: self.identity.clone(),
            read_only: self.read_only,
        }
    }

    /// Releases the lock request once and dispatches resulting grants.
    fn release_lock(&mut self, ctx: &mut StepContext<'_>) {
        if !self.holds_lock_request {
            return;
        }
        self.holds_lock_request = false;
        let granted = ctx.coordinator.release(&self.lock_request());
        ctx.dispatch_grants(granted);
    }

    /// Rolls back the engine transaction when one is open.
    fn rollback_if_open(&self, ctx: &mut StepContext<'_>) {
        if !ctx.connection.in_transaction() {
            return;
        }
        let _bypass = AuthorizerBypass::new(ctx.authorizer);
        if let Err(error) = ctx.connection.rollback() {
            warn!(database = %self.identity, error = %error, "rollback failed");
        }
    }

    /// Chooses the error path for a transaction-level failure.
    fn handle_transaction_error(&self) -> TransactionState {
        if self.error_callback.is_some() {
            TransactionState::DeliverTransactionErrorCallback
        } else {
            TransactionState::CleanupAfterError
        }
    }

    /// Chooses the error path after the current statement failed.
    fn handle_current_statement_error(&mut self, ctx: &StepContext<'_>) -> TransactionState {
        let rolled_back_by_engine = !ctx.connection.in_transaction();
        if let Some(current) = self.current.as_ref() {
            if current.has_error_callback() && !rolled_back_by_engine {
                return TransactionState::DeliverStatementCallback;
            }
            self.error = current.error();
        }
        if self.error.is_none() {
            self.error =
                Some(SqlError::new(SqlErrorCode::Database, "the statement failed to execute"));
        }
        self.handle_transaction_error()
    }

    /// Error to report instead of executing the next statement, if any.
    fn statement_block(&self, ctx: &StepContext<'_>) -> Option<SqlError> {
        if ctx.database.is_interrupted() {
            return Some(SqlError::new(SqlErrorCode::Database, "the database was interrupted"));
        }
        if self.version_mismatch {
            return Some(SqlError::new(
                SqlErrorCode::VersionMismatch,
                "current version of the database and the expected version do not match",
            ));
        }
        None
    }

    /// Drops every caller callback still held.
    fn clear_callbacks(&mut self) {
        self.callback = None;
        self.error_callback = None;
        self.success_callback = None;
    }
}
