// crates/originsql-core/src/runtime/database.rs
// ============================================================================
// Module: OriginSQL Database Handle
// Description: Caller-facing database handle and its worker-side backend.
// Purpose: Queue transactions, expose version state, and manage handle lifetime.
// Dependencies: crate::{core, interfaces, runtime}, tracing
// ============================================================================

//! ## Overview
//! A [`Database`] is the caller's handle to one open database. Its state is
//! split in two:
//! - [`DatabaseShared`] holds what both threads read: identity, versions,
//!   and the closed/deleted/interrupted flags.
//! - [`Backend`] lives only on the worker thread and owns the engine
//!   connection, the authorizer, and the handle's transaction queue.
//!
//! Transactions of one handle run one at a time, in submission order.
//! Dropping the last [`Database`] clone closes the handle once its queued
//! transactions have finished.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::mpsc;

use tracing::debug;
use tracing::warn;

use crate::core::AuthorizerBypass;
use crate::core::DATABASE_INFO_TABLE;
use crate::core::DatabaseAuthorizer;
use crate::core::DatabaseError;
use crate::core::DatabaseEvent;
use crate::core::DatabaseEventKind;
use crate::core::DatabaseIdentity;
use crate::core::DatabaseKey;
use crate::core::EngineError;
use crate::core::SharedAuthorizer;
use crate::core::SqlError;
use crate::core::SqlErrorCode;
use crate::interfaces::InterruptHandle;
use crate::interfaces::OpenDatabase;
use crate::interfaces::SqlConnection;
use crate::runtime::context::DatabaseServices;
use crate::runtime::coordinator::LockCoordinator;
use crate::runtime::thread::Task;
use crate::runtime::thread::TaskKind;
use crate::runtime::thread::WorkerControl;
use crate::runtime::transaction::StepContext;
use crate::runtime::transaction::Transaction;
use crate::runtime::transaction::TransactionRequest;
use crate::runtime::transaction::TransactionSeed;
use crate::runtime::version::ChangeVersionWrapper;
use crate::runtime::version::TransactionWrapper;
use crate::runtime::version::create_info_table;
use crate::runtime::version::info_table_exists;
use crate::runtime::version::read_stored_version;
use crate::runtime::version::write_stored_version;

// ============================================================================
// SECTION: Shared State
// ============================================================================

/// Handle state shared between the caller and the worker.
pub(crate) struct DatabaseShared {
    /// Worker key.
    key: DatabaseKey,
    /// Origin and name.
    identity: DatabaseIdentity,
    /// Display name given at open.
    display_name: String,
    /// Estimated size given at open.
    estimated_size: u64,
    /// Version the caller expects.
    expected_version: Mutex<String>,
    /// Last version read from or written to the database.
    cached_version: Mutex<String>,
    /// The info table was created by this open.
    is_new: AtomicBool,
    /// No new transactions are accepted.
    closing: AtomicBool,
    /// The worker released the backend.
    closed: AtomicBool,
    /// The database was deleted underneath the handle.
    deleted: AtomicBool,
    /// Statements are failed instead of executed.
    interrupted: AtomicBool,
    /// Engine interrupt, set while the backend is open.
    interrupt: Mutex<Option<Arc<dyn InterruptHandle>>>,
    /// Worker queue.
    worker: Arc<WorkerControl>,
    /// Context collaborators.
    services: Arc<DatabaseServices>,
}

impl DatabaseShared {
    /// Creates shared state for a handle about to be opened.
    pub(crate) fn new(
        key: DatabaseKey,
        identity: DatabaseIdentity,
        display_name: String,
        estimated_size: u64,
        expected_version: String,
        worker: Arc<WorkerControl>,
        services: Arc<DatabaseServices>,
    ) -> Self {
        Self {
            key,
            identity,
            display_name,
            estimated_size,
            expected_version: Mutex::new(expected_version),
            cached_version: Mutex::new(String::new()),
            is_new: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            interrupt: Mutex::new(None),
            worker,
            services,
        }
    }

    /// Returns the handle's identity.
    pub(crate) const fn identity(&self) -> &DatabaseIdentity {
        &self.identity
    }

    /// Returns the caller's expected version.
    pub(crate) fn expected_version(&self) -> String {
        self.expected_version.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replaces the caller's expected version.
    pub(crate) fn set_expected_version(&self, version: &str) {
        *self.expected_version.lock().unwrap_or_else(PoisonError::into_inner) =
            version.to_string();
    }

    /// Returns the cached version.
    pub(crate) fn cached_version(&self) -> String {
        self.cached_version.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replaces the cached version.
    pub(crate) fn set_cached_version(&self, version: &str) {
        *self.cached_version.lock().unwrap_or_else(PoisonError::into_inner) = version.to_string();
    }

    /// Returns true when the open created the database.
    pub(crate) fn is_new(&self) -> bool {
        self.is_new.load(Ordering::Acquire)
    }

    /// Returns true once the database was deleted.
    pub(crate) fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// Returns true once the handle was interrupted.
    pub(crate) fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Returns true once closing started.
    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Marks the handle interrupted and stops the running statement.
    pub(crate) fn interrupt_execution(&self) {
        self.interrupted.store(true, Ordering::Release);
        let handle = self.interrupt.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(handle) = handle {
            handle.interrupt();
        }
    }

    /// Queues a transaction on the worker.
    pub(crate) fn submit_transaction(&self, seed: TransactionSeed) {
        if self.is_closing() {
            seed.fail(
                self.services.scheduler.as_ref(),
                SqlError::new(SqlErrorCode::InvalidState, "database has been closed"),
            );
            return;
        }
        let task = Task::new(self.key, TaskKind::Enqueue { seed });
        if let Err(task) = self.worker.queue.submit(task)
            && let TaskKind::Enqueue { seed } = task.kind
        {
            seed.fail(
                self.services.scheduler.as_ref(),
                SqlError::new(
                    SqlErrorCode::ShutdownInterrupted,
                    "the database thread is shutting down",
                ),
            );
        }
    }

    /// Closes the handle, failing queued transactions, and waits for the worker.
    ///
    /// On the worker thread the close is queued instead of awaited.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::ShutdownInterrupted`] when the worker stopped
    /// before acknowledging the close.
    pub(crate) fn close_and_wait(&self) -> Result<(), DatabaseError> {
        self.closing.store(true, Ordering::Release);
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.worker.is_worker_thread() {
            let task = Task::new(self.key, TaskKind::Close { response: None });
            if self.worker.queue.submit_priority(task).is_err() {
                debug!(database = %self.identity, "close skipped during shutdown");
            }
            return Ok(());
        }
        if self.worker.is_stopping() {
            return Err(DatabaseError::ShutdownInterrupted);
        }
        let (sender, receiver) = mpsc::channel();
        let task = Task::new(self.key, TaskKind::Close { response: Some(sender) });
        self.worker.queue.submit_priority(task).map_err(|_| DatabaseError::ShutdownInterrupted)?;
        receiver.recv().map_err(|_| DatabaseError::ShutdownInterrupted)
    }

    /// Closes the handle once its queued transactions have finished.
    pub(crate) fn close_gracefully(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        let task = Task::new(self.key, TaskKind::CloseWhenIdle);
        if self.worker.queue.submit(task).is_err() {
            debug!(database = %self.identity, "graceful close skipped during shutdown");
        }
    }

    /// Lists the user tables of the database.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError`] when the handle is closed, the worker stopped,
    /// or the engine fails.
    pub(crate) fn table_names(&self) -> Result<Vec<String>, DatabaseError> {
        if self.is_closing() {
            return Err(DatabaseError::InvalidState("database has been closed".to_string()));
        }
        if self.worker.is_worker_thread() {
            return Err(DatabaseError::InvalidState(
                "table names cannot be read from the database thread".to_string(),
            ));
        }
        if self.worker.is_stopping() {
            return Err(DatabaseError::ShutdownInterrupted);
        }
        let (sender, receiver) = mpsc::channel();
        let task = Task::new(self.key, TaskKind::TableNames { response: sender });
        self.worker.queue.submit_priority(task).map_err(|_| DatabaseError::ShutdownInterrupted)?;
        receiver.recv().map_err(|_| DatabaseError::ShutdownInterrupted)?
    }
}

impl OpenDatabase for DatabaseShared {
    fn identity(&self) -> &DatabaseIdentity {
        &self.identity
    }

    fn key(&self) -> DatabaseKey {
        self.key
    }

    fn mark_as_deleted_and_close(&self) {
        self.deleted.store(true, Ordering::Release);
        self.interrupt_execution();
        if let Err(error) = self.close_and_wait() {
            warn!(database = %self.identity, error = %error, "close after delete failed");
        }
    }

    fn interrupt(&self) {
        self.interrupt_execution();
    }
}

// ============================================================================
// SECTION: Backend
// ============================================================================

/// Worker-owned half of an open handle.
pub(crate) struct Backend {
    /// Shared handle state.
    pub(crate) shared: Arc<DatabaseShared>,
    /// Engine connection.
    pub(crate) connection: Box<dyn SqlConnection>,
    /// Authorizer installed on the connection.
    pub(crate) authorizer: SharedAuthorizer,
    /// Transactions waiting behind the in-flight one.
    pub(crate) pending: VecDeque<Transaction>,
    /// Transaction currently owning the handle.
    pub(crate) in_flight: Option<Transaction>,
    /// Close once no transaction is in flight or pending.
    pub(crate) close_when_idle: bool,
}

impl Backend {
    /// Opens the engine connection and reconciles the stored version.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError`] when the connection cannot be opened, the
    /// info table cannot be prepared, or the stored version differs from a
    /// non-empty expected version.
    pub(crate) fn open(
        shared: Arc<DatabaseShared>,
        path: &Path,
        set_version_if_new: bool,
        services: &DatabaseServices,
    ) -> Result<Self, DatabaseError> {
        let authorizer = DatabaseAuthorizer::shared(services.policy.clone());
        let mut connection =
            services.connections.open(path, Arc::clone(&authorizer)).map_err(|error| {
                DatabaseError::InvalidState(format!("unable to open database: {}", error.message))
            })?;

        let exists = info_table_exists(connection.as_mut(), &authorizer).map_err(open_error)?;
        if !exists {
            initialize_info_table(connection.as_mut(), &authorizer).map_err(open_error)?;
        }
        shared.is_new.store(!exists, Ordering::Release);

        let expected = shared.expected_version();
        let mut actual = read_stored_version(connection.as_mut(), &authorizer).map_err(open_error)?;
        if actual.is_empty() && (exists || set_version_if_new) {
            write_stored_version(connection.as_mut(), &authorizer, &expected)
                .map_err(open_error)?;
            actual.clone_from(&expected);
        }
        let verify = exists || set_version_if_new;
        if verify && !expected.is_empty() && actual != expected {
            return Err(DatabaseError::VersionMismatch { expected, actual });
        }

        shared.set_cached_version(&actual);
        *shared.interrupt.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(connection.interrupt_handle());
        debug!(database = %shared.identity, is_new = !exists, "database backend opened");

        Ok(Self {
            shared,
            connection,
            authorizer,
            pending: VecDeque::new(),
            in_flight: None,
            close_when_idle: false,
        })
    }

    /// Runs the in-flight transaction; returns true when it finished.
    pub(crate) fn run_in_flight(
        &mut self,
        coordinator: &mut LockCoordinator,
        worker: &Arc<WorkerControl>,
        services: &Arc<DatabaseServices>,
    ) -> bool {
        let Some(txn) = self.in_flight.as_mut() else {
            return true;
        };
        let mut ctx = StepContext {
            connection: &mut *self.connection,
            authorizer: &self.authorizer,
            database: &self.shared,
            coordinator,
            worker,
            services,
        };
        txn.run(&mut ctx);
        if txn.is_finished() {
            self.in_flight = None;
            return true;
        }
        debug!(transaction = %txn.id(), state = %txn.state(), "transaction waiting");
        false
    }

    /// Lists user tables, hiding the info table.
    pub(crate) fn table_names(&mut self) -> Result<Vec<String>, DatabaseError> {
        let _bypass = AuthorizerBypass::new(&self.authorizer);
        let names = self.connection.table_names()?;
        Ok(names.into_iter().filter(|name| name != DATABASE_INFO_TABLE).collect())
    }

    /// Unregisters the handle and drops the connection.
    pub(crate) fn finish_close(self, services: &DatabaseServices) {
        let shared = self.shared;
        *shared.interrupt.lock().unwrap_or_else(PoisonError::into_inner) = None;
        drop(self.connection);
        shared.closing.store(true, Ordering::Release);
        shared.closed.store(true, Ordering::Release);
        services.tracker.remove_open_database(&shared.identity, shared.key);
        services
            .events
            .record(&DatabaseEvent::new(DatabaseEventKind::DatabaseClosed).with_identity(&shared.identity));
        debug!(database = %shared.identity, "database backend closed");
    }
}

/// Creates the info table inside its own engine transaction.
fn initialize_info_table(
    connection: &mut dyn SqlConnection,
    authorizer: &SharedAuthorizer,
) -> Result<(), EngineError> {
    let _bypass = AuthorizerBypass::new(authorizer);
    connection.begin(false)?;
    if let Err(error) = create_info_table(connection, authorizer) {
        let _ = connection.rollback();
        return Err(error);
    }
    connection.commit()
}

/// Maps an engine failure during open.
fn open_error(error: EngineError) -> DatabaseError {
    DatabaseError::InvalidState(format!("unable to open database: {}", error.message))
}

// ============================================================================
// SECTION: Database Handle
// ============================================================================

/// Closes the handle gracefully when the last [`Database`] clone drops.
struct HandleRef {
    /// Shared handle state.
    shared: Arc<DatabaseShared>,
}

impl Drop for HandleRef {
    fn drop(&mut self) {
        self.shared.close_gracefully();
    }
}

/// Caller handle to an open database.
///
/// Clones share one handle. Transactions report through their callbacks on
/// the thread served by the context's [`crate::CallbackScheduler`].
#[derive(Clone)]
pub struct Database {
    /// Shared handle, closed gracefully on last drop.
    handle: Arc<HandleRef>,
}

impl Database {
    /// Wraps opened shared state.
    pub(crate) fn from_shared(shared: Arc<DatabaseShared>) -> Self {
        Self { handle: Arc::new(HandleRef { shared }) }
    }

    /// Returns the shared state.
    pub(crate) fn shared(&self) -> &Arc<DatabaseShared> {
        &self.handle.shared
    }

    /// Queues a read-write transaction.
    pub fn transaction(&self, request: TransactionRequest) {
        self.submit(request, false, None);
    }

    /// Queues a read-only transaction.
    pub fn read_transaction(&self, request: TransactionRequest) {
        self.submit(request, true, None);
    }

    /// Queues a transaction that moves the version from `old_version` to `new_version`.
    pub fn change_version(
        &self,
        old_version: impl Into<String>,
        new_version: impl Into<String>,
        request: TransactionRequest,
    ) {
        let wrapper = ChangeVersionWrapper::new(old_version, new_version);
        self.submit(request, false, Some(Box::new(wrapper)));
    }

    /// Queues a transaction decorated with a custom wrapper.
    pub fn wrapped_transaction(
        &self,
        request: TransactionRequest,
        wrapper: Box<dyn TransactionWrapper>,
    ) {
        self.submit(request, false, Some(wrapper));
    }

    /// Returns the cached version.
    #[must_use]
    pub fn version(&self) -> String {
        self.shared().cached_version()
    }

    /// Returns the version the caller expects.
    #[must_use]
    pub fn expected_version(&self) -> String {
        self.shared().expected_version()
    }

    /// Returns true when opening created the database.
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.shared().is_new()
    }

    /// Returns the origin and name.
    #[must_use]
    pub fn identity(&self) -> &DatabaseIdentity {
        &self.shared().identity
    }

    /// Returns the database name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared().identity.name
    }

    /// Returns the display name given at open.
    #[must_use]
    pub fn display_name(&self) -> &str {
        &self.shared().display_name
    }

    /// Returns the estimated size given at open.
    #[must_use]
    pub fn estimated_size(&self) -> u64 {
        self.shared().estimated_size
    }

    /// Returns true once the database was deleted.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.shared().is_deleted()
    }

    /// Returns true once the handle stopped accepting transactions.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared().is_closing()
    }

    /// Lists the user tables.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError`] when the handle is closed or the engine fails.
    pub fn table_names(&self) -> Result<Vec<String>, DatabaseError> {
        self.shared().table_names()
    }

    /// Stops the running statement and fails later ones.
    pub fn interrupt(&self) {
        self.shared().interrupt_execution();
    }

    /// Closes the handle now, failing its queued transactions.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::ShutdownInterrupted`] when the worker stopped first.
    pub fn close(&self) -> Result<(), DatabaseError> {
        self.shared().close_and_wait()
    }

    /// Wraps a request for the worker.
    fn submit(
        &self,
        request: TransactionRequest,
        read_only: bool,
        wrapper: Option<Box<dyn TransactionWrapper>>,
    ) {
        self.shared().submit_transaction(TransactionSeed { request, read_only, wrapper });
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("identity", &self.shared().identity)
            .field("version", &self.version())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
