// crates/originsql-core/src/runtime/thread.rs
// ============================================================================
// Module: OriginSQL Database Thread
// Description: Dedicated worker thread owning every engine connection of a context.
// Purpose: Serialize engine access and drive transactions off the caller thread.
// Dependencies: crate::{core, interfaces, runtime}, tracing
// ============================================================================

//! ## Overview
//! Each [`crate::runtime::DatabaseContext`] runs one worker thread. The worker
//! pops tasks from its [`TaskQueue`] one at a time, so every engine
//! connection is only ever touched from this thread. The worker owns the open
//! backends, the [`LockCoordinator`], and the transaction id counter; nothing
//! else can reach them.
//!
//! Shutdown is cooperative. Killing the queue wakes the worker, which then
//! fails every pending or active transaction, closes every backend, and
//! signals any waiters.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::PoisonError;
use std::sync::mpsc;
use std::thread;
use std::thread::JoinHandle;
use std::thread::ThreadId;

use tracing::debug;

use crate::core::DatabaseError;
use crate::core::DatabaseEvent;
use crate::core::DatabaseEventKind;
use crate::core::DatabaseKey;
use crate::core::SqlError;
use crate::core::SqlErrorCode;
use crate::core::TransactionId;
use crate::runtime::context::DatabaseServices;
use crate::runtime::coordinator::LockCoordinator;
use crate::runtime::database::Backend;
use crate::runtime::database::DatabaseShared;
use crate::runtime::task_queue::TaskQueue;
use crate::runtime::transaction::Resume;
use crate::runtime::transaction::StepContext;
use crate::runtime::transaction::Transaction;
use crate::runtime::transaction::TransactionSeed;

// ============================================================================
// SECTION: Tasks
// ============================================================================

/// Work item for the database worker.
pub(crate) struct Task {
    /// Handle the task belongs to.
    pub(crate) database: DatabaseKey,
    /// Task payload.
    pub(crate) kind: TaskKind,
}

impl Task {
    /// Creates a task for `database`.
    pub(crate) const fn new(database: DatabaseKey, kind: TaskKind) -> Self {
        Self { database, kind }
    }
}

/// Task payloads.
pub(crate) enum TaskKind {
    /// Open the engine connection and verify the version.
    Open {
        /// Shared handle state.
        database: Arc<DatabaseShared>,
        /// Database file path.
        path: PathBuf,
        /// Write the expected version into a brand new database.
        set_version_if_new: bool,
        /// Synchronous reply.
        response: mpsc::Sender<Result<(), DatabaseError>>,
    },
    /// Close the handle, failing its queued transactions.
    Close {
        /// Synchronous reply, if the caller waits.
        response: Option<mpsc::Sender<()>>,
    },
    /// Close the handle once its queued transactions have finished.
    CloseWhenIdle,
    /// Queue a transaction on the handle.
    Enqueue {
        /// Transaction to queue.
        seed: TransactionSeed,
    },
    /// The coordinator admitted a lock request.
    LockAcquired {
        /// Admitted transaction.
        transaction: TransactionId,
    },
    /// A caller-side delivery finished.
    Resume {
        /// Resumed transaction.
        transaction: TransactionId,
        /// Caller decision.
        resume: Resume,
    },
    /// List user tables.
    TableNames {
        /// Synchronous reply.
        response: mpsc::Sender<Result<Vec<String>, DatabaseError>>,
    },
}

// ============================================================================
// SECTION: Worker Control
// ============================================================================

/// Shutdown bookkeeping guarded by one mutex.
#[derive(Default)]
struct ShutdownState {
    /// Senders signalled once the worker finishes.
    waiters: Vec<mpsc::Sender<()>>,
    /// Set once the worker has finished shutting down.
    finished: bool,
}

/// Queue and shutdown state shared by the worker and its producers.
pub(crate) struct WorkerControl {
    /// Tasks for the worker.
    pub(crate) queue: TaskQueue<Task>,
    /// Shutdown waiters.
    shutdown: Mutex<ShutdownState>,
    /// Worker thread id, set when the thread starts.
    thread: OnceLock<ThreadId>,
}

impl WorkerControl {
    /// Creates a live control block.
    fn new() -> Self {
        Self {
            queue: TaskQueue::new(),
            shutdown: Mutex::new(ShutdownState::default()),
            thread: OnceLock::new(),
        }
    }

    /// Returns true when called from the worker thread.
    pub(crate) fn is_worker_thread(&self) -> bool {
        self.thread.get().is_some_and(|id| *id == thread::current().id())
    }

    /// Returns true once shutdown was requested.
    pub(crate) fn is_stopping(&self) -> bool {
        self.queue.is_killed()
    }

    /// Marks the queue killed and registers `waiter` for the end of shutdown.
    pub(crate) fn request_shutdown(&self, waiter: Option<mpsc::Sender<()>>) {
        {
            let mut state = self.shutdown.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(waiter) = waiter {
                if state.finished {
                    let _ = waiter.send(());
                } else {
                    state.waiters.push(waiter);
                }
            }
        }
        self.queue.kill();
    }

    /// Removes queued tasks that belong to `database`.
    pub(crate) fn remove_tasks_for(&self, database: DatabaseKey) -> Vec<Task> {
        self.queue.remove_matching(|task| task.database == database)
    }

    /// Signals every waiter and remembers that shutdown finished.
    fn finish_shutdown(&self) {
        let waiters = {
            let mut state = self.shutdown.lock().unwrap_or_else(PoisonError::into_inner);
            state.finished = true;
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(());
        }
    }
}

// ============================================================================
// SECTION: Database Thread
// ============================================================================

/// Handle to a running worker thread.
pub(crate) struct DatabaseThread {
    /// Shared control block.
    control: Arc<WorkerControl>,
    /// Join handle, taken by the first join.
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DatabaseThread {
    /// Spawns the worker thread.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::Io`] when the thread cannot be spawned.
    pub(crate) fn start(name: &str, services: Arc<DatabaseServices>) -> Result<Self, DatabaseError> {
        let control = Arc::new(WorkerControl::new());
        let worker_control = Arc::clone(&control);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _ = worker_control.thread.set(thread::current().id());
                Worker::new(worker_control, services).run();
            })
            .map_err(|err| DatabaseError::Io(format!("failed to spawn database thread: {err}")))?;
        Ok(Self { control, handle: Mutex::new(Some(handle)) })
    }

    /// Returns the shared control block.
    pub(crate) const fn control(&self) -> &Arc<WorkerControl> {
        &self.control
    }

    /// Requests shutdown; `waiter` is signalled once the worker has finished.
    pub(crate) fn request_shutdown(&self, waiter: Option<mpsc::Sender<()>>) {
        self.control.request_shutdown(waiter);
    }

    /// Waits for the worker thread to exit; a no-op on the worker itself.
    pub(crate) fn join(&self) {
        if self.control.is_worker_thread() {
            return;
        }
        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            debug!("database thread panicked");
        }
    }
}

impl Drop for DatabaseThread {
    fn drop(&mut self) {
        self.request_shutdown(None);
        self.join();
    }
}

// ============================================================================
// SECTION: Worker
// ============================================================================

/// State owned by the worker thread.
struct Worker {
    /// Shared control block.
    control: Arc<WorkerControl>,
    /// Context collaborators.
    services: Arc<DatabaseServices>,
    /// Open backends by handle key.
    backends: HashMap<DatabaseKey, Backend>,
    /// Reader/writer admission.
    coordinator: LockCoordinator,
    /// Next transaction id.
    next_transaction: u64,
}

impl Worker {
    /// Creates worker state.
    fn new(control: Arc<WorkerControl>, services: Arc<DatabaseServices>) -> Self {
        Self {
            control,
            services,
            backends: HashMap::new(),
            coordinator: LockCoordinator::new(),
            next_transaction: 1,
        }
    }

    /// Runs tasks until the queue is killed, then shuts down.
    fn run(mut self) {
        while let Some(task) = self.control.queue.take() {
            self.run_task(task);
        }
        self.shut_down();
    }

    /// Dispatches one task.
    fn run_task(&mut self, task: Task) {
        let key = task.database;
        match task.kind {
            TaskKind::Open { database, path, set_version_if_new, response } => {
                let result = Backend::open(database, &path, set_version_if_new, &self.services);
                let reply = match result {
                    Ok(backend) => {
                        self.backends.insert(key, backend);
                        Ok(())
                    }
                    Err(error) => Err(error),
                };
                let _ = response.send(reply);
            }
            TaskKind::Close { response } => {
                self.close_backend(key, &closed_error());
                if let Some(response) = response {
                    let _ = response.send(());
                }
            }
            TaskKind::CloseWhenIdle => {
                if let Some(backend) = self.backends.get_mut(&key) {
                    backend.close_when_idle = true;
                }
                self.start_next(key);
            }
            TaskKind::Enqueue { seed } => self.enqueue(key, seed),
            TaskKind::LockAcquired { transaction } => {
                self.step(key, transaction, Transaction::lock_acquired);
            }
            TaskKind::Resume { transaction, resume } => {
                self.step(key, transaction, move |txn| txn.resume(resume));
            }
            TaskKind::TableNames { response } => {
                let reply = self.backends.get_mut(&key).map_or_else(
                    || Err(DatabaseError::InvalidState("database has been closed".to_string())),
                    Backend::table_names,
                );
                let _ = response.send(reply);
            }
        }
    }

    /// Queues a transaction on its handle.
    fn enqueue(&mut self, key: DatabaseKey, seed: TransactionSeed) {
        let Some(backend) = self.backends.get_mut(&key) else {
            seed.fail(self.services.scheduler.as_ref(), closed_error());
            return;
        };
        let id = TransactionId::new(self.next_transaction);
        self.next_transaction += 1;
        let identity = backend.shared.identity().clone();
        backend.pending.push_back(Transaction::new(id, key, identity, seed));
        self.start_next(key);
    }

    /// Applies `apply` to the in-flight transaction `transaction` and runs it.
    fn step(
        &mut self,
        key: DatabaseKey,
        transaction: TransactionId,
        apply: impl FnOnce(&mut Transaction),
    ) {
        let finished = {
            let Some(backend) = self.backends.get_mut(&key) else {
                return;
            };
            let Some(txn) = backend.in_flight.as_mut().filter(|txn| txn.id() == transaction) else {
                debug!(transaction = %transaction, "task for inactive transaction ignored");
                return;
            };
            apply(txn);
            backend.run_in_flight(&mut self.coordinator, &self.control, &self.services)
        };
        if finished {
            self.start_next(key);
        }
    }

    /// Starts queued transactions on `key` until one goes idle.
    fn start_next(&mut self, key: DatabaseKey) {
        loop {
            let Some(backend) = self.backends.get_mut(&key) else {
                return;
            };
            if backend.in_flight.is_some() {
                return;
            }
            let Some(next) = backend.pending.pop_front() else {
                if backend.close_when_idle {
                    self.close_backend(key, &closed_error());
                }
                return;
            };
            backend.in_flight = Some(next);
            if !backend.run_in_flight(&mut self.coordinator, &self.control, &self.services) {
                return;
            }
        }
    }

    /// Closes a backend, failing its in-flight and queued transactions with `error`.
    fn close_backend(&mut self, key: DatabaseKey, error: &SqlError) {
        let removed = self.control.remove_tasks_for(key);
        for task in removed {
            self.discard_task(task, error, &DatabaseError::InvalidState(error.message.clone()));
        }
        let Some(mut backend) = self.backends.remove(&key) else {
            return;
        };
        self.terminate_backend(&mut backend, error, true);
        backend.finish_close(&self.services);
    }

    /// Fails every transaction owned by `backend`.
    fn terminate_backend(&mut self, backend: &mut Backend, error: &SqlError, release_locks: bool) {
        if let Some(mut txn) = backend.in_flight.take() {
            let mut ctx = StepContext {
                connection: &mut *backend.connection,
                authorizer: &backend.authorizer,
                database: &backend.shared,
                coordinator: &mut self.coordinator,
                worker: &self.control,
                services: &self.services,
            };
            txn.terminate(&mut ctx, error.clone(), release_locks);
        }
        for txn in backend.pending.drain(..) {
            txn.fail_unstarted(self.services.scheduler.as_ref(), error.clone());
        }
    }

    /// Answers or fails a task that will never run.
    fn discard_task(&self, task: Task, error: &SqlError, sync_error: &DatabaseError) {
        match task.kind {
            TaskKind::Open { response, .. } => {
                let _ = response.send(Err(sync_error.clone()));
            }
            TaskKind::Close { response } => {
                if let Some(response) = response {
                    let _ = response.send(());
                }
            }
            TaskKind::Enqueue { seed } => seed.fail(self.services.scheduler.as_ref(), error.clone()),
            TaskKind::TableNames { response } => {
                let _ = response.send(Err(sync_error.clone()));
            }
            TaskKind::CloseWhenIdle | TaskKind::LockAcquired { .. } | TaskKind::Resume { .. } => {}
        }
    }

    /// Fails all outstanding work and closes every backend.
    fn shut_down(&mut self) {
        let error = SqlError::new(
            SqlErrorCode::ShutdownInterrupted,
            "the database thread is shutting down",
        );

        let discarded = self.coordinator.shutdown();
        debug!(requests = discarded.len(), "lock requests discarded at shutdown");

        for task in self.control.queue.drain() {
            self.discard_task(task, &error, &DatabaseError::ShutdownInterrupted);
        }

        let keys: Vec<DatabaseKey> = self.backends.keys().copied().collect();
        for key in keys {
            if let Some(mut backend) = self.backends.remove(&key) {
                self.terminate_backend(&mut backend, &error, false);
                backend.finish_close(&self.services);
            }
        }

        self.services.events.record(
            &DatabaseEvent::new(DatabaseEventKind::WorkerShutdown).with_origin(&self.services.origin),
        );
        self.control.finish_shutdown();
    }
}

/// Error reported to transactions of a closed handle.
fn closed_error() -> SqlError {
    SqlError::new(SqlErrorCode::InvalidState, "database has been closed")
}
