// crates/originsql-core/src/runtime/context.rs
// ============================================================================
// Module: OriginSQL Database Context
// Description: Per-origin entry point that owns the worker and opens databases.
// Purpose: Run admission, path resolution, and open verification for callers.
// Dependencies: crate::{core, interfaces, runtime}, tracing
// ============================================================================

//! ## Overview
//! A [`DatabaseContext`] binds one origin to its collaborators: the tracker,
//! the connection factory, the caller-thread scheduler, the embedding client,
//! and the event sink. It owns the database thread; dropping the context
//! shuts the thread down and fails whatever work is still outstanding.
//!
//! Opening a database is synchronous on the caller thread:
//! 1. admission through the tracker, with one client-mediated retry when the
//!    origin quota is exceeded;
//! 2. path resolution and engine open on the worker;
//! 3. tracker registration and the optional creation callback.
//!
//! The tracker's creation mark is released exactly once per admission,
//! whether the open succeeds or not.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::mpsc;

use tracing::debug;
use tracing::warn;

use crate::core::AuthorizerPolicy;
use crate::core::DatabaseError;
use crate::core::DatabaseEvent;
use crate::core::DatabaseEventKind;
use crate::core::DatabaseEventSink;
use crate::core::DatabaseIdentity;
use crate::core::DatabaseKey;
use crate::core::NoopEventSink;
use crate::core::OriginId;
use crate::interfaces::AdmissionError;
use crate::interfaces::CallbackScheduler;
use crate::interfaces::ConnectionFactory;
use crate::interfaces::CreationTicket;
use crate::interfaces::DatabaseClient;
use crate::interfaces::DatabaseTracker;
use crate::interfaces::NoopDatabaseClient;
use crate::interfaces::OpenDatabase;
use crate::runtime::database::Database;
use crate::runtime::database::DatabaseShared;
use crate::runtime::thread::DatabaseThread;
use crate::runtime::thread::Task;
use crate::runtime::thread::TaskKind;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default worker thread name.
const DEFAULT_THREAD_NAME: &str = "originsql-db";

// ============================================================================
// SECTION: Services
// ============================================================================

/// Collaborators shared by the context, its handles, and the worker.
pub(crate) struct DatabaseServices {
    /// Origin served by the context.
    pub(crate) origin: OriginId,
    /// Registry, quota, and open-handle tracker.
    pub(crate) tracker: Arc<dyn DatabaseTracker>,
    /// Engine connection factory.
    pub(crate) connections: Arc<dyn ConnectionFactory>,
    /// Caller-thread scheduler.
    pub(crate) scheduler: Arc<dyn CallbackScheduler>,
    /// Embedder hooks.
    pub(crate) client: Arc<dyn DatabaseClient>,
    /// Lifecycle event sink.
    pub(crate) events: Arc<dyn DatabaseEventSink>,
    /// Authorizer policy for new connections.
    pub(crate) policy: AuthorizerPolicy,
}

// ============================================================================
// SECTION: Options
// ============================================================================

/// Collaborators and settings for a [`DatabaseContext`].
pub struct ContextOptions {
    /// Origin served by the context.
    origin: OriginId,
    /// Registry tracker.
    tracker: Arc<dyn DatabaseTracker>,
    /// Engine connection factory.
    connections: Arc<dyn ConnectionFactory>,
    /// Caller-thread scheduler.
    scheduler: Arc<dyn CallbackScheduler>,
    /// Embedder hooks.
    client: Arc<dyn DatabaseClient>,
    /// Lifecycle event sink.
    events: Arc<dyn DatabaseEventSink>,
    /// Authorizer policy.
    policy: AuthorizerPolicy,
    /// Worker thread name.
    thread_name: String,
}

impl ContextOptions {
    /// Creates options with a no-op client, no-op event sink, and the default policy.
    #[must_use]
    pub fn new(
        origin: OriginId,
        tracker: Arc<dyn DatabaseTracker>,
        connections: Arc<dyn ConnectionFactory>,
        scheduler: Arc<dyn CallbackScheduler>,
    ) -> Self {
        Self {
            origin,
            tracker,
            connections,
            scheduler,
            client: Arc::new(NoopDatabaseClient),
            events: Arc::new(NoopEventSink),
            policy: AuthorizerPolicy::default(),
            thread_name: DEFAULT_THREAD_NAME.to_string(),
        }
    }

    /// Sets the embedder client.
    #[must_use]
    pub fn client(mut self, client: Arc<dyn DatabaseClient>) -> Self {
        self.client = client;
        self
    }

    /// Sets the lifecycle event sink.
    #[must_use]
    pub fn events(mut self, events: Arc<dyn DatabaseEventSink>) -> Self {
        self.events = events;
        self
    }

    /// Sets the authorizer policy.
    #[must_use]
    pub fn policy(mut self, policy: AuthorizerPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the worker thread name.
    #[must_use]
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }
}

/// Parameters for [`DatabaseContext::open_database`].
pub struct OpenRequest {
    /// Database name within the origin.
    name: String,
    /// Version the caller expects; empty accepts any.
    expected_version: String,
    /// Display name recorded in the registry.
    display_name: String,
    /// Estimated size used for admission.
    estimated_size: u64,
    /// Write the expected version into a brand new database.
    set_version_if_new: bool,
    /// Called on the caller thread when the open created the database.
    creation_callback: Option<Box<dyn FnOnce(Database) + Send>>,
}

impl OpenRequest {
    /// Creates a request for `name` accepting any version.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            expected_version: String::new(),
            display_name: String::new(),
            estimated_size: 0,
            set_version_if_new: true,
            creation_callback: None,
        }
    }

    /// Sets the expected version.
    #[must_use]
    pub fn expected_version(mut self, version: impl Into<String>) -> Self {
        self.expected_version = version.into();
        self
    }

    /// Sets the display name.
    #[must_use]
    pub fn display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    /// Sets the estimated size.
    #[must_use]
    pub const fn estimated_size(mut self, bytes: u64) -> Self {
        self.estimated_size = bytes;
        self
    }

    /// Controls whether a new database receives the expected version.
    #[must_use]
    pub const fn set_version_if_new(mut self, enabled: bool) -> Self {
        self.set_version_if_new = enabled;
        self
    }

    /// Sets the creation callback.
    ///
    /// With a creation callback a new database is left without a stored
    /// version and its expected version is cleared, so the callback can set
    /// it through [`Database::change_version`].
    #[must_use]
    pub fn creation_callback(mut self, callback: impl FnOnce(Database) + Send + 'static) -> Self {
        self.creation_callback = Some(Box::new(callback));
        self
    }
}

// ============================================================================
// SECTION: Context
// ============================================================================

/// Per-origin owner of the database thread.
pub struct DatabaseContext {
    /// Shared collaborators.
    services: Arc<DatabaseServices>,
    /// Worker thread.
    thread: DatabaseThread,
    /// Next handle key.
    next_key: AtomicU64,
}

impl DatabaseContext {
    /// Starts the database thread for `options`.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::Io`] when the thread cannot be spawned.
    pub fn new(options: ContextOptions) -> Result<Self, DatabaseError> {
        let services = Arc::new(DatabaseServices {
            origin: options.origin,
            tracker: options.tracker,
            connections: options.connections,
            scheduler: options.scheduler,
            client: options.client,
            events: options.events,
            policy: options.policy,
        });
        let thread = DatabaseThread::start(&options.thread_name, Arc::clone(&services))?;
        Ok(Self { services, thread, next_key: AtomicU64::new(1) })
    }

    /// Returns the origin served by this context.
    #[must_use]
    pub fn origin(&self) -> &OriginId {
        &self.services.origin
    }

    /// Returns true once shutdown was requested.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.thread.control().is_stopping()
    }

    /// Opens or creates a database.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError`] when admission fails, the database cannot be
    /// opened, its stored version differs from the expected version, or the
    /// context is shutting down.
    pub fn open_database(&self, request: OpenRequest) -> Result<Database, DatabaseError> {
        if self.is_stopping() {
            return Err(DatabaseError::ShutdownInterrupted);
        }
        if self.thread.control().is_worker_thread() {
            return Err(DatabaseError::InvalidState(
                "databases cannot be opened from the database thread".to_string(),
            ));
        }
        let identity = DatabaseIdentity::new(self.services.origin.clone(), request.name.clone());
        let ticket = self.admit(&identity, &request)?;
        let result = self.open_admitted(identity, request);
        self.services.tracker.done_creating_database(ticket);
        result
    }

    /// Requests shutdown without waiting; `waiter` is signalled when it completes.
    pub fn request_shutdown(&self, waiter: Option<mpsc::Sender<()>>) {
        self.thread.request_shutdown(waiter);
    }

    /// Shuts the database thread down and waits for it to exit.
    pub fn stop(&self) {
        self.thread.request_shutdown(None);
        self.thread.join();
    }

    /// Runs the admission check with one client-mediated quota retry.
    fn admit(
        &self,
        identity: &DatabaseIdentity,
        request: &OpenRequest,
    ) -> Result<CreationTicket, DatabaseError> {
        let tracker = &self.services.tracker;
        match tracker.can_establish_database(identity, &request.display_name, request.estimated_size)
        {
            Ok(ticket) => Ok(ticket),
            Err(AdmissionError::QuotaExceeded) => {
                self.services.events.record(
                    &DatabaseEvent::new(DatabaseEventKind::QuotaExceeded)
                        .with_identity(identity)
                        .with_message("origin quota exceeded at open"),
                );
                let mut details = tracker.details_for_database(identity);
                details.name.clone_from(&identity.name);
                details.display_name.clone_from(&request.display_name);
                details.estimated_size = request.estimated_size;
                self.services.client.exceeded_database_quota(identity, &details);
                tracker
                    .retry_can_establish_database(identity, request.estimated_size)
                    .map_err(DatabaseError::from)
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Opens an admitted database on the worker and registers it.
    fn open_admitted(
        &self,
        identity: DatabaseIdentity,
        request: OpenRequest,
    ) -> Result<Database, DatabaseError> {
        let tracker = &self.services.tracker;
        let path = tracker.full_path_for_database(&identity, true)?;
        let key = DatabaseKey::new(self.next_key.fetch_add(1, Ordering::Relaxed));
        let control = self.thread.control();
        let shared = Arc::new(DatabaseShared::new(
            key,
            identity.clone(),
            request.display_name.clone(),
            request.estimated_size,
            request.expected_version,
            Arc::clone(control),
            Arc::clone(&self.services),
        ));

        let (sender, receiver) = mpsc::channel();
        let task = Task::new(key, TaskKind::Open {
            database: Arc::clone(&shared),
            path,
            set_version_if_new: request.set_version_if_new && request.creation_callback.is_none(),
            response: sender,
        });
        control.queue.submit_priority(task).map_err(|_| DatabaseError::ShutdownInterrupted)?;
        receiver.recv().map_err(|_| DatabaseError::ShutdownInterrupted)??;

        let database = Database::from_shared(Arc::clone(&shared));
        tracker.set_database_details(&identity, &request.display_name, request.estimated_size)?;
        let open: Arc<dyn OpenDatabase> = shared;
        tracker.add_open_database(open);
        self.services
            .events
            .record(&DatabaseEvent::new(DatabaseEventKind::DatabaseOpened).with_identity(&identity));
        debug!(database = %identity, is_new = database.is_new(), "database opened");

        if database.is_new()
            && let Some(callback) = request.creation_callback
        {
            database.shared().set_expected_version("");
            let created = database.clone();
            if !self.services.scheduler.post(Box::new(move || callback(created))) {
                warn!(database = %identity, "creation callback dropped");
            }
        }
        Ok(database)
    }
}

impl std::fmt::Debug for DatabaseContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseContext")
            .field("origin", &self.services.origin)
            .field("stopping", &self.is_stopping())
            .finish_non_exhaustive()
    }
}

