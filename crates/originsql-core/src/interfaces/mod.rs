// crates/originsql-core/src/interfaces/mod.rs
// ============================================================================
// Module: OriginSQL Interfaces
// Description: Engine, tracker, scheduling, and client contracts.
// Purpose: Define the seams between the runtime and its collaborators.
// Dependencies: crate::core, thiserror
// ============================================================================

//! ## Overview
//! The runtime never talks to a storage engine, the filesystem registry, or
//! the caller's event loop directly. It goes through these traits:
//! - [`SqlConnection`] and [`ConnectionFactory`] wrap the embedded SQL engine.
//! - [`DatabaseTracker`] admits, locates, and sizes databases per origin.
//! - [`CallbackScheduler`] runs callbacks on the caller's thread.
//! - [`DatabaseClient`] is asked for more space when the quota is hit.
//!
//! Connections are used only from the worker thread that opened them.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::core::DatabaseError;
use crate::core::DatabaseIdentity;
use crate::core::DatabaseKey;
use crate::core::EngineError;
use crate::core::ResultSet;
use crate::core::SharedAuthorizer;
use crate::core::SqlValue;

// ============================================================================
// SECTION: Engine Connection
// ============================================================================

/// Handle that aborts a running statement from another thread.
pub trait InterruptHandle: Send + Sync {
    /// Interrupts the statement currently executing, if any.
    fn interrupt(&self);
}

/// A single connection to an embedded SQL database file.
///
/// # Invariants
/// - Every statement is compiled with the connection's authorizer installed.
/// - Dropping the connection closes it.
pub trait SqlConnection: Send {
    /// Begins a transaction; read-only transactions take a shared lock.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the engine refuses to begin.
    fn begin(&mut self, read_only: bool) -> Result<(), EngineError>;

    /// Commits the open transaction.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the commit fails; the transaction may remain open.
    fn commit(&mut self) -> Result<(), EngineError>;

    /// Rolls back the open transaction.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the rollback fails.
    fn rollback(&mut self) -> Result<(), EngineError>;

    /// Returns true while a transaction is open on the connection.
    fn in_transaction(&self) -> bool;

    /// Compiles and runs one statement with positional arguments.
    ///
    /// The returned [`ResultSet`] carries the raw change count and last
    /// insert row id; the runtime filters them through the authorizer.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when compilation, binding, or execution fails.
    fn execute(&mut self, sql: &str, arguments: &[SqlValue]) -> Result<ResultSet, EngineError>;

    /// Caps the database file at `bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the limit cannot be applied.
    fn set_maximum_size(&mut self, bytes: u64) -> Result<(), EngineError>;

    /// Reclaims free pages when the free fraction warrants it.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when vacuuming fails.
    fn incremental_vacuum_if_needed(&mut self) -> Result<(), EngineError>;

    /// Lists user table names, excluding engine-internal tables.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the schema cannot be read.
    fn table_names(&mut self) -> Result<Vec<String>, EngineError>;

    /// Returns a handle that can interrupt this connection from any thread.
    fn interrupt_handle(&self) -> Arc<dyn InterruptHandle>;
}

/// Opens engine connections.
pub trait ConnectionFactory: Send + Sync {
    /// Opens or creates the database file at `path` with `authorizer` installed.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the file cannot be opened.
    fn open(
        &self,
        path: &Path,
        authorizer: SharedAuthorizer,
    ) -> Result<Box<dyn SqlConnection>, EngineError>;
}

// ============================================================================
// SECTION: Tracker
// ============================================================================

/// Admission and registry errors reported by a tracker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    /// The database or its origin is being deleted.
    #[error("database is being deleted")]
    DatabaseIsBeingDeleted,
    /// Usage plus the requested size exceeds the origin quota.
    #[error("database size exceeds the origin quota")]
    QuotaExceeded,
    /// Usage plus the requested size overflowed.
    #[error("requested database size overflows the origin usage")]
    SizeOverflowed,
    /// The database has no registry entry.
    #[error("database not registered: {0}")]
    NotFound(String),
    /// Registry storage failure.
    #[error("database registry error: {0}")]
    Registry(String),
    /// Filesystem failure.
    #[error("database registry io error: {0}")]
    Io(String),
}

impl From<AdmissionError> for DatabaseError {
    fn from(error: AdmissionError) -> Self {
        match error {
            AdmissionError::DatabaseIsBeingDeleted => Self::DatabaseIsBeingDeleted,
            AdmissionError::QuotaExceeded => Self::QuotaExceeded,
            AdmissionError::SizeOverflowed => Self::SizeOverflowed,
            AdmissionError::NotFound(message) | AdmissionError::Registry(message) => {
                Self::InvalidState(message)
            }
            AdmissionError::Io(message) => Self::Io(message),
        }
    }
}

/// Proof of a successful admission check.
///
/// A recorded ticket owns one "being created" mark on its identity; handing
/// it to [`DatabaseTracker::done_creating_database`] releases that mark.
#[derive(Debug, PartialEq, Eq)]
pub struct CreationTicket {
    /// Admitted identity.
    identity: DatabaseIdentity,
    /// Whether this ticket owns a creation mark.
    recorded: bool,
}

impl CreationTicket {
    /// Creates a ticket for `identity`.
    #[must_use]
    pub const fn new(identity: DatabaseIdentity, recorded: bool) -> Self {
        Self { identity, recorded }
    }

    /// Returns the admitted identity.
    #[must_use]
    pub const fn identity(&self) -> &DatabaseIdentity {
        &self.identity
    }

    /// Returns true when the ticket owns a creation mark.
    #[must_use]
    pub const fn is_recorded(&self) -> bool {
        self.recorded
    }
}

/// Registry details for one database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseDetails {
    /// Database name.
    pub name: String,
    /// Human-readable display name.
    pub display_name: String,
    /// Size the caller estimated when opening.
    pub estimated_size: u64,
    /// Current size of the file on disk.
    pub current_usage: u64,
}

/// Open database handle as seen by the tracker.
pub trait OpenDatabase: Send + Sync {
    /// Returns the handle's identity.
    fn identity(&self) -> &DatabaseIdentity;

    /// Returns the handle's worker key.
    fn key(&self) -> DatabaseKey;

    /// Marks the handle deleted and closes it, waiting for the close when
    /// called off the worker thread.
    fn mark_as_deleted_and_close(&self);

    /// Interrupts any statement currently executing on the handle.
    fn interrupt(&self);
}

/// Origin-scoped registry of databases, quotas, and open handles.
///
/// # Invariants
/// - Every successful [`Self::can_establish_database`] or
///   [`Self::retry_can_establish_database`] ticket is passed to
///   [`Self::done_creating_database`] exactly once.
/// - A `QuotaExceeded` from [`Self::can_establish_database`] is followed by
///   one call to [`Self::retry_can_establish_database`].
pub trait DatabaseTracker: Send + Sync {
    /// Admission check; marks the identity as being created on success.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError`] when the identity is being deleted or the
    /// origin quota does not admit `estimated_size`.
    fn can_establish_database(
        &self,
        identity: &DatabaseIdentity,
        display_name: &str,
        estimated_size: u64,
    ) -> Result<CreationTicket, AdmissionError>;

    /// Repeats the quota check after the client had a chance to raise the quota.
    ///
    /// On success the returned ticket owns the creation mark left by the
    /// failed [`Self::can_establish_database`]; on failure the mark is cleared.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError`] when the quota still does not admit the database.
    fn retry_can_establish_database(
        &self,
        identity: &DatabaseIdentity,
        estimated_size: u64,
    ) -> Result<CreationTicket, AdmissionError>;

    /// Releases the creation mark owned by `ticket`.
    fn done_creating_database(&self, ticket: CreationTicket);

    /// Returns the file path for `identity`, registering it when requested.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError`] when the database is unknown and
    /// `create_if_missing` is false, or the registry fails.
    fn full_path_for_database(
        &self,
        identity: &DatabaseIdentity,
        create_if_missing: bool,
    ) -> Result<PathBuf, AdmissionError>;

    /// Records the display name and estimated size for `identity`.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError`] when the registry fails.
    fn set_database_details(
        &self,
        identity: &DatabaseIdentity,
        display_name: &str,
        estimated_size: u64,
    ) -> Result<(), AdmissionError>;

    /// Returns the registry details for `identity`.
    fn details_for_database(&self, identity: &DatabaseIdentity) -> DatabaseDetails;

    /// Returns the largest size the database file may grow to.
    fn maximum_size_for_database(&self, identity: &DatabaseIdentity) -> u64;

    /// Registers an open handle.
    fn add_open_database(&self, database: Arc<dyn OpenDatabase>);

    /// Unregisters an open handle.
    fn remove_open_database(&self, identity: &DatabaseIdentity, key: DatabaseKey);

    /// Notes that a committed transaction modified `identity`.
    fn database_changed(&self, identity: &DatabaseIdentity);
}

// ============================================================================
// SECTION: Caller Scheduling
// ============================================================================

/// Work item executed on the caller's thread.
pub type CallerTask = Box<dyn FnOnce() + Send>;

/// Posts work to the thread that owns a database context.
pub trait CallbackScheduler: Send + Sync {
    /// Queues `task` for the caller's thread; returns false when the caller
    /// can no longer run tasks.
    fn post(&self, task: CallerTask) -> bool;
}

// ============================================================================
// SECTION: Client
// ============================================================================

/// Embedder hooks consulted on the caller's thread.
pub trait DatabaseClient: Send + Sync {
    /// Called when a database needs more space than its origin quota allows.
    ///
    /// The client may raise the quota through the tracker before returning.
    fn exceeded_database_quota(&self, identity: &DatabaseIdentity, details: &DatabaseDetails);
}

/// Client that never grants more space.
pub struct NoopDatabaseClient;

impl DatabaseClient for NoopDatabaseClient {
    fn exceeded_database_quota(&self, _identity: &DatabaseIdentity, _details: &DatabaseDetails) {}
}
