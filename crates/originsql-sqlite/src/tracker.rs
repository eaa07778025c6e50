// crates/originsql-sqlite/src/tracker.rs
// ============================================================================
// Module: SQLite Database Tracker
// Description: On-disk registry of origins, databases, quotas, and open handles.
// Purpose: Admit, locate, size, and delete databases per origin.
// Dependencies: originsql-core, rusqlite, thiserror, tracing
// ============================================================================

//! ## Overview
//! [`SqliteDatabaseTracker`] keeps a registry database (`Databases.db`) in
//! the tracker directory with two tables:
//! - `Origins`: one quota row per origin;
//! - `Databases`: one row per named database, mapping it to a file name under
//!   the origin's directory.
//!
//! Database files are named from the registry's autoincrement sequence
//! (`%016x.db`). Origin usage is the sum of the sizes of the origin's
//! database files.
//!
//! The tracker also remembers which identities are being created or deleted
//! and which handles are open, so deletion can close live handles and
//! admission can refuse databases that are on their way out.
//!
//! # Invariants
//! - Filesystem work and handle closes happen outside the registry lock.
//! - A database that is being created cannot be deleted, and a database that
//!   is being deleted cannot be admitted.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use originsql_core::AdmissionError;
use originsql_core::CreationTicket;
use originsql_core::DatabaseDetails;
use originsql_core::DatabaseEvent;
use originsql_core::DatabaseEventKind;
use originsql_core::DatabaseEventSink;
use originsql_core::DatabaseIdentity;
use originsql_core::DatabaseKey;
use originsql_core::DatabaseTracker;
use originsql_core::NoopEventSink;
use originsql_core::OpenDatabase;
use originsql_core::OriginId;
use rusqlite::Connection;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite::params;
use thiserror::Error;
use tracing::debug;
use tracing::warn;

use crate::engine::JournalMode;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Registry schema version.
const SCHEMA_VERSION: i64 = 1;
/// Registry file name inside the tracker directory.
const REGISTRY_FILE_NAME: &str = "Databases.db";
/// Default per-origin quota (bytes).
const DEFAULT_ORIGIN_QUOTA: u64 = 5 * 1024 * 1024;
/// Default busy timeout (ms).
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
/// Engine side files that belong to a database file.
const SIDE_FILE_SUFFIXES: [&str; 3] = ["-journal", "-wal", "-shm"];

// ============================================================================
// SECTION: Config
// ============================================================================

/// Tracker settings.
///
/// # Invariants
/// - `directory` is created on open when missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Root directory holding the registry and one subdirectory per origin.
    pub directory: PathBuf,
    /// Quota given to an origin the first time it creates a database.
    pub default_origin_quota: u64,
    /// Registry busy timeout in milliseconds.
    pub busy_timeout_ms: u64,
    /// Registry journal mode.
    pub journal_mode: JournalMode,
}

impl TrackerConfig {
    /// Creates a config rooted at `directory` with default limits.
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            default_origin_quota: DEFAULT_ORIGIN_QUOTA,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            journal_mode: JournalMode::default(),
        }
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Tracker errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TrackerError {
    /// Registry engine error.
    #[error("tracker db error: {0}")]
    Db(String),
    /// Filesystem error.
    #[error("tracker io error: {0}")]
    Io(String),
    /// The database or origin has no registry entry.
    #[error("tracker entry not found: {0}")]
    NotFound(String),
    /// The database is being created and cannot be deleted yet.
    #[error("database is in use: {0}")]
    InUse(String),
    /// Registry contents failed validation.
    #[error("tracker invalid data: {0}")]
    Invalid(String),
}

impl From<rusqlite::Error> for TrackerError {
    fn from(error: rusqlite::Error) -> Self {
        Self::Db(error.to_string())
    }
}

impl From<io::Error> for TrackerError {
    fn from(error: io::Error) -> Self {
        Self::Io(error.to_string())
    }
}

impl From<TrackerError> for AdmissionError {
    fn from(error: TrackerError) -> Self {
        match error {
            TrackerError::NotFound(message) => Self::NotFound(message),
            TrackerError::Io(message) => Self::Io(message),
            TrackerError::Db(message)
            | TrackerError::InUse(message)
            | TrackerError::Invalid(message) => Self::Registry(message),
        }
    }
}

// ============================================================================
// SECTION: Records
// ============================================================================

/// Quota and usage of one origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaRecord {
    /// Origin.
    pub origin: OriginId,
    /// Quota in bytes.
    pub quota: u64,
    /// Bytes used by the origin's database files.
    pub usage: u64,
}

/// Observer notified after registry changes.
pub trait TrackerChangeListener: Send + Sync {
    /// A committed transaction modified `identity`.
    fn database_changed(&self, identity: &DatabaseIdentity) {
        let _ = identity;
    }

    /// Quota or membership of `origin` changed.
    fn origin_changed(&self, origin: &OriginId) {
        let _ = origin;
    }
}

// ============================================================================
// SECTION: Tracker State
// ============================================================================

/// Registry connection and in-flight bookkeeping.
struct TrackerState {
    /// Registry connection.
    connection: Connection,
    /// Creation marks per identity.
    creating: HashMap<DatabaseIdentity, usize>,
    /// Identities being deleted.
    deleting: HashSet<DatabaseIdentity>,
    /// Origins being deleted.
    origins_deleting: HashSet<OriginId>,
}

impl TrackerState {
    /// Returns true when `identity` or its origin is being deleted.
    fn is_deleting(&self, identity: &DatabaseIdentity) -> bool {
        self.deleting.contains(identity) || self.origins_deleting.contains(&identity.origin)
    }

    /// Adds one creation mark.
    fn record_creating(&mut self, identity: &DatabaseIdentity) {
        *self.creating.entry(identity.clone()).or_insert(0) += 1;
    }

    /// Removes one creation mark.
    fn done_creating(&mut self, identity: &DatabaseIdentity) {
        if let Some(count) = self.creating.get_mut(identity) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.creating.remove(identity);
            }
        }
    }
}

// ============================================================================
// SECTION: Tracker
// ============================================================================

/// `SQLite`-backed [`DatabaseTracker`].
pub struct SqliteDatabaseTracker {
    /// Settings.
    config: TrackerConfig,
    /// Registry and in-flight marks.
    state: Mutex<TrackerState>,
    /// Open handles per identity.
    open: Mutex<HashMap<DatabaseIdentity, Vec<Arc<dyn OpenDatabase>>>>,
    /// Change observer.
    listener: Mutex<Option<Arc<dyn TrackerChangeListener>>>,
    /// Lifecycle event sink.
    events: Mutex<Arc<dyn DatabaseEventSink>>,
}

impl SqliteDatabaseTracker {
    /// Opens or creates the registry under `config.directory`.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError`] when the directory or registry cannot be
    /// created, or the registry schema is from an unknown version.
    pub fn open(config: TrackerConfig) -> Result<Self, TrackerError> {
        fs::create_dir_all(&config.directory)?;
        let mut connection = open_registry(&config)?;
        initialize_schema(&mut connection)?;
        debug!(directory = %config.directory.display(), "database tracker opened");
        Ok(Self {
            config,
            state: Mutex::new(TrackerState {
                connection,
                creating: HashMap::new(),
                deleting: HashSet::new(),
                origins_deleting: HashSet::new(),
            }),
            open: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
            events: Mutex::new(Arc::new(NoopEventSink)),
        })
    }

    /// Returns the tracker settings.
    #[must_use]
    pub const fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Installs the change observer.
    pub fn set_change_listener(&self, listener: Option<Arc<dyn TrackerChangeListener>>) {
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = listener;
    }

    /// Installs the sink receiving deletion events.
    pub fn set_event_sink(&self, events: Arc<dyn DatabaseEventSink>) {
        *self.events.lock().unwrap_or_else(PoisonError::into_inner) = events;
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Lists every origin with a quota or a database.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError`] when the registry cannot be read.
    pub fn origins(&self) -> Result<Vec<OriginId>, TrackerError> {
        let state = self.lock_state();
        let mut statement = state.connection.prepare(
            "SELECT origin FROM Origins UNION SELECT origin FROM Databases ORDER BY origin",
        )?;
        let raw = statement
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(raw
            .into_iter()
            .filter_map(|origin| match OriginId::new(origin.clone()) {
                Ok(origin) => Some(origin),
                Err(error) => {
                    warn!(origin = %origin, error = %error, "skipping invalid origin in registry");
                    None
                }
            })
            .collect())
    }

    /// Lists the database names registered for `origin`.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError`] when the registry cannot be read.
    pub fn database_names_for_origin(&self, origin: &OriginId) -> Result<Vec<String>, TrackerError> {
        let state = self.lock_state();
        database_names(&state.connection, origin)
    }

    /// Returns the quota and usage of `origin`.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError`] when the registry cannot be read.
    pub fn quota_record(&self, origin: &OriginId) -> Result<QuotaRecord, TrackerError> {
        let state = self.lock_state();
        let quota = stored_quota(&state.connection, origin)?
            .unwrap_or(self.config.default_origin_quota);
        let usage = self.usage_locked(&state.connection, origin)?;
        Ok(QuotaRecord { origin: origin.clone(), quota, usage })
    }

    /// Returns the quota of `origin`; untracked origins report the default quota.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError`] when the registry cannot be read.
    pub fn quota_for_origin(&self, origin: &OriginId) -> Result<u64, TrackerError> {
        let state = self.lock_state();
        Ok(stored_quota(&state.connection, origin)?.unwrap_or(self.config.default_origin_quota))
    }

    /// Sets the quota of `origin`.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError`] when the registry cannot be written.
    pub fn set_quota(&self, origin: &OriginId, quota: u64) -> Result<(), TrackerError> {
        {
            let state = self.lock_state();
            state.connection.execute(
                "INSERT INTO Origins (origin, quota) VALUES (?1, ?2)",
                params![origin.as_str(), to_sql_size(quota)],
            )?;
        }
        debug!(origin = %origin, quota, "origin quota updated");
        self.notify_origin_changed(origin);
        Ok(())
    }

    /// Returns the bytes used by `origin`'s database files.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError`] when the registry cannot be read.
    pub fn usage_for_origin(&self, origin: &OriginId) -> Result<u64, TrackerError> {
        let state = self.lock_state();
        self.usage_locked(&state.connection, origin)
    }

    /// Returns true while `identity` holds at least one creation mark.
    #[must_use]
    pub fn is_being_created(&self, identity: &DatabaseIdentity) -> bool {
        self.lock_state().creating.contains_key(identity)
    }

    /// Returns the number of creation marks held for `identity`.
    #[must_use]
    pub fn creation_count(&self, identity: &DatabaseIdentity) -> usize {
        self.lock_state().creating.get(identity).copied().unwrap_or(0)
    }

    /// Returns true while `identity` or its origin is being deleted.
    #[must_use]
    pub fn is_being_deleted(&self, identity: &DatabaseIdentity) -> bool {
        self.lock_state().is_deleting(identity)
    }

    /// Returns the number of open handles registered for `identity`.
    #[must_use]
    pub fn open_handle_count(&self, identity: &DatabaseIdentity) -> usize {
        self.lock_open().get(identity).map_or(0, Vec::len)
    }

    // ------------------------------------------------------------------------
    // Deletion
    // ------------------------------------------------------------------------

    /// Deletes one database: closes its handles, removes its files, and
    /// drops its registry row.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::InUse`] while the database is being created or
    /// already being deleted, and other variants when files or the registry
    /// cannot be updated.
    pub fn delete_database(&self, identity: &DatabaseIdentity) -> Result<(), TrackerError> {
        {
            let mut state = self.lock_state();
            if state.creating.contains_key(identity) || state.is_deleting(identity) {
                return Err(TrackerError::InUse(identity.to_string()));
            }
            state.deleting.insert(identity.clone());
        }

        let result = self.delete_database_files(identity).and_then(|()| {
            let state = self.lock_state();
            state.connection.execute(
                "DELETE FROM Databases WHERE origin = ?1 AND name = ?2",
                params![identity.origin.as_str(), identity.name],
            )?;
            Ok(())
        });

        self.lock_state().deleting.remove(identity);
        result?;
        self.record_event(DatabaseEvent::new(DatabaseEventKind::DatabaseDeleted).with_identity(identity));
        self.notify_origin_changed(&identity.origin);
        Ok(())
    }

    /// Deletes every database of `origin` and its quota row.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::InUse`] while one of the origin's databases is
    /// being created, and other variants when files or the registry cannot be
    /// updated.
    pub fn delete_origin(&self, origin: &OriginId) -> Result<(), TrackerError> {
        let names = {
            let mut state = self.lock_state();
            if state.origins_deleting.contains(origin)
                || state.creating.keys().any(|identity| &identity.origin == origin)
            {
                return Err(TrackerError::InUse(origin.to_string()));
            }
            let names = database_names(&state.connection, origin)?;
            state.origins_deleting.insert(origin.clone());
            names
        };

        let result = self.delete_origin_files(origin, &names).and_then(|()| {
            let state = self.lock_state();
            state
                .connection
                .execute("DELETE FROM Databases WHERE origin = ?1", params![origin.as_str()])?;
            state.connection.execute("DELETE FROM Origins WHERE origin = ?1", params![origin.as_str()])?;
            Ok(())
        });

        self.lock_state().origins_deleting.remove(origin);
        result?;
        self.record_event(DatabaseEvent::new(DatabaseEventKind::OriginDeleted).with_origin(origin));
        self.notify_origin_changed(origin);
        Ok(())
    }

    /// Deletes every origin.
    ///
    /// # Errors
    ///
    /// Returns the first [`TrackerError`] hit; remaining origins are still attempted.
    pub fn delete_all_databases(&self) -> Result<(), TrackerError> {
        let mut first_error = None;
        for origin in self.origins()? {
            if let Err(error) = self.delete_origin(&origin) {
                warn!(origin = %origin, error = %error, "origin deletion failed");
                first_error.get_or_insert(error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Interrupts every open handle of `origin`.
    pub fn interrupt_all_databases_for_origin(&self, origin: &OriginId) {
        let handles: Vec<Arc<dyn OpenDatabase>> = self
            .lock_open()
            .iter()
            .filter(|(identity, _)| &identity.origin == origin)
            .flat_map(|(_, handles)| handles.iter().cloned())
            .collect();
        for handle in handles {
            handle.interrupt();
        }
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    /// Locks the registry state.
    fn lock_state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Locks the open-handle map.
    fn lock_open(&self) -> MutexGuard<'_, HashMap<DatabaseIdentity, Vec<Arc<dyn OpenDatabase>>>> {
        self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Directory holding `origin`'s database files.
    fn origin_directory(&self, origin: &OriginId) -> PathBuf {
        self.config.directory.join(origin.as_str())
    }

    /// Full path for a registered file name.
    fn database_file(&self, origin: &OriginId, file_name: &str) -> PathBuf {
        self.origin_directory(origin).join(file_name)
    }

    /// Sums the file sizes of `origin`'s databases.
    fn usage_locked(&self, connection: &Connection, origin: &OriginId) -> Result<u64, TrackerError> {
        let mut statement = connection.prepare("SELECT path FROM Databases WHERE origin = ?1")?;
        let files = statement
            .query_map(params![origin.as_str()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(files
            .iter()
            .map(|file| database_file_size(&self.database_file(origin, file)))
            .fold(0_u64, u64::saturating_add))
    }

    /// Quota check for an origin against its current usage.
    fn check_quota(
        &self,
        connection: &Connection,
        origin: &OriginId,
        estimated_size: u64,
    ) -> Result<Result<(), AdmissionError>, TrackerError> {
        let usage = self.usage_locked(connection, origin)?;
        let quota = stored_quota(connection, origin)?.unwrap_or(self.config.default_origin_quota);
        Ok(admit(usage, quota, estimated_size))
    }

    /// Seeds the origin quota row, then admits registered databases outright
    /// and checks new ones against the quota.
    fn check_new_database(
        &self,
        connection: &Connection,
        identity: &DatabaseIdentity,
        estimated_size: u64,
    ) -> Result<Result<(), AdmissionError>, TrackerError> {
        if stored_quota(connection, &identity.origin)?.is_none() {
            connection.execute(
                "INSERT INTO Origins (origin, quota) VALUES (?1, ?2)",
                params![identity.origin.as_str(), to_sql_size(self.config.default_origin_quota)],
            )?;
        }
        if registered_file(connection, identity)?.is_some() {
            return Ok(Ok(()));
        }
        self.check_quota(connection, &identity.origin, estimated_size)
    }

    /// Growth limit of one database under its origin quota.
    fn size_limit_locked(
        &self,
        connection: &Connection,
        identity: &DatabaseIdentity,
    ) -> Result<u64, TrackerError> {
        let quota =
            stored_quota(connection, &identity.origin)?.unwrap_or(self.config.default_origin_quota);
        let usage = self.usage_locked(connection, &identity.origin)?;
        let file_size = registered_file(connection, identity)?
            .map_or(0, |file| database_file_size(&self.database_file(&identity.origin, &file)));
        Ok(maximum_size(quota, usage, file_size))
    }

    /// Closes the open handles of `identity`, waiting for each close.
    fn close_handles(&self, identity: &DatabaseIdentity) {
        let handles = self.lock_open().get(identity).cloned().unwrap_or_default();
        for handle in handles {
            handle.mark_as_deleted_and_close();
        }
    }

    /// Closes handles and removes the files of one database.
    fn delete_database_files(&self, identity: &DatabaseIdentity) -> Result<(), TrackerError> {
        let file = {
            let state = self.lock_state();
            registered_file(&state.connection, identity)?
        };
        let Some(file) = file else {
            return Err(TrackerError::NotFound(identity.to_string()));
        };
        self.close_handles(identity);
        remove_database_file(&self.database_file(&identity.origin, &file))
    }

    /// Closes handles and removes the files and directory of one origin.
    fn delete_origin_files(&self, origin: &OriginId, names: &[String]) -> Result<(), TrackerError> {
        for name in names {
            let identity = DatabaseIdentity::new(origin.clone(), name.clone());
            let file = {
                let state = self.lock_state();
                registered_file(&state.connection, &identity)?
            };
            self.close_handles(&identity);
            if let Some(file) = file {
                remove_database_file(&self.database_file(origin, &file))?;
            }
        }
        match fs::remove_dir(self.origin_directory(origin)) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => {
                warn!(origin = %origin, error = %error, "origin directory not removed");
                Ok(())
            }
        }
    }

    /// Notifies the listener that `origin` changed.
    fn notify_origin_changed(&self, origin: &OriginId) {
        let listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(listener) = listener {
            listener.origin_changed(origin);
        }
    }

    /// Records a lifecycle event.
    fn record_event(&self, event: DatabaseEvent) {
        let events = Arc::clone(&self.events.lock().unwrap_or_else(PoisonError::into_inner));
        events.record(&event);
    }
}

impl DatabaseTracker for SqliteDatabaseTracker {
    fn can_establish_database(
        &self,
        identity: &DatabaseIdentity,
        _display_name: &str,
        estimated_size: u64,
    ) -> Result<CreationTicket, AdmissionError> {
        let mut state = self.lock_state();
        if state.is_deleting(identity) {
            return Err(AdmissionError::DatabaseIsBeingDeleted);
        }
        state.record_creating(identity);

        let checked = self.check_new_database(&state.connection, identity, estimated_size);

        match checked {
            Ok(Ok(())) => Ok(CreationTicket::new(identity.clone(), true)),
            Ok(Err(AdmissionError::QuotaExceeded)) => Err(AdmissionError::QuotaExceeded),
            Ok(Err(error)) => {
                state.done_creating(identity);
                Err(error)
            }
            Err(error) => {
                state.done_creating(identity);
                Err(error.into())
            }
        }
    }

    fn retry_can_establish_database(
        &self,
        identity: &DatabaseIdentity,
        estimated_size: u64,
    ) -> Result<CreationTicket, AdmissionError> {
        let mut state = self.lock_state();
        let checked = self.check_quota(&state.connection, &identity.origin, estimated_size);
        match checked {
            Ok(Ok(())) => Ok(CreationTicket::new(identity.clone(), true)),
            Ok(Err(error)) => {
                state.done_creating(identity);
                Err(error)
            }
            Err(error) => {
                state.done_creating(identity);
                Err(error.into())
            }
        }
    }

    fn done_creating_database(&self, ticket: CreationTicket) {
        if ticket.is_recorded() {
            self.lock_state().done_creating(ticket.identity());
        }
    }

    fn full_path_for_database(
        &self,
        identity: &DatabaseIdentity,
        create_if_missing: bool,
    ) -> Result<PathBuf, AdmissionError> {
        let file = {
            let state = self.lock_state();
            if let Some(file) = registered_file(&state.connection, identity).map_err(TrackerError::from)? {
                file
            } else if create_if_missing {
                let sequence: i64 = state
                    .connection
                    .query_row(
                        "SELECT seq FROM sqlite_sequence WHERE name = 'Databases'",
                        [],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(TrackerError::from)?
                    .unwrap_or(0);
                let file = format!("{:016x}.db", sequence.saturating_add(1));
                state
                    .connection
                    .execute(
                        "INSERT INTO Databases (origin, name, displayName, estimatedSize, path) \
                         VALUES (?1, ?2, '', 0, ?3)",
                        params![identity.origin.as_str(), identity.name, file],
                    )
                    .map_err(TrackerError::from)?;
                file
            } else {
                return Err(AdmissionError::NotFound(identity.to_string()));
            }
        };
        let directory = self.origin_directory(&identity.origin);
        fs::create_dir_all(&directory).map_err(|err| AdmissionError::Io(err.to_string()))?;
        Ok(directory.join(file))
    }

    fn set_database_details(
        &self,
        identity: &DatabaseIdentity,
        display_name: &str,
        estimated_size: u64,
    ) -> Result<(), AdmissionError> {
        let updated = {
            let state = self.lock_state();
            state
                .connection
                .execute(
                    "UPDATE Databases SET displayName = ?1, estimatedSize = ?2 \
                     WHERE origin = ?3 AND name = ?4",
                    params![
                        display_name,
                        to_sql_size(estimated_size),
                        identity.origin.as_str(),
                        identity.name
                    ],
                )
                .map_err(TrackerError::from)?
        };
        if updated == 0 {
            return Err(AdmissionError::NotFound(identity.to_string()));
        }
        self.notify_origin_changed(&identity.origin);
        Ok(())
    }

    fn details_for_database(&self, identity: &DatabaseIdentity) -> DatabaseDetails {
        let state = self.lock_state();
        let row = state
            .connection
            .query_row(
                "SELECT displayName, estimatedSize, path FROM Databases \
                 WHERE origin = ?1 AND name = ?2",
                params![identity.origin.as_str(), identity.name],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, String>(2)?)),
            )
            .optional();
        match row {
            Ok(Some((display_name, estimated_size, file))) => DatabaseDetails {
                name: identity.name.clone(),
                display_name,
                estimated_size: u64::try_from(estimated_size).unwrap_or(0),
                current_usage: database_file_size(&self.database_file(&identity.origin, &file)),
            },
            Ok(None) => empty_details(identity),
            Err(error) => {
                warn!(database = %identity, error = %error, "database details unavailable");
                empty_details(identity)
            }
        }
    }

    fn maximum_size_for_database(&self, identity: &DatabaseIdentity) -> u64 {
        let state = self.lock_state();
        self.size_limit_locked(&state.connection, identity).unwrap_or_else(|error| {
            warn!(database = %identity, error = %error, "maximum size unavailable");
            0
        })
    }

    fn add_open_database(&self, database: Arc<dyn OpenDatabase>) {
        let identity = database.identity().clone();
        self.lock_open().entry(identity).or_default().push(database);
    }

    fn remove_open_database(&self, identity: &DatabaseIdentity, key: DatabaseKey) {
        let mut open = self.lock_open();
        if let Some(handles) = open.get_mut(identity) {
            handles.retain(|handle| handle.key() != key);
            if handles.is_empty() {
                open.remove(identity);
            }
        }
    }

    fn database_changed(&self, identity: &DatabaseIdentity) {
        let listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(listener) = listener {
            listener.database_changed(identity);
        }
    }
}

// ============================================================================
// SECTION: Sizing
// ============================================================================

/// Quota admission rule; a database always needs at least one byte.
fn admit(usage: u64, quota: u64, estimated_size: u64) -> Result<(), AdmissionError> {
    let requirement =
        usage.checked_add(estimated_size.max(1)).ok_or(AdmissionError::SizeOverflowed)?;
    if requirement <= quota { Ok(()) } else { Err(AdmissionError::QuotaExceeded) }
}

/// Largest size a database file may grow to within its origin quota.
fn maximum_size(quota: u64, usage: u64, file_size: u64) -> u64 {
    if usage > quota {
        return file_size;
    }
    let maximum = (quota - usage).saturating_add(file_size);
    if maximum > quota { file_size } else { maximum }
}

/// Size of a database file plus its write-ahead log; missing files count as zero.
fn database_file_size(path: &Path) -> u64 {
    let main = fs::metadata(path).map_or(0, |metadata| metadata.len());
    let wal = fs::metadata(side_file(path, "-wal")).map_or(0, |metadata| metadata.len());
    main.saturating_add(wal)
}

/// Path of an engine side file next to `path`.
fn side_file(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Removes a database file and its side files.
fn remove_database_file(path: &Path) -> Result<(), TrackerError> {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => return Err(error.into()),
    }
    for suffix in SIDE_FILE_SUFFIXES {
        if let Err(error) = fs::remove_file(side_file(path, suffix))
            && error.kind() != io::ErrorKind::NotFound
        {
            return Err(error.into());
        }
    }
    Ok(())
}

/// Converts a size to the registry's integer column type.
fn to_sql_size(size: u64) -> i64 {
    i64::try_from(size).unwrap_or(i64::MAX)
}

/// Details reported for unregistered databases.
fn empty_details(identity: &DatabaseIdentity) -> DatabaseDetails {
    DatabaseDetails {
        name: identity.name.clone(),
        display_name: String::new(),
        estimated_size: 0,
        current_usage: 0,
    }
}

// ============================================================================
// SECTION: Registry
// ============================================================================

/// Opens the registry connection.
fn open_registry(config: &TrackerConfig) -> Result<Connection, TrackerError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
    let connection = Connection::open_with_flags(config.directory.join(REGISTRY_FILE_NAME), flags)?;
    connection
        .execute_batch(&format!("PRAGMA journal_mode = {};", config.journal_mode.pragma_value()))?;
    connection.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
    Ok(connection)
}

/// Creates the registry schema or validates the existing version.
fn initialize_schema(connection: &mut Connection) -> Result<(), TrackerError> {
    let tx = connection.transaction()?;
    tx.execute_batch("CREATE TABLE IF NOT EXISTS TrackerMeta (version INTEGER NOT NULL);")?;
    let version: Option<i64> = tx
        .query_row("SELECT version FROM TrackerMeta LIMIT 1", params![], |row| row.get(0))
        .optional()?;
    match version {
        None => {
            tx.execute("INSERT INTO TrackerMeta (version) VALUES (?1)", params![SCHEMA_VERSION])?;
            tx.execute_batch(
                "CREATE TABLE IF NOT EXISTS Origins (
                    origin TEXT UNIQUE ON CONFLICT REPLACE,
                    quota INTEGER NOT NULL ON CONFLICT FAIL
                );
                CREATE TABLE IF NOT EXISTS Databases (
                    guid INTEGER PRIMARY KEY AUTOINCREMENT,
                    origin TEXT NOT NULL,
                    name TEXT NOT NULL,
                    displayName TEXT NOT NULL DEFAULT '',
                    estimatedSize INTEGER NOT NULL DEFAULT 0,
                    path TEXT NOT NULL,
                    UNIQUE (origin, name)
                );
                CREATE INDEX IF NOT EXISTS DatabasesOriginIndex ON Databases (origin);",
            )?;
        }
        Some(SCHEMA_VERSION) => {}
        Some(other) => {
            return Err(TrackerError::Invalid(format!("unsupported registry version: {other}")));
        }
    }
    tx.commit()?;
    Ok(())
}

/// Reads the stored quota of `origin`.
fn stored_quota(connection: &Connection, origin: &OriginId) -> Result<Option<u64>, TrackerError> {
    let quota: Option<i64> = connection
        .query_row("SELECT quota FROM Origins WHERE origin = ?1", params![origin.as_str()], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(quota.map(|quota| u64::try_from(quota).unwrap_or(0)))
}

/// Reads the file name registered for `identity`.
fn registered_file(
    connection: &Connection,
    identity: &DatabaseIdentity,
) -> Result<Option<String>, TrackerError> {
    Ok(connection
        .query_row(
            "SELECT path FROM Databases WHERE origin = ?1 AND name = ?2",
            params![identity.origin.as_str(), identity.name],
            |row| row.get(0),
        )
        .optional()?)
}

/// Lists the database names of `origin`.
fn database_names(connection: &Connection, origin: &OriginId) -> Result<Vec<String>, TrackerError> {
    let mut statement =
        connection.prepare("SELECT name FROM Databases WHERE origin = ?1 ORDER BY name")?;
    let names = statement
        .query_map(params![origin.as_str()], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

// ============================================================================
// SECTION: Tests
// ============================================================================
