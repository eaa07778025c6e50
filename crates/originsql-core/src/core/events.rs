// crates/originsql-core/src/core/events.rs
// ============================================================================
// Module: OriginSQL Lifecycle Events
// Description: Structured events for database, origin, and transaction lifecycle.
// Purpose: Emit JSON-line records without hard logging dependencies.
// Dependencies: serde, serde_json
// ============================================================================

//! ## Overview
//! Event records describe lifecycle changes: databases opened, closed, and
//! deleted, origins deleted, transactions committed or failed, quota
//! refusals, and worker shutdown. Sinks route them to stderr, an append-only
//! file, or nowhere. Diagnostics that are not lifecycle records go through
//! `tracing` instead.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs::OpenOptions;
use std::io;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde::Serialize;

use crate::core::identifiers::DatabaseIdentity;
use crate::core::identifiers::OriginId;
use crate::core::identifiers::TransactionId;

// ============================================================================
// SECTION: Types
// ============================================================================

/// Lifecycle event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseEventKind {
    /// A database handle finished opening.
    DatabaseOpened,
    /// A database handle closed.
    DatabaseClosed,
    /// A database was deleted from disk and the registry.
    DatabaseDeleted,
    /// Every database of an origin was deleted.
    OriginDeleted,
    /// A transaction committed.
    TransactionCommitted,
    /// A transaction ended in failure.
    TransactionFailed,
    /// An admission or statement ran into the origin quota.
    QuotaExceeded,
    /// A database worker thread finished shutting down.
    WorkerShutdown,
}

/// Lifecycle event payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatabaseEvent {
    /// Event kind.
    pub event: DatabaseEventKind,
    /// Event timestamp (milliseconds since epoch).
    pub timestamp_ms: u128,
    /// Origin the event concerns, when any.
    pub origin: Option<String>,
    /// Database name the event concerns, when any.
    pub database: Option<String>,
    /// Transaction identifier, when any.
    pub transaction_id: Option<u64>,
    /// Free-form detail.
    pub message: Option<String>,
}

impl DatabaseEvent {
    /// Creates an event stamped with the current time.
    #[must_use]
    pub fn new(event: DatabaseEventKind) -> Self {
        let timestamp_ms =
            SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |duration| duration.as_millis());
        Self {
            event,
            timestamp_ms,
            origin: None,
            database: None,
            transaction_id: None,
            message: None,
        }
    }

    /// Attaches a database identity.
    #[must_use]
    pub fn with_identity(mut self, identity: &DatabaseIdentity) -> Self {
        self.origin = Some(identity.origin.to_string());
        self.database = Some(identity.name.clone());
        self
    }

    /// Attaches an origin.
    #[must_use]
    pub fn with_origin(mut self, origin: &OriginId) -> Self {
        self.origin = Some(origin.to_string());
        self
    }

    /// Attaches a transaction identifier.
    #[must_use]
    pub const fn with_transaction(mut self, transaction: TransactionId) -> Self {
        self.transaction_id = Some(transaction.get());
        self
    }

    /// Attaches a detail message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

// ============================================================================
// SECTION: Sinks
// ============================================================================

/// Event sink for lifecycle records.
pub trait DatabaseEventSink: Send + Sync {
    /// Record an event.
    fn record(&self, event: &DatabaseEvent);
}

/// Event sink that logs JSON lines to stderr.
pub struct StderrEventSink;

impl DatabaseEventSink for StderrEventSink {
    fn record(&self, event: &DatabaseEvent) {
        if let Ok(payload) = serde_json::to_string(event) {
            let _ = writeln!(std::io::stderr(), "{payload}");
        }
    }
}

/// Event sink that appends JSON lines to a file.
pub struct FileEventSink {
    /// File handle used for append-only logging.
    file: Mutex<std::fs::File>,
}

impl FileEventSink {
    /// Opens the event log file in append mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn new(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file: Mutex::new(file) })
    }
}

impl DatabaseEventSink for FileEventSink {
    fn record(&self, event: &DatabaseEvent) {
        if let Ok(payload) = serde_json::to_string(event)
            && let Ok(mut file) = self.file.lock()
        {
            let _ = writeln!(file, "{payload}");
            let _ = file.flush();
        }
    }
}

/// No-op event sink.
pub struct NoopEventSink;

impl DatabaseEventSink for NoopEventSink {
    fn record(&self, _event: &DatabaseEvent) {}
}

// ============================================================================
// SECTION: Tests
// ============================================================================
