// crates/originsql-core/src/core/error.rs
// ============================================================================
// Module: OriginSQL Errors
// Description: Error taxonomy for callers, engines, and synchronous APIs.
// Purpose: Keep engine failures, caller-visible SQL errors, and API errors distinct.
// Dependencies: serde, thiserror
// ============================================================================

//! ## Overview
//! Three layers of errors exist:
//! - [`EngineError`] is what a [`crate::interfaces::SqlConnection`] reports,
//!   classified into coarse [`EngineErrorKind`]s.
//! - [`SqlError`] is what transaction and statement error callbacks receive,
//!   carrying a stable [`SqlErrorCode`] and a human-readable message.
//! - [`DatabaseError`] is what synchronous calls such as opening a database
//!   return.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use serde::Serialize;
use thiserror::Error;

// ============================================================================
// SECTION: Engine Errors
// ============================================================================

/// Coarse classification of engine failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineErrorKind {
    /// Statement could not be compiled.
    Syntax,
    /// Placeholder count did not match the supplied arguments.
    ArgumentMismatch,
    /// The authorizer denied an action during compilation.
    Authorization,
    /// The database reached its maximum size.
    Full,
    /// A constraint was violated.
    Constraint,
    /// Execution was interrupted.
    Interrupted,
    /// The database file was busy or locked.
    Busy,
    /// Any other engine failure.
    Other,
}

impl EngineErrorKind {
    /// Returns a stable label for the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Syntax => "syntax",
            Self::ArgumentMismatch => "argument_mismatch",
            Self::Authorization => "authorization",
            Self::Full => "full",
            Self::Constraint => "constraint",
            Self::Interrupted => "interrupted",
            Self::Busy => "busy",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for EngineErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error reported by a storage engine connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("engine error ({kind}): {message}")]
pub struct EngineError {
    /// Failure classification.
    pub kind: EngineErrorKind,
    /// Engine-specific numeric code, when one exists.
    pub code: Option<i32>,
    /// Engine-provided message.
    pub message: String,
}

impl EngineError {
    /// Creates an engine error without a numeric code.
    #[must_use]
    pub fn new(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        Self { kind, code: None, message: message.into() }
    }

    /// Attaches an engine-specific numeric code.
    #[must_use]
    pub const fn with_code(mut self, code: i32) -> Self {
        self.code = Some(code);
        self
    }
}

// ============================================================================
// SECTION: SQL Errors
// ============================================================================

/// Stable error codes delivered to transaction and statement error callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlErrorCode {
    /// Unclassified failure, including callback failures.
    Unknown,
    /// Engine or storage failure.
    Database,
    /// Stored version did not match the expected version.
    VersionMismatch,
    /// Result or value was too large.
    TooLarge,
    /// Storage quota was reached.
    QuotaExceeded,
    /// Statement could not be prepared.
    Syntax,
    /// Constraint violation.
    Constraint,
    /// Lock or operation timed out.
    Timeout,
    /// The database thread shut down before the work finished.
    ShutdownInterrupted,
    /// The handle was closed or otherwise unusable.
    InvalidState,
}

impl SqlErrorCode {
    /// Returns the numeric code in the classic web SQL numbering.
    ///
    /// Codes without a web counterpart collapse onto `0` (unknown) or `1`
    /// (database).
    #[must_use]
    pub const fn numeric(self) -> u16 {
        match self {
            Self::Unknown | Self::InvalidState => 0,
            Self::Database | Self::ShutdownInterrupted => 1,
            Self::VersionMismatch => 2,
            Self::TooLarge => 3,
            Self::QuotaExceeded => 4,
            Self::Syntax => 5,
            Self::Constraint => 6,
            Self::Timeout => 7,
        }
    }

    /// Returns a stable label for the code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Database => "database",
            Self::VersionMismatch => "version_mismatch",
            Self::TooLarge => "too_large",
            Self::QuotaExceeded => "quota_exceeded",
            Self::Syntax => "syntax",
            Self::Constraint => "constraint",
            Self::Timeout => "timeout",
            Self::ShutdownInterrupted => "shutdown_interrupted",
            Self::InvalidState => "invalid_state",
        }
    }
}

impl fmt::Display for SqlErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error delivered to transaction and statement error callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{code}: {message}")]
pub struct SqlError {
    /// Error code.
    pub code: SqlErrorCode,
    /// Human-readable message.
    pub message: String,
}

impl SqlError {
    /// Creates a SQL error.
    #[must_use]
    pub fn new(code: SqlErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    /// Creates a SQL error whose message carries the engine's code and text.
    #[must_use]
    pub fn with_engine(code: SqlErrorCode, message: &str, engine: &EngineError) -> Self {
        let detail = engine.code.map_or_else(
            || format!("{message} ({})", engine.message),
            |value| format!("{message} ({value} {})", engine.message),
        );
        Self { code, message: detail }
    }
}

// ============================================================================
// SECTION: Database Errors
// ============================================================================

/// Errors returned by synchronous database and context operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DatabaseError {
    /// Stored version did not match the expected version.
    #[error("version mismatch: expected '{expected}', found '{actual}'")]
    VersionMismatch {
        /// Version the caller expected.
        expected: String,
        /// Version found in the database.
        actual: String,
    },
    /// The origin quota does not admit the database.
    #[error("database size exceeds the origin quota")]
    QuotaExceeded,
    /// Usage plus the requested size overflowed.
    #[error("requested database size overflows the origin usage")]
    SizeOverflowed,
    /// The database or its origin is being deleted.
    #[error("database is being deleted")]
    DatabaseIsBeingDeleted,
    /// Operation is not valid in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Admission was refused for a policy reason.
    #[error("security error: {0}")]
    GenericSecurityError(String),
    /// Engine failure.
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// The database thread shut down before the call completed.
    #[error("database thread is shutting down")]
    ShutdownInterrupted,
    /// Filesystem failure.
    #[error("io error: {0}")]
    Io(String),
}

// ============================================================================
// SECTION: Tests
// ============================================================================
