// crates/originsql-core/src/runtime/version.rs
// ============================================================================
// Module: OriginSQL Version Tracking
// Description: Stored version access and the change-version transaction wrapper.
// Purpose: Keep the info-table version, cached version, and expected version consistent.
// Dependencies: crate::{core, interfaces}
// ============================================================================

//! ## Overview
//! Each database stores its version string in an internal info table. A
//! handle caches the last version it saw and the version its caller expects.
//! Version changes run as ordinary write transactions decorated with a
//! [`TransactionWrapper`] that checks the old version before any caller
//! statement and writes the new one just before commit.
//!
//! # Invariants
//! - The info table is only touched with the authorizer bypassed.
//! - A change-version commit either moves the stored, cached, and expected
//!   versions to the new value together, or leaves cached and expected at the
//!   old value.

// ============================================================================
// SECTION: Imports
// ============================================================================

use crate::core::AuthorizerBypass;
use crate::core::DATABASE_INFO_TABLE;
use crate::core::EngineError;
use crate::core::SharedAuthorizer;
use crate::core::SqlError;
use crate::core::SqlErrorCode;
use crate::core::SqlValue;
use crate::interfaces::SqlConnection;
use crate::runtime::database::DatabaseShared;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Key of the version row in the info table.
const VERSION_KEY: &str = "version";

// ============================================================================
// SECTION: Info Table Access
// ============================================================================

/// Returns true when the info table exists.
pub(crate) fn info_table_exists(
    connection: &mut dyn SqlConnection,
    authorizer: &SharedAuthorizer,
) -> Result<bool, EngineError> {
    let _bypass = AuthorizerBypass::new(authorizer);
    let rows = connection.execute(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        &[SqlValue::from(DATABASE_INFO_TABLE)],
    )?;
    let count = rows.rows.first().and_then(|row| row.first()).and_then(SqlValue::as_integer);
    Ok(count.unwrap_or(0) > 0)
}

/// Creates the info table.
pub(crate) fn create_info_table(
    connection: &mut dyn SqlConnection,
    authorizer: &SharedAuthorizer,
) -> Result<(), EngineError> {
    let _bypass = AuthorizerBypass::new(authorizer);
    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {DATABASE_INFO_TABLE} (key TEXT NOT NULL ON CONFLICT FAIL \
         UNIQUE ON CONFLICT REPLACE, value TEXT NOT NULL ON CONFLICT FAIL)"
    );
    connection.execute(&sql, &[])?;
    Ok(())
}

/// Reads the stored version; an absent row reads as the empty string.
pub(crate) fn read_stored_version(
    connection: &mut dyn SqlConnection,
    authorizer: &SharedAuthorizer,
) -> Result<String, EngineError> {
    let _bypass = AuthorizerBypass::new(authorizer);
    let sql = format!("SELECT value FROM {DATABASE_INFO_TABLE} WHERE key = ?1");
    let rows = connection.execute(&sql, &[SqlValue::from(VERSION_KEY)])?;
    let version = rows
        .rows
        .first()
        .and_then(|row| row.first())
        .and_then(SqlValue::as_text)
        .map(str::to_string);
    Ok(version.unwrap_or_default())
}

/// Writes the stored version.
pub(crate) fn write_stored_version(
    connection: &mut dyn SqlConnection,
    authorizer: &SharedAuthorizer,
    version: &str,
) -> Result<(), EngineError> {
    let _bypass = AuthorizerBypass::new(authorizer);
    let sql = format!("INSERT INTO {DATABASE_INFO_TABLE} (key, value) VALUES (?1, ?2)");
    connection.execute(&sql, &[SqlValue::from(VERSION_KEY), SqlValue::from(version)])?;
    Ok(())
}

// ============================================================================
// SECTION: Wrapper Access
// ============================================================================

/// Version operations available to a [`TransactionWrapper`] on the worker thread.
pub struct VersionAccess<'a> {
    /// Connection with the transaction open.
    connection: &'a mut dyn SqlConnection,
    /// Connection authorizer.
    authorizer: &'a SharedAuthorizer,
    /// Handle state holding cached and expected versions.
    database: &'a DatabaseShared,
}

impl<'a> VersionAccess<'a> {
    /// Bundles the pieces a wrapper needs.
    pub(crate) fn new(
        connection: &'a mut dyn SqlConnection,
        authorizer: &'a SharedAuthorizer,
        database: &'a DatabaseShared,
    ) -> Self {
        Self { connection, authorizer, database }
    }

    /// Reads the version stored in the database.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the info table cannot be read.
    pub fn read_version(&mut self) -> Result<String, EngineError> {
        read_stored_version(self.connection, self.authorizer)
    }

    /// Writes the version stored in the database.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the info table cannot be written.
    pub fn write_version(&mut self, version: &str) -> Result<(), EngineError> {
        write_stored_version(self.connection, self.authorizer, version)
    }

    /// Returns the handle's cached version.
    #[must_use]
    pub fn cached_version(&self) -> String {
        self.database.cached_version()
    }

    /// Replaces the handle's cached version.
    pub fn set_cached_version(&self, version: &str) {
        self.database.set_cached_version(version);
    }

    /// Replaces the handle's expected version.
    pub fn set_expected_version(&self, version: &str) {
        self.database.set_expected_version(version);
    }
}

// ============================================================================
// SECTION: Wrapper Contract
// ============================================================================

/// Hooks run around a transaction's statements on the worker thread.
pub trait TransactionWrapper: Send {
    /// Runs after the engine transaction begins and before the transaction callback.
    ///
    /// # Errors
    ///
    /// Returns [`SqlError`] to fail the transaction.
    fn perform_preflight(&mut self, access: &mut VersionAccess<'_>) -> Result<(), SqlError>;

    /// Runs after the last statement and before commit.
    ///
    /// # Errors
    ///
    /// Returns [`SqlError`] to fail the transaction.
    fn perform_postflight(&mut self, access: &mut VersionAccess<'_>) -> Result<(), SqlError>;

    /// Runs when the commit fails after a successful postflight.
    fn handle_commit_failed_after_postflight(&mut self, access: &mut VersionAccess<'_>);
}

// ============================================================================
// SECTION: Change Version
// ============================================================================

/// Wrapper that moves the stored version from `old_version` to `new_version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeVersionWrapper {
    /// Version the stored value must equal.
    old_version: String,
    /// Version written on success.
    new_version: String,
}

impl ChangeVersionWrapper {
    /// Creates a change-version wrapper.
    #[must_use]
    pub fn new(old_version: impl Into<String>, new_version: impl Into<String>) -> Self {
        Self { old_version: old_version.into(), new_version: new_version.into() }
    }
}

impl TransactionWrapper for ChangeVersionWrapper {
    fn perform_preflight(&mut self, access: &mut VersionAccess<'_>) -> Result<(), SqlError> {
        let actual = access.read_version().map_err(|error| {
            SqlError::with_engine(SqlErrorCode::Unknown, "unable to read the current version", &error)
        })?;
        if actual != self.old_version {
            return Err(SqlError::new(
                SqlErrorCode::VersionMismatch,
                "current version of the database and the old version argument do not match",
            ));
        }
        Ok(())
    }

    fn perform_postflight(&mut self, access: &mut VersionAccess<'_>) -> Result<(), SqlError> {
        access.write_version(&self.new_version).map_err(|error| {
            SqlError::with_engine(SqlErrorCode::Unknown, "unable to set new version in database", &error)
        })?;
        access.set_cached_version(&self.new_version);
        access.set_expected_version(&self.new_version);
        Ok(())
    }

    fn handle_commit_failed_after_postflight(&mut self, access: &mut VersionAccess<'_>) {
        access.set_cached_version(&self.old_version);
        access.set_expected_version(&self.old_version);
    }
}
