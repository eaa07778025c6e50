// crates/originsql-core/src/core/identifiers.rs
// ============================================================================
// Module: OriginSQL Identifiers
// Description: Origin, database, and transaction identifiers.
// Purpose: Provide strongly typed IDs with stable string forms.
// Dependencies: serde, thiserror
// ============================================================================

//! ## Overview
//! Origins are the isolation and quota boundary. An [`OriginId`] is used
//! verbatim as a directory name on disk, so its character set is validated at
//! construction. Database names are arbitrary strings scoped to an origin and
//! never touch the filesystem directly.
//!
//! # Invariants
//! - An [`OriginId`] is 1..=255 bytes of `[A-Za-z0-9._-]` and is never `.` or `..`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

// ============================================================================
// SECTION: Limits
// ============================================================================

/// Maximum byte length of an origin identifier.
pub const MAX_ORIGIN_ID_LENGTH: usize = 255;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Identifier validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    /// Identifier was empty.
    #[error("origin identifier must not be empty")]
    Empty,
    /// Identifier exceeded the maximum length.
    #[error("origin identifier exceeds {MAX_ORIGIN_ID_LENGTH} bytes")]
    TooLong,
    /// Identifier contained a character outside the allowed set.
    #[error("origin identifier contains invalid character '{0}'")]
    InvalidCharacter(char),
    /// Identifier is a relative path component.
    #[error("origin identifier must not be a relative path component")]
    Reserved,
}

// ============================================================================
// SECTION: Origin
// ============================================================================

/// Origin identifier; the isolation and quota boundary.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OriginId(String);

impl OriginId {
    /// Creates a validated origin identifier.
    ///
    /// # Errors
    ///
    /// Returns [`IdentifierError`] when the identifier is empty, too long,
    /// reserved, or contains characters outside `[A-Za-z0-9._-]`.
    pub fn new(id: impl Into<String>) -> Result<Self, IdentifierError> {
        let id = id.into();
        validate_origin_id(&id)?;
        Ok(Self(id))
    }

    /// Builds an origin identifier from a scheme, host, and port triple.
    ///
    /// The result has the form `scheme_host_port`. Characters outside the
    /// allowed set are replaced with `_` so hosts such as IPv6 literals stay
    /// usable as directory names.
    ///
    /// # Errors
    ///
    /// Returns [`IdentifierError`] when the resulting identifier is empty or too long.
    pub fn from_parts(scheme: &str, host: &str, port: u16) -> Result<Self, IdentifierError> {
        let raw = format!("{scheme}_{host}_{port}");
        let sanitized: String =
            raw.chars().map(|ch| if is_origin_char(ch) { ch } else { '_' }).collect();
        Self::new(sanitized)
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OriginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl TryFrom<String> for OriginId {
    type Error = IdentifierError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for OriginId {
    type Error = IdentifierError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<OriginId> for String {
    fn from(value: OriginId) -> Self {
        value.0
    }
}

/// Returns true when `ch` may appear in an origin identifier.
const fn is_origin_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-')
}

/// Validates the origin identifier character set and length.
fn validate_origin_id(id: &str) -> Result<(), IdentifierError> {
    if id.is_empty() {
        return Err(IdentifierError::Empty);
    }
    if id.len() > MAX_ORIGIN_ID_LENGTH {
        return Err(IdentifierError::TooLong);
    }
    if id == "." || id == ".." {
        return Err(IdentifierError::Reserved);
    }
    if let Some(ch) = id.chars().find(|ch| !is_origin_char(*ch)) {
        return Err(IdentifierError::InvalidCharacter(ch));
    }
    Ok(())
}

// ============================================================================
// SECTION: Database Identity
// ============================================================================

/// Unique identity of a database: its origin plus its name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DatabaseIdentity {
    /// Owning origin.
    pub origin: OriginId,
    /// Database name, unique within the origin.
    pub name: String,
}

impl DatabaseIdentity {
    /// Creates a database identity.
    #[must_use]
    pub fn new(origin: OriginId, name: impl Into<String>) -> Self {
        Self { origin, name: name.into() }
    }
}

impl fmt::Display for DatabaseIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.origin, self.name)
    }
}

// ============================================================================
// SECTION: Handles
// ============================================================================

/// Worker-local key for one open database handle.
///
/// Two handles to the same identity have distinct keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatabaseKey(u64);

impl DatabaseKey {
    /// Creates a database key from a raw value.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw key value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DatabaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Worker-assigned transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(u64);

impl TransactionId {
    /// Creates a transaction identifier from a raw value.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw identifier value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
