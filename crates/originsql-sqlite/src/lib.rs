// crates/originsql-sqlite/src/lib.rs
// ============================================================================
// Module: OriginSQL SQLite Library
// Description: SQLite-backed engine connections and origin tracker.
// Purpose: Provide the production collaborators for the OriginSQL runtime.
// Dependencies: originsql-core, rusqlite
// ============================================================================

//! ## Overview
//! This crate plugs `SQLite` into the OriginSQL runtime:
//! - [`SqliteConnectionFactory`] opens engine connections with the runtime's
//!   authorizer installed as the `SQLite` authorizer hook.
//! - [`SqliteDatabaseTracker`] keeps the per-origin registry of databases and
//!   quotas in its own `SQLite` file and owns the database files on disk.

pub mod engine;
pub mod tracker;

pub use engine::JournalMode;
pub use engine::SqliteConnection;
pub use engine::SqliteConnectionFactory;
pub use engine::SqliteEngineConfig;
pub use tracker::QuotaRecord;
pub use tracker::SqliteDatabaseTracker;
pub use tracker::TrackerChangeListener;
pub use tracker::TrackerConfig;
pub use tracker::TrackerError;
