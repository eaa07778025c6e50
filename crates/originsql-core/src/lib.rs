// crates/originsql-core/src/lib.rs
// ============================================================================
// Module: OriginSQL Core Library
// Description: Public API surface for the OriginSQL core.
// Purpose: Expose core types, interfaces, and runtime helpers.
// Dependencies: crate::{core, interfaces, runtime}
// ============================================================================

//! ## Overview
//! OriginSQL core implements an origin-scoped, asynchronous SQL database
//! service. Callers open named databases, queue transactions of SQL
//! statements, and receive results through callbacks delivered on their own
//! thread. A dedicated worker thread owns every engine connection and drives a
//! per-transaction state machine under per-database reader/writer admission.
//! Storage engines and the origin tracker plug in through explicit interfaces.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod core;
pub mod interfaces;
pub mod runtime;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use core::*;

pub use interfaces::AdmissionError;
pub use interfaces::CallbackScheduler;
pub use interfaces::CallerTask;
pub use interfaces::ConnectionFactory;
pub use interfaces::CreationTicket;
pub use interfaces::DatabaseClient;
pub use interfaces::DatabaseDetails;
pub use interfaces::DatabaseTracker;
pub use interfaces::InterruptHandle;
pub use interfaces::NoopDatabaseClient;
pub use interfaces::OpenDatabase;
pub use interfaces::SqlConnection;
pub use runtime::CallbackError;
pub use runtime::CallbackResult;
pub use runtime::CallerQueue;
pub use runtime::ChangeVersionWrapper;
pub use runtime::ContextOptions;
pub use runtime::Database;
pub use runtime::DatabaseContext;
pub use runtime::LockCoordinator;
pub use runtime::LockRequest;
pub use runtime::OpenRequest;
pub use runtime::Statement;
pub use runtime::TaskQueue;
pub use runtime::TransactionRequest;
pub use runtime::TransactionScope;
pub use runtime::TransactionState;
pub use runtime::TransactionWrapper;
pub use runtime::VersionAccess;
