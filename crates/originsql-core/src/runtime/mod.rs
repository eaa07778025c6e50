// crates/originsql-core/src/runtime/mod.rs
// ============================================================================
// Module: OriginSQL Runtime
// Description: Worker thread, transaction engine, and caller-facing handles.
// Purpose: Group the runtime pieces behind one module boundary.
// Dependencies: crate::{core, interfaces}
// ============================================================================

//! ## Overview
//! Runtime components that drive databases on the worker thread and deliver
//! results to the caller thread.

pub mod callbacks;
pub mod context;
pub mod coordinator;
pub mod database;
pub mod statement;
pub mod task_queue;
pub(crate) mod thread;
pub mod transaction;
pub mod version;

pub use callbacks::CallerQueue;
pub use context::ContextOptions;
pub use context::DatabaseContext;
pub use context::OpenRequest;
pub use coordinator::LockCoordinator;
pub use coordinator::LockRequest;
pub use database::Database;
pub use statement::CallbackError;
pub use statement::CallbackResult;
pub use statement::Statement;
pub use statement::TransactionScope;
pub use task_queue::TaskQueue;
pub use transaction::TransactionRequest;
pub use transaction::TransactionState;
pub use version::ChangeVersionWrapper;
pub use version::TransactionWrapper;
pub use version::VersionAccess;
