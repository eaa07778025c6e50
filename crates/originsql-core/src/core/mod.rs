// crates/originsql-core/src/core/mod.rs
// ============================================================================
// Module: OriginSQL Core Types
// Description: Identifiers, values, errors, authorization, and events.
// Purpose: Provide the shared vocabulary used by runtime and backends.
// Dependencies: serde, thiserror
// ============================================================================

//! ## Overview
//! Core types are plain data: origin and database identifiers, SQL values and
//! result sets, the error taxonomy surfaced to callers, the statement
//! authorizer policy, and the structured event records emitted on lifecycle
//! changes.

// ============================================================================
// SECTION: Submodules
// ============================================================================

pub mod authorizer;
pub mod error;
pub mod events;
pub mod identifiers;
pub mod value;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use authorizer::AuthorizerAction;
pub use authorizer::AuthorizerBypass;
pub use authorizer::AuthorizerDecision;
pub use authorizer::AuthorizerPermission;
pub use authorizer::AuthorizerPolicy;
pub use authorizer::DATABASE_INFO_TABLE;
pub use authorizer::DEFAULT_ALLOWED_FUNCTIONS;
pub use authorizer::DatabaseAuthorizer;
pub use authorizer::SharedAuthorizer;
pub use error::DatabaseError;
pub use error::EngineError;
pub use error::EngineErrorKind;
pub use error::SqlError;
pub use error::SqlErrorCode;
pub use events::DatabaseEvent;
pub use events::DatabaseEventKind;
pub use events::DatabaseEventSink;
pub use events::FileEventSink;
pub use events::NoopEventSink;
pub use events::StderrEventSink;
pub use identifiers::DatabaseIdentity;
pub use identifiers::DatabaseKey;
pub use identifiers::IdentifierError;
pub use identifiers::OriginId;
pub use identifiers::TransactionId;
pub use value::ResultSet;
pub use value::SqlValue;
