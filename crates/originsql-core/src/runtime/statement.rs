// crates/originsql-core/src/runtime/statement.rs
// ============================================================================
// Module: OriginSQL Statements
// Description: Queued SQL statements, their callbacks, and worker-side execution.
// Purpose: Turn engine outcomes into caller-visible results and errors.
// Dependencies: crate::{core, interfaces}
// ============================================================================

//! ## Overview
//! Callers build [`Statement`]s and queue them through a [`TransactionScope`],
//! which only exists while a transaction or statement callback is running.
//! The worker executes each statement under the authorizer and classifies
//! failures into [`SqlErrorCode`]s.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::PoisonError;

use thiserror::Error;

use crate::core::AuthorizerPermission;
use crate::core::EngineError;
use crate::core::EngineErrorKind;
use crate::core::ResultSet;
use crate::core::SharedAuthorizer;
use crate::core::SqlError;
use crate::core::SqlErrorCode;
use crate::core::SqlValue;
use crate::interfaces::SqlConnection;

// ============================================================================
// SECTION: Callback Types
// ============================================================================

/// Failure raised by a caller callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("callback failed: {0}")]
pub struct CallbackError(pub String);

impl CallbackError {
    /// Creates a callback failure.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Outcome of a caller callback.
pub type CallbackResult = Result<(), CallbackError>;

/// Called with the rows of a successful statement.
pub type StatementSuccessCallback =
    Box<dyn FnOnce(&mut TransactionScope, &ResultSet) -> CallbackResult + Send>;

/// Called with a statement's error; returning true fails the transaction.
pub type StatementErrorCallback = Box<dyn FnOnce(&mut TransactionScope, &SqlError) -> bool + Send>;

// ============================================================================
// SECTION: Statement
// ============================================================================

/// A SQL statement with arguments and optional callbacks.
pub struct Statement {
    /// SQL text.
    sql: String,
    /// Positional arguments.
    arguments: Vec<SqlValue>,
    /// Success callback.
    on_success: Option<StatementSuccessCallback>,
    /// Error callback.
    on_error: Option<StatementErrorCallback>,
}

impl Statement {
    /// Creates a statement without arguments or callbacks.
    #[must_use]
    pub fn new(sql: impl Into<String>) -> Self {
        Self { sql: sql.into(), arguments: Vec::new(), on_success: None, on_error: None }
    }

    /// Replaces the positional arguments.
    #[must_use]
    pub fn arguments(mut self, arguments: impl IntoIterator<Item = SqlValue>) -> Self {
        self.arguments = arguments.into_iter().collect();
        self
    }

    /// Appends one positional argument.
    #[must_use]
    pub fn bind(mut self, value: impl Into<SqlValue>) -> Self {
        self.arguments.push(value.into());
        self
    }

    /// Sets the success callback.
    #[must_use]
    pub fn on_success(
        mut self,
        callback: impl FnOnce(&mut TransactionScope, &ResultSet) -> CallbackResult + Send + 'static,
    ) -> Self {
        self.on_success = Some(Box::new(callback));
        self
    }

    /// Sets the error callback; return `false` to keep the transaction going.
    #[must_use]
    pub fn on_error(
        mut self,
        callback: impl FnOnce(&mut TransactionScope, &SqlError) -> bool + Send + 'static,
    ) -> Self {
        self.on_error = Some(Box::new(callback));
        self
    }

    /// Returns the SQL text.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }
}

// ============================================================================
// SECTION: Transaction Scope
// ============================================================================

/// Statement queue handed to transaction and statement callbacks.
///
/// Statements queued here run after the callback returns, in queue order.
pub struct TransactionScope {
    /// True inside read-only transactions.
    read_only: bool,
    /// Statements queued by the callback.
    statements: Vec<Statement>,
}

impl TransactionScope {
    /// Creates an empty scope.
    pub(crate) const fn new(read_only: bool) -> Self {
        Self { read_only, statements: Vec::new() }
    }

    /// Returns true inside read-only transactions.
    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Queues a statement without callbacks.
    pub fn execute_sql(
        &mut self,
        sql: impl Into<String>,
        arguments: impl IntoIterator<Item = SqlValue>,
    ) {
        self.statements.push(Statement::new(sql).arguments(arguments));
    }

    /// Queues a fully configured statement.
    pub fn execute(&mut self, statement: Statement) {
        self.statements.push(statement);
    }

    /// Returns the number of statements queued so far.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.statements.len()
    }

    /// Consumes the scope, returning its statements.
    pub(crate) fn into_statements(self) -> Vec<Statement> {
        self.statements
    }
}

// ============================================================================
// SECTION: Worker-Side Execution
// ============================================================================

/// A statement owned by a running transaction.
pub(crate) struct QueuedStatement {
    /// Statement and callbacks.
    pub(crate) statement: Statement,
    /// Outcome of the last execution.
    pub(crate) outcome: Option<Result<ResultSet, SqlError>>,
    /// The last execution hit the size limit.
    pub(crate) failed_due_to_quota: bool,
    /// The statement already ran again after a quota increase.
    pub(crate) retried_after_quota: bool,
}

impl QueuedStatement {
    /// Wraps a caller statement.
    pub(crate) const fn new(statement: Statement) -> Self {
        Self { statement, outcome: None, failed_due_to_quota: false, retried_after_quota: false }
    }

    /// Returns true when a size-limit failure may still ask the client for
    /// more space; each statement is retried at most once.
    pub(crate) const fn may_request_quota(&self) -> bool {
        self.failed_due_to_quota && !self.retried_after_quota
    }

    /// Returns true when an error callback is attached.
    pub(crate) const fn has_error_callback(&self) -> bool {
        self.statement.on_error.is_some()
    }

    /// Returns true when a success callback is attached.
    pub(crate) const fn has_success_callback(&self) -> bool {
        self.statement.on_success.is_some()
    }

    /// Returns the recorded error, if the last execution failed.
    pub(crate) fn error(&self) -> Option<SqlError> {
        match &self.outcome {
            Some(Err(error)) => Some(error.clone()),
            _ => None,
        }
    }

    /// Moves the callbacks and outcome out for delivery on the caller thread.
    pub(crate) fn take_for_delivery(&mut self) -> StatementDelivery {
        StatementDelivery {
            outcome: self.outcome.take(),
            on_success: self.statement.on_success.take(),
            on_error: self.statement.on_error.take(),
        }
    }

    /// Executes the statement, recording its outcome.
    ///
    /// `blocked` short-circuits execution with a pre-computed error, used for
    /// interrupted or version-mismatched databases.
    pub(crate) fn execute(
        &mut self,
        connection: &mut dyn SqlConnection,
        authorizer: &SharedAuthorizer,
        read_only: bool,
        blocked: Option<SqlError>,
    ) -> ExecutionOutcome {
        self.failed_due_to_quota = false;
        if let Some(error) = blocked {
            self.outcome = Some(Err(error));
            return ExecutionOutcome::Failed;
        }
        {
            let mut guard = authorizer.lock().unwrap_or_else(PoisonError::into_inner);
            guard.reset();
            if read_only {
                guard.set_permission(AuthorizerPermission::ReadOnly);
            }
        }
        let result = connection.execute(&self.statement.sql, &self.statement.arguments);
        let (was_insert, changed) = {
            let guard = authorizer.lock().unwrap_or_else(PoisonError::into_inner);
            (guard.last_action_was_insert(), guard.last_action_changed_database())
        };
        match result {
            Ok(mut rows) => {
                if !changed {
                    rows.rows_affected = 0;
                }
                if !was_insert {
                    rows.insert_id = None;
                }
                self.outcome = Some(Ok(rows));
                ExecutionOutcome::Succeeded { modified: changed }
            }
            Err(error) => {
                self.failed_due_to_quota = error.kind == EngineErrorKind::Full;
                self.outcome = Some(Err(classify_statement_error(&error)));
                ExecutionOutcome::Failed
            }
        }
    }
}

/// Result of one statement execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExecutionOutcome {
    /// The statement ran; `modified` is set when it changed the database.
    Succeeded {
        /// The statement changed the database.
        modified: bool,
    },
    /// The statement failed; the error is recorded on the statement.
    Failed,
}

/// Callbacks and outcome moved out of a statement for delivery.
pub(crate) struct StatementDelivery {
    /// Outcome of the statement.
    pub(crate) outcome: Option<Result<ResultSet, SqlError>>,
    /// Success callback.
    pub(crate) on_success: Option<StatementSuccessCallback>,
    /// Error callback.
    pub(crate) on_error: Option<StatementErrorCallback>,
}

/// Maps an engine failure onto the caller-visible error taxonomy.
pub(crate) fn classify_statement_error(error: &EngineError) -> SqlError {
    match error.kind {
        EngineErrorKind::Syntax | EngineErrorKind::Authorization => {
            SqlError::with_engine(SqlErrorCode::Syntax, "could not prepare statement", error)
        }
        EngineErrorKind::ArgumentMismatch => SqlError::new(
            SqlErrorCode::Syntax,
            "number of '?'s in statement string does not match argument count",
        ),
        EngineErrorKind::Full => SqlError::new(
            SqlErrorCode::QuotaExceeded,
            "there was not enough remaining storage space, or the storage quota was reached and \
             the user declined to allow more space",
        ),
        EngineErrorKind::Constraint => SqlError::with_engine(
            SqlErrorCode::Constraint,
            "could not execute statement due to a constraint failure",
            error,
        ),
        EngineErrorKind::Interrupted => {
            SqlError::new(SqlErrorCode::Database, "the database was interrupted")
        }
        EngineErrorKind::Busy => {
            SqlError::with_engine(SqlErrorCode::Timeout, "the database is busy", error)
        }
        EngineErrorKind::Other => {
            SqlError::with_engine(SqlErrorCode::Database, "could not execute statement", error)
        }
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(clippy::missing_docs_in_private_items, reason = "Test names describe the cases.")]

    use super::classify_statement_error;
    use crate::core::EngineError;
    use crate::core::EngineErrorKind;
    use crate::core::SqlErrorCode;

    #[test]
    fn engine_failures_map_to_sql_codes() {
        let cases = [
            (EngineErrorKind::Syntax, SqlErrorCode::Syntax),
            (EngineErrorKind::Authorization, SqlErrorCode::Syntax),
            (EngineErrorKind::ArgumentMismatch, SqlErrorCode::Syntax),
            (EngineErrorKind::Full, SqlErrorCode::QuotaExceeded),
            (EngineErrorKind::Constraint, SqlErrorCode::Constraint),
            (EngineErrorKind::Interrupted, SqlErrorCode::Database),
            (EngineErrorKind::Busy, SqlErrorCode::Timeout),
            (EngineErrorKind::Other, SqlErrorCode::Database),
        ];
        for (kind, expected) in cases {
            let error = classify_statement_error(&EngineError::new(kind, "detail"));
            assert_eq!(error.code, expected, "kind {kind}");
        }
    }
}
