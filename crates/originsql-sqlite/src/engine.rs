// crates/originsql-sqlite/src/engine.rs
// ============================================================================
// Module: SQLite Engine Connection
// Description: rusqlite-backed implementation of the runtime's engine contract.
// Purpose: Execute caller SQL under the runtime authorizer with size limits.
// Dependencies: originsql-core, rusqlite, serde, tracing
// ============================================================================

//! ## Overview
//! [`SqliteConnection`] adapts a [`rusqlite::Connection`] to
//! [`originsql_core::SqlConnection`]. The runtime's
//! [`originsql_core::DatabaseAuthorizer`] is installed as the `SQLite`
//! authorizer hook, so every statement compiled on the connection is checked
//! against the origin sandbox policy. Database files are opened with
//! incremental auto-vacuum so space freed by deletes can be returned after
//! commit.
//!
//! Security posture: caller SQL is untrusted; the authorizer hook is the
//! enforcement point and the connection never runs caller SQL without it.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::Path;
use std::sync::Arc;
use std::sync::PoisonError;
use std::time::Duration;

use originsql_core::AuthorizerAction;
use originsql_core::AuthorizerDecision;
use originsql_core::ConnectionFactory;
use originsql_core::EngineError;
use originsql_core::EngineErrorKind;
use originsql_core::InterruptHandle;
use originsql_core::ResultSet;
use originsql_core::SharedAuthorizer;
use originsql_core::SqlConnection;
use originsql_core::SqlValue;
use rusqlite::Connection;
use rusqlite::ErrorCode;
use rusqlite::OpenFlags;
use rusqlite::hooks::AuthAction;
use rusqlite::hooks::AuthContext;
use rusqlite::hooks::Authorization;
use rusqlite::params_from_iter;
use rusqlite::types::Value;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default busy timeout (ms).
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
/// Default free-page percentage that triggers an incremental vacuum.
const DEFAULT_VACUUM_FREE_RATIO_PERCENT: u8 = 10;

// ============================================================================
// SECTION: Config
// ============================================================================

/// `SQLite` journal mode configuration.
///
/// # Invariants
/// - Values map 1:1 to `SQLite` `journal_mode` pragma settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JournalMode {
    /// Rollback journal deleted at commit.
    #[default]
    Delete,
    /// Rollback journal truncated at commit.
    Truncate,
    /// Write-ahead log.
    Wal,
}

impl JournalMode {
    /// Returns the `SQLite` pragma value.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Delete => "delete",
            Self::Truncate => "truncate",
            Self::Wal => "wal",
        }
    }
}

/// Settings applied to every engine connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteEngineConfig {
    /// Journal mode.
    pub journal_mode: JournalMode,
    /// Busy timeout in milliseconds.
    pub busy_timeout_ms: u64,
    /// Free-page percentage at which a commit that deleted data vacuums.
    pub vacuum_free_ratio_percent: u8,
    /// Enforce foreign keys.
    pub foreign_keys: bool,
}

impl Default for SqliteEngineConfig {
    fn default() -> Self {
        Self {
            journal_mode: JournalMode::default(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            vacuum_free_ratio_percent: DEFAULT_VACUUM_FREE_RATIO_PERCENT,
            foreign_keys: true,
        }
    }
}

// ============================================================================
// SECTION: Factory
// ============================================================================

/// Opens [`SqliteConnection`]s.
#[derive(Debug, Clone, Default)]
pub struct SqliteConnectionFactory {
    /// Per-connection settings.
    config: SqliteEngineConfig,
}

impl SqliteConnectionFactory {
    /// Creates a factory with the given settings.
    #[must_use]
    pub const fn new(config: SqliteEngineConfig) -> Self {
        Self { config }
    }

    /// Returns the per-connection settings.
    #[must_use]
    pub const fn config(&self) -> &SqliteEngineConfig {
        &self.config
    }
}

impl ConnectionFactory for SqliteConnectionFactory {
    fn open(
        &self,
        path: &Path,
        authorizer: SharedAuthorizer,
    ) -> Result<Box<dyn SqlConnection>, EngineError> {
        let connection = SqliteConnection::open(path, authorizer, &self.config)?;
        Ok(Box::new(connection))
    }
}

// ============================================================================
// SECTION: Connection
// ============================================================================

/// Engine connection with the runtime authorizer installed.
pub struct SqliteConnection {
    /// Underlying connection.
    connection: Connection,
    /// Interrupt handle usable from any thread.
    interrupt: Arc<SqliteInterrupt>,
    /// Free-page percentage that triggers a vacuum.
    vacuum_free_ratio_percent: u8,
}

impl SqliteConnection {
    /// Opens or creates the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the file cannot be opened or configured.
    pub fn open(
        path: &Path,
        authorizer: SharedAuthorizer,
        config: &SqliteEngineConfig,
    ) -> Result<Self, EngineError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let connection =
            Connection::open_with_flags(path, flags).map_err(|err| step_error(&err))?;
        apply_pragmas(&connection, config)?;
        install_authorizer(&connection, authorizer)?;
        let interrupt = Arc::new(SqliteInterrupt(connection.get_interrupt_handle()));
        debug!(path = %path.display(), "sqlite connection opened");
        Ok(Self {
            connection,
            interrupt,
            vacuum_free_ratio_percent: config.vacuum_free_ratio_percent,
        })
    }

    /// Reads a single integer pragma.
    fn pragma_integer(&self, pragma: &str) -> Result<i64, EngineError> {
        self.connection
            .query_row(&format!("PRAGMA {pragma}"), [], |row| row.get::<_, i64>(0))
            .map_err(|err| step_error(&err))
    }
}

impl SqlConnection for SqliteConnection {
    fn begin(&mut self, read_only: bool) -> Result<(), EngineError> {
        let sql = if read_only { "BEGIN" } else { "BEGIN IMMEDIATE" };
        self.connection.execute_batch(sql).map_err(|err| step_error(&err))
    }

    fn commit(&mut self) -> Result<(), EngineError> {
        self.connection.execute_batch("COMMIT").map_err(|err| step_error(&err))
    }

    fn rollback(&mut self) -> Result<(), EngineError> {
        self.connection.execute_batch("ROLLBACK").map_err(|err| step_error(&err))
    }

    fn in_transaction(&self) -> bool {
        !self.connection.is_autocommit()
    }

    fn execute(&mut self, sql: &str, arguments: &[SqlValue]) -> Result<ResultSet, EngineError> {
        let mut statement = self.connection.prepare(sql).map_err(|err| prepare_error(&err))?;
        if statement.parameter_count() != arguments.len() {
            return Err(EngineError::new(
                EngineErrorKind::ArgumentMismatch,
                format!(
                    "statement expects {} arguments, got {}",
                    statement.parameter_count(),
                    arguments.len()
                ),
            ));
        }
        let columns: Vec<String> =
            statement.column_names().into_iter().map(str::to_string).collect();
        let column_count = columns.len();
        let mut rows = Vec::new();
        {
            let mut cursor = statement
                .query(params_from_iter(arguments.iter().map(to_engine_value)))
                .map_err(|err| step_error(&err))?;
            while let Some(row) = cursor.next().map_err(|err| step_error(&err))? {
                let mut values = Vec::with_capacity(column_count);
                for index in 0..column_count {
                    let value = row.get::<_, Value>(index).map_err(|err| step_error(&err))?;
                    values.push(from_engine_value(value));
                }
                rows.push(values);
            }
        }
        drop(statement);
        let rows_affected = self.connection.changes();
        let insert_id = Some(self.connection.last_insert_rowid());
        Ok(ResultSet { columns, rows, rows_affected, insert_id })
    }

    fn set_maximum_size(&mut self, bytes: u64) -> Result<(), EngineError> {
        let page_size = u64::try_from(self.pragma_integer("page_size")?).unwrap_or(0);
        if page_size == 0 {
            return Ok(());
        }
        let pages = bytes.div_ceil(page_size);
        let pages = i64::try_from(pages).unwrap_or(i64::MAX);
        self.pragma_integer(&format!("max_page_count = {pages}"))?;
        Ok(())
    }

    fn incremental_vacuum_if_needed(&mut self) -> Result<(), EngineError> {
        let free_pages = self.pragma_integer("freelist_count")?;
        let total_pages = self.pragma_integer("page_count")?;
        if total_pages <= 0 || free_pages <= 0 {
            return Ok(());
        }
        if free_pages * 100 / total_pages >= i64::from(self.vacuum_free_ratio_percent) {
            debug!(free_pages, total_pages, "running incremental vacuum");
            self.connection
                .execute_batch("PRAGMA incremental_vacuum")
                .map_err(|err| step_error(&err))?;
        }
        Ok(())
    }

    fn table_names(&mut self) -> Result<Vec<String>, EngineError> {
        let mut statement = self
            .connection
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .map_err(|err| prepare_error(&err))?;
        let names = statement
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|err| step_error(&err))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| step_error(&err))?;
        Ok(names.into_iter().filter(|name| !name.starts_with("sqlite_")).collect())
    }

    fn interrupt_handle(&self) -> Arc<dyn InterruptHandle> {
        Arc::clone(&self.interrupt) as Arc<dyn InterruptHandle>
    }
}

/// Thread-safe interrupt for a [`SqliteConnection`].
struct SqliteInterrupt(rusqlite::InterruptHandle);

impl InterruptHandle for SqliteInterrupt {
    fn interrupt(&self) {
        self.0.interrupt();
    }
}

// ============================================================================
// SECTION: Setup
// ============================================================================

/// Applies connection pragmas.
fn apply_pragmas(connection: &Connection, config: &SqliteEngineConfig) -> Result<(), EngineError> {
    connection.execute_batch("PRAGMA auto_vacuum = 2;").map_err(|err| step_error(&err))?;
    let foreign_keys = if config.foreign_keys { "ON" } else { "OFF" };
    connection
        .execute_batch(&format!("PRAGMA foreign_keys = {foreign_keys};"))
        .map_err(|err| step_error(&err))?;
    connection
        .execute_batch(&format!("PRAGMA journal_mode = {};", config.journal_mode.pragma_value()))
        .map_err(|err| step_error(&err))?;
    connection
        .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
        .map_err(|err| step_error(&err))?;
    Ok(())
}

/// Installs `authorizer` as the connection's authorizer hook.
fn install_authorizer(
    connection: &Connection,
    authorizer: SharedAuthorizer,
) -> Result<(), EngineError> {
    connection
        .authorizer(Some(move |context: AuthContext<'_>| {
            let action = map_action(&context.action);
            let decision =
                authorizer.lock().unwrap_or_else(PoisonError::into_inner).authorize(&action);
            match decision {
                AuthorizerDecision::Allow => Authorization::Allow,
                AuthorizerDecision::Deny => Authorization::Deny,
                AuthorizerDecision::Ignore => Authorization::Ignore,
            }
        }))
        .map_err(|err| step_error(&err))
}

/// Maps a `SQLite` authorizer action onto the runtime's action vocabulary.
fn map_action<'a>(action: &AuthAction<'a>) -> AuthorizerAction<'a> {
    match *action {
        AuthAction::CreateTable { table_name } => {
            AuthorizerAction::CreateTable { table: table_name, temporary: false }
        }
        AuthAction::CreateTempTable { table_name } => {
            AuthorizerAction::CreateTable { table: table_name, temporary: true }
        }
        AuthAction::DropTable { table_name } => {
            AuthorizerAction::DropTable { table: table_name, temporary: false }
        }
        AuthAction::DropTempTable { table_name } => {
            AuthorizerAction::DropTable { table: table_name, temporary: true }
        }
        AuthAction::AlterTable { table_name, .. } => {
            AuthorizerAction::AlterTable { table: table_name }
        }
        AuthAction::CreateIndex { table_name, .. } => {
            AuthorizerAction::CreateIndex { table: table_name, temporary: false }
        }
        AuthAction::CreateTempIndex { table_name, .. } => {
            AuthorizerAction::CreateIndex { table: table_name, temporary: true }
        }
        AuthAction::DropIndex { table_name, .. } => {
            AuthorizerAction::DropIndex { table: table_name, temporary: false }
        }
        AuthAction::DropTempIndex { table_name, .. } => {
            AuthorizerAction::DropIndex { table: table_name, temporary: true }
        }
        AuthAction::CreateTrigger { table_name, .. } => {
            AuthorizerAction::CreateTrigger { table: table_name, temporary: false }
        }
        AuthAction::CreateTempTrigger { table_name, .. } => {
            AuthorizerAction::CreateTrigger { table: table_name, temporary: true }
        }
        AuthAction::DropTrigger { table_name, .. } => {
            AuthorizerAction::DropTrigger { table: table_name, temporary: false }
        }
        AuthAction::DropTempTrigger { table_name, .. } => {
            AuthorizerAction::DropTrigger { table: table_name, temporary: true }
        }
        AuthAction::CreateView { .. } => AuthorizerAction::CreateView { temporary: false },
        AuthAction::CreateTempView { .. } => AuthorizerAction::CreateView { temporary: true },
        AuthAction::DropView { .. } => AuthorizerAction::DropView { temporary: false },
        AuthAction::DropTempView { .. } => AuthorizerAction::DropView { temporary: true },
        AuthAction::CreateVtable { table_name, module_name } => {
            AuthorizerAction::CreateVirtualTable { table: table_name, module: module_name }
        }
        AuthAction::DropVtable { table_name, module_name } => {
            AuthorizerAction::DropVirtualTable { table: table_name, module: module_name }
        }
        AuthAction::Insert { table_name } => AuthorizerAction::Insert { table: table_name },
        AuthAction::Update { table_name, .. } => AuthorizerAction::Update { table: table_name },
        AuthAction::Delete { table_name } => AuthorizerAction::Delete { table: table_name },
        AuthAction::Read { table_name, .. } => AuthorizerAction::Read { table: table_name },
        AuthAction::Select => AuthorizerAction::Select,
        AuthAction::Transaction { .. } | AuthAction::Savepoint { .. } => {
            AuthorizerAction::Transaction
        }
        AuthAction::Pragma { .. } => AuthorizerAction::Pragma,
        AuthAction::Attach { .. } => AuthorizerAction::Attach,
        AuthAction::Detach { .. } => AuthorizerAction::Detach,
        AuthAction::Reindex { .. } => AuthorizerAction::Reindex,
        AuthAction::Analyze { table_name } => AuthorizerAction::Analyze { table: table_name },
        AuthAction::Function { function_name } => {
            AuthorizerAction::Function { name: function_name }
        }
        AuthAction::Recursive => AuthorizerAction::Recursive,
        _ => AuthorizerAction::Other,
    }
}

// ============================================================================
// SECTION: Values
// ============================================================================

/// Converts a runtime value into an engine value.
fn to_engine_value(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(number) => Value::Integer(*number),
        SqlValue::Real(number) => Value::Real(*number),
        SqlValue::Text(text) => Value::Text(text.clone()),
        SqlValue::Blob(bytes) => Value::Blob(bytes.clone()),
    }
}

/// Converts an engine value into a runtime value.
fn from_engine_value(value: Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(number) => SqlValue::Integer(number),
        Value::Real(number) => SqlValue::Real(number),
        Value::Text(text) => SqlValue::Text(text),
        Value::Blob(bytes) => SqlValue::Blob(bytes),
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Extended result code carried by a `SQLite` failure.
fn extended_code(error: &rusqlite::Error) -> Option<i32> {
    match error {
        rusqlite::Error::SqliteFailure(failure, _) => Some(failure.extended_code),
        _ => None,
    }
}

/// Classifies a failure by its primary result code, if it has a specific meaning.
fn classify(error: &rusqlite::Error) -> Option<EngineErrorKind> {
    if matches!(error, rusqlite::Error::InvalidParameterCount(..)) {
        return Some(EngineErrorKind::ArgumentMismatch);
    }
    match error.sqlite_error_code()? {
        ErrorCode::DiskFull => Some(EngineErrorKind::Full),
        ErrorCode::ConstraintViolation => Some(EngineErrorKind::Constraint),
        ErrorCode::OperationInterrupted => Some(EngineErrorKind::Interrupted),
        ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => Some(EngineErrorKind::Busy),
        ErrorCode::AuthorizationForStatementDenied => Some(EngineErrorKind::Authorization),
        _ => None,
    }
}

/// Builds an engine error for a failure while compiling a statement.
fn prepare_error(error: &rusqlite::Error) -> EngineError {
    let kind = classify(error).unwrap_or(EngineErrorKind::Syntax);
    with_code(EngineError::new(kind, error.to_string()), error)
}

/// Builds an engine error for a failure while running a statement.
fn step_error(error: &rusqlite::Error) -> EngineError {
    let kind = classify(error).unwrap_or(EngineErrorKind::Other);
    with_code(EngineError::new(kind, error.to_string()), error)
}

/// Attaches the extended result code when there is one.
fn with_code(engine: EngineError, error: &rusqlite::Error) -> EngineError {
    match extended_code(error) {
        Some(code) => engine.with_code(code),
        None => engine,
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(
        clippy::unwrap_used,
        clippy::missing_docs_in_private_items,
        reason = "Tests use unwrap on deterministic fixtures."
    )]

    use originsql_core::AuthorizerBypass;
    use originsql_core::AuthorizerPolicy;
    use originsql_core::DatabaseAuthorizer;
    use originsql_core::EngineErrorKind;
    use originsql_core::SharedAuthorizer;
    use originsql_core::SqlConnection;
    use originsql_core::SqlValue;

    use super::SqliteConnection;
    use super::SqliteEngineConfig;

    fn open_with(dir: &tempfile::TempDir) -> (SqliteConnection, SharedAuthorizer) {
        let authorizer = DatabaseAuthorizer::shared(AuthorizerPolicy::default());
        let connection = SqliteConnection::open(
            &dir.path().join("test.db"),
            std::sync::Arc::clone(&authorizer),
            &SqliteEngineConfig::default(),
        )
        .unwrap();
        (connection, authorizer)
    }

    fn open(dir: &tempfile::TempDir) -> SqliteConnection {
        open_with(dir).0
    }

    #[test]
    fn execute_returns_rows_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let mut connection = open(&dir);
        connection.execute("CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT)", &[]).unwrap();
        let inserted = connection
            .execute("INSERT INTO notes (body) VALUES (?1)", &[SqlValue::from("hello")])
            .unwrap();
        assert_eq!(inserted.rows_affected, 1);
        assert_eq!(inserted.insert_id, Some(1));

        let rows = connection.execute("SELECT id, body FROM notes", &[]).unwrap();
        assert_eq!(rows.columns, vec!["id".to_string(), "body".to_string()]);
        assert_eq!(rows.rows, vec![vec![SqlValue::Integer(1), SqlValue::from("hello")]]);
    }

    #[test]
    fn argument_count_mismatch_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut connection = open(&dir);
        connection.execute("CREATE TABLE notes (body TEXT)", &[]).unwrap();
        let error = connection.execute("INSERT INTO notes (body) VALUES (?1)", &[]).unwrap_err();
        assert_eq!(error.kind, EngineErrorKind::ArgumentMismatch);
    }

    #[test]
    fn authorizer_denials_surface_at_prepare() {
        let dir = tempfile::tempdir().unwrap();
        let mut connection = open(&dir);
        let error = connection.execute("PRAGMA user_version = 3", &[]).unwrap_err();
        assert_eq!(error.kind, EngineErrorKind::Authorization);
    }

    #[test]
    fn installed_authorizer_guards_a_raw_connection() {
        let connection = rusqlite::Connection::open_in_memory().unwrap();
        let authorizer = DatabaseAuthorizer::shared(AuthorizerPolicy::default());
        super::install_authorizer(&connection, authorizer).unwrap();
        let error = connection.execute_batch("ATTACH DATABASE ':memory:' AS other").unwrap_err();
        assert_eq!(super::step_error(&error).kind, EngineErrorKind::Authorization);
    }

    #[test]
    fn maximum_size_turns_growth_into_full_errors() {
        let dir = tempfile::tempdir().unwrap();
        let (mut connection, authorizer) = open_with(&dir);
        connection.execute("CREATE TABLE blobs (data BLOB)", &[]).unwrap();
        {
            let _bypass = AuthorizerBypass::new(&authorizer);
            connection.set_maximum_size(1).unwrap();
        }
        let error = connection
            .execute("INSERT INTO blobs (data) VALUES (zeroblob(65536))", &[])
            .unwrap_err();
        assert_eq!(error.kind, EngineErrorKind::Full);
    }

    #[test]
    fn table_names_hide_engine_tables() {
        let dir = tempfile::tempdir().unwrap();
        let mut connection = open(&dir);
        connection
            .execute("CREATE TABLE counters (id INTEGER PRIMARY KEY AUTOINCREMENT)", &[])
            .unwrap();
        assert_eq!(connection.table_names().unwrap(), vec!["counters".to_string()]);
    }
}
