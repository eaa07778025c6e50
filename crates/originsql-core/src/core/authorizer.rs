// crates/originsql-core/src/core/authorizer.rs
// ============================================================================
// Module: OriginSQL Statement Authorizer
// Description: Per-connection policy deciding which compiled actions are allowed.
// Purpose: Confine caller SQL to data manipulation inside its own database.
// Dependencies: std
// ============================================================================

//! ## Overview
//! The engine consults a [`DatabaseAuthorizer`] for every action a statement
//! performs while it is being compiled. With security enabled, caller SQL may
//! not control transactions, run pragmas, attach other files, call functions
//! outside the allow-list, or touch the internal info table, and read-only
//! transactions may not write. The runtime disables security around its own
//! internal statements with [`AuthorizerBypass`].
//!
//! The authorizer also records whether the last action inserted or changed
//! data and whether any delete ran, which drive result metadata and
//! post-commit vacuuming.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Name of the internal table holding the database version.
pub const DATABASE_INFO_TABLE: &str = "__originsql_database_info__";

/// Functions callable from caller SQL when no policy override is configured.
pub const DEFAULT_ALLOWED_FUNCTIONS: &[&str] = &[
    "abs",
    "changes",
    "coalesce",
    "glob",
    "ifnull",
    "hex",
    "last_insert_rowid",
    "length",
    "like",
    "lower",
    "ltrim",
    "max",
    "min",
    "nullif",
    "quote",
    "replace",
    "round",
    "rtrim",
    "soundex",
    "sqlite_source_id",
    "sqlite_version",
    "substr",
    "total_changes",
    "trim",
    "typeof",
    "upper",
    "zeroblob",
    "date",
    "time",
    "datetime",
    "julianday",
    "strftime",
    "avg",
    "count",
    "group_concat",
    "sum",
    "total",
    "snippet",
    "offsets",
    "optimize",
];

/// Virtual table modules caller SQL may create.
const ALLOWED_VIRTUAL_TABLE_MODULES: &[&str] = &["fts3", "fts4"];

// ============================================================================
// SECTION: Policy
// ============================================================================

/// Static authorization policy shared by every connection of a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizerPolicy {
    /// Lower-cased function names caller SQL may call.
    allowed_functions: BTreeSet<String>,
}

impl AuthorizerPolicy {
    /// Creates a policy permitting exactly the listed functions.
    #[must_use]
    pub fn new<I, S>(functions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allowed_functions =
            functions.into_iter().map(|name| name.as_ref().to_ascii_lowercase()).collect();
        Self { allowed_functions }
    }

    /// Returns true when caller SQL may call `name`.
    #[must_use]
    pub fn allows_function(&self, name: &str) -> bool {
        self.allowed_functions.contains(&name.to_ascii_lowercase())
    }

    /// Returns the allowed function names in sorted order.
    pub fn allowed_functions(&self) -> impl Iterator<Item = &str> {
        self.allowed_functions.iter().map(String::as_str)
    }
}

impl Default for AuthorizerPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED_FUNCTIONS)
    }
}

// ============================================================================
// SECTION: Actions and Decisions
// ============================================================================

/// An action the engine asks permission for while compiling a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizerAction<'a> {
    /// `CREATE [TEMP] TABLE`.
    CreateTable {
        /// Table name.
        table: &'a str,
        /// True for temporary tables.
        temporary: bool,
    },
    /// `DROP [TEMP] TABLE`.
    DropTable {
        /// Table name.
        table: &'a str,
        /// True for temporary tables.
        temporary: bool,
    },
    /// `ALTER TABLE`.
    AlterTable {
        /// Table name.
        table: &'a str,
    },
    /// `CREATE [TEMP] INDEX`.
    CreateIndex {
        /// Indexed table name.
        table: &'a str,
        /// True for temporary indexes.
        temporary: bool,
    },
    /// `DROP [TEMP] INDEX`.
    DropIndex {
        /// Indexed table name.
        table: &'a str,
        /// True for temporary indexes.
        temporary: bool,
    },
    /// `CREATE [TEMP] TRIGGER`.
    CreateTrigger {
        /// Table the trigger fires on.
        table: &'a str,
        /// True for temporary triggers.
        temporary: bool,
    },
    /// `DROP [TEMP] TRIGGER`.
    DropTrigger {
        /// Table the trigger fires on.
        table: &'a str,
        /// True for temporary triggers.
        temporary: bool,
    },
    /// `CREATE [TEMP] VIEW`.
    CreateView {
        /// True for temporary views.
        temporary: bool,
    },
    /// `DROP [TEMP] VIEW`.
    DropView {
        /// True for temporary views.
        temporary: bool,
    },
    /// `CREATE VIRTUAL TABLE`.
    CreateVirtualTable {
        /// Table name.
        table: &'a str,
        /// Module name.
        module: &'a str,
    },
    /// `DROP TABLE` on a virtual table.
    DropVirtualTable {
        /// Table name.
        table: &'a str,
        /// Module name.
        module: &'a str,
    },
    /// Row insert.
    Insert {
        /// Target table.
        table: &'a str,
    },
    /// Row update.
    Update {
        /// Target table.
        table: &'a str,
    },
    /// Row delete.
    Delete {
        /// Target table.
        table: &'a str,
    },
    /// Column read.
    Read {
        /// Source table.
        table: &'a str,
    },
    /// `SELECT`.
    Select,
    /// Transaction or savepoint control.
    Transaction,
    /// `PRAGMA`.
    Pragma,
    /// `ATTACH`.
    Attach,
    /// `DETACH`.
    Detach,
    /// `REINDEX`.
    Reindex,
    /// `ANALYZE`.
    Analyze {
        /// Analyzed table.
        table: &'a str,
    },
    /// Function call.
    Function {
        /// Function name.
        name: &'a str,
    },
    /// Recursive common table expression.
    Recursive,
    /// Any action without a dedicated variant.
    Other,
}

/// Decision returned to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizerDecision {
    /// Permit the action.
    Allow,
    /// Fail compilation of the statement.
    Deny,
    /// Compile the statement but treat the action as a no-op.
    Ignore,
}

/// Data access granted to the statement currently being compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizerPermission {
    /// Reads and writes allowed.
    ReadWrite,
    /// Only reads allowed.
    ReadOnly,
    /// Nothing allowed.
    NoAccess,
}

// ============================================================================
// SECTION: Authorizer
// ============================================================================

/// Authorizer shared between the runtime and the engine's callback.
pub type SharedAuthorizer = Arc<Mutex<DatabaseAuthorizer>>;

/// Per-connection authorizer state.
#[derive(Debug, Clone)]
pub struct DatabaseAuthorizer {
    /// Static policy.
    policy: AuthorizerPolicy,
    /// When false every action is allowed.
    security_enabled: bool,
    /// Access granted to the current statement.
    permission: AuthorizerPermission,
    /// Last compiled statement inserted a row.
    last_action_was_insert: bool,
    /// Last compiled statement changed the database.
    last_action_changed_database: bool,
    /// A delete ran since the last reset of the delete flag.
    had_deletes: bool,
}

impl DatabaseAuthorizer {
    /// Creates an authorizer with security enabled and read-write access.
    #[must_use]
    pub const fn new(policy: AuthorizerPolicy) -> Self {
        Self {
            policy,
            security_enabled: true,
            permission: AuthorizerPermission::ReadWrite,
            last_action_was_insert: false,
            last_action_changed_database: false,
            had_deletes: false,
        }
    }

    /// Wraps the authorizer for sharing with an engine callback.
    #[must_use]
    pub fn shared(policy: AuthorizerPolicy) -> SharedAuthorizer {
        Arc::new(Mutex::new(Self::new(policy)))
    }

    /// Enables policy enforcement.
    pub const fn enable(&mut self) {
        self.security_enabled = true;
    }

    /// Disables policy enforcement for internal statements.
    pub const fn disable(&mut self) {
        self.security_enabled = false;
    }

    /// Returns true when policy enforcement is active.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.security_enabled
    }

    /// Sets the access granted to the next statement.
    pub const fn set_permission(&mut self, permission: AuthorizerPermission) {
        self.permission = permission;
    }

    /// Clears per-statement flags and restores read-write access.
    pub const fn reset(&mut self) {
        self.last_action_was_insert = false;
        self.last_action_changed_database = false;
        self.permission = AuthorizerPermission::ReadWrite;
    }

    /// Clears the delete flag at the start of a transaction.
    pub const fn reset_deletes(&mut self) {
        self.had_deletes = false;
    }

    /// Returns true when a delete ran since [`Self::reset_deletes`].
    #[must_use]
    pub const fn had_deletes(&self) -> bool {
        self.had_deletes
    }

    /// Returns true when the last statement inserted a row.
    #[must_use]
    pub const fn last_action_was_insert(&self) -> bool {
        self.last_action_was_insert
    }

    /// Returns true when the last statement changed the database.
    #[must_use]
    pub const fn last_action_changed_database(&self) -> bool {
        self.last_action_changed_database
    }

    /// Decides whether the engine may perform `action`.
    pub fn authorize(&mut self, action: &AuthorizerAction<'_>) -> AuthorizerDecision {
        match *action {
            AuthorizerAction::CreateTable { table, temporary }
            | AuthorizerAction::CreateIndex { table, temporary }
            | AuthorizerAction::CreateTrigger { table, temporary } => {
                self.allow_schema_write(table, temporary)
            }
            AuthorizerAction::DropTable { table, temporary }
            | AuthorizerAction::DropIndex { table, temporary }
            | AuthorizerAction::DropTrigger { table, temporary } => {
                let decision = self.allow_schema_write(table, temporary);
                if decision == AuthorizerDecision::Allow {
                    self.had_deletes = true;
                }
                decision
            }
            AuthorizerAction::CreateView { temporary } | AuthorizerAction::DropView { temporary } => {
                self.allow_schema_write("", temporary)
            }
            AuthorizerAction::AlterTable { table } => self.allow_schema_write(table, false),
            AuthorizerAction::CreateVirtualTable { table, module } => {
                if self.security_enabled && !is_allowed_module(module) {
                    return AuthorizerDecision::Deny;
                }
                self.allow_schema_write(table, false)
            }
            AuthorizerAction::DropVirtualTable { table, module } => {
                if self.security_enabled && !is_allowed_module(module) {
                    return AuthorizerDecision::Deny;
                }
                let decision = self.allow_schema_write(table, false);
                if decision == AuthorizerDecision::Allow {
                    self.had_deletes = true;
                }
                decision
            }
            AuthorizerAction::Insert { table } => {
                let decision = self.allow_write(table);
                if decision == AuthorizerDecision::Allow {
                    self.last_action_was_insert = true;
                }
                decision
            }
            AuthorizerAction::Update { table } => self.allow_write(table),
            AuthorizerAction::Delete { table } => {
                let decision = self.allow_write(table);
                if decision == AuthorizerDecision::Allow {
                    self.had_deletes = true;
                }
                decision
            }
            AuthorizerAction::Read { table } => self.allow_read(table),
            AuthorizerAction::Select | AuthorizerAction::Recursive => self.allow_select(),
            AuthorizerAction::Analyze { table } => self.allow_read(table),
            AuthorizerAction::Function { name } => {
                if self.security_enabled && !self.policy.allows_function(name) {
                    AuthorizerDecision::Deny
                } else {
                    AuthorizerDecision::Allow
                }
            }
            AuthorizerAction::Transaction
            | AuthorizerAction::Pragma
            | AuthorizerAction::Attach
            | AuthorizerAction::Detach
            | AuthorizerAction::Reindex
            | AuthorizerAction::Other => self.deny_when_secure(),
        }
    }

    /// Allows anything only when security is disabled.
    const fn deny_when_secure(&self) -> AuthorizerDecision {
        if self.security_enabled { AuthorizerDecision::Deny } else { AuthorizerDecision::Allow }
    }

    /// Returns true when the current permission forbids everything.
    fn no_access(&self) -> bool {
        self.security_enabled && self.permission == AuthorizerPermission::NoAccess
    }

    /// Returns true when the current permission forbids writes.
    fn read_only(&self) -> bool {
        self.security_enabled && self.permission != AuthorizerPermission::ReadWrite
    }

    /// Returns true when `table` is reserved for internal use.
    fn denied_table(&self, table: &str) -> bool {
        self.security_enabled && table.eq_ignore_ascii_case(DATABASE_INFO_TABLE)
    }

    /// Decision for schema changes; temporary objects are always local.
    fn allow_schema_write(&mut self, table: &str, temporary: bool) -> AuthorizerDecision {
        if self.read_only() || self.denied_table(table) {
            return AuthorizerDecision::Deny;
        }
        if !temporary {
            self.last_action_changed_database = true;
        }
        AuthorizerDecision::Allow
    }

    /// Decision for row writes.
    fn allow_write(&mut self, table: &str) -> AuthorizerDecision {
        if self.read_only() || self.denied_table(table) {
            return AuthorizerDecision::Deny;
        }
        self.last_action_changed_database = true;
        AuthorizerDecision::Allow
    }

    /// Decision for column reads.
    fn allow_read(&self, table: &str) -> AuthorizerDecision {
        if self.no_access() || self.denied_table(table) {
            return AuthorizerDecision::Deny;
        }
        AuthorizerDecision::Allow
    }

    /// Decision for `SELECT`.
    fn allow_select(&self) -> AuthorizerDecision {
        if self.no_access() { AuthorizerDecision::Deny } else { AuthorizerDecision::Allow }
    }
}

/// Returns true for virtual table modules caller SQL may use.
fn is_allowed_module(module: &str) -> bool {
    ALLOWED_VIRTUAL_TABLE_MODULES.iter().any(|allowed| module.eq_ignore_ascii_case(allowed))
}

// ============================================================================
// SECTION: Bypass Guard
// ============================================================================

/// Guard that disables enforcement until dropped.
///
/// The guard does not hold the authorizer lock; the engine callback locks it
/// during compilation. Guards nest: only the outermost one re-enables.
pub struct AuthorizerBypass<'a> {
    /// Authorizer to restore on drop.
    authorizer: &'a SharedAuthorizer,
    /// Enforcement was active when the guard was created.
    restore: bool,
}

impl<'a> AuthorizerBypass<'a> {
    /// Disables enforcement on `authorizer`.
    #[must_use]
    pub fn new(authorizer: &'a SharedAuthorizer) -> Self {
        let mut guard = authorizer.lock().unwrap_or_else(PoisonError::into_inner);
        let restore = guard.is_enabled();
        guard.disable();
        drop(guard);
        Self { authorizer, restore }
    }
}

impl Drop for AuthorizerBypass<'_> {
    fn drop(&mut self) {
        if self.restore {
            self.authorizer.lock().unwrap_or_else(PoisonError::into_inner).enable();
        }
    }
}
