// crates/originsql-core/tests/authorizer.rs
// ============================================================================
// Module: Authorizer Tests
// Description: Statement authorization policy for caller SQL.
// Purpose: Ensure caller SQL cannot escape the sandbox.
// ============================================================================

//! ## Overview
//! Validates the authorizer decisions, its per-statement flags, and the
//! bypass guard used for internal statements.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::missing_docs_in_private_items,
    reason = "Test-only assertions and helpers are permitted."
)]

use originsql_core::AuthorizerAction;
use originsql_core::AuthorizerBypass;
use originsql_core::AuthorizerDecision;
use originsql_core::AuthorizerPermission;
use originsql_core::AuthorizerPolicy;
use originsql_core::DATABASE_INFO_TABLE;
use originsql_core::DatabaseAuthorizer;

fn authorizer() -> DatabaseAuthorizer {
    DatabaseAuthorizer::new(AuthorizerPolicy::default())
}

#[test]
fn info_table_is_hidden_from_caller_sql() {
    let mut auth = authorizer();
    let read = AuthorizerAction::Read { table: DATABASE_INFO_TABLE };
    let insert = AuthorizerAction::Insert { table: DATABASE_INFO_TABLE };
    assert_eq!(auth.authorize(&read), AuthorizerDecision::Deny);
    assert_eq!(auth.authorize(&insert), AuthorizerDecision::Deny);
    assert_eq!(auth.authorize(&AuthorizerAction::Read { table: "notes" }), AuthorizerDecision::Allow);
}

#[test]
fn transaction_control_and_pragmas_are_denied() {
    let mut auth = authorizer();
    for action in [
        AuthorizerAction::Transaction,
        AuthorizerAction::Pragma,
        AuthorizerAction::Attach,
        AuthorizerAction::Detach,
        AuthorizerAction::Other,
    ] {
        assert_eq!(auth.authorize(&action), AuthorizerDecision::Deny, "{action:?}");
    }
}

#[test]
fn functions_follow_the_policy() {
    let mut auth = authorizer();
    assert_eq!(auth.authorize(&AuthorizerAction::Function { name: "upper" }), AuthorizerDecision::Allow);
    assert_eq!(auth.authorize(&AuthorizerAction::Function { name: "UPPER" }), AuthorizerDecision::Allow);
    assert_eq!(
        auth.authorize(&AuthorizerAction::Function { name: "load_extension" }),
        AuthorizerDecision::Deny
    );

    let mut narrow = DatabaseAuthorizer::new(AuthorizerPolicy::new(["length"]));
    assert_eq!(narrow.authorize(&AuthorizerAction::Function { name: "upper" }), AuthorizerDecision::Deny);
}

#[test]
fn only_full_text_modules_may_back_virtual_tables() {
    let mut auth = authorizer();
    let fts = AuthorizerAction::CreateVirtualTable { table: "docs", module: "fts4" };
    let rtree = AuthorizerAction::CreateVirtualTable { table: "shapes", module: "rtree" };
    assert_eq!(auth.authorize(&fts), AuthorizerDecision::Allow);
    assert_eq!(auth.authorize(&rtree), AuthorizerDecision::Deny);
}

#[test]
fn read_only_permission_denies_writes_but_allows_reads() {
    let mut auth = authorizer();
    auth.set_permission(AuthorizerPermission::ReadOnly);
    assert_eq!(auth.authorize(&AuthorizerAction::Update { table: "notes" }), AuthorizerDecision::Deny);
    assert_eq!(
        auth.authorize(&AuthorizerAction::CreateTable { table: "t", temporary: false }),
        AuthorizerDecision::Deny
    );
    assert_eq!(auth.authorize(&AuthorizerAction::Select), AuthorizerDecision::Allow);

    auth.set_permission(AuthorizerPermission::NoAccess);
    assert_eq!(auth.authorize(&AuthorizerAction::Select), AuthorizerDecision::Deny);

    auth.reset();
    assert_eq!(auth.authorize(&AuthorizerAction::Update { table: "notes" }), AuthorizerDecision::Allow);
}

#[test]
fn statement_flags_track_inserts_changes_and_deletes() {
    let mut auth = authorizer();
    auth.authorize(&AuthorizerAction::Select);
    assert!(!auth.last_action_changed_database());

    auth.authorize(&AuthorizerAction::Insert { table: "notes" });
    assert!(auth.last_action_was_insert());
    assert!(auth.last_action_changed_database());

    auth.reset();
    assert!(!auth.last_action_was_insert());
    auth.authorize(&AuthorizerAction::CreateTable { table: "scratch", temporary: true });
    assert!(!auth.last_action_changed_database());

    auth.authorize(&AuthorizerAction::Delete { table: "notes" });
    auth.reset();
    assert!(auth.had_deletes());
    auth.reset_deletes();
    assert!(!auth.had_deletes());
}

#[test]
fn nested_bypass_restores_enforcement_once() {
    let shared = DatabaseAuthorizer::shared(AuthorizerPolicy::default());
    {
        let _outer = AuthorizerBypass::new(&shared);
        {
            let _inner = AuthorizerBypass::new(&shared);
        }
        let mut guard = shared.lock().unwrap();
        assert!(!guard.is_enabled());
        assert_eq!(guard.authorize(&AuthorizerAction::Transaction), AuthorizerDecision::Allow);
    }
    assert!(shared.lock().unwrap().is_enabled());
}
