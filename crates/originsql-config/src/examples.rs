// crates/originsql-config/src/examples.rs
// ============================================================================
// Module: Config Examples
// Description: Canonical example configuration payload.
// Purpose: Deterministic example for docs and tooling.
// Dependencies: std
// ============================================================================

//! ## Overview
//! Canonical `originsql.toml` example. Every section is shown with its
//! default values except where noted.

/// Returns a canonical example `originsql.toml` configuration.
#[must_use]
pub fn config_toml_example() -> String {
    String::from(
        r#"[tracker]
directory = "originsql-data"
default_origin_quota = 5242880
busy_timeout_ms = 5000
journal_mode = "delete"

[engine]
journal_mode = "delete"
busy_timeout_ms = 5000
vacuum_free_ratio_percent = 10
foreign_keys = true

[worker]
thread_name_prefix = "originsql-db"

[authorizer]
# Omit to keep the built-in list.
allowed_functions = ["abs", "coalesce", "length", "lower", "upper", "count", "sum"]

[events]
sink = "file"
path = "originsql-events.jsonl"
"#,
    )
}
