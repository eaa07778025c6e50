// crates/originsql-config/tests/config_validation.rs
// =============================================================================
// Module: Config Validation Tests
// Description: Defaults, section validation, and builders.
// Purpose: Ensure minimal config is valid and invalid settings fail closed.
// =============================================================================

//! Config defaults and validation tests for originsql-config.

#![allow(clippy::missing_docs_in_private_items, reason = "Test names describe the cases.")]

use originsql_config::EventSinkKind;
use originsql_config::config_toml_example;
use originsql_core::AuthorizerPolicy;
use originsql_sqlite::JournalMode;
use originsql_sqlite::SqliteEngineConfig;

mod common;

use common::TestResult;
use common::assert_invalid;
use common::config_from_toml;
use common::minimal_config;

#[test]
fn default_config_validates_and_matches_component_defaults() -> TestResult {
    let config = minimal_config().map_err(|err| err.to_string())?;
    config.validate().map_err(|err| err.to_string())?;
    if config.engine_config() != SqliteEngineConfig::default() {
        return Err("engine defaults drifted from the engine crate".to_string());
    }
    if config.authorizer_policy() != AuthorizerPolicy::default() {
        return Err("authorizer defaults drifted from the core policy".to_string());
    }
    let tracker = config.tracker_config();
    if tracker.default_origin_quota != 5 * 1024 * 1024 || tracker.busy_timeout_ms != 5_000 {
        return Err(format!("unexpected tracker defaults: {}", tracker.default_origin_quota));
    }
    Ok(())
}

#[test]
fn example_config_parses_and_validates() -> TestResult {
    let config = config_from_toml(&config_toml_example()).map_err(|err| err.to_string())?;
    config.validate().map_err(|err| err.to_string())?;
    if config.events.sink != EventSinkKind::File {
        return Err("example should use the file sink".to_string());
    }
    if !config.authorizer_policy().allows_function("UPPER") {
        return Err("example policy should allow upper".to_string());
    }
    if config.authorizer_policy().allows_function("replace") {
        return Err("example policy should replace the default list".to_string());
    }
    Ok(())
}

#[test]
fn journal_modes_parse_in_snake_case() -> TestResult {
    let config = config_from_toml("[engine]\njournal_mode = \"wal\"\n[tracker]\njournal_mode = \"truncate\"\n")
        .map_err(|err| err.to_string())?;
    if config.engine.journal_mode != JournalMode::Wal
        || config.tracker.journal_mode != JournalMode::Truncate
    {
        return Err("journal modes not parsed".to_string());
    }
    if config_from_toml("[engine]\njournal_mode = \"memory\"\n").is_ok() {
        return Err("unknown journal mode accepted".to_string());
    }
    Ok(())
}

#[test]
fn tracker_directory_must_be_non_empty() -> TestResult {
    let mut config = minimal_config().map_err(|err| err.to_string())?;
    config.tracker.directory = "  ".to_string();
    assert_invalid(config.validate(), "tracker.directory must be non-empty")
}

#[test]
fn tracker_quota_must_fit_the_registry() -> TestResult {
    let mut config = minimal_config().map_err(|err| err.to_string())?;
    config.tracker.default_origin_quota = u64::MAX;
    assert_invalid(config.validate(), "tracker.default_origin_quota")
}

#[test]
fn busy_timeouts_are_bounded() -> TestResult {
    let mut config = minimal_config().map_err(|err| err.to_string())?;
    config.engine.busy_timeout_ms = 60_001;
    assert_invalid(config.validate(), "engine.busy_timeout_ms")?;
    let mut config = minimal_config().map_err(|err| err.to_string())?;
    config.tracker.busy_timeout_ms = 120_000;
    assert_invalid(config.validate(), "tracker.busy_timeout_ms")
}

#[test]
fn vacuum_ratio_must_be_a_percentage() -> TestResult {
    let mut config = minimal_config().map_err(|err| err.to_string())?;
    config.engine.vacuum_free_ratio_percent = 0;
    assert_invalid(config.validate(), "vacuum_free_ratio_percent")?;
    config.engine.vacuum_free_ratio_percent = 101;
    assert_invalid(config.validate(), "vacuum_free_ratio_percent")
}

#[test]
fn thread_name_prefix_is_checked() -> TestResult {
    let mut config = minimal_config().map_err(|err| err.to_string())?;
    config.worker.thread_name_prefix = String::new();
    assert_invalid(config.validate(), "worker.thread_name_prefix must be non-empty")?;
    config.worker.thread_name_prefix = "x".repeat(65);
    assert_invalid(config.validate(), "worker.thread_name_prefix too long")
}

#[test]
fn allowed_functions_must_be_plain_names() -> TestResult {
    let config = config_from_toml("[authorizer]\nallowed_functions = [\"upper\", \"load_extension(\"]\n")
        .map_err(|err| err.to_string())?;
    assert_invalid(config.validate(), "not a function name")?;
    let config = config_from_toml("[authorizer]\nallowed_functions = [\"\"]\n")
        .map_err(|err| err.to_string())?;
    assert_invalid(config.validate(), "invalid length")
}

#[test]
fn empty_function_list_denies_every_function() -> TestResult {
    let config = config_from_toml("[authorizer]\nallowed_functions = []\n")
        .map_err(|err| err.to_string())?;
    config.validate().map_err(|err| err.to_string())?;
    if config.authorizer_policy().allows_function("upper") {
        return Err("empty override should allow nothing".to_string());
    }
    Ok(())
}

#[test]
fn file_sink_requires_a_path_and_others_reject_one() -> TestResult {
    let config = config_from_toml("[events]\nsink = \"file\"\n").map_err(|err| err.to_string())?;
    assert_invalid(config.validate(), "events.path required")?;
    assert_invalid(config.event_sink(), "events.path required")?;
    let config = config_from_toml("[events]\nsink = \"stderr\"\npath = \"events.jsonl\"\n")
        .map_err(|err| err.to_string())?;
    assert_invalid(config.validate(), "only allowed for file sink")
}
