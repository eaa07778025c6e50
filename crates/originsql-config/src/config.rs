// crates/originsql-config/src/config.rs
// ============================================================================
// Module: OriginSQL Configuration
// Description: Configuration loading and validation for OriginSQL.
// Purpose: Provide strict, fail-closed config parsing with hard limits.
// Dependencies: originsql-core, originsql-sqlite, serde, toml
// ============================================================================

//! ## Overview
//! Configuration is loaded from a TOML file with strict size and path limits.
//! Every section is optional and defaults to a working local setup. The
//! builders at the bottom of this module turn a validated config into the
//! values the tracker, engine, and database context consume.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::env;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use originsql_core::AuthorizerPolicy;
use originsql_core::CallbackScheduler;
use originsql_core::ConnectionFactory;
use originsql_core::ContextOptions;
use originsql_core::DatabaseEventSink;
use originsql_core::DatabaseTracker;
use originsql_core::FileEventSink;
use originsql_core::NoopEventSink;
use originsql_core::OriginId;
use originsql_core::StderrEventSink;
use originsql_sqlite::JournalMode;
use originsql_sqlite::SqliteEngineConfig;
use originsql_sqlite::TrackerConfig;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default configuration filename when no path is specified.
const DEFAULT_CONFIG_NAME: &str = "originsql.toml";
/// Environment variable used to override the config path.
pub(crate) const CONFIG_ENV_VAR: &str = "ORIGINSQL_CONFIG";
/// Maximum configuration file size in bytes.
pub(crate) const MAX_CONFIG_FILE_SIZE: usize = 1024 * 1024;
/// Maximum length of a single path component.
pub(crate) const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Maximum total path length.
pub(crate) const MAX_TOTAL_PATH_LENGTH: usize = 4096;
/// Default tracker directory.
const DEFAULT_TRACKER_DIRECTORY: &str = "originsql-data";
/// Default per-origin quota in bytes.
const DEFAULT_ORIGIN_QUOTA: u64 = 5 * 1024 * 1024;
/// Default busy timeout in milliseconds.
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
/// Maximum busy timeout in milliseconds.
pub(crate) const MAX_BUSY_TIMEOUT_MS: u64 = 60_000;
/// Default free-page percentage that triggers incremental vacuum.
const DEFAULT_VACUUM_FREE_RATIO_PERCENT: u8 = 10;
/// Default worker thread name.
const DEFAULT_THREAD_NAME: &str = "originsql-db";
/// Maximum worker thread name length.
pub(crate) const MAX_THREAD_NAME_LENGTH: usize = 64;
/// Maximum number of allowed SQL functions.
pub(crate) const MAX_ALLOWED_FUNCTIONS: usize = 256;
/// Maximum length of one SQL function name.
pub(crate) const MAX_FUNCTION_NAME_LENGTH: usize = 64;

// ============================================================================
// SECTION: Config Model
// ============================================================================

/// Top-level OriginSQL configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginSqlConfig {
    /// Origin registry settings.
    #[serde(default)]
    pub tracker: TrackerStoreConfig,
    /// Engine connection settings.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Database thread settings.
    #[serde(default)]
    pub worker: WorkerConfig,
    /// SQL authorizer settings.
    #[serde(default)]
    pub authorizer: AuthorizerConfig,
    /// Lifecycle event sink settings.
    #[serde(default)]
    pub events: EventsConfig,
}

impl OriginSqlConfig {
    /// Loads configuration from disk using the default resolution rules.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when loading or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let resolved = resolve_path(path)?;
        validate_path(&resolved)?;
        let bytes = fs::read(&resolved).map_err(|err| ConfigError::Io(err.to_string()))?;
        if bytes.len() > MAX_CONFIG_FILE_SIZE {
            return Err(ConfigError::Invalid("config file exceeds size limit".to_string()));
        }
        let content = std::str::from_utf8(&bytes)
            .map_err(|_| ConfigError::Invalid("config file must be utf-8".to_string()))?;
        let config: Self =
            toml::from_str(content).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tracker.validate()?;
        self.engine.validate()?;
        self.worker.validate()?;
        self.authorizer.validate()?;
        self.events.validate()?;
        Ok(())
    }

    /// Builds the tracker settings.
    #[must_use]
    pub fn tracker_config(&self) -> TrackerConfig {
        let mut config = TrackerConfig::new(&self.tracker.directory);
        config.default_origin_quota = self.tracker.default_origin_quota;
        config.busy_timeout_ms = self.tracker.busy_timeout_ms;
        config.journal_mode = self.tracker.journal_mode;
        config
    }

    /// Builds the engine connection settings.
    #[must_use]
    pub const fn engine_config(&self) -> SqliteEngineConfig {
        SqliteEngineConfig {
            journal_mode: self.engine.journal_mode,
            busy_timeout_ms: self.engine.busy_timeout_ms,
            vacuum_free_ratio_percent: self.engine.vacuum_free_ratio_percent,
            foreign_keys: self.engine.foreign_keys,
        }
    }

    /// Builds the authorizer policy; no override keeps the default function list.
    #[must_use]
    pub fn authorizer_policy(&self) -> AuthorizerPolicy {
        self.authorizer
            .allowed_functions
            .as_ref()
            .map_or_else(AuthorizerPolicy::default, AuthorizerPolicy::new)
    }

    /// Builds the configured event sink.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] when the event log cannot be opened.
    pub fn event_sink(&self) -> Result<Arc<dyn DatabaseEventSink>, ConfigError> {
        match self.events.sink {
            EventSinkKind::None => Ok(Arc::new(NoopEventSink)),
            EventSinkKind::Stderr => Ok(Arc::new(StderrEventSink)),
            EventSinkKind::File => {
                let path = self.events.path.as_deref().ok_or_else(|| {
                    ConfigError::Invalid("events.path required for file sink".to_string())
                })?;
                let sink =
                    FileEventSink::new(Path::new(path)).map_err(|err| ConfigError::Io(err.to_string()))?;
                Ok(Arc::new(sink))
            }
        }
    }

    /// Builds context options for `origin` with the configured policy, event
    /// sink, and thread name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the event sink cannot be built.
    pub fn context_options(
        &self,
        origin: OriginId,
        tracker: Arc<dyn DatabaseTracker>,
        connections: Arc<dyn ConnectionFactory>,
        scheduler: Arc<dyn CallbackScheduler>,
    ) -> Result<ContextOptions, ConfigError> {
        let thread_name = format!("{}-{origin}", self.worker.thread_name_prefix);
        Ok(ContextOptions::new(origin, tracker, connections, scheduler)
            .events(self.event_sink()?)
            .policy(self.authorizer_policy())
            .thread_name(thread_name))
    }
}

// ============================================================================
// SECTION: Tracker
// ============================================================================

/// Origin registry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerStoreConfig {
    /// Directory holding the registry and per-origin database files.
    #[serde(default = "default_tracker_directory")]
    pub directory: String,
    /// Quota assigned to origins without an explicit quota.
    #[serde(default = "default_origin_quota")]
    pub default_origin_quota: u64,
    /// Registry busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Registry journal mode.
    #[serde(default)]
    pub journal_mode: JournalMode,
}

impl Default for TrackerStoreConfig {
    fn default() -> Self {
        Self {
            directory: default_tracker_directory(),
            default_origin_quota: default_origin_quota(),
            busy_timeout_ms: default_busy_timeout_ms(),
            journal_mode: JournalMode::default(),
        }
    }
}

impl TrackerStoreConfig {
    /// Validates tracker settings.
    fn validate(&self) -> Result<(), ConfigError> {
        validate_path_string("tracker.directory", &self.directory)?;
        if i64::try_from(self.default_origin_quota).is_err() {
            return Err(ConfigError::Invalid(
                "tracker.default_origin_quota exceeds the registry limit".to_string(),
            ));
        }
        validate_busy_timeout("tracker.busy_timeout_ms", self.busy_timeout_ms)
    }
}

// ============================================================================
// SECTION: Engine
// ============================================================================

/// Engine connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Journal mode for database files.
    #[serde(default)]
    pub journal_mode: JournalMode,
    /// Busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Free-page percentage at which a commit that deleted data vacuums.
    #[serde(default = "default_vacuum_free_ratio_percent")]
    pub vacuum_free_ratio_percent: u8,
    /// Enforce foreign keys.
    #[serde(default = "default_true")]
    pub foreign_keys: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            journal_mode: JournalMode::default(),
            busy_timeout_ms: default_busy_timeout_ms(),
            vacuum_free_ratio_percent: default_vacuum_free_ratio_percent(),
            foreign_keys: true,
        }
    }
}

impl EngineConfig {
    /// Validates engine settings.
    fn validate(&self) -> Result<(), ConfigError> {
        validate_busy_timeout("engine.busy_timeout_ms", self.busy_timeout_ms)?;
        if self.vacuum_free_ratio_percent == 0 || self.vacuum_free_ratio_percent > 100 {
            return Err(ConfigError::Invalid(
                "engine.vacuum_free_ratio_percent must be between 1 and 100".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// SECTION: Worker
// ============================================================================

/// Database thread configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Prefix of the worker thread name; the origin is appended.
    #[serde(default = "default_thread_name")]
    pub thread_name_prefix: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { thread_name_prefix: default_thread_name() }
    }
}

impl WorkerConfig {
    /// Validates worker settings.
    fn validate(&self) -> Result<(), ConfigError> {
        let name = self.thread_name_prefix.trim();
        if name.is_empty() {
            return Err(ConfigError::Invalid("worker.thread_name_prefix must be non-empty".to_string()));
        }
        if name.len() > MAX_THREAD_NAME_LENGTH {
            return Err(ConfigError::Invalid("worker.thread_name_prefix too long".to_string()));
        }
        if name.contains('\0') {
            return Err(ConfigError::Invalid(
                "worker.thread_name_prefix must not contain NUL".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// SECTION: Authorizer
// ============================================================================

/// SQL authorizer configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizerConfig {
    /// Replaces the default list of functions caller SQL may call.
    #[serde(default)]
    pub allowed_functions: Option<Vec<String>>,
}

impl AuthorizerConfig {
    /// Validates authorizer settings.
    fn validate(&self) -> Result<(), ConfigError> {
        let Some(functions) = &self.allowed_functions else {
            return Ok(());
        };
        if functions.len() > MAX_ALLOWED_FUNCTIONS {
            return Err(ConfigError::Invalid("authorizer.allowed_functions too large".to_string()));
        }
        for name in functions {
            if name.is_empty() || name.len() > MAX_FUNCTION_NAME_LENGTH {
                return Err(ConfigError::Invalid(format!(
                    "authorizer.allowed_functions entry has invalid length: '{name}'"
                )));
            }
            if !name.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
                return Err(ConfigError::Invalid(format!(
                    "authorizer.allowed_functions entry is not a function name: '{name}'"
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// SECTION: Events
// ============================================================================

/// Event sink selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSinkKind {
    /// Discard events.
    #[default]
    None,
    /// JSON lines on stderr.
    Stderr,
    /// JSON lines appended to `events.path`.
    File,
}

/// Lifecycle event configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Sink kind.
    #[serde(default)]
    pub sink: EventSinkKind,
    /// Event log path for the file sink.
    #[serde(default)]
    pub path: Option<String>,
}

impl EventsConfig {
    /// Validates event settings.
    fn validate(&self) -> Result<(), ConfigError> {
        match (self.sink, &self.path) {
            (EventSinkKind::File, Some(path)) => validate_path_string("events.path", path),
            (EventSinkKind::File, None) => {
                Err(ConfigError::Invalid("events.path required for file sink".to_string()))
            }
            (_, Some(_)) => {
                Err(ConfigError::Invalid("events.path only allowed for file sink".to_string()))
            }
            (_, None) => Ok(()),
        }
    }
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O failure while reading configuration.
    #[error("config io error: {0}")]
    Io(String),
    /// TOML parsing error.
    #[error("config parse error: {0}")]
    Parse(String),
    /// Invalid configuration data.
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Resolves the config path from an explicit path or environment defaults.
fn resolve_path(path: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = path {
        return Ok(path.to_path_buf());
    }
    if let Ok(env_path) = env::var(CONFIG_ENV_VAR) {
        if env_path.len() > MAX_TOTAL_PATH_LENGTH {
            return Err(ConfigError::Invalid("config path exceeds max length".to_string()));
        }
        return Ok(PathBuf::from(env_path));
    }
    Ok(PathBuf::from(DEFAULT_CONFIG_NAME))
}

/// Validates the resolved path against length limits.
fn validate_path(path: &Path) -> Result<(), ConfigError> {
    let text = path.to_string_lossy();
    if text.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(ConfigError::Invalid("config path exceeds max length".to_string()));
    }
    for component in path.components() {
        let value = component.as_os_str().to_string_lossy();
        if value.len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(ConfigError::Invalid("config path component too long".to_string()));
        }
    }
    Ok(())
}

/// Validates a path string against length constraints.
fn validate_path_string(field: &str, value: &str) -> Result<(), ConfigError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::Invalid(format!("{field} must be non-empty")));
    }
    if trimmed.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(ConfigError::Invalid(format!("{field} exceeds max length")));
    }
    for component in Path::new(trimmed).components() {
        if component.as_os_str().to_string_lossy().len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(ConfigError::Invalid(format!("{field} path component too long")));
        }
    }
    Ok(())
}

/// Validates a busy timeout.
fn validate_busy_timeout(field: &str, value: u64) -> Result<(), ConfigError> {
    if value > MAX_BUSY_TIMEOUT_MS {
        return Err(ConfigError::Invalid(format!("{field} must be at most {MAX_BUSY_TIMEOUT_MS}")));
    }
    Ok(())
}

/// Default tracker directory.
fn default_tracker_directory() -> String {
    DEFAULT_TRACKER_DIRECTORY.to_string()
}

/// Default per-origin quota.
const fn default_origin_quota() -> u64 {
    DEFAULT_ORIGIN_QUOTA
}

/// Default busy timeout.
const fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

/// Default vacuum threshold.
const fn default_vacuum_free_ratio_percent() -> u8 {
    DEFAULT_VACUUM_FREE_RATIO_PERCENT
}

/// Default worker thread name.
fn default_thread_name() -> String {
    DEFAULT_THREAD_NAME.to_string()
}

/// Serde default for `true` flags.
const fn default_true() -> bool {
    true
}
