// crates/originsql-config/src/lib.rs
// ============================================================================
// Module: OriginSQL Config Library
// Description: Canonical config model, validation, and example generation.
// Purpose: Single source of truth for originsql.toml semantics.
// Dependencies: originsql-core, originsql-sqlite, serde, toml
// ============================================================================

//! ## Overview
//! `originsql-config` defines the configuration model for an OriginSQL
//! deployment: where the tracker keeps its registry, how engine connections
//! are tuned, which SQL functions caller code may use, and where lifecycle
//! events go. Validation fails closed.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod config;
pub mod examples;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use config::*;
pub use examples::config_toml_example;
