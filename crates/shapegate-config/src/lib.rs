// crates/shapegate-config/src/lib.rs
// ============================================================================
// Module: Shapegate Config Library
// Description: Canonical config model and validation.
// Purpose: Single source of truth for shapegate.toml semantics.
// Dependencies: shapegate-core, shapegate-store-sqlite, serde, toml
// ============================================================================

//! ## Overview
//! `shapegate-config` defines the configuration model for the Shapegate
//! server and validates it fail-closed before any listener starts.
//!
//! Security posture: config inputs are untrusted.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod config;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use config::*;
