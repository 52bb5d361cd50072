// crates/shapegate-store-sqlite/src/lib.rs
// ============================================================================
// Module: SQLite Commit Sequencer
// Description: Durable CommitSequencer backend using SQLite.
// Purpose: Provide transactional persistence with ordered commit markers.
// Dependencies: shapegate-core, rusqlite
// ============================================================================

//! ## Overview
//! This crate provides a SQLite-backed [`CommitSequencer`] implementation.
//! Every effect runs in a single transaction that also allocates its commit
//! marker and records its change-log rows, so the marker and the rows it
//! describes become visible together or not at all.
//!
//! [`CommitSequencer`]: shapegate_core::CommitSequencer

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod store;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use store::SqliteCommitSequencer;
pub use store::SqliteStoreConfig;
pub use store::SqliteStoreError;
pub use store::SqliteStoreMode;
pub use store::SqliteSyncMode;
pub use store::default_busy_timeout_ms;
