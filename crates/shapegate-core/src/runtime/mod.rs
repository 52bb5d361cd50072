// crates/shapegate-core/src/runtime/mod.rs
// ============================================================================
// Module: Shapegate Runtime
// Description: Runtime helpers shared by sequencer backends.
// Purpose: Provide the in-memory sequencer and change-log builders.
// Dependencies: crate::core, crate::interfaces
// ============================================================================

//! ## Overview
//! Runtime helpers for sequencer backends. The in-memory sequencer is used by
//! tests and by `store.type = "memory"` deployments.

// ============================================================================
// SECTION: Submodules
// ============================================================================

pub mod changes;
pub mod sequencer;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use changes::row_change;
pub use sequencer::InMemoryCommitSequencer;
pub use sequencer::SharedCommitSequencer;
