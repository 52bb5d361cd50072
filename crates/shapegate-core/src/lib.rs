// crates/shapegate-core/src/lib.rs
// ============================================================================
// Module: Shapegate Core Library
// Description: Public API surface for the Shapegate core.
// Purpose: Expose core types, interfaces, and runtime helpers.
// Dependencies: crate::{core, interfaces, runtime}
// ============================================================================

//! ## Overview
//! Shapegate core defines the tenant-scoped data model, mutation intents and
//! effects, the typed tenant scope used by the shape proxy, and the change
//! stream model used by client reconciliation. It is transport-agnostic and
//! integrates through explicit interfaces.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod core;
pub mod interfaces;
pub mod runtime;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use crate::core::*;

pub use interfaces::CommitError;
pub use interfaces::CommitSequencer;
pub use interfaces::LoggedChange;
pub use interfaces::PrincipalResolver;
pub use runtime::InMemoryCommitSequencer;
pub use runtime::SharedCommitSequencer;
