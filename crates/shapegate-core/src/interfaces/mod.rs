// crates/shapegate-core/src/interfaces/mod.rs
// ============================================================================
// Module: Shapegate Interfaces
// Description: Backend-agnostic interfaces for commits and principal resolution.
// Purpose: Define the contract surfaces used by the gateway and proxy.
// Dependencies: crate::core, thiserror
// ============================================================================

//! ## Overview
//! Interfaces decouple the HTTP surface from the relational store and from
//! the authentication service. Implementations must scope every read and
//! write to the acting principal and fail closed.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::core::CommitResult;
use crate::core::EntityId;
use crate::core::Principal;
use crate::core::PrincipalId;
use crate::core::Record;
use crate::core::ScopedEffect;
use crate::core::SyncError;
use crate::core::Table;
use crate::core::stream::ChangeEntry;

// ============================================================================
// SECTION: Commit Sequencer
// ============================================================================

/// Commit sequencer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommitError {
    /// Target row is absent or owned by another principal.
    #[error("row not found")]
    NotFound,
    /// Store unreachable, busy, or locked; the effect was not applied.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    /// Integrity constraint rejected the effect; the effect was not applied.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    /// Stored data could not be decoded.
    #[error("store data invalid: {0}")]
    Invalid(String),
}

impl From<CommitError> for SyncError {
    fn from(error: CommitError) -> Self {
        match error {
            CommitError::NotFound => Self::NotFound,
            CommitError::StoreUnavailable(message) => Self::StoreUnavailable(message),
            CommitError::ConstraintViolation(message) | CommitError::Invalid(message) => {
                Self::ConstraintViolation(message)
            }
        }
    }
}

/// Change-log entry recorded alongside a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedChange {
    /// Position in the change log, strictly increasing.
    pub offset: u64,
    /// Table of the changed row.
    pub table: Table,
    /// Principal owning the changed row.
    pub owner: PrincipalId,
    /// Change as it appears in a shape stream.
    pub entry: ChangeEntry,
}

/// Executes one effect per transaction and reports its commit marker.
pub trait CommitSequencer {
    /// Applies the effect atomically and returns the commit marker.
    ///
    /// Ownership of every touched row is verified inside the same
    /// transaction that mutates.
    ///
    /// # Errors
    ///
    /// Returns [`CommitError`] when the effect cannot be applied; nothing is
    /// persisted in that case.
    fn commit(&self, effect: &ScopedEffect) -> Result<CommitResult, CommitError>;

    /// Loads one row owned by `owner`.
    ///
    /// # Errors
    ///
    /// Returns [`CommitError`] when the store cannot be read.
    fn fetch(
        &self,
        owner: PrincipalId,
        table: Table,
        id: EntityId,
    ) -> Result<Option<Record>, CommitError>;

    /// Lists rows owned by `owner`: todos newest first, labels by name.
    ///
    /// # Errors
    ///
    /// Returns [`CommitError`] when the store cannot be read.
    fn list(&self, owner: PrincipalId, table: Table) -> Result<Vec<Record>, CommitError>;

    /// Returns the label ids attached to a todo owned by `owner`.
    ///
    /// # Errors
    ///
    /// Returns [`CommitError`] when the store cannot be read.
    fn label_ids(&self, owner: PrincipalId, todo_id: EntityId)
    -> Result<Vec<EntityId>, CommitError>;

    /// Reads change-log entries with `offset > after`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`CommitError`] when the store cannot be read.
    fn changes_since(&self, after: u64, limit: usize) -> Result<Vec<LoggedChange>, CommitError>;
}

// ============================================================================
// SECTION: Principal Resolver
// ============================================================================

/// Resolves bearer credentials to principals.
pub trait PrincipalResolver {
    /// Returns the principal for a bearer token, or `None` when unknown.
    fn resolve(&self, token: &str) -> Option<Principal>;
}
