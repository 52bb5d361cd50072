// crates/shapegate-core/src/core/errors.rs
// ============================================================================
// Module: Shapegate Error Taxonomy
// Description: Boundary errors shared by the gateway, proxy, and client.
// Purpose: Keep error classes stable across transports.
// Dependencies: serde, thiserror
// ============================================================================

//! ## Overview
//! [`SyncError`] is the error taxonomy surfaced to callers. `NotFound` is used
//! both for absent rows and rows owned by another principal so responses never
//! reveal whether another tenant's row exists.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

// ============================================================================
// SECTION: Validation Errors
// ============================================================================

/// Field-level validation failures keyed by field name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValidationErrors(BTreeMap<String, Vec<String>>);

impl ValidationErrors {
    /// Creates an empty error set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failure for a field.
    pub fn add(&mut self, field: &str, message: impl Into<String>) {
        self.0.entry(field.to_string()).or_default().push(message.into());
    }

    /// Returns true when no failures were recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the messages recorded for a field.
    #[must_use]
    pub fn field(&self, field: &str) -> Option<&[String]> {
        self.0.get(field).map(Vec::as_slice)
    }

    /// Converts into a result, failing when any failure was recorded.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] when the set is non-empty.
    pub fn into_result(self) -> Result<(), SyncError> {
        if self.is_empty() { Ok(()) } else { Err(SyncError::Validation(self)) }
    }

    /// Returns a single-line summary of the first failure.
    #[must_use]
    pub fn summary(&self) -> String {
        self.0
            .iter()
            .next()
            .and_then(|(field, messages)| {
                messages.first().map(|message| format!("{field}: {message}"))
            })
            .unwrap_or_else(|| "invalid input".to_string())
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

/// Builds a validation error for a single field.
#[must_use]
pub fn field_error(field: &str, message: impl Into<String>) -> SyncError {
    let mut errors = ValidationErrors::new();
    errors.add(field, message);
    SyncError::Validation(errors)
}

// ============================================================================
// SECTION: Sync Errors
// ============================================================================

/// Error taxonomy for mutations and shape subscriptions.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    /// Malformed or missing intent fields; rejected before any transaction.
    #[error("validation failed: {0}")]
    Validation(ValidationErrors),
    /// Row absent or owned by another principal.
    #[error("not found")]
    NotFound,
    /// Missing or invalid principal.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Transient store failure; the whole mutation may be retried.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    /// Integrity failure reported by the store; not retryable.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    /// Forward link to the change-stream source failed.
    #[error("upstream stream error: {message}")]
    UpstreamStream {
        /// Upstream status code when a response was received.
        status: Option<u16>,
        /// Failure description.
        message: String,
    },
}

impl SyncError {
    /// Returns true when retrying the same request may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }

    /// Returns a stable label for logs and audit events.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound => "not_found",
            Self::Unauthorized(_) => "unauthorized",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::ConstraintViolation(_) => "constraint_violation",
            Self::UpstreamStream {
                ..
            } => "upstream_stream",
        }
    }
}
