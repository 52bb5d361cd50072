// crates/shapegate-client/src/error.rs
// ============================================================================
// Module: Client Errors
// Description: Failures surfaced by transports, collections, and subscriptions.
// Purpose: Separate server rejections from transport and protocol failures.
// Dependencies: shapegate-core, thiserror
// ============================================================================

use shapegate_core::SyncError;
use shapegate_core::ValidationErrors;
use thiserror::Error;

/// Client-side failures.
///
/// # Invariants
/// - Variants are stable for error classification.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    /// The server answered with a classified rejection.
    #[error(transparent)]
    Rejected(#[from] SyncError),
    /// The request never produced a response.
    #[error("transport error: {0}")]
    Transport(String),
    /// The response could not be understood.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Invalid client configuration.
    #[error("invalid client configuration: {0}")]
    Config(String),
}

impl ClientError {
    /// Returns true when the same request may succeed later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Rejected(SyncError::UpstreamStream {
                status, ..
            }) => match status {
                Some(code) => *code >= 500,
                None => true,
            },
            Self::Rejected(error) => error.is_retryable(),
            Self::Protocol(_) | Self::Config(_) => false,
        }
    }

    /// Returns true when the caller must re-authenticate.
    #[must_use]
    pub const fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Rejected(SyncError::Unauthorized(_)))
    }
}

/// Classifies a non-success gateway response.
pub(crate) fn rejection(status: u16, body: &serde_json::Value) -> ClientError {
    let message = body
        .get("message")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("request failed")
        .to_string();
    let error = match status {
        401 => SyncError::Unauthorized(message),
        404 => SyncError::NotFound,
        409 => SyncError::ConstraintViolation(message),
        422 => SyncError::Validation(
            body.get("errors")
                .cloned()
                .and_then(|errors| serde_json::from_value::<ValidationErrors>(errors).ok())
                .unwrap_or_default(),
        ),
        503 => SyncError::StoreUnavailable(message),
        _ => SyncError::UpstreamStream {
            status: Some(status),
            message,
        },
    };
    ClientError::Rejected(error)
}
