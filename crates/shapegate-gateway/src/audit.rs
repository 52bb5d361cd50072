// crates/shapegate-gateway/src/audit.rs
// ============================================================================
// Module: Gateway Audit Logging
// Description: Structured audit events for security-relevant decisions.
// Purpose: Record authentication, scope rewrites, and mutation outcomes.
// Dependencies: shapegate-config, serde
// ============================================================================

//! ## Overview
//! Audit events are JSON lines routed through an [`AuditSink`]. They cover
//! authentication decisions, the tenant scope injected into every shape
//! request, and the outcome of every mutation. Tokens never appear; only
//! their fingerprints.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs::OpenOptions;
use std::io;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde::Serialize;
use shapegate_config::AuditConfig;
use shapegate_config::AuditSinkType;

// ============================================================================
// SECTION: Events
// ============================================================================

/// Authentication decision at the HTTP edge.
#[derive(Debug, Clone, Serialize)]
pub struct AuthAuditEvent {
    /// Event identifier.
    pub event: &'static str,
    /// Event timestamp (milliseconds since epoch).
    pub timestamp_ms: u128,
    /// `allow` or `deny`.
    pub decision: &'static str,
    /// Route pattern of the request.
    pub route: String,
    /// Resolved principal on allow.
    pub principal_id: Option<u64>,
    /// Token fingerprint on allow.
    pub token_fingerprint: Option<String>,
    /// Failure reason on deny.
    pub reason: Option<String>,
}

impl AuthAuditEvent {
    /// Builds an allow event.
    #[must_use]
    pub fn allowed(route: &str, principal_id: u64, token_fingerprint: &str) -> Self {
        Self {
            event: "shapegate_auth",
            timestamp_ms: now_ms(),
            decision: "allow",
            route: route.to_string(),
            principal_id: Some(principal_id),
            token_fingerprint: Some(token_fingerprint.to_string()),
            reason: None,
        }
    }

    /// Builds a deny event.
    #[must_use]
    pub fn denied(route: &str, reason: &str) -> Self {
        Self {
            event: "shapegate_auth",
            timestamp_ms: now_ms(),
            decision: "deny",
            route: route.to_string(),
            principal_id: None,
            token_fingerprint: None,
            reason: Some(reason.to_string()),
        }
    }
}

/// Scope rewrite applied to a shape request.
#[derive(Debug, Clone, Serialize)]
pub struct ScopeAuditEvent {
    /// Event identifier.
    pub event: &'static str,
    /// Event timestamp (milliseconds since epoch).
    pub timestamp_ms: u128,
    /// Acting principal.
    pub principal_id: u64,
    /// Storage table of the shape.
    pub table: &'static str,
    /// Rendered clause sent upstream (values are parameters, not text).
    pub clause: String,
    /// Client filters kept.
    pub client_filters: usize,
    /// Client filters on the tenant column that were dropped.
    pub dropped_filters: usize,
    /// Client query parameters that were not forwarded.
    pub discarded_params: Vec<String>,
}

/// Outcome of one mutation.
#[derive(Debug, Clone, Serialize)]
pub struct MutationAuditEvent {
    /// Event identifier.
    pub event: &'static str,
    /// Event timestamp (milliseconds since epoch).
    pub timestamp_ms: u128,
    /// Acting principal.
    pub principal_id: u64,
    /// Effect label.
    pub action: &'static str,
    /// Commit marker on success.
    pub commit_id: Option<String>,
    /// Error kind on failure.
    pub error_kind: Option<&'static str>,
    /// Attempts used.
    pub attempts: u32,
}

impl MutationAuditEvent {
    /// Builds a mutation event.
    #[must_use]
    pub fn new(
        principal_id: u64,
        action: &'static str,
        outcome: Result<String, &'static str>,
        attempts: u32,
    ) -> Self {
        let (commit_id, error_kind) = match outcome {
            Ok(commit_id) => (Some(commit_id), None),
            Err(kind) => (None, Some(kind)),
        };
        Self {
            event: "shapegate_mutation",
            timestamp_ms: now_ms(),
            principal_id,
            action,
            commit_id,
            error_kind,
            attempts,
        }
    }
}

/// Any audit event.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum AuditEvent {
    /// Authentication decision.
    Auth(AuthAuditEvent),
    /// Shape scope rewrite.
    Scope(ScopeAuditEvent),
    /// Mutation outcome.
    Mutation(MutationAuditEvent),
}

// ============================================================================
// SECTION: Sinks
// ============================================================================

/// Destination for audit events.
pub trait AuditSink: Send + Sync {
    /// Records one event.
    fn record(&self, event: &AuditEvent);
}

/// Audit sink that logs JSON lines to stderr.
pub struct StderrAuditSink;

impl AuditSink for StderrAuditSink {
    fn record(&self, event: &AuditEvent) {
        if let Ok(payload) = serde_json::to_string(event) {
            let _ = writeln!(io::stderr(), "{payload}");
        }
    }
}

/// Audit sink that appends JSON lines to a file.
pub struct FileAuditSink {
    /// File handle used for append-only logging.
    file: Mutex<std::fs::File>,
}

impl FileAuditSink {
    /// Opens the audit log in append mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn new(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl AuditSink for FileAuditSink {
    fn record(&self, event: &AuditEvent) {
        if let Ok(payload) = serde_json::to_string(event)
            && let Ok(mut file) = self.file.lock()
        {
            let _ = writeln!(file, "{payload}");
            let _ = file.flush();
        }
    }
}

/// No-op audit sink.
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn record(&self, _event: &AuditEvent) {}
}

/// Builds the sink selected by configuration.
///
/// # Errors
///
/// Returns an error when the file sink cannot be opened.
pub fn sink_from_config(config: &AuditConfig) -> io::Result<Arc<dyn AuditSink>> {
    Ok(match (config.sink, &config.path) {
        (AuditSinkType::Stderr, _) => Arc::new(StderrAuditSink),
        (AuditSinkType::File, Some(path)) => Arc::new(FileAuditSink::new(Path::new(path))?),
        (AuditSinkType::File, None) => {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "file audit sink requires path"));
        }
        (AuditSinkType::None, _) => Arc::new(NoopAuditSink),
    })
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u128 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis()
}
