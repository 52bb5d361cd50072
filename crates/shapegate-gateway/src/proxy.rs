// crates/shapegate-gateway/src/proxy.rs
// ============================================================================
// Module: Shape Filter Proxy
// Description: Tenant-scoped forwarding of shape subscriptions.
// Purpose: Inject the server-authored scope and relay the upstream stream.
// Dependencies: shapegate-core, axum, reqwest, futures, url, tracing
// ============================================================================

//! ## Overview
//! A shape request moves through `Received -> Rewritten -> Forwarded ->
//! Streaming -> {Closed | Errored}`:
//! - Received: the route fixes the table; the raw query string is untrusted.
//! - Rewritten: cursor parameters pass through, the client `where` is parsed
//!   into typed filters and conjoined after the [`TenantScope`], and every
//!   other client parameter (`table`, `params[..]`, `replica`, ...) is
//!   discarded.
//! - Forwarded: one upstream GET with `accept-encoding: identity`.
//! - Streaming: the body is relayed chunk by chunk and never buffered.
//!   Framing headers that the local transport re-derives are stripped.
//! - Closed/Errored: dropping the relay (client gone or stream end) drops the
//!   upstream response and releases its connection.
//!
//! The proxy never retries; the client owns its cursor and its backoff.
//!
//! When built over a [`ChangeLogSource`], the Forwarded and Streaming phases
//! are replaced by a page of the local commit sequencer's change log; the
//! rewrite and the audit record are the same.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;

use axum::body::Body;
use axum::http::HeaderMap;
use axum::http::HeaderValue;
use axum::http::header;
use axum::response::Response;
use futures::StreamExt;
use shapegate_config::ConfigError;
use shapegate_config::UpstreamConfig;
use shapegate_core::ClientPredicate;
use shapegate_core::Principal;
use shapegate_core::ScopedWhere;
use shapegate_core::SyncError;
use shapegate_core::Table;
use shapegate_core::TenantScope;
use shapegate_core::field_error;
use shapegate_core::parse_columns;
use shapegate_core::stream::PASSTHROUGH_PARAMS;
use thiserror::Error;
use tracing::debug;
use tracing::info;
use tracing::warn;
use url::Url;
use url::form_urlencoded;

use crate::audit::AuditEvent;
use crate::audit::AuditSink;
use crate::audit::ScopeAuditEvent;
use crate::change_log::ChangeLogSource;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Response headers never relayed to the client.
const STRIPPED_HEADERS: [&str; 10] = [
    "content-encoding",
    "content-length",
    "transfer-encoding",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "upgrade",
];

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Proxy construction errors.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Invalid upstream configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// HTTP client could not be built.
    #[error("upstream client error: {0}")]
    Client(String),
}

// ============================================================================
// SECTION: Rewritten Request
// ============================================================================

/// Upstream request produced by the rewrite phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrittenRequest {
    /// Full upstream URL.
    pub url: Url,
    /// Scoped clause sent as `where`.
    pub scoped: ScopedWhere,
    /// Client filters kept.
    pub client_filters: usize,
    /// Client filters on the tenant column that were dropped.
    pub dropped_filters: usize,
    /// Client parameter names that were not forwarded.
    pub discarded_params: Vec<String>,
    /// Cursor parameters passed through, first occurrence only.
    pub passthrough: Vec<(&'static str, String)>,
    /// Parsed client filters.
    pub predicate: ClientPredicate,
    /// Requested columns, key columns included.
    pub columns: Option<Vec<String>>,
}

impl RewrittenRequest {
    /// Returns a passed-through cursor parameter.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.passthrough.iter().find(|(key, _)| *key == name).map(|(_, value)| value.as_str())
    }
}

// ============================================================================
// SECTION: Proxy
// ============================================================================

/// Forwards tenant-scoped shape requests to the change-stream source.
#[derive(Clone)]
pub struct ShapeProxy {
    /// Upstream HTTP client.
    client: reqwest::Client,
    /// Shape endpoint on the source.
    shape_url: Url,
    /// Request full rows on updates.
    replica_full: bool,
    /// Source secret added to every upstream request.
    secret: Option<String>,
    /// Audit sink.
    audit: Arc<dyn AuditSink>,
    /// Local change log served instead of the remote source.
    change_log: Option<ChangeLogSource>,
}

impl ShapeProxy {
    /// Builds a proxy from upstream configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError`] when the URL is invalid or the client cannot be
    /// built.
    pub fn from_config(
        config: &UpstreamConfig,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, ProxyError> {
        let shape_url = config.shape_url()?;
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|err| ProxyError::Client(err.to_string()))?;
        Ok(Self {
            client,
            shape_url,
            replica_full: config.replica_full,
            secret: config.secret.clone(),
            audit,
            change_log: None,
        })
    }

    /// Serves shapes from a local change log instead of the remote source.
    #[must_use]
    pub fn with_change_log(mut self, source: ChangeLogSource) -> Self {
        self.change_log = Some(source);
        self
    }

    /// Rewrites a client query into the scoped upstream URL.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] when `where` or `columns` is invalid.
    pub fn rewrite(
        &self,
        principal: &Principal,
        table: Table,
        raw_query: Option<&str>,
    ) -> Result<RewrittenRequest, SyncError> {
        let mut passthrough: Vec<(&'static str, String)> = Vec::new();
        let mut predicate: Option<ClientPredicate> = None;
        let mut columns: Option<Vec<String>> = None;
        let mut discarded_params = Vec::new();
        for (key, value) in form_urlencoded::parse(raw_query.unwrap_or_default().as_bytes()) {
            if let Some(name) = PASSTHROUGH_PARAMS.iter().find(|name| **name == key) {
                if !passthrough.iter().any(|(existing, _)| existing == name) {
                    passthrough.push((*name, value.into_owned()));
                }
            } else if key == "where" {
                if predicate.is_some() {
                    return Err(field_error("where", "The where parameter may only be given once."));
                }
                predicate = Some(if value.trim().is_empty() {
                    ClientPredicate::default()
                } else {
                    ClientPredicate::parse(table, &value)?
                });
            } else if key == "columns" {
                columns = Some(parse_columns(table, &value)?);
            } else {
                discarded_params.push(key.into_owned());
            }
        }
        let predicate = predicate.unwrap_or_default();
        let scoped = ScopedWhere::build(&TenantScope::new(table, principal.id), &predicate);

        let mut url = self.shape_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("table", table.as_str());
            for (name, value) in &passthrough {
                query.append_pair(name, value);
            }
            query.append_pair("where", &scoped.clause);
            for (index, value) in scoped.params.iter().enumerate() {
                query.append_pair(&format!("params[{}]", index + 1), value);
            }
            if let Some(columns) = &columns {
                query.append_pair("columns", &columns.join(","));
            }
            if self.replica_full {
                query.append_pair("replica", "full");
            }
            if let Some(secret) = &self.secret {
                query.append_pair("secret", secret);
            }
        }
        Ok(RewrittenRequest {
            url,
            client_filters: predicate.filters().len(),
            dropped_filters: predicate.dropped(),
            scoped,
            discarded_params,
            passthrough,
            predicate,
            columns,
        })
    }

    /// Runs one subscription request through the proxy state machine.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] for an invalid query and
    /// [`SyncError::UpstreamStream`] when the source cannot be reached.
    pub async fn relay(
        &self,
        principal: &Principal,
        table: Table,
        raw_query: Option<&str>,
    ) -> Result<Response, SyncError> {
        let principal_id = principal.id.get();
        debug!(principal = principal_id, table = table.as_str(), phase = "received", "shape request");
        let rewritten = self.rewrite(principal, table, raw_query)?;
        debug!(
            principal = principal_id,
            table = table.as_str(),
            phase = "rewritten",
            clause = %rewritten.scoped.clause,
            dropped = rewritten.dropped_filters,
            "shape request scoped"
        );
        self.audit.record(&AuditEvent::Scope(ScopeAuditEvent {
            event: "shapegate_scope",
            timestamp_ms: crate::audit::now_ms(),
            principal_id,
            table: table.as_str(),
            clause: rewritten.scoped.clause.clone(),
            client_filters: rewritten.client_filters,
            dropped_filters: rewritten.dropped_filters,
            discarded_params: rewritten.discarded_params.clone(),
        }));
        if let Some(change_log) = &self.change_log {
            return change_log.serve(principal, table, &rewritten).await;
        }

        let upstream = self
            .client
            .get(rewritten.url)
            .header(header::ACCEPT_ENCODING, HeaderValue::from_static("identity"))
            .send()
            .await
            .map_err(|err| {
                warn!(principal = principal_id, table = table.as_str(), phase = "errored", error = %err, "upstream unreachable");
                SyncError::UpstreamStream {
                    status: None,
                    message: "change-stream source unreachable".to_string(),
                }
            })?;
        let status = upstream.status();
        if status.is_success() {
            info!(principal = principal_id, table = table.as_str(), phase = "streaming", status = status.as_u16(), "relaying shape stream");
        } else {
            warn!(principal = principal_id, table = table.as_str(), phase = "errored", status = status.as_u16(), "upstream returned error status");
        }
        let headers = relay_headers(upstream.headers());
        let guard = RelayGuard {
            principal: principal_id,
            table,
        };
        let stream = upstream.bytes_stream().map(move |chunk| {
            if let Err(err) = &chunk {
                warn!(principal = guard.principal, table = guard.table.as_str(), phase = "errored", error = %err, "upstream stream failed");
            }
            chunk
        });
        let mut response = Response::new(Body::from_stream(stream));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

// ============================================================================
// SECTION: Relay Helpers
// ============================================================================

/// Logs the closed phase when the relayed body is dropped.
struct RelayGuard {
    /// Acting principal.
    principal: u64,
    /// Shape table.
    table: Table,
}

impl Drop for RelayGuard {
    fn drop(&mut self) {
        debug!(principal = self.principal, table = self.table.as_str(), phase = "closed", "shape relay released");
    }
}

/// Copies upstream headers, dropping framing and hop-by-hop headers.
#[must_use]
pub fn relay_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        if STRIPPED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}
