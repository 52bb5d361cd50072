// crates/shapegate-gateway/src/change_log.rs
// ============================================================================
// Module: Change Log Shape Source
// Description: Shape subscriptions served from the commit sequencer's log.
// Purpose: Deliver commit-tagged changes without an external stream source.
// Dependencies: shapegate-core, axum, tokio, serde_json, tracing
// ============================================================================

//! ## Overview
//! With `upstream.source = "change_log"` the proxy answers
//! `/api/shape/{table}` itself, after the same rewrite and audit as a
//! forwarded request. Offsets are change-log positions and the handle names
//! the log of this process, so a client resuming with another handle gets a
//! `409` carrying `must-refetch`.
//!
//! One response:
//! - reads up to [`PAGE_LIMIT`] log entries after the offset;
//! - keeps entries of the route's table written by the caller;
//! - sends an insert or update that fails the client filter as a delete of
//!   its key, so the row leaves the client's shape;
//! - projects `columns` when the client asked for them;
//! - ends with `up-to-date` once the page reached the head of the log.
//!
//! A live request that finds nothing new waits up to the live window for a
//! commit before answering with an empty `up-to-date` batch.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::time::Duration;

use axum::body::Body;
use axum::http::HeaderValue;
use axum::http::StatusCode;
use axum::http::header;
use axum::response::Response;
use shapegate_core::ChangeEntry;
use shapegate_core::ClientPredicate;
use shapegate_core::CommitSequencer;
use shapegate_core::Control;
use shapegate_core::ControlHeaders;
use shapegate_core::LoggedChange;
use shapegate_core::Operation;
use shapegate_core::Principal;
use shapegate_core::ShapeMessage;
use shapegate_core::SharedCommitSequencer;
use shapegate_core::SyncError;
use shapegate_core::Table;
use shapegate_core::field_error;
use shapegate_core::stream::HEADER_HANDLE;
use shapegate_core::stream::HEADER_OFFSET;
use shapegate_core::stream::INITIAL_OFFSET;
use tokio::time::Instant;
use tracing::debug;

use crate::proxy::RewrittenRequest;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Maximum log entries read per response.
pub const PAGE_LIMIT: usize = 500;

/// Default long-poll window of a live request.
pub const LIVE_WAIT: Duration = Duration::from_secs(20);

/// Interval between log reads while a live request waits.
const LIVE_POLL: Duration = Duration::from_millis(50);

// ============================================================================
// SECTION: Source
// ============================================================================

/// Serves shapes from the commit sequencer's change log.
#[derive(Clone)]
pub struct ChangeLogSource {
    /// Sequencer whose log is read.
    sequencer: SharedCommitSequencer,
    /// Handle of this log; changes when the process restarts.
    handle: u64,
    /// Long-poll window of a live request.
    live_wait: Duration,
}

impl ChangeLogSource {
    /// Creates a source over a sequencer.
    #[must_use]
    pub fn new(sequencer: SharedCommitSequencer) -> Self {
        Self {
            sequencer,
            handle: u64::try_from(crate::audit::now_ms()).unwrap_or_default(),
            live_wait: LIVE_WAIT,
        }
    }

    /// Overrides the long-poll window.
    #[must_use]
    pub const fn with_live_wait(mut self, live_wait: Duration) -> Self {
        self.live_wait = live_wait;
        self
    }

    /// Handle reported in `electric-handle`.
    #[must_use]
    pub fn handle(&self) -> String {
        self.handle.to_string()
    }

    /// Answers one rewritten shape request from the log.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] for an offset that is not a log
    /// position and the store failure when the log cannot be read.
    pub async fn serve(
        &self,
        principal: &Principal,
        table: Table,
        request: &RewrittenRequest,
    ) -> Result<Response, SyncError> {
        if request.param("handle").is_some_and(|handle| handle != self.handle()) {
            debug!(principal = principal.id.get(), table = table.as_str(), "stale shape handle, asking for refetch");
            let body = vec![ShapeMessage::Control {
                headers: ControlHeaders {
                    control: Control::MustRefetch,
                },
            }];
            return self.respond(StatusCode::CONFLICT, &body, None);
        }
        let after = parse_offset(request.param("offset"))?;
        let live = request.param("live") == Some("true");
        let deadline = Instant::now() + self.live_wait;
        let page = loop {
            let page = self.read(after).await?;
            if !page.is_empty() || !live || Instant::now() >= deadline {
                break page;
            }
            tokio::time::sleep(LIVE_POLL).await;
        };
        let caught_up = page.len() < PAGE_LIMIT;
        let next = page.last().map_or(after, |change| change.offset);
        let mut messages: Vec<ShapeMessage> = page
            .into_iter()
            .filter(|change| change.table == table && change.owner == principal.id)
            .map(|change| {
                let entry = shape_entry(table, change.entry, &request.predicate, request.columns.as_deref());
                ShapeMessage::Change(entry)
            })
            .collect();
        if caught_up {
            messages.push(ShapeMessage::up_to_date());
        }
        debug!(
            principal = principal.id.get(),
            table = table.as_str(),
            after,
            next,
            entries = messages.len(),
            "served change-log page"
        );
        self.respond(StatusCode::OK, &messages, Some(next))
    }

    /// Reads one page of the log off the async runtime.
    async fn read(&self, after: u64) -> Result<Vec<LoggedChange>, SyncError> {
        let sequencer = self.sequencer.clone();
        tokio::task::spawn_blocking(move || sequencer.changes_since(after, PAGE_LIMIT))
            .await
            .map_err(|err| SyncError::StoreUnavailable(format!("change log read failed: {err}")))?
            .map_err(SyncError::from)
    }

    /// Encodes a shape response with its cursor headers.
    fn respond(
        &self,
        status: StatusCode,
        messages: &[ShapeMessage],
        offset: Option<u64>,
    ) -> Result<Response, SyncError> {
        let body = serde_json::to_vec(messages)
            .map_err(|err| SyncError::StoreUnavailable(format!("change log encoding failed: {err}")))?;
        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        let headers = response.headers_mut();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        headers.insert(HEADER_HANDLE, HeaderValue::from(self.handle));
        if let Some(offset) = offset {
            headers.insert(HEADER_OFFSET, HeaderValue::from(offset));
        }
        Ok(response)
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Parses a client offset; the initial offset reads from the start.
fn parse_offset(raw: Option<&str>) -> Result<u64, SyncError> {
    match raw {
        None | Some(INITIAL_OFFSET) => Ok(0),
        Some(text) => {
            text.parse::<u64>().map_err(|_| field_error("offset", "The offset is not a change-log position."))
        }
    }
}

/// Applies the client filter and projection to one logged entry.
fn shape_entry(
    table: Table,
    mut entry: ChangeEntry,
    predicate: &ClientPredicate,
    columns: Option<&[String]>,
) -> ChangeEntry {
    if entry.headers.operation != Operation::Delete && !predicate.matches(&entry.value) {
        entry.headers.operation = Operation::Delete;
        entry.value.retain(|column, _| table.key_columns().contains(&column.as_str()));
    }
    if let Some(columns) = columns {
        entry.value.retain(|column, _| columns.iter().any(|kept| kept == column));
    }
    entry
}
