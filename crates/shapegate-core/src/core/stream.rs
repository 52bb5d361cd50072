// crates/shapegate-core/src/core/stream.rs
// ============================================================================
// Module: Shapegate Change Stream Model
// Description: Change-stream messages, control messages, and resume cursors.
// Purpose: Shared wire model for the proxy, the store change log, and clients.
// Dependencies: serde, serde_json
// ============================================================================

//! ## Overview
//! A shape response is a JSON array of [`ShapeMessage`]s. Change entries carry
//! the row key, the row value and the commit markers (`txids`) of the
//! transaction that produced them. Control entries mark the end of a
//! consistent batch (`up-to-date`) or a forced reset (`must-refetch`).
//! [`ShapeCursor`] holds the resume position taken from response headers.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::core::identifiers::CommitId;
use crate::core::identifiers::RowKey;
use crate::core::model::ColumnKind;
use crate::core::model::Table;

// ============================================================================
// SECTION: Protocol Constants
// ============================================================================

/// Response header carrying the shape handle.
pub const HEADER_HANDLE: &str = "electric-handle";
/// Response header carrying the next offset.
pub const HEADER_OFFSET: &str = "electric-offset";
/// Response header carrying the live cursor.
pub const HEADER_CURSOR: &str = "electric-cursor";
/// Offset requesting a subscription from the beginning.
pub const INITIAL_OFFSET: &str = "-1";
/// Query parameters a client may pass through the proxy unchanged.
pub const PASSTHROUGH_PARAMS: [&str; 4] = ["offset", "handle", "live", "cursor"];

// ============================================================================
// SECTION: Messages
// ============================================================================

/// Kind of row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Row inserted.
    Insert,
    /// Row updated.
    Update,
    /// Row deleted.
    Delete,
}

/// Headers attached to a change entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeHeaders {
    /// Kind of change.
    pub operation: Operation,
    /// Commit markers of the producing transaction.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub txids: Vec<CommitId>,
    /// Schema and table of the row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<Vec<String>>,
}

/// One authoritative row change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEntry {
    /// Row key.
    pub key: RowKey,
    /// Row value; for deletes only the key columns are required.
    #[serde(default)]
    pub value: Map<String, Value>,
    /// Change headers.
    pub headers: ChangeHeaders,
}

impl ChangeEntry {
    /// Returns the commit marker of the entry, if tagged.
    #[must_use]
    pub fn commit_id(&self) -> Option<CommitId> {
        self.headers.txids.iter().copied().max()
    }
}

/// Control signal kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Control {
    /// The batch so far is a consistent prefix of the log.
    UpToDate,
    /// The shape was rotated; the client must restart from the beginning.
    MustRefetch,
    /// Snapshot finished; treated like an informational marker.
    SnapshotEnd,
}

/// Headers of a control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlHeaders {
    /// Control signal.
    pub control: Control,
}

/// Entry of a shape response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ShapeMessage {
    /// Row change.
    Change(ChangeEntry),
    /// Control signal.
    Control {
        /// Control headers.
        headers: ControlHeaders,
    },
}

impl ShapeMessage {
    /// Builds an `up-to-date` control message.
    #[must_use]
    pub const fn up_to_date() -> Self {
        Self::Control {
            headers: ControlHeaders {
                control: Control::UpToDate,
            },
        }
    }
}

// ============================================================================
// SECTION: Cursor
// ============================================================================

/// Resume position of a shape subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeCursor {
    /// Log offset; `-1` starts from the beginning.
    pub offset: String,
    /// Shape handle issued by the source.
    pub handle: Option<String>,
    /// Live-mode cursor issued by the source.
    pub cursor: Option<String>,
    /// True once the subscription has caught up and long-polls.
    pub live: bool,
}

impl ShapeCursor {
    /// Returns the cursor for a fresh subscription.
    #[must_use]
    pub fn initial() -> Self {
        Self {
            offset: INITIAL_OFFSET.to_string(),
            handle: None,
            cursor: None,
            live: false,
        }
    }

    /// Returns true when the cursor starts from the beginning.
    #[must_use]
    pub fn is_initial(&self) -> bool {
        self.offset == INITIAL_OFFSET
    }

    /// Returns query pairs for the next request.
    #[must_use]
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![("offset", self.offset.clone())];
        if let Some(handle) = &self.handle {
            pairs.push(("handle", handle.clone()));
        }
        if self.live {
            pairs.push(("live", "true".to_string()));
            if let Some(cursor) = &self.cursor {
                pairs.push(("cursor", cursor.clone()));
            }
        }
        pairs
    }
}

impl Default for ShapeCursor {
    fn default() -> Self {
        Self::initial()
    }
}

// ============================================================================
// SECTION: Value Normalization
// ============================================================================

/// Converts text-encoded column values to typed JSON using the table catalog.
///
/// Sources that encode every value as text (`"42"`, `"true"`, `"t"`) and
/// sources that send typed JSON both normalize to the same representation.
#[must_use]
pub fn normalize_row(table: Table, value: Map<String, Value>) -> Map<String, Value> {
    value
        .into_iter()
        .map(|(column, raw)| {
            let typed = match (table.column_kind(&column), raw) {
                (Some(ColumnKind::Integer), Value::String(text)) => text
                    .parse::<i64>()
                    .map_or(Value::String(text), |number| Value::Number(number.into())),
                (Some(ColumnKind::Boolean), Value::String(text)) => match text.as_str() {
                    "true" | "t" => Value::Bool(true),
                    "false" | "f" => Value::Bool(false),
                    _ => Value::String(text),
                },
                (_, other) => other,
            };
            (column, typed)
        })
        .collect()
}
