// crates/shapegate-client/src/transport.rs
// ============================================================================
// Module: Client Transports
// Description: Seams between the reconciliation engine and the network.
// Purpose: Let the engine run against HTTP or in-process fakes.
// Dependencies: shapegate-core, async-trait, serde_json
// ============================================================================

//! ## Overview
//! [`MutationTransport`] sends one mutation intent to the gateway and returns
//! the [`MutationReceipt`] carrying the commit marker. [`ShapeLog`] performs
//! one poll of a shape subscription from a cursor and returns the decoded
//! [`ShapeBatch`] together with the cursor to resume from.

// ============================================================================
// SECTION: Imports
// ============================================================================

use async_trait::async_trait;
use serde_json::Map;
use serde_json::Value;
use shapegate_core::CommitId;
use shapegate_core::EntityId;
use shapegate_core::LabelIntent;
use shapegate_core::ShapeCursor;
use shapegate_core::ShapeMessage;
use shapegate_core::Table;
use shapegate_core::TodoIntent;

use crate::error::ClientError;

/// JSON row as held by a collection.
pub type Row = Map<String, Value>;

// ============================================================================
// SECTION: Mutation Requests
// ============================================================================

/// Typed field set for a row mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowIntent {
    /// Todo fields.
    Todo(TodoIntent),
    /// Label fields.
    Label(LabelIntent),
}

impl RowIntent {
    /// Table the intent writes to.
    #[must_use]
    pub const fn table(&self) -> Table {
        match self {
            Self::Todo(_) => Table::Todos,
            Self::Label(_) => Table::Labels,
        }
    }

    /// Fields set by the intent, as JSON columns.
    #[must_use]
    pub fn columns(&self) -> Row {
        let mut row = Row::new();
        match self {
            Self::Todo(intent) => {
                if let Some(title) = &intent.title {
                    row.insert("title".to_string(), Value::String(title.clone()));
                }
                if let Some(description) = &intent.description {
                    row.insert(
                        "description".to_string(),
                        description.clone().map_or(Value::Null, Value::String),
                    );
                }
                if let Some(completed) = intent.completed {
                    row.insert("completed".to_string(), Value::Bool(completed));
                }
            }
            Self::Label(intent) => {
                if let Some(name) = &intent.name {
                    row.insert("name".to_string(), Value::String(name.clone()));
                }
                if let Some(color) = &intent.color {
                    row.insert("color".to_string(), Value::String(color.clone()));
                }
            }
        }
        row
    }

    /// Serializes the intent as a request body.
    fn body(&self) -> Result<Value, ClientError> {
        match self {
            Self::Todo(intent) => serde_json::to_value(intent),
            Self::Label(intent) => serde_json::to_value(intent),
        }
        .map_err(|err| ClientError::Protocol(format!("request encoding failed: {err}")))
    }
}

/// One mutation sent to the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationRequest {
    /// Create a row.
    Create(RowIntent),
    /// Update fields of a row.
    Update {
        /// Target row.
        id: EntityId,
        /// Fields to change.
        intent: RowIntent,
    },
    /// Delete a row.
    Delete {
        /// Table of the row.
        table: Table,
        /// Target row.
        id: EntityId,
    },
    /// Replace the full label set of a todo.
    ReplaceLabels {
        /// Todo whose associations are replaced.
        todo_id: EntityId,
        /// Requested label set.
        label_ids: Vec<EntityId>,
    },
}

impl MutationRequest {
    /// Table whose rows the request primarily changes.
    #[must_use]
    pub const fn table(&self) -> Table {
        match self {
            Self::Create(intent)
            | Self::Update {
                intent, ..
            } => intent.table(),
            Self::Delete {
                table, ..
            } => *table,
            Self::ReplaceLabels {
                ..
            } => Table::TodoLabels,
        }
    }

    /// HTTP method, path, and optional JSON body for the request.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Protocol`] when the body cannot be encoded and
    /// [`ClientError::Config`] when deleting from the junction table.
    pub fn http_parts(&self) -> Result<(&'static str, String, Option<Value>), ClientError> {
        Ok(match self {
            Self::Create(intent) => {
                ("POST", format!("/api/{}", resource(intent.table())?), Some(intent.body()?))
            }
            Self::Update {
                id,
                intent,
            } => ("PATCH", format!("/api/{}/{id}", resource(intent.table())?), Some(intent.body()?)),
            Self::Delete {
                table,
                id,
            } => ("DELETE", format!("/api/{}/{id}", resource(*table)?), None),
            Self::ReplaceLabels {
                todo_id,
                label_ids,
            } => (
                "PUT",
                format!("/api/todos/{todo_id}/labels"),
                Some(serde_json::json!({ "label_ids": label_ids })),
            ),
        })
    }
}

/// Gateway collection path for a table.
fn resource(table: Table) -> Result<&'static str, ClientError> {
    match table {
        Table::Todos => Ok("todos"),
        Table::Labels => Ok("labels"),
        Table::TodoLabels => {
            Err(ClientError::Config("associations change only through label replacement".to_string()))
        }
    }
}

/// Gateway answer to a committed mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationReceipt {
    /// Marker of the commit that persisted the mutation.
    pub commit_id: CommitId,
    /// Row as persisted, for creates and updates.
    pub row: Option<Row>,
    /// Label set after the commit, when associations were touched.
    pub label_ids: Option<Vec<EntityId>>,
}

impl MutationReceipt {
    /// Decodes a gateway response body.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Protocol`] when the commit marker is missing.
    pub fn from_body(body: &Value) -> Result<Self, ClientError> {
        let commit_id = body
            .get("commit_id")
            .cloned()
            .and_then(|value| serde_json::from_value::<CommitId>(value).ok())
            .ok_or_else(|| ClientError::Protocol("response carries no commit_id".to_string()))?;
        let row = ["todo", "label"]
            .into_iter()
            .find_map(|key| body.get(key).and_then(Value::as_object).cloned());
        let label_ids = body
            .get("label_ids")
            .cloned()
            .and_then(|value| serde_json::from_value::<Vec<EntityId>>(value).ok());
        Ok(Self {
            commit_id,
            row,
            label_ids,
        })
    }
}

// ============================================================================
// SECTION: Shape Batches
// ============================================================================

/// Result of one shape poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeBatch {
    /// Messages in log order.
    pub messages: Vec<ShapeMessage>,
    /// Cursor to resume from once the messages are applied.
    pub next: ShapeCursor,
}

// ============================================================================
// SECTION: Transport Traits
// ============================================================================

/// Sends mutations to the gateway.
#[async_trait]
pub trait MutationTransport: Send + Sync {
    /// Sends one mutation and waits for its commit marker.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the gateway rejects the mutation or
    /// cannot be reached.
    async fn send(&self, request: &MutationRequest) -> Result<MutationReceipt, ClientError>;
}

/// Polls a shape subscription.
#[async_trait]
pub trait ShapeLog: Send + Sync {
    /// Fetches the messages after `cursor`.
    ///
    /// A must-refetch answer is returned as a batch holding a `must-refetch`
    /// control message and the initial cursor.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] when the poll fails.
    async fn poll(
        &self,
        table: Table,
        cursor: &ShapeCursor,
        filter: Option<&str>,
    ) -> Result<ShapeBatch, ClientError>;
}
