// crates/shapegate-core/src/core/model.rs
// ============================================================================
// Module: Shapegate Data Model
// Description: Tenant-owned tables, row types, and the table catalog.
// Purpose: Single definition of which tables exist and how they are keyed.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! Every row in `todos` and `labels` is owned by exactly one [`PrincipalId`]
//! through its `user_id` column. `label_todo` rows have no owner column of
//! their own and inherit ownership from the referenced todo.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::core::identifiers::EntityId;
use crate::core::identifiers::PrincipalId;
use crate::core::identifiers::RowKey;

// ============================================================================
// SECTION: Principal
// ============================================================================

/// Authenticated identity resolved from a bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Stable numeric identifier.
    pub id: PrincipalId,
    /// Display name.
    pub name: String,
}

// ============================================================================
// SECTION: Table Catalog
// ============================================================================

/// Tables exposed through the gateway and the shape proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    /// Todo items.
    Todos,
    /// Labels.
    Labels,
    /// Todo to label junction.
    #[serde(rename = "label_todo")]
    TodoLabels,
}

/// Value domain of a column, used to type-check client filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// 64-bit integer.
    Integer,
    /// Boolean.
    Boolean,
    /// Text, including timestamps.
    Text,
}

/// How a table is scoped to its owning principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerScope {
    /// The table carries the owner column directly.
    Column(&'static str),
    /// Ownership is inherited through a foreign key to a parent table.
    Parent {
        /// Foreign key column on this table.
        column: &'static str,
        /// Parent table holding the owner column.
        parent: Table,
    },
}

impl Table {
    /// All tables in catalog order.
    pub const ALL: [Self; 3] = [Self::Todos, Self::Labels, Self::TodoLabels];

    /// Returns the storage table name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Todos => "todos",
            Self::Labels => "labels",
            Self::TodoLabels => "label_todo",
        }
    }

    /// Resolves a storage table name to a table.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|table| table.as_str() == name)
    }

    /// Returns the route segment used by `/api/shape/{route}`.
    #[must_use]
    pub const fn route(self) -> &'static str {
        match self {
            Self::Todos => "todos",
            Self::Labels => "labels",
            Self::TodoLabels => "todo-labels",
        }
    }

    /// Resolves a shape route segment to a table.
    #[must_use]
    pub fn from_route(route: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|table| table.route() == route)
    }

    /// Columns selectable through a shape subscription.
    #[must_use]
    pub const fn columns(self) -> &'static [&'static str] {
        match self {
            Self::Todos => {
                &["id", "user_id", "title", "description", "completed", "created_at", "updated_at"]
            }
            Self::Labels => &["id", "user_id", "name", "color", "created_at", "updated_at"],
            Self::TodoLabels => &["label_id", "todo_id"],
        }
    }

    /// Returns the value domain of a column, or `None` when it does not exist.
    #[must_use]
    pub fn column_kind(self, column: &str) -> Option<ColumnKind> {
        if !self.has_column(column) {
            return None;
        }
        Some(match column {
            "id" | "user_id" | "label_id" | "todo_id" => ColumnKind::Integer,
            "completed" => ColumnKind::Boolean,
            _ => ColumnKind::Text,
        })
    }

    /// Primary key columns, in key order.
    #[must_use]
    pub const fn key_columns(self) -> &'static [&'static str] {
        match self {
            Self::Todos | Self::Labels => &["id"],
            Self::TodoLabels => &["label_id", "todo_id"],
        }
    }

    /// Returns how rows of this table are scoped to a principal.
    #[must_use]
    pub const fn owner_scope(self) -> OwnerScope {
        match self {
            Self::Todos | Self::Labels => OwnerScope::Column("user_id"),
            Self::TodoLabels => OwnerScope::Parent {
                column: "todo_id",
                parent: Self::Todos,
            },
        }
    }

    /// Returns true when the column identifies the owning tenant.
    #[must_use]
    pub fn is_identity_column(self, column: &str) -> bool {
        match self.owner_scope() {
            OwnerScope::Column(owner) => owner == column,
            OwnerScope::Parent {
                parent, ..
            } => parent.is_identity_column(column),
        }
    }

    /// Returns true when the column exists on this table.
    #[must_use]
    pub fn has_column(self, column: &str) -> bool {
        self.columns().contains(&column)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// SECTION: Rows
// ============================================================================

/// Todo row as persisted and streamed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Todo {
    /// Row identifier.
    pub id: EntityId,
    /// Owning principal.
    pub user_id: PrincipalId,
    /// Title text.
    pub title: String,
    /// Optional description.
    pub description: Option<String>,
    /// Completion flag.
    pub completed: bool,
    /// Creation timestamp (RFC 3339).
    pub created_at: String,
    /// Last update timestamp (RFC 3339).
    pub updated_at: String,
}

/// Label row as persisted and streamed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    /// Row identifier.
    pub id: EntityId,
    /// Owning principal.
    pub user_id: PrincipalId,
    /// Label name.
    pub name: String,
    /// Color token in `#RRGGBB` form.
    pub color: String,
    /// Creation timestamp (RFC 3339).
    pub created_at: String,
    /// Last update timestamp (RFC 3339).
    pub updated_at: String,
}

/// Junction row linking a todo to a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TodoLabel {
    /// Label side of the association.
    pub label_id: EntityId,
    /// Todo side of the association.
    pub todo_id: EntityId,
}

/// Row types addressable by a stable key.
pub trait KeyedRow {
    /// Returns the row key used in the change stream.
    fn row_key(&self) -> RowKey;
}

impl KeyedRow for Todo {
    fn row_key(&self) -> RowKey {
        entity_key(Table::Todos, self.id)
    }
}

impl KeyedRow for Label {
    fn row_key(&self) -> RowKey {
        entity_key(Table::Labels, self.id)
    }
}

impl KeyedRow for TodoLabel {
    fn row_key(&self) -> RowKey {
        RowKey::new(format!(
            "\"public\".\"{}\"/\"{}\"/\"{}\"",
            Table::TodoLabels.as_str(),
            self.label_id,
            self.todo_id
        ))
    }
}

/// Builds the change-stream key for a single-id row.
#[must_use]
pub fn entity_key(table: Table, id: EntityId) -> RowKey {
    RowKey::new(format!("\"public\".\"{}\"/\"{id}\"", table.as_str()))
}

/// Row returned by a committed write or a scoped read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Record {
    /// Todo row.
    Todo(Todo),
    /// Label row.
    Label(Label),
}

impl Record {
    /// Returns the table the record belongs to.
    #[must_use]
    pub const fn table(&self) -> Table {
        match self {
            Self::Todo(_) => Table::Todos,
            Self::Label(_) => Table::Labels,
        }
    }

    /// Returns the row identifier.
    #[must_use]
    pub const fn id(&self) -> EntityId {
        match self {
            Self::Todo(todo) => todo.id,
            Self::Label(label) => label.id,
        }
    }

    /// Returns the owning principal.
    #[must_use]
    pub const fn owner(&self) -> PrincipalId {
        match self {
            Self::Todo(todo) => todo.user_id,
            Self::Label(label) => label.user_id,
        }
    }
}

impl KeyedRow for Record {
    fn row_key(&self) -> RowKey {
        entity_key(self.table(), self.id())
    }
}
