// crates/shapegate-core/src/core/effect.rs
// ============================================================================
// Module: Shapegate Effects
// Description: Validated write effects and the results of committing them.
// Purpose: Describe exactly one logical write handed to the commit sequencer.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! An [`Effect`] only exists after validation has passed. It is always paired
//! with the acting principal in a [`ScopedEffect`]; the sequencer re-checks
//! ownership inside the transaction that applies it.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;

use crate::core::identifiers::CommitId;
use crate::core::identifiers::EntityId;
use crate::core::identifiers::PrincipalId;
use crate::core::model::Record;
use crate::core::model::Table;

// ============================================================================
// SECTION: Drafts and Patches
// ============================================================================

/// Fields for a new todo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TodoDraft {
    /// Title text.
    pub title: String,
    /// Optional description.
    pub description: Option<String>,
    /// Initial completion flag.
    pub completed: bool,
    /// Labels to attach in the same commit.
    pub label_ids: Option<BTreeSet<EntityId>>,
}

/// Partial update for a todo; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TodoPatch {
    /// New title.
    pub title: Option<String>,
    /// New description; `Some(None)` clears it.
    pub description: Option<Option<String>>,
    /// New completion flag.
    pub completed: Option<bool>,
    /// Replacement label set applied in the same commit.
    pub label_ids: Option<BTreeSet<EntityId>>,
}

/// Fields for a new label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelDraft {
    /// Label name.
    pub name: String,
    /// Color token in `#RRGGBB` form.
    pub color: String,
}

/// Partial update for a label.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelPatch {
    /// New name.
    pub name: Option<String>,
    /// New color token.
    pub color: Option<String>,
}

// ============================================================================
// SECTION: Effects
// ============================================================================

/// One logical write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Insert a todo.
    InsertTodo(TodoDraft),
    /// Update a todo.
    UpdateTodo {
        /// Target row.
        id: EntityId,
        /// Fields to change.
        patch: TodoPatch,
    },
    /// Delete a todo and its associations.
    DeleteTodo {
        /// Target row.
        id: EntityId,
    },
    /// Insert a label.
    InsertLabel(LabelDraft),
    /// Update a label.
    UpdateLabel {
        /// Target row.
        id: EntityId,
        /// Fields to change.
        patch: LabelPatch,
    },
    /// Delete a label and its associations.
    DeleteLabel {
        /// Target row.
        id: EntityId,
    },
    /// Replace the full label set of one todo.
    ReplaceTodoLabels {
        /// Todo whose associations are replaced.
        todo_id: EntityId,
        /// Requested label set; ids not owned by the caller are dropped.
        label_ids: BTreeSet<EntityId>,
    },
}

impl Effect {
    /// Returns the table primarily affected by the effect.
    #[must_use]
    pub const fn table(&self) -> Table {
        match self {
            Self::InsertTodo(_)
            | Self::UpdateTodo {
                ..
            }
            | Self::DeleteTodo {
                ..
            } => Table::Todos,
            Self::InsertLabel(_)
            | Self::UpdateLabel {
                ..
            }
            | Self::DeleteLabel {
                ..
            } => Table::Labels,
            Self::ReplaceTodoLabels {
                ..
            } => Table::TodoLabels,
        }
    }

    /// Returns a stable label for logs.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::InsertTodo(_) => "insert_todo",
            Self::UpdateTodo {
                ..
            } => "update_todo",
            Self::DeleteTodo {
                ..
            } => "delete_todo",
            Self::InsertLabel(_) => "insert_label",
            Self::UpdateLabel {
                ..
            } => "update_label",
            Self::DeleteLabel {
                ..
            } => "delete_label",
            Self::ReplaceTodoLabels {
                ..
            } => "replace_todo_labels",
        }
    }
}

/// An effect bound to the principal performing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopedEffect {
    /// Acting principal; every touched row must belong to it.
    pub owner: PrincipalId,
    /// The write to perform.
    pub effect: Effect,
}

// ============================================================================
// SECTION: Commit Results
// ============================================================================

/// State persisted by a committed effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Applied {
    /// A row was inserted or updated.
    Written {
        /// Row as persisted.
        record: Record,
        /// Label set after the commit, when associations were touched.
        label_ids: Option<Vec<EntityId>>,
    },
    /// A row was deleted.
    Deleted {
        /// Table of the deleted row.
        table: Table,
        /// Identifier of the deleted row.
        id: EntityId,
    },
}

/// Result of a committed effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitResult {
    /// Persisted state.
    pub applied: Applied,
    /// Marker of the commit that persisted the effect.
    pub commit_id: CommitId,
}
