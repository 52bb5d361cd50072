// crates/shapegate-client/src/collection.rs
// ============================================================================
// Module: Shape Collection
// Description: Authoritative rows of one shape overlaid by pending mutations.
// Purpose: Reconcile optimistic writes with the ordered change stream.
// Dependencies: shapegate-core, serde_json
// ============================================================================

//! ## Overview
//! A [`ShapeCollection`] holds two layers:
//! - authoritative rows keyed by row key, each with the commit marker that
//!   produced it (deletes leave a tombstone so late entries cannot resurrect
//!   a row);
//! - the optimistic overlay: pending mutations keyed by [`MutationId`], each
//!   with the row edits it shows locally and, once the gateway answered,
//!   the commit marker it waits for. An update keeps only the columns it
//!   sets, so the visible row is rebuilt from the authoritative row plus the
//!   surviving edits in dispatch order and a rollback never strands another
//!   mutation's columns.
//!
//! Merge rules:
//! - last commit wins: an entry older than the row's marker is ignored, so
//!   delivery order never regresses a row and replays are harmless;
//! - an entry for key K with marker c retires the overlay of K for every
//!   pending mutation whose target is at most c;
//! - at `up-to-date`, pending mutations whose target is at most the highest
//!   observed marker retire, as do confirmed mutations whose changes already
//!   equal the authoritative rows (writes that changed nothing in the shape);
//! - at `up-to-date`, tombstones at or below the watermark are pruned; any
//!   later entry for the key carries a newer marker;
//! - `must-refetch` resets the cursor; the authoritative rows are replaced by
//!   the next snapshot, the overlay is kept.
//!
//! The collection is a plain single-writer value. The engine owns it behind a
//! mutex and publishes a [`Snapshot`] after every change.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde_json::Value;
use shapegate_core::ChangeEntry;
use shapegate_core::CommitId;
use shapegate_core::Control;
use shapegate_core::EntityId;
use shapegate_core::KeyedRow;
use shapegate_core::MutationId;
use shapegate_core::Operation;
use shapegate_core::RowKey;
use shapegate_core::ShapeCursor;
use shapegate_core::ShapeMessage;
use shapegate_core::Table;
use shapegate_core::TodoLabel;
use shapegate_core::entity_key;
use shapegate_core::normalize_row;

use crate::transport::MutationReceipt;
use crate::transport::MutationRequest;
use crate::transport::Row;
use crate::transport::ShapeBatch;

/// Edit a pending mutation applies to one visible row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowEdit {
    /// Shows the full row.
    Put(Row),
    /// Sets the given columns on the row visible beneath; no-op when absent.
    Patch(Row),
    /// Hides the row.
    Remove,
}

impl RowEdit {
    /// Applies the edit onto the value visible beneath it.
    fn apply(&self, beneath: Option<Row>) -> Option<Row> {
        match self {
            Self::Put(row) => Some(row.clone()),
            Self::Patch(columns) => beneath.map(|mut row| {
                row.extend(columns.clone());
                row
            }),
            Self::Remove => None,
        }
    }

    /// Returns true when the authoritative value already shows the edit.
    fn observed_in(&self, authoritative: Option<&Row>) -> bool {
        match (self, authoritative) {
            (Self::Put(row), Some(current)) => row == current,
            (Self::Patch(columns), Some(current)) => {
                columns.iter().all(|(column, value)| current.get(column) == Some(value))
            }
            (Self::Remove, None) => true,
            _ => false,
        }
    }
}

/// Row edit shown by a pending mutation.
pub type RowChange = (RowKey, RowEdit);

/// Key under which an insert is shown until the gateway assigns its id.
#[must_use]
pub fn provisional_key(mutation: MutationId) -> RowKey {
    RowKey::new(format!("provisional/{mutation}"))
}

// ============================================================================
// SECTION: Internal State
// ============================================================================

/// Authoritative state of one key.
#[derive(Debug, Clone, PartialEq, Eq)]
struct AuthoritativeRow {
    /// Row value; `None` is a tombstone.
    value: Option<Row>,
    /// Marker of the commit that produced the value, when tagged.
    commit: Option<CommitId>,
}

/// Optimistic mutation waiting for the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingMutation {
    /// Row edits shown locally.
    changes: BTreeMap<RowKey, RowEdit>,
    /// Commit marker returned by the gateway.
    target: Option<CommitId>,
}

// ============================================================================
// SECTION: Snapshot
// ============================================================================

/// Read-only view of a collection at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Table of the shape.
    pub table: Table,
    /// Visible rows.
    rows: BTreeMap<RowKey, Row>,
    /// Pending mutations still overlaid.
    pub pending: usize,
    /// True once the stream reported a consistent prefix.
    pub up_to_date: bool,
    /// Highest commit marker observed in the stream.
    pub watermark: Option<CommitId>,
}

impl Snapshot {
    /// Returns an empty snapshot for a table.
    #[must_use]
    pub const fn empty(table: Table) -> Self {
        Self {
            table,
            rows: BTreeMap::new(),
            pending: 0,
            up_to_date: false,
            watermark: None,
        }
    }

    /// Returns the visible row for a key.
    #[must_use]
    pub fn get(&self, key: &RowKey) -> Option<&Row> {
        self.rows.get(key)
    }

    /// Returns the visible row for an entity id of this table.
    #[must_use]
    pub fn entity(&self, id: EntityId) -> Option<&Row> {
        self.rows.get(&entity_key(self.table, id))
    }

    /// Iterates visible rows in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&RowKey, &Row)> {
        self.rows.iter()
    }

    /// Number of visible rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true when no row is visible.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

// ============================================================================
// SECTION: Batch Outcome
// ============================================================================

/// Summary of one applied batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Change entries applied.
    pub applied: usize,
    /// Change entries ignored as older than the stored row.
    pub ignored: usize,
    /// Pending mutations retired.
    pub retired: usize,
    /// Batch ended on a consistent prefix.
    pub up_to_date: bool,
    /// Source asked for a full refetch.
    pub must_refetch: bool,
}

// ============================================================================
// SECTION: Collection
// ============================================================================

/// Materialized shape with its optimistic overlay.
#[derive(Debug, Clone)]
pub struct ShapeCollection {
    /// Table of the shape.
    table: Table,
    /// Authoritative rows and unpruned tombstones.
    rows: BTreeMap<RowKey, AuthoritativeRow>,
    /// Pending mutations in dispatch order.
    overlay: BTreeMap<MutationId, PendingMutation>,
    /// Highest commit marker observed.
    watermark: Option<CommitId>,
    /// Resume position; advanced only after a batch is applied.
    cursor: ShapeCursor,
    /// Authoritative rows are replaced by the next snapshot.
    refetch_pending: bool,
    /// Last batch ended on `up-to-date`.
    up_to_date: bool,
}

impl ShapeCollection {
    /// Creates an empty collection starting at the initial cursor.
    #[must_use]
    pub fn new(table: Table) -> Self {
        Self {
            table,
            rows: BTreeMap::new(),
            overlay: BTreeMap::new(),
            watermark: None,
            cursor: ShapeCursor::initial(),
            refetch_pending: false,
            up_to_date: false,
        }
    }

    /// Table of the shape.
    #[must_use]
    pub const fn table(&self) -> Table {
        self.table
    }

    /// Cursor to resume the subscription from.
    #[must_use]
    pub const fn cursor(&self) -> &ShapeCursor {
        &self.cursor
    }

    /// Highest commit marker observed in the stream.
    #[must_use]
    pub const fn watermark(&self) -> Option<CommitId> {
        self.watermark
    }

    /// Returns true while the mutation is overlaid.
    #[must_use]
    pub fn is_pending(&self, mutation: MutationId) -> bool {
        self.overlay.contains_key(&mutation)
    }

    /// Number of overlaid mutations.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.overlay.len()
    }

    // ------------------------------------------------------------------------
    // Stream side
    // ------------------------------------------------------------------------

    /// Applies one polled batch, then advances the cursor.
    pub fn apply_batch(&mut self, batch: ShapeBatch) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for message in batch.messages {
            match message {
                ShapeMessage::Change(entry) => {
                    self.take_refetch();
                    self.up_to_date = false;
                    let (applied, retired) = self.apply_change(entry);
                    if applied {
                        outcome.applied += 1;
                    } else {
                        outcome.ignored += 1;
                    }
                    outcome.retired += retired;
                }
                ShapeMessage::Control {
                    headers,
                } => match headers.control {
                    Control::UpToDate => {
                        self.take_refetch();
                        self.up_to_date = true;
                        outcome.up_to_date = true;
                        outcome.retired += self.retire_observed();
                        self.prune_tombstones();
                    }
                    Control::MustRefetch => {
                        self.refetch_pending = true;
                        self.up_to_date = false;
                        outcome.must_refetch = true;
                    }
                    Control::SnapshotEnd => {}
                },
            }
        }
        self.cursor = if outcome.must_refetch { ShapeCursor::initial() } else { batch.next };
        outcome
    }

    /// Drops authoritative rows once a refetched snapshot starts arriving.
    fn take_refetch(&mut self) {
        if self.refetch_pending {
            self.rows.clear();
            self.refetch_pending = false;
        }
    }

    /// Merges one entry; returns whether it applied and how many mutations
    /// it retired.
    fn apply_change(&mut self, entry: ChangeEntry) -> (bool, usize) {
        let commit = entry.commit_id();
        if commit > self.watermark {
            self.watermark = commit;
        }
        let existing = self.rows.get(&entry.key);
        if let Some(seen) = existing.and_then(|row| row.commit) {
            match commit {
                Some(commit) if commit >= seen => {}
                _ => return (false, 0),
            }
        }
        let value = normalize_row(self.table, entry.value);
        let value = match entry.headers.operation {
            Operation::Insert => Some(value),
            Operation::Update => {
                let mut merged = existing.and_then(|row| row.value.clone()).unwrap_or_default();
                merged.extend(value);
                Some(merged)
            }
            Operation::Delete => None,
        };
        let key = entry.key;
        self.rows.insert(
            key.clone(),
            AuthoritativeRow {
                value,
                commit,
            },
        );
        let retired = commit.map_or(0, |commit| self.retire_key(&key, commit));
        (true, retired)
    }

    /// Removes the overlay of `key` from mutations confirmed at or before `commit`.
    fn retire_key(&mut self, key: &RowKey, commit: CommitId) -> usize {
        let before = self.overlay.len();
        self.overlay.retain(|_, pending| {
            if pending.target.is_some_and(|target| target <= commit) {
                pending.changes.remove(key);
            }
            !pending.changes.is_empty()
        });
        before - self.overlay.len()
    }

    /// Retires mutations the stream has caught up with.
    fn retire_observed(&mut self) -> usize {
        let watermark = self.watermark;
        let rows = &self.rows;
        let before = self.overlay.len();
        self.overlay.retain(|_, pending| {
            let Some(target) = pending.target else {
                return true;
            };
            if watermark.is_some_and(|observed| target <= observed) {
                return false;
            }
            !pending
                .changes
                .iter()
                .all(|(key, edit)| edit.observed_in(rows.get(key).and_then(|row| row.value.as_ref())))
        });
        before - self.overlay.len()
    }

    /// Drops tombstones at or below the watermark.
    fn prune_tombstones(&mut self) {
        let watermark = self.watermark;
        self.rows.retain(|_, row| row.value.is_some() || row.commit.is_some_and(|commit| Some(commit) > watermark));
    }

    // ------------------------------------------------------------------------
    // Mutation side
    // ------------------------------------------------------------------------

    /// Row changes to show while `request` is in flight.
    #[must_use]
    pub fn optimistic_changes(&self, mutation: MutationId, request: &MutationRequest) -> Vec<RowChange> {
        match request {
            MutationRequest::Create(intent) if intent.table() == self.table => {
                let mut row = intent.columns();
                row.insert("id".to_string(), Value::Null);
                if self.table == Table::Todos {
                    row.entry("description").or_insert(Value::Null);
                    row.entry("completed").or_insert(Value::Bool(false));
                }
                vec![(provisional_key(mutation), RowEdit::Put(row))]
            }
            MutationRequest::Update {
                id,
                intent,
            } if intent.table() == self.table => {
                let key = entity_key(self.table, *id);
                if self.visible(&key, None).is_some() {
                    vec![(key, RowEdit::Patch(intent.columns()))]
                } else {
                    Vec::new()
                }
            }
            MutationRequest::Delete {
                table,
                id,
            } if *table == self.table => {
                let key = entity_key(self.table, *id);
                if self.visible(&key, None).is_some() { vec![(key, RowEdit::Remove)] } else { Vec::new() }
            }
            MutationRequest::ReplaceLabels {
                todo_id,
                label_ids,
            } if self.table == Table::TodoLabels => self.association_changes(*todo_id, label_ids, None),
            _ => Vec::new(),
        }
    }

    /// Row changes implied by the gateway's answer, replacing the optimistic
    /// guess; `None` keeps the guess.
    #[must_use]
    pub fn confirmed_changes(
        &self,
        mutation: MutationId,
        request: &MutationRequest,
        receipt: &MutationReceipt,
    ) -> Option<Vec<RowChange>> {
        match request {
            MutationRequest::Create(intent)
            | MutationRequest::Update {
                intent, ..
            } if intent.table() == self.table => {
                let row = normalize_row(self.table, receipt.row.clone()?);
                let id = row.get("id").and_then(Value::as_u64)?;
                Some(vec![(entity_key(self.table, EntityId::new(id)), RowEdit::Put(row))])
            }
            MutationRequest::ReplaceLabels {
                todo_id, ..
            } if self.table == Table::TodoLabels => receipt
                .label_ids
                .as_ref()
                .map(|applied| self.association_changes(*todo_id, applied, Some(mutation))),
            _ => None,
        }
    }

    /// Overlays a mutation; empty change sets are not tracked.
    pub fn begin(&mut self, mutation: MutationId, changes: Vec<RowChange>) {
        if changes.is_empty() {
            return;
        }
        self.overlay.insert(
            mutation,
            PendingMutation {
                changes: changes.into_iter().collect(),
                target: None,
            },
        );
    }

    /// Records the commit marker a mutation waits for; returns true when the
    /// stream had already delivered it and the mutation retired at once.
    pub fn confirm(
        &mut self,
        mutation: MutationId,
        commit: CommitId,
        changes: Option<Vec<RowChange>>,
    ) -> bool {
        let Some(pending) = self.overlay.get_mut(&mutation) else {
            return false;
        };
        if let Some(changes) = changes {
            pending.changes = changes.into_iter().collect();
        }
        pending.target = Some(commit);
        let rows = &self.rows;
        pending
            .changes
            .retain(|key, _| !rows.get(key).and_then(|row| row.commit).is_some_and(|seen| seen >= commit));
        let caught_up = self.up_to_date && self.watermark.is_some_and(|observed| commit <= observed);
        if pending.changes.is_empty() || caught_up {
            self.overlay.remove(&mutation);
            return true;
        }
        false
    }

    /// Removes a failed mutation from the overlay.
    pub fn rollback(&mut self, mutation: MutationId) -> bool {
        self.overlay.remove(&mutation).is_some()
    }

    // ------------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------------

    /// Builds the visible view.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            table: self.table,
            rows: self.visible_rows(None),
            pending: self.overlay.len(),
            up_to_date: self.up_to_date,
            watermark: self.watermark,
        }
    }

    /// Authoritative rows overlaid by pending changes in dispatch order.
    fn visible_rows(&self, exclude: Option<MutationId>) -> BTreeMap<RowKey, Row> {
        let mut rows: BTreeMap<RowKey, Row> = self
            .rows
            .iter()
            .filter_map(|(key, row)| row.value.clone().map(|value| (key.clone(), value)))
            .collect();
        for (mutation, pending) in &self.overlay {
            if Some(*mutation) == exclude {
                continue;
            }
            for (key, edit) in &pending.changes {
                if let Some(row) = edit.apply(rows.remove(key)) {
                    rows.insert(key.clone(), row);
                }
            }
        }
        rows
    }

    /// Visible value of one key.
    fn visible(&self, key: &RowKey, exclude: Option<MutationId>) -> Option<Row> {
        let base = self.rows.get(key).and_then(|row| row.value.clone());
        self.overlay
            .iter()
            .filter(|(mutation, _)| Some(**mutation) != exclude)
            .filter_map(|(_, pending)| pending.changes.get(key))
            .fold(base, |beneath, edit| edit.apply(beneath))
    }

    /// Junction changes that make the todo's visible label set equal `label_ids`.
    fn association_changes(
        &self,
        todo_id: EntityId,
        label_ids: &[EntityId],
        exclude: Option<MutationId>,
    ) -> Vec<RowChange> {
        let wanted: BTreeSet<EntityId> = label_ids.iter().copied().collect();
        let visible = self.visible_rows(exclude);
        let mut changes: Vec<RowChange> = visible
            .iter()
            .filter(|(_, row)| column_id(row, "todo_id") == Some(todo_id))
            .filter(|(_, row)| column_id(row, "label_id").is_none_or(|label| !wanted.contains(&label)))
            .map(|(key, _)| (key.clone(), RowEdit::Remove))
            .collect();
        for label_id in wanted {
            let link = TodoLabel {
                label_id,
                todo_id,
            };
            let key = link.row_key();
            if !visible.contains_key(&key) {
                let mut row = Row::new();
                row.insert("label_id".to_string(), Value::from(label_id.get()));
                row.insert("todo_id".to_string(), Value::from(todo_id.get()));
                changes.push((key, RowEdit::Put(row)));
            }
        }
        changes
    }
}

/// Reads an integer id column.
fn column_id(row: &Row, column: &str) -> Option<EntityId> {
    row.get(column).and_then(Value::as_u64).map(EntityId::new)
}

#[cfg(test)]
mod tests;
