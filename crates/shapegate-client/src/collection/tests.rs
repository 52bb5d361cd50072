// crates/shapegate-client/src/collection/tests.rs
// ============================================================================
// Module: Shape Collection Tests
// Description: Reconciliation tests for the optimistic overlay and merges.
// Purpose: Pin convergence, ordering, resume, and rollback behavior.
// Dependencies: shapegate-client, shapegate-core, proptest
// ============================================================================

// ============================================================================
// SECTION: Lint Configuration
// ============================================================================

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Test-only assertions."
)]

// ============================================================================
// SECTION: Imports
// ============================================================================

use proptest::prelude::*;
use serde_json::Value;
use serde_json::json;
use shapegate_core::ChangeEntry;
use shapegate_core::ChangeHeaders;
use shapegate_core::CommitId;
use shapegate_core::Control;
use shapegate_core::ControlHeaders;
use shapegate_core::EntityId;
use shapegate_core::KeyedRow;
use shapegate_core::LabelIntent;
use shapegate_core::MutationId;
use shapegate_core::Operation;
use shapegate_core::RowKey;
use shapegate_core::ShapeCursor;
use shapegate_core::ShapeMessage;
use shapegate_core::Table;
use shapegate_core::TodoIntent;
use shapegate_core::TodoLabel;
use shapegate_core::entity_key;

use super::ShapeCollection;
use super::provisional_key;
use crate::transport::MutationReceipt;
use crate::transport::MutationRequest;
use crate::transport::Row;
use crate::transport::RowIntent;
use crate::transport::ShapeBatch;

// ============================================================================
// SECTION: Fixtures
// ============================================================================

fn object(value: Value) -> Row {
    value.as_object().cloned().unwrap()
}

fn todo(id: u64, title: &str, completed: bool) -> Row {
    object(json!({
        "id": id,
        "user_id": 7,
        "title": title,
        "description": null,
        "completed": completed,
        "created_at": "2026-03-01T10:00:00Z",
        "updated_at": "2026-03-01T10:00:00Z",
    }))
}

fn change(key: RowKey, operation: Operation, commit: Option<u64>, value: Row) -> ShapeMessage {
    ShapeMessage::Change(ChangeEntry {
        key,
        value,
        headers: ChangeHeaders {
            operation,
            txids: commit.map(CommitId::new).into_iter().collect(),
            relation: None,
        },
    })
}

fn control(control: Control) -> ShapeMessage {
    ShapeMessage::Control {
        headers: ControlHeaders {
            control,
        },
    }
}

fn batch(messages: Vec<ShapeMessage>, offset: &str) -> ShapeBatch {
    ShapeBatch {
        messages,
        next: ShapeCursor {
            offset: offset.to_string(),
            handle: Some("h-1".to_string()),
            cursor: None,
            live: false,
        },
    }
}

fn todo_key(id: u64) -> RowKey {
    entity_key(Table::Todos, EntityId::new(id))
}

fn link_key(label_id: u64, todo_id: u64) -> RowKey {
    TodoLabel {
        label_id: EntityId::new(label_id),
        todo_id: EntityId::new(todo_id),
    }
    .row_key()
}

fn link(label_id: u64, todo_id: u64) -> Row {
    object(json!({ "label_id": label_id, "todo_id": todo_id }))
}

/// Runs the optimistic half of a mutation.
fn overlay(collection: &mut ShapeCollection, mutation: u64, request: &MutationRequest) -> MutationId {
    let mutation = MutationId::new(mutation);
    let changes = collection.optimistic_changes(mutation, request);
    collection.begin(mutation, changes);
    mutation
}

/// Runs the confirmation half of a mutation.
fn confirm(
    collection: &mut ShapeCollection,
    mutation: MutationId,
    request: &MutationRequest,
    receipt: &MutationReceipt,
) -> bool {
    let changes = collection.confirmed_changes(mutation, request, receipt);
    collection.confirm(mutation, receipt.commit_id, changes)
}

fn seeded_todos(rows: &[(u64, &str, bool, u64)]) -> ShapeCollection {
    let mut collection = ShapeCollection::new(Table::Todos);
    let mut messages: Vec<ShapeMessage> = rows
        .iter()
        .map(|(id, title, completed, commit)| {
            change(todo_key(*id), Operation::Insert, Some(*commit), todo(*id, title, *completed))
        })
        .collect();
    messages.push(control(Control::UpToDate));
    collection.apply_batch(batch(messages, "0_1"));
    collection
}

// ============================================================================
// SECTION: Convergence
// ============================================================================

#[test]
fn created_row_is_visible_before_and_identical_after_the_stream() {
    let mut collection = ShapeCollection::new(Table::Todos);
    let request = MutationRequest::Create(RowIntent::Todo(TodoIntent {
        title: Some("Write spec".to_string()),
        ..TodoIntent::default()
    }));
    let mutation = overlay(&mut collection, 1, &request);
    let optimistic = collection.snapshot();
    let provisional = optimistic.get(&provisional_key(mutation)).unwrap();
    assert_eq!(provisional["title"], "Write spec");
    assert_eq!(provisional["completed"], false);

    let authoritative = todo(42, "Write spec", false);
    let receipt = MutationReceipt {
        commit_id: CommitId::new(1001),
        row: Some(authoritative.clone()),
        label_ids: None,
    };
    assert!(!confirm(&mut collection, mutation, &request, &receipt));
    let confirmed = collection.snapshot();
    assert_eq!(confirmed.entity(EntityId::new(42)), Some(&authoritative));
    assert!(confirmed.get(&provisional_key(mutation)).is_none());
    assert_eq!(confirmed.pending, 1);

    let text_encoded = object(json!({
        "id": "42",
        "user_id": "7",
        "title": "Write spec",
        "description": null,
        "completed": "false",
        "created_at": "2026-03-01T10:00:00Z",
        "updated_at": "2026-03-01T10:00:00Z",
    }));
    let outcome = collection.apply_batch(batch(
        vec![change(todo_key(42), Operation::Insert, Some(1001), text_encoded), control(Control::UpToDate)],
        "0_2",
    ));
    assert_eq!(outcome.retired, 1);
    let converged = collection.snapshot();
    assert!(!collection.is_pending(mutation));
    assert_eq!(converged.pending, 0);
    assert_eq!(converged.len(), 1);
    assert_eq!(
        serde_json::to_vec(converged.entity(EntityId::new(42)).unwrap()).unwrap(),
        serde_json::to_vec(&authoritative).unwrap()
    );
}

#[test]
fn row_leaving_the_filter_disappears_once_its_commit_is_observed() {
    let mut collection = seeded_todos(&[(5, "Buy milk", false, 10)]);
    let request = MutationRequest::Update {
        id: EntityId::new(5),
        intent: RowIntent::Todo(TodoIntent {
            completed: Some(true),
            ..TodoIntent::default()
        }),
    };
    let mutation = overlay(&mut collection, 1, &request);
    assert_eq!(collection.snapshot().entity(EntityId::new(5)).unwrap()["completed"], true);

    let receipt = MutationReceipt {
        commit_id: CommitId::new(11),
        row: Some(todo(5, "Buy milk", true)),
        label_ids: None,
    };
    confirm(&mut collection, mutation, &request, &receipt);
    assert!(collection.snapshot().entity(EntityId::new(5)).is_some());

    collection.apply_batch(batch(
        vec![
            change(todo_key(5), Operation::Delete, Some(11), object(json!({ "id": 5 }))),
            control(Control::UpToDate),
        ],
        "0_3",
    ));
    let snapshot = collection.snapshot();
    assert!(snapshot.entity(EntityId::new(5)).is_none());
    assert_eq!(snapshot.pending, 0);
}

#[test]
fn stream_arriving_before_the_gateway_answer_retires_on_confirm() {
    let mut collection = seeded_todos(&[(5, "Draft", false, 10)]);
    let request = MutationRequest::Update {
        id: EntityId::new(5),
        intent: RowIntent::Todo(TodoIntent {
            title: Some("Final".to_string()),
            ..TodoIntent::default()
        }),
    };
    let mutation = overlay(&mut collection, 1, &request);
    collection.apply_batch(batch(
        vec![change(todo_key(5), Operation::Update, Some(12), todo(5, "Final", false)), control(Control::UpToDate)],
        "0_4",
    ));
    assert!(collection.is_pending(mutation));
    let receipt = MutationReceipt {
        commit_id: CommitId::new(12),
        row: Some(todo(5, "Final", false)),
        label_ids: None,
    };
    assert!(confirm(&mut collection, mutation, &request, &receipt));
    assert_eq!(collection.snapshot().entity(EntityId::new(5)).unwrap()["title"], "Final");
}

#[test]
fn up_to_date_retires_writes_the_shape_never_shows() {
    let mut collection = seeded_todos(&[(3, "Old", false, 5)]);
    let request = MutationRequest::Update {
        id: EntityId::new(3),
        intent: RowIntent::Todo(TodoIntent {
            title: Some("New".to_string()),
            ..TodoIntent::default()
        }),
    };
    let mutation = overlay(&mut collection, 1, &request);
    let receipt = MutationReceipt {
        commit_id: CommitId::new(20),
        row: Some(todo(3, "New", false)),
        label_ids: None,
    };
    confirm(&mut collection, mutation, &request, &receipt);
    collection.apply_batch(batch(
        vec![change(todo_key(8), Operation::Insert, Some(25), todo(8, "Other", false))],
        "0_5",
    ));
    assert!(collection.is_pending(mutation), "retirement waits for up-to-date");
    collection.apply_batch(batch(vec![control(Control::UpToDate)], "0_5"));
    assert!(!collection.is_pending(mutation));
}

// ============================================================================
// SECTION: Ordering and Resume
// ============================================================================

#[test]
fn older_entry_never_regresses_a_row() {
    let mut collection = seeded_todos(&[(5, "v1", false, 10)]);
    let outcome = collection.apply_batch(batch(
        vec![
            change(todo_key(5), Operation::Update, Some(12), todo(5, "v3", false)),
            change(todo_key(5), Operation::Update, Some(11), todo(5, "v2", false)),
        ],
        "0_6",
    ));
    assert_eq!(outcome.applied, 1);
    assert_eq!(outcome.ignored, 1);
    assert_eq!(collection.snapshot().entity(EntityId::new(5)).unwrap()["title"], "v3");
}

#[test]
fn tombstone_blocks_late_insert() {
    let mut collection = seeded_todos(&[(5, "v1", false, 10)]);
    collection.apply_batch(batch(
        vec![
            change(todo_key(5), Operation::Delete, Some(14), object(json!({ "id": 5 }))),
            change(todo_key(5), Operation::Insert, Some(10), todo(5, "v1", false)),
        ],
        "0_7",
    ));
    assert!(collection.snapshot().is_empty());
}

#[test]
fn replaying_from_an_earlier_cursor_is_idempotent() {
    let first = batch(
        vec![
            change(todo_key(1), Operation::Insert, Some(1), todo(1, "a", false)),
            change(todo_key(2), Operation::Insert, Some(2), todo(2, "b", false)),
            control(Control::UpToDate),
        ],
        "0_2",
    );
    let second = batch(
        vec![
            change(todo_key(1), Operation::Update, Some(3), todo(1, "a2", true)),
            change(todo_key(2), Operation::Delete, Some(4), object(json!({ "id": 2 }))),
            control(Control::UpToDate),
        ],
        "0_4",
    );

    let mut uninterrupted = ShapeCollection::new(Table::Todos);
    uninterrupted.apply_batch(first.clone());
    uninterrupted.apply_batch(second.clone());

    let mut resumed = ShapeCollection::new(Table::Todos);
    resumed.apply_batch(first.clone());
    resumed.apply_batch(first);
    resumed.apply_batch(second.clone());
    resumed.apply_batch(second);

    assert_eq!(resumed.snapshot(), uninterrupted.snapshot());
    assert_eq!(resumed.cursor().offset, "0_4");
}

#[test]
fn cursor_advances_only_through_applied_batches() {
    let mut collection = ShapeCollection::new(Table::Todos);
    assert!(collection.cursor().is_initial());
    collection.apply_batch(batch(vec![control(Control::UpToDate)], "0_9"));
    assert_eq!(collection.cursor().offset, "0_9");
    assert_eq!(collection.cursor().handle.as_deref(), Some("h-1"));
}

#[test]
fn must_refetch_keeps_rows_until_the_new_snapshot_arrives() {
    let mut collection = seeded_todos(&[(1, "kept", false, 1)]);
    let request = MutationRequest::Create(RowIntent::Todo(TodoIntent {
        title: Some("in flight".to_string()),
        ..TodoIntent::default()
    }));
    let mutation = overlay(&mut collection, 1, &request);

    let outcome = collection.apply_batch(batch(vec![control(Control::MustRefetch)], "ignored"));
    assert!(outcome.must_refetch);
    assert!(collection.cursor().is_initial());
    let paused = collection.snapshot();
    assert!(paused.entity(EntityId::new(1)).is_some());
    assert!(!paused.up_to_date);

    collection.apply_batch(batch(
        vec![change(todo_key(2), Operation::Insert, None, todo(2, "fresh", false)), control(Control::UpToDate)],
        "0_1",
    ));
    let refetched = collection.snapshot();
    assert!(refetched.entity(EntityId::new(1)).is_none());
    assert!(refetched.entity(EntityId::new(2)).is_some());
    assert!(collection.is_pending(mutation));
    assert!(refetched.get(&provisional_key(mutation)).is_some());
}

// ============================================================================
// SECTION: Rollback and Associations
// ============================================================================

#[test]
fn rollback_restores_the_previous_view() {
    let mut collection = seeded_todos(&[(5, "Keep me", false, 10)]);
    let before = collection.snapshot();
    let request = MutationRequest::Delete {
        table: Table::Todos,
        id: EntityId::new(5),
    };
    let mutation = overlay(&mut collection, 1, &request);
    assert!(collection.snapshot().is_empty());
    assert!(collection.rollback(mutation));
    assert_eq!(collection.snapshot(), before);
}

#[test]
fn rolling_back_an_earlier_update_keeps_only_later_columns() {
    let mut collection = seeded_todos(&[(1, "A", false, 10)]);
    let rename = overlay(
        &mut collection,
        1,
        &MutationRequest::Update {
            id: EntityId::new(1),
            intent: RowIntent::Todo(TodoIntent {
                title: Some("B".to_string()),
                ..TodoIntent::default()
            }),
        },
    );
    overlay(
        &mut collection,
        2,
        &MutationRequest::Update {
            id: EntityId::new(1),
            intent: RowIntent::Todo(TodoIntent {
                completed: Some(true),
                ..TodoIntent::default()
            }),
        },
    );
    let stacked = collection.snapshot();
    assert_eq!(stacked.entity(EntityId::new(1)).unwrap()["title"], "B");
    assert_eq!(stacked.entity(EntityId::new(1)).unwrap()["completed"], true);

    assert!(collection.rollback(rename));
    let after = collection.snapshot();
    let row = after.entity(EntityId::new(1)).unwrap();
    assert_eq!(row["title"], "A");
    assert_eq!(row["completed"], true);
    assert_eq!(after.pending, 1);
}

#[test]
fn update_over_a_row_deleted_underneath_stays_hidden() {
    let mut collection = seeded_todos(&[(1, "A", false, 10)]);
    let mutation = overlay(
        &mut collection,
        1,
        &MutationRequest::Update {
            id: EntityId::new(1),
            intent: RowIntent::Todo(TodoIntent {
                completed: Some(true),
                ..TodoIntent::default()
            }),
        },
    );
    collection.apply_batch(batch(
        vec![change(todo_key(1), Operation::Delete, Some(11), object(json!({ "id": 1 })))],
        "0_2",
    ));
    assert!(collection.is_pending(mutation));
    assert!(collection.snapshot().entity(EntityId::new(1)).is_none());
}

#[test]
fn up_to_date_prunes_tombstones_the_watermark_passed() {
    let mut collection = seeded_todos(&[(1, "a", false, 10), (2, "b", false, 11)]);
    collection.apply_batch(batch(
        vec![change(todo_key(1), Operation::Delete, Some(12), object(json!({ "id": 1 })))],
        "0_2",
    ));
    assert_eq!(collection.rows.len(), 2, "tombstone kept until up-to-date");
    collection.apply_batch(batch(vec![control(Control::UpToDate)], "0_2"));
    assert_eq!(collection.rows.len(), 1);
    assert!(!collection.rows.contains_key(&todo_key(1)));
    assert_eq!(collection.snapshot().len(), 1);
}

#[test]
fn intents_for_other_tables_do_not_overlay() {
    let mut collection = seeded_todos(&[(5, "Todo", false, 10)]);
    let request = MutationRequest::Create(RowIntent::Label(LabelIntent {
        name: Some("home".to_string()),
        color: Some("#336699".to_string()),
    }));
    let mutation = overlay(&mut collection, 1, &request);
    assert!(!collection.is_pending(mutation));
    assert_eq!(collection.snapshot().len(), 1);
}

#[test]
fn replaced_label_set_converges_without_foreign_ids() {
    let mut collection = ShapeCollection::new(Table::TodoLabels);
    collection.apply_batch(batch(
        vec![
            change(link_key(1, 9), Operation::Insert, Some(3), link(1, 9)),
            change(link_key(5, 9), Operation::Insert, Some(3), link(5, 9)),
            control(Control::UpToDate),
        ],
        "0_1",
    ));
    let request = MutationRequest::ReplaceLabels {
        todo_id: EntityId::new(9),
        label_ids: vec![EntityId::new(1), EntityId::new(2), EntityId::new(4)],
    };
    let mutation = overlay(&mut collection, 1, &request);
    let keys: Vec<RowKey> = collection.snapshot().iter().map(|(key, _)| key.clone()).collect();
    assert_eq!(keys.len(), 3);
    assert!(keys.contains(&link_key(4, 9)));
    assert!(!keys.contains(&link_key(5, 9)));

    let receipt = MutationReceipt {
        commit_id: CommitId::new(40),
        row: None,
        label_ids: Some(vec![EntityId::new(1), EntityId::new(2)]),
    };
    confirm(&mut collection, mutation, &request, &receipt);
    let confirmed = collection.snapshot();
    assert_eq!(confirmed.len(), 2);
    assert!(confirmed.get(&link_key(4, 9)).is_none());

    collection.apply_batch(batch(
        vec![
            change(link_key(5, 9), Operation::Delete, Some(40), link(5, 9)),
            change(link_key(2, 9), Operation::Insert, Some(40), link(2, 9)),
            control(Control::UpToDate),
        ],
        "0_2",
    ));
    let converged = collection.snapshot();
    assert_eq!(converged.pending, 0);
    assert_eq!(converged, {
        let mut expected = ShapeCollection::new(Table::TodoLabels);
        expected.apply_batch(batch(
            vec![
                change(link_key(1, 9), Operation::Insert, Some(3), link(1, 9)),
                change(link_key(2, 9), Operation::Insert, Some(40), link(2, 9)),
                control(Control::UpToDate),
            ],
            "0_2",
        ));
        expected.snapshot()
    });
}

#[test]
fn untagged_snapshot_matching_the_write_retires_it() {
    let mut collection = ShapeCollection::new(Table::TodoLabels);
    let request = MutationRequest::ReplaceLabels {
        todo_id: EntityId::new(9),
        label_ids: vec![EntityId::new(2)],
    };
    let mutation = overlay(&mut collection, 1, &request);
    let receipt = MutationReceipt {
        commit_id: CommitId::new(70),
        row: None,
        label_ids: Some(vec![EntityId::new(2)]),
    };
    confirm(&mut collection, mutation, &request, &receipt);
    collection.apply_batch(batch(
        vec![change(link_key(2, 9), Operation::Insert, None, link(2, 9)), control(Control::UpToDate)],
        "0_1",
    ));
    assert!(!collection.is_pending(mutation));
    assert_eq!(collection.snapshot().len(), 1);
}

// ============================================================================
// SECTION: Properties
// ============================================================================

proptest! {
    #[test]
    fn final_row_is_the_highest_commit_regardless_of_delivery_order(
        order in Just((1_u64..=8).collect::<Vec<_>>()).prop_shuffle(),
        split in 0_usize..8,
    ) {
        let messages: Vec<ShapeMessage> = order
            .iter()
            .map(|commit| {
                let operation = if *commit == 1 { Operation::Insert } else { Operation::Update };
                change(todo_key(5), operation, Some(*commit), todo(5, &format!("v{commit}"), commit % 2 == 0))
            })
            .collect();
        let (head, tail) = messages.split_at(split.min(messages.len()));
        let mut collection = ShapeCollection::new(Table::Todos);
        collection.apply_batch(batch(head.to_vec(), "0_1"));
        collection.apply_batch(batch(tail.to_vec(), "0_2"));
        let snapshot = collection.snapshot();
        prop_assert_eq!(snapshot.entity(EntityId::new(5)), Some(&todo(5, "v8", true)));
        prop_assert_eq!(snapshot.watermark, Some(CommitId::new(8)));
    }

    #[test]
    fn confirmed_write_converges_whatever_the_interleaving(stream_first in any::<bool>()) {
        let mut collection = seeded_todos(&[(5, "before", false, 10)]);
        let request = MutationRequest::Update {
            id: EntityId::new(5),
            intent: RowIntent::Todo(TodoIntent {
                title: Some("after".to_string()),
                ..TodoIntent::default()
            }),
        };
        let mutation = overlay(&mut collection, 1, &request);
        let receipt = MutationReceipt {
            commit_id: CommitId::new(11),
            row: Some(todo(5, "after", false)),
            label_ids: None,
        };
        let stream = batch(
            vec![change(todo_key(5), Operation::Update, Some(11), todo(5, "after", false)), control(Control::UpToDate)],
            "0_2",
        );
        if stream_first {
            collection.apply_batch(stream);
            confirm(&mut collection, mutation, &request, &receipt);
        } else {
            confirm(&mut collection, mutation, &request, &receipt);
            collection.apply_batch(stream);
        }
        let snapshot = collection.snapshot();
        prop_assert_eq!(snapshot.pending, 0);
        prop_assert_eq!(snapshot.entity(EntityId::new(5)), Some(&todo(5, "after", false)));
    }
}
