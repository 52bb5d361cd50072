// crates/shapegate-store-sqlite/tests/sqlite_sequencer.rs
// ============================================================================
// Module: SQLite Sequencer Tests
// Description: Validate SQLite CommitSequencer behavior.
// Purpose: Ensure ordered commit markers, ownership checks, and atomic logs.
// Dependencies: shapegate-store-sqlite, shapegate-core, rusqlite, tempfile, proptest
// ============================================================================

//! ## Overview
//! Conformance tests for the SQLite-backed commit sequencer. Exercises
//! durability, tenant isolation, association replacement, and contention.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only assertions and helpers are permitted."
)]

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use proptest::prelude::*;
use rusqlite::Connection;
use serde_json::Value;
use shapegate_core::Applied;
use shapegate_core::CommitError;
use shapegate_core::CommitSequencer;
use shapegate_core::Effect;
use shapegate_core::EntityId;
use shapegate_core::LabelDraft;
use shapegate_core::Operation;
use shapegate_core::PrincipalId;
use shapegate_core::Record;
use shapegate_core::ScopedEffect;
use shapegate_core::Table;
use shapegate_core::TodoDraft;
use shapegate_core::TodoPatch;
use shapegate_store_sqlite::SqliteCommitSequencer;
use shapegate_store_sqlite::SqliteStoreConfig;
use shapegate_store_sqlite::SqliteStoreError;
use tempfile::TempDir;

// ============================================================================
// SECTION: Helpers
// ============================================================================

fn open(dir: &TempDir) -> SqliteCommitSequencer {
    SqliteCommitSequencer::new(&SqliteStoreConfig::at(dir.path().join("store.db"))).unwrap()
}

fn principal(id: u64) -> PrincipalId {
    PrincipalId::from_raw(id).unwrap()
}

fn scoped(owner: u64, effect: Effect) -> ScopedEffect {
    ScopedEffect {
        owner: principal(owner),
        effect,
    }
}

fn todo_draft(title: &str) -> Effect {
    Effect::InsertTodo(TodoDraft {
        title: title.to_string(),
        description: None,
        completed: false,
        label_ids: None,
    })
}

fn written_id(applied: &Applied) -> EntityId {
    match applied {
        Applied::Written {
            record, ..
        } => record.id(),
        Applied::Deleted {
            ..
        } => panic!("expected written"),
    }
}

fn create_label(store: &SqliteCommitSequencer, owner: u64, name: &str) -> EntityId {
    let result = store
        .commit(&scoped(
            owner,
            Effect::InsertLabel(LabelDraft {
                name: name.to_string(),
                color: "#abcdef".to_string(),
            }),
        ))
        .unwrap();
    written_id(&result.applied)
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[test]
fn commit_markers_increase_across_reopen() {
    let dir = TempDir::new().unwrap();
    let first = open(&dir).commit(&scoped(7, todo_draft("one"))).unwrap().commit_id;
    let second = open(&dir).commit(&scoped(7, todo_draft("two"))).unwrap().commit_id;
    assert!(second > first);
    assert_eq!(open(&dir).list(principal(7), Table::Todos).unwrap().len(), 2);
}

#[test]
fn unsigned_ids_round_trip_and_out_of_range_ids_are_rejected() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let result = store.commit(&scoped(7, todo_draft("one"))).unwrap();
    let id = written_id(&result.applied);
    let Some(Record::Todo(todo)) = store.fetch(principal(7), Table::Todos, id).unwrap() else {
        panic!("todo missing");
    };
    assert_eq!(todo.id, id);
    assert_eq!(store.changes_since(0, 10).unwrap()[0].entry.commit_id(), Some(result.commit_id));

    let beyond = store.fetch(principal(7), Table::Todos, EntityId::new(u64::MAX));
    assert!(matches!(beyond, Err(CommitError::Invalid(_))));
}

#[test]
fn scenario_create_returns_row_and_marker() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let result = store.commit(&scoped(7, todo_draft("Write spec"))).unwrap();
    let Applied::Written {
        record: Record::Todo(todo),
        ..
    } = &result.applied
    else {
        panic!("expected todo");
    };
    assert_eq!(todo.title, "Write spec");
    assert_eq!(todo.user_id, principal(7));
    assert!(!todo.completed);
    let changes = store.changes_since(0, 10).unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].entry.commit_id(), Some(result.commit_id));
    assert_eq!(changes[0].entry.headers.operation, Operation::Insert);
    assert_eq!(changes[0].entry.value["title"], Value::from("Write spec"));
}

#[test]
fn foreign_update_and_delete_leave_store_unchanged() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let id = written_id(&store.commit(&scoped(7, todo_draft("mine"))).unwrap().applied);
    let before = store.list(principal(7), Table::Todos).unwrap();
    let log_before = store.changes_since(0, 100).unwrap();
    let update = store.commit(&scoped(
        8,
        Effect::UpdateTodo {
            id,
            patch: TodoPatch {
                title: Some("stolen".to_string()),
                ..TodoPatch::default()
            },
        },
    ));
    assert_eq!(update, Err(CommitError::NotFound));
    let delete = store.commit(&scoped(8, Effect::DeleteTodo { id }));
    assert_eq!(delete, Err(CommitError::NotFound));
    assert_eq!(store.list(principal(7), Table::Todos).unwrap(), before);
    assert_eq!(store.changes_since(0, 100).unwrap(), log_before);
    assert!(store.fetch(principal(8), Table::Todos, id).unwrap().is_none());
}

#[test]
fn replace_associations_is_idempotent_and_scoped() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let todo = written_id(&store.commit(&scoped(7, todo_draft("t"))).unwrap().applied);
    let a = create_label(&store, 7, "a");
    let b = create_label(&store, 7, "b");
    let foreign = create_label(&store, 8, "foreign");
    let wanted: BTreeSet<EntityId> = [a, b, foreign].into_iter().collect();
    for _ in 0 .. 2 {
        let result = store
            .commit(&scoped(
                7,
                Effect::ReplaceTodoLabels {
                    todo_id: todo,
                    label_ids: wanted.clone(),
                },
            ))
            .unwrap();
        let Applied::Written {
            label_ids, ..
        } = result.applied
        else {
            panic!("expected written");
        };
        assert_eq!(label_ids, Some(vec![a, b]));
    }
    assert_eq!(store.label_ids(principal(7), todo).unwrap(), vec![a, b]);
    let junction_rows =
        store.changes_since(0, 100).unwrap().into_iter().filter(|c| c.table == Table::TodoLabels);
    assert_eq!(junction_rows.count(), 2);
}

#[test]
fn delete_label_logs_junction_deletes_in_same_commit() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let todo = written_id(&store.commit(&scoped(7, todo_draft("t"))).unwrap().applied);
    let label = create_label(&store, 7, "l");
    store
        .commit(&scoped(
            7,
            Effect::ReplaceTodoLabels {
                todo_id: todo,
                label_ids: [label].into_iter().collect(),
            },
        ))
        .unwrap();
    let offset = store.changes_since(0, 100).unwrap().last().unwrap().offset;
    let result = store.commit(&scoped(7, Effect::DeleteLabel { id: label })).unwrap();
    let changes = store.changes_since(offset, 100).unwrap();
    let tables: Vec<Table> = changes.iter().map(|change| change.table).collect();
    assert_eq!(tables, vec![Table::TodoLabels, Table::Labels]);
    assert!(changes.iter().all(|change| change.entry.commit_id() == Some(result.commit_id)));
    assert!(store.label_ids(principal(7), todo).unwrap().is_empty());
}

#[test]
fn check_constraint_maps_to_constraint_violation() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let result = store.commit(&scoped(7, todo_draft(&"x".repeat(300))));
    assert!(matches!(result, Err(CommitError::ConstraintViolation(_))));
    assert!(store.changes_since(0, 10).unwrap().is_empty());
}

#[test]
fn contended_writer_reports_store_unavailable() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.db");
    let mut config = SqliteStoreConfig::at(&path);
    config.busy_timeout_ms = 10;
    let store = SqliteCommitSequencer::new(&config).unwrap();
    let blocker = Connection::open(&path).unwrap();
    blocker.execute_batch("BEGIN IMMEDIATE;").unwrap();
    let result = store.commit(&scoped(7, todo_draft("blocked")));
    assert!(matches!(result, Err(CommitError::StoreUnavailable(_))));
    blocker.execute_batch("ROLLBACK;").unwrap();
    assert!(store.commit(&scoped(7, todo_draft("after"))).is_ok());
}

#[test]
fn schema_version_mismatch_fails_closed() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.db");
    drop(SqliteCommitSequencer::new(&SqliteStoreConfig::at(&path)).unwrap());
    let connection = Connection::open(&path).unwrap();
    connection.execute("UPDATE store_meta SET version = 99", []).unwrap();
    drop(connection);
    let result = SqliteCommitSequencer::new(&SqliteStoreConfig::at(&path));
    assert!(matches!(result, Err(SqliteStoreError::VersionMismatch(_))));
}

#[test]
fn directory_path_is_rejected() {
    let dir = TempDir::new().unwrap();
    let result = SqliteCommitSequencer::new(&SqliteStoreConfig::at(dir.path()));
    assert!(matches!(result, Err(SqliteStoreError::Invalid(_))));
}

// ============================================================================
// SECTION: Properties
// ============================================================================

#[derive(Debug, Clone)]
enum Step {
    Create(bool),
    Toggle(usize),
    Delete(usize),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        any::<bool>().prop_map(Step::Create),
        (0usize .. 8).prop_map(Step::Toggle),
        (0usize .. 8).prop_map(Step::Delete),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn change_log_replay_matches_table(steps in proptest::collection::vec(step(), 1 .. 24)) {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let mut ids: Vec<EntityId> = Vec::new();
        let mut last_commit = None;
        for step in steps {
            let effect = match step {
                Step::Create(completed) => Effect::InsertTodo(TodoDraft {
                    title: "t".to_string(),
                    description: None,
                    completed,
                    label_ids: None,
                }),
                Step::Toggle(index) if !ids.is_empty() => Effect::UpdateTodo {
                    id: ids[index % ids.len()],
                    patch: TodoPatch { completed: Some(index % 2 == 0), ..TodoPatch::default() },
                },
                Step::Delete(index) if !ids.is_empty() => Effect::DeleteTodo {
                    id: ids.remove(index % ids.len()),
                },
                _ => continue,
            };
            let result = store.commit(&scoped(7, effect)).unwrap();
            if let Applied::Written { record, .. } = &result.applied
                && !ids.contains(&record.id())
            {
                ids.push(record.id());
            }
            prop_assert!(last_commit.is_none_or(|last| result.commit_id > last));
            last_commit = Some(result.commit_id);
        }
        let mut replayed: BTreeMap<String, Value> = BTreeMap::new();
        for change in store.changes_since(0, 1_000).unwrap() {
            let key = change.entry.key.as_str().to_string();
            match change.entry.headers.operation {
                Operation::Delete => {
                    replayed.remove(&key);
                }
                Operation::Insert | Operation::Update => {
                    replayed.insert(key, Value::Object(change.entry.value));
                }
            }
        }
        let listed: BTreeMap<String, Value> = store
            .list(principal(7), Table::Todos)
            .unwrap()
            .into_iter()
            .map(|record| {
                let key = format!("\"public\".\"todos\"/\"{}\"", record.id());
                (key, serde_json::to_value(&record).unwrap())
            })
            .collect();
        prop_assert_eq!(replayed, listed);
    }
}
