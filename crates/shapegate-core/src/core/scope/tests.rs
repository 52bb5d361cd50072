// crates/shapegate-core/src/core/scope/tests.rs
// ============================================================================
// Module: Tenant Scope Unit Tests
// Description: Unit tests for predicate parsing and scoped rendering.
// Purpose: Ensure client predicates can never replace the tenant scope.
// Dependencies: shapegate-core
// ============================================================================

//! ## Overview
//! Exercises the predicate tokenizer, parser and renderer with hostile input.
//!
//! Security posture: Tests exercise untrusted `where` text.

// ============================================================================
// SECTION: Lint Configuration
// ============================================================================

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    reason = "Test-only assertions."
)]

// ============================================================================
// SECTION: Imports
// ============================================================================

use proptest::prelude::*;

use super::ClientPredicate;
use super::CompareOp;
use super::Condition;
use super::Literal;
use super::ScopedWhere;
use super::TenantScope;
use super::parse_columns;
use crate::core::errors::SyncError;
use crate::core::identifiers::PrincipalId;
use crate::core::model::Table;

// ============================================================================
// SECTION: Helpers
// ============================================================================

fn principal(id: u64) -> PrincipalId {
    PrincipalId::from_raw(id).unwrap()
}

fn render(table: Table, owner: u64, input: &str) -> ScopedWhere {
    let predicate = ClientPredicate::parse(table, input).unwrap();
    ScopedWhere::build(&TenantScope::new(table, principal(owner)), &predicate)
}

// ============================================================================
// SECTION: Rendering
// ============================================================================

#[test]
fn empty_where_renders_scope_only() {
    let rendered = render(Table::Todos, 7, "  ");
    assert_eq!(rendered.clause, "\"user_id\" = $1");
    assert_eq!(rendered.params, vec!["7".to_string()]);
}

#[test]
fn client_filters_are_conjoined_after_scope() {
    let rendered = render(Table::Todos, 7, "completed = false AND title <> 'x'");
    assert_eq!(rendered.clause, "\"user_id\" = $1 AND \"completed\" = $2 AND \"title\" <> $3");
    assert_eq!(rendered.params, vec!["7", "false", "x"]);
}

#[test]
fn identity_filters_are_dropped() {
    let predicate = ClientPredicate::parse(Table::Todos, "user_id = 8 AND completed = true").unwrap();
    assert_eq!(predicate.dropped(), 1);
    let rendered = ScopedWhere::build(&TenantScope::new(Table::Todos, principal(7)), &predicate);
    assert_eq!(rendered.clause, "\"user_id\" = $1 AND \"completed\" = $2");
    assert_eq!(rendered.params, vec!["7", "true"]);
}

#[test]
fn junction_is_scoped_through_parent() {
    let rendered = render(Table::TodoLabels, 7, "user_id = 8");
    assert_eq!(
        rendered.clause,
        "\"todo_id\" IN (SELECT \"id\" FROM \"todos\" WHERE \"user_id\" = $1)"
    );
    assert_eq!(rendered.params, vec!["7"]);
}

#[test]
fn string_literals_never_reach_clause_text() {
    let rendered = render(Table::Todos, 7, "title = 'x'' OR user_id = 8 --'");
    assert_eq!(rendered.clause, "\"user_id\" = $1 AND \"title\" = $2");
    assert_eq!(rendered.params[1], "x' OR user_id = 8 --");
}

#[test]
fn null_checks_render_without_params() {
    let rendered = render(Table::Todos, 3, "description IS NOT NULL AND id >= 10");
    assert_eq!(
        rendered.clause,
        "\"user_id\" = $1 AND \"description\" IS NOT NULL AND \"id\" >= $2"
    );
    assert_eq!(rendered.params, vec!["3", "10"]);
}

#[test]
fn every_condition_kind_renders_into_the_clause() {
    let rendered = render(Table::Todos, 4, "description IS NULL AND completed = true AND title IS NOT NULL");
    assert_eq!(
        rendered.clause,
        "\"user_id\" = $1 AND \"description\" IS NULL AND \"completed\" = $2 AND \"title\" IS NOT NULL"
    );
    assert_eq!(rendered.params, vec!["4", "true"]);
}

#[test]
fn predicate_evaluates_typed_rows_like_the_rendered_clause() {
    let predicate =
        ClientPredicate::parse(Table::Todos, "completed = false AND id >= 10 AND description IS NULL AND title <> 'x'")
            .unwrap();
    let row = |id: i64, completed: bool, description: serde_json::Value, title: &str| {
        serde_json::json!({"id": id, "completed": completed, "description": description, "title": title})
            .as_object()
            .cloned()
            .unwrap()
    };
    assert!(predicate.matches(&row(10, false, serde_json::Value::Null, "a")));
    assert!(!predicate.matches(&row(9, false, serde_json::Value::Null, "a")));
    assert!(!predicate.matches(&row(10, true, serde_json::Value::Null, "a")));
    assert!(!predicate.matches(&row(10, false, serde_json::json!("notes"), "a")));
    assert!(!predicate.matches(&row(10, false, serde_json::Value::Null, "x")));
    assert!(ClientPredicate::default().matches(&row(1, true, serde_json::Value::Null, "x")));
}

#[test]
fn comparison_against_missing_column_is_false() {
    let predicate = ClientPredicate::parse(Table::Todos, "title = 'a'").unwrap();
    assert!(!predicate.matches(&serde_json::Map::new()));
    let absent = ClientPredicate::parse(Table::Todos, "description IS NULL").unwrap();
    assert!(absent.matches(&serde_json::Map::new()));
}

// ============================================================================
// SECTION: Rejection
// ============================================================================

#[test]
fn disjunction_is_rejected() {
    let result = ClientPredicate::parse(Table::Todos, "completed = true OR user_id = 8");
    assert!(matches!(result, Err(SyncError::Validation(_))));
}

#[test]
fn unknown_column_is_rejected() {
    assert!(ClientPredicate::parse(Table::Labels, "completed = true").is_err());
}

#[test]
fn mistyped_literal_is_rejected() {
    assert!(ClientPredicate::parse(Table::Todos, "completed = 'false'").is_err());
    assert!(ClientPredicate::parse(Table::Todos, "id = 'a'").is_err());
}

#[test]
fn malformed_input_is_rejected() {
    for input in [
        "completed",
        "completed =",
        "= true",
        "completed = true AND",
        "title = 'open",
        "completed = true; DROP TABLE todos",
        "id IN (SELECT id FROM todos)",
        "id = $1",
    ] {
        assert!(ClientPredicate::parse(Table::Todos, input).is_err(), "accepted {input}");
    }
}

#[test]
fn operators_parse() {
    let predicate = ClientPredicate::parse(Table::Todos, "id != 1 AND id <= 2").unwrap();
    let ops: Vec<CompareOp> = predicate
        .filters()
        .iter()
        .map(|filter| match &filter.condition {
            Condition::Compare {
                op, ..
            } => *op,
            other => panic!("unexpected condition {other:?}"),
        })
        .collect();
    assert_eq!(ops, vec![CompareOp::NotEq, CompareOp::Le]);
    assert_eq!(
        predicate.filters()[1].condition,
        Condition::Compare {
            op: CompareOp::Le,
            value: Literal::Integer(2),
        }
    );
}

// ============================================================================
// SECTION: Columns
// ============================================================================

#[test]
fn columns_add_missing_keys() {
    let columns = parse_columns(Table::Todos, "title,completed").unwrap();
    assert_eq!(columns, vec!["id", "title", "completed"]);
    let junction = parse_columns(Table::TodoLabels, "todo_id").unwrap();
    assert_eq!(junction, vec!["label_id", "todo_id"]);
}

#[test]
fn columns_reject_unknown() {
    assert!(parse_columns(Table::Labels, "id,password").is_err());
    assert!(parse_columns(Table::Labels, " , ").is_err());
}

// ============================================================================
// SECTION: Properties
// ============================================================================

proptest! {
    #[test]
    fn scope_always_leads_and_binds_owner(owner in 1u64..10_000, input in ".{0,64}") {
        if let Ok(predicate) = ClientPredicate::parse(Table::Todos, &input) {
            let rendered = ScopedWhere::build(&TenantScope::new(Table::Todos, principal(owner)), &predicate);
            prop_assert!(rendered.clause.starts_with("\"user_id\" = $1"));
            prop_assert_eq!(rendered.params[0].clone(), owner.to_string());
            prop_assert!(!rendered.clause.contains('\''));
            prop_assert!(!rendered.clause.contains(" OR "));
        }
    }
}
