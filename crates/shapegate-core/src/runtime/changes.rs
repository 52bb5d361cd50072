// crates/shapegate-core/src/runtime/changes.rs
// ============================================================================
// Module: Shapegate Change Builders
// Description: Builds change-log entries for persisted rows.
// Purpose: Keep change-log encoding identical across sequencer backends.
// Dependencies: crate::core, serde_json
// ============================================================================

//! ## Overview
//! Helpers that turn persisted rows into [`ChangeEntry`] values tagged with
//! the commit marker of the transaction that wrote them.

use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::core::CommitId;
use crate::core::KeyedRow;
use crate::core::Table;
use crate::core::stream::ChangeEntry;
use crate::core::stream::ChangeHeaders;
use crate::core::stream::Operation;
use crate::interfaces::CommitError;

/// Builds a change entry for a row.
///
/// # Errors
///
/// Returns [`CommitError::Invalid`] when the row cannot be encoded as an object.
pub fn row_change<R>(
    table: Table,
    row: &R,
    operation: Operation,
    commit_id: CommitId,
) -> Result<ChangeEntry, CommitError>
where
    R: KeyedRow + Serialize,
{
    let value = match serde_json::to_value(row) {
        Ok(Value::Object(map)) => map,
        Ok(_) => return Err(CommitError::Invalid("row did not encode as an object".to_string())),
        Err(err) => return Err(CommitError::Invalid(err.to_string())),
    };
    Ok(ChangeEntry {
        key: row.row_key(),
        value: key_only(table, value, operation),
        headers: ChangeHeaders {
            operation,
            txids: vec![commit_id],
            relation: Some(vec!["public".to_string(), table.as_str().to_string()]),
        },
    })
}

/// Deletes carry only key columns.
fn key_only(table: Table, value: Map<String, Value>, operation: Operation) -> Map<String, Value> {
    if operation != Operation::Delete {
        return value;
    }
    value.into_iter().filter(|(column, _)| table.key_columns().contains(&column.as_str())).collect()
}
