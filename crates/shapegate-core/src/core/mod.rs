// crates/shapegate-core/src/core/mod.rs
// ============================================================================
// Module: Shapegate Core Types
// Description: Identifiers, data model, intents, effects, scopes, and stream model.
// Purpose: Provide the canonical types shared by the gateway, store, and client.
// Dependencies: serde, serde_json, thiserror, time
// ============================================================================

//! ## Overview
//! Core types are transport-agnostic. The HTTP gateway, the SQLite store and
//! the client reconciliation engine all speak in these types.

// ============================================================================
// SECTION: Submodules
// ============================================================================

pub mod effect;
pub mod errors;
pub mod identifiers;
pub mod intent;
pub mod model;
pub mod scope;
pub mod stream;
pub mod clock;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use effect::Applied;
pub use effect::CommitResult;
pub use effect::Effect;
pub use effect::LabelDraft;
pub use effect::LabelPatch;
pub use effect::ScopedEffect;
pub use effect::TodoDraft;
pub use effect::TodoPatch;
pub use errors::SyncError;
pub use errors::ValidationErrors;
pub use errors::field_error;
pub use identifiers::CommitId;
pub use identifiers::EntityId;
pub use identifiers::MutationId;
pub use identifiers::PrincipalId;
pub use identifiers::RowKey;
pub use intent::LabelIntent;
pub use intent::LabelSetIntent;
pub use intent::MAX_TEXT_CHARS;
pub use intent::TodoIntent;
pub use intent::is_color_token;
pub use model::ColumnKind;
pub use model::KeyedRow;
pub use model::Label;
pub use model::OwnerScope;
pub use model::Principal;
pub use model::Record;
pub use model::Table;
pub use model::Todo;
pub use model::TodoLabel;
pub use model::entity_key;
pub use scope::ClientPredicate;
pub use scope::ColumnFilter;
pub use scope::CompareOp;
pub use scope::Condition;
pub use scope::Literal;
pub use scope::ScopedWhere;
pub use scope::TenantScope;
pub use scope::parse_columns;
pub use stream::ChangeEntry;
pub use stream::ChangeHeaders;
pub use stream::Control;
pub use stream::ControlHeaders;
pub use stream::Operation;
pub use stream::ShapeCursor;
pub use stream::ShapeMessage;
pub use stream::normalize_row;
pub use clock::now_rfc3339;
