// crates/shapegate-core/src/core/intent.rs
// ============================================================================
// Module: Shapegate Mutation Intents
// Description: Untrusted write requests and their validation into effects.
// Purpose: Reject malformed input before any transaction begins.
// Dependencies: serde, serde_json
// ============================================================================

//! ## Overview
//! Intents mirror the JSON bodies accepted by the mutation routes. Every field
//! is optional at the type level so that missing fields produce a field error
//! rather than a decode failure. [`validate`](TodoIntent::validate_create) and
//! friends turn an intent into a typed draft or patch, collecting every field
//! failure into [`ValidationErrors`].

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;

use crate::core::effect::LabelDraft;
use crate::core::effect::LabelPatch;
use crate::core::effect::TodoDraft;
use crate::core::effect::TodoPatch;
use crate::core::errors::SyncError;
use crate::core::errors::ValidationErrors;
use crate::core::identifiers::EntityId;

// ============================================================================
// SECTION: Limits
// ============================================================================

/// Maximum length, in characters, of titles and names.
pub const MAX_TEXT_CHARS: usize = 255;

// ============================================================================
// SECTION: Intents
// ============================================================================

/// Todo create or update body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TodoIntent {
    /// Title text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Description; an explicit `null` clears it on update.
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub description: Option<Option<String>>,
    /// Completion flag; defaults to false on create.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
    /// Label set to replace in the same commit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_ids: Option<Vec<EntityId>>,
}

/// Label create or update body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LabelIntent {
    /// Label name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Color token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

/// Association replace body for `PUT /api/todos/{id}/labels`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LabelSetIntent {
    /// Full replacement label set.
    #[serde(default)]
    pub label_ids: Option<Vec<EntityId>>,
}

/// Distinguishes an absent field from an explicit `null`.
fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

// ============================================================================
// SECTION: Validation
// ============================================================================

impl TodoIntent {
    /// Validates the intent as a create request.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] listing every failing field.
    pub fn validate_create(self) -> Result<TodoDraft, SyncError> {
        let mut errors = ValidationErrors::new();
        let title = match self.title {
            Some(title) => check_text(&mut errors, "title", title),
            None => {
                errors.add("title", "The title field is required.");
                None
            }
        };
        let description = self.description.flatten();
        let label_ids = self.label_ids.map(dedupe);
        errors.into_result()?;
        Ok(TodoDraft {
            title: title.unwrap_or_default(),
            description,
            completed: self.completed.unwrap_or(false),
            label_ids,
        })
    }

    /// Validates the intent as a partial update.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] listing every failing field.
    pub fn validate_update(self) -> Result<TodoPatch, SyncError> {
        let mut errors = ValidationErrors::new();
        let title = self.title.and_then(|title| check_text(&mut errors, "title", title));
        errors.into_result()?;
        Ok(TodoPatch {
            title,
            description: self.description,
            completed: self.completed,
            label_ids: self.label_ids.map(dedupe),
        })
    }
}

impl LabelIntent {
    /// Validates the intent as a create request.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] listing every failing field.
    pub fn validate_create(self) -> Result<LabelDraft, SyncError> {
        let mut errors = ValidationErrors::new();
        let name = match self.name {
            Some(name) => check_text(&mut errors, "name", name),
            None => {
                errors.add("name", "The name field is required.");
                None
            }
        };
        let color = match self.color {
            Some(color) => check_color(&mut errors, color),
            None => {
                errors.add("color", "The color field is required.");
                None
            }
        };
        errors.into_result()?;
        Ok(LabelDraft {
            name: name.unwrap_or_default(),
            color: color.unwrap_or_default(),
        })
    }

    /// Validates the intent as a partial update.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] listing every failing field.
    pub fn validate_update(self) -> Result<LabelPatch, SyncError> {
        let mut errors = ValidationErrors::new();
        let name = self.name.and_then(|name| check_text(&mut errors, "name", name));
        let color = self.color.and_then(|color| check_color(&mut errors, color));
        errors.into_result()?;
        Ok(LabelPatch {
            name,
            color,
        })
    }
}

impl LabelSetIntent {
    /// Validates the replacement label set.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] when `label_ids` is missing.
    pub fn validate(self) -> Result<BTreeSet<EntityId>, SyncError> {
        self.label_ids.map(dedupe).ok_or_else(|| {
            crate::core::errors::field_error("label_ids", "The label ids field is required.")
        })
    }
}

/// Checks a bounded, non-empty text field.
fn check_text(errors: &mut ValidationErrors, field: &str, value: String) -> Option<String> {
    if value.trim().is_empty() {
        errors.add(field, format!("The {field} field is required."));
        return None;
    }
    if value.chars().count() > MAX_TEXT_CHARS {
        errors.add(
            field,
            format!("The {field} field must not be greater than {MAX_TEXT_CHARS} characters."),
        );
        return None;
    }
    Some(value)
}

/// Checks a `#RRGGBB` color token.
fn check_color(errors: &mut ValidationErrors, value: String) -> Option<String> {
    if is_color_token(&value) {
        Some(value)
    } else {
        errors.add("color", "The color field format is invalid.");
        None
    }
}

/// Returns true for `#` followed by exactly six hex digits.
#[must_use]
pub fn is_color_token(value: &str) -> bool {
    value
        .strip_prefix('#')
        .is_some_and(|hex| hex.len() == 6 && hex.bytes().all(|byte| byte.is_ascii_hexdigit()))
}

/// Collapses duplicate ids.
fn dedupe(ids: Vec<EntityId>) -> BTreeSet<EntityId> {
    ids.into_iter().collect()
}
