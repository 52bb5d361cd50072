// crates/shapegate-core/src/core/identifiers.rs
// ============================================================================
// Module: Shapegate Identifiers
// Description: Strongly typed numeric identifiers for principals, rows, and commits.
// Purpose: Keep tenant ids, row ids, and commit markers from being mixed up.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! Identifiers are thin numeric wrappers. [`CommitId`] serializes as a decimal
//! string on the wire (JSON consumers may not hold 64-bit integers exactly) and
//! accepts either a string or a number when decoding.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use serde::de;

// ============================================================================
// SECTION: Principal
// ============================================================================

/// Authenticated owner of a data partition.
///
/// # Invariants
/// - Always non-zero; zero is rejected by [`PrincipalId::from_raw`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrincipalId(u64);

impl PrincipalId {
    /// Creates a principal identifier, rejecting zero.
    #[must_use]
    pub const fn from_raw(value: u64) -> Option<Self> {
        if value == 0 { None } else { Some(Self(value)) }
    }

    /// Returns the raw numeric value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// SECTION: Entity
// ============================================================================

/// Row identifier, unique within its table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(u64);

impl EntityId {
    /// Creates a new entity identifier.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw numeric value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// SECTION: Commit Marker
// ============================================================================

/// Commit marker assigned by the store when a transaction commits.
///
/// # Invariants
/// - For writes W1 committed before W2, `CommitId(W1) < CommitId(W2)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommitId(u64);

impl CommitId {
    /// Creates a commit marker from its raw value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw numeric value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for CommitId {
    type Err = std::num::ParseIntError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        value.trim().parse::<u64>().map(Self)
    }
}

impl Serialize for CommitId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for CommitId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(CommitIdVisitor)
    }
}

/// Accepts commit markers encoded as strings or unsigned integers.
struct CommitIdVisitor;

impl de::Visitor<'_> for CommitIdVisitor {
    type Value = CommitId;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("a commit id as a decimal string or unsigned integer")
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> Result<CommitId, E> {
        Ok(CommitId(value))
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> Result<CommitId, E> {
        u64::try_from(value).map(CommitId).map_err(|_| E::custom("negative commit id"))
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<CommitId, E> {
        value.parse::<CommitId>().map_err(|err| E::custom(format!("invalid commit id: {err}")))
    }
}

// ============================================================================
// SECTION: Mutation
// ============================================================================

/// Client-local identifier for an optimistic mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MutationId(u64);

impl MutationId {
    /// Creates a mutation identifier.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw numeric value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mutation-{}", self.0)
    }
}

// ============================================================================
// SECTION: Row Keys
// ============================================================================

/// Opaque row key used by the change stream and client collections.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowKey(String);

impl RowKey {
    /// Creates a row key from its string form.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for RowKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for RowKey {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}
