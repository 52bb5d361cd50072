// crates/shapegate-core/src/core/clock.rs
// ============================================================================
// Module: Shapegate Clock
// Description: Store-assigned timestamp helpers.
// Purpose: Produce RFC 3339 UTC timestamps for `created_at` and `updated_at`.
// Dependencies: time
// ============================================================================

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Fallback used if the system clock cannot be formatted.
const EPOCH_RFC3339: &str = "1970-01-01T00:00:00Z";

/// Returns the current UTC time as an RFC 3339 string.
#[must_use]
pub fn now_rfc3339() -> String {
    format_rfc3339(OffsetDateTime::now_utc())
}

/// Formats a timestamp as an RFC 3339 string.
#[must_use]
pub fn format_rfc3339(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_else(|_| EPOCH_RFC3339.to_string())
}
