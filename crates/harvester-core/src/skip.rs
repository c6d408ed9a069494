//! Skip predicates for the per-record state machine.
//!
//! Evaluated in order: [`skip_without_fetch`] before any network call, then
//! [`skip_after_fetch`] once the fresh source checksum is known. A record
//! carrying override rules is never skipped, so its rules are re-validated
//! on every pass.

use crate::models::{HarvestedRecord, RecordStatus};

fn settled(existing: Option<&HarvestedRecord>, rule_count: usize) -> Option<&HarvestedRecord> {
    existing.filter(|row| row.status == RecordStatus::Success && rule_count == 0)
}

/// Fast path: a settled row and no verification requested.
pub fn skip_without_fetch(
    existing: Option<&HarvestedRecord>,
    rule_count: usize,
    must_verify: bool,
) -> bool {
    !must_verify && settled(existing, rule_count).is_some()
}

/// Verified path: a settled row whose stored source checksum equals the
/// freshly computed one.
pub fn skip_after_fetch(
    existing: Option<&HarvestedRecord>,
    rule_count: usize,
    must_verify: bool,
    fresh_checksum: &str,
) -> bool {
    must_verify
        && settled(existing, rule_count).map_or(false, |row| row.source_checksum == fresh_checksum)
}
