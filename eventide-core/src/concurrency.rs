//! Optimistic concurrency conflicts.
//!
//! Every save is checked per aggregate: pending events carry the sequence
//! numbers they were assigned against the version the writer loaded. If a
//! concurrent writer already stored an event at one of those positions, the
//! save fails as a whole with a [`ConcurrencyConflict`] that carries both
//! competing event bodies so the collision can be diagnosed.

use std::fmt;

use serde_json::Value;
use thiserror::Error;

/// Two writers produced an event at the same position in one aggregate.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{}", format_conflict(self))]
pub struct ConcurrencyConflict<Id: fmt::Debug> {
    pub aggregate_kind: String,
    pub aggregate_id: Id,
    /// Position both events claim.
    pub sequence_number: u64,
    /// Body of the event already stored at `sequence_number`.
    pub existing: Value,
    /// Body of the event this save tried to store there.
    pub attempted: Value,
}

/// Build a human-readable message for a [`ConcurrencyConflict`], including an
/// actionable hint for the caller.
fn format_conflict<Id: fmt::Debug>(conflict: &ConcurrencyConflict<Id>) -> String {
    format!(
        "concurrency conflict in {} {:?} at sequence {}: stored {} but attempted {} (hint: \
         another writer saved first; reload and retry)",
        conflict.aggregate_kind,
        conflict.aggregate_id,
        conflict.sequence_number,
        conflict.existing,
        conflict.attempted,
    )
}
