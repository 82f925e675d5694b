//! Ordered per-aggregate event collections.

use std::{
    collections::{BTreeMap, HashSet},
    fmt,
};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::event::{EventEnvelope, UNASSIGNED};

/// Error returned when an event cannot join a sequence.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequenceError<Id: fmt::Debug> {
    #[error("event sequence for {expected:?} cannot accept an event for {actual:?}")]
    MismatchedAggregate { expected: Id, actual: Id },
    #[error("sequence number {sequence_number} is already taken in aggregate {aggregate_id:?}")]
    DuplicateSequenceNumber { aggregate_id: Id, sequence_number: u64 },
    #[error("etag `{etag}` is already recorded in aggregate {aggregate_id:?}")]
    DuplicateEtag { aggregate_id: Id, etag: String },
    #[error("aggregate {aggregate_id:?} has no sequence number left after {version}")]
    Exhausted { aggregate_id: Id, version: u64 },
}

/// Ordered set of events scoped to one aggregate.
///
/// Sequence numbers are unique but need not be contiguous; [`version`]
/// reports the highest one present, not the number of events.
///
/// [`version`]: EventSequence::version
#[derive(Clone, Debug)]
pub struct EventSequence<Id, E> {
    aggregate_id: Id,
    events: BTreeMap<u64, EventEnvelope<Id, E>>,
    etags: HashSet<String>,
}

impl<Id, E> EventSequence<Id, E>
where
    Id: Clone + PartialEq + fmt::Debug,
{
    pub fn new(aggregate_id: Id) -> Self {
        Self {
            aggregate_id,
            events: BTreeMap::new(),
            etags: HashSet::new(),
        }
    }

    /// Build a sequence from existing events, in any order.
    ///
    /// # Errors
    ///
    /// Fails on the first event [`add`](Self::add) rejects.
    pub fn from_events(
        aggregate_id: Id,
        events: impl IntoIterator<Item = EventEnvelope<Id, E>>,
    ) -> Result<Self, SequenceError<Id>> {
        let mut sequence = Self::new(aggregate_id);
        for event in events {
            sequence.add(event)?;
        }
        Ok(sequence)
    }

    pub const fn aggregate_id(&self) -> &Id {
        &self.aggregate_id
    }

    /// Highest sequence number present, or `0` when empty.
    pub fn version(&self) -> u64 {
        self.events.last_key_value().map_or(0, |(&n, _)| n)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn contains_etag(&self, etag: &str) -> bool {
        self.etags.contains(etag)
    }

    /// Add an event, keeping a preset sequence number or assigning the next
    /// one. Returns the sequence number the event now holds.
    ///
    /// # Errors
    ///
    /// Returns [`SequenceError`] if the event belongs to another aggregate,
    /// or its sequence number or ETag is already present.
    pub fn add(&mut self, mut event: EventEnvelope<Id, E>) -> Result<u64, SequenceError<Id>> {
        if event.aggregate_id != self.aggregate_id {
            return Err(SequenceError::MismatchedAggregate {
                expected: self.aggregate_id.clone(),
                actual: event.aggregate_id,
            });
        }
        if event.sequence_number == UNASSIGNED {
            let version = self.version();
            event.sequence_number = version
                .checked_add(1)
                .ok_or_else(|| SequenceError::Exhausted {
                    aggregate_id: self.aggregate_id.clone(),
                    version,
                })?;
        } else if self.events.contains_key(&event.sequence_number) {
            return Err(SequenceError::DuplicateSequenceNumber {
                aggregate_id: self.aggregate_id.clone(),
                sequence_number: event.sequence_number,
            });
        }
        if let Some(etag) = &event.etag {
            if self.etags.contains(etag) {
                return Err(SequenceError::DuplicateEtag {
                    aggregate_id: self.aggregate_id.clone(),
                    etag: etag.clone(),
                });
            }
            self.etags.insert(etag.clone());
        }
        let sequence_number = event.sequence_number;
        self.events.insert(sequence_number, event);
        Ok(sequence_number)
    }

    /// Events in ascending sequence order.
    pub fn iter(&self) -> impl Iterator<Item = &EventEnvelope<Id, E>> {
        self.events.values()
    }

    /// Events with `sequence_number <= version`.
    pub fn up_to_version(&self, version: u64) -> impl Iterator<Item = &EventEnvelope<Id, E>> {
        self.events.range(..=version).map(|(_, e)| e)
    }

    /// Events with `timestamp <= as_of`, in sequence order.
    pub fn as_of(&self, as_of: DateTime<Utc>) -> impl Iterator<Item = &EventEnvelope<Id, E>> {
        self.events.values().filter(move |e| e.timestamp <= as_of)
    }
}

impl<Id, E> IntoIterator for EventSequence<Id, E> {
    type IntoIter = std::collections::btree_map::IntoValues<u64, EventEnvelope<Id, E>>;
    type Item = EventEnvelope<Id, E>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.into_values()
    }
}
