//! Persistence layer abstractions.
//!
//! This module describes the storage contract (`EventStore`), the stored
//! event form (`StoredEvent`), history filters, and a reference in-memory
//! implementation.
use std::{fmt, future::Future, hash::Hash};

use chrono::{DateTime, Utc};
pub use nonempty::NonEmpty;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::{
    concurrency::ConcurrencyConflict,
    event::{EventDecodeError, EventEncodeError, EventEnvelope, EventKind, derived_etag},
};

pub mod inmemory;

/// Event as it is persisted: the payload is kept as JSON, next to the facts
/// the engine tracks about it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent<Id> {
    pub aggregate_kind: String,
    pub aggregate_id: Id,
    /// Event discriminator.
    pub kind: String,
    pub sequence_number: u64,
    pub timestamp: DateTime<Utc>,
    pub etag: Option<String>,
    pub data: serde_json::Value,
}

impl<Id> StoredEvent<Id> {
    /// Serialize an envelope for storage under `aggregate_kind`.
    ///
    /// # Errors
    ///
    /// Returns [`EventEncodeError`] if the payload cannot be serialized.
    pub fn encode<E>(
        aggregate_kind: &str,
        envelope: &EventEnvelope<Id, E>,
    ) -> Result<Self, EventEncodeError>
    where
        Id: Clone,
        E: EventKind + Serialize,
    {
        let kind = envelope.kind();
        let data = serde_json::to_value(&envelope.event).map_err(|source| EventEncodeError {
            kind: kind.to_string(),
            source,
        })?;
        Ok(Self {
            aggregate_kind: aggregate_kind.to_string(),
            aggregate_id: envelope.aggregate_id.clone(),
            kind: kind.to_string(),
            sequence_number: envelope.sequence_number,
            timestamp: envelope.timestamp,
            etag: envelope.etag.clone(),
            data,
        })
    }

    /// Deserialize back into an envelope.
    ///
    /// # Errors
    ///
    /// Returns [`EventDecodeError`] if the payload does not match `E`.
    pub fn decode<E>(&self) -> Result<EventEnvelope<Id, E>, EventDecodeError>
    where
        Id: Clone,
        E: DeserializeOwned,
    {
        let event = serde_json::from_value(self.data.clone()).map_err(|source| EventDecodeError {
            kind: self.kind.clone(),
            sequence_number: self.sequence_number,
            source,
        })?;
        Ok(EventEnvelope {
            aggregate_id: self.aggregate_id.clone(),
            sequence_number: self.sequence_number,
            timestamp: self.timestamp,
            etag: self.etag.clone(),
            event,
        })
    }

    /// The event's ETag, or the deterministic one derived from its position
    /// when it was stored without one.
    pub fn effective_etag(&self) -> String
    where
        Id: fmt::Display,
    {
        self.etag.clone().unwrap_or_else(|| {
            derived_etag(&self.aggregate_kind, &self.aggregate_id, self.sequence_number)
        })
    }
}

/// Which part of an aggregate's history to load.
///
/// Both bounds are inclusive and may be combined.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub up_to_version: Option<u64>,
    pub as_of: Option<DateTime<Utc>>,
}

impl EventFilter {
    /// The whole history.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            up_to_version: None,
            as_of: None,
        }
    }

    /// Events with `sequence_number <= version`.
    #[must_use]
    pub const fn up_to_version(version: u64) -> Self {
        Self {
            up_to_version: Some(version),
            as_of: None,
        }
    }

    /// Events with `timestamp <= as_of`.
    #[must_use]
    pub const fn as_of(as_of: DateTime<Utc>) -> Self {
        Self {
            up_to_version: None,
            as_of: Some(as_of),
        }
    }

    pub fn matches<Id>(&self, event: &StoredEvent<Id>) -> bool {
        self.up_to_version
            .is_none_or(|version| event.sequence_number <= version)
            && self.as_of.is_none_or(|as_of| event.timestamp <= as_of)
    }
}

/// Error from append operations.
#[derive(Debug, Error)]
pub enum AppendError<Id, StoreError>
where
    Id: fmt::Debug,
    StoreError: std::error::Error,
{
    /// Another writer already stored an event at one of the positions.
    #[error(transparent)]
    Conflict(#[from] ConcurrencyConflict<Id>),
    /// Underlying store error.
    #[error("store error: {0}")]
    Store(#[source] StoreError),
}

impl<Id: fmt::Debug, StoreError: std::error::Error> AppendError<Id, StoreError> {
    /// Create a store error variant.
    pub const fn store(err: StoreError) -> Self {
        Self::Store(err)
    }
}

/// Result of a successful append operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AppendResult {
    /// Sequence number of the last event written in the batch.
    pub last_sequence_number: u64,
}

/// Convenience alias for append outcomes returned by event stores.
pub type AppendOutcome<Id, Err> = Result<AppendResult, AppendError<Id, Err>>;

/// Abstraction over the persistence layer for aggregate event streams.
///
/// A stream is identified by `(aggregate kind, aggregate id)`. Stores must
/// uphold:
///
/// - sequence numbers are unique within a stream; appending an event at an
///   occupied position fails the whole batch with a conflict
/// - an append is all-or-nothing
/// - loads return events in ascending sequence order
// ANCHOR: event_store_trait
pub trait EventStore: Send + Sync {
    /// Aggregate identifier type.
    ///
    /// This type must be clonable so repositories can reuse IDs across calls.
    /// Common choices: `String`, `Uuid`, or custom ID types.
    type Id: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static;

    /// Store-specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Highest sequence number in the stream, or `0` when it is empty.
    ///
    /// # Errors
    ///
    /// Returns a store-specific error when the operation fails.
    fn stream_version<'a>(
        &'a self,
        aggregate_kind: &'a str,
        aggregate_id: &'a Self::Id,
    ) -> impl Future<Output = Result<u64, Self::Error>> + Send + 'a;

    /// Append events to a stream.
    ///
    /// Events carrying [`UNASSIGNED`](crate::event::UNASSIGNED) are placed
    /// after the current end of the stream; all others keep their sequence
    /// number.
    ///
    /// # Errors
    ///
    /// Returns [`AppendError::Conflict`] if any position is already taken,
    /// or [`AppendError::Store`] if persistence fails.
    fn append<'a>(
        &'a self,
        aggregate_kind: &'a str,
        aggregate_id: &'a Self::Id,
        events: NonEmpty<StoredEvent<Self::Id>>,
    ) -> impl Future<Output = AppendOutcome<Self::Id, Self::Error>> + Send + 'a;

    /// Load the part of a stream selected by `filter`.
    ///
    /// # Errors
    ///
    /// Returns a store-specific error when loading fails.
    fn load<'a>(
        &'a self,
        aggregate_kind: &'a str,
        aggregate_id: &'a Self::Id,
        filter: &'a EventFilter,
    ) -> impl Future<Output = Result<Vec<StoredEvent<Self::Id>>, Self::Error>> + Send + 'a;

    /// Find the event with the given effective ETag in any stream of the
    /// aggregate.
    ///
    /// # Errors
    ///
    /// Returns a store-specific error when the lookup fails.
    fn find_by_etag<'a>(
        &'a self,
        aggregate_id: &'a Self::Id,
        etag: &'a str,
    ) -> impl Future<Output = Result<Option<StoredEvent<Self::Id>>, Self::Error>> + Send + 'a;
}
// ANCHOR_END: event_store_trait

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct StreamKey<Id> {
    aggregate_kind: String,
    aggregate_id: Id,
}

impl<Id> StreamKey<Id> {
    pub(crate) fn new(aggregate_kind: impl Into<String>, aggregate_id: Id) -> Self {
        Self {
            aggregate_kind: aggregate_kind.into(),
            aggregate_id,
        }
    }

    pub(crate) const fn aggregate_id(&self) -> &Id {
        &self.aggregate_id
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::event::DomainEvent;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct ValueAdded {
        amount: i32,
    }

    impl DomainEvent for ValueAdded {
        const KIND: &'static str = "value-added";
    }

    fn stored(sequence_number: u64, hour: u32) -> StoredEvent<String> {
        StoredEvent {
            aggregate_kind: "counter".into(),
            aggregate_id: "c-1".into(),
            kind: "value-added".into(),
            sequence_number,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap(),
            etag: None,
            data: serde_json::json!({ "amount": 1 }),
        }
    }

    #[test]
    fn event_filter_all_matches_everything() {
        assert!(EventFilter::all().matches(&stored(100, 23)));
    }

    #[test]
    fn event_filter_bounds_are_inclusive() {
        let by_version = EventFilter::up_to_version(5);
        assert!(by_version.matches(&stored(5, 0)));
        assert!(!by_version.matches(&stored(6, 0)));

        let cutoff = Utc.with_ymd_and_hms(2024, 1, 1, 3, 0, 0).unwrap();
        let by_date = EventFilter::as_of(cutoff);
        assert!(by_date.matches(&stored(1, 3)));
        assert!(!by_date.matches(&stored(1, 4)));
    }

    #[test]
    fn encode_then_decode_preserves_envelope() {
        let envelope = EventEnvelope::new("c-1".to_string(), Utc::now(), ValueAdded { amount: 7 })
            .at(3)
            .with_etag("tok");
        let stored = StoredEvent::encode("counter", &envelope).unwrap();
        assert_eq!(stored.kind, "value-added");
        assert_eq!(stored.data, serde_json::json!({ "amount": 7 }));

        let decoded: EventEnvelope<String, ValueAdded> = stored.decode().unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn decode_reports_kind_and_position() {
        let mut event = stored(9, 0);
        event.data = serde_json::json!("not an object");
        let err = event.decode::<ValueAdded>().unwrap_err();
        assert_eq!(err.kind, "value-added");
        assert_eq!(err.sequence_number, 9);
    }

    #[test]
    fn effective_etag_prefers_explicit_token() {
        let mut event = stored(2, 0);
        assert_eq!(event.effective_etag(), derived_etag("counter", &"c-1", 2));

        event.etag = Some("explicit".into());
        assert_eq!(event.effective_etag(), "explicit");
    }
}
