//! In-memory event store implementation for testing.
//!
//! This module provides [`Store`], a thread-safe in-memory implementation of
//! [`EventStore`](super::EventStore) suitable for unit tests and examples.
//!
//! # Example
//!
//! ```
//! use eventide_core::store::inmemory;
//!
//! let store: inmemory::Store<String> = inmemory::Store::new();
//! ```

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    hash::Hash,
    sync::{Arc, RwLock},
};

use nonempty::NonEmpty;

use crate::{
    concurrency::ConcurrencyConflict,
    event::UNASSIGNED,
    store::{
        AppendError, AppendOutcome, AppendResult, EventFilter, EventStore, StoredEvent, StreamKey,
    },
};

/// Event stream stored in memory, keyed by sequence number.
type InMemoryStream<Id> = BTreeMap<u64, StoredEvent<Id>>;

/// In-memory event store that keeps streams in a hash map.
///
/// Clones share the same underlying streams.
#[derive(Clone)]
pub struct Store<Id> {
    inner: Arc<RwLock<Inner<Id>>>,
}

struct Inner<Id> {
    streams: HashMap<StreamKey<Id>, InMemoryStream<Id>>,
}

impl<Id> Store<Id> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                streams: HashMap::new(),
            })),
        }
    }
}

impl<Id> Default for Store<Id> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Id> fmt::Debug for Store<Id> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read().expect("in-memory store lock poisoned");
        f.debug_struct("Store")
            .field("streams", &inner.streams.len())
            .finish()
    }
}

/// Error type for in-memory store.
#[derive(Debug, thiserror::Error)]
pub enum InMemoryError {
    #[error(
        "event for {event_kind}/{event_id} cannot be appended to stream {stream_kind}/{stream_id}"
    )]
    MismatchedStream {
        stream_kind: String,
        stream_id: String,
        event_kind: String,
        event_id: String,
    },
    #[error("etag `{etag}` is already recorded in stream {stream_kind}/{stream_id}")]
    DuplicateEtag {
        stream_kind: String,
        stream_id: String,
        etag: String,
    },
}

impl<Id> Store<Id>
where
    Id: Clone + Eq + Hash + fmt::Debug + fmt::Display,
{
    fn append_now(
        &self,
        aggregate_kind: &str,
        aggregate_id: &Id,
        events: NonEmpty<StoredEvent<Id>>,
    ) -> AppendOutcome<Id, InMemoryError> {
        for event in events.iter() {
            if event.aggregate_kind != aggregate_kind || event.aggregate_id != *aggregate_id {
                return Err(AppendError::store(InMemoryError::MismatchedStream {
                    stream_kind: aggregate_kind.to_string(),
                    stream_id: aggregate_id.to_string(),
                    event_kind: event.aggregate_kind.clone(),
                    event_id: event.aggregate_id.to_string(),
                }));
            }
        }

        let mut inner = self.inner.write().expect("in-memory store lock poisoned");
        let stream_key = StreamKey::new(aggregate_kind, aggregate_id.clone());
        let existing = inner.streams.get(&stream_key);
        let mut next = existing
            .and_then(|s| s.last_key_value().map(|(&n, _)| n))
            .unwrap_or(0);

        // Stage the whole batch before touching the stream.
        let mut staged: BTreeMap<u64, StoredEvent<Id>> = BTreeMap::new();
        let mut last_sequence_number = UNASSIGNED;
        for mut event in events {
            if event.sequence_number == UNASSIGNED {
                event.sequence_number = next + 1;
            }
            let taken = existing
                .and_then(|s| s.get(&event.sequence_number))
                .or_else(|| staged.get(&event.sequence_number));
            if let Some(taken) = taken {
                tracing::debug!(
                    sequence_number = event.sequence_number,
                    "sequence number already taken, rejecting append"
                );
                return Err(ConcurrencyConflict {
                    aggregate_kind: aggregate_kind.to_string(),
                    aggregate_id: aggregate_id.clone(),
                    sequence_number: event.sequence_number,
                    existing: taken.data.clone(),
                    attempted: event.data,
                }
                .into());
            }
            if let Some(etag) = &event.etag {
                let recorded = existing
                    .into_iter()
                    .flat_map(BTreeMap::values)
                    .chain(staged.values())
                    .any(|e| e.etag.as_ref() == Some(etag));
                if recorded {
                    return Err(AppendError::store(InMemoryError::DuplicateEtag {
                        stream_kind: aggregate_kind.to_string(),
                        stream_id: aggregate_id.to_string(),
                        etag: etag.clone(),
                    }));
                }
            }
            next = next.max(event.sequence_number);
            last_sequence_number = event.sequence_number;
            staged.insert(event.sequence_number, event);
        }

        let event_count = staged.len();
        inner.streams.entry(stream_key).or_default().extend(staged);
        drop(inner);
        tracing::debug!(events_appended = event_count, "events committed to stream");
        Ok(AppendResult {
            last_sequence_number,
        })
    }
}

impl<Id> EventStore for Store<Id>
where
    Id: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static,
{
    type Error = InMemoryError;
    type Id = Id;

    #[tracing::instrument(skip(self, aggregate_id))]
    fn stream_version<'a>(
        &'a self,
        aggregate_kind: &'a str,
        aggregate_id: &'a Self::Id,
    ) -> impl Future<Output = Result<u64, Self::Error>> + Send + 'a {
        let stream_key = StreamKey::new(aggregate_kind, aggregate_id.clone());
        let version = {
            let inner = self.inner.read().expect("in-memory store lock poisoned");
            inner
                .streams
                .get(&stream_key)
                .and_then(|s| s.last_key_value().map(|(&n, _)| n))
                .unwrap_or(0)
        };
        tracing::trace!(version, "retrieved stream version");
        std::future::ready(Ok(version))
    }

    #[tracing::instrument(skip(self, aggregate_id, events), fields(event_count = events.len()))]
    fn append<'a>(
        &'a self,
        aggregate_kind: &'a str,
        aggregate_id: &'a Self::Id,
        events: NonEmpty<StoredEvent<Self::Id>>,
    ) -> impl Future<Output = AppendOutcome<Self::Id, Self::Error>> + Send + 'a {
        std::future::ready(self.append_now(aggregate_kind, aggregate_id, events))
    }

    #[tracing::instrument(skip(self, aggregate_id, filter))]
    fn load<'a>(
        &'a self,
        aggregate_kind: &'a str,
        aggregate_id: &'a Self::Id,
        filter: &'a EventFilter,
    ) -> impl Future<Output = Result<Vec<StoredEvent<Self::Id>>, Self::Error>> + Send + 'a {
        let stream_key = StreamKey::new(aggregate_kind, aggregate_id.clone());
        let events: Vec<_> = {
            let inner = self.inner.read().expect("in-memory store lock poisoned");
            inner
                .streams
                .get(&stream_key)
                .map(|stream| {
                    stream
                        .values()
                        .filter(|event| filter.matches(event))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };
        tracing::debug!(events_loaded = events.len(), "loaded events from store");
        std::future::ready(Ok(events))
    }

    #[tracing::instrument(skip(self, aggregate_id))]
    fn find_by_etag<'a>(
        &'a self,
        aggregate_id: &'a Self::Id,
        etag: &'a str,
    ) -> impl Future<Output = Result<Option<StoredEvent<Self::Id>>, Self::Error>> + Send + 'a {
        let found = {
            let inner = self.inner.read().expect("in-memory store lock poisoned");
            inner
                .streams
                .iter()
                .filter(|(key, _)| key.aggregate_id() == aggregate_id)
                .flat_map(|(_, stream)| stream.values())
                .find(|event| event.effective_etag() == etag)
                .cloned()
        };
        tracing::trace!(found = found.is_some(), "etag lookup");
        std::future::ready(Ok(found))
    }
}
