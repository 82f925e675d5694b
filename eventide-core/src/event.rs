//! Domain event markers and the event envelope.
//!
//! `DomainEvent` is the lightweight trait every concrete event struct
//! implements. Event sum types (the `Aggregate::Event` enums) implement
//! [`EventKind`] so each instance reports its discriminator. The
//! [`EventEnvelope`] pairs a payload with the facts the engine tracks about
//! it: owning aggregate, sequence number, timestamp and ETag.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Sequence number carried by an envelope that has not been placed in a
/// sequence yet. Real sequence numbers start at 1.
pub const UNASSIGNED: u64 = 0;

/// Namespace for ETags derived from an event's position.
const DERIVED_ETAG_NAMESPACE: Uuid = Uuid::from_u128(0x5f0c_2a4e_9b7d_4c1e_8a36_d2f1_7e90_b4c3);

/// Namespace for ETags of the second and later events a command produces.
const FOLLOW_ON_ETAG_NAMESPACE: Uuid = Uuid::from_u128(0x9a1d_64f0_3c2b_4e87_b5a9_0e6c_d8f2_1a47);

/// Marker trait for individual event types.
///
/// Each event carries a unique [`Self::KIND`] identifier. The discriminator
/// is persisted next to the payload and is what scheduling and idempotency
/// checks see of an event; the rest of the payload stays opaque to them.
pub trait DomainEvent {
    const KIND: &'static str;
}

/// Instance-level access to an event's discriminator.
///
/// Blanket-implemented for every [`DomainEvent`]. Event enums implement it
/// by hand, usually by matching on the variant:
///
/// ```ignore
/// impl EventKind for AccountEvent {
///     fn kind(&self) -> &'static str {
///         match self {
///             Self::Opened(_) => AccountOpened::KIND,
///             Self::Deposited(_) => FundsDeposited::KIND,
///         }
///     }
/// }
/// ```
pub trait EventKind {
    fn kind(&self) -> &'static str;
}

impl<T: DomainEvent> EventKind for T {
    fn kind(&self) -> &'static str {
        T::KIND
    }
}

/// An event together with its position in an aggregate's history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<Id, E> {
    pub aggregate_id: Id,
    /// Position within the aggregate; [`UNASSIGNED`] until the event joins a
    /// sequence.
    pub sequence_number: u64,
    pub timestamp: DateTime<Utc>,
    /// Idempotency token. Unique per aggregate when present.
    pub etag: Option<String>,
    pub event: E,
}

impl<Id, E> EventEnvelope<Id, E> {
    /// Wrap an event without a sequence number or ETag.
    pub fn new(aggregate_id: Id, timestamp: DateTime<Utc>, event: E) -> Self {
        Self {
            aggregate_id,
            sequence_number: UNASSIGNED,
            timestamp,
            etag: None,
            event,
        }
    }

    #[must_use]
    pub const fn at(mut self, sequence_number: u64) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    #[must_use]
    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn kind(&self) -> &'static str
    where
        E: EventKind,
    {
        self.event.kind()
    }
}

/// Deterministic ETag for an event that was stored without one.
///
/// The same `(aggregate kind, aggregate id, sequence number)` always yields
/// the same token, so a precondition can name an event before anyone has
/// given it an explicit ETag.
pub fn derived_etag(
    aggregate_kind: &str,
    aggregate_id: &impl fmt::Display,
    sequence_number: u64,
) -> String {
    let name = format!("{aggregate_kind}/{aggregate_id}/{sequence_number}");
    Uuid::new_v5(&DERIVED_ETAG_NAMESPACE, name.as_bytes()).to_string()
}

/// ETag for the `index`-th event (counting from 0) enacted by the command
/// carrying `token`. Index 0 is the token itself.
///
/// Later events get a UUID v5 of the token and index rather than a textual
/// suffix, so no caller-chosen token can spell another command's follow-on
/// ETag.
pub fn follow_on_etag(token: &str, index: usize) -> String {
    if index == 0 {
        return token.to_string();
    }
    let name = format!("{}:{token}:{index}", token.len());
    Uuid::new_v5(&FOLLOW_ON_ETAG_NAMESPACE, name.as_bytes()).to_string()
}

/// Error returned when an event payload cannot be serialized for storage.
#[derive(Debug, Error)]
#[error("failed to encode `{kind}` event: {source}")]
pub struct EventEncodeError {
    pub kind: String,
    #[source]
    pub source: serde_json::Error,
}

/// Error returned when deserializing a stored event fails.
#[derive(Debug, Error)]
#[error("failed to decode `{kind}` event at sequence {sequence_number}: {source}")]
pub struct EventDecodeError {
    /// Discriminator of the stored event.
    pub kind: String,
    pub sequence_number: u64,
    #[source]
    pub source: serde_json::Error,
}
