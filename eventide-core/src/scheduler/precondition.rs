//! Gating delivery on the existence of a causal event.
//!
//! A [`DeliveryPrecondition`] names an aggregate and the ETag of an event it
//! must have recorded before a scheduled command may be delivered. The
//! scheduler asks a [`PreconditionResolver`] and polls it within the bounded
//! window of a [`PreconditionPolicy`].

use std::{fmt, time::Duration};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use super::SchedulingError;
use crate::store::{EventStore, StoredEvent};

/// "Deliver only once `aggregate_id` has recorded the event tagged `etag`."
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryPrecondition<Id> {
    pub aggregate_id: Id,
    pub etag: String,
}

impl<Id> DeliveryPrecondition<Id> {
    pub fn new(aggregate_id: Id, etag: impl Into<String>) -> Self {
        Self {
            aggregate_id,
            etag: etag.into(),
        }
    }

    /// Precondition on a stored event. Events stored without an ETag are
    /// referenced by their deterministic effective ETag.
    pub fn for_event(event: &StoredEvent<Id>) -> Self
    where
        Id: Clone + fmt::Display,
    {
        Self {
            aggregate_id: event.aggregate_id.clone(),
            etag: event.effective_etag(),
        }
    }

    /// Reject preconditions that could never be satisfied.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulingError::InvalidPrecondition`] when the aggregate id
    /// or the ETag is empty.
    pub fn validate(&self) -> Result<(), SchedulingError>
    where
        Id: fmt::Display,
    {
        if self.aggregate_id.to_string().trim().is_empty() {
            return Err(SchedulingError::InvalidPrecondition {
                reason: "aggregate id is empty",
            });
        }
        if self.etag.trim().is_empty() {
            return Err(SchedulingError::InvalidPrecondition {
                reason: "etag is empty",
            });
        }
        Ok(())
    }
}

impl<Id: fmt::Display> fmt::Display for DeliveryPrecondition<Id> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.aggregate_id, self.etag)
    }
}

/// How long delivery waits for a precondition, and how often it checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreconditionPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for PreconditionPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl PreconditionPolicy {
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Answers whether a precondition's causal event exists yet.
pub trait PreconditionResolver<Id>: Send + Sync {
    fn is_satisfied<'a>(
        &'a self,
        precondition: &'a DeliveryPrecondition<Id>,
    ) -> BoxFuture<'a, anyhow::Result<bool>>;
}

/// Resolves preconditions by looking the ETag up in an event store.
#[derive(Clone, Debug)]
pub struct EventStoreResolver<S> {
    store: S,
}

impl<S> EventStoreResolver<S> {
    pub const fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S> PreconditionResolver<S::Id> for EventStoreResolver<S>
where
    S: EventStore,
{
    fn is_satisfied<'a>(
        &'a self,
        precondition: &'a DeliveryPrecondition<S::Id>,
    ) -> BoxFuture<'a, anyhow::Result<bool>> {
        Box::pin(async move {
            let found = self
                .store
                .find_by_etag(&precondition.aggregate_id, &precondition.etag)
                .await?;
            Ok(found.is_some())
        })
    }
}

/// Poll `resolver` until the precondition holds or `policy.timeout` passes.
///
/// Returns `Ok(false)` when the window closes unsatisfied.
///
/// # Errors
///
/// Propagates the first resolver error.
pub async fn wait_for<Id>(
    resolver: &dyn PreconditionResolver<Id>,
    precondition: &DeliveryPrecondition<Id>,
    policy: &PreconditionPolicy,
) -> anyhow::Result<bool>
where
    Id: fmt::Display,
{
    let deadline = tokio::time::Instant::now() + policy.timeout;
    let mut polls = 0_u32;
    loop {
        polls += 1;
        if resolver.is_satisfied(precondition).await? {
            tracing::trace!(%precondition, polls, "precondition satisfied");
            return Ok(true);
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            tracing::debug!(%precondition, polls, "precondition not satisfied within window");
            return Ok(false);
        }
        let pause = policy.poll_interval.min(deadline - now);
        tokio::time::sleep(pause.max(Duration::from_millis(1))).await;
    }
}
