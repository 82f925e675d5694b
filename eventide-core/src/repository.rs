//! Application service orchestration.
//!
//! `Repository` coordinates loading aggregates, running the command
//! pipeline, appending resulting events to the store, and notifying an
//! optional publisher of what was stored.

use std::{fmt, future::Future, sync::Arc};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use nonempty::NonEmpty;
use thiserror::Error;

use crate::{
    aggregate::{Aggregate, Applied, CommandContext, CommandError, EventSourced, Handle},
    command::Command,
    concurrency::ConcurrencyConflict,
    event::{EventDecodeError, EventEncodeError},
    sequence::SequenceError,
    store::{AppendError, EventFilter, EventStore, StoredEvent},
};

/// Error rebuilding an aggregate from the store.
#[derive(Debug, Error)]
pub enum LoadError<Id, StoreError>
where
    Id: fmt::Debug + 'static,
    StoreError: std::error::Error + 'static,
{
    #[error("failed to load events: {0}")]
    Store(#[source] StoreError),
    #[error(transparent)]
    Decode(#[from] EventDecodeError),
    #[error("stored history is inconsistent: {0}")]
    Sequence(#[source] SequenceError<Id>),
}

/// Error saving pending events.
#[derive(Debug, Error)]
pub enum SaveError<Id, StoreError>
where
    Id: fmt::Debug + 'static,
    StoreError: std::error::Error + 'static,
{
    #[error(transparent)]
    Concurrency(ConcurrencyConflict<Id>),
    #[error(transparent)]
    Encode(#[from] EventEncodeError),
    #[error("failed to persist events: {0}")]
    Store(#[source] StoreError),
    #[error("pending events cannot join the aggregate's history: {0}")]
    Sequence(#[source] SequenceError<Id>),
}

impl<Id, StoreError> From<AppendError<Id, StoreError>> for SaveError<Id, StoreError>
where
    Id: fmt::Debug + 'static,
    StoreError: std::error::Error + 'static,
{
    fn from(err: AppendError<Id, StoreError>) -> Self {
        match err {
            AppendError::Conflict(conflict) => Self::Concurrency(conflict),
            AppendError::Store(err) => Self::Store(err),
        }
    }
}

/// Error from [`Repository::apply`].
#[derive(Debug, Error)]
pub enum ApplyError<Id, AggregateError, StoreError>
where
    Id: fmt::Debug + 'static,
    AggregateError: fmt::Debug + fmt::Display,
    StoreError: std::error::Error + 'static,
{
    #[error("failed to rebuild aggregate state: {0}")]
    Load(#[source] LoadError<Id, StoreError>),
    #[error(transparent)]
    Command(CommandError<AggregateError>),
    #[error(transparent)]
    Save(SaveError<Id, StoreError>),
}

impl<Id, AggregateError, StoreError> ApplyError<Id, AggregateError, StoreError>
where
    Id: fmt::Debug + 'static,
    AggregateError: fmt::Debug + fmt::Display,
    StoreError: std::error::Error + 'static,
{
    /// Whether the save lost a race with another writer.
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Save(SaveError::Concurrency(_)))
    }
}

/// Result type alias for loads.
pub type LoadResult<A, S> = Result<
    Option<EventSourced<A>>,
    LoadError<<S as EventStore>::Id, <S as EventStore>::Error>,
>;

/// Result type alias for saves.
pub type SaveResult<S> = Result<(), SaveError<<S as EventStore>::Id, <S as EventStore>::Error>>;

/// Result type alias for [`Repository::apply`].
pub type ApplyResult<A, S> = Result<
    Applied<<A as Aggregate>::Id, <A as Aggregate>::Event>,
    ApplyError<<S as EventStore>::Id, <A as Aggregate>::Error, <S as EventStore>::Error>,
>;

/// Result type alias for retry operations.
pub type RetryResult<A, S> = Result<
    usize,
    ApplyError<<S as EventStore>::Id, <A as Aggregate>::Error, <S as EventStore>::Error>,
>;

/// Receives events after they are stored.
///
/// Publishing is how event-triggered work starts: a publisher may schedule
/// further commands, which may store more events in turn.
pub trait EventPublisher<Id>: Send + Sync {
    fn publish(&self, events: Vec<StoredEvent<Id>>) -> BoxFuture<'_, ()>;
}

impl<Id, F, Fut> EventPublisher<Id> for F
where
    F: Fn(Vec<StoredEvent<Id>>) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn publish(&self, events: Vec<StoredEvent<Id>>) -> BoxFuture<'_, ()> {
        Box::pin(self(events))
    }
}

/// Loads and saves event-sourced aggregates through an [`EventStore`].
///
/// The repository owns the store and an optional [`EventPublisher`]. Loads
/// rebuild an [`EventSourced`] aggregate by replaying its stream, in full or
/// up to a version or date. Saves append the aggregate's pending events as
/// one all-or-nothing batch and then hand the stored events to the
/// publisher.
///
/// ```
/// use eventide_core::{
///     repository::Repository,
///     store::{StoredEvent, inmemory},
/// };
///
/// let repository = Repository::new(inmemory::Store::<String>::new())
///     .with_publisher(|events: Vec<StoredEvent<String>>| async move {
///         tracing::debug!(stored = events.len(), "published");
///     });
/// # let _ = repository;
/// ```
pub struct Repository<S>
where
    S: EventStore,
{
    pub(crate) store: S,
    publisher: Option<Arc<dyn EventPublisher<S::Id>>>,
}

impl<S> Repository<S>
where
    S: EventStore,
{
    #[must_use]
    pub const fn new(store: S) -> Self {
        Self {
            store,
            publisher: None,
        }
    }

    #[must_use]
    pub const fn event_store(&self) -> &S {
        &self.store
    }

    /// Notify `publisher` of every successful save.
    #[must_use]
    pub fn with_publisher(mut self, publisher: impl EventPublisher<S::Id> + 'static) -> Self {
        self.publisher = Some(Arc::new(publisher));
        self
    }

    async fn load_filtered<A>(&self, id: &S::Id, filter: EventFilter) -> LoadResult<A, S>
    where
        A: Aggregate<Id = S::Id>,
    {
        let stored = self
            .store
            .load(A::KIND, id, &filter)
            .await
            .map_err(LoadError::Store)?;
        if stored.is_empty() {
            return Ok(None);
        }

        let envelopes = stored
            .iter()
            .map(StoredEvent::decode::<A::Event>)
            .collect::<Result<Vec<_>, _>>()?;
        let aggregate =
            EventSourced::from_history(id.clone(), envelopes).map_err(LoadError::Sequence)?;
        tracing::trace!(
            aggregate_kind = A::KIND,
            aggregate_id = %id,
            version = aggregate.version(),
            "aggregate rehydrated"
        );
        Ok(Some(aggregate))
    }

    /// Load an aggregate by replaying its full history.
    ///
    /// Returns `None` when no events exist for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError`] if the store fails to load events or if an
    /// event cannot be decoded into the aggregate's event type.
    pub async fn get<A>(&self, id: &S::Id) -> LoadResult<A, S>
    where
        A: Aggregate<Id = S::Id>,
    {
        self.load_filtered(id, EventFilter::all()).await
    }

    /// Load the aggregate as it was at `version`, replaying only events with
    /// `sequence_number <= version`.
    ///
    /// # Errors
    ///
    /// See [`get`](Self::get).
    pub async fn get_version<A>(&self, id: &S::Id, version: u64) -> LoadResult<A, S>
    where
        A: Aggregate<Id = S::Id>,
    {
        self.load_filtered(id, EventFilter::up_to_version(version))
            .await
    }

    /// Load the aggregate as it was at `as_of`, replaying only events with
    /// `timestamp <= as_of`.
    ///
    /// # Errors
    ///
    /// See [`get`](Self::get).
    pub async fn get_as_of_date<A>(&self, id: &S::Id, as_of: DateTime<Utc>) -> LoadResult<A, S>
    where
        A: Aggregate<Id = S::Id>,
    {
        self.load_filtered(id, EventFilter::as_of(as_of)).await
    }

    /// Persist the aggregate's pending events.
    ///
    /// All pending events are appended in one call; if any of their sequence
    /// numbers is already taken the whole save fails with
    /// [`SaveError::Concurrency`] and nothing is written. On success the
    /// events join the aggregate's history and the publisher, if any, is
    /// notified.
    ///
    /// # Errors
    ///
    /// Returns [`SaveError`] when events cannot be encoded or stored.
    #[tracing::instrument(
        skip(self, aggregate),
        fields(aggregate_kind = A::KIND, aggregate_id = %aggregate.id())
    )]
    pub async fn save<A>(&self, aggregate: &mut EventSourced<A>) -> SaveResult<S>
    where
        A: Aggregate<Id = S::Id>,
    {
        let stored = aggregate
            .pending_events()
            .iter()
            .map(|envelope| StoredEvent::encode(A::KIND, envelope))
            .collect::<Result<Vec<_>, _>>()?;
        let Some(batch) = NonEmpty::from_vec(stored.clone()) else {
            return Ok(());
        };
        // Refuse a batch that cannot join the history before it reaches the
        // store.
        let staged = aggregate.staged_history().map_err(SaveError::Sequence)?;

        let id = aggregate.id().clone();
        let result = self.store.append(A::KIND, &id, batch).await?;
        aggregate.commit(staged);
        tracing::debug!(
            events = stored.len(),
            last_sequence_number = result.last_sequence_number,
            "aggregate saved"
        );

        if let Some(publisher) = &self.publisher {
            publisher.publish(stored).await;
        }
        Ok(())
    }

    /// Load the aggregate (or start a fresh one), apply the command and save
    /// whatever it enacted.
    ///
    /// # Errors
    ///
    /// Returns [`ApplyError::Command`] when the pipeline refuses the command,
    /// [`ApplyError::Save`] when saving fails (including a conflict with a
    /// concurrent writer), or [`ApplyError::Load`] when the history cannot
    /// be read.
    #[tracing::instrument(
        skip(self, id, command, context),
        fields(aggregate_kind = A::KIND, aggregate_id = %id, command = command.kind())
    )]
    pub async fn apply<A, C>(
        &self,
        id: &S::Id,
        command: &C,
        context: &CommandContext,
    ) -> ApplyResult<A, S>
    where
        A: Aggregate<Id = S::Id> + Handle<C>,
        C: Command + Sync,
    {
        let mut aggregate = self
            .get::<A>(id)
            .await
            .map_err(ApplyError::Load)?
            .unwrap_or_else(|| EventSourced::new(id.clone()));

        let applied = aggregate
            .apply(command, context)
            .map_err(ApplyError::Command)?;
        if let Applied::Enacted(events) = &applied
            && !events.is_empty()
        {
            self.save(&mut aggregate).await.map_err(ApplyError::Save)?;
        }
        Ok(applied)
    }

    /// Apply a command, reloading and retrying when the save loses a race.
    ///
    /// Returns the number of attempts it took.
    ///
    /// # Errors
    ///
    /// Returns the last error if all retries are exhausted, or a
    /// non-concurrency error immediately.
    pub async fn apply_with_retry<A, C>(
        &self,
        id: &S::Id,
        command: &C,
        context: &CommandContext,
        max_retries: usize,
    ) -> RetryResult<A, S>
    where
        A: Aggregate<Id = S::Id> + Handle<C>,
        C: Command + Sync,
    {
        for attempt in 1..=max_retries {
            match self.apply::<A, C>(id, command, context).await {
                Ok(_) => return Ok(attempt),
                Err(e) if e.is_conflict() => {
                    tracing::debug!(attempt, "concurrency conflict, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        self.apply::<A, C>(id, command, context)
            .await
            .map(|_| max_retries + 1)
    }
}
