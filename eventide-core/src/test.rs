//! Test utilities for event-sourced aggregates and the command scheduler.
//!
//! - [`TestExecutor`]: given/when/then testing for an aggregate in isolation
//! - [`RepositoryTestExt`]: seeding history and simulating concurrent writers
//!   against a real repository
//! - [`DeliveryRecorder`]: a scheduler observer that keeps every delivered
//!   command for later assertions
//!
//! # Unit Testing with [`TestExecutor`]
//!
//! ```ignore
//! use eventide::test::TestExecutor;
//!
//! #[test]
//! fn deposit_produces_event() {
//!     TestExecutor::<Account>::given("acc-1".into(), &[AccountEvent::Opened])
//!         .when(&Deposit::new(10))
//!         .then_expect_events(&[AccountEvent::Deposited(10)]);
//! }
//!
//! #[test]
//! fn closed_account_refuses_deposits() {
//!     TestExecutor::<Account>::given("acc-1".into(), &[AccountEvent::Closed])
//!         .when(&Deposit::new(10))
//!         .then_expect_error_message("account must be open");
//! }
//! ```
//!
//! # Integration Testing with [`RepositoryTestExt`]
//!
//! ```ignore
//! use eventide::test::RepositoryTestExt;
//!
//! repo.seed_events::<Account>(&id, vec![AccountEvent::Opened]).await?;
//!
//! // Another writer gets in first; the next save from a stale copy conflicts.
//! repo.inject_concurrent_event::<Account>(&id, AccountEvent::Deposited(5)).await?;
//! ```

use std::{fmt, future::Future, sync::Mutex};

use nonempty::NonEmpty;
use thiserror::Error;

use crate::{
    aggregate::{Aggregate, Applied, CommandContext, CommandError, EventSourced, Handle},
    clock,
    command::Command,
    event::{EventEncodeError, EventEnvelope},
    repository::Repository,
    scheduler::{CommandResult, SchedulerObserver, ScheduledCommand},
    sequence::SequenceError,
    store::{AppendError, EventStore, StoredEvent},
};

// =============================================================================
// Repository Test Extension Trait
// =============================================================================

/// Error type for seeding operations.
#[derive(Debug, Error)]
pub enum SeedError<Id, StoreError>
where
    Id: fmt::Debug + 'static,
    StoreError: std::error::Error + 'static,
{
    #[error(transparent)]
    Encode(#[from] EventEncodeError),
    /// The store refused the events, including on a sequence collision.
    #[error("failed to persist seeded events: {0}")]
    Append(#[source] AppendError<Id, StoreError>),
}

type SeedResult<S> = Result<(), SeedError<<S as EventStore>::Id, <S as EventStore>::Error>>;

pub trait StoreAccess {
    type Store: EventStore;

    fn store(&self) -> &Self::Store;
}

impl<S: EventStore> StoreAccess for Repository<S> {
    type Store = S;

    fn store(&self) -> &Self::Store {
        self.event_store()
    }
}

/// Extension trait providing test utilities for [`Repository`].
///
/// Every method writes straight to the store, bypassing the command
/// pipeline, so fixtures can be set up without going through aggregate
/// business logic.
pub trait RepositoryTestExt: StoreAccess + Sync {
    /// Append events exactly as given: preset sequence numbers, timestamps
    /// and ETags are kept. Use this to build histories with gaps or
    /// specific dates.
    ///
    /// # Errors
    ///
    /// Returns [`SeedError`] if an event cannot be encoded or the store
    /// refuses the batch.
    fn seed_envelopes<'a, A>(
        &'a self,
        id: &'a <Self::Store as EventStore>::Id,
        envelopes: Vec<EventEnvelope<A::Id, A::Event>>,
    ) -> impl Future<Output = SeedResult<Self::Store>> + Send + 'a
    where
        A: Aggregate<Id = <Self::Store as EventStore>::Id>,
    {
        async move {
            let stored = envelopes
                .iter()
                .map(|envelope| StoredEvent::encode(A::KIND, envelope))
                .collect::<Result<Vec<_>, _>>()?;
            let Some(batch) = NonEmpty::from_vec(stored) else {
                return Ok(());
            };
            self.store()
                .append(A::KIND, id, batch)
                .await
                .map(|_| ())
                .map_err(SeedError::Append)
        }
    }

    /// Append events after whatever the aggregate already has, stamped with
    /// the current clock.
    ///
    /// # Errors
    ///
    /// See [`seed_envelopes`](Self::seed_envelopes).
    fn seed_events<'a, A>(
        &'a self,
        id: &'a <Self::Store as EventStore>::Id,
        events: Vec<A::Event>,
    ) -> impl Future<Output = SeedResult<Self::Store>> + Send + 'a
    where
        A: Aggregate<Id = <Self::Store as EventStore>::Id>,
    {
        let now = clock::now();
        let envelopes = events
            .into_iter()
            .map(|event| EventEnvelope::new(id.clone(), now, event))
            .collect();
        self.seed_envelopes::<A>(id, envelopes)
    }

    /// Append a single event as if from a concurrent writer.
    ///
    /// Any in-memory copy of the aggregate loaded before this call is now
    /// stale, and saving it conflicts.
    ///
    /// # Errors
    ///
    /// See [`seed_envelopes`](Self::seed_envelopes).
    fn inject_concurrent_event<'a, A>(
        &'a self,
        id: &'a <Self::Store as EventStore>::Id,
        event: A::Event,
    ) -> impl Future<Output = SeedResult<Self::Store>> + Send + 'a
    where
        A: Aggregate<Id = <Self::Store as EventStore>::Id>,
    {
        self.seed_events::<A>(id, vec![event])
    }
}

impl<T> RepositoryTestExt for T where T: StoreAccess + Sync {}

// =============================================================================
// Test Framework for Aggregate Unit Testing
// =============================================================================

/// Given/when/then executor for one aggregate instance.
///
/// Commands go through the full pipeline of [`EventSourced::apply`]
/// (validation, authorization, idempotency, version check) without a store.
pub struct TestExecutor<A: Aggregate> {
    aggregate: EventSourced<A>,
    context: CommandContext,
}

impl<A: Aggregate> TestExecutor<A> {
    /// Start from `events` already in the history, numbered from 1.
    ///
    /// Pass `&[]` to start from a fresh aggregate.
    ///
    /// # Panics
    ///
    /// Panics if the events cannot form a history for `id`.
    #[must_use]
    pub fn given(id: A::Id, events: &[A::Event]) -> Self {
        let now = clock::now();
        let history = events
            .iter()
            .zip(1..)
            .map(|(event, sequence_number)| {
                EventEnvelope::new(id.clone(), now, event.clone()).at(sequence_number)
            })
            .collect::<Vec<_>>();
        let aggregate = EventSourced::from_history(id, history)
            .unwrap_or_else(|err: SequenceError<A::Id>| panic!("invalid given history: {err}"));
        Self {
            aggregate,
            context: CommandContext::default(),
        }
    }

    /// Start from an existing instance, pending events included.
    #[must_use]
    pub fn given_instance(aggregate: EventSourced<A>) -> Self {
        Self {
            aggregate,
            context: CommandContext::default(),
        }
    }

    /// Issue the command under `context` instead of the default one.
    #[must_use]
    pub fn with_context(mut self, context: CommandContext) -> Self {
        self.context = context;
        self
    }

    /// Apply another command first, keeping its events as pending.
    ///
    /// # Panics
    ///
    /// Panics if the command is refused.
    #[must_use]
    #[track_caller]
    pub fn and<C>(mut self, command: &C) -> Self
    where
        C: Command,
        A: Handle<C>,
    {
        if let Err(err) = self.aggregate.apply(command, &self.context) {
            panic!("setup command `{}` was refused: {err}", command.kind());
        }
        self
    }

    /// Execute a command against the aggregate.
    #[must_use]
    pub fn when<C>(mut self, command: &C) -> TestResult<A>
    where
        C: Command,
        A: Handle<C>,
    {
        let result = self.aggregate.apply(command, &self.context);
        TestResult {
            aggregate: self.aggregate,
            result,
        }
    }
}

/// Result of executing a command, ready for assertions.
pub struct TestResult<A: Aggregate> {
    aggregate: EventSourced<A>,
    result: Result<Applied<A::Id, A::Event>, CommandError<A::Error>>,
}

impl<A: Aggregate> TestResult<A> {
    /// Assert that the command produced exactly the expected events.
    ///
    /// # Panics
    ///
    /// Panics if the command was refused, was already applied, or produced
    /// different events.
    #[track_caller]
    pub fn then_expect_events(self, expected: &[A::Event])
    where
        A::Event: PartialEq,
    {
        match self.result {
            Ok(Applied::Enacted(envelopes)) => {
                let events: Vec<_> = envelopes.into_iter().map(|e| e.event).collect();
                assert_eq!(events, expected, "Expected events did not match actual events");
            }
            Ok(Applied::AlreadyApplied) => {
                panic!("Expected events but the command was already applied");
            }
            Err(error) => {
                panic!("Expected events but got error: {error}");
            }
        }
    }

    /// Assert that the command was accepted but produced nothing, either
    /// because it was already applied or because it enacted no events.
    ///
    /// # Panics
    ///
    /// Panics if the command was refused or produced events.
    #[track_caller]
    pub fn then_expect_no_events(self) {
        match self.result {
            Ok(Applied::AlreadyApplied) => {}
            Ok(Applied::Enacted(events)) => {
                assert!(events.is_empty(), "Expected no events but got: {events:?}");
            }
            Err(error) => {
                panic!("Expected no events but got error: {error}");
            }
        }
    }

    /// Assert that the idempotency check short-circuited the command.
    ///
    /// # Panics
    ///
    /// Panics otherwise.
    #[track_caller]
    pub fn then_expect_already_applied(self) {
        match self.result {
            Ok(Applied::AlreadyApplied) => {}
            Ok(Applied::Enacted(events)) => {
                panic!("Expected an idempotent no-op but got events: {events:?}");
            }
            Err(error) => {
                panic!("Expected an idempotent no-op but got error: {error}");
            }
        }
    }

    /// Assert that the command was refused.
    ///
    /// # Panics
    ///
    /// Panics if the command succeeded.
    #[track_caller]
    pub fn then_expect_error(self) {
        if let Ok(applied) = self.result {
            panic!("Expected error but got: {applied:?}");
        }
    }

    /// Assert that the aggregate itself rejected the command with `expected`.
    ///
    /// # Panics
    ///
    /// Panics if the command succeeded or failed another way.
    #[track_caller]
    pub fn then_expect_rejection(self, expected: &A::Error)
    where
        A::Error: PartialEq,
    {
        match self.result {
            Err(CommandError::Rejected(error)) => {
                assert_eq!(error, *expected, "Expected error did not match actual error");
            }
            Err(other) => panic!("Expected rejection but got: {other}"),
            Ok(applied) => panic!("Expected rejection but got: {applied:?}"),
        }
    }

    /// Assert that the command was refused with a message containing
    /// `expected_substring`.
    ///
    /// # Panics
    ///
    /// Panics if the command succeeded or the message doesn't match.
    #[track_caller]
    pub fn then_expect_error_message(self, expected_substring: &str) {
        match self.result {
            Ok(applied) => {
                panic!("Expected error but got: {applied:?}");
            }
            Err(error) => {
                let error_msg = error.to_string();
                assert!(
                    error_msg.contains(expected_substring),
                    "Expected error message to contain '{expected_substring}' but got: {error_msg}"
                );
            }
        }
    }

    /// The aggregate after the command, for assertions on state.
    pub const fn aggregate(&self) -> &EventSourced<A> {
        &self.aggregate
    }

    /// Get the raw result for custom assertions.
    ///
    /// # Errors
    ///
    /// Returns the command error, if any.
    pub fn inspect_result(self) -> Result<Applied<A::Id, A::Event>, CommandError<A::Error>> {
        self.result
    }
}

// =============================================================================
// Scheduler observation
// =============================================================================

/// Keeps a copy of every command the scheduler finished delivering.
pub struct DeliveryRecorder<Id, C> {
    delivered: Mutex<Vec<ScheduledCommand<Id, C>>>,
}

impl<Id, C> Default for DeliveryRecorder<Id, C> {
    fn default() -> Self {
        Self {
            delivered: Mutex::new(Vec::new()),
        }
    }
}

impl<Id: Clone, C: Clone> DeliveryRecorder<Id, C> {
    pub fn delivered(&self) -> Vec<ScheduledCommand<Id, C>> {
        self.delivered
            .lock()
            .expect("delivery recorder lock poisoned")
            .clone()
    }

    /// Results of every delivery so far, in delivery order.
    pub fn results(&self) -> Vec<CommandResult> {
        self.delivered()
            .iter()
            .filter_map(|command| command.result().cloned())
            .collect()
    }

    pub fn succeeded(&self) -> usize {
        self.delivered()
            .iter()
            .filter(|command| command.succeeded())
            .count()
    }

    pub fn failed(&self) -> usize {
        self.delivered()
            .iter()
            .filter(|command| command.failure().is_some())
            .count()
    }
}

impl<Id, C> SchedulerObserver<Id, C> for DeliveryRecorder<Id, C>
where
    Id: Clone + Send,
    C: Clone + Send,
{
    fn on_delivered(&self, command: &ScheduledCommand<Id, C>) {
        self.delivered
            .lock()
            .expect("delivery recorder lock poisoned")
            .push(command.clone());
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::{
        command::{Etag, RuleViolation},
        event::EventKind,
    };

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    enum CounterEvent {
        Added(i32),
        Frozen,
    }

    impl EventKind for CounterEvent {
        fn kind(&self) -> &'static str {
            match self {
                Self::Added(_) => "counter-added",
                Self::Frozen => "counter-frozen",
            }
        }
    }

    #[derive(Debug, Default)]
    struct Counter {
        value: i32,
        frozen: bool,
    }

    impl Aggregate for Counter {
        type Error = String;
        type Event = CounterEvent;
        type Id = String;

        const KIND: &'static str = "counter";

        fn apply(&mut self, event: &CounterEvent) {
            match event {
                CounterEvent::Added(n) => self.value += n,
                CounterEvent::Frozen => self.frozen = true,
            }
        }
    }

    #[derive(Debug, Clone)]
    struct Add {
        amount: i32,
        etag: Etag,
    }

    impl Add {
        fn new(amount: i32) -> Self {
            Self {
                amount,
                etag: Etag::generate(),
            }
        }
    }

    impl Command for Add {
        fn kind(&self) -> &'static str {
            "add"
        }

        fn etag(&self) -> &str {
            self.etag.as_str()
        }
    }

    impl Handle<Add> for Counter {
        fn validate(&self, _: &Add) -> Result<(), RuleViolation> {
            if self.frozen {
                return Err(RuleViolation::new("counter is frozen"));
            }
            Ok(())
        }

        fn handle(&self, command: &Add) -> Result<Vec<CounterEvent>, String> {
            if self.value + command.amount < 0 {
                return Err("counter cannot go negative".into());
            }
            Ok(vec![CounterEvent::Added(command.amount)])
        }
    }

    #[test]
    fn given_when_then_produces_events() {
        TestExecutor::<Counter>::given("c-1".into(), &[])
            .when(&Add::new(5))
            .then_expect_events(&[CounterEvent::Added(5)]);
    }

    #[test]
    fn history_feeds_validation() {
        TestExecutor::<Counter>::given("c-1".into(), &[CounterEvent::Frozen])
            .when(&Add::new(5))
            .then_expect_error_message("counter is frozen");
    }

    #[test]
    fn rejection_is_reported() {
        TestExecutor::<Counter>::given("c-1".into(), &[CounterEvent::Added(2)])
            .when(&Add::new(-3))
            .then_expect_rejection(&"counter cannot go negative".to_string());
    }

    #[test]
    fn repeated_command_is_already_applied() {
        let add = Add::new(1);
        TestExecutor::<Counter>::given("c-1".into(), &[])
            .and(&add)
            .when(&add)
            .then_expect_already_applied();
    }

    #[test]
    fn result_exposes_resulting_state() {
        let result = TestExecutor::<Counter>::given("c-1".into(), &[CounterEvent::Added(2)])
            .when(&Add::new(3));
        assert_eq!(result.aggregate().state().value, 5);
        assert_eq!(result.aggregate().version(), 2);
    }

    #[test]
    #[should_panic(expected = "Expected events did not match")]
    fn mismatched_events_panic() {
        TestExecutor::<Counter>::given("c-1".into(), &[])
            .when(&Add::new(5))
            .then_expect_events(&[CounterEvent::Added(6)]);
    }

    #[test]
    fn recorder_counts_outcomes() {
        use crate::scheduler::CommandFailed;

        let recorder = DeliveryRecorder::<String, ()>::default();
        let mut ok = ScheduledCommand::new("t-1".to_string(), ());
        ok.set_result(CommandResult::Succeeded);
        let mut failed = ScheduledCommand::new("t-2".to_string(), ());
        failed.set_result(CommandResult::Failed(CommandFailed::new("boom", 1)));

        recorder.on_delivered(&ok);
        recorder.on_delivered(&failed);

        assert_eq!(recorder.succeeded(), 1);
        assert_eq!(recorder.failed(), 1);
        assert_eq!(recorder.results().len(), 2);
    }
}
