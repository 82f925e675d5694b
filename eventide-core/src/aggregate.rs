//! Command-side domain primitives.
//!
//! This module defines the building blocks for aggregates: state
//! reconstruction (`Apply`), command handling (`Handle`), and the
//! [`EventSourced`] wrapper that runs the command pipeline and tracks
//! committed history next to pending events.

use std::{fmt, hash::Hash, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::{
    auth::{AllowAll, Authorizer, Principal, Resource},
    clock::{self, Clock},
    command::{Command, RuleViolation},
    event::{EventEnvelope, EventKind, follow_on_etag},
    idempotency::BloomFilter,
    sequence::{EventSequence, SequenceError},
};

/// Command-side entities that produce domain events.
///
/// Aggregates rebuild their state from events (`Apply<E>`) and validate
/// commands via [`Handle<C>`]. State must be a pure fold over the event
/// history: replaying the same events always yields the same state.
// ANCHOR: aggregate_trait
pub trait Aggregate: Default + Sized {
    /// Aggregate type identifier used by the event store.
    ///
    /// This is combined with the aggregate ID to create stream identifiers.
    /// Use lowercase, kebab-case for consistency: `"product"`,
    /// `"user-account"`, etc.
    const KIND: &'static str;

    type Id: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static;
    type Event: EventKind
        + Clone
        + fmt::Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static;
    type Error: fmt::Display + fmt::Debug;

    /// Apply an event to update aggregate state.
    ///
    /// This is called during event replay to rebuild aggregate state from
    /// history, and again for each newly enacted event. Implementations
    /// usually match on the event enum and dispatch to `Apply<E>`.
    fn apply(&mut self, event: &Self::Event);
}
// ANCHOR_END: aggregate_trait

/// Mutate an aggregate with a domain event.
///
/// ```ignore
/// #[derive(Default)]
/// struct Account {
///     balance: i64,
/// }
///
/// impl Apply<FundsDeposited> for Account {
///     fn apply(&mut self, event: &FundsDeposited) {
///         self.balance += event.amount;
///     }
/// }
/// ```
// ANCHOR: apply_trait
pub trait Apply<E> {
    fn apply(&mut self, event: &E);
}
// ANCHOR_END: apply_trait

/// Entry point for command handling.
///
/// Each command type gets its own implementation, letting the aggregate
/// express validation and enactment in a strongly typed way. Aggregates that
/// support compensation can return a failure event from `handle` instead of
/// an error.
///
/// ```ignore
/// impl Handle<DepositFunds> for Account {
///     fn validate(&self, _: &DepositFunds) -> Result<(), RuleViolation> {
///         if !self.open {
///             return Err(RuleViolation::new("account must be open"));
///         }
///         Ok(())
///     }
///
///     fn handle(&self, command: &DepositFunds) -> Result<Vec<Self::Event>, Self::Error> {
///         Ok(vec![FundsDeposited { amount: command.amount }.into()])
///     }
/// }
/// ```
// ANCHOR: handle_trait
pub trait Handle<C>: Aggregate {
    /// Check the command against the current state.
    ///
    /// # Errors
    ///
    /// Returns the violated rule.
    fn validate(&self, _command: &C) -> Result<(), RuleViolation> {
        Ok(())
    }

    /// Handle a command and produce events.
    ///
    /// # Errors
    ///
    /// Returns `Self::Error` if the command is invalid for the current
    /// aggregate state.
    fn handle(&self, command: &C) -> Result<Vec<Self::Event>, Self::Error>;
}
// ANCHOR_END: handle_trait

/// Who is issuing a command, which clock stamps its events, and which
/// authorizer vets it.
#[derive(Clone)]
pub struct CommandContext {
    principal: Principal,
    clock: Option<Arc<dyn Clock>>,
    authorizer: Arc<dyn Authorizer>,
}

impl Default for CommandContext {
    fn default() -> Self {
        Self {
            principal: Principal::anonymous(),
            clock: None,
            authorizer: Arc::new(AllowAll),
        }
    }
}

impl CommandContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = principal;
        self
    }

    /// Pin the clock. Without one, events are stamped by [`clock::now`],
    /// which honours the clock scoped to the current task.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub const fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.as_ref().map_or_else(clock::now, |c| c.now())
    }
}

impl fmt::Debug for CommandContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandContext")
            .field("principal", &self.principal)
            .field("pinned_clock", &self.clock.is_some())
            .finish_non_exhaustive()
    }
}

/// A command or the target's state broke a rule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("`{command}` on {aggregate_kind} {aggregate_id} violates rule: {rule}")]
pub struct ValidationFailure {
    pub aggregate_kind: String,
    pub aggregate_id: String,
    pub command: String,
    pub rule: String,
}

/// The principal may not issue the command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{principal} is not authorized to `{command}` {aggregate_kind} {aggregate_id}")]
pub struct AuthorizationFailure {
    pub principal: String,
    pub aggregate_kind: String,
    pub aggregate_id: String,
    pub command: String,
}

/// Why [`EventSourced::apply`] refused a command. No state changed.
#[derive(Debug, Error)]
pub enum CommandError<AggregateError> {
    #[error(transparent)]
    Validation(#[from] ValidationFailure),
    #[error(transparent)]
    Authorization(#[from] AuthorizationFailure),
    #[error(
        "`{command}` was issued against version {expected} but the aggregate is at {actual} \
         (hint: reload and reissue)"
    )]
    StaleVersion {
        command: String,
        expected: u64,
        actual: u64,
    },
    #[error(
        "`{command}` would record etag `{etag}`, which this aggregate already holds \
         (hint: issue the command with a fresh token)"
    )]
    EtagCollision { command: String, etag: String },
    #[error("`{command}` cannot number its events past version {version}")]
    SequenceExhausted { command: String, version: u64 },
    #[error("aggregate rejected command: {0}")]
    Rejected(AggregateError),
}

/// Outcome of a successful [`EventSourced::apply`].
#[derive(Debug, Clone, PartialEq)]
pub enum Applied<Id, E> {
    /// The command ran; these events are now pending.
    Enacted(Vec<EventEnvelope<Id, E>>),
    /// The command's token was already recorded on this aggregate.
    AlreadyApplied,
}

impl<Id, E> Applied<Id, E> {
    pub const fn is_already_applied(&self) -> bool {
        matches!(self, Self::AlreadyApplied)
    }
}

/// An aggregate instance together with its history.
///
/// Events produced by [`apply`](Self::apply) stay pending until a repository
/// saves them; only then do they join the committed history.
#[derive(Clone, Debug)]
pub struct EventSourced<A: Aggregate> {
    id: A::Id,
    state: A,
    history: EventSequence<A::Id, A::Event>,
    pending: Vec<EventEnvelope<A::Id, A::Event>>,
    tokens: BloomFilter,
}

impl<A: Aggregate> EventSourced<A> {
    /// A fresh instance with no history.
    pub fn new(id: A::Id) -> Self {
        Self {
            history: EventSequence::new(id.clone()),
            id,
            state: A::default(),
            pending: Vec::new(),
            tokens: BloomFilter::default(),
        }
    }

    /// Rehydrate by folding `events` in sequence order.
    ///
    /// # Errors
    ///
    /// Returns [`SequenceError`] if the events do not form a valid sequence
    /// for `id`.
    pub fn from_history(
        id: A::Id,
        events: impl IntoIterator<Item = EventEnvelope<A::Id, A::Event>>,
    ) -> Result<Self, SequenceError<A::Id>> {
        let history = EventSequence::from_events(id.clone(), events)?;
        let tokens = BloomFilter::default();
        let mut state = A::default();
        for envelope in history.iter() {
            state.apply(&envelope.event);
            if let Some(etag) = &envelope.etag {
                tokens.insert(etag);
            }
        }
        Ok(Self {
            id,
            state,
            history,
            pending: Vec::new(),
            tokens,
        })
    }

    pub const fn id(&self) -> &A::Id {
        &self.id
    }

    pub const fn state(&self) -> &A {
        &self.state
    }

    /// Highest sequence number, counting pending events.
    pub fn version(&self) -> u64 {
        self.pending
            .last()
            .map_or_else(|| self.history.version(), |e| e.sequence_number)
    }

    pub const fn history(&self) -> &EventSequence<A::Id, A::Event> {
        &self.history
    }

    pub fn pending_events(&self) -> &[EventEnvelope<A::Id, A::Event>] {
        &self.pending
    }

    /// Whether a command with this token has already been enacted here.
    pub fn has_applied(&self, token: &str) -> bool {
        if !self.tokens.might_contain(token) {
            return false;
        }
        self.history.contains_etag(token)
            || self
                .pending
                .iter()
                .any(|e| e.etag.as_deref() == Some(token))
    }

    /// Run the command pipeline.
    ///
    /// In order: target-state validation, command self-validation,
    /// authorization, the idempotency short-circuit, the command's version
    /// check, then enactment. The first event produced carries the command's
    /// token as its ETag; further events carry [`follow_on_etag`]s derived
    /// from it.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] when any step refuses the command. State and
    /// pending events are untouched in that case.
    pub fn apply<C>(
        &mut self,
        command: &C,
        context: &CommandContext,
    ) -> Result<Applied<A::Id, A::Event>, CommandError<A::Error>>
    where
        C: Command,
        A: Handle<C>,
    {
        let id = self.id.to_string();
        let kind = command.kind();
        let validation = |violation: RuleViolation| ValidationFailure {
            aggregate_kind: A::KIND.to_string(),
            aggregate_id: id.clone(),
            command: kind.to_string(),
            rule: violation.rule,
        };

        Handle::<C>::validate(&self.state, command).map_err(validation)?;
        command.validate().map_err(validation)?;

        let resource = Resource {
            kind: A::KIND,
            id: &id,
        };
        if !context
            .authorizer
            .is_authorized(&context.principal, kind, &resource)
        {
            return Err(AuthorizationFailure {
                principal: context.principal.to_string(),
                aggregate_kind: A::KIND.to_string(),
                aggregate_id: id,
                command: kind.to_string(),
            }
            .into());
        }

        let token = command.etag();
        if !token.is_empty() && self.has_applied(token) {
            tracing::trace!(
                aggregate_kind = A::KIND,
                aggregate_id = %id,
                command = kind,
                token,
                "command already applied"
            );
            return Ok(Applied::AlreadyApplied);
        }

        if let Some(expected) = command.applies_to_version() {
            let actual = self.version();
            if expected != actual {
                return Err(CommandError::StaleVersion {
                    command: kind.to_string(),
                    expected,
                    actual,
                });
            }
        }

        let events = Handle::<C>::handle(&self.state, command).map_err(CommandError::Rejected)?;

        // Stage every envelope first so a colliding ETag refuses the whole
        // command before state or pending events change.
        let timestamp = context.now();
        let version = self.version();
        let mut enacted = Vec::with_capacity(events.len());
        for (index, event) in events.into_iter().enumerate() {
            let sequence_number = u64::try_from(index)
                .ok()
                .and_then(|offset| version.checked_add(offset)?.checked_add(1))
                .ok_or_else(|| CommandError::SequenceExhausted {
                    command: kind.to_string(),
                    version,
                })?;
            let mut envelope =
                EventEnvelope::new(self.id.clone(), timestamp, event).at(sequence_number);
            if !token.is_empty() {
                let etag = follow_on_etag(token, index);
                if self.has_applied(&etag) {
                    return Err(CommandError::EtagCollision {
                        command: kind.to_string(),
                        etag,
                    });
                }
                envelope.etag = Some(etag);
            }
            enacted.push(envelope);
        }

        for envelope in &enacted {
            if let Some(etag) = &envelope.etag {
                self.tokens.insert(etag);
            }
            self.state.apply(&envelope.event);
            self.pending.push(envelope.clone());
        }

        tracing::debug!(
            aggregate_kind = A::KIND,
            aggregate_id = %id,
            command = kind,
            events = enacted.len(),
            "command enacted"
        );
        Ok(Applied::Enacted(enacted))
    }

    /// History as it would be once the pending events join it.
    ///
    /// # Errors
    ///
    /// Returns [`SequenceError`] if any pending event cannot join; the
    /// aggregate itself is untouched.
    pub(crate) fn staged_history(
        &self,
    ) -> Result<EventSequence<A::Id, A::Event>, SequenceError<A::Id>> {
        let mut staged = self.history.clone();
        for envelope in &self.pending {
            staged.add(envelope.clone())?;
        }
        Ok(staged)
    }

    /// Move pending events into the committed history, all or none.
    #[cfg(test)]
    pub(crate) fn commit_pending(&mut self) -> Result<(), SequenceError<A::Id>> {
        let staged = self.staged_history()?;
        self.commit(staged);
        Ok(())
    }

    /// Replace the history with `staged` (from
    /// [`staged_history`](Self::staged_history)) and drop pending events.
    pub(crate) fn commit(&mut self, staged: EventSequence<A::Id, A::Event>) {
        self.history = staged;
        self.pending.clear();
    }
}
