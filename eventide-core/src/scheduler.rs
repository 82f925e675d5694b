//! Idempotent, retryable command scheduling.
//!
//! A [`CommandScheduler`] serves one target kind. `schedule` deduplicates by
//! `(target kind, target id, token)` and either delivers at once or registers
//! delivery with the scheduler's [`Clock`] for the due time. `deliver` waits
//! for any precondition, looks up the handler, and enacts the command inside
//! a clock scope so domain code reading [`clock::now`] sees the scheduler's
//! time. Delivery failures are recorded on the command as data and never
//! reach the caller of `schedule`.
//!
//! Both operations are wrapped by middleware (see [`pipeline`]).

use std::{
    fmt,
    future::Future,
    sync::{
        Arc, RwLock,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;

use crate::{
    aggregate::{Aggregate, CommandContext, Handle},
    clock::{self, Clock, SystemClock},
    idempotency::{IdempotencyLedger, InMemoryLedger},
    repository::Repository,
    store::EventStore,
};

pub mod command;
pub mod handler;
pub mod observer;
pub mod pipeline;
pub mod precondition;

pub use command::{CommandFailed, CommandResult, Schedulable, ScheduledCommand, TargetId};
pub use handler::{Enactor, FailureHandler, HandlerFactory};
pub use observer::{SchedulerObserver, TracingObserver};
pub use pipeline::{Middleware, Next, Pipeline};
pub use precondition::{
    DeliveryPrecondition, EventStoreResolver, PreconditionPolicy, PreconditionResolver,
};

use handler::HandlerTable;

/// Error returned by [`CommandScheduler::schedule`].
///
/// Only problems with the request itself are errors; delivery failures are
/// recorded on the command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulingError {
    #[error("invalid delivery precondition: {reason}")]
    InvalidPrecondition { reason: &'static str },
    #[error("scheduling rejected: {0}")]
    Rejected(String),
}

/// Delay between delivery attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Fixed { delay: Duration },
    /// `base * 2^(attempt - 1)`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Fixed {
            delay: Duration::from_secs(1),
        }
    }
}

impl Backoff {
    /// Delay after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            Self::Fixed { delay } => delay,
            Self::Exponential { base, max } => {
                let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

/// When failed deliveries are retried automatically.
///
/// Failure handlers can always request a retry explicitly; this policy only
/// covers failures nobody decided about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total delivery attempts, counting the first. `1` disables automatic
    /// retry.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub const fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Delay before retrying after `attempt` failed, or `None` once the
    /// attempts are used up.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        (attempt < self.max_attempts).then(|| self.backoff.delay_for(attempt))
    }
}

/// Scheduler configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub retry: RetryPolicy,
    pub precondition: PreconditionPolicy,
}

impl SchedulerConfig {
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub const fn with_precondition(mut self, precondition: PreconditionPolicy) -> Self {
        self.precondition = precondition;
        self
    }
}

/// What `schedule` and its middleware produce.
pub type ScheduleOutcome<Id, C> = Result<ScheduledCommand<Id, C>, SchedulingError>;

/// Future returned by `schedule` and its middleware.
pub type ScheduleFuture<Id, C> = BoxFuture<'static, ScheduleOutcome<Id, C>>;

/// Future returned by `deliver` and its middleware.
pub type DeliverFuture<Id, C> = BoxFuture<'static, ScheduledCommand<Id, C>>;

/// Continuation handed to `schedule` middleware.
pub type ScheduleNext<Id, C> = Next<ScheduledCommand<Id, C>, ScheduleOutcome<Id, C>>;

/// Continuation handed to `deliver` middleware.
pub type DeliverNext<Id, C> = Next<ScheduledCommand<Id, C>, ScheduledCommand<Id, C>>;

struct Inner<Id, C> {
    target_kind: String,
    clock: Arc<dyn Clock>,
    ledger: Arc<dyn IdempotencyLedger>,
    resolver: Option<Arc<dyn PreconditionResolver<Id>>>,
    config: SchedulerConfig,
    handlers: HandlerTable<Id, C>,
    schedule_pipeline: Pipeline<ScheduledCommand<Id, C>, ScheduleOutcome<Id, C>>,
    deliver_pipeline: Pipeline<ScheduledCommand<Id, C>, ScheduledCommand<Id, C>>,
    observers: RwLock<Vec<Arc<dyn SchedulerObserver<Id, C>>>>,
    // deliveries started through the clock that have not finished
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Schedules and delivers commands for one target kind.
///
/// Cheap to clone; clones share registrations, ledger and clock.
pub struct CommandScheduler<Id, C> {
    inner: Arc<Inner<Id, C>>,
}

impl<Id, C> Clone for CommandScheduler<Id, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Id, C> fmt::Debug for CommandScheduler<Id, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandScheduler")
            .field("target_kind", &self.inner.target_kind)
            .field("config", &self.inner.config)
            .field("in_flight", &self.inner.in_flight.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Builder for [`CommandScheduler`].
pub struct SchedulerBuilder<Id, C> {
    target_kind: String,
    clock: Arc<dyn Clock>,
    ledger: Arc<dyn IdempotencyLedger>,
    resolver: Option<Arc<dyn PreconditionResolver<Id>>>,
    config: SchedulerConfig,
    observers: Vec<Arc<dyn SchedulerObserver<Id, C>>>,
    fallback: Option<Enactor<Id, C>>,
}

impl<Id: TargetId, C: Schedulable> SchedulerBuilder<Id, C> {
    fn new(target_kind: String) -> Self {
        Self {
            target_kind,
            clock: Arc::new(SystemClock),
            ledger: Arc::new(InMemoryLedger::default()),
            resolver: None,
            config: SchedulerConfig::default(),
            observers: vec![Arc::new(TracingObserver)],
            fallback: None,
        }
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn ledger(mut self, ledger: Arc<dyn IdempotencyLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    #[must_use]
    pub fn resolver(mut self, resolver: Arc<dyn PreconditionResolver<Id>>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    #[must_use]
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn SchedulerObserver<Id, C>>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Drop the default [`TracingObserver`] and any observers added so far.
    #[must_use]
    pub fn without_observers(mut self) -> Self {
        self.observers.clear();
        self
    }

    #[must_use]
    pub fn build(self) -> CommandScheduler<Id, C> {
        let handlers = HandlerTable::default();
        if let Some(fallback) = self.fallback {
            handlers.set_fallback(fallback);
        }
        CommandScheduler {
            inner: Arc::new(Inner {
                target_kind: self.target_kind,
                clock: self.clock,
                ledger: self.ledger,
                resolver: self.resolver,
                config: self.config,
                handlers,
                schedule_pipeline: Pipeline::default(),
                deliver_pipeline: Pipeline::default(),
                observers: RwLock::new(self.observers),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }
}

impl<Id: TargetId, C: Schedulable> CommandScheduler<Id, C> {
    pub fn builder(target_kind: impl Into<String>) -> SchedulerBuilder<Id, C> {
        SchedulerBuilder::new(target_kind.into())
    }

    /// Builder for a scheduler whose targets are aggregates of type `A`.
    ///
    /// Every command kind falls back to loading (or creating) the aggregate,
    /// applying the command with `context`, and saving. Preconditions are
    /// resolved against the repository's event store.
    pub fn for_aggregate<A, S>(
        repository: Arc<Repository<S>>,
        context: CommandContext,
    ) -> SchedulerBuilder<Id, C>
    where
        A: Aggregate<Id = Id> + Handle<C> + Send + Sync + 'static,
        A::Error: Send + Sync + 'static,
        S: EventStore<Id = Id> + Clone + 'static,
    {
        let resolver = Arc::new(EventStoreResolver::new(repository.event_store().clone()));
        let enactor: Enactor<Id, C> = Arc::new(
            move |scheduled: ScheduledCommand<Id, C>| -> BoxFuture<'static, anyhow::Result<()>> {
                let repository = Arc::clone(&repository);
                let context = context.clone();
                Box::pin(async move {
                    repository
                        .apply::<A, C>(&scheduled.target_id, &scheduled.command, &context)
                        .await?;
                    Ok(())
                })
            },
        );
        let mut builder = SchedulerBuilder::new(A::KIND.to_string()).resolver(resolver);
        builder.fallback = Some(enactor);
        builder
    }

    pub fn target_kind(&self) -> &str {
        &self.inner.target_kind
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.inner.clock)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Enact commands of `kind` with `handler`.
    pub fn register_handler<F, Fut>(&self, kind: impl Into<String>, handler: F)
    where
        F: Fn(ScheduledCommand<Id, C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner.handlers.register(kind, boxed_enactor(handler));
    }

    /// Enact every command kind without an explicit handler.
    pub fn set_fallback_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(ScheduledCommand<Id, C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner.handlers.set_fallback(boxed_enactor(handler));
    }

    /// Build handlers on demand for kinds with neither an explicit handler
    /// nor a fallback. Built handlers are kept.
    pub fn set_handler_factory<F>(&self, factory: F)
    where
        F: Fn(&str) -> Option<Enactor<Id, C>> + Send + Sync + 'static,
    {
        self.inner.handlers.set_factory(Arc::new(factory));
    }

    /// Run `handler` whenever delivering a command of `kind` fails.
    pub fn on_failure<F, Fut>(&self, kind: impl Into<String>, handler: F)
    where
        F: Fn(ScheduledCommand<Id, C>, CommandFailed) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<CommandFailed>> + Send + 'static,
    {
        let handler: FailureHandler<Id, C> = Arc::new(
            move |scheduled: ScheduledCommand<Id, C>,
                  failed: CommandFailed|
                  -> BoxFuture<'static, anyhow::Result<CommandFailed>> {
                Box::pin(handler(scheduled, failed))
            },
        );
        self.inner.handlers.on_failure(kind, handler);
    }

    /// Wrap `schedule`. The most recently registered middleware runs first.
    pub fn register_schedule_middleware<F>(&self, middleware: F)
    where
        F: Fn(ScheduledCommand<Id, C>, ScheduleNext<Id, C>) -> ScheduleFuture<Id, C>
            + Send
            + Sync
            + 'static,
    {
        self.inner.schedule_pipeline.register(Arc::new(middleware));
    }

    /// Wrap `deliver`. The most recently registered middleware runs first.
    pub fn register_deliver_middleware<F>(&self, middleware: F)
    where
        F: Fn(ScheduledCommand<Id, C>, DeliverNext<Id, C>) -> DeliverFuture<Id, C>
            + Send
            + Sync
            + 'static,
    {
        self.inner.deliver_pipeline.register(Arc::new(middleware));
    }

    pub fn add_observer(&self, observer: Arc<dyn SchedulerObserver<Id, C>>) {
        self.inner
            .observers
            .write()
            .expect("scheduler observers lock poisoned")
            .push(observer);
    }

    /// Accept a command for delivery.
    ///
    /// A command with no due time, or one not later than the clock's `now`,
    /// is delivered before this returns unless its precondition is not yet
    /// satisfied. Later commands are delivered when the clock reaches their
    /// due time.
    ///
    /// The returned command carries the result known when `schedule`
    /// finished: `Deduplicated`, `Scheduled` (deferred), or the delivery
    /// outcome.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulingError::InvalidPrecondition`] for a malformed
    /// precondition, or whatever error a middleware layer reports.
    pub fn schedule(&self, command: ScheduledCommand<Id, C>) -> ScheduleFuture<Id, C> {
        let inner = Arc::clone(&self.inner);
        let terminal: ScheduleNext<Id, C> =
            Box::new(move |command: ScheduledCommand<Id, C>| -> ScheduleFuture<Id, C> {
                Box::pin(schedule_core(inner, command))
            });
        self.inner.schedule_pipeline.resolve(terminal)(command)
    }

    /// Deliver a command now, bypassing deduplication and due time.
    pub fn deliver(&self, command: ScheduledCommand<Id, C>) -> DeliverFuture<Id, C> {
        deliver_boxed(Arc::clone(&self.inner), command)
    }

    /// Wait until nothing due at or before the clock's `now` is pending and
    /// no delivery started through the clock is still running.
    pub async fn wait_until_idle(&self) {
        loop {
            self.inner.clock.run_due().await;
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

fn boxed_enactor<Id, C, F, Fut>(handler: F) -> Enactor<Id, C>
where
    Id: 'static,
    C: 'static,
    F: Fn(ScheduledCommand<Id, C>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |scheduled: ScheduledCommand<Id, C>| -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(handler(scheduled))
    })
}

impl<Id, C> Inner<Id, C> {
    fn observers(&self) -> Vec<Arc<dyn SchedulerObserver<Id, C>>> {
        self.observers
            .read()
            .expect("scheduler observers lock poisoned")
            .clone()
    }

    fn notify(&self, hook: impl Fn(&dyn SchedulerObserver<Id, C>)) {
        for observer in self.observers() {
            hook(observer.as_ref());
        }
    }
}

async fn schedule_core<Id: TargetId, C: Schedulable>(
    inner: Arc<Inner<Id, C>>,
    mut scheduled: ScheduledCommand<Id, C>,
) -> ScheduleOutcome<Id, C> {
    inner.notify(|o| o.on_scheduling(&scheduled));

    if let Some(precondition) = &scheduled.precondition {
        precondition.validate()?;
    }

    let token = scheduled.command.etag();
    if !token.is_empty() {
        let scope = format!("{}/{}", inner.target_kind, scheduled.target_id);
        if !inner.ledger.try_record(&scope, token) {
            scheduled.set_result(CommandResult::Deduplicated);
            inner.notify(|o| o.on_scheduled(&scheduled));
            return Ok(scheduled);
        }
    }

    scheduled.set_result(CommandResult::Scheduled);
    inner.notify(|o| o.on_scheduled(&scheduled));

    let now = inner.clock.now();
    if let Some(due) = scheduled.due_time
        && due > now
    {
        defer(&inner, scheduled.clone(), due);
        return Ok(scheduled);
    }

    if let (Some(precondition), Some(resolver)) = (&scheduled.precondition, &inner.resolver) {
        // An unresolved precondition would block the caller; wait for it
        // off the caller's path instead.
        let satisfied = match resolver.is_satisfied(precondition).await {
            Ok(satisfied) => satisfied,
            Err(err) => {
                tracing::warn!(
                    %precondition,
                    error = %err,
                    "precondition lookup failed, deferring delivery"
                );
                false
            }
        };
        if !satisfied {
            tracing::debug!(%precondition, "precondition pending, deferring delivery");
            defer(&inner, scheduled.clone(), now);
            return Ok(scheduled);
        }
    }

    Ok(deliver_boxed(inner, scheduled).await)
}

/// Register delivery of `scheduled` with the clock at `due`.
fn defer<Id: TargetId, C: Schedulable>(
    inner: &Arc<Inner<Id, C>>,
    scheduled: ScheduledCommand<Id, C>,
    due: DateTime<Utc>,
) {
    // Work already due counts as in flight from now, so a quiescence wait
    // cannot slip in before a spawned task starts it.
    let counted = due <= inner.clock.now();
    if counted {
        inner.in_flight.fetch_add(1, Ordering::SeqCst);
    }
    tracing::trace!(%due, target_id = %scheduled.target_id, "delivery deferred");
    let for_action = Arc::clone(inner);
    inner.clock.schedule(
        due,
        Box::new(move || -> BoxFuture<'static, ()> {
            Box::pin(async move {
                if !counted {
                    for_action.in_flight.fetch_add(1, Ordering::SeqCst);
                }
                deliver_boxed(Arc::clone(&for_action), scheduled).await;
                if for_action.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                    for_action.idle.notify_waiters();
                }
            })
        }),
    );
}

fn deliver_boxed<Id: TargetId, C: Schedulable>(
    inner: Arc<Inner<Id, C>>,
    scheduled: ScheduledCommand<Id, C>,
) -> DeliverFuture<Id, C> {
    let terminal_inner = Arc::clone(&inner);
    let terminal: DeliverNext<Id, C> =
        Box::new(move |scheduled: ScheduledCommand<Id, C>| -> DeliverFuture<Id, C> {
            Box::pin(deliver_core(terminal_inner, scheduled))
        });
    inner.deliver_pipeline.resolve(terminal)(scheduled)
}

async fn enact<Id: TargetId, C: Schedulable>(
    inner: &Inner<Id, C>,
    scheduled: &ScheduledCommand<Id, C>,
) -> anyhow::Result<()> {
    if let Some(precondition) = &scheduled.precondition {
        let Some(resolver) = &inner.resolver else {
            anyhow::bail!("no precondition resolver configured for {}", inner.target_kind);
        };
        let satisfied =
            precondition::wait_for(resolver.as_ref(), precondition, &inner.config.precondition)
                .await?;
        if !satisfied {
            anyhow::bail!("precondition not satisfied: {precondition}");
        }
    }

    let kind = scheduled.command.kind();
    let enactor = inner.handlers.lookup(kind).ok_or_else(|| {
        anyhow::anyhow!("no handler registered for `{kind}` on {}", inner.target_kind)
    })?;
    clock::scope(Arc::clone(&inner.clock), enactor(scheduled.clone())).await
}

async fn deliver_core<Id: TargetId, C: Schedulable>(
    inner: Arc<Inner<Id, C>>,
    mut scheduled: ScheduledCommand<Id, C>,
) -> ScheduledCommand<Id, C> {
    inner.notify(|o| o.on_delivering(&scheduled));

    match enact(&inner, &scheduled).await {
        Ok(()) => {
            scheduled.set_result(CommandResult::Succeeded);
        }
        Err(err) => {
            let attempt = scheduled.number_of_previous_attempts + 1;
            let mut failed = CommandFailed::new(format!("{err:#}"), attempt);

            if let Some(handler) = inner.handlers.failure_handler(scheduled.command.kind()) {
                let handled = clock::scope(
                    Arc::clone(&inner.clock),
                    handler(scheduled.clone(), failed.clone()),
                )
                .await;
                match handled {
                    Ok(decided) => failed = decided,
                    Err(handler_err) => tracing::error!(
                        target_id = %scheduled.target_id,
                        command = scheduled.command.kind(),
                        error = %handler_err,
                        "failure handler failed"
                    ),
                }
            }

            let retry_in = if failed.is_canceled() {
                None
            } else {
                failed
                    .retry_requested()
                    .or_else(|| inner.config.retry.next_delay(attempt))
            };
            scheduled.set_result(CommandResult::Failed(failed));

            if let Some(delay) = retry_in {
                let due = clock::offset(inner.clock.now(), delay);
                let mut next = scheduled.clone();
                next.number_of_previous_attempts = attempt;
                next.due_time = Some(due);
                tracing::debug!(
                    target_id = %scheduled.target_id,
                    attempt,
                    %due,
                    "redelivery scheduled"
                );
                defer(&inner, next, due);
            }
        }
    }

    inner.notify(|o| o.on_delivered(&scheduled));
    scheduled
}
