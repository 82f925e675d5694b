#![doc = include_str!("../README.md")]

#[cfg(feature = "test-util")]
pub use eventide_core::test;
pub use eventide_core::{
    aggregate,
    aggregate::{
        Aggregate, Applied, Apply, CommandContext, CommandError, EventSourced, Handle,
    },
    auth,
    auth::{AllowAll, Authorizer, Principal},
    clock,
    clock::{Clock, SystemClock, VirtualClock},
    command,
    command::{Command, Etag, RuleViolation},
    concurrency::ConcurrencyConflict,
    event,
    event::{DomainEvent, EventEnvelope, EventKind},
    idempotency,
    repository,
    repository::{EventPublisher, Repository},
    reservation,
    reservation::{ReservationService, ReservedValue},
    sequence::EventSequence,
};

pub mod scheduler {
    pub use eventide_core::scheduler::{
        Backoff, CommandFailed, CommandResult, CommandScheduler, DeliverFuture, DeliverNext,
        DeliveryPrecondition, EventStoreResolver, PreconditionPolicy, PreconditionResolver,
        RetryPolicy, ScheduleFuture, ScheduleNext, ScheduleOutcome, ScheduledCommand,
        SchedulerBuilder, SchedulerConfig, SchedulerObserver, SchedulingError, TracingObserver,
    };

    // Building blocks for custom handler tables and pipelines.
    #[doc(hidden)]
    pub use eventide_core::scheduler::{Enactor, FailureHandler, HandlerFactory, Pipeline};
}

pub mod store {

    pub use eventide_core::store::{EventFilter, EventStore, NonEmpty, StoredEvent};

    // Re-export low-level append types for EventStore implementors only.
    // Most users should interact with the Repository API instead.
    #[doc(hidden)]
    pub use eventide_core::store::{AppendError, AppendOutcome, AppendResult};

    pub use eventide_core::store::inmemory;
}
