//! Core traits and types for the eventide event-sourcing and
//! command-scheduling library.
//!
//! - [`aggregate`] - Command-side primitives (`Aggregate`, `Apply`, `Handle`,
//!   `EventSourced`) and the command pipeline
//! - [`sequence`] - Ordered per-aggregate event history (`EventSequence`)
//! - [`repository`] - Loading, saving and historical reads (`Repository`)
//! - [`store`] - Event persistence abstraction (`EventStore`) and the
//!   in-memory store
//! - [`scheduler`] - Idempotent, retryable command scheduling with middleware
//!   and delivery preconditions
//! - [`clock`] - Pluggable time and the deterministic `VirtualClock`
//! - [`reservation`] - Compare-and-swap reservations of unique values
//! - [`idempotency`] - Token ledgers with a probabilistic pre-check
//! - [`command`], [`event`], [`auth`], [`concurrency`] - Shared vocabulary
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use eventide_core::{
//!     clock::VirtualClock, repository::Repository, reservation::ReservationService,
//!     store::inmemory,
//! };
//!
//! let store: inmemory::Store<String> = inmemory::Store::new();
//! let _repo = Repository::new(store);
//!
//! let reservations = ReservationService::new(Arc::new(VirtualClock::starting_now()));
//! assert!(reservations.reserve("alice", "usernames", "owner-1", None));
//! assert!(!reservations.reserve("alice", "usernames", "owner-2", None));
//! ```
//!
//! Most users should depend on the [`eventide`](https://docs.rs/eventide)
//! crate, which re-exports these types with a flatter API surface.

pub mod aggregate;
pub mod auth;
pub mod clock;
pub mod command;
pub mod concurrency;
pub mod event;
pub mod idempotency;
pub mod repository;
pub mod reservation;
pub mod scheduler;
pub mod sequence;
pub mod store;

// Test utilities module: public when feature enabled, internal for crate tests
#[cfg(feature = "test-util")]
pub mod test;

#[cfg(all(test, not(feature = "test-util")))]
pub(crate) mod test;
